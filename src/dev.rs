//! # Device and command model
//!
//! [`TcmurDevice`] is one logical unit presenting a block device: geometry,
//! the backend store instance, the transport callbacks, the in-flight
//! tracker, and (for blocking stores) the worker pool. [`TcmurCmd`] is one
//! SCSI CDB in flight; it owns its scatter/gather payload and sense buffer
//! and moves along the execution chain by value, so exactly one completion
//! can ever reach the transport.
//!
//! Devices are built with [`DeviceBuilder`] and torn down with
//! [`TcmurDevice::cleanup`], which joins the worker threads and expects the
//! tracker to be idle. An opened device can export a JSON run file
//! describing itself so external tooling can inspect live backstores.

use crate::aio::{AioTracker, CalloutFn, IoWorkQueue};
use crate::iovec::IoVec;
use crate::lock::LockState;
use crate::scsi::SENSE_BUFFER_LEN;
use crate::store::{CmdState, StoreCaps, TcmurStore};
use crate::{aio, TcmurError};
use derive_setters::Setters;
use log::{error, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Callbacks the transport provides to the core.
///
/// `complete` receives the command back together with its final SAM status;
/// the command's sense buffer is valid when the status is CHECK CONDITION.
/// `processing_complete` fires when the last in-flight command of a device
/// completes, so a ring-based transport can reap batched completions.
pub trait TcmurTransport: Send + Sync {
    fn complete(&self, dev: &TcmurDevice, cmd: Box<TcmurCmd>, status: u8);

    fn processing_complete(&self, _dev: &TcmurDevice) {}

    /// The device lost its exclusive lock (fenced by the cluster).
    fn lock_lost(&self, _dev: &TcmurDevice) {}

    /// The connection to the backing cluster was lost.
    fn conn_lost(&self, _dev: &TcmurDevice) {}
}

/// One SCSI command in flight.
pub struct TcmurCmd {
    cdb: Vec<u8>,
    iov: IoVec,
    sense: [u8; SENSE_BUFFER_LEN],
    pub(crate) state: CmdState,
    pub(crate) callout: Option<CalloutFn>,
}

impl TcmurCmd {
    /// Wrap a CDB and its data buffers into a command.
    pub fn new(cdb: Vec<u8>, iov: IoVec) -> Box<TcmurCmd> {
        Box::new(TcmurCmd {
            cdb,
            iov,
            sense: [0; SENSE_BUFFER_LEN],
            state: CmdState::Idle,
            callout: None,
        })
    }

    /// Internal command backing a multi-step operation; owns a scratch
    /// buffer of `len` bytes and has no CDB of its own.
    pub(crate) fn shadow(len: usize) -> Box<TcmurCmd> {
        let iov = if len == 0 {
            IoVec::default()
        } else {
            IoVec::alloc(len)
        };
        TcmurCmd::new(Vec::new(), iov)
    }

    pub fn cdb(&self) -> &[u8] {
        &self.cdb
    }

    pub fn iovec(&self) -> &IoVec {
        &self.iov
    }

    pub fn iovec_mut(&mut self) -> &mut IoVec {
        &mut self.iov
    }

    /// Sense data for the last CHECK CONDITION status.
    pub fn sense(&self) -> &[u8] {
        &self.sense
    }

    pub(crate) fn sense_mut(&mut self) -> &mut [u8] {
        &mut self.sense
    }

    /// Replace the scratch buffer (shadow commands only).
    pub(crate) fn reset_iovec(&mut self, iov: IoVec) {
        self.iov = iov;
    }

    /// Carry sense bytes over from a sub-command so status and sense agree
    /// on the command the transport sees.
    pub(crate) fn copy_sense_from(&mut self, other: &TcmurCmd) {
        self.sense.copy_from_slice(&other.sense);
    }

    /// Take the command apart, handing the payload buffers back.
    pub fn into_parts(self) -> (Vec<u8>, IoVec) {
        (self.cdb, self.iov)
    }
}

/// Immutable description of a device, exported as the JSON run file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// device name, also names the run file
    pub name: String,

    /// backend subtype from the configuration string ("rbd", "file", ...)
    pub subtype: String,

    /// the raw configuration string the device was opened with
    pub cfgstring: String,

    /// logical block size in bytes
    pub block_size: u32,

    /// device capacity in logical blocks
    pub num_lbas: u64,

    /// largest transfer accepted per command, in blocks
    pub max_xfer_len: u32,

    /// whether the backend runs with a volatile write cache
    pub write_cache_enabled: bool,

    /// worker threads serving a blocking store
    pub nr_workers: usize,
}

/// Parsed form of a `subtype/path[/opt=value[,opt=value]*]` config string.
///
/// The path part may itself contain `/` (pool/image for rbd-style
/// backends); only a trailing segment containing `=` is treated as the
/// option list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CfgString {
    pub subtype: String,
    pub path: String,
    pub options: Vec<(String, String)>,
}

impl CfgString {
    pub fn parse(cfg: &str) -> Result<CfgString, TcmurError> {
        let mut parts: Vec<&str> = cfg.split('/').collect();
        if parts.len() < 2 || parts[0].is_empty() {
            return Err(TcmurError::InvalidCfgString(cfg.to_string()));
        }
        let subtype = parts.remove(0).to_string();

        let mut options = Vec::new();
        if parts.last().map_or(false, |s| s.contains('=')) {
            let opts = parts.pop().unwrap();
            for opt in opts.split(',') {
                match opt.split_once('=') {
                    Some((k, v)) if !k.is_empty() => {
                        options.push((k.to_string(), v.to_string()))
                    }
                    _ => return Err(TcmurError::InvalidCfgString(cfg.to_string())),
                }
            }
        }

        let path = parts.join("/");
        if path.is_empty() {
            return Err(TcmurError::InvalidCfgString(cfg.to_string()));
        }

        Ok(CfgString {
            subtype,
            path,
            options,
        })
    }

    /// Value of a named option, if present.
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Builder for [`TcmurDevice`].
///
/// ```no_run
/// use libtcmur::DeviceBuilder;
/// # fn open(store: Box<dyn libtcmur::TcmurStore>,
/// #         transport: std::sync::Arc<dyn libtcmur::TcmurTransport>)
/// #         -> Result<(), libtcmur::TcmurError> {
/// let dev = DeviceBuilder::default()
///     .name("lun0")
///     .cfgstring("file//var/lib/imgs/lun0.img")
///     .block_size(512)
///     .num_lbas(2u64 << 20)
///     .build(store, transport)?;
/// # Ok(())
/// # }
/// ```
#[derive(Setters, Debug, Clone)]
pub struct DeviceBuilder {
    /// device name; also names the exported run file
    #[setters(into)]
    name: String,

    /// backend configuration string, `subtype/path[/opt=value,...]`;
    /// empty skips parsing
    #[setters(into)]
    cfgstring: String,

    /// logical block size in bytes
    block_size: u32,

    /// device capacity in logical blocks
    num_lbas: u64,

    /// largest transfer accepted per command, in blocks
    max_xfer_len: u32,

    /// whether the backend runs with a volatile write cache
    write_cache_enabled: bool,

    /// worker threads for a blocking store (ignored for AIO stores)
    nr_workers: usize,

    /// directory for the JSON run file; `None` disables the export
    #[setters(strip_option, into)]
    run_dir: Option<PathBuf>,
}

impl Default for DeviceBuilder {
    fn default() -> Self {
        DeviceBuilder {
            name: "none".to_string(),
            cfgstring: String::new(),
            block_size: 512,
            num_lbas: 0,
            max_xfer_len: 1024,
            write_cache_enabled: false,
            nr_workers: 1,
            run_dir: None,
        }
    }
}

impl DeviceBuilder {
    /// Open the device: validates geometry, opens the store, and spawns the
    /// worker pool when the store cannot complete asynchronously.
    pub fn build(
        self,
        store: Box<dyn TcmurStore>,
        transport: Arc<dyn TcmurTransport>,
    ) -> Result<Arc<TcmurDevice>, TcmurError> {
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(TcmurError::InvalidParam("block_size"));
        }
        if self.num_lbas == 0 {
            return Err(TcmurError::InvalidParam("num_lbas"));
        }
        if self.max_xfer_len == 0 {
            return Err(TcmurError::InvalidParam("max_xfer_len"));
        }

        let subtype = if self.cfgstring.is_empty() {
            String::new()
        } else {
            CfgString::parse(&self.cfgstring)?.subtype
        };

        let info = DeviceInfo {
            name: self.name,
            subtype,
            cfgstring: self.cfgstring,
            block_size: self.block_size,
            num_lbas: self.num_lbas,
            max_xfer_len: self.max_xfer_len,
            write_cache_enabled: self.write_cache_enabled,
            nr_workers: self.nr_workers.max(1),
        };

        store.open(&info)?;

        let aio_supported = store.caps().contains(StoreCaps::AIO);
        let dev = Arc::new(TcmurDevice {
            info,
            store,
            transport,
            track: AioTracker::new(),
            work_queue: if aio_supported {
                None
            } else {
                Some(IoWorkQueue::new())
            },
            lock_state: Mutex::new(LockState::Unlocked),
            run_dir: self.run_dir,
        });

        if !aio_supported {
            if let Err(e) = aio::setup_io_work_queue(&dev, dev.info.nr_workers) {
                // stop any workers that did start before failing the open
                aio::cleanup_io_work_queue(&dev);
                dev.store.close(&dev.info);
                return Err(e);
            }
        }

        if let Err(e) = dev.flush_json() {
            warn!("dev {}: could not export run file: {}", dev.info.name, e);
        }

        Ok(dev)
    }
}

/// A logical unit presenting a block device.
pub struct TcmurDevice {
    info: DeviceInfo,
    store: Box<dyn TcmurStore>,
    transport: Arc<dyn TcmurTransport>,
    track: AioTracker,
    work_queue: Option<IoWorkQueue>,
    lock_state: Mutex<LockState>,
    run_dir: Option<PathBuf>,
}

impl TcmurDevice {
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    #[inline(always)]
    pub fn block_size(&self) -> u32 {
        self.info.block_size
    }

    #[inline(always)]
    pub fn num_lbas(&self) -> u64 {
        self.info.num_lbas
    }

    #[inline(always)]
    pub fn max_xfer_len(&self) -> u32 {
        self.info.max_xfer_len
    }

    pub fn write_cache_enabled(&self) -> bool {
        self.info.write_cache_enabled
    }

    pub fn store(&self) -> &dyn TcmurStore {
        self.store.as_ref()
    }

    pub(crate) fn transport(&self) -> &dyn TcmurTransport {
        self.transport.as_ref()
    }

    pub(crate) fn tracker(&self) -> &AioTracker {
        &self.track
    }

    pub(crate) fn work_queue(&self) -> Option<&IoWorkQueue> {
        self.work_queue.as_ref()
    }

    /// Commands currently tracked on this device.
    pub fn in_flight(&self) -> u32 {
        self.track.in_flight()
    }

    pub fn lock_state(&self) -> LockState {
        *self.lock_state.lock().unwrap()
    }

    /// Move to `new`, reporting whether the state actually changed.
    pub(crate) fn transition_lock_state(&self, new: LockState) -> bool {
        let mut state = self.lock_state.lock().unwrap();
        if *state == new {
            return false;
        }
        *state = new;
        true
    }

    /// Device description as a JSON value.
    pub fn json(&self) -> serde_json::Value {
        serde_json::json!({ "device": &self.info })
    }

    /// Path of the exported run file, when export is enabled.
    pub fn run_path(&self) -> Option<PathBuf> {
        self.run_dir
            .as_ref()
            .map(|d| d.join(format!("{}.json", self.info.name)))
    }

    /// Write the run file describing this device.
    pub fn flush_json(&self) -> Result<(), TcmurError> {
        let Some(path) = self.run_path() else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, self.json().to_string())?;
        Ok(())
    }

    /// Read a previously exported run file back.
    pub fn reload_json(path: &Path) -> Result<DeviceInfo, TcmurError> {
        let data = std::fs::read_to_string(path)?;
        let val: serde_json::Value = serde_json::from_str(&data)?;
        Ok(serde_json::from_value(val["device"].clone())?)
    }

    /// Tear the device down.
    ///
    /// Must only be called once the transport has stopped delivering
    /// commands and all in-flight commands have completed; worker threads
    /// are joined and the store is closed.
    pub fn cleanup(&self) {
        aio::cleanup_io_work_queue(self);

        let inflight = self.track.in_flight();
        if inflight != 0 {
            error!(
                "dev {}: cleanup with {} commands still in flight",
                self.info.name, inflight
            );
            debug_assert_eq!(inflight, 0);
        }

        self.store.close(&self.info);

        if let Some(path) = self.run_path() {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!("dev {}: could not remove run file: {}", self.info.name, e);
                }
            }
        }
    }
}
