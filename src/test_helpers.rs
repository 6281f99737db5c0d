#![cfg(test)]

//! Shared test utilities: an in-memory store, a recording transport, and
//! device construction helpers used by the module unit tests.

use crate::dev::{DeviceBuilder, TcmurCmd, TcmurDevice, TcmurTransport};
use crate::lock::{ExclusiveLockOps, LockMode};
use crate::store::{StoreCaps, TcmurStore};
use crate::{StoreRc, StoreTask, Submit};
use std::sync::{Arc, Mutex};

#[ctor::ctor]
fn init_logger() {
    let _ = env_logger::builder()
        .format_target(false)
        .format_timestamp(None)
        .is_test(true)
        .try_init();
}

/// Transport that records every completion.
#[derive(Default)]
pub(crate) struct RecordingTransport {
    pub completions: Mutex<Vec<(u8, Vec<u8>)>>,
    pub processing_complete: Mutex<u32>,
    pub lock_lost: Mutex<u32>,
    pub conn_lost: Mutex<u32>,
}

impl RecordingTransport {
    /// Block until `n` completions arrived (they come from worker or store
    /// threads).
    pub fn wait_completions(&self, n: usize) {
        for _ in 0..1000 {
            if self.completions.lock().unwrap().len() >= n {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        panic!("timed out waiting for {} completions", n);
    }
}

impl TcmurTransport for RecordingTransport {
    fn complete(&self, _dev: &TcmurDevice, cmd: Box<TcmurCmd>, status: u8) {
        self.completions
            .lock()
            .unwrap()
            .push((status, cmd.sense().to_vec()));
    }

    fn processing_complete(&self, _dev: &TcmurDevice) {
        *self.processing_complete.lock().unwrap() += 1;
    }

    fn lock_lost(&self, _dev: &TcmurDevice) {
        *self.lock_lost.lock().unwrap() += 1;
    }

    fn conn_lost(&self, _dev: &TcmurDevice) {
        *self.conn_lost.lock().unwrap() += 1;
    }
}

/// Scripted lock backend: a list of canned results per operation.
#[derive(Default)]
pub(crate) struct ScriptedLock {
    pub has_lock: Mutex<Vec<Result<bool, i32>>>,
    pub owners: Mutex<Vec<Result<(LockMode, Vec<String>), i32>>>,
    pub breaks: Mutex<Vec<Result<(), i32>>>,
    pub acquires: Mutex<Vec<Result<(), i32>>>,
}

fn pop_or<T: Clone>(queue: &Mutex<Vec<T>>, default: T) -> T {
    let mut q = queue.lock().unwrap();
    if q.is_empty() {
        default
    } else {
        q.remove(0)
    }
}

impl ExclusiveLockOps for ScriptedLock {
    fn has_lock(&self) -> Result<bool, i32> {
        pop_or(&self.has_lock, Ok(false))
    }

    fn lock_owners(&self) -> Result<(LockMode, Vec<String>), i32> {
        pop_or(&self.owners, Err(libc::ENOENT))
    }

    fn break_lock(&self, _owner: &str) -> Result<(), i32> {
        pop_or(&self.breaks, Ok(()))
    }

    fn acquire_exclusive(&self) -> Result<(), i32> {
        pop_or(&self.acquires, Ok(()))
    }
}

/// Blocking in-memory store backed by a flat byte vector, with optional
/// fault injection.
pub(crate) struct MemStore {
    pub caps: StoreCaps,
    pub data: Mutex<Vec<u8>>,
    /// errno injected into the next read completions
    pub fail_reads: Mutex<Vec<i32>>,
    pub lock: Option<ScriptedLock>,
}

impl MemStore {
    pub fn new(size: usize, caps: StoreCaps) -> MemStore {
        MemStore {
            caps,
            data: Mutex::new(vec![0u8; size]),
            fail_reads: Mutex::new(Vec::new()),
            lock: None,
        }
    }
}

impl TcmurStore for MemStore {
    fn caps(&self) -> StoreCaps {
        self.caps
    }

    fn read(&self, mut task: StoreTask) -> Submit {
        if let Some(errno) = {
            let mut f = self.fail_reads.lock().unwrap();
            if f.is_empty() {
                None
            } else {
                Some(f.remove(0))
            }
        } {
            task.complete(StoreRc::Err(errno));
            return Submit::Started;
        }
        let off = task.offset() as usize;
        let len = task.requested();
        let data = self.data.lock().unwrap();
        let n = task.iovec_mut().copy_from(&data[off..off + len]);
        drop(data);
        task.complete(StoreRc::Bytes(n));
        Submit::Started
    }

    fn write(&self, task: StoreTask) -> Submit {
        let off = task.offset() as usize;
        let len = task.requested();
        let mut buf = vec![0u8; len];
        let n = task.iovec().copy_to(&mut buf);
        self.data.lock().unwrap()[off..off + len].copy_from_slice(&buf);
        task.complete(StoreRc::Bytes(n));
        Submit::Started
    }

    fn flush(&self, task: StoreTask) -> Submit {
        task.complete(StoreRc::Ok);
        Submit::Started
    }

    fn lock_ops(&self) -> Option<&dyn ExclusiveLockOps> {
        self.lock.as_ref().map(|l| l as &dyn ExclusiveLockOps)
    }
}

/// Build a small device over `store` with a recording transport.
pub(crate) fn make_dev(
    store: MemStore,
) -> (Arc<TcmurDevice>, Arc<RecordingTransport>) {
    let transport = Arc::new(RecordingTransport::default());
    let dev = DeviceBuilder::default()
        .name("test")
        .block_size(512u32)
        .num_lbas(128u64)
        .max_xfer_len(64u32)
        .build(Box::new(store), transport.clone())
        .unwrap();
    (dev, transport)
}
