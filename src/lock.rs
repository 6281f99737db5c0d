//! # Exclusive-lock coordination
//!
//! Clustered stores enforce single-writer semantics with an exclusive lock
//! on the backing image. [`try_lock`] drives the acquisition protocol over
//! the store's [`ExclusiveLockOps`]: check ownership, break a stale owner's
//! lock if needed, then acquire, retrying up to five times with a one
//! second pause. Losing the lock mid-flight surfaces as `ESHUTDOWN` from
//! the store (the cluster fenced this client) and flips the device into a
//! state where host I/O fails with NOT READY until the lock is re-acquired;
//! a cluster operation timeout (`ETIMEDOUT`) marks the connection lost and
//! fails I/O with BUSY.

use crate::dev::{TcmurCmd, TcmurDevice};
use crate::scsi::{self, XferDir};
use log::{debug, error, warn};
use std::sync::Arc;
use std::time::Duration;

/// Lock state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Owned,
    Lost,
    NotConn,
}

/// Result of a lock request, reported back to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockResult {
    Success,
    Failed,
    NotConn,
}

/// Mode of an existing lock as reported by the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Exclusive,
    Shared,
}

/// Cluster lock primitives a store provides when it advertises
/// [`crate::store::StoreCaps::LOCK`].
///
/// Errors are OS errno values: `ESHUTDOWN` means this client has been
/// fenced, `ETIMEDOUT` that the cluster op timer expired; anything else is
/// treated as a miscellaneous hard or retryable failure per operation.
pub trait ExclusiveLockOps: Send + Sync {
    /// Whether this client currently owns the lock.
    fn has_lock(&self) -> Result<bool, i32>;

    /// Current lock mode and owner list; `Err(ENOENT)` or an empty list
    /// means the lock is free.
    fn lock_owners(&self) -> Result<(LockMode, Vec<String>), i32>;

    /// Break the lock held by `owner`.
    fn break_lock(&self, owner: &str) -> Result<(), i32>;

    /// Acquire the lock in exclusive mode.
    fn acquire_exclusive(&self) -> Result<(), i32>;
}

const LOCK_ATTEMPTS: u32 = 5;
const LOCK_RETRY_PAUSE: Duration = Duration::from_secs(1);

/// Break the current owner's lock if there is one.
///
/// `orig_owner` pins the victim across retries: once a break attempt
/// failed against some owner, a later attempt seeing a different owner
/// means another client raced in and the acquisition must abort.
fn try_break_lock(
    dev: &TcmurDevice,
    ops: &dyn ExclusiveLockOps,
    orig_owner: &mut Option<String>,
) -> Result<(), i32> {
    let (mode, owners) = match ops.lock_owners() {
        Err(e) if e == libc::ENOENT => return Ok(()),
        Err(e) => {
            error!("dev {}: could not get lock owners (errno {})", dev.name(), e);
            if e == libc::ETIMEDOUT {
                return Err(e);
            }
            return Err(libc::EAGAIN);
        }
        Ok(r) => r,
    };
    if owners.is_empty() {
        return Ok(());
    }

    if mode != LockMode::Exclusive {
        error!("dev {}: invalid lock mode {:?} found", dev.name(), mode);
        return Err(libc::EIO);
    }

    let owner = &owners[0];
    if let Some(orig) = orig_owner.as_deref() {
        if orig != owner {
            // someone took the lock while we were retrying
            return Err(libc::EIO);
        }
    }

    debug!("dev {}: attempting to break lock from {}", dev.name(), owner);
    match ops.break_lock(owner) {
        Ok(()) => Ok(()),
        Err(e) => {
            error!(
                "dev {}: could not break lock from {} (errno {})",
                dev.name(),
                owner,
                e
            );
            if e == libc::ETIMEDOUT {
                return Err(e);
            }
            if orig_owner.is_none() {
                *orig_owner = Some(owner.clone());
            }
            Err(libc::EAGAIN)
        }
    }
}

/// Acquire the single-writer exclusive lock for a device.
///
/// Runs the check / break / acquire sequence up to five times with a one
/// second pause between attempts. On success the device is marked `Owned`,
/// which also re-opens dispatch after an earlier lock loss. `ETIMEDOUT` and
/// `ESHUTDOWN` are terminal and reported as [`LockResult::NotConn`].
pub fn try_lock(dev: &Arc<TcmurDevice>) -> LockResult {
    let Some(ops) = dev.store().lock_ops() else {
        warn!("dev {}: store has no lock support", dev.name());
        return LockResult::Failed;
    };

    let mut orig_owner: Option<String> = None;
    let mut ret = 0i32;

    for _ in 0..LOCK_ATTEMPTS {
        match ops.has_lock() {
            Ok(true) => {
                ret = 0;
                break;
            }
            Ok(false) => {}
            Err(e) if e == libc::ETIMEDOUT || e == libc::ESHUTDOWN => {
                ret = e;
                break;
            }
            Err(e) => {
                ret = e;
                std::thread::sleep(LOCK_RETRY_PAUSE);
                continue;
            }
        }

        match try_break_lock(dev, ops, &mut orig_owner) {
            Ok(()) => {}
            Err(e) if e == libc::EIO || e == libc::ETIMEDOUT => {
                ret = e;
                break;
            }
            Err(_) => {
                ret = libc::EAGAIN;
                std::thread::sleep(LOCK_RETRY_PAUSE);
                continue;
            }
        }

        match ops.acquire_exclusive() {
            Ok(()) => {
                warn!("dev {}: acquired exclusive lock", dev.name());
                ret = 0;
                break;
            }
            Err(e) if e == libc::ETIMEDOUT => {
                ret = e;
                break;
            }
            Err(e) => {
                error!(
                    "dev {}: unknown error {} while trying to acquire lock",
                    dev.name(),
                    e
                );
                ret = e;
            }
        }
    }

    if ret == libc::ETIMEDOUT || ret == libc::ESHUTDOWN {
        LockResult::NotConn
    } else if ret != 0 {
        LockResult::Failed
    } else {
        dev.transition_lock_state(LockState::Owned);
        LockResult::Success
    }
}

/// Mark the device fenced: subsequent host I/O answers NOT READY (state
/// transition), driving initiator failover. The transport hook fires once
/// per transition.
pub fn notify_lock_lost(dev: &Arc<TcmurDevice>) {
    if dev.transition_lock_state(LockState::Lost) {
        warn!("dev {}: exclusive lock lost", dev.name());
        dev.transport().lock_lost(dev);
    }
}

/// Mark the cluster connection lost: subsequent host I/O answers BUSY.
pub fn notify_conn_lost(dev: &Arc<TcmurDevice>) {
    if dev.transition_lock_state(LockState::NotConn) {
        warn!("dev {}: cluster connection lost", dev.name());
        dev.transport().conn_lost(dev);
    }
}

/// Lock-aware errno mapping used on the completion path: fencing and
/// cluster timeouts flip the device state before the status is encoded.
pub(crate) fn errno_status(
    dev: &Arc<TcmurDevice>,
    cmd: &mut TcmurCmd,
    errno: i32,
    dir: XferDir,
) -> u8 {
    match errno {
        libc::ESHUTDOWN => notify_lock_lost(dev),
        libc::ETIMEDOUT => {
            error!("dev {}: timing out command", dev.name());
            notify_conn_lost(dev);
        }
        _ => {}
    }
    scsi::errno_to_sam_status(errno, cmd.sense_mut(), dir)
}
