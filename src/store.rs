//! # Store dispatch and multi-step commands
//!
//! The backend adapter contract ([`TcmurStore`]) plus everything that turns
//! a decoded CDB into store operations: the primitive read/write/flush
//! wrappers, command passthrough, and the COMPARE AND WRITE / WRITE AND
//! VERIFY state machines chained over the primitives.
//!
//! Ownership of the command travels with each pending leg: a multi-step
//! operation parks the original command inside the shadow command's state
//! slot (and vice versa) across the async hop, so exactly one of the legs
//! can complete the command at any time.

use crate::aio::{
    async_call, command_finish, command_finish_local, command_start, CallStub, CmdOutcome,
    StoreOp, StoreRc, StoreTask, Submit, STATUS_NOT_HANDLED,
};
use crate::dev::{DeviceInfo, TcmurCmd, TcmurDevice};
use crate::lock::ExclusiveLockOps;
use crate::scsi::{self, asc, opcode, sam, sense_key};
use crate::TcmurError;
use bitflags::bitflags;
use log::{error, warn};
use std::mem;
use std::sync::Arc;

bitflags! {
    /// Optional capabilities a store advertises. Missing capabilities make
    /// the matching opcodes fail as unsupported.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StoreCaps: u32 {
        /// Data-path calls are non-blocking and complete from the store's
        /// own threads; no worker pool is created for the device.
        const AIO = 1 << 0;
        /// The store can flush its volatile cache.
        const FLUSH = 1 << 1;
        /// The store wants first pick of CDBs via `handle_cmd`.
        const HANDLE_CMD = 1 << 2;
        /// WRITE SAME offload is available through `handle_cmd`.
        const WRITE_SAME = 1 << 3;
        /// The store sits on a shared cluster and implements the
        /// exclusive-lock operations.
        const LOCK = 1 << 4;
    }
}

/// The contract a storage backend implements.
///
/// Data-path methods receive a [`StoreTask`] and either start it (completing
/// it inline or later from any thread) or hand it back via
/// [`Submit::Rejected`] with an errno, in which case the completion must not
/// have run. Without [`StoreCaps::AIO`] the calls arrive on a worker thread
/// and may block.
pub trait TcmurStore: Send + Sync {
    fn caps(&self) -> StoreCaps;

    /// Called while the device is being built, once geometry is known.
    fn open(&self, _info: &DeviceInfo) -> Result<(), TcmurError> {
        Ok(())
    }

    /// Called during device cleanup, after all I/O has drained.
    fn close(&self, _info: &DeviceInfo) {}

    /// Read `task.requested()` bytes at `task.offset()` into the task's
    /// I/O vector.
    fn read(&self, task: StoreTask) -> Submit;

    /// Write the task's I/O vector at `task.offset()`.
    fn write(&self, task: StoreTask) -> Submit;

    /// Flush the volatile cache. Only called when [`StoreCaps::FLUSH`] is
    /// advertised.
    fn flush(&self, task: StoreTask) -> Submit {
        Submit::Rejected(task, libc::EINVAL)
    }

    /// Opcode-specific fast path; complete with [`StoreRc::NotHandled`] to
    /// fall back to the generic handling. Only called when
    /// [`StoreCaps::HANDLE_CMD`] is advertised.
    fn handle_cmd(&self, task: StoreTask) -> Submit {
        task.complete(StoreRc::NotHandled);
        Submit::Started
    }

    /// Exclusive-lock operations for clustered stores advertising
    /// [`StoreCaps::LOCK`].
    fn lock_ops(&self) -> Option<&dyn ExclusiveLockOps> {
        None
    }
}

/// Per-command scratch state for the multi-step operations.
#[derive(Default)]
pub(crate) enum CmdState {
    #[default]
    Idle,
    /// On the original command while a write-and-verify is in flight.
    WriteVerify(WriteVerifyState),
    /// On the shadow read command during the verify leg; owns the original.
    WvRead { origcmd: Box<TcmurCmd> },
    /// On the shadow read command of a compare-and-write; owns the original.
    CawRead(CawState),
}

pub(crate) struct WriteVerifyState {
    off: u64,
    remaining: usize,
    requested: usize,
    readcmd: Option<Box<TcmurCmd>>,
}

pub(crate) struct CawState {
    off: u64,
    requested: usize,
    origcmd: Box<TcmurCmd>,
}

/// Turn the internal declined marker into the unsupported-opcode response.
fn resolve_not_handled(cmd: &mut TcmurCmd, status: u8) -> u8 {
    if status != STATUS_NOT_HANDLED {
        return status;
    }
    scsi::set_sense_data(
        cmd.sense_mut(),
        sense_key::ILLEGAL_REQUEST,
        asc::INVALID_FIELD_IN_CDB,
        None,
    )
}

/* primitive ops: read, write, flush */

fn store_finish_cbk(dev: &Arc<TcmurDevice>, cmd: Box<TcmurCmd>, status: u8) {
    command_finish(dev, cmd, status);
}

fn call_store_read(dev: &Arc<TcmurDevice>, cmd: Box<TcmurCmd>, off: u64) -> CmdOutcome {
    command_start(dev);
    let stub = CallStub {
        sop: StoreOp::Read { off },
        callout: store_finish_cbk,
    };
    match async_call(dev, cmd, stub) {
        CmdOutcome::Async => CmdOutcome::Async,
        CmdOutcome::Done(cmd, status) => {
            command_finish_local(dev);
            CmdOutcome::Done(cmd, status)
        }
    }
}

fn call_store_write(dev: &Arc<TcmurDevice>, cmd: Box<TcmurCmd>, off: u64) -> CmdOutcome {
    command_start(dev);
    let stub = CallStub {
        sop: StoreOp::Write { off },
        callout: store_finish_cbk,
    };
    match async_call(dev, cmd, stub) {
        CmdOutcome::Async => CmdOutcome::Async,
        CmdOutcome::Done(cmd, status) => {
            command_finish_local(dev);
            CmdOutcome::Done(cmd, status)
        }
    }
}

fn call_store_flush(dev: &Arc<TcmurDevice>, cmd: Box<TcmurCmd>) -> CmdOutcome {
    command_start(dev);
    let stub = CallStub {
        sop: StoreOp::Flush,
        callout: store_finish_cbk,
    };
    match async_call(dev, cmd, stub) {
        CmdOutcome::Async => CmdOutcome::Async,
        CmdOutcome::Done(cmd, status) => {
            command_finish_local(dev);
            CmdOutcome::Done(cmd, status)
        }
    }
}

/* compare and write */

fn caw_read_cbk(dev: &Arc<TcmurDevice>, mut readcmd: Box<TcmurCmd>, status: u8) {
    let CmdState::CawRead(state) = mem::take(&mut readcmd.state) else {
        error!("dev {}: compare-and-write completion without state", dev.name());
        debug_assert!(false, "compare-and-write completion without state");
        return;
    };
    let mut cmd = state.origcmd;

    // failed read - bail out
    if status != sam::GOOD {
        cmd.copy_sense_from(&readcmd);
        command_finish(dev, cmd, status);
        return;
    }

    // compare the pre-image with the first half of the payload
    if let Some(off) = cmd.iovec().compare_iov(readcmd.iovec(), state.requested) {
        let status = scsi::set_sense_data(
            cmd.sense_mut(),
            sense_key::MISCOMPARE,
            asc::MISCOMPARE_DURING_VERIFY,
            Some(off as u32),
        );
        command_finish(dev, cmd, status);
        return;
    }
    drop(readcmd);

    // compare passed - write the second half in place
    cmd.iovec_mut().seek(state.requested);
    let stub = CallStub {
        sop: StoreOp::Write { off: state.off },
        callout: store_finish_cbk,
    };
    match async_call(dev, cmd, stub) {
        CmdOutcome::Async => {}
        CmdOutcome::Done(cmd, status) => command_finish(dev, cmd, status),
    }
}

fn call_store_caw(dev: &Arc<TcmurDevice>, cmd: Box<TcmurCmd>, off: u64) -> CmdOutcome {
    let half = cmd.iovec().length() / 2;
    if half == 0 {
        // nothing to compare, nothing to write
        return CmdOutcome::Done(cmd, sam::GOOD);
    }

    let mut readcmd = TcmurCmd::shadow(half);
    readcmd.state = CmdState::CawRead(CawState {
        off,
        requested: half,
        origcmd: cmd,
    });

    command_start(dev);
    let stub = CallStub {
        sop: StoreOp::Read { off },
        callout: caw_read_cbk,
    };
    match async_call(dev, readcmd, stub) {
        CmdOutcome::Async => CmdOutcome::Async,
        CmdOutcome::Done(mut readcmd, status) => {
            command_finish_local(dev);
            let CmdState::CawRead(state) = mem::take(&mut readcmd.state) else {
                unreachable!("shadow command lost its state");
            };
            let mut cmd = state.origcmd;
            cmd.copy_sense_from(&readcmd);
            CmdOutcome::Done(cmd, status)
        }
    }
}

/* write and verify */

fn wv_read_cbk(dev: &Arc<TcmurDevice>, mut readcmd: Box<TcmurCmd>, status: u8) {
    let CmdState::WvRead { origcmd: mut cmd } = mem::take(&mut readcmd.state) else {
        error!("dev {}: verify completion without state", dev.name());
        debug_assert!(false, "verify completion without state");
        return;
    };

    // failed read - bail out
    if status != sam::GOOD {
        cmd.copy_sense_from(&readcmd);
        cmd.state = CmdState::Idle;
        command_finish(dev, cmd, status);
        return;
    }

    let (requested, batch_off, remaining) = match &cmd.state {
        CmdState::WriteVerify(st) => (st.requested, st.off, st.remaining),
        _ => {
            error!("dev {}: verify read without write state", dev.name());
            debug_assert!(false, "verify read without write state");
            return;
        }
    };

    // verify failed - bail out
    if let Some(off) = cmd.iovec().compare_iov(readcmd.iovec(), requested) {
        error!("dev {}: verify failed at offset {}", dev.name(), off);
        let status = scsi::set_sense_data(
            cmd.sense_mut(),
            sense_key::MISCOMPARE,
            asc::MISCOMPARE_DURING_VERIFY,
            Some(off as u32),
        );
        cmd.state = CmdState::Idle;
        command_finish(dev, cmd, status);
        return;
    }

    let remaining = remaining - requested;
    if remaining == 0 {
        cmd.state = CmdState::Idle;
        command_finish(dev, cmd, sam::GOOD);
        return;
    }

    // start the next batch; the scratch buffer is re-allocated per read
    cmd.iovec_mut().seek(requested);
    let next_off = batch_off + requested as u64;
    readcmd.reset_iovec(crate::iovec::IoVec::default());
    if let CmdState::WriteVerify(st) = &mut cmd.state {
        st.remaining = remaining;
        st.off = next_off;
        st.readcmd = Some(readcmd);
    }
    let stub = CallStub {
        sop: StoreOp::Write { off: next_off },
        callout: wv_write_cbk,
    };
    match async_call(dev, cmd, stub) {
        CmdOutcome::Async => {}
        CmdOutcome::Done(mut cmd, status) => {
            cmd.state = CmdState::Idle;
            command_finish(dev, cmd, status);
        }
    }
}

fn wv_write_cbk(dev: &Arc<TcmurDevice>, mut cmd: Box<TcmurCmd>, status: u8) {
    // write error - bail out
    if status != sam::GOOD {
        cmd.state = CmdState::Idle;
        command_finish(dev, cmd, status);
        return;
    }

    // read back what was just written
    let length = cmd.iovec().length();
    let (off, mut readcmd) = {
        let CmdState::WriteVerify(st) = &mut cmd.state else {
            error!("dev {}: verify write without state", dev.name());
            debug_assert!(false, "verify write without state");
            return;
        };
        st.requested = length;
        (st.off, st.readcmd.take().expect("verify read command missing"))
    };
    readcmd.reset_iovec(crate::iovec::IoVec::alloc(length));
    readcmd.state = CmdState::WvRead { origcmd: cmd };

    let stub = CallStub {
        sop: StoreOp::Read { off },
        callout: wv_read_cbk,
    };
    match async_call(dev, readcmd, stub) {
        CmdOutcome::Async => {}
        CmdOutcome::Done(mut readcmd, status) => {
            let CmdState::WvRead { origcmd: mut cmd } = mem::take(&mut readcmd.state) else {
                unreachable!("shadow command lost its state");
            };
            cmd.copy_sense_from(&readcmd);
            cmd.state = CmdState::Idle;
            command_finish(dev, cmd, status);
        }
    }
}

fn call_store_write_verify(dev: &Arc<TcmurDevice>, mut cmd: Box<TcmurCmd>, off: u64) -> CmdOutcome {
    let length = scsi::get_xfer_length(cmd.cdb()) as usize * dev.block_size() as usize;
    let readcmd = TcmurCmd::shadow(0);
    cmd.state = CmdState::WriteVerify(WriteVerifyState {
        off,
        remaining: length,
        requested: length,
        readcmd: Some(readcmd),
    });

    command_start(dev);
    let stub = CallStub {
        sop: StoreOp::Write { off },
        callout: wv_write_cbk,
    };
    match async_call(dev, cmd, stub) {
        CmdOutcome::Async => CmdOutcome::Async,
        CmdOutcome::Done(mut cmd, status) => {
            command_finish_local(dev);
            cmd.state = CmdState::Idle;
            CmdOutcome::Done(cmd, status)
        }
    }
}

/* command passthrough */

fn passthrough_cbk(dev: &Arc<TcmurDevice>, mut cmd: Box<TcmurCmd>, status: u8) {
    if status != STATUS_NOT_HANDLED {
        command_finish(dev, cmd, status);
        return;
    }

    // the store declined - fall back to the generic op for this opcode.
    // the decline may arrive in the submitting context (AIO stores) or on
    // a worker thread; both land here.
    match call_store_handler(dev, cmd) {
        CmdOutcome::Async => command_finish_local(dev),
        CmdOutcome::Done(mut cmd, status) => {
            let status = resolve_not_handled(&mut cmd, status);
            command_finish(dev, cmd, status);
        }
    }
}

fn command_passthrough(dev: &Arc<TcmurDevice>, cmd: Box<TcmurCmd>) -> CmdOutcome {
    command_start(dev);
    let stub = CallStub {
        sop: StoreOp::HandleCmd,
        callout: passthrough_cbk,
    };
    match async_call(dev, cmd, stub) {
        CmdOutcome::Async => CmdOutcome::Async,
        CmdOutcome::Done(cmd, status) => {
            command_finish_local(dev);
            CmdOutcome::Done(cmd, status)
        }
    }
}

/* opcode dispatch */

fn call_store_handler(dev: &Arc<TcmurDevice>, cmd: Box<TcmurCmd>) -> CmdOutcome {
    let op = cmd.cdb()[0];
    let off = scsi::get_lba(cmd.cdb()) * dev.block_size() as u64;

    match op {
        opcode::READ_6 | opcode::READ_10 | opcode::READ_12 | opcode::READ_16 => {
            call_store_read(dev, cmd, off)
        }
        opcode::WRITE_6 | opcode::WRITE_10 | opcode::WRITE_12 | opcode::WRITE_16 => {
            call_store_write(dev, cmd, off)
        }
        opcode::SYNCHRONIZE_CACHE | opcode::SYNCHRONIZE_CACHE_16 => {
            if dev.store().caps().contains(StoreCaps::FLUSH) {
                call_store_flush(dev, cmd)
            } else {
                CmdOutcome::Done(cmd, STATUS_NOT_HANDLED)
            }
        }
        opcode::COMPARE_AND_WRITE => call_store_caw(dev, cmd, off),
        opcode::WRITE_VERIFY => call_store_write_verify(dev, cmd, off),
        _ => {
            warn!("dev {}: unknown command {:#04x}", dev.name(), op);
            CmdOutcome::Done(cmd, STATUS_NOT_HANDLED)
        }
    }
}

/// Reject commands that exceed the device geometry before they reach the
/// store.
fn check_lba_and_length(dev: &TcmurDevice, cmd: &mut TcmurCmd) -> Option<u8> {
    let op = cmd.cdb()[0];
    match op {
        opcode::READ_6
        | opcode::READ_10
        | opcode::READ_12
        | opcode::READ_16
        | opcode::WRITE_6
        | opcode::WRITE_10
        | opcode::WRITE_12
        | opcode::WRITE_16
        | opcode::WRITE_VERIFY
        | opcode::COMPARE_AND_WRITE => {}
        _ => return None,
    }

    let lba = scsi::get_lba(cmd.cdb());
    let blocks = scsi::get_xfer_length(cmd.cdb()) as u64;
    if blocks > dev.max_xfer_len() as u64 {
        return Some(scsi::set_sense_data(
            cmd.sense_mut(),
            sense_key::ILLEGAL_REQUEST,
            asc::INVALID_FIELD_IN_CDB,
            None,
        ));
    }
    if lba + blocks > dev.num_lbas() {
        return Some(scsi::set_sense_data(
            cmd.sense_mut(),
            sense_key::ILLEGAL_REQUEST,
            asc::LBA_OUT_OF_RANGE,
            None,
        ));
    }
    None
}

/// Dispatch one delivered CDB.
///
/// Returns [`CmdOutcome::Async`] when the command was accepted and will
/// complete through the transport callbacks, or [`CmdOutcome::Done`] with
/// the command and a final status the caller delivers itself. A device that
/// lost its lock short-circuits with NOT READY (state transition); one that
/// lost its cluster connection responds BUSY, until the lock is re-acquired
/// via [`crate::lock::try_lock`].
pub fn tcmur_handle_cmd(dev: &Arc<TcmurDevice>, mut cmd: Box<TcmurCmd>) -> CmdOutcome {
    match dev.lock_state() {
        crate::lock::LockState::Lost => {
            let status = scsi::set_sense_data(
                cmd.sense_mut(),
                sense_key::NOT_READY,
                asc::STATE_TRANSITION,
                None,
            );
            return CmdOutcome::Done(cmd, status);
        }
        crate::lock::LockState::NotConn => {
            return CmdOutcome::Done(cmd, sam::BUSY);
        }
        _ => {}
    }

    if let Some(status) = check_lba_and_length(dev, &mut cmd) {
        return CmdOutcome::Done(cmd, status);
    }

    let outcome = if dev.store().caps().contains(StoreCaps::HANDLE_CMD) {
        command_passthrough(dev, cmd)
    } else {
        call_store_handler(dev, cmd)
    };

    match outcome {
        CmdOutcome::Async => CmdOutcome::Async,
        CmdOutcome::Done(mut cmd, status) => {
            let status = resolve_not_handled(&mut cmd, status);
            CmdOutcome::Done(cmd, status)
        }
    }
}
