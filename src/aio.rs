//! # Asynchronous command execution
//!
//! Every store operation goes through one entry point, [`async_call`]: it
//! records the completion callout on the command, wraps the command into a
//! [`StoreTask`] and either submits it to an asynchronous store directly or
//! appends it to the device's worker queue, where a worker thread runs the
//! blocking store call. Both paths finish through [`StoreTask::complete`],
//! which maps the store result to a SAM status and fires the recorded
//! callout — so multi-step command handlers see one uniform completion
//! model regardless of the store's execution style.
//!
//! The in-flight tracker counts commands between `command_start` and
//! `command_finish`; the transport's `processing_complete` fires when the
//! device goes idle, and teardown requires the count to be zero.

use crate::dev::{TcmurCmd, TcmurDevice};
use crate::lock;
use crate::scsi::{self, sam, XferDir};
use crate::store::StoreCaps;
use crate::TcmurError;
use log::error;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// Completion callout recorded on a command; receives the command back with
/// the SAM status of the finished store operation.
pub(crate) type CalloutFn = fn(&Arc<TcmurDevice>, Box<TcmurCmd>, u8);

/// Internal status byte marking a passthrough command the store declined.
/// Never delivered to the transport.
pub(crate) const STATUS_NOT_HANDLED: u8 = 0xff;

/// One store operation on the current view of a command's I/O vector.
#[derive(Debug, Clone, Copy)]
pub(crate) enum StoreOp {
    Read { off: u64 },
    Write { off: u64 },
    Flush,
    HandleCmd,
}

/// Descriptor of one store call: the operation plus its completion callout.
pub(crate) struct CallStub {
    pub sop: StoreOp,
    pub callout: CalloutFn,
}

/// Outcome of handing a command to the execution engine.
///
/// `Async` means ownership moved on and the completion will be delivered
/// through the transport later, from some thread. `Done` hands the command
/// back with a final status the caller is responsible for delivering.
pub enum CmdOutcome {
    Async,
    Done(Box<TcmurCmd>, u8),
}

/// Result a store reports when completing a task.
pub enum StoreRc {
    /// Bytes actually moved by a read or write; short transfers become a
    /// medium error.
    Bytes(usize),
    /// Success for operations without a transfer count (flush).
    Ok,
    /// Terminal SAM status decided by a passthrough handler.
    Sam(u8),
    /// Passthrough handler declined the CDB.
    NotHandled,
    /// OS errno (positive), mapped per the backend contract.
    Err(i32),
}

/// Return value of a store submit entry point.
///
/// `Rejected` gives the task back without the completion having run, so the
/// dispatcher can fail the command synchronously.
pub enum Submit {
    Started,
    Rejected(StoreTask, i32),
}

/// A submitted store operation: the command, the device it runs against,
/// and the operation geometry. The store must consume it exactly once via
/// [`StoreTask::complete`] (or hand it back with [`Submit::Rejected`]).
pub struct StoreTask {
    dev: Arc<TcmurDevice>,
    cmd: Box<TcmurCmd>,
    sop: StoreOp,
    requested: usize,
}

impl StoreTask {
    pub fn device(&self) -> &TcmurDevice {
        &self.dev
    }

    /// Byte offset of a read or write, 0 otherwise.
    pub fn offset(&self) -> u64 {
        match self.sop {
            StoreOp::Read { off } | StoreOp::Write { off } => off,
            _ => 0,
        }
    }

    /// Bytes the operation is expected to move.
    pub fn requested(&self) -> usize {
        self.requested
    }

    /// Raw CDB bytes, for passthrough handlers.
    pub fn cdb(&self) -> &[u8] {
        self.cmd.cdb()
    }

    /// Payload view: source of a write, destination of a read.
    pub fn iovec(&self) -> &crate::iovec::IoVec {
        self.cmd.iovec()
    }

    pub fn iovec_mut(&mut self) -> &mut crate::iovec::IoVec {
        self.cmd.iovec_mut()
    }

    /// Finish the operation. Computes the SAM status from `rc` (including
    /// the lock-aware errno mapping) and fires the command's callout.
    pub fn complete(self, rc: StoreRc) {
        let StoreTask {
            dev,
            mut cmd,
            sop,
            requested,
        } = self;

        let dir = match sop {
            StoreOp::Read { .. } => XferDir::FromStore,
            _ => XferDir::ToStore,
        };

        let status = match rc {
            StoreRc::Bytes(n) => {
                if n != requested {
                    error!(
                        "dev {}: short transfer, {} of {} bytes",
                        dev.name(),
                        n,
                        requested
                    );
                    lock::errno_status(&dev, &mut cmd, libc::EIO, dir)
                } else {
                    sam::GOOD
                }
            }
            StoreRc::Ok => sam::GOOD,
            StoreRc::Sam(status) => status,
            StoreRc::NotHandled => STATUS_NOT_HANDLED,
            StoreRc::Err(errno) => lock::errno_status(&dev, &mut cmd, errno, dir),
        };

        finish_callout(&dev, cmd, status);
    }

    pub(crate) fn new(
        dev: Arc<TcmurDevice>,
        cmd: Box<TcmurCmd>,
        sop: StoreOp,
        requested: usize,
    ) -> StoreTask {
        StoreTask {
            dev,
            cmd,
            sop,
            requested,
        }
    }

    /// Dismantle a rejected task; the callout is cleared so the command can
    /// be failed without a completion firing.
    pub(crate) fn into_cmd(self) -> Box<TcmurCmd> {
        let mut cmd = self.cmd;
        cmd.callout = None;
        cmd
    }
}

/// Invoke the callout recorded on the command.
pub(crate) fn finish_callout(dev: &Arc<TcmurDevice>, mut cmd: Box<TcmurCmd>, status: u8) {
    match cmd.callout.take() {
        Some(cb) => cb(dev, cmd, status),
        None => {
            error!("dev {}: completion without a recorded callout", dev.name());
            debug_assert!(false, "completion without a recorded callout");
        }
    }
}

/// Route the task to the matching store entry point.
fn submit_task(dev: &TcmurDevice, task: StoreTask) -> Submit {
    let store = dev.store();
    match task.sop {
        StoreOp::Read { .. } => store.read(task),
        StoreOp::Write { .. } => store.write(task),
        StoreOp::Flush => store.flush(task),
        StoreOp::HandleCmd => store.handle_cmd(task),
    }
}

/// Execute a call stub asynchronously.
///
/// Records the stub's callout on the command so every completion path fires
/// the same callback, then either submits to the store (AIO) or queues for
/// a worker thread. A rejected AIO submit becomes an immediate `Done`
/// without the callout running; `ENOMEM` maps to TASK SET FULL, anything
/// else to a medium error.
pub(crate) fn async_call(
    dev: &Arc<TcmurDevice>,
    mut cmd: Box<TcmurCmd>,
    stub: CallStub,
) -> CmdOutcome {
    cmd.callout = Some(stub.callout);

    let requested = match stub.sop {
        StoreOp::Read { .. } | StoreOp::Write { .. } => cmd.iovec().length(),
        _ => 0,
    };
    let task = StoreTask::new(dev.clone(), cmd, stub.sop, requested);

    if dev.store().caps().contains(StoreCaps::AIO) {
        match submit_task(dev, task) {
            Submit::Started => CmdOutcome::Async,
            Submit::Rejected(task, errno) => {
                let dir = match stub.sop {
                    StoreOp::Read { .. } => XferDir::FromStore,
                    _ => XferDir::ToStore,
                };
                let mut cmd = task.into_cmd();
                let status = match errno {
                    libc::ENOMEM => sam::TASK_SET_FULL,
                    _ => scsi::errno_to_sam_status(libc::EIO, cmd.sense_mut(), dir),
                };
                CmdOutcome::Done(cmd, status)
            }
        }
    } else {
        // the queue is only present for non-AIO stores
        dev.work_queue()
            .expect("blocking store without a worker queue")
            .push(task);
        CmdOutcome::Async
    }
}

/// Increment the in-flight count; must precede any path that can defer
/// completion.
pub(crate) fn command_start(dev: &TcmurDevice) {
    dev.tracker().start();
}

/// Decrement the in-flight count and deliver the command to the transport;
/// fires `processing_complete` when the device went idle.
pub(crate) fn command_finish(dev: &Arc<TcmurDevice>, cmd: Box<TcmurCmd>, status: u8) {
    let idle = dev.tracker().finish();
    dev.transport().complete(dev, cmd, status);
    if idle {
        dev.transport().processing_complete(dev);
    }
}

/// Decrement the in-flight count only; the caller keeps the command and
/// propagates its status itself.
pub(crate) fn command_finish_local(dev: &TcmurDevice) {
    dev.tracker().finish();
}

/// Per-device in-flight command counter.
pub(crate) struct AioTracker {
    inflight: Mutex<u32>,
}

impl AioTracker {
    pub(crate) fn new() -> AioTracker {
        AioTracker {
            inflight: Mutex::new(0),
        }
    }

    pub(crate) fn start(&self) {
        *self.inflight.lock().unwrap() += 1;
    }

    /// Returns true when the count dropped to zero.
    pub(crate) fn finish(&self) -> bool {
        let mut count = self.inflight.lock().unwrap();
        if *count == 0 {
            error!("in-flight tracker underflow");
            debug_assert!(false, "in-flight tracker underflow");
            return false;
        }
        *count -= 1;
        *count == 0
    }

    pub(crate) fn in_flight(&self) -> u32 {
        *self.inflight.lock().unwrap()
    }
}

struct WqInner {
    queue: VecDeque<StoreTask>,
    shutdown: bool,
}

/// FIFO of submitted tasks served by worker threads running blocking store
/// calls. The queue grows unbounded; backpressure comes from the
/// transport's ring depth.
pub(crate) struct IoWorkQueue {
    inner: Mutex<WqInner>,
    cond: Condvar,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl IoWorkQueue {
    pub(crate) fn new() -> IoWorkQueue {
        IoWorkQueue {
            inner: Mutex::new(WqInner {
                queue: VecDeque::new(),
                shutdown: false,
            }),
            cond: Condvar::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn push(&self, task: StoreTask) {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.push_back(task);
        self.cond.notify_one();
    }
}

fn io_work_fn(dev: Arc<TcmurDevice>) {
    let wq = dev.work_queue().expect("worker without a queue");
    loop {
        let task = {
            let mut inner = wq.inner.lock().unwrap();
            loop {
                if inner.shutdown {
                    // anything still queued is discarded; teardown only
                    // runs once the device is idle
                    inner.queue.clear();
                    return;
                }
                if let Some(task) = inner.queue.pop_front() {
                    break task;
                }
                inner = wq.cond.wait(inner).unwrap();
            }
        };

        match submit_task(&dev, task) {
            Submit::Started => {}
            Submit::Rejected(task, errno) => task.complete(StoreRc::Err(errno)),
        }
    }
}

/// Spawn the worker threads for a device with a blocking store.
pub(crate) fn setup_io_work_queue(
    dev: &Arc<TcmurDevice>,
    nr_workers: usize,
) -> Result<(), TcmurError> {
    let wq = dev.work_queue().expect("no worker queue to set up");
    let mut workers = wq.workers.lock().unwrap();
    for i in 0..nr_workers.max(1) {
        let worker_dev = dev.clone();
        let handle = std::thread::Builder::new()
            .name(format!("tcmur-io-{}-{}", dev.name(), i))
            .spawn(move || io_work_fn(worker_dev))
            .map_err(TcmurError::WorkerSpawn)?;
        workers.push(handle);
    }
    Ok(())
}

/// Stop and join the worker threads; no-op for AIO devices.
pub(crate) fn cleanup_io_work_queue(dev: &TcmurDevice) {
    let Some(wq) = dev.work_queue() else {
        return;
    };
    {
        let mut inner = wq.inner.lock().unwrap();
        inner.shutdown = true;
        wq.cond.notify_all();
    }
    let handles: Vec<JoinHandle<()>> = wq.workers.lock().unwrap().drain(..).collect();
    for handle in handles {
        if handle.join().is_err() {
            error!("dev {}: io worker thread panicked", dev.name());
        }
    }
}
