//! # libtcmur
//!
//! A library for building userspace SCSI target (TCMU) backstore daemons.
//! The kernel target layer delivers SCSI CDBs to userspace; this crate
//! decodes the opcode, routes it through a backend store adapter, composes
//! the multi-step commands (COMPARE AND WRITE, WRITE AND VERIFY) on top of
//! primitive read/write/flush, handles completion ordering, and reports
//! outcomes via SCSI sense data.
//!
//! Backends plug in through the [`store::TcmurStore`] trait. A natively
//! asynchronous store (RBD-style completions) advertises
//! [`store::StoreCaps::AIO`] and completes submitted tasks from its own
//! threads; a blocking store is transparently shunted onto a per-device
//! worker pool. Clustered stores that enforce single-writer semantics
//! additionally implement [`lock::ExclusiveLockOps`], driven by the
//! [`lock::try_lock`] coordinator.
//!
//! The transport side (kernel ring / mailbox handling) stays outside this
//! crate: it hands commands to [`store::tcmur_handle_cmd`] and receives each
//! completion exactly once through its [`dev::TcmurTransport`] callbacks.

use thiserror::Error;

pub mod aio;
pub mod dev;
pub mod iovec;
pub mod lock;
pub mod scsi;
pub mod store;

mod test_helpers;

pub use aio::{CmdOutcome, StoreRc, StoreTask, Submit};
pub use dev::{CfgString, DeviceBuilder, DeviceInfo, TcmurCmd, TcmurDevice, TcmurTransport};
pub use iovec::IoVec;
pub use lock::{ExclusiveLockOps, LockMode, LockResult, LockState};
pub use store::{tcmur_handle_cmd, StoreCaps, TcmurStore};

#[derive(Error, Debug)]
pub enum TcmurError {
    #[error("invalid configuration string: {0}")]
    InvalidCfgString(String),

    #[error("invalid device parameter: {0}")]
    InvalidParam(&'static str),

    #[error("failed to spawn io worker thread")]
    WorkerSpawn(#[source] std::io::Error),

    #[error("store open failure (errno {0})")]
    StoreError(i32),

    #[error("json failure")]
    JsonError(#[from] serde_json::Error),

    #[error("other IO failure")]
    OtherIOError(#[from] std::io::Error),

    #[error("other failure (errno {0})")]
    OtherError(i32),
}
