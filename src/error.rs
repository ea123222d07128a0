//! Error taxonomy shared across the crate.
//!
//! Most functions return `anyhow::Result`. Failures that a caller may need to
//! tell apart are raised as one of the variants below, and can be recovered
//! with `anyhow::Error::downcast_ref::<Error>()`.

use std::path::PathBuf;

use nix::errno::Errno;
use nix::unistd::Pid;
use thiserror::Error;

use crate::util::process::ProcessState;

#[derive(Debug, Error)]
pub enum Error {
    #[error("executable {0} does not exist")]
    NotFound(PathBuf),

    #[error("argument list is empty")]
    EmptyCommand,

    #[error("cannot {operation} a process in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: ProcessState,
    },

    #[error("failed to execute {path}: {errno}")]
    ExecFailed { path: String, errno: Errno },

    #[error("pid {0} is already tracked")]
    DuplicateTarget(Pid),

    #[error("no free CPU left ({0} CPUs managed, one must stay unallocated)")]
    NoFreeCpu(usize),

    #[error("unknown execution monitor {0:?}")]
    UnknownMonitor(String),

    #[error("unknown counter backend {0:?}")]
    UnknownBackend(String),

    #[error("invalid event modifiers {0:#x}")]
    InvalidModifiers(u8),

    #[error("counter ran for longer than it was enabled (running {running}, enabled {enabled})")]
    CounterOverrun { running: u64, enabled: u64 },

    #[error("counter advanced from {previous} to {value} without running")]
    CounterDrift { previous: u64, value: u64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Whether this error reports a broken promise from the counter subsystem.
    pub fn is_counter_invariant(&self) -> bool {
        matches!(self, Error::CounterOverrun { .. } | Error::CounterDrift { .. })
    }
}
