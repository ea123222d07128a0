//! Notifications from the execution manager to the execution monitor.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use nix::unistd::Pid;

/// Tag of an [`ExecEvent`], used to route it to a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ProcessCreated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecEvent {
    /// A benchmark process was created and is held at its start gate.
    ProcessCreated(Pid),
}

impl ExecEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ExecEvent::ProcessCreated(_) => EventKind::ProcessCreated,
        }
    }
}

impl fmt::Display for ExecEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecEvent::ProcessCreated(pid) => write!(f, "process {pid} created"),
        }
    }
}

/// The shared "execution over" flag.
///
/// It starts unset and, once ended, stays ended.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFlag(Arc<AtomicBool>);

impl ExecutionFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_over(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn end(&self) {
        self.0.store(true, Ordering::Release);
    }
}
