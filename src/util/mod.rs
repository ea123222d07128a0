//! Synchronization primitives and OS plumbing.

pub mod condition;
pub mod pipe;
pub mod process;
pub mod queue;
pub mod sched;
pub mod timer;
