//! Hardware performance counters.

pub mod dummy;
pub mod event;
pub mod linux;
pub mod manager;
