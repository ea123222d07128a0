//! Orchestration of a benchmark run.

pub mod event;
pub mod manager;
pub mod monitor;
pub mod process_monitor;
pub mod registry;
