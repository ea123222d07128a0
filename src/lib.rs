//! Benchmark execution harness.
//!
//! Launches a cohort of workloads as gated child processes, supervises them
//! with a pluggable execution monitor (CPU hopping, hardware counter sampling
//! or nothing at all) and tears the whole cohort down as soon as the first
//! workload finishes.

pub mod benchmark;
pub mod config;
pub mod error;
pub mod exec;
pub mod monitors;
pub mod perf;
pub mod util;

pub use error::Error;
