//! Execution monitor strategies.

pub mod cpu_hopper;
pub mod pmc_sampler;
pub mod simple;
