//! A counter backend that never counts anything.
//!
//! Useful where no PMU is available: the sampling pipeline runs end to end
//! and reports disabled, zero-valued samples.

use anyhow::Result;
use nix::unistd::Pid;

use crate::perf::event::Counter;
use crate::perf::event::EventInfo;
use crate::perf::event::RawCount;

#[derive(Debug, Default)]
pub struct DummyCounter;

impl Counter for DummyCounter {
    fn open(&mut self, _info: &EventInfo, _pid: Pid, _attach: bool) -> Result<()> {
        Ok(())
    }

    fn read(&mut self) -> Result<RawCount> {
        Ok(RawCount::default())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
