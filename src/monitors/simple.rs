//! A strategy that only keeps time.

use std::thread;
use std::time::Duration;

use anyhow::Result;
use log::info;

use crate::config::MonitorConfig;
use crate::exec::event::ExecEvent;
use crate::exec::monitor::Dispatch;
use crate::exec::monitor::Strategy;
use crate::monitor;

pub struct SimpleMonitor {
    interval: Duration,
}

impl SimpleMonitor {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    fn create(config: &MonitorConfig) -> Result<Box<dyn Strategy>> {
        Ok(Box::new(Self::new(config.sampling_length())))
    }
}

impl Strategy for SimpleMonitor {
    fn name(&self) -> &str {
        "simple"
    }

    fn tick(&mut self) -> Result<()> {
        thread::sleep(self.interval);
        Ok(())
    }

    fn handle_event(&mut self, event: &ExecEvent) -> Result<Dispatch> {
        match event {
            ExecEvent::ProcessCreated(pid) => info!("monitoring process {pid}"),
        }
        Ok(Dispatch::Handled)
    }
}

monitor!("simple" => SimpleMonitor::create);
