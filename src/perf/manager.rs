//! All the counters of one process.

use anyhow::Context;
use anyhow::Result;
use nix::unistd::Pid;

use crate::perf::event::Counter;
use crate::perf::event::Event;
use crate::perf::event::EventInfo;
use crate::perf::event::ReadMode;
use crate::perf::event::Sample;

/// A set of counters opened on a single process.
pub struct EventManager<C: Counter> {
    pid: Pid,
    events: Vec<Event<C>>,
    latest: Vec<Sample>,
}

impl<C: Counter> EventManager<C> {
    /// Open one counter per event on the given process.
    ///
    /// # Arguments
    ///
    /// * `events` - The events to count
    /// * `pid` - The process to attach to
    /// * `attach` - Count right away if true, otherwise from the next exec
    /// * `factory` - Creates the backend of each counter
    pub fn new<F>(events: &[EventInfo], pid: Pid, attach: bool, mut factory: F) -> Result<Self>
    where
        F: FnMut(&EventInfo) -> C,
    {
        let mut opened = Vec::with_capacity(events.len());
        for info in events {
            let mut event = Event::new(*info, factory(info))?;
            event
                .open(pid, attach)
                .with_context(|| format!("failed to open {info:?} on process {pid}"))?;
            opened.push(event);
        }
        Ok(Self {
            pid,
            latest: vec![Sample::default(); opened.len()],
            events: opened,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn events(&self) -> impl Iterator<Item = &EventInfo> {
        self.events.iter().map(|e| e.info())
    }

    /// Read every counter and return the new samples, in event order.
    pub fn read_events(&mut self, mode: ReadMode) -> Result<&[Sample]> {
        for event in &mut self.events {
            event.read()?;
        }
        for (event, sample) in self.events.iter_mut().zip(self.latest.iter_mut()) {
            *sample = event.scale(mode)?;
        }
        Ok(&self.latest)
    }

    /// The samples of the last successful read.
    pub fn latest(&self) -> &[Sample] {
        &self.latest
    }
}

impl<C: Counter> Drop for EventManager<C> {
    fn drop(&mut self) {
        for event in &mut self.events {
            let _ = event.close();
        }
    }
}
