//! A strategy that periodically samples hardware counters of every benchmark.
//!
//! Cycles and instructions are counted for each process (and its children)
//! from the moment it is created. Every tick, all counters are read, scaled,
//! and logged.

use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use log::info;
use log::warn;
use nix::unistd::Pid;

use crate::config::MonitorConfig;
use crate::error::Error;
use crate::exec::event::ExecEvent;
use crate::exec::monitor::Dispatch;
use crate::exec::monitor::Strategy;
use crate::monitor;
use crate::perf::dummy::DummyCounter;
use crate::perf::event::Counter;
use crate::perf::event::EventInfo;
use crate::perf::event::ReadMode;
use crate::perf::event::Sample;
use crate::perf::event::generic_events;
use crate::perf::linux::LinuxCounter;
use crate::perf::manager::EventManager;

/// Creates the backend of one counter.
pub type CounterFactory<C> = Box<dyn FnMut(&EventInfo) -> C + Send>;

pub struct PmcSampler<C: Counter> {
    name: String,
    interval: Duration,
    read_mode: ReadMode,
    attach: bool,
    /// Label and descriptor of every counter opened per process.
    events: Vec<(&'static str, EventInfo)>,
    factory: CounterFactory<C>,
    managers: BTreeMap<Pid, EventManager<C>>,
}

impl<C: Counter> PmcSampler<C> {
    /// Create a sampler counting cycles and instructions.
    ///
    /// # Arguments
    ///
    /// * `name` - Registry key of the sampler
    /// * `backend` - Name of the backend the generic events are resolved for
    /// * `factory` - Creates the backend of each counter
    pub fn new(name: &str, backend: &str, factory: CounterFactory<C>) -> Result<Self> {
        let generic = generic_events(backend)?;
        Ok(Self {
            name: name.to_string(),
            interval: Duration::from_secs(1),
            read_mode: ReadMode::Relative,
            attach: true,
            events: vec![
                ("cycles", EventInfo::hardware(generic.cycles)),
                ("instructions", EventInfo::hardware(generic.instructions)),
            ],
            factory,
            managers: BTreeMap::new(),
        })
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_read_mode(mut self, read_mode: ReadMode) -> Self {
        self.read_mode = read_mode;
        self
    }

    pub fn with_attach(mut self, attach: bool) -> Self {
        self.attach = attach;
        self
    }

    /// Open the counters of a new process. Failing to open is fatal.
    pub fn add_process(&mut self, pid: Pid) -> Result<()> {
        if self.managers.contains_key(&pid) {
            return Err(Error::DuplicateTarget(pid).into());
        }
        info!("adding process {pid}");
        let infos: Vec<EventInfo> = self.events.iter().map(|(_, info)| *info).collect();
        let manager = EventManager::new(&infos, pid, self.attach, &mut self.factory)
            .with_context(|| format!("failed to open counters for process {pid}"))?;
        self.managers.insert(pid, manager);
        Ok(())
    }

    /// Read and log the counters of every process.
    ///
    /// Read failures are logged and skipped. A counter breaking its own
    /// invariants is fatal.
    pub fn sample(&mut self) -> Result<()> {
        for (pid, manager) in self.managers.iter_mut() {
            let samples = match manager.read_events(self.read_mode) {
                Ok(samples) => samples,
                Err(e) if is_counter_invariant(&e) => {
                    return Err(e.context(format!("inconsistent counters for process {pid}")));
                }
                Err(e) => {
                    warn!("failed to sample process {pid}: {e:#}");
                    continue;
                }
            };
            log_samples(*pid, &self.events, samples);
        }
        Ok(())
    }

    /// The samples of the last successful read of a process.
    pub fn latest(&self, pid: Pid) -> Option<&[Sample]> {
        self.managers.get(&pid).map(|m| m.latest())
    }
}

fn is_counter_invariant(e: &anyhow::Error) -> bool {
    e.downcast_ref::<Error>()
        .is_some_and(|e| e.is_counter_invariant())
}

fn log_samples(pid: Pid, events: &[(&'static str, EventInfo)], samples: &[Sample]) {
    for ((label, _), s) in events.iter().zip(samples) {
        info!(
            "process {pid} {label}: enabled: {}, count: {:.0}, scaling: {:.3}",
            s.enabled, s.value, s.scaling
        );
    }
    if let [cycles, instructions] = samples {
        if cycles.enabled && instructions.enabled && cycles.value > 0.0 {
            info!("process {pid} IPC: {:.3}", instructions.value / cycles.value);
        }
    }
}

impl<C: Counter> Strategy for PmcSampler<C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn tick(&mut self) -> Result<()> {
        thread::sleep(self.interval);
        self.sample()
    }

    fn handle_event(&mut self, event: &ExecEvent) -> Result<Dispatch> {
        match event {
            ExecEvent::ProcessCreated(pid) => self.add_process(*pid)?,
        }
        Ok(Dispatch::Handled)
    }
}

fn from_config<C: Counter + Default + 'static>(
    name: &str,
    default_backend: &str,
    config: &MonitorConfig,
) -> Result<Box<dyn Strategy>> {
    let backend = config.event.as_deref().unwrap_or(default_backend);
    let sampler = PmcSampler::<C>::new(name, backend, Box::new(|_: &EventInfo| C::default()))?
        .with_interval(config.sampling_length())
        .with_read_mode(config.read_mode)
        .with_attach(config.attach);
    Ok(Box::new(sampler))
}

fn create_linux(config: &MonitorConfig) -> Result<Box<dyn Strategy>> {
    from_config::<LinuxCounter>("pmc-sampler[linux]", "linux", config)
}

fn create_dummy(config: &MonitorConfig) -> Result<Box<dyn Strategy>> {
    from_config::<DummyCounter>("pmc-sampler[dummy]", "dummy", config)
}

monitor!("pmc-sampler", "pmc-sampler[linux]" => create_linux);
monitor!("pmc-sampler[dummy]" => create_dummy);
