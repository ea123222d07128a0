//! The execution manager: runs a cohort of benchmarks until the first one ends.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use log::debug;
use log::info;
use log::warn;
use nix::unistd::Pid;

use crate::benchmark::Benchmark;
use crate::config::Config;
use crate::exec::event::ExecEvent;
use crate::exec::event::ExecutionFlag;
use crate::exec::monitor::ExecMonitor;
use crate::exec::monitor::Strategy;
use crate::exec::process_monitor::ProcessMonitor;
use crate::exec::registry;
use crate::util::process::KillMode;
use crate::util::process::ManagedProcess;
use crate::util::process::Termination;
use crate::util::timer::CallbackTimer;

/// How long the manager blocks on the process monitor before checking the
/// execution monitor and the time limit again.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A benchmark terminated; the rest of the cohort was killed.
    Completed {
        benchmark: Benchmark,
        pid: Pid,
        termination: Termination,
    },
    /// The time limit expired first; the whole cohort was killed.
    TimedOut,
}

/// A created benchmark process.
struct Launched {
    pid: Pid,
    benchmark: usize,
    process: Arc<ManagedProcess>,
}

/// Drives one run.
///
/// Every benchmark is created as a gated process and announced to the
/// execution monitor, which gets to prepare (pin CPUs, open counters)
/// before any benchmark code runs. All processes are then released
/// together. The run ends when the first benchmark terminates, the time
/// limit expires or the execution monitor fails; every remaining process
/// is then killed and reaped.
pub struct ExecManager {
    benchmarks: Vec<Benchmark>,
    kill_mode: KillMode,
    time_limit: Option<Duration>,
    flag: ExecutionFlag,
    monitor: ExecMonitor,
}

impl ExecManager {
    /// Create a manager from a configuration, instantiating its monitor.
    pub fn new(config: &Config) -> Result<Self> {
        let strategy = registry::create(&config.exec_monitor)?;
        Ok(Self::with_strategy(
            config.exec_manager.benchmarks()?,
            strategy,
            config.exec_manager.kill_mode,
            config.exec_manager.time_limit(),
        ))
    }

    /// Create a manager around an already built strategy.
    ///
    /// # Arguments
    ///
    /// * `benchmarks` - The cohort, in id order
    /// * `strategy` - Behavior of the execution monitor
    /// * `kill_mode` - How leftover processes are killed
    /// * `time_limit` - Optional upper bound on the run
    pub fn with_strategy(
        benchmarks: Vec<Benchmark>,
        strategy: Box<dyn Strategy>,
        kill_mode: KillMode,
        time_limit: Option<Duration>,
    ) -> Self {
        let flag = ExecutionFlag::new();
        Self {
            benchmarks,
            kill_mode,
            time_limit,
            monitor: ExecMonitor::new(strategy, flag.clone()),
            flag,
        }
    }

    pub fn is_execution_over(&self) -> bool {
        self.flag.is_over()
    }

    /// Run the cohort to completion.
    pub fn run(mut self) -> Result<Outcome> {
        if self.benchmarks.is_empty() {
            return Err(anyhow!("no benchmarks to run"));
        }
        info!(
            "starting execution of {} benchmarks with monitor {}",
            self.benchmarks.len(),
            self.monitor.name()
        );
        self.monitor.initialize()?;

        let mut launched = Vec::with_capacity(self.benchmarks.len());
        let mut waiters = ProcessMonitor::new();
        if let Err(e) = self.launch(&mut launched, &mut waiters) {
            warn!("aborting execution: {e:#}");
            self.flag.end();
            teardown(&launched);
            return Err(e);
        }

        let outcome = self.wait_for_first(&mut waiters, &launched);
        self.flag.end();
        let joined = self.monitor.join();
        let finalized = self.monitor.finalize();

        teardown(&launched);
        // Reaps everything that was killed.
        drop(waiters);

        joined?;
        finalized?;
        let outcome = outcome?;
        info!("execution over");
        Ok(outcome)
    }

    /// Create every process, prepare the monitor, then release everything.
    fn launch(&mut self, launched: &mut Vec<Launched>, waiters: &mut ProcessMonitor) -> Result<()> {
        for (index, benchmark) in self.benchmarks.iter().enumerate() {
            debug!("preparing benchmark {benchmark}");
            let process = Arc::new(ManagedProcess::new(benchmark.args().to_vec(), self.kill_mode)?);
            let pid = process
                .create()
                .with_context(|| format!("failed to create benchmark {benchmark}"))?;
            launched.push(Launched {
                pid,
                benchmark: index,
                process: process.clone(),
            });
            waiters.add(process)?;
            self.monitor.enqueue_event(ExecEvent::ProcessCreated(pid));
        }

        self.monitor.prepare()?;

        for l in launched.iter() {
            l.process
                .start()
                .with_context(|| format!("failed to start benchmark {}", self.benchmarks[l.benchmark]))?;
        }

        self.monitor.start()
    }

    fn wait_for_first(&self, waiters: &mut ProcessMonitor, launched: &[Launched]) -> Result<Outcome> {
        let expired = Arc::new(AtomicBool::new(false));
        let _timer = match self.time_limit {
            Some(limit) => {
                let expired = expired.clone();
                Some(CallbackTimer::new(limit, move || {
                    expired.store(true, Ordering::Release);
                })?)
            }
            None => None,
        };

        loop {
            if let Some((pid, termination)) = waiters.wait_for_any_timeout(POLL_INTERVAL)? {
                let l = launched
                    .iter()
                    .find(|l| l.pid == pid)
                    .ok_or_else(|| anyhow!("unknown process {pid} terminated"))?;
                let benchmark = self.benchmarks[l.benchmark].clone();
                info!("benchmark {benchmark} (pid {pid}) {termination}");
                return Ok(Outcome::Completed {
                    benchmark,
                    pid,
                    termination,
                });
            }
            if expired.load(Ordering::Acquire) {
                info!("time limit reached");
                return Ok(Outcome::TimedOut);
            }
            if self.monitor.has_stopped() {
                return Err(anyhow!("execution monitor {} stopped early", self.monitor.name()));
            }
        }
    }
}

/// Kill every process. Failures are logged and never stop the sweep.
fn teardown(launched: &[Launched]) {
    info!("cleaning up");
    for l in launched {
        if let Err(e) = l.process.kill() {
            warn!("failed to kill process {}: {e:#}", l.pid);
        }
    }
}
