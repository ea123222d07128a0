//! The execution monitor: a supervisory thread running a pluggable strategy.
//!
//! The monitor goes through a fixed lifecycle, driven by the execution
//! manager:
//!
//! ```text
//! Uninitialized -> Initialized -> Prepared -> Running -> Joined -> Finalized
//! ```
//!
//! Calling a lifecycle method out of order is a bug in the caller and
//! panics. While running, the supervisory thread alternates between the
//! strategy's periodic tick and draining the event inbox, until the
//! execution is over.

use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use log::debug;
use log::warn;

use crate::exec::event::ExecEvent;
use crate::exec::event::ExecutionFlag;
use crate::util::queue::ConcurrentQueue;

/// Whether a strategy acted on an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Handled,
    Ignored,
}

/// Behavior plugged into an [`ExecMonitor`].
///
/// The hooks run on the manager's thread, except for `tick` and
/// `handle_event` which run on the supervisory thread while the monitor is
/// running. An error from `tick` or `handle_event` ends the supervisory loop.
pub trait Strategy: Send {
    /// Registry key of the strategy.
    fn name(&self) -> &str;

    fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called once all processes are created, before they are released.
    fn prepare(&mut self) -> Result<()> {
        Ok(())
    }

    /// One iteration of periodic work, usually sleeping then sampling.
    fn tick(&mut self) -> Result<()>;

    fn handle_event(&mut self, _event: &ExecEvent) -> Result<Dispatch> {
        Ok(Dispatch::Ignored)
    }

    fn finalize(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Lifecycle state of an [`ExecMonitor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Uninitialized,
    Initialized,
    Prepared,
    Running,
    Joined,
    Finalized,
}

/// Handle for posting events to a monitor from any thread.
#[derive(Clone)]
pub struct Inbox(Arc<ConcurrentQueue<ExecEvent>>);

impl Inbox {
    /// Post an event. Never blocks.
    pub fn enqueue(&self, event: ExecEvent) {
        self.0.push(event);
    }
}

type LoopResult = (Box<dyn Strategy>, Result<()>);

pub struct ExecMonitor {
    state: MonitorState,
    /// Held here except while the supervisory thread runs.
    strategy: Option<Box<dyn Strategy>>,
    name: String,
    inbox: Arc<ConcurrentQueue<ExecEvent>>,
    flag: ExecutionFlag,
    thread: Option<JoinHandle<LoopResult>>,
}

impl ExecMonitor {
    /// Create a monitor.
    ///
    /// # Arguments
    ///
    /// * `strategy` - The behavior to run
    /// * `flag` - Shared flag telling the supervisory thread to stop
    pub fn new(strategy: Box<dyn Strategy>, flag: ExecutionFlag) -> Self {
        Self {
            state: MonitorState::Uninitialized,
            name: strategy.name().to_string(),
            strategy: Some(strategy),
            inbox: Arc::new(ConcurrentQueue::new()),
            flag,
            thread: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn initialize(&mut self) -> Result<()> {
        self.transition(MonitorState::Uninitialized, MonitorState::Initialized);
        self.strategy_mut()?.initialize()
    }

    /// Deliver the events posted so far, then run the strategy's prepare hook.
    pub fn prepare(&mut self) -> Result<()> {
        self.transition(MonitorState::Initialized, MonitorState::Prepared);
        let inbox = self.inbox.clone();
        let strategy = self.strategy_mut()?;
        drain(strategy.as_mut(), &inbox)?;
        strategy.prepare()
    }

    /// Spawn the supervisory thread.
    pub fn start(&mut self) -> Result<()> {
        self.transition(MonitorState::Prepared, MonitorState::Running);
        let mut strategy = self
            .strategy
            .take()
            .ok_or_else(|| anyhow!("monitor {} has no strategy", self.name))?;
        let inbox = self.inbox.clone();
        let flag = self.flag.clone();
        let thread = thread::Builder::new()
            .name("exec-monitor".to_string())
            .spawn(move || {
                let result = supervise(strategy.as_mut(), &inbox, &flag);
                (strategy, result)
            })
            .with_context(|| "failed to spawn execution monitor thread")?;
        self.thread = Some(thread);
        debug!("execution monitor {} started", self.name);
        Ok(())
    }

    /// Whether the supervisory thread has exited, on its own or otherwise.
    pub fn has_stopped(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| t.is_finished())
    }

    /// Wait for the supervisory thread to exit.
    ///
    /// # Returns
    ///
    /// The error that ended the supervisory loop early, if any.
    pub fn join(&mut self) -> Result<()> {
        self.transition(MonitorState::Running, MonitorState::Joined);
        let thread = self
            .thread
            .take()
            .ok_or_else(|| anyhow!("monitor {} was not started", self.name))?;
        let (strategy, result) = thread
            .join()
            .map_err(|_| anyhow!("execution monitor {} panicked", self.name))?;
        self.strategy = Some(strategy);
        debug!("execution monitor {} joined", self.name);
        result.with_context(|| format!("execution monitor {} failed", self.name))
    }

    pub fn finalize(&mut self) -> Result<()> {
        self.transition(MonitorState::Joined, MonitorState::Finalized);
        match self.strategy.as_mut() {
            Some(strategy) => strategy.finalize(),
            // Lost to a panic on the supervisory thread.
            None => Ok(()),
        }
    }

    /// Post an event. Callable at any point of the lifecycle; never blocks.
    pub fn enqueue_event(&self, event: ExecEvent) {
        self.inbox.push(event);
    }

    /// A handle for posting events from other threads.
    pub fn inbox(&self) -> Inbox {
        Inbox(self.inbox.clone())
    }

    fn transition(&mut self, from: MonitorState, to: MonitorState) {
        assert_eq!(
            self.state, from,
            "execution monitor {} cannot move to {to:?}",
            self.name
        );
        self.state = to;
    }

    fn strategy_mut(&mut self) -> Result<&mut Box<dyn Strategy>> {
        self.strategy
            .as_mut()
            .ok_or_else(|| anyhow!("monitor {} has no strategy", self.name))
    }
}

impl Drop for ExecMonitor {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.flag.end();
            let _ = thread.join();
        }
    }
}

fn supervise(strategy: &mut dyn Strategy, inbox: &ConcurrentQueue<ExecEvent>, flag: &ExecutionFlag) -> Result<()> {
    while !flag.is_over() {
        strategy.tick()?;
        drain(strategy, inbox)?;
    }
    Ok(())
}

fn drain(strategy: &mut dyn Strategy, inbox: &ConcurrentQueue<ExecEvent>) -> Result<()> {
    while let Some(event) = inbox.try_pop() {
        if strategy.handle_event(&event)? == Dispatch::Ignored {
            warn!("{}: no handler for {:?}, dropping event", strategy.name(), event.kind());
        }
    }
    Ok(())
}
