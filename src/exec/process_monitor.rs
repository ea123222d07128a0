//! Waiting for the first of many processes to terminate.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use log::debug;
use nix::unistd::Pid;

use crate::error::Error;
use crate::util::process::ManagedProcess;
use crate::util::process::Termination;
use crate::util::process::wait_pid;
use crate::util::queue::ConcurrentQueue;

/// Something whose termination can be awaited from another thread.
pub trait Waitable: Send + Sync + 'static {
    fn pid(&self) -> Result<Pid>;

    /// Block until the target terminates, and return how it terminated.
    fn await_termination(&self) -> Result<Termination>;
}

impl Waitable for ManagedProcess {
    fn pid(&self) -> Result<Pid> {
        ManagedProcess::pid(self)
    }

    fn await_termination(&self) -> Result<Termination> {
        ManagedProcess::await_termination(self)
    }
}

/// Tracks a dynamic set of processes and reports them as they terminate.
///
/// Every tracked target is awaited by its own thread, which publishes the
/// pid on a shared queue once the target is gone. Callers block on that
/// queue only, whatever the number of targets.
pub struct ProcessMonitor<P: Waitable = ManagedProcess> {
    waiters: HashMap<Pid, JoinHandle<Result<Termination>>>,
    ended: Arc<ConcurrentQueue<Pid>>,
    _target: std::marker::PhantomData<fn(Arc<P>)>,
}

impl<P: Waitable> Default for ProcessMonitor<P> {
    fn default() -> Self {
        Self {
            waiters: HashMap::new(),
            ended: Arc::new(ConcurrentQueue::new()),
            _target: std::marker::PhantomData,
        }
    }
}

impl<P: Waitable> ProcessMonitor<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a process.
    ///
    /// Fails with `Error::DuplicateTarget` if its pid is already tracked.
    pub fn add(&mut self, process: Arc<P>) -> Result<()> {
        let pid = process.pid()?;
        self.spawn_waiter(pid, move || process.await_termination())
    }

    /// Track a raw child pid, reaped with `waitpid`.
    ///
    /// Fails with `Error::DuplicateTarget` if the pid is already tracked.
    pub fn add_pid(&mut self, pid: Pid) -> Result<()> {
        self.spawn_waiter(pid, move || wait_pid(pid))
    }

    fn spawn_waiter<F>(&mut self, pid: Pid, wait: F) -> Result<()>
    where
        F: FnOnce() -> Result<Termination> + Send + 'static,
    {
        if self.waiters.contains_key(&pid) {
            return Err(Error::DuplicateTarget(pid).into());
        }
        let ended = self.ended.clone();
        let handle = thread::Builder::new()
            .name(format!("wait-{pid}"))
            .spawn(move || {
                debug!("waiting for process {pid}");
                let result = wait();
                // Published even on failure, so that nobody blocks forever.
                ended.push(pid);
                result
            })
            .with_context(|| format!("failed to spawn waiter for process {pid}"))?;
        self.waiters.insert(pid, handle);
        Ok(())
    }

    /// Block until a tracked process terminates, and stop tracking it.
    ///
    /// # Returns
    ///
    /// The pid of the process and how it terminated. If awaiting the process
    /// failed, the error is returned and the process is no longer tracked.
    pub fn wait_for_any(&mut self) -> Result<(Pid, Termination)> {
        if self.waiters.is_empty() {
            return Err(anyhow!("no process is being monitored"));
        }
        let pid = self.ended.pop();
        self.collect(pid)
    }

    /// Like [`ProcessMonitor::wait_for_any`], giving up after `timeout`.
    ///
    /// # Returns
    ///
    /// `None` if no process terminated in time.
    pub fn wait_for_any_timeout(&mut self, timeout: Duration) -> Result<Option<(Pid, Termination)>> {
        if self.waiters.is_empty() {
            return Err(anyhow!("no process is being monitored"));
        }
        match self.ended.pop_timeout(timeout) {
            Some(pid) => self.collect(pid).map(Some),
            None => Ok(None),
        }
    }

    fn collect(&mut self, pid: Pid) -> Result<(Pid, Termination)> {
        let handle = self
            .waiters
            .remove(&pid)
            .ok_or_else(|| anyhow!("untracked process {pid} reported as ended"))?;
        debug!("wait_for_any: {pid} finished");
        let termination = handle
            .join()
            .map_err(|_| anyhow!("waiter of process {pid} panicked"))?
            .with_context(|| format!("failed to wait for process {pid}"))?;
        Ok((pid, termination))
    }

    /// Number of processes still tracked.
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.waiters.contains_key(&pid)
    }
}

impl<P: Waitable> Drop for ProcessMonitor<P> {
    fn drop(&mut self) {
        for (_, handle) in self.waiters.drain() {
            let _ = handle.join();
        }
    }
}
