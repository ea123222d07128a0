//! Child process management with start gating.

use std::ffi::CString;
use std::fmt;
use std::path::Path;
use std::ptr;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use libc::c_char;
use log::debug;
use log::info;
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::signal::kill;
use nix::sys::signal::killpg;
use nix::sys::wait::Id;
use nix::sys::wait::WaitPidFlag;
use nix::sys::wait::WaitStatus;
use nix::sys::wait::waitid;
use nix::sys::wait::waitpid;
use nix::unistd::ForkResult;
use nix::unistd::Pid;
use nix::unistd::fork;
use nix::unistd::setpgid;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use parking_lot::const_mutex;
use serde::Deserialize;

use crate::error::Error;
use crate::util::condition::Condition;
use crate::util::pipe::End;
use crate::util::pipe::Pipe;

/// Exit status of a child whose `exec` failed.
pub const EXEC_FAILED_STATUS: i32 = 127;

/// Exit status of a child whose start gate was closed without being released.
pub const GATE_CLOSED_STATUS: i32 = 126;

/// Serializes forks so that no sibling inherits the child-side pipe ends of a
/// process that is being created concurrently.
static FORK_LOCK: Mutex<()> = const_mutex(());

/// Execution state of a managed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// No OS process exists yet.
    NotStarted,
    /// The OS process exists and is held at its start gate.
    Ready,
    /// The gate was released.
    Running,
    /// A kill signal was sent; the process has not been reaped yet.
    Killed,
    /// The process was reaped and its termination status is known.
    Terminated,
}

/// What `kill` targets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KillMode {
    /// Only the process itself.
    #[default]
    Single,
    /// The process and everything in its process group.
    Tree,
}

/// How a process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    Signaled(Signal),
}

impl Termination {
    /// Whether the process exited with status zero.
    pub fn success(&self) -> bool {
        matches!(self, Termination::Exited(0))
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Exited(code) => write!(f, "exited with status {code}"),
            Termination::Signaled(signal) => write!(f, "killed by {signal}"),
        }
    }
}

/// Block until the given child terminates and reap it.
///
/// # Arguments
///
/// * `pid` - The child to wait for. It must be a child of this process.
///
/// # Returns
///
/// How the child terminated.
pub fn wait_pid(pid: Pid) -> Result<Termination> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(Termination::Exited(code)),
            Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(Termination::Signaled(signal)),
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(anyhow!("failed to wait for process {pid}: {e}")),
        }
    }
}

/// Block until the given child has terminated, leaving it unreaped.
///
/// The pid stays allocated to the zombie, so it may still be signaled.
fn wait_exited(pid: Pid) -> Result<()> {
    loop {
        match waitid(Id::Pid(pid), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(anyhow!("failed to wait for process {pid}: {e}")),
        }
    }
}

struct Inner {
    state: ProcessState,
    pid: Option<Pid>,
    /// Write end of the start gate. Writing one byte releases the child.
    gate: Option<Pipe>,
    /// Read end of the exec status pipe. EOF means the exec succeeded.
    exec_status: Option<Pipe>,
    termination: Option<Termination>,
}

/// A wrapper around a gated child process.
///
/// [`ManagedProcess::create`] forks the child, which then blocks on a private
/// pipe before replacing its image. This leaves a window in which the parent
/// can bind the pid to a CPU or attach counters to it before any benchmark
/// code runs. [`ManagedProcess::start`] releases the gate.
///
/// All methods take `&self`, so the process can be shared between the thread
/// driving its lifecycle and the thread awaiting its completion.
pub struct ManagedProcess {
    /// Executable path followed by its arguments.
    args: Vec<String>,
    kill_mode: KillMode,
    inner: Mutex<Inner>,
    /// Notified when the process leaves `Ready`.
    released: Condition,
}

impl ManagedProcess {
    /// Create a new, not yet started, process description.
    ///
    /// # Arguments
    ///
    /// * `args` - The executable path followed by its arguments
    /// * `kill_mode` - What [`ManagedProcess::kill`] targets
    pub fn new(args: Vec<String>, kill_mode: KillMode) -> Result<Self> {
        if args.is_empty() {
            return Err(Error::EmptyCommand.into());
        }
        Ok(Self {
            args,
            kill_mode,
            inner: Mutex::new(Inner {
                state: ProcessState::NotStarted,
                pid: None,
                gate: None,
                exec_status: None,
                termination: None,
            }),
            released: Condition::new(),
        })
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn kill_mode(&self) -> KillMode {
        self.kill_mode
    }

    pub fn state(&self) -> ProcessState {
        self.lock().state
    }

    /// Whether the gate has been released and the process was not killed or reaped.
    pub fn is_running(&self) -> bool {
        self.state() == ProcessState::Running
    }

    /// Return the process identifier.
    ///
    /// Only valid while an OS process is attached (`Ready`, `Running` or `Killed`).
    pub fn pid(&self) -> Result<Pid> {
        let inner = self.lock();
        match inner.state {
            ProcessState::Ready | ProcessState::Running | ProcessState::Killed => {
                inner.pid.ok_or_else(|| anyhow!("process has no pid"))
            }
            state => Err(Error::InvalidState {
                operation: "query the pid of",
                state,
            }
            .into()),
        }
    }

    /// Return the termination status. Only valid once `Terminated`.
    pub fn termination_status(&self) -> Result<Termination> {
        let inner = self.lock();
        match (inner.state, inner.termination) {
            (ProcessState::Terminated, Some(termination)) => Ok(termination),
            (state, _) => Err(Error::InvalidState {
                operation: "query the termination status of",
                state,
            }
            .into()),
        }
    }

    /// Fork the OS process and hold it at the start gate.
    ///
    /// # Returns
    ///
    /// The pid of the new process, which is now `Ready`.
    pub fn create(&self) -> Result<Pid> {
        let mut inner = self.lock();
        if inner.state != ProcessState::NotStarted {
            return Err(Error::InvalidState {
                operation: "create",
                state: inner.state,
            }
            .into());
        }

        let path = Path::new(&self.args[0]);
        if !path.exists() {
            return Err(Error::NotFound(path.to_path_buf()).into());
        }

        // Everything the child needs is prepared here: it must not allocate.
        let c_args = self
            .args
            .iter()
            .map(|arg| CString::new(arg.as_str()))
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("argument of {} contains a NUL byte", self.args[0]))?;
        let mut argv: Vec<*const c_char> = c_args.iter().map(|arg| arg.as_ptr()).collect();
        argv.push(ptr::null());
        let new_group = self.kill_mode == KillMode::Tree;

        let _fork_guard = FORK_LOCK.lock();
        let mut gate = Pipe::new()?;
        let mut exec_status = Pipe::new()?;

        match unsafe { fork() }.with_context(|| "failed to fork")? {
            ForkResult::Child => unsafe { gated_exec(&gate, &exec_status, &argv, new_group) },
            ForkResult::Parent { child } => {
                if new_group {
                    // Also done by the child; whichever runs first wins.
                    let _ = setpgid(child, child);
                }
                gate.close(End::Read);
                exec_status.close(End::Write);

                inner.pid = Some(child);
                inner.gate = Some(gate);
                inner.exec_status = Some(exec_status);
                inner.state = ProcessState::Ready;
                debug!("created process {child} for {}", self.args[0]);
                Ok(child)
            }
        }
    }

    /// Release the start gate, letting the child execute the command.
    ///
    /// Returns `Error::ExecFailed` if the child could not replace its image.
    /// In that case the child has already exited and the process is still
    /// `Running` until it is reaped.
    pub fn start(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.state != ProcessState::Ready {
            return Err(Error::InvalidState {
                operation: "start",
                state: inner.state,
            }
            .into());
        }
        let pid = inner.pid.ok_or_else(|| anyhow!("process has no pid"))?;
        let gate = inner.gate.take().ok_or_else(|| anyhow!("start gate already used"))?;
        let exec_status = inner
            .exec_status
            .take()
            .ok_or_else(|| anyhow!("exec status pipe already used"))?;
        inner.state = ProcessState::Running;
        self.released.notify();

        gate.write(&[1])
            .with_context(|| format!("failed to release process {pid}"))?;
        drop(gate);

        let mut buf = [0u8; 4];
        let mut len = 0;
        while len < buf.len() {
            let n = exec_status.read(&mut buf[len..])?;
            if n == 0 {
                break;
            }
            len += n;
        }
        if len == buf.len() {
            return Err(Error::ExecFailed {
                path: self.args[0].clone(),
                errno: Errno::from_raw(i32::from_ne_bytes(buf)),
            }
            .into());
        }

        info!("started process {pid}: {}", self.args.join(" "));
        Ok(())
    }

    /// Block until the process terminates, and reap it.
    ///
    /// Only valid while `Running` or `Killed`.
    pub fn wait(&self) -> Result<Termination> {
        let pid = {
            let inner = self.lock();
            match inner.state {
                ProcessState::Running | ProcessState::Killed => {
                    inner.pid.ok_or_else(|| anyhow!("process has no pid"))?
                }
                state => {
                    return Err(Error::InvalidState {
                        operation: "wait for",
                        state,
                    }
                    .into());
                }
            }
        };

        // The lock is not held here so that kill() stays available.
        wait_exited(pid)?;

        // Reaping frees the pid; kill() signals under the same lock.
        let mut inner = self.lock();
        if let (ProcessState::Terminated, Some(termination)) = (inner.state, inner.termination) {
            return Ok(termination);
        }
        let termination = wait_pid(pid)?;
        inner.termination = Some(termination);
        inner.state = ProcessState::Terminated;
        debug!("process {pid} {termination}");
        Ok(termination)
    }

    /// Block until the process terminates, first waiting for it to be released.
    ///
    /// Unlike [`ManagedProcess::wait`] this may be called while the process is
    /// still `Ready`, and returns the recorded status if it was already reaped.
    pub fn await_termination(&self) -> Result<Termination> {
        loop {
            match self.state() {
                ProcessState::Ready => self.released.wait(),
                ProcessState::Running | ProcessState::Killed => return self.wait(),
                ProcessState::Terminated => return self.termination_status(),
                state => {
                    return Err(Error::InvalidState {
                        operation: "await",
                        state,
                    }
                    .into());
                }
            }
        }
    }

    /// Send SIGKILL to the process, or to its whole group in `Tree` mode.
    ///
    /// Valid from `Ready` and `Running`; a no-op once `Killed` or `Terminated`.
    /// The state moves to `Killed` even if sending the signal fails.
    pub fn kill(&self) -> Result<()> {
        let mut inner = self.lock();
        match inner.state {
            ProcessState::Ready | ProcessState::Running => {}
            ProcessState::Killed | ProcessState::Terminated => return Ok(()),
            state => {
                return Err(Error::InvalidState {
                    operation: "kill",
                    state,
                }
                .into());
            }
        }
        inner.state = ProcessState::Killed;
        let pid = inner.pid.ok_or_else(|| anyhow!("process has no pid"))?;
        self.released.notify();

        // The lock is held until the signal is sent so that the pid cannot be
        // reaped, and then reused, in between.
        debug!("killing process {pid} ({:?})", self.kill_mode);
        let sent = match self.kill_mode {
            KillMode::Single => kill(pid, Signal::SIGKILL)
                .with_context(|| format!("failed to kill process {pid}")),
            KillMode::Tree => killpg(pid, Signal::SIGKILL)
                .with_context(|| format!("failed to kill process group {pid}")),
        };
        drop(inner);
        sent
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock()
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        // Never leave an orphan behind.
        if matches!(self.state(), ProcessState::Ready | ProcessState::Running) {
            let _ = self.kill();
        }
        if self.state() == ProcessState::Killed {
            let _ = self.wait();
        }
    }
}

/// Body of the forked child: wait at the gate, then exec.
///
/// # Safety
///
/// Must only be called in a freshly forked child. Only async-signal-safe
/// functions are used since the parent may be multi-threaded.
unsafe fn gated_exec(gate: &Pipe, exec_status: &Pipe, argv: &[*const c_char], new_group: bool) -> ! {
    unsafe {
        if new_group {
            libc::setpgid(0, 0);
        }
        if let Some(fd) = gate.raw_fd(End::Write) {
            libc::close(fd);
        }
        if let Some(fd) = exec_status.raw_fd(End::Read) {
            libc::close(fd);
        }
        let gate_fd = gate.raw_fd(End::Read).unwrap_or(-1);
        let status_fd = exec_status.raw_fd(End::Write).unwrap_or(-1);

        let mut byte = 0u8;
        let n = loop {
            let n = libc::read(gate_fd, (&mut byte as *mut u8).cast(), 1);
            if n == -1 && Errno::last() == Errno::EINTR {
                continue;
            }
            break n;
        };
        if n != 1 {
            libc::_exit(GATE_CLOSED_STATUS);
        }

        libc::execv(argv[0], argv.as_ptr());

        let errno = (Errno::last() as i32).to_ne_bytes();
        libc::write(status_fd, errno.as_ptr().cast(), errno.len());
        libc::_exit(EXEC_FAILED_STATUS);
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::thread;
    use std::time::Duration;

    use procfs::process::Process;

    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn error_of<T>(result: Result<T>) -> Error {
        result
            .err()
            .expect("expected an error")
            .downcast::<Error>()
            .expect("expected a typed error")
    }

    #[test]
    fn test_not_started_after_construction() {
        let p = ManagedProcess::new(vec!["foo".to_string()], KillMode::Single).unwrap();
        assert_eq!(p.state(), ProcessState::NotStarted);
        assert!(!p.is_running());
        assert!(p.pid().is_err());
        assert!(p.termination_status().is_err());
    }

    #[test]
    fn test_args_are_not_empty() {
        assert!(matches!(
            error_of(ManagedProcess::new(vec![], KillMode::Single)),
            Error::EmptyCommand
        ));
    }

    #[test]
    fn test_path_exists() {
        let p = ManagedProcess::new(vec!["/does/not/exist".to_string()], KillMode::Single).unwrap();
        assert!(matches!(error_of(p.create()), Error::NotFound(_)));
        assert_eq!(p.state(), ProcessState::NotStarted);
    }

    #[test]
    fn test_simple() -> Result<()> {
        let p = ManagedProcess::new(sh("exit 3"), KillMode::Single)?;
        let pid = p.create()?;
        assert_eq!(p.state(), ProcessState::Ready);
        assert_eq!(p.pid()?, pid);
        p.start()?;
        assert!(p.is_running());
        assert_eq!(p.wait()?, Termination::Exited(3));
        assert_eq!(p.state(), ProcessState::Terminated);
        assert_eq!(p.termination_status()?, Termination::Exited(3));
        assert!(p.pid().is_err());
        Ok(())
    }

    #[test]
    fn test_cannot_wait_before_start() -> Result<()> {
        let p = ManagedProcess::new(sh("true"), KillMode::Single)?;
        assert!(matches!(error_of(p.wait()), Error::InvalidState { .. }));
        p.create()?;
        assert!(matches!(error_of(p.wait()), Error::InvalidState { .. }));
        Ok(())
    }

    #[test]
    fn test_cannot_start_twice_or_wait_twice() -> Result<()> {
        let p = ManagedProcess::new(sh("true"), KillMode::Single)?;
        p.create()?;
        p.start()?;
        assert!(p.start().is_err());
        assert!(p.wait()?.success());
        assert!(matches!(error_of(p.wait()), Error::InvalidState { .. }));
        Ok(())
    }

    #[test]
    fn test_kill_never_started() {
        let p = ManagedProcess::new(sh("true"), KillMode::Single).unwrap();
        assert!(matches!(error_of(p.kill()), Error::InvalidState { .. }));
    }

    #[test]
    fn test_kill_is_idempotent() -> Result<()> {
        let p = ManagedProcess::new(sh("sleep 10"), KillMode::Single)?;
        p.create()?;
        p.start()?;
        p.kill()?;
        assert_eq!(p.state(), ProcessState::Killed);
        p.kill()?;
        assert_eq!(p.wait()?, Termination::Signaled(Signal::SIGKILL));
        p.kill()?;
        assert_eq!(p.state(), ProcessState::Terminated);
        Ok(())
    }

    #[test]
    fn test_kill_ready_process() -> Result<()> {
        let p = ManagedProcess::new(sh("true"), KillMode::Single)?;
        p.create()?;
        p.kill()?;
        assert_eq!(p.wait()?, Termination::Signaled(Signal::SIGKILL));
        assert!(p.start().is_err());
        Ok(())
    }

    #[test]
    fn test_gate_holds_child() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let marker = dir.path().join("started");
        let p = ManagedProcess::new(
            sh(&format!("echo process_started > {}", marker.display())),
            KillMode::Single,
        )?;
        let pid = p.create()?;

        thread::sleep(Duration::from_millis(300));
        assert!(!marker.exists());
        // Still the forked image of this test binary.
        let exe = Process::new(pid.as_raw())?.exe()?;
        assert_eq!(exe, std::env::current_exe()?);

        p.start()?;
        assert!(p.wait()?.success());
        assert!(marker.exists());
        Ok(())
    }

    #[test]
    fn test_exec_failure_is_reported() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let script = dir.path().join("not-executable");
        fs::write(&script, "#!/bin/sh\ntrue\n")?;
        fs::set_permissions(&script, fs::Permissions::from_mode(0o644))?;

        let p = ManagedProcess::new(vec![script.display().to_string()], KillMode::Single)?;
        p.create()?;
        match error_of(p.start()) {
            Error::ExecFailed { errno, .. } => assert_eq!(errno, Errno::EACCES),
            e => panic!("unexpected error: {e}"),
        }
        assert_eq!(p.wait()?, Termination::Exited(EXEC_FAILED_STATUS));
        Ok(())
    }

    #[test]
    fn test_kill_tree() -> Result<()> {
        // The grandchild writes the marker unless the whole group dies first.
        let dir = tempfile::tempdir()?;
        let marker = dir.path().join("kill_tree_failed");
        let p = ManagedProcess::new(
            sh(&format!(
                "/bin/sh -c 'sleep 1; echo kill_tree_failed > {}'; true",
                marker.display()
            )),
            KillMode::Tree,
        )?;
        p.create()?;
        p.start()?;
        thread::sleep(Duration::from_millis(300));

        p.kill()?;
        assert_eq!(p.wait()?, Termination::Signaled(Signal::SIGKILL));
        thread::sleep(Duration::from_millis(1500));
        assert!(!marker.exists());
        Ok(())
    }

    #[test]
    fn test_drop_reaps_running_process() -> Result<()> {
        let p = ManagedProcess::new(sh("sleep 10"), KillMode::Single)?;
        let pid = p.create()?;
        p.start()?;
        drop(p);
        // Killed and reaped: the pid no longer exists, not even as a zombie.
        assert_eq!(kill(pid, None), Err(Errno::ESRCH));
        Ok(())
    }

    #[test]
    fn test_kill_while_exiting_process_is_reaped() -> Result<()> {
        // The child exits on its own while another thread reaps it. Killing
        // it at any point of that must never signal a reaped pid.
        for i in 0..50 {
            let p = std::sync::Arc::new(ManagedProcess::new(
                vec!["/bin/true".to_string()],
                KillMode::Tree,
            )?);
            p.create()?;
            p.start()?;
            let waiter = {
                let p = p.clone();
                thread::spawn(move || p.wait())
            };
            thread::sleep(Duration::from_micros(i * 40));
            p.kill()?;
            let termination = waiter.join().unwrap()?;
            assert!(matches!(
                termination,
                Termination::Exited(0) | Termination::Signaled(Signal::SIGKILL)
            ));
            assert_eq!(p.state(), ProcessState::Terminated);
        }
        Ok(())
    }

    #[test]
    fn test_await_termination_waits_for_release() -> Result<()> {
        let p = std::sync::Arc::new(ManagedProcess::new(sh("exit 5"), KillMode::Single)?);
        p.create()?;
        let waiter = {
            let p = p.clone();
            thread::spawn(move || p.await_termination())
        };
        thread::sleep(Duration::from_millis(100));
        assert!(!waiter.is_finished());
        p.start()?;
        assert_eq!(waiter.join().unwrap()?, Termination::Exited(5));
        assert_eq!(p.await_termination()?, Termination::Exited(5));
        Ok(())
    }
}
