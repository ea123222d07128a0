//! CPU affinity helpers.

use anyhow::Context;
use anyhow::Result;
use nix::sched::CpuSet;
use nix::sched::sched_getaffinity;
use nix::sched::sched_setaffinity;
use nix::unistd::Pid;

/// Get the CPUs the given process is allowed to run on.
///
/// # Arguments
///
/// * `pid` - Process ID (None for the current process)
///
/// # Returns
///
/// The allowed CPU numbers, in ascending order.
pub fn process_affinity(pid: Option<Pid>) -> Result<Vec<usize>> {
    let pid = pid.unwrap_or(Pid::from_raw(0));
    let set = sched_getaffinity(pid).with_context(|| format!("failed to query affinity of {pid}"))?;
    let mut cpus = Vec::new();
    for cpu in 0..CpuSet::count() {
        if set.is_set(cpu).unwrap_or(false) {
            cpus.push(cpu);
        }
    }
    Ok(cpus)
}

/// Get the CPUs the current process may hand out to its children.
pub fn allowed_cpus() -> Result<Vec<usize>> {
    process_affinity(None)
}

/// Bind the process matching the given pid to a single CPU.
///
/// # Arguments
///
/// * `pid` - The process identifier
/// * `cpu` - The logical CPU number
pub fn bind_process(pid: Pid, cpu: usize) -> Result<()> {
    let mut set = CpuSet::new();
    set.set(cpu)
        .with_context(|| format!("cpu {cpu} is out of range"))?;
    sched_setaffinity(pid, &set)
        .with_context(|| format!("failed to bind process {pid} to cpu {cpu}"))?;
    Ok(())
}
