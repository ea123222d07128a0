//! A strategy that keeps moving every benchmark to another CPU.
//!
//! Each process is pinned to a single CPU. At every tick, each process in
//! turn is moved to a free CPU and its previous CPU is released. This needs
//! a landing spot at all times, so with K managed CPUs at most K - 1
//! processes can be tracked.

use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use log::debug;
use log::info;
use log::warn;
use nix::unistd::Pid;

use crate::config::MonitorConfig;
use crate::error::Error;
use crate::exec::event::ExecEvent;
use crate::exec::monitor::Dispatch;
use crate::exec::monitor::Strategy;
use crate::monitor;
use crate::util::sched;

/// Pins a process to a CPU.
pub trait CpuBinder: Send {
    fn bind(&mut self, pid: Pid, cpu: usize) -> Result<()>;
}

/// Binds through the scheduler affinity mask.
#[derive(Debug, Default)]
pub struct SchedAffinity;

impl CpuBinder for SchedAffinity {
    fn bind(&mut self, pid: Pid, cpu: usize) -> Result<()> {
        sched::bind_process(pid, cpu)
    }
}

/// Which of the managed CPUs are occupied.
#[derive(Debug, Clone)]
pub struct CpuAllocation {
    cpus: Vec<usize>,
    allocated: Vec<bool>,
}

impl CpuAllocation {
    pub fn new(cpus: Vec<usize>) -> Self {
        let allocated = vec![false; cpus.len()];
        Self { cpus, allocated }
    }

    /// Number of managed CPUs.
    pub fn len(&self) -> usize {
        self.cpus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty()
    }

    /// Number of occupied CPUs.
    pub fn occupied(&self) -> usize {
        self.allocated.iter().filter(|a| **a).count()
    }

    /// Slot of the first free CPU.
    pub fn find_free(&self) -> Option<usize> {
        self.allocated.iter().position(|a| !a)
    }

    pub fn allocate(&mut self, slot: usize) {
        debug_assert!(!self.allocated[slot]);
        self.allocated[slot] = true;
    }

    pub fn release(&mut self, slot: usize) {
        self.allocated[slot] = false;
    }

    /// CPU number of a slot.
    pub fn cpu(&self, slot: usize) -> usize {
        self.cpus[slot]
    }
}

pub struct CpuHopper<B: CpuBinder = SchedAffinity> {
    interval: Duration,
    table: CpuAllocation,
    /// Slot currently assigned to each process.
    mapping: BTreeMap<Pid, usize>,
    binder: B,
}

impl<B: CpuBinder> CpuHopper<B> {
    /// Create a hopper over the given CPUs.
    ///
    /// # Arguments
    ///
    /// * `interval` - Time between two rounds of hops
    /// * `cpus` - The CPUs processes may be moved to
    /// * `binder` - How processes are pinned
    pub fn new(interval: Duration, cpus: Vec<usize>, binder: B) -> Result<Self> {
        if cpus.is_empty() {
            return Err(Error::InvalidConfig("the CPU hopper needs at least one CPU".to_string()).into());
        }
        let mut sorted = cpus.clone();
        sorted.sort_unstable();
        sorted.dedup();
        if sorted.len() != cpus.len() {
            return Err(Error::InvalidConfig(format!("duplicate CPUs in {cpus:?}")).into());
        }
        Ok(Self {
            interval,
            table: CpuAllocation::new(cpus),
            mapping: BTreeMap::new(),
            binder,
        })
    }

    pub fn table(&self) -> &CpuAllocation {
        &self.table
    }

    /// CPU currently assigned to a process.
    pub fn cpu_of(&self, pid: Pid) -> Option<usize> {
        self.mapping.get(&pid).map(|slot| self.table.cpu(*slot))
    }

    /// Pin a new process to a free CPU.
    ///
    /// Fails with `Error::NoFreeCpu` if that would leave no CPU free.
    pub fn add_process(&mut self, pid: Pid) -> Result<()> {
        if self.mapping.contains_key(&pid) {
            return Err(Error::DuplicateTarget(pid).into());
        }
        if self.mapping.len() + 1 >= self.table.len() {
            return Err(Error::NoFreeCpu(self.table.len()).into());
        }
        let slot = self
            .table
            .find_free()
            .ok_or(Error::NoFreeCpu(self.table.len()))?;
        info!("adding process {pid} on cpu {}", self.table.cpu(slot));
        self.bind(pid, slot);
        self.table.allocate(slot);
        self.mapping.insert(pid, slot);
        Ok(())
    }

    /// Move every process to another CPU.
    pub fn hop(&mut self) {
        let pids: Vec<Pid> = self.mapping.keys().copied().collect();
        for pid in pids {
            let old = self.mapping[&pid];
            // The old slot is still taken, so the new one differs.
            let Some(new) = self.table.find_free() else {
                warn!("no free cpu to move process {pid} to");
                continue;
            };
            debug!(
                "hopping process {pid} from cpu {} to cpu {}",
                self.table.cpu(old),
                self.table.cpu(new)
            );
            self.bind(pid, new);
            self.table.allocate(new);
            self.table.release(old);
            self.mapping.insert(pid, new);
        }
    }

    /// Failures are expected once a process has exited, and only logged.
    fn bind(&mut self, pid: Pid, slot: usize) {
        let cpu = self.table.cpu(slot);
        if let Err(e) = self.binder.bind(pid, cpu) {
            warn!("failed to bind process {pid} to cpu {cpu}: {e:#}");
        }
    }
}

impl CpuHopper<SchedAffinity> {
    fn create(config: &MonitorConfig) -> Result<Box<dyn Strategy>> {
        let cpus = match &config.cpus {
            Some(cpus) => cpus.clone(),
            None => sched::allowed_cpus()?,
        };
        Ok(Box::new(Self::new(config.sampling_length(), cpus, SchedAffinity)?))
    }
}

impl<B: CpuBinder> Strategy for CpuHopper<B> {
    fn name(&self) -> &str {
        "cpu-hopper"
    }

    fn tick(&mut self) -> Result<()> {
        thread::sleep(self.interval);
        self.hop();
        Ok(())
    }

    fn handle_event(&mut self, event: &ExecEvent) -> Result<Dispatch> {
        match event {
            ExecEvent::ProcessCreated(pid) => self.add_process(*pid)?,
        }
        Ok(Dispatch::Handled)
    }
}

monitor!("cpu-hopper" => CpuHopper::<SchedAffinity>::create);

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use anyhow::anyhow;
    use more_asserts::assert_le;
    use parking_lot::Mutex;
    use quickcheck::quickcheck;

    use super::*;
    use crate::util::process::KillMode;
    use crate::util::process::ManagedProcess;

    #[derive(Default, Clone)]
    struct RecordingBinder {
        binds: Arc<Mutex<Vec<(Pid, usize)>>>,
    }

    impl CpuBinder for RecordingBinder {
        fn bind(&mut self, pid: Pid, cpu: usize) -> Result<()> {
            self.binds.lock().push((pid, cpu));
            Ok(())
        }
    }

    struct FailingBinder;

    impl CpuBinder for FailingBinder {
        fn bind(&mut self, pid: Pid, _cpu: usize) -> Result<()> {
            Err(anyhow!("process {pid} is gone"))
        }
    }

    fn hopper(cpus: usize) -> CpuHopper<RecordingBinder> {
        CpuHopper::new(Duration::ZERO, (0..cpus).collect(), RecordingBinder::default()).unwrap()
    }

    fn pids(n: usize) -> Vec<Pid> {
        (0..n).map(|i| Pid::from_raw(1000 + i as i32)).collect()
    }

    #[test]
    fn test_capacity_is_one_less_than_cpus() -> Result<()> {
        let mut hopper = hopper(4);
        for pid in pids(3) {
            hopper.add_process(pid)?;
        }
        assert_eq!(hopper.table().occupied(), 3);

        let err = hopper.add_process(Pid::from_raw(2000)).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::NoFreeCpu(4))));
        assert_eq!(hopper.table().occupied(), 3);
        Ok(())
    }

    #[test]
    fn test_hop_moves_every_process() -> Result<()> {
        let mut hopper = hopper(4);
        for pid in pids(3) {
            hopper.add_process(pid)?;
        }
        for _ in 0..10 {
            let before: HashMap<Pid, usize> =
                pids(3).into_iter().map(|p| (p, hopper.cpu_of(p).unwrap())).collect();
            hopper.tick()?;
            for (pid, cpu) in before {
                assert_ne!(hopper.cpu_of(pid), Some(cpu));
            }
            assert_eq!(hopper.table().occupied(), 3);
        }
        Ok(())
    }

    #[test]
    fn test_binds_are_issued() -> Result<()> {
        let binder = RecordingBinder::default();
        let mut hopper = CpuHopper::new(Duration::ZERO, vec![4, 6], binder.clone())?;
        let pid = Pid::from_raw(77);
        hopper.handle_event(&ExecEvent::ProcessCreated(pid))?;
        hopper.tick()?;
        hopper.tick()?;
        assert_eq!(*binder.binds.lock(), [(pid, 4), (pid, 6), (pid, 4)]);
        Ok(())
    }

    #[test]
    fn test_bind_failures_are_not_fatal() -> Result<()> {
        let mut hopper = CpuHopper::new(Duration::ZERO, vec![0, 1, 2], FailingBinder)?;
        hopper.add_process(Pid::from_raw(1))?;
        hopper.tick()?;
        assert_eq!(hopper.table().occupied(), 1);
        Ok(())
    }

    #[test]
    fn test_invalid_cpu_sets() {
        assert!(CpuHopper::new(Duration::ZERO, vec![], FailingBinder).is_err());
        assert!(CpuHopper::new(Duration::ZERO, vec![1, 1], FailingBinder).is_err());
        assert!(hopper(1).add_process(Pid::from_raw(1)).is_err());
    }

    #[test]
    fn test_hops_real_process() -> Result<()> {
        let cpus = sched::allowed_cpus()?;
        if cpus.len() < 2 {
            return Ok(());
        }
        let p = ManagedProcess::new(
            vec!["/bin/sleep".to_string(), "5".to_string()],
            KillMode::Single,
        )?;
        let pid = p.create()?;
        let mut hopper = CpuHopper::new(Duration::ZERO, cpus, SchedAffinity)?;
        hopper.add_process(pid)?;
        let first = hopper.cpu_of(pid).unwrap();
        assert_eq!(sched::process_affinity(Some(pid))?, vec![first]);

        hopper.tick()?;
        let second = hopper.cpu_of(pid).unwrap();
        assert_ne!(first, second);
        assert_eq!(sched::process_affinity(Some(pid))?, vec![second]);
        Ok(())
    }

    quickcheck! {
        fn prop_rotation_keeps_one_cpu_free(cpus: u8, ticks: u8) -> bool {
            let cpus = (cpus % 15) as usize + 2;
            let mut hopper = hopper(cpus);
            for pid in pids(cpus - 1) {
                hopper.add_process(pid).unwrap();
            }
            for _ in 0..(ticks % 20) {
                let before: Vec<_> = pids(cpus - 1).iter().map(|p| hopper.cpu_of(*p)).collect();
                hopper.hop();
                let after: Vec<_> = pids(cpus - 1).iter().map(|p| hopper.cpu_of(*p)).collect();
                if before.iter().zip(&after).any(|(b, a)| b == a) {
                    return false;
                }
                assert_le!(hopper.table().occupied(), cpus - 1);
            }
            hopper.add_process(Pid::from_raw(1)).is_err()
        }
    }
}
