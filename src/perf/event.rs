//! Performance event descriptors and sample scaling.

use anyhow::Result;
use log::debug;
use nix::unistd::Pid;
use perf_event_open_sys::bindings as perf;
use serde::Deserialize;

use crate::error::Error;

/// How an event code is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// A generic hardware event, such as cycles.
    Hardware,
    /// A raw, model-specific event code.
    Raw,
}

/// Privilege levels excluded from counting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Modifiers(u8);

impl Modifiers {
    pub const EXCLUDE_NONE: Modifiers = Modifiers(0);
    pub const EXCLUDE_USER: Modifiers = Modifiers(1);
    pub const EXCLUDE_KERNEL: Modifiers = Modifiers(2);
    pub const EXCLUDE_HV: Modifiers = Modifiers(4);

    const ALL: u8 = 1 | 2 | 4;

    /// Build modifiers from raw bits, rejecting unknown bits.
    pub fn from_bits(bits: u8) -> Result<Self> {
        if bits & !Self::ALL != 0 {
            return Err(Error::InvalidModifiers(bits).into());
        }
        Ok(Modifiers(bits))
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: Modifiers) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_valid(self) -> bool {
        self.0 & !Self::ALL == 0
    }
}

impl std::ops::BitOr for Modifiers {
    type Output = Modifiers;

    fn bitor(self, rhs: Modifiers) -> Modifiers {
        Modifiers(self.0 | rhs.0)
    }
}

/// Everything needed to open one counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventInfo {
    pub kind: EventType,
    pub code: u64,
    pub modifiers: Modifiers,
}

impl EventInfo {
    pub fn hardware(code: u64) -> Self {
        Self {
            kind: EventType::Hardware,
            code,
            modifiers: Modifiers::EXCLUDE_NONE,
        }
    }

    pub fn raw(code: u64) -> Self {
        Self {
            kind: EventType::Raw,
            code,
            modifiers: Modifiers::EXCLUDE_NONE,
        }
    }
}

/// Event codes for the platform-independent events of one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenericEvents {
    pub cycles: u64,
    pub instructions: u64,
}

impl GenericEvents {
    /// Cycles and instructions, in that order.
    pub fn all(&self) -> Vec<EventInfo> {
        vec![
            EventInfo::hardware(self.cycles),
            EventInfo::hardware(self.instructions),
        ]
    }
}

/// Resolve the generic events for a counter backend.
///
/// # Arguments
///
/// * `backend` - Backend name, `linux` or `dummy`
pub fn generic_events(backend: &str) -> Result<GenericEvents> {
    match backend {
        "linux" => Ok(GenericEvents {
            cycles: perf::PERF_COUNT_HW_CPU_CYCLES.into(),
            instructions: perf::PERF_COUNT_HW_INSTRUCTIONS.into(),
        }),
        "dummy" => Ok(GenericEvents {
            cycles: 0,
            instructions: 0,
        }),
        _ => Err(Error::UnknownBackend(backend.to_string()).into()),
    }
}

/// Whether samples cover the last interval or everything since open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadMode {
    /// Each sample covers the time since the previous read.
    #[default]
    Relative,
    /// Each sample covers the time since the counter was opened.
    Aggregated,
}

/// A raw counter reading: the count and the time the counter was enabled
/// and actually running on the PMU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawCount {
    pub value: u64,
    pub enabled: u64,
    pub running: u64,
}

/// A scaled counter sample.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Sample {
    /// Count extrapolated to the whole enabled time.
    pub value: f64,
    /// Fraction of the enabled time the counter was running.
    pub scaling: f64,
    /// Whether the counter was enabled at all.
    pub enabled: bool,
}

/// A counter backend.
pub trait Counter: Send {
    /// Open the counter on a process.
    ///
    /// # Arguments
    ///
    /// * `info` - The event to count
    /// * `pid` - The process to count for (its future children included)
    /// * `attach` - Count right away if true, otherwise from the next exec
    fn open(&mut self, info: &EventInfo, pid: Pid, attach: bool) -> Result<()>;

    /// Read the cumulative count since open.
    fn read(&mut self) -> Result<RawCount>;

    /// Release the counter. Closing a closed counter is a no-op.
    fn close(&mut self) -> Result<()>;
}

/// One counter of one process, with the state needed to scale its readings.
pub struct Event<C: Counter> {
    info: EventInfo,
    counter: C,
    count: RawCount,
    prev: RawCount,
}

impl<C: Counter> Event<C> {
    pub fn new(info: EventInfo, counter: C) -> Result<Self> {
        if !info.modifiers.is_valid() {
            return Err(Error::InvalidModifiers(info.modifiers.bits()).into());
        }
        Ok(Self {
            info,
            counter,
            count: RawCount::default(),
            prev: RawCount::default(),
        })
    }

    pub fn info(&self) -> &EventInfo {
        &self.info
    }

    pub fn counter(&self) -> &C {
        &self.counter
    }

    pub fn open(&mut self, pid: Pid, attach: bool) -> Result<()> {
        self.counter.open(&self.info, pid, attach)
    }

    /// Take a new reading from the backend.
    pub fn read(&mut self) -> Result<()> {
        self.count = self.counter.read()?;
        Ok(())
    }

    /// Scale the latest reading.
    ///
    /// The count is extrapolated by the fraction of enabled time during
    /// which the counter actually ran, to account for PMU multiplexing.
    pub fn scale(&mut self, mode: ReadMode) -> Result<Sample> {
        let RawCount {
            mut value,
            mut enabled,
            mut running,
        } = self.count;
        debug!("value: {value}, enabled: {enabled}, running: {running}");

        if running > enabled {
            return Err(Error::CounterOverrun { running, enabled }.into());
        }
        if running == 0 && value != self.prev.value {
            return Err(Error::CounterDrift {
                previous: self.prev.value,
                value,
            }
            .into());
        }

        if mode == ReadMode::Relative {
            value = value.saturating_sub(self.prev.value);
            enabled = enabled.saturating_sub(self.prev.enabled);
            running = running.saturating_sub(self.prev.running);
            self.prev = self.count;
        }

        if running == 0 {
            return Ok(Sample {
                value: 0.0,
                scaling: 0.0,
                enabled: enabled > 0,
            });
        }

        let scaling = running as f64 / enabled as f64;
        Ok(Sample {
            value: value as f64 / scaling,
            scaling,
            enabled: true,
        })
    }

    pub fn close(&mut self) -> Result<()> {
        self.counter.close()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;

    use super::*;

    /// A backend replaying a fixed list of readings.
    #[derive(Default)]
    pub(crate) struct ScriptedCounter {
        pub(crate) reads: VecDeque<RawCount>,
        pub(crate) opened: Option<(EventInfo, Pid, bool)>,
    }

    impl ScriptedCounter {
        pub(crate) fn new(reads: impl IntoIterator<Item = RawCount>) -> Self {
            Self {
                reads: reads.into_iter().collect(),
                opened: None,
            }
        }
    }

    impl Counter for ScriptedCounter {
        fn open(&mut self, info: &EventInfo, pid: Pid, attach: bool) -> Result<()> {
            self.opened = Some((*info, pid, attach));
            Ok(())
        }

        fn read(&mut self) -> Result<RawCount> {
            self.reads
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("script exhausted"))
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    pub(crate) fn count(value: u64, enabled: u64, running: u64) -> RawCount {
        RawCount {
            value,
            enabled,
            running,
        }
    }

    fn event(reads: Vec<RawCount>) -> Event<ScriptedCounter> {
        Event::new(EventInfo::hardware(0), ScriptedCounter::new(reads)).unwrap()
    }

    fn counter_error(result: Result<Sample>) -> Error {
        result.unwrap_err().downcast::<Error>().unwrap()
    }

    #[test]
    fn test_relative_mode_reports_constant_deltas() -> Result<()> {
        let reads = (1..=5).map(|i| count(3000 * i, 1000 * i, 500 * i)).collect();
        let mut e = event(reads);
        for _ in 0..5 {
            e.read()?;
            let sample = e.scale(ReadMode::Relative)?;
            assert_eq!(sample.scaling, 0.5);
            assert_eq!(sample.value, 6000.0);
            assert!(sample.enabled);
        }
        Ok(())
    }

    #[test]
    fn test_aggregated_mode_accumulates() -> Result<()> {
        let reads = (1..=3).map(|i| count(100 * i, 10 * i, 10 * i)).collect();
        let mut e = event(reads);
        for i in 1..=3 {
            e.read()?;
            let sample = e.scale(ReadMode::Aggregated)?;
            assert_eq!(sample.scaling, 1.0);
            assert_eq!(sample.value, 100.0 * i as f64);
        }
        Ok(())
    }

    #[test]
    fn test_not_running() -> Result<()> {
        let mut e = event(vec![count(0, 0, 0), count(0, 50, 0)]);
        e.read()?;
        assert_eq!(
            e.scale(ReadMode::Relative)?,
            Sample {
                value: 0.0,
                scaling: 0.0,
                enabled: false
            }
        );
        e.read()?;
        let sample = e.scale(ReadMode::Relative)?;
        assert_eq!(sample.value, 0.0);
        assert!(sample.enabled);
        Ok(())
    }

    #[test]
    fn test_running_longer_than_enabled() -> Result<()> {
        let mut e = event(vec![count(10, 5, 6)]);
        e.read()?;
        assert!(matches!(
            counter_error(e.scale(ReadMode::Aggregated)),
            Error::CounterOverrun {
                running: 6,
                enabled: 5
            }
        ));
        Ok(())
    }

    #[test]
    fn test_counting_without_running() -> Result<()> {
        let mut e = event(vec![count(10, 5, 0)]);
        e.read()?;
        let err = counter_error(e.scale(ReadMode::Relative));
        assert!(err.is_counter_invariant());
        assert!(matches!(err, Error::CounterDrift { previous: 0, value: 10 }));
        Ok(())
    }

    #[test]
    fn test_modifiers() {
        let m = Modifiers::EXCLUDE_USER | Modifiers::EXCLUDE_HV;
        assert!(m.contains(Modifiers::EXCLUDE_HV));
        assert!(!m.contains(Modifiers::EXCLUDE_KERNEL));
        assert_eq!(Modifiers::from_bits(7).unwrap().bits(), 7);
        assert!(Modifiers::from_bits(8).is_err());

        let info = EventInfo {
            modifiers: Modifiers(0x10),
            ..EventInfo::raw(0x1c2)
        };
        assert!(Event::new(info, ScriptedCounter::default()).is_err());
    }

    #[test]
    fn test_generic_events() -> Result<()> {
        let linux = generic_events("linux")?;
        // Generic hardware ids from the kernel ABI.
        assert_eq!(linux.cycles, 0);
        assert_eq!(linux.instructions, 1);
        assert_eq!(generic_events("dummy")?.all().len(), 2);
        assert!(generic_events("windows").is_err());
        Ok(())
    }
}
