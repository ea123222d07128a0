//! Lookup of execution monitor strategies by name.
//!
//! Strategies register themselves with the [`monitor!`](crate::monitor)
//! macro and are instantiated from the `type` key of the monitor
//! configuration.

use anyhow::Result;

use crate::config::MonitorConfig;
use crate::error::Error;
use crate::exec::monitor::Strategy;

#[derive(Debug)]
pub struct MonitorRegistration {
    pub key: &'static str,
    pub create: fn(&MonitorConfig) -> Result<Box<dyn Strategy>>,
}

inventory::collect!(MonitorRegistration);

/// Register a strategy constructor under one or more keys.
#[macro_export]
macro_rules! monitor {
    ($($key:expr),+ => $create:path) => {
        $(
            inventory::submit! {
                $crate::exec::registry::MonitorRegistration {
                    key: $key,
                    create: $create,
                }
            }
        )+
    };
}

/// Instantiate the strategy named by `config.kind`.
pub fn create(config: &MonitorConfig) -> Result<Box<dyn Strategy>> {
    let registration = inventory::iter::<MonitorRegistration>
        .into_iter()
        .find(|r| r.key == config.kind)
        .ok_or_else(|| Error::UnknownMonitor(config.kind.clone()))?;
    (registration.create)(config)
}

/// All registered keys, sorted.
pub fn keys() -> Vec<&'static str> {
    let mut keys: Vec<_> = inventory::iter::<MonitorRegistration>
        .into_iter()
        .map(|r| r.key)
        .collect();
    keys.sort_unstable();
    keys
}
