//! Benchmark descriptions.

use std::fmt;

use anyhow::Result;

use crate::error::Error;

/// One workload of the cohort: an ordinal id, a display name and the
/// argument vector used to run it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Benchmark {
    id: usize,
    name: String,
    args: Vec<String>,
}

impl Benchmark {
    /// Create a benchmark from an argument vector.
    ///
    /// # Arguments
    ///
    /// * `id` - Ordinal of the benchmark within its cohort
    /// * `name` - Display name
    /// * `args` - Executable path followed by its arguments
    pub fn new(id: usize, name: impl Into<String>, args: Vec<String>) -> Result<Self> {
        if args.is_empty() {
            return Err(Error::EmptyCommand.into());
        }
        Ok(Self {
            id,
            name: name.into(),
            args,
        })
    }

    /// Create a benchmark from a command line split on whitespace.
    ///
    /// There is no quoting: `"/bin/sh -c 'exit 1'"` yields four arguments.
    pub fn from_command(id: usize, name: impl Into<String>, cmd: &str) -> Result<Self> {
        Self::new(id, name, cmd.split_whitespace().map(str::to_string).collect())
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// The executable path.
    pub fn path(&self) -> &str {
        &self.args[0]
    }
}

impl fmt::Display for Benchmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (#{})", self.name, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_command() -> Result<()> {
        let b = Benchmark::from_command(2, "sleepy", "  /bin/sleep\t1  ")?;
        assert_eq!(b.id(), 2);
        assert_eq!(b.name(), "sleepy");
        assert_eq!(b.args(), ["/bin/sleep", "1"]);
        assert_eq!(b.path(), "/bin/sleep");
        assert_eq!(b.to_string(), "sleepy (#2)");
        Ok(())
    }

    #[test]
    fn test_empty_command() {
        for cmd in ["", "   ", "\t\n"] {
            let err = Benchmark::from_command(0, "empty", cmd).unwrap_err();
            assert!(matches!(err.downcast_ref::<Error>(), Some(Error::EmptyCommand)));
        }
    }
}
