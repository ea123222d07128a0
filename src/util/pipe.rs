//! Anonymous pipes used as rendezvous channels between a parent and its child.

use std::os::fd::AsRawFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use nix::errno::Errno;
use nix::fcntl::OFlag;

/// One of the two ends of a pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum End {
    Read,
    Write,
}

/// A unidirectional pipe.
///
/// Both ends are created close-on-exec, so neither leaks into a program
/// started with `exec`. Each end is closed when dropped, or earlier through
/// [`Pipe::close`].
#[derive(Debug)]
pub struct Pipe {
    /// The read end of the pipe.
    read_fd: Option<OwnedFd>,

    /// The write end of the pipe.
    write_fd: Option<OwnedFd>,
}

impl Pipe {
    /// Create a new pipe.
    pub fn new() -> Result<Self> {
        let (read_fd, write_fd) =
            nix::unistd::pipe2(OFlag::O_CLOEXEC).with_context(|| "failed to create pipe")?;

        Ok(Self {
            read_fd: Some(read_fd),
            write_fd: Some(write_fd),
        })
    }

    /// Check whether the given end is still open.
    pub fn is_open(&self, end: End) -> bool {
        self.fd(end).is_some()
    }

    /// Close the given end. Closing an end twice is a no-op.
    pub fn close(&mut self, end: End) {
        match end {
            End::Read => drop(self.read_fd.take()),
            End::Write => drop(self.write_fd.take()),
        }
    }

    /// Return the raw descriptor of the given end, if it is open.
    ///
    /// This exists for the forked child, which must not touch anything
    /// that allocates or drops.
    pub fn raw_fd(&self, end: End) -> Option<RawFd> {
        self.fd(end).map(|fd| fd.as_raw_fd())
    }

    /// Read from the pipe.
    ///
    /// # Arguments
    ///
    /// * `buf` - Buffer where the data is placed
    ///
    /// # Returns
    ///
    /// The number of bytes actually read. Zero means that every write end
    /// has been closed.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let fd = self
            .read_fd
            .as_ref()
            .ok_or_else(|| anyhow!("read end of the pipe is closed"))?;
        loop {
            match nix::unistd::read(fd.as_raw_fd(), buf) {
                Err(Errno::EINTR) => continue,
                result => return result.with_context(|| "failed to read from pipe"),
            }
        }
    }

    /// Write to the pipe.
    ///
    /// # Arguments
    ///
    /// * `buf` - Data to write
    ///
    /// # Returns
    ///
    /// The number of bytes actually written.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let fd = self
            .write_fd
            .as_ref()
            .ok_or_else(|| anyhow!("write end of the pipe is closed"))?;
        loop {
            match nix::unistd::write(fd, buf) {
                Err(Errno::EINTR) => continue,
                result => return result.with_context(|| "failed to write to pipe"),
            }
        }
    }

    fn fd(&self, end: End) -> Option<&OwnedFd> {
        match end {
            End::Read => self.read_fd.as_ref(),
            End::Write => self.write_fd.as_ref(),
        }
    }
}
