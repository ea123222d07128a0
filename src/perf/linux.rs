//! Counters backed by the Linux `perf_event_open` interface.

use std::os::fd::AsRawFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use nix::errno::Errno;
use nix::unistd::Pid;
use perf_event_open_sys::bindings as perf;

use crate::perf::event::Counter;
use crate::perf::event::EventInfo;
use crate::perf::event::EventType;
use crate::perf::event::Modifiers;
use crate::perf::event::RawCount;

/// A hardware counter opened with `perf_event_open`.
///
/// The counter follows the target's future children, and is read with the
/// enabled and running times so that multiplexing can be compensated for.
#[derive(Debug, Default)]
pub struct LinuxCounter {
    fd: Option<OwnedFd>,
}

impl Counter for LinuxCounter {
    fn open(&mut self, info: &EventInfo, pid: Pid, attach: bool) -> Result<()> {
        let mut attr = perf::perf_event_attr::default();
        attr.size = core::mem::size_of_val(&attr) as u32;
        attr.type_ = match info.kind {
            EventType::Hardware => perf::PERF_TYPE_HARDWARE,
            EventType::Raw => perf::PERF_TYPE_RAW,
        };
        attr.config = info.code;
        attr.read_format = u64::from(
            perf::PERF_FORMAT_TOTAL_TIME_ENABLED
                | perf::PERF_FORMAT_TOTAL_TIME_RUNNING,
        );
        attr.set_exclude_user(info.modifiers.contains(Modifiers::EXCLUDE_USER).into());
        attr.set_exclude_kernel(info.modifiers.contains(Modifiers::EXCLUDE_KERNEL).into());
        attr.set_exclude_hv(info.modifiers.contains(Modifiers::EXCLUDE_HV).into());
        attr.set_inherit(1);
        // Without attaching, counting starts when the gated child execs.
        attr.set_disabled((!attach).into());
        attr.set_enable_on_exec((!attach).into());

        let cpu: libc::c_int = -1;
        let group_fd: libc::c_int = -1;
        let flags = perf::PERF_FLAG_FD_CLOEXEC;
        let fd = Errno::result(unsafe {
            libc::syscall(libc::SYS_perf_event_open, &attr, pid.as_raw(), cpu, group_fd, flags)
        })
        .with_context(|| format!("failed to open {info:?} on process {pid}"))?;

        // The descriptor is fresh and owned by nobody else.
        self.fd = Some(unsafe { OwnedFd::from_raw_fd(fd as libc::c_int) });
        Ok(())
    }

    fn read(&mut self) -> Result<RawCount> {
        let fd = self.fd.as_ref().ok_or_else(|| anyhow!("counter is not open"))?;
        let mut buf = [0u64; 3];
        let expected = core::mem::size_of_val(&buf);
        let n = Errno::result(unsafe {
            libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), expected)
        })
        .with_context(|| "failed to read counter")?;
        if n as usize != expected {
            return Err(anyhow!("short counter read: {n} of {expected} bytes"));
        }
        Ok(RawCount {
            value: buf[0],
            enabled: buf[1],
            running: buf[2],
        })
    }

    fn close(&mut self) -> Result<()> {
        drop(self.fd.take());
        Ok(())
    }
}
