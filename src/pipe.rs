//! Fast tracee memory transfers, relayed through a pair of pipes.
//!
//! To load, the tracee is made to `write()` the range into a pipe while the tracer reads
//! the other end. To store, the tracee `read()`s from a pipe the tracer writes into. The
//! tracer's blocking pipe operation runs between [`TraceHandle::init()`] and
//! [`TraceHandle::finish()`], overlapping with the injected syscall.
//!
//! Each transfer must fit in a single pipe operation. A short transfer on either side is
//! reported as [`Error::ShortTransfer`], never retried.

use std::os::unix::io::RawFd;

use nix::{
    fcntl::{fcntl, FcntlArg, FdFlag, OFlag},
    sys::resource::{getrlimit, setrlimit, Resource},
    unistd,
};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::signal::SignalQueue;
use crate::trace::TraceHandle;

/// The two pipes used to relay memory between a tracee and the tracer.
///
/// Open once, before spawning tracees, so they inherit the tracee ends. The tracer ends
/// are closed on exec. The tracee ends live at the top of the descriptor table, where
/// the tracee will not allocate descriptors of its own.
#[derive(Debug)]
pub struct PipeChannels {
    // Tracee writes, tracer reads.
    load_host: RawFd,
    load_target: RawFd,

    // Tracer writes, tracee reads.
    store_host: RawFd,
    store_target: RawFd,
}

impl PipeChannels {
    pub fn open() -> Result<Self> {
        let (load_host, load_target) = unistd::pipe()?;
        let (store_target, store_host) = unistd::pipe()?;

        for fd in [load_host, store_host] {
            fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;

            // Signals for the tracee stay observable while the tracer is blocked.
            fcntl(fd, FcntlArg::F_SETFL(OFlag::O_ASYNC))?;
        }

        let load_target = high_fd(load_target)?;
        let store_target = high_fd(store_target)?;

        debug!(load_host, load_target, store_host, store_target, "opened pipe channels");

        Ok(Self { load_host, load_target, store_host, store_target })
    }

    /// Descriptor the tracee writes to when loading.
    pub fn target_write_fd(&self) -> RawFd {
        self.load_target
    }

    /// Descriptor the tracee reads from when storing.
    pub fn target_read_fd(&self) -> RawFd {
        self.store_target
    }

    /// Return `true` iff `fd` is one of the tracee-side descriptors of the channels.
    pub fn is_channel(&self, fd: RawFd) -> bool {
        fd == self.load_target || fd == self.store_target
    }
}

impl Drop for PipeChannels {
    fn drop(&mut self) {
        for fd in [self.load_host, self.load_target, self.store_host, self.store_target] {
            let _ = unistd::close(fd);
        }
    }
}

// Move `fd` to the highest free descriptor allowed by the hard `RLIMIT_NOFILE`, then drop
// the soft limit below it so no later descriptor can land on it.
fn high_fd(fd: RawFd) -> Result<RawFd> {
    let (soft, hard) = getrlimit(Resource::RLIMIT_NOFILE)?;
    setrlimit(Resource::RLIMIT_NOFILE, hard, hard)?;

    let top = hard.min(RawFd::MAX as libc::rlim_t) as RawFd;
    let mut moved = fd;
    let mut lowered = soft;

    for candidate in (fd + 1..top).rev() {
        if let Ok(newfd) = fcntl(fd, FcntlArg::F_DUPFD(candidate)) {
            unistd::close(fd)?;
            moved = newfd;
            lowered = soft.min(newfd as libc::rlim_t);

            break;
        }
    }

    setrlimit(Resource::RLIMIT_NOFILE, lowered, hard)?;

    trace!(fd, moved, soft = lowered, "raised descriptor");

    Ok(moved)
}

fn check_transfer(wanted: usize, local: usize, remote: i64) -> Result<()> {
    if local != wanted || remote != wanted as i64 {
        return Err(Error::ShortTransfer { wanted, local, remote });
    }

    Ok(())
}

impl TraceHandle {
    /// Copy `dst.len()` bytes at `src` in the tracee into `dst`.
    pub fn load_pipe(
        &mut self,
        channels: &PipeChannels,
        dst: &mut [u8],
        src: u64,
        mut queue: Option<&mut SignalQueue>,
    ) -> Result<i64> {
        let args = [channels.load_target as u64, src, dst.len() as u64];
        let injection = self.init(libc::SYS_write as u64, &args, queue.as_deref_mut())?;

        let local = unistd::read(channels.load_host, dst);

        // The injection must complete before any local failure is reported.
        let result = self.finish(injection, queue)?;

        let local = local.map_err(|source| Error::Pipe {
            op: "read",
            fd: channels.load_host,
            source,
        })?;
        check_transfer(dst.len(), local, result)?;

        Ok(result)
    }

    /// Copy `src` into the tracee at `dst`.
    pub fn store_pipe(
        &mut self,
        channels: &PipeChannels,
        src: &[u8],
        dst: u64,
        mut queue: Option<&mut SignalQueue>,
    ) -> Result<i64> {
        let args = [channels.store_target as u64, dst, src.len() as u64];
        let injection = self.init(libc::SYS_read as u64, &args, queue.as_deref_mut())?;

        let local = unistd::write(channels.store_host, src);

        let result = self.finish(injection, queue)?;

        let local = local.map_err(|source| Error::Pipe {
            op: "write",
            fd: channels.store_host,
            source,
        })?;
        check_transfer(src.len(), local, result)?;

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_transfer() {
        assert!(check_transfer(16, 16, 16).is_ok());

        assert!(matches!(
            check_transfer(16, 8, 16),
            Err(Error::ShortTransfer { wanted: 16, local: 8, remote: 16 }),
        ));
        assert!(matches!(
            check_transfer(16, 16, -(libc::EFAULT as i64)),
            Err(Error::ShortTransfer { .. }),
        ));
    }
}
