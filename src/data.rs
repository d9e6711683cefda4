//! Syscalls with buffer arguments, staged through a scratch mapping in the tracee.

use std::ffi::CStr;
use std::mem;
use std::os::unix::io::RawFd;
use std::slice;

use nix::{
    errno::Errno,
    unistd::{sysconf, SysconfVar},
};
use tracing::debug;

use crate::error::{Error, Result};
use crate::pipe::PipeChannels;
use crate::regs::MAX_ARGS;
use crate::signal::SignalQueue;
use crate::trace::TraceHandle;

/// Outcome of a syscall as seen by the tracee.
pub type SyscallResult<T> = std::result::Result<T, Errno>;

#[cfg(target_arch = "x86_64")]
mod nr {
    pub const MMAP: u64 = libc::SYS_mmap as u64;
    pub const STAT: u64 = libc::SYS_stat as u64;
    pub const LSTAT: u64 = libc::SYS_lstat as u64;
    pub const FSTAT: u64 = libc::SYS_fstat as u64;
}

// Offsets are in pages, and `stat64` is the only layout with 64-bit sizes.
#[cfg(target_arch = "x86")]
mod nr {
    pub const MMAP: u64 = libc::SYS_mmap2 as u64;
    pub const STAT: u64 = libc::SYS_stat64 as u64;
    pub const LSTAT: u64 = libc::SYS_lstat64 as u64;
    pub const FSTAT: u64 = libc::SYS_fstat64 as u64;
}

const MUNMAP: u64 = libc::SYS_munmap as u64;
const READLINK: u64 = libc::SYS_readlink as u64;

/// File status, as filled in by the tracee's `stat()` family.
#[cfg(target_arch = "x86_64")]
pub type Stat = libc::stat;

/// File status, as filled in by the tracee's `stat()` family.
#[cfg(target_arch = "x86")]
pub type Stat = libc::stat64;

/// Which way a buffer argument is copied.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    /// Copied into the tracee before the syscall.
    ToTarget,

    /// Copied out of the tracee after the syscall.
    FromTarget,

    Both,
}

/// Host memory standing in for a pointer argument.
#[derive(Debug)]
pub enum Buffer<'a> {
    ToTarget(&'a [u8]),
    FromTarget(&'a mut [u8]),
    Both(&'a mut [u8]),
}

impl<'a> Buffer<'a> {
    pub fn direction(&self) -> Direction {
        match self {
            Buffer::ToTarget(_) => Direction::ToTarget,
            Buffer::FromTarget(_) => Direction::FromTarget,
            Buffer::Both(_) => Direction::Both,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bytes(&self) -> &[u8] {
        match self {
            Buffer::ToTarget(data) => *data,
            Buffer::FromTarget(data) | Buffer::Both(data) => &data[..],
        }
    }
}

/// Argument of a syscall injected with [`TraceHandle::inject_with_buffers()`].
#[derive(Debug)]
pub enum Argument<'a> {
    /// Passed to the tracee as-is.
    Immediate(u64),

    /// Replaced by the address of a copy in the tracee.
    Buffer(Buffer<'a>),
}

/// A private anonymous mapping created in the tracee to stage buffers.
///
/// Must be released with [`TraceHandle::munmap_data()`].
#[must_use = "a scratch region must be unmapped from the tracee"]
#[derive(Debug, Eq, PartialEq)]
pub struct ScratchRegion {
    base: u64,
    size: u64,
}

impl ScratchRegion {
    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

fn page_size() -> u64 {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => size as u64,
        _ => 4096,
    }
}

fn page_round(n: u64) -> u64 {
    let page = page_size();
    (n + page - 1) / page * page
}

/// Size of the scratch region needed to stage the buffers in `args`.
pub fn scratch_size(args: &[Argument]) -> u64 {
    let total: u64 = args
        .iter()
        .map(|arg| match arg {
            Argument::Buffer(buf) => buf.len() as u64,
            Argument::Immediate(_) => 0,
        })
        .sum();

    page_round(total)
}

/// Decode a raw syscall return value.
pub fn syscall_result(raw: i64) -> SyscallResult<i64> {
    if (-4095..0).contains(&raw) {
        Err(Errno::from_i32(-raw as i32))
    } else {
        Ok(raw)
    }
}

// A raw return value holding a tracee address, without sign extension on 32-bit.
fn address(raw: i64) -> u64 {
    raw as libc::c_ulong as u64
}

// View a plain-old-data value as bytes for the tracee to fill in.
//
// SAFETY: `T` must be valid for any bit pattern.
unsafe fn bytes_of_mut<T>(value: &mut T) -> &mut [u8] {
    slice::from_raw_parts_mut(value as *mut T as *mut u8, mem::size_of::<T>())
}

impl TraceHandle {
    fn map_scratch(&mut self, size: u64, queue: Option<&mut SignalQueue>) -> Result<ScratchRegion> {
        let args = [
            0,
            size,
            (libc::PROT_READ | libc::PROT_WRITE) as u64,
            (libc::MAP_PRIVATE | libc::MAP_ANONYMOUS) as u64,
            -1i64 as u64,
            0,
        ];

        let raw = self.inject(nr::MMAP, &args, queue)?;

        if let Err(errno) = syscall_result(raw) {
            return Err(Error::Mmap { pid: self.pid(), size, errno });
        }

        let region = ScratchRegion { base: address(raw), size };
        debug!(pid = self.pid().as_raw(), base = region.base, size, "mapped scratch region");

        Ok(region)
    }

    /// Map a scratch region in the tracee and copy `data` to its start.
    pub fn mmap_data(
        &mut self,
        channels: &PipeChannels,
        data: &[u8],
        mut queue: Option<&mut SignalQueue>,
    ) -> Result<ScratchRegion> {
        let size = page_round(data.len().max(1) as u64);
        let region = self.map_scratch(size, queue.as_deref_mut())?;

        self.store_pipe(channels, data, region.base, queue)?;

        Ok(region)
    }

    /// Unmap a scratch region from the tracee.
    pub fn munmap_data(
        &mut self,
        region: ScratchRegion,
        queue: Option<&mut SignalQueue>,
    ) -> Result<()> {
        let ScratchRegion { base, size } = region;
        let result = self.inject(MUNMAP, &[base, size], queue)?;

        if result != 0 {
            return Err(Error::Munmap { pid: self.pid(), addr: base, size, result });
        }

        debug!(pid = self.pid().as_raw(), base, size, "unmapped scratch region");

        Ok(())
    }

    /// Inject `call`, staging each buffer argument in a scratch region of the tracee.
    ///
    /// Returns the raw result of `call`. Buffers copied out of the tracee are filled in
    /// even when `call` fails.
    pub fn inject_with_buffers(
        &mut self,
        channels: &PipeChannels,
        call: u64,
        args: &mut [Argument],
        mut queue: Option<&mut SignalQueue>,
    ) -> Result<i64> {
        if args.len() > MAX_ARGS {
            return Err(Error::ArgumentCount(args.len()));
        }

        let size = scratch_size(args);

        if size == 0 {
            let real: Vec<u64> = args
                .iter()
                .map(|arg| match arg {
                    Argument::Immediate(value) => *value,
                    Argument::Buffer(_) => 0,
                })
                .collect();

            return self.inject(call, &real, queue);
        }

        let region = self.map_scratch(size, queue.as_deref_mut())?;

        let mut real = Vec::with_capacity(args.len());
        let mut addr = region.base;

        for arg in args.iter() {
            match arg {
                Argument::Immediate(value) => real.push(*value),
                Argument::Buffer(buf) => {
                    if buf.direction() != Direction::FromTarget {
                        self.store_pipe(channels, buf.bytes(), addr, queue.as_deref_mut())?;
                    }

                    real.push(addr);
                    addr += buf.len() as u64;
                },
            }
        }

        let result = self.inject(call, &real, queue.as_deref_mut())?;

        let mut addr = region.base;

        for arg in args.iter_mut() {
            if let Argument::Buffer(buf) = arg {
                let len = buf.len() as u64;

                match buf {
                    Buffer::FromTarget(data) | Buffer::Both(data) => {
                        self.load_pipe(channels, data, addr, queue.as_deref_mut())?;
                    },
                    Buffer::ToTarget(_) => {},
                }

                addr += len;
            }
        }

        self.munmap_data(region, queue)?;

        Ok(result)
    }

    fn path_stat(
        &mut self,
        channels: &PipeChannels,
        call: u64,
        path: &CStr,
        queue: Option<&mut SignalQueue>,
    ) -> Result<SyscallResult<Stat>> {
        // SAFETY: `Stat` is plain old data.
        let mut stat: Stat = unsafe { mem::zeroed() };

        let raw = {
            let out = unsafe { bytes_of_mut(&mut stat) };
            let mut args = [
                Argument::Buffer(Buffer::ToTarget(path.to_bytes_with_nul())),
                Argument::Buffer(Buffer::FromTarget(out)),
            ];
            self.inject_with_buffers(channels, call, &mut args, queue)?
        };

        Ok(syscall_result(raw).map(|_| stat))
    }

    /// `stat()` a path, as resolved by the tracee.
    pub fn stat(
        &mut self,
        channels: &PipeChannels,
        path: &CStr,
        queue: Option<&mut SignalQueue>,
    ) -> Result<SyscallResult<Stat>> {
        self.path_stat(channels, nr::STAT, path, queue)
    }

    /// `lstat()` a path, as resolved by the tracee.
    pub fn lstat(
        &mut self,
        channels: &PipeChannels,
        path: &CStr,
        queue: Option<&mut SignalQueue>,
    ) -> Result<SyscallResult<Stat>> {
        self.path_stat(channels, nr::LSTAT, path, queue)
    }

    /// `fstat()` a descriptor of the tracee.
    pub fn fstat(
        &mut self,
        channels: &PipeChannels,
        fd: RawFd,
        queue: Option<&mut SignalQueue>,
    ) -> Result<SyscallResult<Stat>> {
        // SAFETY: `Stat` is plain old data.
        let mut stat: Stat = unsafe { mem::zeroed() };

        let raw = {
            let out = unsafe { bytes_of_mut(&mut stat) };
            let mut args = [
                Argument::Immediate(fd as u64),
                Argument::Buffer(Buffer::FromTarget(out)),
            ];
            self.inject_with_buffers(channels, nr::FSTAT, &mut args, queue)?
        };

        Ok(syscall_result(raw).map(|_| stat))
    }

    /// `readlink()` a path, as resolved by the tracee, into `buf`.
    ///
    /// Returns the number of bytes placed in `buf`. No terminator is added.
    pub fn readlink(
        &mut self,
        channels: &PipeChannels,
        path: &CStr,
        buf: &mut [u8],
        queue: Option<&mut SignalQueue>,
    ) -> Result<SyscallResult<usize>> {
        let size = buf.len() as u64;
        let mut args = [
            Argument::Buffer(Buffer::ToTarget(path.to_bytes_with_nul())),
            Argument::Buffer(Buffer::FromTarget(buf)),
            Argument::Immediate(size),
        ];
        let raw = self.inject_with_buffers(channels, READLINK, &mut args, queue)?;

        Ok(syscall_result(raw).map(|len| len as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scratch_size_rounds_to_pages() {
        let page = page_size();
        let path = b"/tmp/x\0";
        let mut stat = [0u8; mem::size_of::<Stat>()];

        let args = [
            Argument::Buffer(Buffer::ToTarget(path)),
            Argument::Buffer(Buffer::FromTarget(&mut stat)),
        ];

        assert_eq!(scratch_size(&args), page);
    }

    #[test]
    fn test_scratch_size_ignores_immediates() {
        let page = page_size();
        let mut big = vec![0u8; page as usize + 1];

        let args = [
            Argument::Immediate(u64::MAX),
            Argument::Buffer(Buffer::Both(&mut big)),
        ];
        assert_eq!(scratch_size(&args), 2 * page);

        let args = [Argument::Immediate(3), Argument::Immediate(4)];
        assert_eq!(scratch_size(&args), 0);
    }

    #[test]
    fn test_buffer_direction() {
        let input = [1u8, 2, 3];
        let mut output = [0u8; 2];

        let to = Buffer::ToTarget(&input);
        assert_eq!(to.direction(), Direction::ToTarget);
        assert_eq!(to.len(), 3);

        let from = Buffer::FromTarget(&mut output);
        assert_eq!(from.direction(), Direction::FromTarget);
        assert_eq!(from.len(), 2);
    }

    #[test]
    fn test_syscall_result() {
        assert_eq!(syscall_result(0), Ok(0));
        assert_eq!(syscall_result(42), Ok(42));
        assert_eq!(syscall_result(-(libc::ENOENT as i64)), Err(Errno::ENOENT));
        assert_eq!(syscall_result(-4095), Err(Errno::from_i32(4095)));
        assert_eq!(syscall_result(-4096), Ok(-4096));
    }
}
