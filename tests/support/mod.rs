use std::fs;
use std::process::{Child, Command};
use std::sync::{Mutex, MutexGuard};

use lazy_static::lazy_static;
use pinject::{PipeChannels, SyscallRegisters, TraceHandle};

#[cfg(target_arch = "x86_64")]
#[allow(unused)]
pub const SYS_MMAP: u64 = libc::SYS_mmap as u64;

#[cfg(target_arch = "x86")]
#[allow(unused)]
pub const SYS_MMAP: u64 = libc::SYS_mmap2 as u64;

#[allow(unused)]
pub const SYS_GETPID: u64 = libc::SYS_getpid as u64;

lazy_static! {
    /// Opened once per test binary, before any tracee is spawned, so tracees inherit it.
    #[allow(unused)]
    pub static ref CHANNELS: PipeChannels = PipeChannels::open().expect("open pipe channels");

    static ref CHANNEL_USERS: Mutex<()> = Mutex::new(());
}

/// Serialize tests that relay through the shared pipe channels.
#[allow(unused)]
pub fn lock_channels() -> MutexGuard<'static, ()> {
    lazy_static::initialize(&CHANNELS);
    CHANNEL_USERS.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A spawned `sleep`, stopped at its first syscall-entry. Killed on drop.
pub struct Sleeper {
    pub child: Child,
    pub handle: TraceHandle,
}

impl Sleeper {
    pub fn spawn() -> anyhow::Result<Self> {
        let mut cmd = Command::new("sleep");
        cmd.arg("60");

        let (child, handle) = pinject::spawn(cmd)?;

        Ok(Self { child, handle })
    }

    #[allow(unused)]
    pub fn pid(&self) -> i64 {
        self.child.id() as i64
    }

    /// Contents of `/proc/<pid>/maps`.
    #[allow(unused)]
    pub fn maps(&self) -> anyhow::Result<String> {
        Ok(fs::read_to_string(format!("/proc/{}/maps", self.child.id()))?)
    }
}

impl Drop for Sleeper {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// The syscall-relevant part of a register snapshot.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SyscallView {
    pub call: u64,
    pub args: Vec<u64>,
    pub ip: u64,
}

#[allow(unused)]
pub fn view(handle: &TraceHandle) -> SyscallView {
    let regs = handle.registers();

    SyscallView {
        call: regs.syscall_number(),
        args: regs.arguments(6).expect("six arguments"),
        ip: regs.instruction_pointer(),
    }
}

/// Map a fresh read-write page in the tracee with a plain injected `mmap`.
#[allow(unused)]
pub fn map_page(handle: &mut TraceHandle) -> anyhow::Result<u64> {
    let prot = (libc::PROT_READ | libc::PROT_WRITE) as u64;
    let flags = (libc::MAP_PRIVATE | libc::MAP_ANONYMOUS) as u64;
    let args = [0, 4096, prot, flags, -1i64 as u64, 0];

    let raw = handle.inject(SYS_MMAP, &args, None)?;
    let base = pinject::data::syscall_result(raw).map_err(anyhow::Error::from)?;

    Ok(base as libc::c_ulong as u64)
}
