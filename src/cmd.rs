use std::io;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command};

use nix::sys::{
    ptrace::{self, Options},
    signal::Signal,
    wait::WaitStatus,
};
use tracing::info;

use crate::error::{Error, Result, ResultExt};
use crate::trace::{self, Pid, State, TraceHandle};

/// Options set on spawned tracees.
///
/// `PTRACE_O_TRACESYSGOOD` tells syscall-stops apart from `SIGTRAP` deliveries, and
/// `PTRACE_O_EXITKILL` keeps a tracee from outliving a tracer that died on a fatal error.
pub const SPAWN_OPTIONS: Options = Options::PTRACE_O_TRACESYSGOOD.union(Options::PTRACE_O_EXITKILL);

/// Spawn `cmd` as a tracee, stopped at the entry of its first syscall after `execve()`.
pub fn spawn(mut cmd: Command) -> Result<(Child, TraceHandle)> {
    // On fork, request `PTRACE_TRACEME`.
    unsafe {
        cmd.pre_exec(|| ptrace::traceme().map_err(|err| io::Error::from_raw_os_error(err as i32)))
    };

    let child = cmd.spawn()?;
    let pid = Pid::from_raw(child.id() as i32);

    // A tracee that requested `PTRACE_TRACEME` gets a `SIGTRAP` on successful `execve()`.
    match trace::wait_stopped(pid)? {
        WaitStatus::Stopped(_, Signal::SIGTRAP) => {}
        status => return Err(Error::UnexpectedStatus { pid, status }),
    }

    ptrace::setoptions(pid, SPAWN_OPTIONS).died_if_esrch(pid, "set options of")?;

    trace::resume(pid)?;
    trace::run_to_syscall_trap(pid, None)?;

    info!(pid = pid.as_raw(), "spawned tracee");

    let handle = TraceHandle::new(pid, State::PreCall)?;

    Ok((child, handle))
}
