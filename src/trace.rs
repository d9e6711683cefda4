//! Trace handles, and the primitives that move a tracee between syscall stops.

use std::fmt;
use std::marker::PhantomData;

use nix::sys::{
    ptrace,
    wait::{self, WaitPidFlag, WaitStatus},
};
use tracing::{debug, trace};

use crate::error::{Error, Result, ResultExt};
use crate::memory;
use crate::regs::{Registers, SyscallRegisters, RDTSC_INSN};
use crate::signal::SignalQueue;

pub use nix::unistd::Pid;

/// Syscall with no side effects, run in place of a syscall we must not execute.
pub const HARMLESS_SYSCALL: u64 = libc::SYS_getpid as u64;

/// Where a tracee is stopped, relative to its own pending syscall.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    /// Stopped at syscall-entry. The pending syscall has not run.
    PreCall,

    /// Stopped at syscall-exit. Its result is in the return register.
    PostCall,
}

/// A tracee stopped at a syscall boundary, and the tracer's copy of its registers.
///
/// The register snapshot and [`State`] always agree with where the tracee is actually
/// stopped when an operation returns. Registers reach the tracee only through
/// [`commit()`](TraceHandle::commit), and are refreshed only through
/// [`fetch()`](TraceHandle::fetch).
pub struct TraceHandle {
    pid: Pid,
    regs: Registers,
    state: State,

    // The snapshot has already been moved back onto the syscall instruction.
    rewound: bool,

    // ptrace requests must come from the thread that attached.
    _not_send: PhantomData<*const ()>,
}

impl fmt::Debug for TraceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceHandle")
            .field("pid", &self.pid)
            .field("state", &self.state)
            .field("rewound", &self.rewound)
            .finish()
    }
}

impl TraceHandle {
    /// Take over a tracee already stopped at a syscall boundary described by `state`.
    ///
    /// The tracee must have `PTRACE_O_TRACESYSGOOD` set, as [`spawn()`](crate::spawn) does.
    pub fn new(pid: Pid, state: State) -> Result<Self> {
        let regs = ptrace::getregs(pid).died_if_esrch(pid, "get registers of")?;
        let rewound = false;
        let _not_send = PhantomData;

        Ok(Self { pid, regs, state, rewound, _not_send })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn registers(&self) -> &Registers {
        &self.regs
    }

    /// Edit the snapshot. Changes reach the tracee on the next commit.
    pub fn registers_mut(&mut self) -> &mut Registers {
        &mut self.regs
    }

    /// Refresh the register snapshot from the tracee.
    pub fn fetch(&mut self) -> Result<()> {
        self.regs = ptrace::getregs(self.pid).died_if_esrch(self.pid, "get registers of")?;
        self.rewound = false;

        Ok(())
    }

    /// Write the register snapshot to the tracee.
    pub fn commit(&self) -> Result<()> {
        trace!(pid = self.pid.as_raw(), "committing registers");

        ptrace::setregs(self.pid, self.regs).died_if_esrch(self.pid, "set registers of")
    }

    /// Return `true` if the snapshot's instruction pointer is at an `rdtsc` instruction.
    ///
    /// Pair with [`SyscallRegisters::emulate_tsc()`] to complete it with a chosen value.
    pub fn at_rdtsc(&self) -> Result<bool> {
        let mut insn = [0; RDTSC_INSN.len()];
        memory::load(self.pid, &mut insn, self.regs.instruction_pointer())?;

        Ok(insn == RDTSC_INSN)
    }

    /// Commit the snapshot, run to the next syscall trap, and refresh the snapshot.
    ///
    /// Unrelated signals stopping the tracee on the way are suppressed and appended to
    /// `queue`. Without a queue they are dropped.
    pub fn next_trap(&mut self, queue: Option<&mut SignalQueue>) -> Result<()> {
        self.commit()?;
        resume(self.pid)?;
        run_to_syscall_trap(self.pid, queue)?;
        self.fetch()
    }

    /// Let the tracee run to its next syscall boundary, tracking which one it reached.
    pub fn advance(&mut self, queue: Option<&mut SignalQueue>) -> Result<State> {
        self.next_trap(queue)?;

        self.state = match self.state {
            State::PreCall => State::PostCall,
            State::PostCall => State::PreCall,
        };
        debug!(pid = self.pid.as_raw(), state = ?self.state, "advanced tracee");

        Ok(self.state)
    }

    /// Replace the pending syscall with one that has no side effects.
    pub fn skip(&mut self) -> Result<()> {
        debug!(
            pid = self.pid.as_raw(),
            call = self.regs.syscall_number(),
            "skipping syscall"
        );

        self.regs.set_syscall_number(HARMLESS_SYSCALL);
        self.commit()
    }

    /// Neutralize the pending syscall, leaving the tracee set up to issue it again.
    ///
    /// On return the tracee is at a syscall-exit stop, and will re-execute its original
    /// syscall instruction when resumed.
    pub fn undo(&mut self) -> Result<()> {
        if self.state != State::PreCall {
            desync!("undo requested away from a syscall-entry stop");
        }

        let call = self.regs.syscall_number();
        self.skip()?;

        resume(self.pid)?;
        wait_for_syscall_trap(self.pid)?;

        self.regs.set_syscall_number(call);
        self.regs.rewind_to_entry();
        self.rewound = true;
        self.state = State::PostCall;
        debug!(pid = self.pid.as_raw(), call, "undid syscall");

        self.commit()
    }

    /// Return the tracee to the syscall-entry stop of the syscall in the snapshot.
    ///
    /// The tracee must be at a syscall-exit stop.
    pub fn redo(&mut self, queue: Option<&mut SignalQueue>) -> Result<()> {
        if self.state != State::PostCall {
            desync!("redo requested away from a syscall-exit stop");
        }

        self.rewind();
        self.next_trap(queue)?;
        self.state = State::PreCall;
        debug!(
            pid = self.pid.as_raw(),
            call = self.regs.syscall_number(),
            "redid syscall"
        );

        Ok(())
    }

    pub(crate) fn set_state(&mut self, state: State) {
        self.state = state;
    }

    pub(crate) fn rewound(&self) -> bool {
        self.rewound
    }

    pub(crate) fn restore(&mut self, regs: Registers, rewound: bool) {
        self.regs = regs;
        self.rewound = rewound;
    }

    fn rewind(&mut self) {
        if self.rewound {
            self.regs.restore_syscall_register();
        } else {
            self.regs.rewind_to_entry();
            self.rewound = true;
        }
    }
}

/// Restart the tracee until its next syscall-stop, suppressing any pending signal.
pub(crate) fn resume(pid: Pid) -> Result<()> {
    ptrace::syscall(pid, None).died_if_esrch(pid, "resume")
}

/// Block until `pid` enters a ptrace-stop, and return its wait status.
pub(crate) fn wait_stopped(pid: Pid) -> Result<WaitStatus> {
    let status = wait::waitpid(pid, Some(WaitPidFlag::__WALL)).died_if_esrch(pid, "wait for")?;

    if let Some(actual) = status.pid() {
        if actual != pid {
            return Err(Error::UnexpectedPid { expected: pid, actual });
        }
    }

    match status {
        WaitStatus::Stopped(..) | WaitStatus::PtraceSyscall(..) | WaitStatus::PtraceEvent(..) => {
            Ok(status)
        }
        _ => Err(Error::UnexpectedStatus { pid, status }),
    }
}

/// Wait for a stop which no unrelated signal can precede, such as a syscall-exit stop.
pub(crate) fn wait_for_syscall_trap(pid: Pid) -> Result<()> {
    match wait_stopped(pid)? {
        WaitStatus::PtraceSyscall(..) => Ok(()),
        status => Err(Error::UnexpectedStatus { pid, status }),
    }
}

/// Wait for a resumed tracee to reach a syscall trap, queueing signals seen on the way.
///
/// Only `SIGTRAP | 0x80` stops count as syscall traps. A plain `SIGTRAP` is a signal like
/// any other, whether another process sent it or the kernel raised it.
pub(crate) fn run_to_syscall_trap(pid: Pid, mut queue: Option<&mut SignalQueue>) -> Result<()> {
    loop {
        match wait_stopped(pid)? {
            WaitStatus::PtraceSyscall(..) => return Ok(()),
            WaitStatus::Stopped(_, signal) => {
                let signo = signal as i32;

                if let Some(queue) = queue.as_deref_mut() {
                    let info = ptrace::getsiginfo(pid).died_if_esrch(pid, "get signal info of")?;
                    debug!(pid = pid.as_raw(), signo, code = info.si_code, "queueing signal");
                    queue.push(signo, info);
                } else {
                    debug!(pid = pid.as_raw(), signo, "dropping signal");
                }
            }
            status => {
                debug!(pid = pid.as_raw(), ?status, "ignoring event stop");
            }
        }

        resume(pid)?;
    }
}
