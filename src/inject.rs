//! Two-phase syscall injection.
//!
//! [`TraceHandle::init()`] sets up a syscall and lets the tracee run it, then returns.
//! [`TraceHandle::finish()`] waits for it to complete, collects the result, and puts the
//! tracee back where it was. Between the two, the tracer may perform one blocking local
//! operation that the injected syscall completes, e.g. the other end of a pipe transfer.

use tracing::debug;

use crate::error::{Error, Result};
use crate::regs::{Registers, SyscallRegisters, MAX_ARGS};
use crate::signal::SignalQueue;
use crate::trace::{self, Pid, State, TraceHandle};

/// An injected syscall that has been started, but not finished.
///
/// Must be passed to [`TraceHandle::finish()`]. There is no way to abort an injection.
#[must_use = "an injected syscall must be finished"]
pub struct Injection {
    pid: Pid,
    call: u64,
    regs: Registers,
    state: State,
    rewound: bool,
}

impl Injection {
    pub fn call(&self) -> u64 {
        self.call
    }

    /// Protocol state of the handle when the injection was started.
    pub fn state(&self) -> State {
        self.state
    }
}

impl TraceHandle {
    /// Start executing `call` with `args` in the tracee, without waiting for it.
    ///
    /// Fails before touching the snapshot if more than six arguments are given.
    pub fn init(
        &mut self,
        call: u64,
        args: &[u64],
        queue: Option<&mut SignalQueue>,
    ) -> Result<Injection> {
        if args.len() > MAX_ARGS {
            return Err(Error::ArgumentCount(args.len()));
        }

        let injection = Injection {
            pid: self.pid(),
            call,
            regs: *self.registers(),
            state: self.state(),
            rewound: self.rewound(),
        };

        debug!(
            pid = self.pid().as_raw(),
            call,
            argc = args.len(),
            state = ?injection.state,
            "injecting syscall"
        );

        let regs = self.registers_mut();
        regs.set_syscall_number(call);
        regs.set_arguments(args)?;
        regs.set_trap_flag(false);

        match self.state() {
            State::PostCall => self.redo(queue)?,
            State::PreCall => self.commit()?,
        }

        trace::resume(self.pid())?;

        Ok(injection)
    }

    /// Wait for an injected syscall to complete, then restore the tracee's own state.
    ///
    /// Returns the raw result of the injected syscall.
    pub fn finish(
        &mut self,
        injection: Injection,
        queue: Option<&mut SignalQueue>,
    ) -> Result<i64> {
        if injection.pid != self.pid() {
            desync!(format!(
                "injection for tracee = {} finished on tracee = {}",
                injection.pid,
                self.pid(),
            ));
        }

        // The injected syscall was resumed from its entry stop, so the next stop is its
        // exit. No signal-delivery-stop can come in between.
        trace::wait_for_syscall_trap(self.pid())?;

        self.fetch()?;
        self.set_state(State::PostCall);
        let result = self.registers().return_value();

        self.restore(injection.regs, injection.rewound);

        match injection.state {
            State::PreCall => self.redo(queue)?,
            State::PostCall => self.commit()?,
        }

        debug!(
            pid = self.pid().as_raw(),
            call = injection.call,
            result,
            "finished injected syscall"
        );

        Ok(result)
    }

    /// Execute `call` with `args` in the tracee and return its raw result.
    pub fn inject(
        &mut self,
        call: u64,
        args: &[u64],
        mut queue: Option<&mut SignalQueue>,
    ) -> Result<i64> {
        let injection = self.init(call, args, queue.as_deref_mut())?;
        self.finish(injection, queue)
    }
}
