//! Signals observed, and withheld, while the tracer drove a tracee between syscall stops.

use std::collections::VecDeque;
use std::fmt;

/// Extra signal info, such as its cause.
pub type Siginfo = libc::siginfo_t;

/// A signal that stopped the tracee while it was being run to a syscall boundary.
///
/// The signal was suppressed on restart. Redelivering it is up to the consumer.
#[derive(Clone, Copy)]
pub struct PendingSignal {
    /// Raw signal number, which may be a real-time signal.
    pub signo: i32,
    pub info: Siginfo,
}

impl fmt::Debug for PendingSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingSignal")
            .field("signo", &self.signo)
            .field("si_code", &self.info.si_code)
            .field("si_errno", &self.info.si_errno)
            .finish()
    }
}

/// FIFO of signals, in arrival order.
#[derive(Clone, Debug, Default)]
pub struct SignalQueue {
    signals: VecDeque<PendingSignal>,
}

impl SignalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, signo: i32, info: Siginfo) {
        self.signals.push_back(PendingSignal { signo, info });
    }

    /// Remove the oldest queued signal.
    pub fn pop(&mut self) -> Option<PendingSignal> {
        self.signals.pop_front()
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingSignal> {
        self.signals.iter()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = PendingSignal> + '_ {
        self.signals.drain(..)
    }
}
