use std::io;

use nix::{errno::Errno, sys::wait::WaitStatus};
use tracing::error;

use crate::trace::Pid;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure of the injection engine.
///
/// Every variant is terminal for the tracer: the target's execution state can't be
/// trusted after any of them, so nothing here is retried or rolled back.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Tracee = {pid} died")]
    TraceeDied {
        pid: Pid,
        source: nix::Error,
    },

    #[error("Could not {request} tracee = {pid}")]
    Ptrace {
        pid: Pid,
        request: &'static str,
        source: nix::Error,
    },

    #[error("Expected a stop of tracee = {expected}, but {actual} stopped")]
    UnexpectedPid { expected: Pid, actual: Pid },

    #[error("Unexpected wait status {status:?} for tracee = {pid}")]
    UnexpectedStatus { pid: Pid, status: WaitStatus },

    #[error("Wrong number of syscall arguments: {0}")]
    ArgumentCount(usize),

    #[error("Syscall argument number {0} out of range")]
    ArgumentIndex(usize),

    #[error("mmap of {size} bytes failed in tracee = {pid}: {errno}")]
    Mmap { pid: Pid, size: u64, errno: Errno },

    #[error("munmap of {size} bytes at {addr:#x} failed in tracee = {pid}: {result}")]
    Munmap { pid: Pid, addr: u64, size: u64, result: i64 },

    #[error("Pipe relay {op} failed on fd {fd}")]
    Pipe {
        op: &'static str,
        fd: i32,
        source: nix::Error,
    },

    #[error("Short pipe transfer: wanted {wanted} bytes, host moved {local}, tracee returned {remote}")]
    ShortTransfer { wanted: usize, local: usize, remote: i64 },

    #[error("Input/output error")]
    IO(#[from] io::Error),

    #[error("OS error")]
    OS(#[from] nix::Error),

    #[error("Tracer desynchronized from tracee: {0}")]
    Desync(String),
}

impl Error {
    pub fn tracee_died(&self) -> bool {
        matches!(self, Error::TraceeDied { .. })
    }

    /// No error of this crate leaves the tracee in a state the caller can resume from.
    pub fn is_fatal(&self) -> bool {
        true
    }
}

/// Log `err` and terminate the tracer.
pub fn die(err: Error) -> ! {
    error!(%err, "fatal tracer error");

    let mut source = std::error::Error::source(&err);
    while let Some(cause) = source {
        error!(%cause, "caused by");
        source = std::error::Error::source(cause);
    }

    std::process::exit(1)
}

pub trait ResultExt<T> {
    /// Map `ESRCH` to [`Error::TraceeDied`], and any other errno to [`Error::Ptrace`].
    fn died_if_esrch(self, pid: Pid, request: &'static str) -> Result<T>;
}

impl<T> ResultExt<T> for nix::Result<T> {
    fn died_if_esrch(self, pid: Pid, request: &'static str) -> Result<T> {
        self.map_err(|source| {
            if source == Errno::ESRCH {
                Error::TraceeDied { pid, source }
            } else {
                Error::Ptrace { pid, request, source }
            }
        })
    }
}

pub trait OrDie<T> {
    /// Unwrap the value, or apply the fatal policy via [`die()`].
    fn or_die(self) -> T;
}

impl<T> OrDie<T> for Result<T> {
    fn or_die(self) -> T {
        match self {
            Ok(value) => value,
            Err(err) => die(err),
        }
    }
}

macro_rules! desync {
    ($msg: expr) => {
        return Err($crate::error::Error::Desync($msg.into()))
    };
}
