//! Make a ptrace-stopped process execute system calls it did not issue, and move memory
//! into and out of its address space.

#[cfg(not(any(target_arch = "x86_64", target_arch = "x86")))]
compile_error!("pinject supports x86_64 and x86 tracees only");

#[macro_use]
pub mod error;

pub mod cmd;
pub mod data;
pub mod inject;
pub mod memory;
pub mod pipe;
pub mod regs;
pub mod signal;
pub mod trace;

#[cfg(target_arch = "x86")]
mod i386;

#[cfg(target_arch = "x86_64")]
mod x86_64;

pub use cmd::spawn;
pub use data::{Argument, Buffer, Direction, ScratchRegion, Stat, SyscallResult};
pub use error::Error;
pub use inject::Injection;
pub use pipe::PipeChannels;
pub use regs::{Registers, SyscallRegisters};
pub use signal::{PendingSignal, SignalQueue, Siginfo};
pub use trace::{Pid, State, TraceHandle};
