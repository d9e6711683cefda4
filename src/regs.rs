//! Architecture-independent view of a syscall-stopped register file.
//!
//! Every method here reads or writes the in-memory snapshot only. Moving a snapshot to
//! or from the tracee is done by [`TraceHandle::fetch()`](crate::TraceHandle::fetch) and
//! [`TraceHandle::commit()`](crate::TraceHandle::commit).

use crate::error::{Error, Result};

#[cfg(target_arch = "x86")]
pub use crate::i386::Registers;

#[cfg(target_arch = "x86_64")]
pub use crate::x86_64::Registers;

/// Maximum number of syscall arguments passed in registers.
pub const MAX_ARGS: usize = 6;

/// Encoding of `rdtsc`.
pub const RDTSC_INSN: [u8; 2] = [0x0f, 0x31];

/// Syscall-relevant accessors for one architecture's register file.
pub trait SyscallRegisters {
    /// Width in bytes of the instruction that enters the kernel.
    const SYSCALL_INSN_LEN: u64;

    fn syscall_number(&self) -> u64;

    fn set_syscall_number(&mut self, nr: u64);

    fn return_value(&self) -> i64;

    fn set_return_value(&mut self, value: i64);

    /// Value of the `n`th syscall argument, for `n` in `0..6`.
    fn argument(&self, n: usize) -> Result<u64>;

    fn set_argument(&mut self, n: usize, value: u64) -> Result<()>;

    fn trap_flag(&self) -> bool;

    fn set_trap_flag(&mut self, on: bool);

    fn instruction_pointer(&self) -> u64;

    fn set_instruction_pointer(&mut self, ip: u64);

    /// Put the syscall number back into the register the kernel clobbers with the result.
    fn restore_syscall_register(&mut self);

    /// Load `tsc` into the register pair `rdtsc` writes, low half first.
    fn set_timestamp_counter(&mut self, tsc: u64);

    /// Complete an `rdtsc` at the instruction pointer as if it had read `tsc`.
    fn emulate_tsc(&mut self, tsc: u64) {
        self.set_timestamp_counter(tsc);

        let ip = self.instruction_pointer();
        self.set_instruction_pointer(ip.wrapping_add(RDTSC_INSN.len() as u64));
    }

    /// Make the snapshot re-execute the syscall instruction it trapped on.
    fn rewind_to_entry(&mut self) {
        let ip = self.instruction_pointer();
        self.set_instruction_pointer(ip.wrapping_sub(Self::SYSCALL_INSN_LEN));
        self.restore_syscall_register();
    }

    fn arguments(&self, argc: usize) -> Result<Vec<u64>> {
        (0..argc).map(|n| self.argument(n)).collect()
    }

    fn set_arguments(&mut self, args: &[u64]) -> Result<()> {
        if args.len() > MAX_ARGS {
            return Err(Error::ArgumentCount(args.len()));
        }

        for (n, value) in args.iter().enumerate() {
            self.set_argument(n, *value)?;
        }

        Ok(())
    }
}
