use crate::error::{Error, Result};
use crate::regs::SyscallRegisters;

/// Register state of a tracee.
pub type Registers = libc::user_regs_struct;

/// `EFLAGS.TF`, the single-step trap flag.
const TRAP_FLAG: u64 = 0x100;

impl SyscallRegisters for Registers {
    // `syscall` is `0f 05`.
    const SYSCALL_INSN_LEN: u64 = 2;

    fn syscall_number(&self) -> u64 {
        self.orig_rax
    }

    fn set_syscall_number(&mut self, nr: u64) {
        self.orig_rax = nr;
    }

    fn return_value(&self) -> i64 {
        self.rax as i64
    }

    fn set_return_value(&mut self, value: i64) {
        self.rax = value as u64;
    }

    fn argument(&self, n: usize) -> Result<u64> {
        let value = match n {
            0 => self.rdi,
            1 => self.rsi,
            2 => self.rdx,
            3 => self.r10,
            4 => self.r8,
            5 => self.r9,
            _ => return Err(Error::ArgumentIndex(n)),
        };

        Ok(value)
    }

    fn set_argument(&mut self, n: usize, value: u64) -> Result<()> {
        let reg = match n {
            0 => &mut self.rdi,
            1 => &mut self.rsi,
            2 => &mut self.rdx,
            3 => &mut self.r10,
            4 => &mut self.r8,
            5 => &mut self.r9,
            _ => return Err(Error::ArgumentIndex(n)),
        };
        *reg = value;

        Ok(())
    }

    fn trap_flag(&self) -> bool {
        self.eflags & TRAP_FLAG != 0
    }

    fn set_trap_flag(&mut self, on: bool) {
        if on {
            self.eflags |= TRAP_FLAG;
        } else {
            self.eflags &= !TRAP_FLAG;
        }
    }

    fn instruction_pointer(&self) -> u64 {
        self.rip
    }

    fn set_instruction_pointer(&mut self, ip: u64) {
        self.rip = ip;
    }

    fn restore_syscall_register(&mut self) {
        self.rax = self.orig_rax;
    }

    fn set_timestamp_counter(&mut self, tsc: u64) {
        self.rax = tsc & 0xffff_ffff;
        self.rdx = tsc >> 32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zeroed() -> Registers {
        // SAFETY: `user_regs_struct` is plain old data.
        unsafe { std::mem::zeroed() }
    }

    #[test]
    fn test_arguments_follow_syscall_abi() {
        let mut regs = zeroed();
        regs.set_arguments(&[1, 2, 3, 4, 5, 6]).unwrap();

        assert_eq!(
            [regs.rdi, regs.rsi, regs.rdx, regs.r10, regs.r8, regs.r9],
            [1, 2, 3, 4, 5, 6],
        );
        assert_eq!(regs.arguments(6).unwrap(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_argument_out_of_range() {
        let mut regs = zeroed();

        assert!(matches!(regs.argument(6), Err(Error::ArgumentIndex(6))));
        assert!(matches!(regs.set_argument(7, 0), Err(Error::ArgumentIndex(7))));
        assert!(matches!(regs.set_arguments(&[0; 7]), Err(Error::ArgumentCount(7))));
        assert_eq!(regs.rdi, 0);
    }

    #[test]
    fn test_trap_flag_preserves_other_flags() {
        let mut regs = zeroed();
        regs.eflags = 0x246;

        regs.set_trap_flag(true);
        assert!(regs.trap_flag());
        assert_eq!(regs.eflags, 0x346);

        regs.set_trap_flag(false);
        assert!(!regs.trap_flag());
        assert_eq!(regs.eflags, 0x246);
    }

    #[test]
    fn test_rewind_to_entry() {
        let mut regs = zeroed();
        regs.rip = 0x40_1000;
        regs.orig_rax = libc::SYS_getpid as u64;
        regs.rax = -(libc::ENOSYS as i64) as u64;

        regs.rewind_to_entry();

        assert_eq!(regs.rip, 0x40_0ffe);
        assert_eq!(regs.rax, libc::SYS_getpid as u64);
        assert_eq!(regs.syscall_number(), libc::SYS_getpid as u64);
    }

    #[test]
    fn test_emulate_tsc() {
        let mut regs = zeroed();
        regs.rip = 0x40_2000;
        regs.rax = u64::MAX;
        regs.rdx = u64::MAX;

        regs.emulate_tsc(0x1234_5678_9abc_def0);

        assert_eq!(regs.rax, 0x9abc_def0);
        assert_eq!(regs.rdx, 0x1234_5678);
        assert_eq!(regs.rip, 0x40_2002);
    }
}
