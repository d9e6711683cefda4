use crate::error::{Error, Result};
use crate::regs::SyscallRegisters;

/// Register state of a tracee.
pub type Registers = libc::user_regs_struct;

const TRAP_FLAG: libc::c_long = 0x100;

// Registers are `c_long`, so values are truncated to 32 bits on the way in and
// sign- or zero-extended on the way out as the accessor requires.
impl SyscallRegisters for Registers {
    // `int $0x80` is `cd 80`.
    const SYSCALL_INSN_LEN: u64 = 2;

    fn syscall_number(&self) -> u64 {
        self.orig_eax as u32 as u64
    }

    fn set_syscall_number(&mut self, nr: u64) {
        self.orig_eax = nr as libc::c_long;
    }

    fn return_value(&self) -> i64 {
        self.eax as i64
    }

    fn set_return_value(&mut self, value: i64) {
        self.eax = value as libc::c_long;
    }

    fn argument(&self, n: usize) -> Result<u64> {
        let value = match n {
            0 => self.ebx,
            1 => self.ecx,
            2 => self.edx,
            3 => self.esi,
            4 => self.edi,
            5 => self.ebp,
            _ => return Err(Error::ArgumentIndex(n)),
        };

        Ok(value as u32 as u64)
    }

    fn set_argument(&mut self, n: usize, value: u64) -> Result<()> {
        let reg = match n {
            0 => &mut self.ebx,
            1 => &mut self.ecx,
            2 => &mut self.edx,
            3 => &mut self.esi,
            4 => &mut self.edi,
            5 => &mut self.ebp,
            _ => return Err(Error::ArgumentIndex(n)),
        };
        *reg = value as libc::c_long;

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
        self.eip as u32 as u64
    }

    fn set_instruction_pointer(&mut self, ip: u64) {
        self.eip = ip as libc::c_long;
    }

    fn restore_syscall_register(&mut self) {
        self.eax = self.orig_eax;
    }

    fn set_timestamp_counter(&mut self, tsc: u64) {
        self.eax = tsc as u32 as libc::c_long;
        self.edx = (tsc >> 32) as u32 as libc::c_long;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arguments_follow_syscall_abi() {
        // SAFETY: `user_regs_struct` is plain old data.
        let mut regs: Registers = unsafe { std::mem::zeroed() };
        regs.set_arguments(&[1, 2, 3, 4, 5, 0xffff_fffe]).unwrap();

        assert_eq!(
            [regs.ebx, regs.ecx, regs.edx, regs.esi, regs.edi],
            [1, 2, 3, 4, 5],
        );
        assert_eq!(regs.argument(5).unwrap(), 0xffff_fffe);
    }

    #[test]
    fn test_negative_result_sign_extends() {
        let mut regs: Registers = unsafe { std::mem::zeroed() };
        regs.eax = -(libc::ENOENT as libc::c_long);

        assert_eq!(regs.return_value(), -(libc::ENOENT as i64));
    }

    #[test]
    fn test_emulate_tsc() {
        let mut regs: Registers = unsafe { std::mem::zeroed() };
        regs.eip = 0x0804_9000;

        regs.emulate_tsc(0x0000_0001_8000_0000);

        assert_eq!(regs.eax as u32, 0x8000_0000);
        assert_eq!(regs.edx as u32, 1);
        assert_eq!(regs.instruction_pointer(), 0x0804_9002);
    }
}
