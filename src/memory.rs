//! Word-at-a-time transfers through `PTRACE_PEEKDATA` and `PTRACE_POKEDATA`.
//!
//! Slow, but only requires the tracee to be stopped.

use std::mem;

use nix::sys::ptrace;

use crate::error::{Result, ResultExt};
use crate::trace::Pid;

const WORD: usize = mem::size_of::<libc::c_long>();

type Word = [u8; WORD];

// Address of the word containing `addr`, and the offset of `addr` within it.
fn split(addr: u64) -> (u64, usize) {
    let offset = (addr % WORD as u64) as usize;
    (addr - offset as u64, offset)
}

fn peek(pid: Pid, addr: u64) -> Result<Word> {
    let data = ptrace::read(pid, addr as ptrace::AddressType).died_if_esrch(pid, "peek data of")?;

    Ok(data.to_ne_bytes())
}

fn poke(pid: Pid, addr: u64, word: Word) -> Result<()> {
    let data = libc::c_long::from_ne_bytes(word);

    // SAFETY: the write targets the tracee's address space, not ours. `data` is passed
    // by value in the pointer-sized argument, as `PTRACE_POKEDATA` expects.
    unsafe {
        ptrace::write(pid, addr as ptrace::AddressType, data as *mut libc::c_void)
    }
    .died_if_esrch(pid, "poke data of")
}

/// Copy `dst.len()` bytes starting at `src` in the tracee into `dst`.
pub fn load(pid: Pid, dst: &mut [u8], src: u64) -> Result<()> {
    let (mut addr, mut offset) = split(src);
    let mut filled = 0;

    while filled < dst.len() {
        let word = peek(pid, addr)?;
        let n = (WORD - offset).min(dst.len() - filled);

        dst[filled..filled + n].copy_from_slice(&word[offset..offset + n]);

        filled += n;
        addr += WORD as u64;
        offset = 0;
    }

    Ok(())
}

/// Copy a NUL-terminated string starting at `src` in the tracee into `dst`.
///
/// Returns the string length, excluding the terminator, or `None` if no terminator was
/// found in the first `dst.len()` bytes. The terminator is copied when found.
pub fn load_string(pid: Pid, dst: &mut [u8], src: u64) -> Result<Option<usize>> {
    let (mut addr, mut offset) = split(src);
    let mut len = 0;

    while len < dst.len() {
        let word = peek(pid, addr)?;

        for byte in &word[offset..] {
            dst[len] = *byte;

            if *byte == 0 {
                return Ok(Some(len));
            }

            len += 1;
            if len == dst.len() {
                break;
            }
        }

        addr += WORD as u64;
        offset = 0;
    }

    Ok(None)
}

/// Copy `src` into the tracee at `dst`.
///
/// Bytes sharing a word with the ends of the range are preserved.
pub fn store(pid: Pid, dst: u64, src: &[u8]) -> Result<()> {
    let (mut addr, mut offset) = split(dst);
    let mut written = 0;

    while written < src.len() {
        let n = (WORD - offset).min(src.len() - written);

        let mut word = if n < WORD {
            // Partially overwritten: merge with the current contents.
            peek(pid, addr)?
        } else {
            [0; WORD]
        };
        word[offset..offset + n].copy_from_slice(&src[written..written + n]);

        poke(pid, addr, word)?;

        written += n;
        addr += WORD as u64;
        offset = 0;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_word_address() {
        let w = WORD as u64;

        assert_eq!(split(0x1000), (0x1000, 0));
        assert_eq!(split(0x1001), (0x1000, 1));
        assert_eq!(split(0x1000 + w - 1), (0x1000, WORD - 1));
        assert_eq!(split(0x1000 + w), (0x1000 + w, 0));
    }
}
