use anyhow::Result;
use nix::sys::resource::{getrlimit, Resource};
use ntest::timeout;
use pinject::memory;
use pretty_assertions::assert_eq;

mod support;
use support::*;

const PAGE: usize = 4096;

#[test]
#[timeout(10000)]
fn test_store_then_load_round_trips() -> Result<()> {
    let _lock = lock_channels();
    let mut sleeper = Sleeper::spawn()?;
    let handle = &mut sleeper.handle;
    let before = view(handle);

    let region = handle.mmap_data(&CHANNELS, &[0; PAGE], None)?;
    assert_eq!(region.size(), PAGE as u64);

    for len in [1, 2, 7, 8, 9, 100, 255, 1024, PAGE - 1, PAGE] {
        let data: Vec<u8> = (0..len).map(|i| (i * 7 + len) as u8).collect();

        let stored = handle.store_pipe(&CHANNELS, &data, region.base(), None)?;
        assert_eq!(stored, len as i64);

        let mut out = vec![0u8; len];
        let loaded = handle.load_pipe(&CHANNELS, &mut out, region.base(), None)?;
        assert_eq!(loaded, len as i64);

        assert_eq!(out, data, "len = {}", len);
    }

    handle.munmap_data(region, None)?;
    assert_eq!(view(handle), before);

    Ok(())
}

#[test]
#[timeout(10000)]
fn test_pipe_and_direct_transfers_agree() -> Result<()> {
    let _lock = lock_channels();
    let mut sleeper = Sleeper::spawn()?;
    let pid = sleeper.handle.pid();
    let handle = &mut sleeper.handle;

    let data = b"relayed through a pipe";
    let region = handle.mmap_data(&CHANNELS, data, None)?;

    let mut direct = vec![0u8; data.len()];
    memory::load(pid, &mut direct, region.base())?;
    assert_eq!(&direct[..], &data[..]);

    memory::store(pid, region.base() + 3, b"POKED")?;

    let mut relayed = vec![0u8; data.len()];
    handle.load_pipe(&CHANNELS, &mut relayed, region.base(), None)?;
    assert_eq!(&relayed[..], &b"relPOKEDthrough a pipe"[..]);

    handle.munmap_data(region, None)?;

    Ok(())
}

#[test]
#[timeout(5000)]
fn test_channel_descriptors() -> Result<()> {
    let _lock = lock_channels();

    let write_fd = CHANNELS.target_write_fd();
    let read_fd = CHANNELS.target_read_fd();

    assert!(CHANNELS.is_channel(write_fd));
    assert!(CHANNELS.is_channel(read_fd));
    assert!(!CHANNELS.is_channel(0));
    assert!(!CHANNELS.is_channel(1));
    assert!(!CHANNELS.is_channel(2));

    // Raised above anything a tracee would allocate on its own.
    assert!(write_fd > 2 && read_fd > 2);
    assert_ne!(write_fd, read_fd);

    let (soft, _) = getrlimit(Resource::RLIMIT_NOFILE)?;
    assert!(soft <= write_fd.min(read_fd) as libc::rlim_t);

    Ok(())
}

#[test]
#[timeout(5000)]
fn test_tracee_inherits_channels() -> Result<()> {
    let _lock = lock_channels();
    let mut sleeper = Sleeper::spawn()?;
    let handle = &mut sleeper.handle;

    for fd in [CHANNELS.target_read_fd(), CHANNELS.target_write_fd()] {
        let stat = handle.fstat(&CHANNELS, fd, None)?.map_err(anyhow::Error::from)?;
        assert_eq!(stat.st_mode & libc::S_IFMT, libc::S_IFIFO);
    }

    Ok(())
}
