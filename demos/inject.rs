use std::convert::TryFrom;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::process::Command;

use nix::sys::{
    ptrace,
    signal::{kill, Signal},
};
use pinject::{error::OrDie, PipeChannels, SignalQueue};
use structopt::StructOpt;
use tracing_subscriber::EnvFilter;

/// Spawn a command, and look at the filesystem through its eyes before it runs.
#[derive(Debug, StructOpt)]
struct Opt {
    /// Path to `stat()` from inside the tracee.
    #[structopt(long)]
    stat: Vec<PathBuf>,

    /// Symlink to `readlink()` from inside the tracee.
    #[structopt(long)]
    readlink: Vec<PathBuf>,

    /// Command to trace.
    #[structopt(required = true)]
    cmd: Vec<String>,
}

fn cpath(path: &PathBuf) -> anyhow::Result<CString> {
    Ok(CString::new(path.as_os_str().as_bytes())?)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let opt = Opt::from_args();

    // Tracees inherit their ends of the channels, so open them first.
    let channels = PipeChannels::open().or_die();

    let mut cmd = Command::new(&opt.cmd[0]);
    cmd.args(&opt.cmd[1..]);

    let (mut child, mut handle) = pinject::spawn(cmd).or_die();
    let mut queue = SignalQueue::new();

    let pid = handle
        .inject(libc::SYS_getpid as u64, &[], Some(&mut queue))
        .or_die();
    println!("getpid() = {}", pid);

    for path in &opt.stat {
        let c_path = cpath(path)?;

        match handle.stat(&channels, &c_path, Some(&mut queue)).or_die() {
            Ok(stat) => println!(
                "stat({}) = {{ mode: {:o}, size: {}, ino: {} }}",
                path.display(),
                stat.st_mode,
                stat.st_size,
                stat.st_ino,
            ),
            Err(errno) => println!("stat({}) = {}", path.display(), errno),
        }
    }

    for path in &opt.readlink {
        let c_path = cpath(path)?;
        let mut buf = vec![0u8; libc::PATH_MAX as usize];

        match handle.readlink(&channels, &c_path, &mut buf, Some(&mut queue)).or_die() {
            Ok(len) => println!(
                "readlink({}) = {}",
                path.display(),
                String::from_utf8_lossy(&buf[..len]),
            ),
            Err(errno) => println!("readlink({}) = {}", path.display(), errno),
        }
    }

    // Hand the tracee back to itself, with any signals it was sent while we held it.
    ptrace::detach(handle.pid(), None)?;

    for pending in queue.drain() {
        println!("redelivering signal {}", pending.signo);

        if let Ok(signal) = Signal::try_from(pending.signo) {
            kill(handle.pid(), signal)?;
        }
    }

    let status = child.wait()?;
    println!("tracee status: {}", status);

    Ok(())
}
