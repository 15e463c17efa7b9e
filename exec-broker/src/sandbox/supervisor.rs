//! The process a step is spawned as. It becomes a child subreaper, forks
//! the real program and then stays behind reaping. A descendant that
//! detaches with `setsid` is still reparented to it, so the whole tree is
//! reachable from one pid for as long as anything in it is alive.
//!
//! The supervisor reports the program's own exit over a pipe and keeps
//! reaping until it has no children left.

use nix::errno::Errno;
use nix::libc;
use nix::sys::prctl;
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{close, fork, write, ForkResult, Pid};
use std::io;
use std::os::fd::{BorrowedFd, OwnedFd, RawFd};
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tracing::warn;

use crate::normalize::ExitInfo;

const EXITED: u8 = 0;
const SIGNALED: u8 = 1;

/// Highest descriptor the supervisor bothers closing
const MAX_INHERITED_FD: u64 = 65536;

/// Kernel limits for the program, applied between fork and exec
#[derive(Debug, Clone, Copy)]
pub(crate) struct KernelLimits {
    pub file_size: u64,
    pub cpu_seconds: u64,
    pub address_space: Option<u64>,
    /// `RLIMIT_NPROC`; `None` where the kernel would not enforce it
    pub processes: Option<u64>,
}

impl KernelLimits {
    fn apply(&self) -> io::Result<()> {
        setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
        setrlimit(Resource::RLIMIT_FSIZE, self.file_size, self.file_size)?;
        setrlimit(Resource::RLIMIT_CPU, self.cpu_seconds, self.cpu_seconds)?;
        if let Some(bytes) = self.address_space {
            setrlimit(Resource::RLIMIT_AS, bytes, bytes)?;
        }
        if let Some(processes) = self.processes {
            setrlimit(Resource::RLIMIT_NPROC, processes, processes)?;
        }
        Ok(())
    }
}

/// Runs in the forked child between fork and exec, so only async-signal-safe
/// calls are allowed. Returns in the program's process, which goes on to
/// exec; the supervisor never returns.
pub(crate) fn enter(limits: KernelLimits, status_fd: RawFd) -> io::Result<()> {
    prctl::set_child_subreaper(true)?;

    // SAFETY: the process is single-threaded here, std has just forked it
    match unsafe { fork() }? {
        ForkResult::Child => limits.apply(),
        ForkResult::Parent { child } => supervise(child, status_fd),
    }
}

fn supervise(program: Pid, status_fd: RawFd) -> ! {
    // The supervisor never execs, so close-on-exec does not help: drop
    // every inherited descriptor or the broker never sees EOF on them
    for fd in 0..=2 {
        let _ = close(fd);
    }
    let highest = getrlimit(Resource::RLIMIT_NOFILE)
        .map(|(soft, _)| soft.min(MAX_INHERITED_FD))
        .unwrap_or(1024) as RawFd;
    for fd in (3..highest).filter(|fd| *fd != status_fd) {
        let _ = close(fd);
    }

    loop {
        match waitpid(Pid::from_raw(-1), None) {
            Ok(WaitStatus::Exited(pid, code)) if pid == program => {
                report(status_fd, EXITED, code as u8)
            }
            Ok(WaitStatus::Signaled(pid, signal, _)) if pid == program => {
                report(status_fd, SIGNALED, signal as i32 as u8)
            }
            Ok(_) | Err(Errno::EINTR) => {}
            // ECHILD: nothing left below us
            Err(_) => break,
        }
    }
    // SAFETY: _exit skips the atexit handlers copied over from the broker
    unsafe { libc::_exit(0) }
}

fn report(status_fd: RawFd, kind: u8, value: u8) {
    // SAFETY: the descriptor stays open until the supervisor exits
    let fd = unsafe { BorrowedFd::borrow_raw(status_fd) };
    let _ = write(fd, &[kind, value]);
}

/// Wait for the supervisor's report on how the program ended. `None` when
/// the pipe closes without one, i.e. the supervisor itself died.
pub(crate) async fn program_exit(status: OwnedFd) -> Option<ExitInfo> {
    let mut receiver = match pipe::Receiver::from_file(std::fs::File::from(status)) {
        Ok(receiver) => receiver,
        Err(e) => {
            warn!("Failed to watch supervisor status pipe: {}", e);
            return None;
        }
    };
    let mut message = [0u8; 2];
    receiver.read_exact(&mut message).await.ok()?;
    Some(decode(message))
}

fn decode([kind, value]: [u8; 2]) -> ExitInfo {
    match kind {
        EXITED => ExitInfo {
            code: Some(value as i32),
            signal: None,
        },
        _ => ExitInfo {
            code: None,
            signal: Some(value as i32),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::Signal;

    #[test]
    fn status_messages_decode() {
        assert_eq!(
            decode([EXITED, 3]),
            ExitInfo {
                code: Some(3),
                signal: None
            }
        );
        assert_eq!(
            decode([SIGNALED, Signal::SIGXCPU as i32 as u8]),
            ExitInfo {
                code: None,
                signal: Some(Signal::SIGXCPU as i32)
            }
        );
    }

    #[tokio::test]
    async fn closed_pipe_reports_nothing() {
        let (reader, writer) = nix::unistd::pipe().unwrap();
        drop(writer);
        assert_eq!(program_exit(reader).await, None);
    }

    #[tokio::test]
    async fn reads_the_reported_exit() {
        let (reader, writer) = nix::unistd::pipe().unwrap();
        write(&writer, &[EXITED, 0]).unwrap();
        drop(writer);
        assert_eq!(
            program_exit(reader).await,
            Some(ExitInfo {
                code: Some(0),
                signal: None
            })
        );
    }
}
