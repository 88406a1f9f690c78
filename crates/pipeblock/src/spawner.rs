//! Child process creation: two pipes, one fork, `sh -c <command>`.
//!
//! Between `fork()` and `execv()` the child may only make async-signal-safe
//! calls, so everything that allocates (argv, the pointer array) is prepared in
//! the parent beforehand.

use std::ffi::{CStr, CString};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use nix::sys::signal::{SigHandler, SigSet, SigmaskHow, Signal, signal, sigprocmask};
use nix::unistd::{ForkResult, dup2, fork};

use crate::endpoint::{Direction, PipeEndpoint};
use crate::error::SpawnError;
use crate::process::ChildProcess;

/// Exit code of a child whose descriptor setup or exec failed.
const EXEC_FAILED: i32 = 127;

/// Where the child's standard output goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdoutMode {
    /// A pipe back to the parent (filter).
    Piped,
    /// Shared with the parent's stdout (sink).
    Inherit,
}

/// Parent-side handles for a freshly spawned child.
#[derive(Debug)]
pub struct SpawnedProcess {
    pub stdin: PipeEndpoint,
    pub stdout: Option<PipeEndpoint>,
    pub child: ChildProcess,
}

/// Extension point for different process creation strategies.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, command: &str, stdout: StdoutMode) -> Result<SpawnedProcess, SpawnError>;
}

/// Runs the command through a POSIX shell, with full shell semantics.
#[derive(Debug, Clone)]
pub struct ShellSpawner {
    shell: PathBuf,
}

impl Default for ShellSpawner {
    fn default() -> Self {
        Self {
            shell: PathBuf::from("/bin/sh"),
        }
    }
}

impl ShellSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.shell = shell.into();
        self
    }
}

impl ProcessSpawner for ShellSpawner {
    fn spawn(&self, command: &str, stdout: StdoutMode) -> Result<SpawnedProcess, SpawnError> {
        let shell = CString::new(self.shell.as_os_str().as_bytes())
            .map_err(|_| SpawnError::InvalidCommand(self.shell.display().to_string()))?;
        let argv = [
            c"sh".to_owned(),
            c"-c".to_owned(),
            CString::new(command).map_err(|_| SpawnError::InvalidCommand(command.to_string()))?,
        ];
        let argv_ptrs: [*const libc::c_char; 4] = [
            argv[0].as_ptr(),
            argv[1].as_ptr(),
            argv[2].as_ptr(),
            std::ptr::null(),
        ];

        let (stdin_read, stdin_write) = cloexec_pipe().map_err(|e| {
            tracing::error!(error = %e, "pipe() failed for child stdin");
            SpawnError::Pipe(e)
        })?;
        // The stdin pair is closed on drop if this fails.
        let stdout_pipe = match stdout {
            StdoutMode::Piped => Some(cloexec_pipe().map_err(|e| {
                tracing::error!(error = %e, "pipe() failed for child stdout");
                SpawnError::Pipe(e)
            })?),
            StdoutMode::Inherit => None,
        };

        // Safety: the child branch only calls async-signal-safe functions
        // (sigprocmask, signal, fcntl, dup2, close, execv, _exit) before replacing its image.
        match unsafe { fork() } {
            Err(e) => {
                tracing::error!(error = %e, "fork() failed");
                Err(SpawnError::Fork(e))
            }
            Ok(ForkResult::Child) => {
                exec_child(&shell, &argv_ptrs, stdin_read, stdin_write, stdout_pipe)
            }
            Ok(ForkResult::Parent { child }) => {
                let mut child = ChildProcess::new(child);
                tracing::info!(pid = child.pid(), command, "Spawned child process");

                drop(stdin_read);
                let stdout_read = stdout_pipe.map(|(read, write)| {
                    drop(write);
                    read
                });

                match configure_parent_ends(stdin_write, stdout_read) {
                    Ok((stdin, stdout)) => Ok(SpawnedProcess {
                        stdin,
                        stdout,
                        child,
                    }),
                    Err(e) => {
                        // Our ends are closed by now, so the child sees EOF on stdin
                        // and EPIPE on stdout. Reap it rather than leave a zombie.
                        let exit = child.reap();
                        tracing::warn!(
                            pid = child.pid(),
                            %exit,
                            "Reaped child after setup failure"
                        );
                        Err(e)
                    }
                }
            }
        }
    }
}

/// A pipe whose ends are close-on-exec from the start, so a child forked by
/// another thread never inherits them.
#[cfg(not(target_vendor = "apple"))]
fn cloexec_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
    nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)
}

// No pipe2 here; the flag is set right after creation.
#[cfg(target_vendor = "apple")]
fn cloexec_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
    let (read, write) = nix::unistd::pipe()?;
    for fd in [&read, &write] {
        fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    }
    Ok((read, write))
}

fn configure_parent_ends(
    stdin_write: OwnedFd,
    stdout_read: Option<OwnedFd>,
) -> Result<(PipeEndpoint, Option<PipeEndpoint>), SpawnError> {
    let stdin = PipeEndpoint::configure(stdin_write, Direction::WriteToChild)?;
    let stdout = stdout_read
        .map(|fd| PipeEndpoint::configure(fd, Direction::ReadFromChild))
        .transpose()?;
    Ok((stdin, stdout))
}

/// Child side of the fork. Never returns.
fn exec_child(
    shell: &CStr,
    argv: &[*const libc::c_char; 4],
    stdin_read: OwnedFd,
    stdin_write: OwnedFd,
    stdout_pipe: Option<(OwnedFd, OwnedFd)>,
) -> ! {
    // Restore default signal state; the parent may ignore SIGPIPE or block signals,
    // and both survive exec.
    let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None);
    // Safety: resetting to the default disposition installs no handler.
    let _ = unsafe { signal(Signal::SIGPIPE, SigHandler::SigDfl) };

    if redirect(stdin_read, libc::STDIN_FILENO).is_err() {
        exit_child();
    }
    drop(stdin_write);

    if let Some((stdout_read, stdout_write)) = stdout_pipe {
        if redirect(stdout_write, libc::STDOUT_FILENO).is_err() {
            exit_child();
        }
        drop(stdout_read);
    }

    // Safety: shell and argv point at NUL-terminated strings owned by the parent
    // frame, which the forked child still has mapped; argv is NULL-terminated.
    unsafe {
        libc::execv(shell.as_ptr(), argv.as_ptr());
    }
    exit_child()
}

/// Install `fd` as the child's `target` descriptor and close the original.
fn redirect(fd: OwnedFd, target: i32) -> nix::Result<()> {
    if fd.as_raw_fd() == target {
        // Already in place; dup2 would not clear close-on-exec, so do it here.
        fcntl(&fd, FcntlArg::F_SETFD(FdFlag::empty()))?;
        std::mem::forget(fd);
        return Ok(());
    }
    // Safety: target is a standard descriptor number owned by the child process.
    let mut target_fd = unsafe { OwnedFd::from_raw_fd(target) };
    let result = dup2(&fd, &mut target_fd);
    std::mem::forget(target_fd); // stays open as the child's stdio
    result
}

fn exit_child() -> ! {
    // Safety: _exit skips atexit handlers and stdio flushing inherited from the parent.
    unsafe { libc::_exit(EXEC_FAILED) }
}
