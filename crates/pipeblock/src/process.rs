//! The spawned child process and how it ended.

use std::fmt;

use nix::errno::Errno;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::Pid;
use serde::Serialize;

/// How the child terminated, as observed by `waitpid`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ChildExit {
    /// Normal exit with the given status code.
    Exited { code: i32 },
    /// Terminated by a signal.
    Signaled { signal: String },
    /// Status could not be collected.
    Unknown { reason: String },
}

impl ChildExit {
    pub fn code(&self) -> Option<i32> {
        match self {
            ChildExit::Exited { code } => Some(*code),
            _ => None,
        }
    }

    pub fn is_abnormal(&self) -> bool {
        !matches!(self, ChildExit::Exited { .. })
    }
}

impl fmt::Display for ChildExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildExit::Exited { code } => write!(f, "Process exited with code {code}"),
            ChildExit::Signaled { signal } => {
                write!(f, "Abnormal process termination (signal {signal})")
            }
            ChildExit::Unknown { reason } => {
                write!(f, "Abnormal process termination ({reason})")
            }
        }
    }
}

/// Exactly one per bridge. Reaped once, during teardown.
#[derive(Debug)]
pub struct ChildProcess {
    pid: Pid,
    exit: Option<ChildExit>,
}

impl ChildProcess {
    pub(crate) fn new(pid: Pid) -> Self {
        Self { pid, exit: None }
    }

    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// Unset until the child has been reaped.
    pub fn exit(&self) -> Option<&ChildExit> {
        self.exit.as_ref()
    }

    /// Block until the child terminates, retrying on EINTR.
    ///
    /// Any other wait failure is logged and recorded as [`ChildExit::Unknown`];
    /// the child is considered reaped either way.
    pub(crate) fn reap(&mut self) -> ChildExit {
        if let Some(exit) = &self.exit {
            return exit.clone();
        }
        let exit = self.wait_blocking();
        self.exit = Some(exit.clone());
        exit
    }

    fn wait_blocking(&self) -> ChildExit {
        loop {
            match waitpid(self.pid, None) {
                Ok(WaitStatus::Exited(_, code)) => return ChildExit::Exited { code },
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    return ChildExit::Signaled {
                        signal: signal.as_str().to_string(),
                    };
                }
                // Stop/continue notifications are only delivered with WUNTRACED /
                // WCONTINUED; keep waiting if one shows up anyway.
                Ok(status) => {
                    tracing::debug!(
                        pid = self.pid.as_raw(),
                        ?status,
                        "Ignoring non-terminal wait status"
                    );
                }
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    tracing::warn!(pid = self.pid.as_raw(), error = %e, "waitpid() failed");
                    return ChildExit::Unknown {
                        reason: format!("waitpid() failed: {e}"),
                    };
                }
            }
        }
    }
}
