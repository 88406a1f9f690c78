//! One-shot teardown: close the child's stdin, drain its stdout, reap it.
//!
//! Staged input is delivered before stdin closes, but only while the child's
//! stdout keeps being read, so a child blocked on a full stdout cannot stall the
//! flush. The final drain uses blocking reads and is capped at
//! [`DRAIN_ATTEMPTS`].
//!
//! Every step is best effort. Failures are logged and recorded in the
//! [`TeardownReport`]; teardown itself always reaches [`ShutdownState::Reaped`].

use std::os::fd::AsFd;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use serde::Serialize;

use crate::endpoint::{ReadEndpoint, WriteEndpoint};
use crate::process::{ChildExit, ChildProcess};

/// Upper bound on blocking reads while draining. A child that never closes its
/// stdout would otherwise hang teardown.
pub const DRAIN_ATTEMPTS: usize = 256;

/// Bytes discarded per drain read.
const DRAIN_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownState {
    #[default]
    Active,
    Draining,
    Reaped,
}

/// What teardown observed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TeardownReport {
    pub pid: i32,
    /// Reads performed on the child's stdout.
    pub drain_attempts: usize,
    /// Bytes read and discarded while draining.
    pub drained_bytes: usize,
    /// The drain stopped at [`DRAIN_ATTEMPTS`] with the child still writing.
    pub drain_exhausted: bool,
    pub exit: ChildExit,
}

#[derive(Debug, Default)]
pub struct ShutdownSequence {
    state: ShutdownState,
}

/// Read attempts and bytes spent on the child's stdout during teardown. Reads made
/// while delivering staged input count against the same cap as the final drain.
#[derive(Debug, Default)]
struct DrainProgress {
    attempts: usize,
    bytes: usize,
    exhausted: bool,
}

impl DrainProgress {
    fn budget_left(&mut self) -> bool {
        if self.attempts < DRAIN_ATTEMPTS {
            return true;
        }
        if !self.exhausted {
            tracing::warn!(
                attempts = self.attempts,
                bytes = self.bytes,
                "Child still writing after drain limit, giving up"
            );
            self.exhausted = true;
        }
        false
    }
}

impl ShutdownSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ShutdownState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == ShutdownState::Active
    }

    /// Run teardown. Returns `None` if it already ran.
    pub fn run(
        &mut self,
        input: Option<WriteEndpoint>,
        output: Option<ReadEndpoint>,
        child: &mut ChildProcess,
    ) -> Option<TeardownReport> {
        if self.state != ShutdownState::Active {
            tracing::debug!(pid = child.pid(), "Teardown already ran");
            return None;
        }
        self.state = ShutdownState::Draining;
        tracing::debug!(pid = child.pid(), "Draining child process");

        let mut output = output;
        let mut progress = DrainProgress::default();

        if let Some(mut input) = input {
            deliver_staged(&mut input, output.as_mut(), &mut progress);
            input.close();
        }

        if let Some(mut out) = output {
            if let Err(e) = out.pipe_mut().set_nonblocking(false) {
                tracing::warn!(error = %e, "Failed to switch child stdout to blocking mode");
            }
            drain(&mut out, &mut progress);
        }

        let exit = child.reap();
        self.state = ShutdownState::Reaped;
        tracing::info!(pid = child.pid(), "{}", exit);

        Some(TeardownReport {
            pid: child.pid(),
            drain_attempts: progress.attempts,
            drained_bytes: progress.bytes,
            drain_exhausted: progress.exhausted,
            exit,
        })
    }
}

/// Push staged input into the child without ever blocking on its stdin alone.
///
/// Waits for stdin to become writable or stdout readable; stdout data is read
/// and discarded so a child stuck on a full stdout can get back to reading.
/// Stops when nothing is staged, on a write error, or when the drain budget
/// runs out. Anything still staged is discarded by the caller's `close`.
fn deliver_staged(
    input: &mut WriteEndpoint,
    mut output: Option<&mut ReadEndpoint>,
    progress: &mut DrainProgress,
) {
    let mut buf = [0u8; DRAIN_CHUNK];

    loop {
        match input.flush_staged() {
            Ok(_) if input.staged() == 0 => return,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Failed to deliver staged input at teardown");
                return;
            }
        }
        if output.is_some() && !progress.budget_left() {
            return;
        }

        let stdout_ready = {
            let mut fds = vec![PollFd::new(input.pipe().as_fd(), PollFlags::POLLOUT)];
            if let Some(out) = output.as_deref() {
                fds.push(PollFd::new(out.pipe().as_fd(), PollFlags::POLLIN));
            }
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "poll() failed while delivering staged input");
                    return;
                }
            }
            fds.get(1)
                .and_then(|fd| fd.revents())
                .is_some_and(|ev| !ev.is_empty())
        };

        if stdout_ready && let Some(out) = output.as_deref_mut() {
            progress.attempts += 1;
            match out.read_raw(&mut buf) {
                Ok(Some(0)) => output = None,
                Ok(Some(n)) => progress.bytes += n,
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "read() failed while draining child stdout");
                    output = None;
                }
            }
        }
    }
}

/// Blocking read-and-discard until EOF, an error, or the attempt cap.
fn drain(out: &mut ReadEndpoint, progress: &mut DrainProgress) {
    let mut buf = [0u8; DRAIN_CHUNK];

    while progress.budget_left() {
        progress.attempts += 1;
        match out.read_raw(&mut buf) {
            Ok(Some(0)) => break,
            Ok(Some(n)) => progress.bytes += n,
            Ok(None) => {
                tracing::debug!("Child stdout would block during drain, stopping");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "read() failed while draining child stdout");
                break;
            }
        }
    }

    if out.carried() > 0 {
        tracing::debug!(bytes = out.carried(), "Discarding partial item at teardown");
    }
    tracing::debug!(
        attempts = progress.attempts,
        bytes = progress.bytes,
        "Drained child stdout"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{Direction, PipeEndpoint};
    use crate::spawner::{ProcessSpawner, ShellSpawner, SpawnedProcess, StdoutMode};

    fn spawn(command: &str) -> (WriteEndpoint, ReadEndpoint, ChildProcess) {
        let SpawnedProcess {
            stdin,
            stdout,
            child,
        } = ShellSpawner::new().spawn(command, StdoutMode::Piped).unwrap();
        assert_eq!(stdin.direction(), Direction::WriteToChild);
        let stdout: PipeEndpoint = stdout.unwrap();
        (
            WriteEndpoint::new(stdin, 1, false),
            ReadEndpoint::new(stdout, 1),
            child,
        )
    }

    #[test]
    fn drains_output_and_reports_exit_code() {
        let (input, output, mut child) = spawn("cat; exit 3");
        let mut seq = ShutdownSequence::new();
        assert_eq!(seq.state(), ShutdownState::Active);

        let report = seq.run(Some(input), Some(output), &mut child).unwrap();
        assert_eq!(seq.state(), ShutdownState::Reaped);
        assert_eq!(report.exit, ChildExit::Exited { code: 3 });
        assert!(!report.drain_exhausted);
        assert_eq!(child.exit(), Some(&ChildExit::Exited { code: 3 }));
    }

    #[test]
    fn staged_input_reaches_child_before_close() {
        let (mut input, output, mut child) = spawn("wc -c");
        input.write_items(b"12345", 5).unwrap();
        assert_eq!(input.staged(), 5);

        let report = ShutdownSequence::new()
            .run(Some(input), Some(output), &mut child)
            .unwrap();
        // `wc -c` prints the count it saw, which the drain discards
        assert!(report.drained_bytes > 0);
        assert_eq!(report.exit.code(), Some(0));
    }

    #[test]
    fn endless_writer_hits_drain_cap() {
        let (input, output, mut child) = spawn("yes");
        let report = ShutdownSequence::new()
            .run(Some(input), Some(output), &mut child)
            .unwrap();

        assert!(report.drain_exhausted);
        assert_eq!(report.drain_attempts, DRAIN_ATTEMPTS);
        // closing stdout kills `yes` with SIGPIPE; a shell that forks instead of
        // exec'ing reports that as 128 + 13
        assert!(report.exit.is_abnormal() || report.exit.code() == Some(141));
    }

    #[test]
    fn signal_termination_is_abnormal() {
        let (input, output, mut child) = spawn("kill -9 $$");
        let report = ShutdownSequence::new()
            .run(Some(input), Some(output), &mut child)
            .unwrap();

        assert_eq!(
            report.exit,
            ChildExit::Signaled {
                signal: "SIGKILL".to_string()
            }
        );
        assert_eq!(report.exit.code(), None);
    }

    #[test]
    fn second_run_is_a_no_op() {
        let (input, output, mut child) = spawn("exit 0");
        let mut seq = ShutdownSequence::new();
        assert!(seq.run(Some(input), Some(output), &mut child).is_some());
        assert!(seq.run(None, None, &mut child).is_none());
        assert_eq!(seq.state(), ShutdownState::Reaped);
    }
}
