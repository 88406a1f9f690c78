//! Item bridge between a stream block and its child process.
//!
//! A filter bridge owns both pipes; a sink bridge owns only the child's stdin.
//! All steady-state I/O is nonblocking: "would block" shows up as zero progress.
//! The one blocking phase is teardown, which runs exactly once (on
//! [`ItemBridge::shutdown`] or drop).

use crate::endpoint::{ReadEndpoint, ReadOutcome, WriteEndpoint};
use crate::error::{BlockError, ConfigError, TransferError};
use crate::process::ChildProcess;
use crate::shutdown::{ShutdownSequence, ShutdownState, TeardownReport};
use crate::spawner::{ProcessSpawner, SpawnedProcess, StdoutMode};

/// Progress made by one processing cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Whole output items written into the caller's output buffer.
    pub produced: usize,
    /// Whole input items taken from the caller's input buffer.
    pub consumed: usize,
    /// The child has closed its stdout.
    pub output_closed: bool,
}

pub struct ItemBridge {
    input: Option<WriteEndpoint>,
    /// Set by `finish_input`; stdin closes once staged bytes are delivered.
    input_closing: bool,
    output: Option<ReadEndpoint>,
    child: ChildProcess,
    shutdown: ShutdownSequence,
}

impl ItemBridge {
    /// Spawn `command` with both stdin and stdout piped.
    pub fn filter(
        spawner: &dyn ProcessSpawner,
        command: &str,
        in_item_size: usize,
        out_item_size: usize,
        unbuffered: bool,
    ) -> Result<Self, BlockError> {
        check_item_size(in_item_size, "input")?;
        check_item_size(out_item_size, "output")?;
        let SpawnedProcess {
            stdin,
            stdout,
            child,
        } = spawner.spawn(command, StdoutMode::Piped)?;
        Ok(Self {
            input: Some(WriteEndpoint::new(stdin, in_item_size, unbuffered)),
            input_closing: false,
            output: stdout.map(|pipe| ReadEndpoint::new(pipe, out_item_size)),
            child,
            shutdown: ShutdownSequence::new(),
        })
    }

    /// Spawn `command` with only stdin piped; its stdout is inherited.
    pub fn sink(
        spawner: &dyn ProcessSpawner,
        command: &str,
        in_item_size: usize,
        unbuffered: bool,
    ) -> Result<Self, BlockError> {
        check_item_size(in_item_size, "input")?;
        let SpawnedProcess { stdin, child, .. } = spawner.spawn(command, StdoutMode::Inherit)?;
        Ok(Self {
            input: Some(WriteEndpoint::new(stdin, in_item_size, unbuffered)),
            input_closing: false,
            output: None,
            child,
            shutdown: ShutdownSequence::new(),
        })
    }

    pub fn pid(&self) -> i32 {
        self.child.pid()
    }

    pub fn state(&self) -> ShutdownState {
        self.shutdown.state()
    }

    /// Whether new input items can still be written.
    pub fn accepts_input(&self) -> bool {
        self.input.is_some() && !self.input_closing
    }

    pub fn set_unbuffered(&mut self, unbuffered: bool) {
        if let Some(input) = self.input.as_mut() {
            input.set_unbuffered(unbuffered);
        }
    }

    fn ensure_active(&self) -> Result<(), TransferError> {
        if self.shutdown.is_active() {
            Ok(())
        } else {
            Err(TransferError::Closed("bridge"))
        }
    }

    /// Read up to `max_items` whole items from the child.
    pub fn read_output(
        &mut self,
        out: &mut [u8],
        max_items: usize,
    ) -> Result<ReadOutcome, TransferError> {
        self.ensure_active()?;
        let output = self.output.as_mut().ok_or(TransferError::Closed("output"))?;
        output.read_items(out, max_items)
    }

    /// Offer up to `nitems` whole items to the child; returns how many it took.
    pub fn write_input(
        &mut self,
        input: &[u8],
        nitems: usize,
    ) -> Result<usize, TransferError> {
        self.ensure_active()?;
        if self.input_closing {
            return Err(TransferError::Closed("input"));
        }
        let endpoint = self.input.as_mut().ok_or(TransferError::Closed("input"))?;
        endpoint.write_items(input, nitems)
    }

    /// One filter cycle: drain ready output first, then push input.
    ///
    /// Reading first means a child blocked on a full stdout gets room before
    /// more work is committed to it. Input offered after [`finish_input`] is
    /// left unconsumed.
    ///
    /// [`finish_input`]: ItemBridge::finish_input
    pub fn cycle(
        &mut self,
        out: &mut [u8],
        noutput_items: usize,
        input: &[u8],
        ninput_items: usize,
    ) -> Result<CycleReport, TransferError> {
        let ReadOutcome { items, eof } = self.read_output(out, noutput_items)?;

        let consumed = if self.input_closing {
            self.advance_close()?;
            0
        } else if self.input.is_some() {
            self.write_input(input, ninput_items)?
        } else {
            0
        };

        Ok(CycleReport {
            produced: items,
            consumed,
            output_closed: eof,
        })
    }

    /// Stop accepting input and close the child's stdin once staged items are
    /// delivered, keeping its stdout open. Delivery never blocks: whatever the
    /// pipe cannot take now is retried on later cycles.
    pub fn finish_input(&mut self) -> Result<(), TransferError> {
        self.ensure_active()?;
        if self.input.is_some() {
            self.input_closing = true;
            self.advance_close()?;
        }
        Ok(())
    }

    /// Flush what the pipe takes right now; close stdin when nothing is left.
    fn advance_close(&mut self) -> Result<(), TransferError> {
        let Some(input) = self.input.as_mut() else {
            return Ok(());
        };
        if let Err(e) = input.flush_staged() {
            if let Some(input) = self.input.take() {
                input.close();
            }
            return Err(e);
        }
        if input.staged() == 0
            && let Some(input) = self.input.take()
        {
            input.close();
        }
        Ok(())
    }

    /// Tear the bridge down. Only the first call does anything.
    pub fn shutdown(&mut self) -> Option<TeardownReport> {
        let input = self.input.take();
        let output = self.output.take();
        self.shutdown.run(input, output, &mut self.child)
    }
}

fn check_item_size(size: usize, which: &'static str) -> Result<(), ConfigError> {
    if size == 0 {
        return Err(ConfigError::ZeroItemSize { which });
    }
    Ok(())
}

impl Drop for ItemBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}
