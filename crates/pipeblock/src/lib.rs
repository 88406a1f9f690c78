//! pipeblock: stream fixed-size items through an external shell command.
//!
//! A [`PipeFilter`] writes its input to a child's stdin and produces whatever
//! the child writes to stdout. A [`PipeSink`] only feeds stdin. Both use
//! nonblocking pipes so a slow child never stalls the caller, and both tear the
//! child down (close, drain, reap) exactly once.

#[cfg(not(unix))]
compile_error!("pipeblock spawns children with fork/exec and needs a Unix host");

pub mod block;
pub mod bridge;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod forecast;
pub mod process;
pub mod shutdown;
pub mod spawner;

pub use block::filter::PipeFilter;
pub use block::sink::PipeSink;
pub use block::WorkOutput;
pub use bridge::{CycleReport, ItemBridge};
pub use config::{FilterConfig, SinkConfig};
pub use error::{BlockError, ConfigError, SpawnError, TransferError};
pub use forecast::RateForecaster;
pub use process::{ChildExit, ChildProcess};
pub use shutdown::{DRAIN_ATTEMPTS, ShutdownState, TeardownReport};
pub use spawner::{ProcessSpawner, ShellSpawner, SpawnedProcess, StdoutMode};
