use thiserror::Error;

/// Construction-time failure while creating the child process and its pipes.
///
/// Any descriptor opened before the failing step has already been closed when
/// this error is returned.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("pipe() failed: {0}")]
    Pipe(#[source] nix::Error),

    #[error("fork() failed: {0}")]
    Fork(#[source] nix::Error),

    #[error("fcntl() failed on fd {fd}: {source}")]
    Fcntl {
        fd: i32,
        #[source]
        source: nix::Error,
    },

    #[error("command contains an interior NUL byte: {0:?}")]
    InvalidCommand(String),
}

/// Genuine I/O failure during a processing cycle. "Would block" is never reported
/// through this type.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("read from child stdout failed: {0}")]
    Read(#[source] std::io::Error),

    #[error("write to child stdin failed: {0}")]
    Write(#[source] std::io::Error),

    #[error("{0} endpoint is closed")]
    Closed(&'static str),
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{which} item size must be at least one byte")]
    ZeroItemSize { which: &'static str },

    #[error("relative rate must be a positive finite number, got {0}")]
    InvalidRelativeRate(f64),

    #[error("command must not be empty")]
    EmptyCommand,
}

/// Error surfaced by the stream blocks to their owning runtime.
#[derive(Debug, Error)]
pub enum BlockError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

pub type Result<T> = std::result::Result<T, BlockError>;
