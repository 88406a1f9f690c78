//! Construction parameters for the pipe blocks.

use std::sync::Arc;

use crate::error::ConfigError;
use crate::spawner::{ProcessSpawner, ShellSpawner};

/// Parameters for a [`PipeFilter`](crate::PipeFilter).
#[derive(Clone)]
pub struct FilterConfig {
    pub command: String,
    pub in_item_size: usize,
    pub out_item_size: usize,
    /// Output items produced per input item consumed.
    pub relative_rate: f64,
    pub unbuffered: bool,
    pub spawner: Arc<dyn ProcessSpawner>,
}

impl FilterConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            in_item_size: 1,
            out_item_size: 1,
            relative_rate: 1.0,
            unbuffered: false,
            spawner: Arc::new(ShellSpawner::new()),
        }
    }

    pub fn with_in_item_size(mut self, size: usize) -> Self {
        self.in_item_size = size;
        self
    }

    pub fn with_out_item_size(mut self, size: usize) -> Self {
        self.out_item_size = size;
        self
    }

    pub fn with_relative_rate(mut self, rate: f64) -> Self {
        self.relative_rate = rate;
        self
    }

    pub fn with_unbuffered(mut self, unbuffered: bool) -> Self {
        self.unbuffered = unbuffered;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn ProcessSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_command(&self.command)?;
        if self.in_item_size == 0 {
            return Err(ConfigError::ZeroItemSize { which: "input" });
        }
        if self.out_item_size == 0 {
            return Err(ConfigError::ZeroItemSize { which: "output" });
        }
        if !self.relative_rate.is_finite() || self.relative_rate <= 0.0 {
            return Err(ConfigError::InvalidRelativeRate(self.relative_rate));
        }
        Ok(())
    }
}

/// Parameters for a [`PipeSink`](crate::PipeSink).
#[derive(Clone)]
pub struct SinkConfig {
    pub command: String,
    pub in_item_size: usize,
    pub unbuffered: bool,
    pub spawner: Arc<dyn ProcessSpawner>,
}

impl SinkConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            in_item_size: 1,
            unbuffered: false,
            spawner: Arc::new(ShellSpawner::new()),
        }
    }

    pub fn with_in_item_size(mut self, size: usize) -> Self {
        self.in_item_size = size;
        self
    }

    pub fn with_unbuffered(mut self, unbuffered: bool) -> Self {
        self.unbuffered = unbuffered;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn ProcessSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_command(&self.command)?;
        if self.in_item_size == 0 {
            return Err(ConfigError::ZeroItemSize { which: "input" });
        }
        Ok(())
    }
}

fn validate_command(command: &str) -> Result<(), ConfigError> {
    if command.trim().is_empty() {
        return Err(ConfigError::EmptyCommand);
    }
    Ok(())
}
