use crate::bridge::ItemBridge;
use crate::config::SinkConfig;
use crate::error::Result;
use crate::shutdown::TeardownReport;

/// Sync block that feeds every item into a shell command's stdin. The command's
/// stdout is the host process's stdout.
pub struct PipeSink {
    in_item_size: usize,
    bridge: ItemBridge,
}

impl PipeSink {
    pub fn new(config: SinkConfig) -> Result<Self> {
        config.validate()?;
        let bridge = ItemBridge::sink(
            config.spawner.as_ref(),
            &config.command,
            config.in_item_size,
            config.unbuffered,
        )?;

        tracing::debug!(
            pid = bridge.pid(),
            in_item_size = config.in_item_size,
            unbuffered = config.unbuffered,
            "Pipe sink ready"
        );

        Ok(Self {
            in_item_size: config.in_item_size,
            bridge,
        })
    }

    pub fn in_item_size(&self) -> usize {
        self.in_item_size
    }

    pub fn pid(&self) -> i32 {
        self.bridge.pid()
    }

    pub fn set_unbuffered(&mut self, unbuffered: bool) {
        self.bridge.set_unbuffered(unbuffered);
    }

    /// Offer every whole item in `input`; returns how many the child accepted.
    pub fn work(&mut self, input: &[u8]) -> Result<usize> {
        let nitems = input.len() / self.in_item_size;
        Ok(self.bridge.write_input(input, nitems)?)
    }

    pub fn shutdown(&mut self) -> Option<TeardownReport> {
        self.bridge.shutdown()
    }
}
