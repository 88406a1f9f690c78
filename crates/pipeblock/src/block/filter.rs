use crate::block::WorkOutput;
use crate::bridge::ItemBridge;
use crate::config::FilterConfig;
use crate::error::Result;
use crate::forecast::RateForecaster;
use crate::shutdown::TeardownReport;

/// General block that runs each cycle's items through a shell command.
///
/// The runtime calls [`forecast`](PipeFilter::forecast) to size the input it
/// provides, then [`general_work`](PipeFilter::general_work) once per
/// scheduling pass.
pub struct PipeFilter {
    in_item_size: usize,
    out_item_size: usize,
    forecaster: RateForecaster,
    bridge: ItemBridge,
    done: bool,
}

impl PipeFilter {
    pub fn new(config: FilterConfig) -> Result<Self> {
        config.validate()?;
        let forecaster = RateForecaster::new(config.relative_rate)?;
        let bridge = ItemBridge::filter(
            config.spawner.as_ref(),
            &config.command,
            config.in_item_size,
            config.out_item_size,
            config.unbuffered,
        )?;

        tracing::debug!(
            pid = bridge.pid(),
            in_item_size = config.in_item_size,
            out_item_size = config.out_item_size,
            relative_rate = config.relative_rate,
            unbuffered = config.unbuffered,
            "Pipe filter ready"
        );

        Ok(Self {
            in_item_size: config.in_item_size,
            out_item_size: config.out_item_size,
            forecaster,
            bridge,
            done: false,
        })
    }

    pub fn in_item_size(&self) -> usize {
        self.in_item_size
    }

    pub fn out_item_size(&self) -> usize {
        self.out_item_size
    }

    pub fn relative_rate(&self) -> f64 {
        self.forecaster.relative_rate()
    }

    pub fn pid(&self) -> i32 {
        self.bridge.pid()
    }

    /// Input items required before producing `noutput_items`.
    pub fn forecast(&self, noutput_items: usize) -> usize {
        self.forecaster.forecast(noutput_items)
    }

    pub fn set_unbuffered(&mut self, unbuffered: bool) {
        self.bridge.set_unbuffered(unbuffered);
    }

    /// True once the child has closed its stdout and everything it wrote has
    /// been produced.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Read up to `noutput_items` items into `output`, then offer `input` to the
    /// child. Either count may be zero when the pipes are not ready.
    pub fn general_work(
        &mut self,
        noutput_items: usize,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<WorkOutput> {
        if self.done {
            return Ok(WorkOutput::default());
        }

        let ninput_items = input.len() / self.in_item_size;
        let noutput_items = noutput_items.min(output.len() / self.out_item_size);
        let report = self
            .bridge
            .cycle(output, noutput_items, input, ninput_items)?;

        if report.output_closed && report.produced == 0 {
            tracing::debug!(pid = self.bridge.pid(), "Child closed stdout");
            self.done = true;
        }

        Ok(WorkOutput {
            produced: report.produced,
            consumed: report.consumed,
        })
    }

    /// Signal end of input. Staged items are delivered as the pipe takes them,
    /// then the child's stdin is closed; neither step blocks. Keep calling
    /// `general_work` until [`is_done`](Self::is_done).
    pub fn finish_input(&mut self) -> Result<()> {
        self.bridge.finish_input()?;
        Ok(())
    }

    /// Run teardown now instead of on drop. Only the first call reports.
    pub fn shutdown(&mut self) -> Option<TeardownReport> {
        self.bridge.shutdown()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::error::{BlockError, ConfigError, TransferError};
    use crate::process::ChildExit;

    fn run_to_completion(
        filter: &mut PipeFilter,
        data: &[u8],
        noutput_items: usize,
    ) -> Vec<u8> {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut pending = data.to_vec();
        let mut produced = Vec::new();
        let mut output = vec![0u8; noutput_items * filter.out_item_size()];
        let mut finished = false;

        while !filter.is_done() {
            assert!(Instant::now() < deadline, "filter did not finish");
            let work = filter
                .general_work(noutput_items, &pending, &mut output)
                .unwrap();
            produced.extend_from_slice(&output[..work.produced * filter.out_item_size()]);
            pending.drain(..work.consumed * filter.in_item_size());

            if pending.is_empty() && !finished {
                filter.finish_input().unwrap();
                finished = true;
            }
            if work == WorkOutput::default() {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        produced
    }

    #[test]
    fn forecast_uses_relative_rate() {
        let filter = PipeFilter::new(FilterConfig::new("cat").with_relative_rate(2.0)).unwrap();
        assert_eq!(filter.relative_rate(), 2.0);
        assert_eq!(filter.forecast(100), 50);
        assert_eq!(filter.forecast(0), 0);
    }

    #[test]
    fn invalid_config_never_spawns() {
        let err = PipeFilter::new(FilterConfig::new("cat").with_in_item_size(0))
            .err()
            .unwrap();
        assert!(matches!(
            err,
            BlockError::Config(ConfigError::ZeroItemSize { which: "input" })
        ));
    }

    #[test]
    fn doubles_items_at_rate_two() {
        // every character is repeated, so output runs at about twice the input rate
        let config = FilterConfig::new("sed 's/./&&/g'").with_relative_rate(2.0);
        let mut filter = PipeFilter::new(config).unwrap();

        let produced = run_to_completion(&mut filter, b"abc\n", 8);
        assert_eq!(produced, b"aabbcc\n");
    }

    #[test]
    fn mixed_item_sizes() {
        // four 1-byte items in, one 4-byte item out
        let config = FilterConfig::new("cat")
            .with_in_item_size(1)
            .with_out_item_size(4)
            .with_relative_rate(0.25)
            .with_unbuffered(true);
        let mut filter = PipeFilter::new(config).unwrap();

        let produced = run_to_completion(&mut filter, b"0123456789ab", 2);
        assert_eq!(produced, b"0123456789ab");
        assert_eq!(filter.forecast(3), 12);
    }

    #[test]
    fn done_filter_reports_no_progress() {
        let mut filter = PipeFilter::new(FilterConfig::new("true")).unwrap();
        let produced = run_to_completion(&mut filter, b"", 4);
        assert!(produced.is_empty());

        let mut output = [0u8; 4];
        let work = filter.general_work(4, b"zz", &mut output).unwrap();
        assert_eq!(work, WorkOutput::default());
    }

    #[test]
    fn teardown_reports_exit_code() {
        let mut filter = PipeFilter::new(FilterConfig::new("exit 3")).unwrap();
        let report = filter.shutdown().unwrap();
        assert_eq!(report.exit, ChildExit::Exited { code: 3 });
        assert!(filter.shutdown().is_none());

        let mut output = [0u8; 1];
        let err = filter.general_work(1, b"", &mut output).unwrap_err();
        assert!(matches!(
            err,
            BlockError::Transfer(TransferError::Closed("bridge"))
        ));
    }

    #[test]
    fn drop_runs_teardown() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("stdin-closed");
        let command = format!("cat > /dev/null; touch '{}'", marker.display());

        let filter = PipeFilter::new(FilterConfig::new(command)).unwrap();
        drop(filter);

        // teardown closed stdin, then waited for the child to finish
        assert!(marker.exists());
    }
}
