//! Input requirements for a requested amount of output.

use crate::error::ConfigError;

/// Converts a requested output item count into the input item count the runtime
/// must make available, using a fixed output-per-input rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateForecaster {
    relative_rate: f64,
}

impl RateForecaster {
    pub fn new(relative_rate: f64) -> Result<Self, ConfigError> {
        if !relative_rate.is_finite() || relative_rate <= 0.0 {
            return Err(ConfigError::InvalidRelativeRate(relative_rate));
        }
        Ok(Self { relative_rate })
    }

    pub fn relative_rate(&self) -> f64 {
        self.relative_rate
    }

    /// `ceil(noutput_items / relative_rate)`: the smallest input count `k` with
    /// `k * relative_rate >= noutput_items`.
    ///
    /// The rounded quotient can sit one past or one short of that count (`3 / 0.1`
    /// rounds to just above 30), so the neighbour is checked by multiplying back.
    pub fn forecast(&self, noutput_items: usize) -> usize {
        let n = noutput_items as f64;
        let rate = self.relative_rate;
        let mut k = (n / rate).ceil();
        if k >= 1.0 && (k - 1.0) * rate >= n {
            k -= 1.0;
        } else if k * rate < n {
            k += 1.0;
        }
        k as usize
    }
}
