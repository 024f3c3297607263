use std::time::Duration;

use crate::error::Error;

const MAX_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Options for one breaker instance.
///
/// Two engines built with the same `key` over the same store are the same
/// logical breaker; every other field only shapes how this engine reacts to
/// what it observes. Validation runs once, when the breaker is built.
#[derive(Debug, Clone)]
pub struct Options {
    /// Breaker identity. Engines sharing a key share state.
    pub key: String,
    /// Sliding observation window.
    pub window: Duration,
    /// Width of the time-aligned buckets the window is counted in.
    pub bucket: Duration,
    /// Minimum observations in the window before the breaker may trip.
    pub min_samples: u32,
    /// Failure fraction that trips the breaker from `Closed`.
    pub failure_rate_to_open: f64,
    /// Dwell time in `Open` before probing starts.
    pub open_cooldown: Duration,
    /// Maximum concurrent probes cluster-wide while `HalfOpen`.
    pub half_open_max_probes: u32,
    /// Consecutive probe successes needed to close.
    pub half_open_successes_to_close: u32,
    /// Progressive restoration of primary traffic after closing.
    pub ramp: RampOptions,
}

/// Recovery ramp settings.
#[derive(Debug, Clone)]
pub struct RampOptions {
    /// Ordered routing weights, each the percentage of traffic sent to the
    /// primary while that step is active.
    pub percentages: Vec<u8>,
    /// Lifetime of each ramp step's stored value.
    pub hold_duration: Duration,
    /// Window failure fraction that aborts the ramp and re-opens.
    pub max_failure_rate_per_step: f64,
}

impl Options {
    /// Creates options for the breaker named `key`, with defaults sized for
    /// a typical external HTTP dependency.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            window: Duration::from_secs(60),
            bucket: Duration::from_secs(10),
            min_samples: 20,
            failure_rate_to_open: 0.5,
            open_cooldown: Duration::from_secs(30),
            half_open_max_probes: 1,
            half_open_successes_to_close: 2,
            ramp: RampOptions::default(),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.key.is_empty() {
            return Err(invalid("key must not be empty"));
        }
        if self.bucket < Duration::from_secs(1) {
            return Err(invalid("bucket must be at least one second"));
        }
        if self.bucket.subsec_nanos() != 0 || self.window.subsec_nanos() != 0 {
            return Err(invalid("window and bucket must be whole seconds"));
        }
        if self.window <= self.bucket {
            return Err(invalid("window must be longer than bucket"));
        }
        if self.window > MAX_WINDOW {
            return Err(invalid("window must not exceed 24 hours"));
        }
        if self.min_samples == 0 {
            return Err(invalid("min_samples must be at least 1"));
        }
        if !rate_valid(self.failure_rate_to_open) {
            return Err(invalid("failure_rate_to_open must be within 0.0..=1.0"));
        }
        if self.open_cooldown.is_zero() {
            return Err(invalid("open_cooldown must be positive"));
        }
        if self.half_open_max_probes == 0 {
            return Err(invalid("half_open_max_probes must be at least 1"));
        }
        if self.half_open_successes_to_close == 0 {
            return Err(invalid("half_open_successes_to_close must be at least 1"));
        }
        if self.ramp.percentages.is_empty() {
            return Err(invalid("ramp.percentages must not be empty"));
        }
        if self.ramp.percentages.iter().any(|&p| p > 100) {
            return Err(invalid("ramp.percentages entries must be within 0..=100"));
        }
        if self.ramp.hold_duration.is_zero() {
            return Err(invalid("ramp.hold_duration must be positive"));
        }
        if !rate_valid(self.ramp.max_failure_rate_per_step) {
            return Err(invalid(
                "ramp.max_failure_rate_per_step must be within 0.0..=1.0",
            ));
        }
        Ok(())
    }
}

impl Default for RampOptions {
    fn default() -> Self {
        Self {
            percentages: vec![25, 50, 100],
            hold_duration: Duration::from_secs(30),
            max_failure_rate_per_step: 0.1,
        }
    }
}

fn rate_valid(rate: f64) -> bool {
    rate.is_finite() && (0.0..=1.0).contains(&rate)
}

fn invalid(message: &str) -> Error {
    Error::Config(message.to_string())
}
