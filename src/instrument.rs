/// Observability seam for a breaker.
///
/// The engine invokes these hooks on its hot path; implementations must be
/// cheap and must not fail.
pub trait Instrument: Send + Sync {
    /// A routing decision was requested.
    fn on_request(&self);

    /// A protected call was reported successful.
    fn on_success(&self);

    /// A protected call was reported failed.
    fn on_failure(&self);

    /// The breaker tripped open.
    fn on_open(&self);

    /// The breaker began probing the primary.
    fn on_half_open(&self);

    /// The breaker closed.
    fn on_closed(&self);
}

/// An instrument that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopInstrument;

impl Instrument for NoopInstrument {
    fn on_request(&self) {}
    fn on_success(&self) {}
    fn on_failure(&self) {}
    fn on_open(&self) {}
    fn on_half_open(&self) {}
    fn on_closed(&self) {}
}

/// An instrument publishing through the `metrics` and `tracing` crates.
///
/// Emits three monotonic counters, `requests_total`, `successes_total` and
/// `failures_total`, each labelled with the breaker key, and logs state
/// transitions.
#[derive(Debug, Clone)]
pub struct Telemetry {
    key: String,
}

impl Telemetry {
    /// Creates a telemetry instrument for the breaker named `key`.
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl Instrument for Telemetry {
    fn on_request(&self) {
        metrics::counter!("requests_total", "key" => self.key.clone()).increment(1);
    }

    fn on_success(&self) {
        metrics::counter!("successes_total", "key" => self.key.clone()).increment(1);
    }

    fn on_failure(&self) {
        metrics::counter!("failures_total", "key" => self.key.clone()).increment(1);
    }

    fn on_open(&self) {
        tracing::warn!(key = %self.key, "breaker opened");
    }

    fn on_half_open(&self) {
        tracing::info!(key = %self.key, "breaker half-open, probing primary");
    }

    fn on_closed(&self) {
        tracing::info!(key = %self.key, "breaker closed");
    }
}
