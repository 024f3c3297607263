use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{align, window_epochs, Store};
use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use crate::state::State;

/// In-process reference store.
///
/// Satisfies the same contract as the distributed stores, so a single
/// process (or a test) can run a breaker without any external service.
/// Lifetimes are driven by the injected clock and expired entries are
/// pruned on access.
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    buckets: HashMap<String, HashMap<u64, Bucket>>,
    latches: HashMap<String, Latch>,
    probes: HashMap<String, ProbeCounter>,
    ramps: HashMap<String, Ramp>,
}

struct Bucket {
    successes: u64,
    failures: u64,
    expires_at: u64,
}

struct Latch {
    state: State,
    expires_at: Option<u64>,
}

struct ProbeCounter {
    value: i64,
    expires_at: Option<u64>,
}

struct Ramp {
    percent: u8,
    expires_at: u64,
}

impl MemoryStore {
    /// Creates a store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates a store reading time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn record(
        &self,
        key: &str,
        success: bool,
        now: u64,
        window: Duration,
        bucket: Duration,
    ) -> Result<(), StoreError> {
        let epoch = align(now, bucket);
        let lifetime = window.as_secs() + bucket.as_secs();

        let mut inner = self.inner.lock();
        let per_key = inner.buckets.entry(key.to_string()).or_default();
        per_key.retain(|_, slot| now < slot.expires_at);

        let slot = per_key.entry(epoch).or_insert(Bucket {
            successes: 0,
            failures: 0,
            expires_at: 0,
        });
        if success {
            slot.successes += 1;
        } else {
            slot.failures += 1;
        }
        slot.expires_at = now + lifetime;
        Ok(())
    }

    async fn read_window(
        &self,
        key: &str,
        now: u64,
        window: Duration,
        bucket: Duration,
    ) -> Result<(u64, u64), StoreError> {
        let mut inner = self.inner.lock();
        let (mut successes, mut failures) = (0, 0);
        if let Some(per_key) = inner.buckets.get_mut(key) {
            per_key.retain(|_, slot| now < slot.expires_at);
            for epoch in window_epochs(now, window, bucket) {
                if let Some(slot) = per_key.get(&epoch) {
                    successes += slot.successes;
                    failures += slot.failures;
                }
            }
        }
        Ok((successes, failures))
    }

    async fn read_latch(&self, key: &str) -> Result<Option<State>, StoreError> {
        let now = self.clock.now_unix();
        let mut inner = self.inner.lock();
        let expired = matches!(
            inner.latches.get(key),
            Some(latch) if latch.expires_at.is_some_and(|at| now >= at)
        );
        if expired {
            inner.latches.remove(key);
            return Ok(None);
        }
        Ok(inner.latches.get(key).map(|latch| latch.state))
    }

    async fn set_latch(
        &self,
        key: &str,
        state: State,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let now = self.clock.now_unix();
        self.inner.lock().latches.insert(
            key.to_string(),
            Latch {
                state,
                expires_at: ttl.map(|t| now + t.as_secs()),
            },
        );
        Ok(())
    }

    async fn try_acquire_probe(
        &self,
        key: &str,
        max_probes: u32,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now_unix();
        let mut inner = self.inner.lock();
        let counter = inner.probes.entry(key.to_string()).or_insert(ProbeCounter {
            value: 0,
            expires_at: None,
        });
        if counter.expires_at.is_some_and(|at| now >= at) {
            counter.value = 0;
            counter.expires_at = None;
        }

        counter.value += 1;
        if counter.value == 1 {
            counter.expires_at = Some(now + ttl.as_secs());
        }
        if counter.value > i64::from(max_probes) {
            counter.value -= 1;
            return Ok(false);
        }
        Ok(true)
    }

    async fn release_probe(&self, key: &str) -> Result<(), StoreError> {
        let now = self.clock.now_unix();
        let mut inner = self.inner.lock();
        let counter = inner.probes.entry(key.to_string()).or_insert(ProbeCounter {
            value: 0,
            expires_at: None,
        });
        if counter.expires_at.is_some_and(|at| now >= at) {
            counter.value = 0;
            counter.expires_at = None;
        }
        counter.value -= 1;
        Ok(())
    }

    async fn read_ramp(&self, key: &str) -> Result<Option<u8>, StoreError> {
        let now = self.clock.now_unix();
        let mut inner = self.inner.lock();
        let expired = matches!(inner.ramps.get(key), Some(ramp) if now >= ramp.expires_at);
        if expired {
            inner.ramps.remove(key);
            return Ok(None);
        }
        Ok(inner.ramps.get(key).map(|ramp| ramp.percent))
    }

    async fn set_ramp(&self, key: &str, percent: u8, ttl: Duration) -> Result<(), StoreError> {
        let now = self.clock.now_unix();
        self.inner.lock().ramps.insert(
            key.to_string(),
            Ramp {
                percent,
                expires_at: now + ttl.as_secs(),
            },
        );
        Ok(())
    }
}
