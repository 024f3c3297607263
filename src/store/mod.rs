//! The shared key-value contract breakers coordinate through.
//!
//! One logical breaker occupies four key namespaces derived from its key:
//! time-aligned buckets of success/failure counts, the state latch, the
//! probe semaphore and the ramp value. The layout is shared by every engine
//! on the same store:
//!
//! ```text
//! cb:{key}:b:{epoch}   hash, fields s and f; lifetime window + bucket
//! cb:{key}:latch       string, "Closed" | "Open" | "HalfOpen"
//! cb:{key}:probes      integer
//! cb:{key}:ramp        integer 0..=100
//! ```

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::state::State;

/// Storage operations a breaker engine needs.
///
/// Every operation is atomic against a single logical key; nothing here
/// assumes cross-key transactions. Implementations must be safe to share
/// across threads and across processes. Participants whose clocks disagree
/// by less than one bucket width lose nothing but the attribution of a few
/// counts to a neighbouring bucket.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Atomically counts one success or failure in the bucket at
    /// `align(now)`, setting or refreshing the bucket's lifetime to
    /// `window + bucket`.
    async fn record(
        &self,
        key: &str,
        success: bool,
        now: u64,
        window: Duration,
        bucket: Duration,
    ) -> Result<(), StoreError>;

    /// Sums successes and failures over the buckets whose aligned epoch lies
    /// in `[align(now - window), align(now)]`. Missing buckets read as zero;
    /// buckets expiring mid-read are tolerated.
    async fn read_window(
        &self,
        key: &str,
        now: u64,
        window: Duration,
        bucket: Duration,
    ) -> Result<(u64, u64), StoreError>;

    /// Reads the authoritative state latch. Absent means `Closed`.
    async fn read_latch(&self, key: &str) -> Result<Option<State>, StoreError>;

    /// Writes the state latch, with a lifetime when `ttl` is given.
    async fn set_latch(
        &self,
        key: &str,
        state: State,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    /// Claims a probe slot: increments the probe counter, starts the
    /// counter's lifetime on first use, and backs the increment out when
    /// more than `max_probes` slots would be outstanding.
    async fn try_acquire_probe(
        &self,
        key: &str,
        max_probes: u32,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Returns a probe slot. The counter may go transiently negative; its
    /// lifetime heals any stuck value.
    async fn release_probe(&self, key: &str) -> Result<(), StoreError>;

    /// Reads the ramp percentage. Absent means the ramp is complete.
    async fn read_ramp(&self, key: &str) -> Result<Option<u8>, StoreError>;

    /// Writes the ramp percentage with lifetime `ttl`.
    async fn set_ramp(&self, key: &str, percent: u8, ttl: Duration) -> Result<(), StoreError>;
}

#[async_trait]
impl<T> Store for Arc<T>
where
    T: Store + ?Sized,
{
    async fn record(
        &self,
        key: &str,
        success: bool,
        now: u64,
        window: Duration,
        bucket: Duration,
    ) -> Result<(), StoreError> {
        (**self).record(key, success, now, window, bucket).await
    }

    async fn read_window(
        &self,
        key: &str,
        now: u64,
        window: Duration,
        bucket: Duration,
    ) -> Result<(u64, u64), StoreError> {
        (**self).read_window(key, now, window, bucket).await
    }

    async fn read_latch(&self, key: &str) -> Result<Option<State>, StoreError> {
        (**self).read_latch(key).await
    }

    async fn set_latch(
        &self,
        key: &str,
        state: State,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        (**self).set_latch(key, state, ttl).await
    }

    async fn try_acquire_probe(
        &self,
        key: &str,
        max_probes: u32,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        (**self).try_acquire_probe(key, max_probes, ttl).await
    }

    async fn release_probe(&self, key: &str) -> Result<(), StoreError> {
        (**self).release_probe(key).await
    }

    async fn read_ramp(&self, key: &str) -> Result<Option<u8>, StoreError> {
        (**self).read_ramp(key).await
    }

    async fn set_ramp(&self, key: &str, percent: u8, ttl: Duration) -> Result<(), StoreError> {
        (**self).set_ramp(key, percent, ttl).await
    }
}

/// Aligns `t` (unix seconds) down to the epoch of its bucket.
pub(crate) fn align(t: u64, bucket: Duration) -> u64 {
    let width = bucket.as_secs().max(1);
    (t / width) * width
}

/// Epochs covered by the observation window ending at `now`, oldest first.
pub(crate) fn window_epochs(
    now: u64,
    window: Duration,
    bucket: Duration,
) -> impl Iterator<Item = u64> {
    let width = bucket.as_secs().max(1);
    let start = align(now.saturating_sub(window.as_secs()), bucket);
    let end = align(now, bucket);
    (start..=end).step_by(width as usize)
}

pub(crate) fn bucket_key(key: &str, epoch: u64) -> String {
    format!("cb:{key}:b:{epoch}")
}

pub(crate) fn latch_key(key: &str) -> String {
    format!("cb:{key}:latch")
}

pub(crate) fn probes_key(key: &str) -> String {
    format!("cb:{key}:probes")
}

pub(crate) fn ramp_key(key: &str) -> String {
    format!("cb:{key}:ramp")
}
