use std::fmt::{self, Debug};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::engine::race;
use crate::error::Error;
use crate::store::Store;

/// Options for a [`QuotaBreaker`].
#[derive(Debug, Clone)]
pub struct QuotaOptions {
    /// Identity; the per-period counter lives under this key.
    pub key: String,
    /// Calls allowed to the primary per period.
    pub quota: u32,
    /// Length of one accounting period.
    pub period: Duration,
}

/// A simpler companion to [`Breaker`](crate::Breaker): routes to the
/// secondary once the period's quota of primary calls is spent.
///
/// Built on the store's capped increment-with-lifetime, so engines in many
/// processes share one quota. There is nothing to report; the counter
/// resets itself when the period's lifetime runs out.
pub struct QuotaBreaker<S> {
    options: QuotaOptions,
    store: S,
}

impl<S: Store> QuotaBreaker<S> {
    /// Validates `options` and builds the breaker.
    pub fn new(options: QuotaOptions, store: S) -> Result<Self, Error> {
        if options.key.is_empty() {
            return Err(Error::Config("key must not be empty".to_string()));
        }
        if options.quota == 0 {
            return Err(Error::Config("quota must be at least 1".to_string()));
        }
        if options.period.is_zero() {
            return Err(Error::Config("period must be positive".to_string()));
        }
        Ok(Self { options, store })
    }

    /// Routes one call: the primary while quota remains, the secondary
    /// after.
    pub async fn decide<E>(
        &self,
        primary: E,
        secondary: E,
        cancel: &CancellationToken,
    ) -> Result<E, Error> {
        let within = race(
            cancel,
            self.store.try_acquire_probe(
                &self.options.key,
                self.options.quota,
                self.options.period,
            ),
        )
        .await?;
        Ok(if within { primary } else { secondary })
    }
}

impl<S> Debug for QuotaBreaker<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuotaBreaker")
            .field("key", &self.options.key)
            .field("quota", &self.options.quota)
            .finish_non_exhaustive()
    }
}
