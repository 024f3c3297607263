//! A distributed circuit breaker.
//!
//! Many independent processes coordinate failure detection and endpoint
//! failover by sharing state through a key-value store with atomic counters
//! and expiring keys (typically Redis). A named breaker protects calls to a
//! primary endpoint: while the primary is healthy all traffic goes there,
//! while it is unhealthy traffic is diverted to a secondary, and after
//! recovery traffic is restored progressively. Every process observing the
//! same breaker key reaches the same decisions within one decision's lag.
//!
//! Callers bracket each protected call with the two-call protocol:
//! [`Breaker::decide`] picks the endpoint, the caller performs its I/O, and
//! [`Breaker::report`] feeds the outcome back.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//!
//! use tokio_util::sync::CancellationToken;
//! use tripwire::{Breaker, MemoryStore, Options};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), tripwire::Error> {
//! let mut options = Options::new("payments");
//! options.min_samples = 5;
//! options.open_cooldown = Duration::from_secs(10);
//!
//! let breaker = Breaker::new(options, MemoryStore::new())?;
//! let cancel = CancellationToken::new();
//!
//! let decision = breaker
//!     .decide("https://primary.example", "https://fallback.example", &cancel)
//!     .await?;
//! // ... call decision.endpoint ...
//! breaker.report(true, decision.probe, &cancel).await?;
//! # Ok(())
//! # }
//! ```
//!
//! Production deployments share a [`RedisStore`] between processes:
//!
//! ```no_run
//! # async fn connect() -> Result<(), tripwire::Error> {
//! use tripwire::{Breaker, Options, RedisStore, Telemetry};
//!
//! let store = RedisStore::connect("redis://localhost:6379").await?;
//! let breaker = Breaker::builder(Options::new("payments"), store)
//!     .instrument(Telemetry::new("payments"))
//!     .build()?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_debug_implementations)]
#![deny(missing_docs)]
#![cfg_attr(test, deny(warnings))]

mod config;
mod engine;
mod error;
mod instrument;
mod quota;
mod state;

pub mod clock;
pub mod store;

pub use self::config::{Options, RampOptions};
pub use self::engine::{Breaker, Builder, Decision};
pub use self::error::{Error, StoreError};
pub use self::instrument::{Instrument, NoopInstrument, Telemetry};
pub use self::quota::{QuotaBreaker, QuotaOptions};
pub use self::state::{ParseStateError, State};
pub use self::store::{MemoryStore, RedisStore, Store};
