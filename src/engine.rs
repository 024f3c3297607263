use std::fmt::{self, Debug};
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug_span, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::Options;
use crate::error::{Error, StoreError};
use crate::instrument::{Instrument, NoopInstrument};
use crate::state::State;
use crate::store::Store;

/// The outcome of [`Breaker::decide`]: where to send one protected call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision<E> {
    /// The endpoint the caller should use.
    pub endpoint: E,
    /// Whether this call is a recovery probe. A probe must be reported with
    /// `was_probe = true` so its slot is returned.
    pub probe: bool,
    /// The percentage of traffic currently routed to the primary.
    pub primary_weight: u8,
}

/// A distributed circuit breaker engine.
///
/// Many processes observing the same breaker key through the same store
/// reach the same routing decisions within one decision's lag: the latch in
/// the store is authoritative and is read on every [`decide`], while a
/// volatile local copy keeps the branch itself cheap.
///
/// The caller protocol brackets every protected call: `decide` picks the
/// endpoint, the caller performs its I/O, and [`report`] feeds the outcome
/// back. Clones share all state and the engine is meant to be shared,
/// one instance per breaker key and process.
///
/// [`decide`]: Breaker::decide
/// [`report`]: Breaker::report
pub struct Breaker<S, I = NoopInstrument> {
    inner: Arc<Inner<S, I>>,
}

struct Inner<S, I> {
    options: Options,
    store: S,
    clock: Arc<dyn Clock>,
    instrument: I,
    state: AtomicU8,
    streak: AtomicU32,
    transition: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

/// Assembles a [`Breaker`] from options, a store and optional overrides.
pub struct Builder<S, I = NoopInstrument> {
    options: Options,
    store: S,
    clock: Arc<dyn Clock>,
    instrument: I,
}

impl<S> Builder<S, NoopInstrument> {
    fn new(options: Options, store: S) -> Self {
        Self {
            options,
            store,
            clock: Arc::new(SystemClock),
            instrument: NoopInstrument,
        }
    }
}

impl<S, I> Builder<S, I> {
    /// Reads time from `clock` instead of the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Observes the breaker through `instrument`.
    pub fn instrument<T>(self, instrument: T) -> Builder<S, T> {
        Builder {
            options: self.options,
            store: self.store,
            clock: self.clock,
            instrument,
        }
    }

    /// Validates the options and builds the engine.
    pub fn build(self) -> Result<Breaker<S, I>, Error> {
        self.options.validate()?;
        Ok(Breaker {
            inner: Arc::new(Inner {
                options: self.options,
                store: self.store,
                clock: self.clock,
                instrument: self.instrument,
                state: AtomicU8::new(State::Closed.as_u8()),
                streak: AtomicU32::new(0),
                transition: Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
        })
    }
}

impl<S, I> Debug for Builder<S, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("key", &self.options.key)
            .finish_non_exhaustive()
    }
}

impl<S: Store> Breaker<S> {
    /// Starts building a breaker over `store`.
    pub fn builder(options: Options, store: S) -> Builder<S> {
        Builder::new(options, store)
    }

    /// Builds a breaker with the system clock and no instrumentation.
    pub fn new(options: Options, store: S) -> Result<Self, Error> {
        Self::builder(options, store).build()
    }
}

impl<S, I> Breaker<S, I> {
    /// The engine's view of the breaker state.
    ///
    /// Eventually consistent with the shared latch; reconciled on every
    /// [`decide`](Self::decide).
    pub fn state(&self) -> State {
        State::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Cancels the deferred cooldown transition. Dropping the last clone
    /// does the same; call this to stop background work earlier.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.cancel_transition();
    }

    fn cancel_transition(&self) {
        if let Some(handle) = self.inner.transition.lock().take() {
            handle.abort();
        }
    }
}

impl<S, I> Breaker<S, I>
where
    S: Store,
    I: Instrument + 'static,
{
    /// Chooses the endpoint for one protected call.
    ///
    /// Reads the authoritative latch first and adopts it, then routes:
    /// `Open` diverts to the secondary, `HalfOpen` sends a probe to the
    /// primary when a slot is free, and `Closed` routes by the current ramp
    /// weight. A store failure is fatal to the decision since there is no
    /// safe default without knowing the state.
    pub async fn decide<E>(
        &self,
        primary: E,
        secondary: E,
        cancel: &CancellationToken,
    ) -> Result<Decision<E>, Error> {
        let span = debug_span!("choose", key = %self.inner.options.key);
        tracing::Instrument::instrument(self.decide_inner(primary, secondary, cancel), span).await
    }

    /// Reports the outcome of a call previously routed by
    /// [`decide`](Self::decide).
    ///
    /// The outcome is always recorded in the shared window; what happens
    /// next depends on the state. A failure of the mandatory record
    /// propagates; failures of any follow-up store write are logged and
    /// swallowed so cleanup problems never surface to the caller.
    pub async fn report(
        &self,
        success: bool,
        was_probe: bool,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let span = debug_span!("report", key = %self.inner.options.key, success, was_probe);
        tracing::Instrument::instrument(self.report_inner(success, was_probe, cancel), span).await
    }

    async fn decide_inner<E>(
        &self,
        primary: E,
        secondary: E,
        cancel: &CancellationToken,
    ) -> Result<Decision<E>, Error> {
        let inner = &*self.inner;
        let options = &inner.options;
        inner.instrument.on_request();

        let latch = race(cancel, inner.store.read_latch(&options.key)).await?;
        self.reconcile(latch);

        match self.state() {
            State::Open => Ok(Decision {
                endpoint: secondary,
                probe: false,
                primary_weight: 0,
            }),
            State::HalfOpen => {
                let acquired = race(
                    cancel,
                    inner.store.try_acquire_probe(
                        &options.key,
                        options.half_open_max_probes,
                        options.open_cooldown,
                    ),
                )
                .await?;
                if acquired {
                    Ok(Decision {
                        endpoint: primary,
                        probe: true,
                        primary_weight: 0,
                    })
                } else {
                    Ok(Decision {
                        endpoint: secondary,
                        probe: false,
                        primary_weight: 0,
                    })
                }
            }
            State::Closed => {
                let ramp = race(cancel, inner.store.read_ramp(&options.key)).await?;
                match ramp {
                    None => Ok(Decision {
                        endpoint: primary,
                        probe: false,
                        primary_weight: 100,
                    }),
                    Some(percent) if percent >= 100 => Ok(Decision {
                        endpoint: primary,
                        probe: false,
                        primary_weight: 100,
                    }),
                    Some(percent) => {
                        let draw = rand::thread_rng().gen_range(0..100u8);
                        let endpoint = if draw < percent { primary } else { secondary };
                        Ok(Decision {
                            endpoint,
                            probe: false,
                            primary_weight: percent,
                        })
                    }
                }
            }
        }
    }

    async fn report_inner(
        &self,
        success: bool,
        was_probe: bool,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let inner = &*self.inner;
        let options = &inner.options;
        let now = inner.clock.now_unix();

        race(
            cancel,
            inner
                .store
                .record(&options.key, success, now, options.window, options.bucket),
        )
        .await?;

        if success {
            inner.instrument.on_success();
        } else {
            inner.instrument.on_failure();
        }

        let state = self.state();
        let was_probe = if was_probe && state != State::HalfOpen {
            warn!(
                key = %options.key,
                "probe report while not half-open, treating as a regular report"
            );
            false
        } else {
            was_probe
        };

        match state {
            State::Closed => {
                if let Err(err) = self.evaluate_open(now).await {
                    warn!(key = %options.key, error = %err, "window evaluation failed");
                }
                // Skip the ramp when the window evaluation already tripped;
                // the freshly written ramp 0 is not a configured step.
                if self.state() == State::Closed {
                    if let Err(err) = self.evaluate_ramp(now).await {
                        warn!(key = %options.key, error = %err, "ramp evaluation failed");
                    }
                }
            }
            State::HalfOpen if was_probe => {
                // Free the slot before looking at the verdict so the next
                // probe is not blocked on our bookkeeping.
                if let Err(err) = inner.store.release_probe(&options.key).await {
                    warn!(key = %options.key, error = %err, "probe release failed");
                }
                if success {
                    let streak = inner.streak.fetch_add(1, Ordering::AcqRel) + 1;
                    if streak >= options.half_open_successes_to_close {
                        self.close_from_probe().await;
                    }
                } else {
                    self.trip_open().await;
                }
            }
            // Open, or a non-probe report while probing: recorded in the
            // window so statistics stay continuous, no state change.
            _ => {}
        }
        Ok(())
    }

    async fn evaluate_open(&self, now: u64) -> Result<(), StoreError> {
        let inner = &*self.inner;
        let options = &inner.options;
        let (successes, failures) = inner
            .store
            .read_window(&options.key, now, options.window, options.bucket)
            .await?;

        let total = successes + failures;
        if total >= u64::from(options.min_samples)
            && failure_rate(successes, failures) >= options.failure_rate_to_open
        {
            self.trip_open().await;
        }
        Ok(())
    }

    async fn evaluate_ramp(&self, now: u64) -> Result<(), StoreError> {
        let inner = &*self.inner;
        let options = &inner.options;

        let percent = match inner.store.read_ramp(&options.key).await? {
            None => return Ok(()),
            Some(percent) if percent >= 100 => return Ok(()),
            Some(percent) => percent,
        };

        let (successes, failures) = inner
            .store
            .read_window(&options.key, now, options.window, options.bucket)
            .await?;
        if failure_rate(successes, failures) > options.ramp.max_failure_rate_per_step {
            self.trip_open().await;
            return Ok(());
        }

        let steps = &options.ramp.percentages;
        let next = match steps.iter().position(|&step| step == percent) {
            Some(i) if i + 1 < steps.len() => steps[i + 1],
            // Last step, or a value outside the configured order: complete.
            _ => 100,
        };
        inner
            .store
            .set_ramp(&options.key, next, options.ramp.hold_duration)
            .await?;
        Ok(())
    }

    /// Trips to `Open`: latch for the cooldown, ramp reset, and the
    /// deferred switch to `HalfOpen`. Idempotent. The local transition
    /// stands even when the store writes fail; other engines reconcile from
    /// whatever did land, and the next report retries the rest.
    async fn trip_open(&self) {
        let inner = &*self.inner;
        let options = &inner.options;

        inner.streak.store(0, Ordering::Release);
        self.set_state(State::Open);

        if let Err(err) = inner
            .store
            .set_latch(&options.key, State::Open, Some(options.open_cooldown))
            .await
        {
            warn!(key = %options.key, error = %err, "latch write failed on open");
        }
        if let Err(err) = inner
            .store
            .set_ramp(&options.key, 0, options.ramp.hold_duration)
            .await
        {
            warn!(key = %options.key, error = %err, "ramp write failed on open");
        }
        self.schedule_half_open();
    }

    async fn close_from_probe(&self) {
        let inner = &*self.inner;
        let options = &inner.options;

        inner.streak.store(0, Ordering::Release);
        self.cancel_transition();
        self.set_state(State::Closed);

        if let Err(err) = inner.store.set_latch(&options.key, State::Closed, None).await {
            warn!(key = %options.key, error = %err, "latch write failed on close");
        }
        if let Some(&first) = options.ramp.percentages.first() {
            if let Err(err) = inner
                .store
                .set_ramp(&options.key, first, options.ramp.hold_duration)
                .await
            {
                warn!(key = %options.key, error = %err, "ramp init failed on close");
            }
        }
    }

    /// Spawns the deferred `Open` to `HalfOpen` transition, replacing any
    /// pending one. The task only ever fires that one edge: the local cell
    /// is switched by compare-and-swap so a stale timer cannot clobber a
    /// breaker that has already closed or re-opened.
    fn schedule_half_open(&self) {
        let inner = Arc::clone(&self.inner);
        let token = self.inner.shutdown.child_token();
        let cooldown = self.inner.options.open_cooldown;

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(cooldown) => {
                    let swapped = inner
                        .state
                        .compare_exchange(
                            State::Open.as_u8(),
                            State::HalfOpen.as_u8(),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok();
                    if swapped {
                        inner.streak.store(0, Ordering::Release);
                        inner.instrument.on_half_open();
                        if let Err(err) = inner
                            .store
                            .set_latch(&inner.options.key, State::HalfOpen, Some(cooldown))
                            .await
                        {
                            warn!(
                                key = %inner.options.key,
                                error = %err,
                                "latch write failed on half-open"
                            );
                        }
                    }
                }
            }
        });

        if let Some(previous) = self.inner.transition.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Adopts the authoritative latch. An absent latch while the local copy
    /// says `Open` means the Open lifetime ran out: the cooldown is over
    /// and probing may start even before the deferred rewrite lands.
    fn reconcile(&self, latch: Option<State>) {
        let local = self.state();
        match latch {
            Some(state) if state != local => self.set_state(state),
            None if local == State::Open => self.set_state(State::HalfOpen),
            _ => {}
        }
    }

    fn set_state(&self, next: State) {
        let prev = State::from_u8(self.inner.state.swap(next.as_u8(), Ordering::AcqRel));
        if prev == next {
            return;
        }
        // The streak only has meaning within a single half-open episode.
        self.inner.streak.store(0, Ordering::Release);
        match next {
            State::Closed => self.inner.instrument.on_closed(),
            State::Open => self.inner.instrument.on_open(),
            State::HalfOpen => self.inner.instrument.on_half_open(),
        }
    }
}

impl<S, I> Clone for Breaker<S, I> {
    fn clone(&self) -> Self {
        Breaker {
            inner: self.inner.clone(),
        }
    }
}

impl<S, I> Debug for Breaker<S, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Breaker")
            .field("key", &self.inner.options.key)
            .field("state", &self.state().as_str())
            .finish()
    }
}

impl<S, I> Drop for Inner<S, I> {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.transition.lock().take() {
            handle.abort();
        }
    }
}

pub(crate) async fn race<T, F>(cancel: &CancellationToken, operation: F) -> Result<T, Error>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = operation => result.map_err(Error::Store),
    }
}

fn failure_rate(successes: u64, failures: u64) -> f64 {
    let total = successes + failures;
    if total == 0 {
        return 0.0;
    }
    failures as f64 / total as f64
}
