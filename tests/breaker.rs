use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tripwire::clock::{Clock, ManualClock};
use tripwire::{Breaker, Error, MemoryStore, Options, RampOptions, State, Store};

const PRIMARY: &str = "primary";
const SECONDARY: &str = "secondary";

struct Harness {
    breaker: Breaker<Arc<MemoryStore>>,
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    cancel: CancellationToken,
}

impl Harness {
    fn new(options: Options) -> Self {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let breaker = Breaker::builder(options, store.clone())
            .clock(clock.clone())
            .build()
            .expect("valid options");
        Harness {
            breaker,
            store,
            clock,
            cancel: CancellationToken::new(),
        }
    }

    /// A second engine sharing this harness's store and clock.
    fn peer(&self) -> Breaker<Arc<MemoryStore>> {
        Breaker::builder(tiny_options(), self.store.clone())
            .clock(self.clock.clone())
            .build()
            .expect("valid options")
    }

    async fn decide(&self) -> tripwire::Decision<&'static str> {
        self.breaker
            .decide(PRIMARY, SECONDARY, &self.cancel)
            .await
            .expect("decide")
    }

    async fn report(&self, success: bool, was_probe: bool) {
        self.breaker
            .report(success, was_probe, &self.cancel)
            .await
            .expect("report");
    }
}

/// The one-second everything configuration used by the literal scenarios:
/// a single sample trips, a single probe success closes.
fn tiny_options() -> Options {
    let mut options = Options::new("t");
    options.window = Duration::from_secs(60);
    options.bucket = Duration::from_secs(10);
    options.min_samples = 1;
    options.failure_rate_to_open = 0.5;
    options.open_cooldown = Duration::from_secs(1);
    options.half_open_max_probes = 1;
    options.half_open_successes_to_close = 1;
    options.ramp = RampOptions {
        percentages: vec![100],
        hold_duration: Duration::from_secs(1),
        max_failure_rate_per_step: 1.0,
    };
    options
}

/// Options that keep the window evaluation quiet so ramp behavior can be
/// driven explicitly.
fn ramp_options(max_failure_rate_per_step: f64) -> Options {
    let mut options = tiny_options();
    options.min_samples = 10;
    options.ramp = RampOptions {
        percentages: vec![25, 50, 100],
        hold_duration: Duration::from_secs(600),
        max_failure_rate_per_step,
    };
    options
}

/// Drives a harness from fresh to Closed-with-ramp: trip on failures, wait
/// out the cooldown, close on one probe success, then move past the window
/// so the old failures no longer weigh on the statistics.
async fn close_with_ramp(harness: &Harness, failures: u32) {
    for _ in 0..failures {
        harness.decide().await;
        harness.report(false, false).await;
    }
    assert_eq!(State::Open, harness.breaker.state());

    harness.clock.advance(1);
    let probe = harness.decide().await;
    assert!(probe.probe);
    harness.report(true, true).await;
    assert_eq!(State::Closed, harness.breaker.state());

    harness.clock.advance(70);
}

#[tokio::test(start_paused = true)]
async fn fresh_engine_trips_on_first_failure() {
    let harness = Harness::new(tiny_options());

    let decision = harness.decide().await;
    assert_eq!(PRIMARY, decision.endpoint);
    assert!(!decision.probe);
    assert_eq!(100, decision.primary_weight);

    harness.report(false, false).await;
    assert_eq!(State::Open, harness.breaker.state());

    let decision = harness.decide().await;
    assert_eq!(SECONDARY, decision.endpoint);
    assert_eq!(0, decision.primary_weight);
}

#[tokio::test(start_paused = true)]
async fn cooldown_probe_and_close() {
    let harness = Harness::new(tiny_options());
    harness.decide().await;
    harness.report(false, false).await;

    // Cooldown elapses: the Open latch lifetime runs out and the next
    // decision adopts HalfOpen and wins the only probe slot.
    harness.clock.advance(1);
    let probe = harness.decide().await;
    assert_eq!((PRIMARY, true, 0), (probe.endpoint, probe.probe, probe.primary_weight));

    // The probe cap holds while the first probe is outstanding.
    let capped = harness.decide().await;
    assert_eq!((SECONDARY, false), (capped.endpoint, capped.probe));

    harness.report(true, true).await;
    assert_eq!(State::Closed, harness.breaker.state());
    assert_eq!(
        Some(State::Closed),
        harness.store.read_latch("t").await.unwrap()
    );

    // Recovery complete: the ramp was initialized to 100.
    let decision = harness.decide().await;
    assert_eq!((PRIMARY, false, 100), (decision.endpoint, decision.probe, decision.primary_weight));
}

#[tokio::test(start_paused = true)]
async fn probe_failure_reopens() {
    let harness = Harness::new(tiny_options());
    harness.decide().await;
    harness.report(false, false).await;

    harness.clock.advance(1);
    let probe = harness.decide().await;
    assert!(probe.probe);

    harness.report(false, true).await;
    assert_eq!(State::Open, harness.breaker.state());
    assert_eq!(SECONDARY, harness.decide().await.endpoint);
}

#[tokio::test(start_paused = true)]
async fn peers_converge_through_the_latch() {
    let harness = Harness::new(tiny_options());
    let peer = harness.peer();

    harness.decide().await;
    harness.report(false, false).await;
    assert_eq!(State::Open, harness.breaker.state());

    // The peer has no local history; its next decision reads the latch.
    let decision = peer
        .decide(PRIMARY, SECONDARY, &harness.cancel)
        .await
        .unwrap();
    assert_eq!((SECONDARY, false, 0), (decision.endpoint, decision.probe, decision.primary_weight));
    assert_eq!(State::Open, peer.state());
}

#[tokio::test(start_paused = true)]
async fn peers_adopt_a_close() {
    let harness = Harness::new(tiny_options());
    let peer = harness.peer();

    harness.decide().await;
    harness.report(false, false).await;
    peer.decide(PRIMARY, SECONDARY, &harness.cancel).await.unwrap();
    assert_eq!(State::Open, peer.state());

    harness.clock.advance(1);
    let probe = harness.decide().await;
    assert!(probe.probe);
    harness.report(true, true).await;

    // The close was latched without a lifetime; the peer adopts it.
    let decision = peer
        .decide(PRIMARY, SECONDARY, &harness.cancel)
        .await
        .unwrap();
    assert_eq!(PRIMARY, decision.endpoint);
    assert_eq!(State::Closed, peer.state());
}

#[tokio::test(start_paused = true)]
async fn breaker_stays_closed_below_min_samples() {
    let mut options = tiny_options();
    options.min_samples = 5;
    let harness = Harness::new(options);

    for _ in 0..4 {
        harness.decide().await;
        harness.report(false, false).await;
        assert_eq!(State::Closed, harness.breaker.state());
    }

    harness.decide().await;
    harness.report(false, false).await;
    assert_eq!(State::Open, harness.breaker.state());
}

#[tokio::test(start_paused = true)]
async fn trips_exactly_at_the_failure_threshold() {
    let mut options = tiny_options();
    options.min_samples = 4;
    let harness = Harness::new(options);

    // Two successes, two failures: the rate meets the threshold exactly.
    for success in [true, true, false] {
        harness.decide().await;
        harness.report(success, false).await;
        assert_eq!(State::Closed, harness.breaker.state());
    }
    harness.decide().await;
    harness.report(false, false).await;
    assert_eq!(State::Open, harness.breaker.state());
    assert_eq!(SECONDARY, harness.decide().await.endpoint);
}

#[tokio::test(start_paused = true)]
async fn stays_closed_below_the_failure_threshold() {
    let mut options = tiny_options();
    options.min_samples = 4;
    let harness = Harness::new(options);

    for success in [true, true, true, false] {
        harness.decide().await;
        harness.report(success, false).await;
    }
    assert_eq!(State::Closed, harness.breaker.state());
    assert_eq!(PRIMARY, harness.decide().await.endpoint);
}

#[tokio::test(start_paused = true)]
async fn probe_cap_bounds_outstanding_probes() {
    let mut options = tiny_options();
    options.half_open_max_probes = 2;
    options.half_open_successes_to_close = 3;
    let harness = Harness::new(options);

    harness.decide().await;
    harness.report(false, false).await;
    harness.clock.advance(1);

    assert!(harness.decide().await.probe);
    assert!(harness.decide().await.probe);
    let decision = harness.decide().await;
    assert_eq!((SECONDARY, false), (decision.endpoint, decision.probe));

    // Reporting one probe frees its slot.
    harness.report(true, true).await;
    assert_eq!(State::HalfOpen, harness.breaker.state());
    assert!(harness.decide().await.probe);
}

#[tokio::test(flavor = "multi_thread")]
async fn probe_cap_holds_under_concurrent_decisions() {
    let mut options = tiny_options();
    options.half_open_max_probes = 2;
    options.half_open_successes_to_close = 8;
    let harness = Harness::new(options);

    harness.decide().await;
    harness.report(false, false).await;
    harness.clock.advance(1);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let breaker = harness.breaker.clone();
        tasks.push(tokio::spawn(async move {
            let cancel = CancellationToken::new();
            breaker.decide(PRIMARY, SECONDARY, &cancel).await.unwrap()
        }));
    }

    let mut probes = 0;
    for task in tasks {
        let decision = task.await.unwrap();
        if decision.probe {
            assert_eq!(PRIMARY, decision.endpoint);
            probes += 1;
        } else {
            assert_eq!(SECONDARY, decision.endpoint);
        }
    }

    // No probe was reported or released, so however the eight decisions
    // interleaved, exactly the cap's worth of probes is outstanding.
    assert_eq!(2, probes);
}

#[tokio::test(start_paused = true)]
async fn closes_after_enough_consecutive_probe_successes() {
    let mut options = tiny_options();
    options.half_open_successes_to_close = 2;
    let harness = Harness::new(options);

    harness.decide().await;
    harness.report(false, false).await;
    harness.clock.advance(1);

    assert!(harness.decide().await.probe);
    harness.report(true, true).await;
    assert_eq!(State::HalfOpen, harness.breaker.state());

    assert!(harness.decide().await.probe);
    harness.report(true, true).await;
    assert_eq!(State::Closed, harness.breaker.state());
}

#[tokio::test(start_paused = true)]
async fn non_probe_reports_do_not_close_a_probing_breaker() {
    let harness = Harness::new(tiny_options());
    harness.decide().await;
    harness.report(false, false).await;
    harness.clock.advance(1);

    assert!(harness.decide().await.probe);

    // Straggler reports from calls routed before the trip.
    harness.report(true, false).await;
    harness.report(true, false).await;
    assert_eq!(State::HalfOpen, harness.breaker.state());
}

#[tokio::test(start_paused = true)]
async fn ramp_advances_step_by_step() {
    let harness = Harness::new(ramp_options(1.0));
    close_with_ramp(&harness, 10).await;

    // First healthy report in the clean window advances 25 -> 50.
    harness.decide().await;
    harness.report(true, false).await;
    let decision = harness.decide().await;
    assert_eq!(50, decision.primary_weight);

    // Next one completes the ramp: 50 -> 100.
    harness.report(true, false).await;
    let decision = harness.decide().await;
    assert_eq!((PRIMARY, 100), (decision.endpoint, decision.primary_weight));
}

#[tokio::test(start_paused = true)]
async fn ramp_routes_about_half_the_traffic_at_fifty_percent() {
    let harness = Harness::new(ramp_options(1.0));
    close_with_ramp(&harness, 10).await;

    harness.decide().await;
    harness.report(true, false).await;

    let mut to_primary = 0;
    for _ in 0..200 {
        let decision = harness.decide().await;
        assert_eq!(50, decision.primary_weight);
        if decision.endpoint == PRIMARY {
            to_primary += 1;
        }
    }
    // Loose bounds; a uniform draw stays comfortably inside them.
    assert!((60..=140).contains(&to_primary), "{to_primary} of 200");
}

#[tokio::test(start_paused = true)]
async fn ramp_aborts_on_failures() {
    let harness = Harness::new(ramp_options(0.1));
    close_with_ramp(&harness, 10).await;

    // One failure in the clean window: rate 1.0 > 0.1 aborts the step.
    harness.decide().await;
    harness.report(false, false).await;
    assert_eq!(State::Open, harness.breaker.state());
}

#[tokio::test(start_paused = true)]
async fn ramp_expires_to_full_traffic() {
    let harness = Harness::new(ramp_options(1.0));
    close_with_ramp(&harness, 10).await;

    // No qualifying reports arrive for the whole hold: the ramp value's
    // lifetime runs out and absent reads as recovery complete.
    harness.clock.advance(600);
    let decision = harness.decide().await;
    assert_eq!((PRIMARY, 100), (decision.endpoint, decision.primary_weight));
}

#[tokio::test(start_paused = true)]
async fn deferred_transition_rewrites_the_latch() {
    let harness = Harness::new(tiny_options());
    harness.decide().await;
    harness.report(false, false).await;
    assert_eq!(State::Open, harness.breaker.state());

    // Let the cooldown timer fire without any decision traffic.
    tokio::time::advance(Duration::from_secs(1)).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    assert_eq!(State::HalfOpen, harness.breaker.state());
    assert_eq!(
        Some(State::HalfOpen),
        harness.store.read_latch("t").await.unwrap()
    );
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_the_deferred_transition() {
    let harness = Harness::new(tiny_options());
    harness.decide().await;
    harness.report(false, false).await;

    harness.breaker.shutdown();
    tokio::time::advance(Duration::from_secs(1)).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    // The task never fired; only the latch lifetime can move this breaker.
    assert_eq!(State::Open, harness.breaker.state());
}

#[tokio::test(start_paused = true)]
async fn reports_while_open_keep_statistics_but_not_state() {
    let harness = Harness::new(tiny_options());
    harness.decide().await;
    harness.report(false, false).await;

    harness.report(true, false).await;
    assert_eq!(State::Open, harness.breaker.state());

    let (successes, failures) = harness
        .store
        .read_window("t", harness.clock.now_unix(), Duration::from_secs(60), Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!((1, 1), (successes, failures));
}

#[tokio::test(start_paused = true)]
async fn stray_probe_reports_are_harmless() {
    let harness = Harness::new(tiny_options());

    // was_probe without a matching probe decision: treated as a plain
    // successful report.
    harness
        .breaker
        .report(true, true, &harness.cancel)
        .await
        .unwrap();
    assert_eq!(State::Closed, harness.breaker.state());
}

#[tokio::test(start_paused = true)]
async fn cancellation_preempts_the_store() {
    let harness = Harness::new(tiny_options());
    let cancelled = CancellationToken::new();
    cancelled.cancel();

    assert!(matches!(
        harness.breaker.decide(PRIMARY, SECONDARY, &cancelled).await,
        Err(Error::Cancelled)
    ));
    assert!(matches!(
        harness.breaker.report(true, false, &cancelled).await,
        Err(Error::Cancelled)
    ));
}
