//! Delay-feedback pacing: the pure math behind [`SynchronizedClock`].
//!
//! A client must tick at the server's cadence, slightly ahead of it, so that
//! its inputs arrive just in time to be aggregated. Fixed-rate clocks drift
//! apart under asymmetric latency; instead the server reports, per frame, how
//! much slack the client's input had when it was consumed, and the client
//! retunes its tick period from that feedback alone - no wall-clock
//! synchronization protocol is needed.
//!
//! [`PaceController`] holds no thread or timer; it is pure bookkeeping over
//! `(frame, timestamp)` samples, which keeps the control law testable without
//! real time. [`SynchronizedClock`] wires it to a timing thread.
//!
//! # The windowed minimum
//!
//! Incoming delay samples are first *normalized*: the discrepancy between the
//! time that actually elapsed locally and the time that should have elapsed at
//! the nominal rate since a fixed reference tick is added to the measurement,
//! making samples comparable even while the clock itself is speeding up and
//! slowing down. The controller then keeps the **minimum** of the last N
//! normalized delays - minimum, not mean, because any sample below the true
//! steady-state offset is evidence the clock can safely run faster, while
//! jitter only ever makes individual samples look artificially slow. The
//! target period is `max(nominal + denormalized_minimum - target_delta, 0)`:
//! proportional feedback with a floor at zero, with no integral term to
//! overshoot.
//!
//! [`SynchronizedClock`]: crate::SynchronizedClock

use std::collections::VecDeque;

use web_time::{Duration, Instant};

use crate::indexed_queue::IndexedQueue;
use crate::Frame;

/// Default number of normalized delay samples the minimum is taken over.
const DEFAULT_DELAY_WINDOW: usize = 30;

/// Configuration for delay-feedback pacing.
///
/// # Example
///
/// ```
/// use bastion_netcode::PacingConfig;
///
/// // React faster to network changes, at the cost of more speed fluctuation.
/// let responsive = PacingConfig {
///     window_size: 10,
///     ..PacingConfig::new(60)
/// };
/// # let _ = responsive;
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingConfig {
    /// The nominal tick rate to track, in frames per second.
    pub target_tps: u32,
    /// The slack the controller steers toward: how early this peer's data
    /// should ideally arrive at the remote end.
    pub target_delta: Duration,
    /// Number of normalized delay samples the windowed minimum is taken
    /// over. A larger window is more stable but slower to notice that the
    /// link got worse; a smaller one reacts faster but fluctuates more.
    pub window_size: usize,
}

impl PacingConfig {
    /// Creates a config for the given tick rate with default slack and
    /// window.
    #[must_use]
    pub fn new(target_tps: u32) -> Self {
        Self {
            target_tps,
            target_delta: Duration::from_millis(16),
            window_size: DEFAULT_DELAY_WINDOW,
        }
    }
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self::new(60)
    }
}

/// Recomputes a tick period from round-trip delay feedback.
///
/// Owns the trailing window of local tick timestamps and of normalized delay
/// samples; see the [module docs](self) for the control law.
#[derive(Debug)]
pub struct PaceController {
    nominal: Duration,
    target_delta: Duration,
    window_size: usize,
    /// Local timestamp of each of our recent ticks, keyed by frame and
    /// trimmed to the trailing window.
    ticks: IndexedQueue<Instant>,
    /// The fixed reference tick all normalization offsets are measured from.
    reference: Option<(Frame, Instant)>,
    /// The last N normalized delay samples, in seconds.
    delays: VecDeque<f64>,
    period: Duration,
}

impl PaceController {
    /// Creates a controller at the nominal period, with no samples yet.
    #[must_use]
    pub fn new(config: PacingConfig) -> Self {
        let nominal = Duration::from_secs_f64(1.0 / f64::from(config.target_tps.max(1)));
        Self {
            nominal,
            target_delta: config.target_delta,
            window_size: config.window_size.max(1),
            ticks: IndexedQueue::new(Frame::new(0)),
            reference: None,
            delays: VecDeque::new(),
            period: nominal,
        }
    }

    /// Resets the controller to start counting ticks from `frame + 1`,
    /// dropping all accumulated samples.
    pub fn initialize(&mut self, frame: Frame) {
        self.ticks.set(frame.next());
        self.reference = None;
        self.delays.clear();
        self.period = self.nominal;
    }

    /// Records one local tick and returns the freshly recomputed target
    /// period.
    ///
    /// `frame` must be the tick's frame number; if the caller's counter and
    /// ours have diverged (a re-initialize raced a tick), ours resynchronizes
    /// to the caller's.
    pub fn record_tick(&mut self, frame: Frame, now: Instant) -> Duration {
        if self.ticks.last_frame().next() != frame {
            self.ticks.set(frame);
        }
        self.ticks.add(now);
        if self.reference.is_none() {
            self.reference = Some((frame, now));
        }
        self.ticks.pop(frame - self.window_size as i64);
        self.recompute(frame, now);
        self.period
    }

    /// Folds one delay measurement (as reported by the remote peer for our
    /// tick at `frame`) into the trailing statistic.
    ///
    /// Returns `false` if the frame's local timestamp has already been
    /// trimmed from the window; the sample is ignored.
    pub fn set_delay(&mut self, frame: Frame, measured: Duration) -> bool {
        let Some(tick_time) = self.ticks.try_get(frame).copied() else {
            tracing::trace!(frame = frame.as_i64(), "delay sample for trimmed tick, ignoring");
            return false;
        };
        let normalized = measured.as_secs_f64() + self.offset(frame, tick_time);
        self.delays.push_back(normalized);
        while self.delays.len() > self.window_size {
            self.delays.pop_front();
        }
        if let Some((latest_frame, latest_time)) =
            self.ticks.latest().map(|(f, t)| (f, *t))
        {
            self.recompute(latest_frame, latest_time);
        }
        true
    }

    /// The current target period between ticks.
    #[must_use]
    pub fn current_period(&self) -> Duration {
        self.period
    }

    /// The current target rate in frames per second. A zero period (the
    /// controller's floor) reports as infinity: tick as fast as possible.
    #[must_use]
    pub fn current_tps(&self) -> f64 {
        let secs = self.period.as_secs_f64();
        if secs <= 0.0 {
            f64::INFINITY
        } else {
            1.0 / secs
        }
    }

    /// How far local time has drifted, at `tick_time` for tick `frame`, from
    /// where the nominal rate says it should be relative to the reference
    /// tick.
    fn offset(&self, frame: Frame, tick_time: Instant) -> f64 {
        let Some((ref_frame, ref_time)) = self.reference else {
            return 0.0;
        };
        let actual = tick_time.saturating_duration_since(ref_time).as_secs_f64();
        let expected = (frame - ref_frame) as f64 * self.nominal.as_secs_f64();
        actual - expected
    }

    fn recompute(&mut self, frame: Frame, now: Instant) {
        let Some(worst) = self.delays.iter().copied().reduce(f64::min) else {
            self.period = self.nominal;
            return;
        };
        let denormalized = worst - self.offset(frame, now);
        let target =
            self.nominal.as_secs_f64() + denormalized - self.target_delta.as_secs_f64();
        self.period = Duration::from_secs_f64(target.max(0.0));
    }
}

// #########
// # TESTS #
// #########
