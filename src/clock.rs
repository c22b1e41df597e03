//! Tick sources: a passive-wait timing thread and its phase-locked wrapper.
//!
//! [`Clock`] raises a tick callback at `1 / target_tps` intervals from a
//! dedicated thread. Waiting is passive down to a minimum sleep quantum;
//! sub-quantum remainders are spun, because the OS rounds short sleeps up by
//! whole scheduler ticks and a netcode clock cannot afford that error.
//!
//! [`SynchronizedClock`] wraps a `Clock` with a [`PaceController`] so the
//! tick period continuously retunes from [`SynchronizedClock::set_delay`]
//! feedback, keeping this peer phase-locked to a remote peer's cadence. The
//! controller's mutex is held only for the period recomputation; subscriber
//! callbacks run unlocked.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use web_time::{Duration, Instant};

use crate::time_sync::{PaceController, PacingConfig};
use crate::Frame;

type TickFn = Box<dyn FnMut(Frame) + Send>;

/// Configuration for the timing thread's wait behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockConfig {
    /// The smallest sleep the timing thread will request from the OS.
    /// Remainders below this are spun.
    pub min_sleep: Duration,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            min_sleep: Duration::from_millis(1),
        }
    }
}

struct ClockShared {
    /// Current tick period in microseconds. Atomic so the timing thread can
    /// re-read it every iteration without a lock.
    period_micros: AtomicU64,
    cancelled: AtomicBool,
    frame: AtomicI64,
    subscribers: Mutex<Vec<TickFn>>,
}

impl ClockShared {
    fn period(&self) -> Duration {
        Duration::from_micros(self.period_micros.load(Ordering::Acquire))
    }

    fn store_period(&self, period: Duration) {
        let micros = u64::try_from(period.as_micros()).unwrap_or(u64::MAX);
        self.period_micros.store(micros, Ordering::Release);
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Clock")
            .field("period", &self.shared.period())
            .field("frame", &self.frame())
            .field("running", &self.is_running())
            .finish()
    }
}

/// A periodic tick source driven by a dedicated timing thread.
///
/// Subscribers are invoked on the timing thread, in subscription order, once
/// per tick with the tick's frame number. Cancellation is cooperative: an
/// in-flight tick completes before [`Clock::stop`] returns.
pub struct Clock {
    shared: Arc<ClockShared>,
    min_sleep: Duration,
    handle: Option<thread::JoinHandle<()>>,
}

impl Clock {
    /// Creates a stopped clock targeting `target_tps` ticks per second.
    #[must_use]
    pub fn new(target_tps: u32, config: ClockConfig) -> Self {
        let shared = Arc::new(ClockShared {
            period_micros: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            frame: AtomicI64::new(Frame::PRE_SIM.as_i64()),
            subscribers: Mutex::new(Vec::new()),
        });
        shared.store_period(Duration::from_secs_f64(
            1.0 / f64::from(target_tps.max(1)),
        ));
        Self {
            shared,
            min_sleep: config.min_sleep,
            handle: None,
        }
    }

    /// Registers a tick callback. Subscribing while the clock runs is
    /// allowed; the callback first fires on the next tick.
    pub fn subscribe(&self, callback: impl FnMut(Frame) + Send + 'static) {
        self.shared.subscribers.lock().push(Box::new(callback));
    }

    /// Replaces the tick period.
    pub fn set_period(&self, period: Duration) {
        self.shared.store_period(period);
    }

    /// The current tick period.
    #[must_use]
    pub fn period(&self) -> Duration {
        self.shared.period()
    }

    /// The most recently emitted frame (`start_frame` before the first tick).
    #[must_use]
    pub fn frame(&self) -> Frame {
        Frame::new(self.shared.frame.load(Ordering::Acquire))
    }

    /// `true` while the timing thread is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Spawns the timing thread; the first emitted tick is `start_frame + 1`.
    ///
    /// Starting an already-running clock only rebases its frame counter.
    pub fn start(&mut self, start_frame: Frame) {
        self.shared
            .frame
            .store(start_frame.as_i64(), Ordering::Release);
        if self.handle.is_some() {
            return;
        }
        self.shared.cancelled.store(false, Ordering::Release);
        let shared = self.shared.clone();
        let min_sleep = self.min_sleep;
        self.handle = Some(thread::spawn(move || run_tick_loop(&shared, min_sleep)));
    }

    /// Signals cancellation and joins the timing thread. The in-flight tick,
    /// if any, completes first.
    pub fn stop(&mut self) {
        self.shared.cancelled.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("clock timing thread panicked");
            }
        }
    }
}

impl Drop for Clock {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_tick_loop(shared: &ClockShared, min_sleep: Duration) {
    let mut next_tick = Instant::now();
    while !shared.cancelled.load(Ordering::Acquire) {
        let period = shared.period();
        next_tick += period;

        let now = Instant::now();
        if now > next_tick + period {
            // A stalled subscriber put us more than a full period behind;
            // rebase instead of bursting catch-up ticks.
            next_tick = now;
        }

        // Passive wait down to the quantum, then spin the remainder.
        loop {
            if shared.cancelled.load(Ordering::Acquire) {
                return;
            }
            let now = Instant::now();
            if now >= next_tick {
                break;
            }
            if next_tick - now > min_sleep {
                thread::sleep(min_sleep);
            } else {
                std::hint::spin_loop();
            }
        }

        let frame = Frame::new(shared.frame.fetch_add(1, Ordering::AcqRel) + 1);
        let mut subscribers = shared.subscribers.lock();
        for subscriber in subscribers.iter_mut() {
            subscriber(frame);
        }
    }
}

/// A [`Clock`] phase-locked to a remote peer's frame cadence.
///
/// Every local tick records its timestamp with the [`PaceController`] and
/// adopts the freshly recomputed period before external subscribers run.
/// Remote delay feedback arrives through [`SynchronizedClock::set_delay`].
pub struct SynchronizedClock {
    clock: Clock,
    pace: Arc<Mutex<PaceController>>,
}

impl std::fmt::Debug for SynchronizedClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynchronizedClock")
            .field("clock", &self.clock)
            .finish()
    }
}

impl SynchronizedClock {
    /// Creates a stopped synchronized clock.
    #[must_use]
    pub fn new(pacing: PacingConfig, clock_config: ClockConfig) -> Self {
        let clock = Clock::new(pacing.target_tps, clock_config);
        let pace = Arc::new(Mutex::new(PaceController::new(pacing)));

        // The pacing subscriber is installed first so the period is already
        // retuned when external subscribers observe the tick.
        let pace_for_tick = pace.clone();
        let shared = clock.shared.clone();
        clock.subscribe(move |frame| {
            let period = pace_for_tick.lock().record_tick(frame, Instant::now());
            shared.store_period(period);
        });

        Self { clock, pace }
    }

    /// Resets pacing state and (re)starts ticking from `frame + 1`.
    pub fn initialize(&mut self, frame: Frame) {
        {
            let mut pace = self.pace.lock();
            pace.initialize(frame);
            self.clock.set_period(pace.current_period());
        }
        self.clock.start(frame);
    }

    /// Registers an external tick callback, invoked after the period has
    /// been retuned for that tick.
    pub fn subscribe(&self, callback: impl FnMut(Frame) + Send + 'static) {
        self.clock.subscribe(callback);
    }

    /// Feeds one remote delay measurement for our tick at `frame`.
    ///
    /// Returns `false` (and changes nothing) if that tick has already left
    /// the trailing window.
    pub fn set_delay(&self, frame: Frame, measured: Duration) -> bool {
        let mut pace = self.pace.lock();
        let applied = pace.set_delay(frame, measured);
        let period = pace.current_period();
        drop(pace);
        self.clock.set_period(period);
        applied
    }

    /// The most recently emitted frame.
    #[must_use]
    pub fn frame(&self) -> Frame {
        self.clock.frame()
    }

    /// The current target period between ticks.
    #[must_use]
    pub fn current_period(&self) -> Duration {
        self.pace.lock().current_period()
    }

    /// The current target rate in frames per second.
    #[must_use]
    pub fn current_tps(&self) -> f64 {
        self.pace.lock().current_tps()
    }

    /// `true` while the timing thread is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.clock.is_running()
    }

    /// Signals cancellation and joins the timing thread.
    pub fn stop(&mut self) {
        self.clock.stop();
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::sync::atomic::AtomicUsize;

    #[test]
    #[serial]
    fn clock_ticks_and_stops() {
        let mut clock = Clock::new(200, ClockConfig::default());
        let count = Arc::new(AtomicUsize::new(0));
        let frames = Arc::new(Mutex::new(Vec::new()));

        let count_in_tick = count.clone();
        let frames_in_tick = frames.clone();
        clock.subscribe(move |frame| {
            count_in_tick.fetch_add(1, Ordering::SeqCst);
            frames_in_tick.lock().push(frame);
        });

        clock.start(Frame::PRE_SIM);
        thread::sleep(Duration::from_millis(100));
        clock.stop();

        let ticked = count.load(Ordering::SeqCst);
        assert!(ticked >= 3, "only {ticked} ticks in 100ms at 200tps");

        // Frames are consecutive starting at 0.
        let frames = frames.lock();
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(*frame, Frame::new(i as i64));
        }

        // No ticks after stop.
        let after_stop = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), after_stop);
    }

    #[test]
    #[serial]
    fn clock_start_frame_offsets_emitted_frames() {
        let mut clock = Clock::new(500, ClockConfig::default());
        let first = Arc::new(Mutex::new(None));
        let first_in_tick = first.clone();
        clock.subscribe(move |frame| {
            first_in_tick.lock().get_or_insert(frame);
        });
        clock.start(Frame::new(41));
        thread::sleep(Duration::from_millis(30));
        clock.stop();
        assert_eq!(*first.lock(), Some(Frame::new(42)));
    }

    #[test]
    fn set_period_is_observed() {
        let clock = Clock::new(60, ClockConfig::default());
        clock.set_period(Duration::from_millis(5));
        assert_eq!(clock.period(), Duration::from_millis(5));
    }

    #[test]
    #[serial]
    fn synchronized_clock_ticks_after_initialize() {
        let mut clock = SynchronizedClock::new(
            PacingConfig {
                target_tps: 200,
                ..PacingConfig::default()
            },
            ClockConfig::default(),
        );
        let count = Arc::new(AtomicUsize::new(0));
        let count_in_tick = count.clone();
        clock.subscribe(move |_| {
            count_in_tick.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!clock.is_running());
        clock.initialize(Frame::PRE_SIM);
        assert!(clock.is_running());
        thread::sleep(Duration::from_millis(80));
        clock.stop();

        assert!(count.load(Ordering::SeqCst) >= 2);
        assert!(clock.frame().is_stepped());
    }

    #[test]
    #[serial]
    fn synchronized_clock_delay_feedback_adjusts_period() {
        let mut clock = SynchronizedClock::new(
            PacingConfig {
                target_tps: 100,
                target_delta: Duration::from_millis(10),
                window_size: 4,
            },
            ClockConfig::default(),
        );
        clock.initialize(Frame::PRE_SIM);
        thread::sleep(Duration::from_millis(60));
        clock.stop();

        // Report generous slack for the newest tick: the clock should slow
        // down (period grows past nominal). The normalization offsets of the
        // sample and of the newest tick cancel, so the result is exact.
        let newest = clock.frame();
        assert!(clock.set_delay(newest, Duration::from_millis(50)));
        let period = clock.current_period().as_secs_f64();
        assert!((period - 0.050).abs() < 1e-6, "period was {period}");
    }
}
