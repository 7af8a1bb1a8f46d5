//! Deterministic instruction counting and guest/host clock alignment.
//!
//! In icount mode the virtual clock advances by executed guest
//! instructions instead of host time. The engine asks the
//! [`InstructionClock`] for a quantum before each run, retires executed
//! instructions back into it, and (optionally) keeps the guest clock from
//! running ahead of real time by sleeping the difference at block
//! boundaries.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::warn;

/// Maximum the guest clock may run ahead of real time before the host
/// sleeps, in nanoseconds.
const VM_CLOCK_ADVANCE_NS: i64 = 3_000_000;
/// Drift warnings are emitted at most this often.
const MAX_WARN_RATE_NS: i64 = 2_000_000_000;
/// Total drift warnings per process.
const MAX_WARN_PRINTS: u32 = 100;
/// The warning threshold shrinks only once the lag drops this far below it.
const THRESHOLD_REDUCE_S: f32 = 1.5;

/// The deterministic clock driving icount execution.
///
/// Implementations own the global instruction counter and the virtual
/// clock derived from it; the engine only moves quanta in and out.
pub trait InstructionClock: Send + Sync {
    /// Instruction budget for the CPU's next execution quantum. The engine
    /// never executes more than this many instructions before asking again.
    fn next_quantum(&self, cpu_index: usize) -> u64;

    /// Credits `retired` executed instructions back to the global counter.
    fn account(&self, cpu_index: usize, retired: u64);

    /// The deterministic virtual clock, in nanoseconds.
    fn virtual_ns(&self) -> i64;

    /// The host real-time reference the virtual clock is aligned against.
    fn realtime_ns(&self) -> i64;

    /// Converts an instruction count to virtual nanoseconds.
    fn icount_to_ns(&self, icount: i64) -> i64;

    /// Blocks the calling CPU thread while the guest waits for real time.
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Engine-level icount configuration.
pub struct IcountMode {
    pub clock: Arc<dyn InstructionClock>,
    /// Keep the virtual clock aligned with real time (sleep when the guest
    /// runs ahead, warn when it falls behind).
    pub align: bool,
}

impl std::fmt::Debug for IcountMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IcountMode")
            .field("align", &self.align)
            .finish_non_exhaustive()
    }
}

/// Worst observed guest/host clock drift since the engine started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriftInfo {
    /// How far the guest has fallen behind real time.
    pub max_delay: Duration,
    /// How far the guest has run ahead of real time.
    pub max_advance: Duration,
}

#[derive(Debug)]
struct WarnState {
    threshold_s: f32,
    last_warn_ns: i64,
    prints: u32,
}

/// Drift bookkeeping shared by all CPUs of an engine.
#[derive(Debug)]
pub(crate) struct DriftStats {
    /// Most negative observed diff (guest behind real time).
    min_diff_ns: AtomicI64,
    /// Most positive observed diff (guest ahead of real time).
    max_diff_ns: AtomicI64,
    warn: Mutex<WarnState>,
}

impl DriftStats {
    pub(crate) fn new() -> Self {
        Self {
            min_diff_ns: AtomicI64::new(0),
            max_diff_ns: AtomicI64::new(0),
            warn: Mutex::new(WarnState {
                threshold_s: 0.0,
                last_warn_ns: 0,
                prints: 0,
            }),
        }
    }

    fn observe(&self, diff_ns: i64) {
        self.min_diff_ns.fetch_min(diff_ns, Ordering::Relaxed);
        self.max_diff_ns.fetch_max(diff_ns, Ordering::Relaxed);
    }

    /// Rate-limited lateness warning with hysteresis: the reported
    /// threshold grows in whole seconds as the lag grows, and shrinks only
    /// once the lag has dropped [`THRESHOLD_REDUCE_S`] below it.
    fn maybe_warn(&self, diff_ns: i64, realtime_ns: i64) {
        let mut w = self.warn.lock().unwrap();
        if realtime_ns - w.last_warn_ns < MAX_WARN_RATE_NS || w.prints >= MAX_WARN_PRINTS {
            return;
        }
        let late_s = -(diff_ns as f32) / 1e9;
        if late_s > w.threshold_s || late_s < w.threshold_s - THRESHOLD_REDUCE_S {
            w.threshold_s = ((-diff_ns / 1_000_000_000) + 1) as f32;
            warn!(
                "guest is now late by {:.1} to {:.1} seconds",
                w.threshold_s - 1.0,
                w.threshold_s,
            );
            w.prints += 1;
            w.last_warn_ns = realtime_ns;
        }
    }

    pub(crate) fn info(&self) -> DriftInfo {
        let min = self.min_diff_ns.load(Ordering::Relaxed);
        let max = self.max_diff_ns.load(Ordering::Relaxed);
        DriftInfo {
            max_delay: Duration::from_nanos((-min).max(0) as u64),
            max_advance: Duration::from_nanos(max.max(0) as u64),
        }
    }
}

/// Per-run clock aligner.
///
/// `diff_ns` tracks how far the virtual clock is ahead of real time;
/// executed instructions advance it, and once it exceeds
/// [`VM_CLOCK_ADVANCE_NS`] the CPU thread sleeps the difference away.
pub(crate) struct SyncClocks {
    enabled: bool,
    diff_ns: i64,
    last_cpu_icount: u64,
}

impl SyncClocks {
    pub(crate) fn disabled() -> Self {
        Self {
            enabled: false,
            diff_ns: 0,
            last_cpu_icount: 0,
        }
    }

    /// Samples the initial clock difference and reports drift. `cpu_icount`
    /// is the CPU's remaining quantum (decrementer plus reserve).
    pub(crate) fn start(ic: &IcountMode, drift: &DriftStats, cpu_icount: u64) -> Self {
        if !ic.align {
            return Self::disabled();
        }
        let realtime = ic.clock.realtime_ns();
        let diff = ic.clock.virtual_ns() - realtime;
        drift.observe(diff);
        drift.maybe_warn(diff, realtime);
        Self {
            enabled: true,
            diff_ns: diff,
            last_cpu_icount: cpu_icount,
        }
    }

    /// Advances the tracked difference by the instructions executed since
    /// the last call and sleeps if the guest is too far ahead.
    pub(crate) fn align(&mut self, ic: &IcountMode, cpu_icount: u64) {
        if !self.enabled {
            return;
        }
        let executed = self.last_cpu_icount as i64 - cpu_icount as i64;
        self.diff_ns += ic.clock.icount_to_ns(executed);
        self.last_cpu_icount = cpu_icount;
        if self.diff_ns > VM_CLOCK_ADVANCE_NS {
            ic.clock.sleep(Duration::from_nanos(self.diff_ns as u64));
            self.diff_ns = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    /// A clock where one instruction is one nanosecond, virtual time is set
    /// by the test, and sleeps are recorded instead of performed.
    struct FakeClock {
        virtual_ns: AtomicI64,
        realtime_ns: AtomicI64,
        slept_ns: AtomicU64,
    }

    impl FakeClock {
        fn new() -> Self {
            Self {
                virtual_ns: AtomicI64::new(0),
                realtime_ns: AtomicI64::new(0),
                slept_ns: AtomicU64::new(0),
            }
        }
    }

    impl InstructionClock for FakeClock {
        fn next_quantum(&self, _cpu_index: usize) -> u64 {
            1000
        }
        fn account(&self, _cpu_index: usize, retired: u64) {
            self.virtual_ns.fetch_add(retired as i64, Ordering::Relaxed);
        }
        fn virtual_ns(&self) -> i64 {
            self.virtual_ns.load(Ordering::Relaxed)
        }
        fn realtime_ns(&self) -> i64 {
            self.realtime_ns.load(Ordering::Relaxed)
        }
        fn icount_to_ns(&self, icount: i64) -> i64 {
            icount
        }
        fn sleep(&self, duration: Duration) {
            self.slept_ns.fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
        }
    }

    fn mode(clock: &Arc<FakeClock>) -> IcountMode {
        IcountMode {
            clock: clock.clone() as Arc<dyn InstructionClock>,
            align: true,
        }
    }

    #[test]
    fn sleeps_once_guest_runs_too_far_ahead() {
        let clock = Arc::new(FakeClock::new());
        let ic = mode(&clock);
        let drift = DriftStats::new();

        let mut sc = SyncClocks::start(&ic, &drift, 10_000_000);
        // 2 ms of guest progress: under the advance cap, no sleep.
        sc.align(&ic, 8_000_000);
        assert_eq!(clock.slept_ns.load(Ordering::Relaxed), 0);
        // 2 ms more pushes past the 3 ms cap; the whole excess is slept.
        sc.align(&ic, 6_000_000);
        assert_eq!(clock.slept_ns.load(Ordering::Relaxed), 4_000_000);
        // The difference was reset by the sleep.
        sc.align(&ic, 5_000_000);
        assert_eq!(clock.slept_ns.load(Ordering::Relaxed), 4_000_000);
    }

    #[test]
    fn alignment_disabled_never_sleeps() {
        let clock = Arc::new(FakeClock::new());
        let ic = IcountMode {
            clock: clock.clone() as Arc<dyn InstructionClock>,
            align: false,
        };
        let drift = DriftStats::new();
        let mut sc = SyncClocks::start(&ic, &drift, 10_000_000);
        sc.align(&ic, 0);
        assert_eq!(clock.slept_ns.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn drift_stats_track_worst_case_in_both_directions() {
        let drift = DriftStats::new();
        drift.observe(-5_000_000_000);
        drift.observe(-2_000_000_000);
        drift.observe(1_500_000);
        let info = drift.info();
        assert_eq!(info.max_delay, Duration::from_secs(5));
        assert_eq!(info.max_advance, Duration::from_nanos(1_500_000));
    }

    #[test]
    fn warning_threshold_grows_and_rate_limits() {
        let drift = DriftStats::new();

        // First observation, 2.3 s late: threshold becomes 3 s.
        drift.maybe_warn(-2_300_000_000, 10_000_000_000);
        assert_eq!(drift.warn.lock().unwrap().prints, 1);
        assert_eq!(drift.warn.lock().unwrap().threshold_s, 3.0);

        // Worse, but within the rate limit: suppressed.
        drift.maybe_warn(-3_300_000_000, 11_000_000_000);
        assert_eq!(drift.warn.lock().unwrap().prints, 1);

        // Past the rate limit but still under the threshold: suppressed.
        drift.maybe_warn(-2_500_000_000, 13_000_000_000);
        assert_eq!(drift.warn.lock().unwrap().prints, 1);

        // Past the rate limit and over the threshold: printed, threshold grows.
        drift.maybe_warn(-3_300_000_000, 15_000_000_000);
        assert_eq!(drift.warn.lock().unwrap().prints, 2);
        assert_eq!(drift.warn.lock().unwrap().threshold_s, 4.0);

        // Lag shrinking well below the threshold re-reports downwards.
        drift.maybe_warn(-1_000_000_000, 18_000_000_000);
        assert_eq!(drift.warn.lock().unwrap().prints, 3);
        assert_eq!(drift.warn.lock().unwrap().threshold_s, 2.0);
    }

    #[test]
    fn warnings_stop_after_the_print_budget() {
        let drift = DriftStats::new();
        let mut now = 10_000_000_000i64;
        for i in 0..(MAX_WARN_PRINTS + 20) as i64 {
            // Ever-growing lag so each eligible call crosses the threshold.
            drift.maybe_warn(-(i + 1) * 2_000_000_000, now);
            now += MAX_WARN_RATE_NS;
        }
        assert_eq!(drift.warn.lock().unwrap().prints, MAX_WARN_PRINTS);
    }
}
