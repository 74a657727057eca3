//! Tip event capture with timestamp debounce
//!
//! The edge handler counts one tip, stamps the edge time and disarms
//! itself. Re-arming happens from the main loop once the quiet window has
//! elapsed, so the edge handler itself never waits.
//!
//! Arming and the wake flag are a single atomic phase word:
//!
//! ```text
//! Armed --on_edge--> Capturing --(count, stamp)--> Triggered --rearm--> Armed
//! ```
//!
//! `Triggered` is the wake flag. Because `rearm` moves `Triggered -> Armed`
//! in one compare-exchange, the flag is never cleared while the input is
//! still disarmed, and no edge can slip between re-arming and clearing.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

/// Shortest quiet window accepted; reed switches bounce for well under this.
pub const MIN_QUIET_WINDOW_MS: u64 = 500;

const ARMED: u8 = 0;
const CAPTURING: u8 = 1;
const TRIGGERED: u8 = 2;

#[derive(Debug)]
pub struct EventCounter {
    count: AtomicU32,
    phase: AtomicU8,
    last_edge_ms: AtomicU64,
    quiet_window_ms: u64,
}

impl EventCounter {
    /// Create an armed counter. Windows shorter than [`MIN_QUIET_WINDOW_MS`]
    /// are raised to it.
    pub fn new(quiet_window_ms: u64) -> Self {
        Self {
            count: AtomicU32::new(0),
            phase: AtomicU8::new(ARMED),
            last_edge_ms: AtomicU64::new(0),
            quiet_window_ms: quiet_window_ms.max(MIN_QUIET_WINDOW_MS),
        }
    }

    /// Falling-edge handler.
    ///
    /// Returns `true` if the edge was counted. Edges arriving while the
    /// input is disarmed are bounce from the previous tip and are dropped,
    /// exactly as a disabled interrupt line would drop them.
    pub fn on_edge(&self, now_ms: u64) -> bool {
        if self
            .phase
            .compare_exchange(ARMED, CAPTURING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        // Saturate: a wrapped counter would report a near-empty period.
        let _ = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                Some(c.saturating_add(1))
            });
        self.last_edge_ms.store(now_ms, Ordering::Release);
        self.phase.store(TRIGGERED, Ordering::Release);
        true
    }

    /// Wake flag: an edge was captured and the input is waiting to be re-armed.
    pub fn wake_pending(&self) -> bool {
        self.phase.load(Ordering::Acquire) == TRIGGERED
    }

    /// Tips accumulated since the last drain.
    pub fn pending(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    pub fn quiet_window_ms(&self) -> u64 {
        self.quiet_window_ms
    }

    /// Milliseconds left before re-arming is permitted. Zero when no edge
    /// is pending.
    pub fn quiet_remaining_ms(&self, now_ms: u64) -> u64 {
        if !self.wake_pending() {
            return 0;
        }
        let since = now_ms.saturating_sub(self.last_edge_ms.load(Ordering::Acquire));
        self.quiet_window_ms.saturating_sub(since)
    }

    /// Re-enable edge capture and clear the wake flag.
    ///
    /// Refused (returns `false`) when no edge is pending or the quiet window
    /// has not yet elapsed. This is the only place the wake flag is cleared.
    pub fn rearm(&self, now_ms: u64) -> bool {
        if self.quiet_remaining_ms(now_ms) > 0 {
            return false;
        }
        self.phase
            .compare_exchange(TRIGGERED, ARMED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Drain the counter for a report, returning what was drained.
    pub fn take(&self) -> u32 {
        self.count.swap(0, Ordering::AcqRel)
    }

    /// Put drained tips back after a failed send.
    pub fn restore(&self, tips: u32) {
        let _ = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                Some(c.saturating_add(tips))
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    const WINDOW: u64 = 500;

    #[test]
    fn test_spaced_edges_each_count() {
        let counter = EventCounter::new(WINDOW);
        let mut now = 1_000;

        for _ in 0..25 {
            assert!(counter.on_edge(now));
            now += WINDOW;
            assert!(counter.rearm(now));
            now += 1_000;
        }

        assert_eq!(counter.pending(), 25);
        assert!(!counter.wake_pending());
    }

    #[test]
    fn test_bounce_inside_window_counts_once() {
        let counter = EventCounter::new(WINDOW);

        assert!(counter.on_edge(10_000));
        // Contact bounce a few ms later
        assert!(!counter.on_edge(10_004));
        assert!(!counter.on_edge(10_030));
        assert_eq!(counter.pending(), 1);

        // Re-arm after the quiet window, then a genuine second tip
        assert!(counter.rearm(10_500));
        assert!(counter.on_edge(12_000));
        assert_eq!(counter.pending(), 2);
    }

    #[test]
    fn test_rearm_refused_before_quiet_window() {
        let counter = EventCounter::new(WINDOW);
        counter.on_edge(2_000);

        assert_eq!(counter.quiet_remaining_ms(2_200), 300);
        assert!(!counter.rearm(2_200));
        assert!(counter.wake_pending());

        assert_eq!(counter.quiet_remaining_ms(2_500), 0);
        assert!(counter.rearm(2_500));
        assert!(!counter.wake_pending());
    }

    #[test]
    fn test_rearm_without_edge_is_noop() {
        let counter = EventCounter::new(WINDOW);
        assert!(!counter.rearm(5_000));
        // Still armed
        assert!(counter.on_edge(5_001));
    }

    #[test]
    fn test_short_window_is_raised_to_minimum() {
        let counter = EventCounter::new(50);
        assert_eq!(counter.quiet_window_ms(), MIN_QUIET_WINDOW_MS);

        counter.on_edge(0);
        assert!(!counter.rearm(100));
    }

    #[test]
    fn test_count_saturates() {
        let counter = EventCounter::new(WINDOW);
        counter.restore(u32::MAX - 1);

        assert!(counter.on_edge(0));
        assert!(counter.rearm(WINDOW));
        assert!(counter.on_edge(2 * WINDOW));

        assert_eq!(counter.pending(), u32::MAX);
    }

    #[test]
    fn test_take_drains_and_restore_returns() {
        let counter = EventCounter::new(WINDOW);
        counter.on_edge(0);
        counter.rearm(WINDOW);
        counter.on_edge(2 * WINDOW);

        assert_eq!(counter.take(), 2);
        assert_eq!(counter.pending(), 0);

        counter.restore(2);
        assert_eq!(counter.pending(), 2);
    }

    #[test]
    fn test_concurrent_edges_and_main_loop_lose_nothing() {
        const EDGES: u64 = 50_000;
        let counter = EventCounter::new(WINDOW);
        let done = AtomicBool::new(false);

        let (counted, (drained, rearms)) = std::thread::scope(|s| {
            let edges = s.spawn(|| {
                let mut counted = 0u32;
                for now in 0..EDGES {
                    if counter.on_edge(now) {
                        counted += 1;
                        // Give the main loop a chance to re-arm
                        std::thread::yield_now();
                    }
                }
                done.store(true, Ordering::Release);
                counted
            });

            let main_loop = s.spawn(|| {
                let mut drained = 0u32;
                let mut rearms = 0u32;
                let mut round = 0u32;
                while !done.load(Ordering::Acquire) {
                    // u64::MAX is always past the quiet window
                    if counter.rearm(u64::MAX) {
                        rearms += 1;
                    }

                    let tips = counter.take();
                    if round % 3 == 0 {
                        // Failed send: half goes back
                        counter.restore(tips / 2);
                        drained += tips - tips / 2;
                    } else {
                        drained += tips;
                    }
                    round += 1;
                }
                (drained, rearms)
            });

            (edges.join().unwrap(), main_loop.join().unwrap())
        });

        assert!(counted >= 1);
        assert_eq!(drained + counter.pending(), counted);

        // Every counted edge set the flag, and exactly one re-arm cleared it
        let last = counter.wake_pending();
        assert_eq!(rearms + last as u32, counted);
        assert_eq!(counter.rearm(u64::MAX), last);
        assert!(!counter.wake_pending());
    }
}
