//! Synthetic rain source for running the node off-hardware
//!
//! Stands in for the reed switch: fires falling edges into the shared
//! [`EventCounter`](crate::counter::EventCounter) at jittered intervals,
//! with a burst of contact bounce after some tips, and wakes the sleeping
//! main loop the way the GPIO interrupt would.

use std::sync::Arc;

use rand_core::{RngCore, SeedableRng};
use rand_wyrand::WyRand;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, trace};

use crate::shared::SharedState;
use crate::stack::Clock;

/// Bounce edges land this soon after the real closure
const BOUNCE_MAX_MS: u64 = 40;

pub struct RainSource {
    mean_interval_ms: u64,
    rng: WyRand,
}

impl RainSource {
    pub fn new(mean_interval_ms: u64, seed: u64) -> Self {
        Self {
            mean_interval_ms: mean_interval_ms.max(1),
            rng: WyRand::seed_from_u64(seed),
        }
    }

    /// Gap before the next tip, uniform in `[mean/2, mean*3/2]`
    pub fn next_gap(&mut self) -> Duration {
        let half = self.mean_interval_ms / 2;
        let spread = self.rng.next_u64() % (self.mean_interval_ms + 1);
        Duration::from_millis(half + spread)
    }

    /// Offsets of bounce edges following a tip; none for about half the tips
    pub fn bounces(&mut self) -> Vec<Duration> {
        let count = self.rng.next_u64() % 4;
        if count < 2 {
            return vec![];
        }
        (0..count)
            .map(|_| Duration::from_millis(1 + self.rng.next_u64() % BOUNCE_MAX_MS))
            .collect()
    }

    pub fn spawn<C>(mut self, shared: Arc<SharedState>, clock: C, edge: Arc<Notify>) -> JoinHandle<()>
    where
        C: Clock + Send + Sync + 'static,
    {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(self.next_gap()).await;
                if fire_edge(&shared, &clock, &edge) {
                    debug!("Tip! {} pending", shared.counter.pending());
                }

                let mut elapsed = Duration::ZERO;
                let mut offsets = self.bounces();
                offsets.sort();
                for offset in offsets {
                    tokio::time::sleep(offset - elapsed).await;
                    elapsed = offset;
                    if fire_edge(&shared, &clock, &edge) {
                        debug!("Bounce edge counted as a tip");
                    } else {
                        trace!("Bounce edge suppressed");
                    }
                }
            }
        })
    }
}

/// Deliver one falling edge. Wakes the main loop only if the edge counted.
pub fn fire_edge<C: Clock>(shared: &SharedState, clock: &C, edge: &Notify) -> bool {
    let counted = shared.counter.on_edge(clock.now_ms());
    if counted {
        edge.notify_one();
    }
    counted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::DutyCycleConfig;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct FixedClock(AtomicU64);

    impl Clock for FixedClock {
        fn now_ms(&self) -> u64 {
            self.0.load(Ordering::Relaxed)
        }

        async fn delay_ms(&self, ms: u64) {
            self.0.fetch_add(ms, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_gaps_stay_around_mean() {
        let mut source = RainSource::new(10_000, 3);
        for _ in 0..1_000 {
            let gap = source.next_gap().as_millis() as u64;
            assert!((5_000..=15_000).contains(&gap), "gap {}", gap);
        }
    }

    #[test]
    fn test_bounces_are_short() {
        let mut source = RainSource::new(10_000, 11);
        let mut saw_bounce = false;
        for _ in 0..200 {
            for offset in source.bounces() {
                saw_bounce = true;
                assert!(offset.as_millis() as u64 <= BOUNCE_MAX_MS);
            }
        }
        assert!(saw_bounce);
    }

    #[test]
    fn test_bounce_does_not_wake_or_count() {
        let shared = SharedState::new(DutyCycleConfig::default(), 500);
        let clock = FixedClock(AtomicU64::new(1_000));
        let edge = Notify::new();

        assert!(fire_edge(&shared, &clock, &edge));
        clock.0.fetch_add(12, Ordering::Relaxed);
        assert!(!fire_edge(&shared, &clock, &edge));

        assert_eq!(shared.counter.pending(), 1);
        assert!(shared.counter.wake_pending());
    }
}
