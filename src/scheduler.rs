//! Duty cycle and watchdog
//!
//! The next transmission is scheduled `base_period_ms` plus a random jitter
//! so that nodes powered up together drift apart on the air. If rain stays
//! away long enough, the watchdog forces a heartbeat report.

use std::sync::atomic::{AtomicU32, Ordering};

use rand_core::{RngCore, SeedableRng};
use rand_wyrand::WyRand;

/// Default base period: 15 minutes
pub const DEFAULT_BASE_PERIOD_MS: u32 = 900_000;
/// Default maximum jitter added to each period
pub const DEFAULT_JITTER_MAX_MS: u32 = 1_000;
/// Default watchdog: one heartbeat per day
pub const DEFAULT_WATCHDOG_PERIOD_MS: u32 = 86_400_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DutyCycleConfig {
    pub base_period_ms: u32,
    pub jitter_max_ms: u32,
    pub watchdog_period_ms: u32,
}

impl Default for DutyCycleConfig {
    fn default() -> Self {
        Self {
            base_period_ms: DEFAULT_BASE_PERIOD_MS,
            jitter_max_ms: DEFAULT_JITTER_MAX_MS,
            watchdog_period_ms: DEFAULT_WATCHDOG_PERIOD_MS,
        }
    }
}

impl DutyCycleConfig {
    /// True once `cycles` base periods cover the watchdog period.
    pub fn should_force_send(&self, cycles: u32) -> bool {
        cycles as u64 * self.base_period_ms as u64 >= self.watchdog_period_ms as u64
    }
}

/// Duty cycle configuration shared between the downlink handler (writer)
/// and the main loop (reader).
///
/// Each field is its own atomic and every downlink command rewrites exactly
/// one field, so a reader can never observe a half-applied update.
#[derive(Debug)]
pub struct SharedDutyCycle {
    base_period_ms: AtomicU32,
    jitter_max_ms: AtomicU32,
    watchdog_period_ms: AtomicU32,
}

impl SharedDutyCycle {
    pub fn new(config: DutyCycleConfig) -> Self {
        Self {
            base_period_ms: AtomicU32::new(config.base_period_ms),
            jitter_max_ms: AtomicU32::new(config.jitter_max_ms),
            watchdog_period_ms: AtomicU32::new(config.watchdog_period_ms),
        }
    }

    pub fn snapshot(&self) -> DutyCycleConfig {
        DutyCycleConfig {
            base_period_ms: self.base_period_ms.load(Ordering::Acquire),
            jitter_max_ms: self.jitter_max_ms.load(Ordering::Acquire),
            watchdog_period_ms: self.watchdog_period_ms.load(Ordering::Acquire),
        }
    }

    pub fn base_period_ms(&self) -> u32 {
        self.base_period_ms.load(Ordering::Acquire)
    }

    /// Replace the base period, returning the previous value.
    pub fn set_base_period_ms(&self, period_ms: u32) -> u32 {
        self.base_period_ms.swap(period_ms, Ordering::AcqRel)
    }
}

impl Default for SharedDutyCycle {
    fn default() -> Self {
        Self::new(DutyCycleConfig::default())
    }
}

/// Jitter source for the duty cycle.
pub struct DutyCycleScheduler {
    rng: WyRand,
}

impl DutyCycleScheduler {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: WyRand::seed_from_u64(seed),
        }
    }

    /// `base_period_ms + uniform(0..=jitter_max_ms)`
    pub fn next_delay(&mut self, config: &DutyCycleConfig) -> u32 {
        let jitter = if config.jitter_max_ms == 0 {
            0
        } else {
            self.draw_below(config.jitter_max_ms as u64 + 1) as u32
        };
        config.base_period_ms.saturating_add(jitter)
    }

    /// Uniform in `0..range`. Draws from the top partial bucket are
    /// rejected so the modulo carries no bias.
    fn draw_below(&mut self, range: u64) -> u64 {
        let zone = u64::MAX - u64::MAX % range;
        loop {
            let value = self.rng.next_u64();
            if value < zone {
                return value % range;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_delay_within_bounds() {
        let config = DutyCycleConfig {
            base_period_ms: 600_000,
            jitter_max_ms: 5_000,
            ..Default::default()
        };
        let mut scheduler = DutyCycleScheduler::new(0xC0FFEE);

        let mut saw_jitter = false;
        for _ in 0..10_000 {
            let delay = scheduler.next_delay(&config);
            assert!((600_000..=605_000).contains(&delay), "delay {} out of range", delay);
            saw_jitter |= delay != 600_000;
        }
        assert!(saw_jitter);
    }

    #[test]
    fn test_small_jitter_hits_every_value_evenly() {
        let config = DutyCycleConfig {
            base_period_ms: 1_000,
            jitter_max_ms: 3,
            ..Default::default()
        };
        let mut scheduler = DutyCycleScheduler::new(99);

        let mut hits = [0u32; 4];
        for _ in 0..4_000 {
            hits[(scheduler.next_delay(&config) - 1_000) as usize] += 1;
        }
        for (jitter, count) in hits.iter().enumerate() {
            assert!(*count > 800, "jitter {} drawn {} times", jitter, count);
        }
    }

    #[test]
    fn test_zero_jitter_is_exact() {
        let config = DutyCycleConfig {
            jitter_max_ms: 0,
            ..Default::default()
        };
        let mut scheduler = DutyCycleScheduler::new(1);
        assert_eq!(scheduler.next_delay(&config), DEFAULT_BASE_PERIOD_MS);
    }

    #[test]
    fn test_same_seed_same_schedule() {
        let config = DutyCycleConfig::default();
        let mut a = DutyCycleScheduler::new(42);
        let mut b = DutyCycleScheduler::new(42);
        for _ in 0..16 {
            assert_eq!(a.next_delay(&config), b.next_delay(&config));
        }
    }

    #[test]
    fn test_watchdog_fires_at_96_cycles_by_default() {
        let config = DutyCycleConfig::default();
        assert!(!config.should_force_send(95));
        assert!(config.should_force_send(96));
    }

    #[test]
    fn test_watchdog_product_does_not_overflow() {
        let config = DutyCycleConfig {
            base_period_ms: 933_300_000,
            ..Default::default()
        };
        // 5 * 933_300_000 overflows u32
        assert!(config.should_force_send(5));
    }

    #[test]
    fn test_shared_snapshot_sees_base_update() {
        let shared = SharedDutyCycle::default();
        let previous = shared.set_base_period_ms(600_000);

        assert_eq!(previous, DEFAULT_BASE_PERIOD_MS);
        let snap = shared.snapshot();
        assert_eq!(snap.base_period_ms, 600_000);
        assert_eq!(snap.watchdog_period_ms, DEFAULT_WATCHDOG_PERIOD_MS);
    }
}
