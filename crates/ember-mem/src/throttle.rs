//! # Migration Throttle
//!
//! Rate limiter for buffer moves during submission.
//!
//! The allowance is a token bucket kept in microseconds. Elapsed time adds to
//! it up to a fixed window; moved bytes are converted back to time and
//! subtracted, possibly driving it negative. The rate is a power of two in
//! MB/s, so with 1 MB/s = 1 byte/µs both conversions are shifts.
//!
//! ```text
//!   budget():  accum += min(now - last, window)   ──► bytes = accum << log2
//!   report():  accum -= bytes >> log2             (may go negative: debt)
//! ```

use ember_core::Clock;
use spin::Mutex;

use crate::manager::MemoryUsage;

/// Throttle configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleConfig {
    /// log2 of the move rate in MB/s; `None` disables moves
    pub log2_rate_mbps: Option<u32>,
    /// Maximum accumulated allowance in microseconds
    pub window_us: u64,
    /// Integrated GPU: VRAM is carved out of system memory
    pub is_apu: bool,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            log2_rate_mbps: Some(3),
            window_us: 200_000,
            is_apu: false,
        }
    }
}

/// Bytes a submission may move
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MoveBudget {
    /// Bytes into any domain
    pub max_bytes: u64,
    /// Bytes into CPU-visible VRAM
    pub max_vis_bytes: u64,
}

#[derive(Debug, Default)]
struct ThrottleState {
    last_update_us: Option<u64>,
    accum_us: i64,
    accum_us_vis: i64,
}

/// Per-device migration admission controller
#[derive(Debug)]
pub struct MigrationThrottle {
    config: ThrottleConfig,
    state: Mutex<ThrottleState>,
}

impl MigrationThrottle {
    /// Create a throttle with an empty allowance
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ThrottleState::default()),
        }
    }

    /// Get configuration
    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    fn us_to_bytes(log2: u32, us: i64) -> u64 {
        if us <= 0 {
            return 0;
        }
        (us as u64).checked_shl(log2).unwrap_or(u64::MAX)
    }

    fn bytes_to_us(log2: u32, bytes: u64) -> i64 {
        i64::try_from(bytes >> log2).unwrap_or(i64::MAX)
    }

    /// Current budget, advancing the allowance to `clock`'s time
    pub fn budget(&self, clock: &dyn Clock, usage: &MemoryUsage) -> MoveBudget {
        let Some(log2) = self.config.log2_rate_mbps else {
            return MoveBudget::default();
        };
        let window = i64::try_from(self.config.window_us).unwrap_or(i64::MAX);

        let total_vram = usage.vram_size.saturating_sub(usage.vram_pinned);
        let free_vram = total_vram.saturating_sub(usage.vram_used);

        let now = clock.now_us();
        let mut state = self.state.lock();
        let increment = match state.last_update_us {
            Some(last) => i64::try_from(now.saturating_sub(last)).unwrap_or(i64::MAX),
            None => window,
        };
        state.last_update_us = Some(now);
        state.accum_us = state.accum_us.saturating_add(increment).min(window);

        // With plenty of free VRAM, let a discrete GPU fill part of it now
        // even while in debt.
        if free_vram >= 128 * 1024 * 1024 || free_vram >= total_vram / 8 {
            let min_us = if self.config.is_apu {
                0
            } else {
                Self::bytes_to_us(log2, free_vram / 4)
            };
            state.accum_us = state.accum_us.max(min_us);
        }
        let max_bytes = Self::us_to_bytes(log2, state.accum_us);

        let max_vis_bytes = if usage.vram_fully_visible() {
            0
        } else {
            if usage.visible_vram_used < usage.visible_vram_size {
                let free_vis = usage.visible_vram_size - usage.visible_vram_used;
                state.accum_us_vis = state.accum_us_vis.saturating_add(increment).min(window);
                if free_vis >= usage.visible_vram_size / 2 {
                    state.accum_us_vis = state
                        .accum_us_vis
                        .max(Self::bytes_to_us(log2, free_vis / 2));
                }
            }
            Self::us_to_bytes(log2, state.accum_us_vis)
        };

        MoveBudget {
            max_bytes,
            max_vis_bytes,
        }
    }

    /// Charge moved bytes against the allowance
    pub fn report(&self, bytes: u64, vis_bytes: u64) {
        let Some(log2) = self.config.log2_rate_mbps else {
            return;
        };
        let mut state = self.state.lock();
        state.accum_us = state.accum_us.saturating_sub(Self::bytes_to_us(log2, bytes));
        state.accum_us_vis = state
            .accum_us_vis
            .saturating_sub(Self::bytes_to_us(log2, vis_bytes));
    }

    /// Accumulated allowance in microseconds
    pub fn accumulated_us(&self) -> i64 {
        self.state.lock().accum_us
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::ManualClock;

    const MB: u64 = 1024 * 1024;

    /// VRAM nearly full so the free-memory floor never applies
    fn busy() -> MemoryUsage {
        MemoryUsage {
            vram_size: 1024 * MB,
            vram_used: 1024 * MB,
            visible_vram_size: 1024 * MB,
            ..MemoryUsage::default()
        }
    }

    #[test]
    fn test_first_query_gets_full_window() {
        let throttle = MigrationThrottle::new(ThrottleConfig::default());
        let clock = ManualClock::new(0);
        let budget = throttle.budget(&clock, &busy());
        assert_eq!(budget.max_bytes, 200_000 << 3);
        assert_eq!(budget.max_vis_bytes, 0);
    }

    #[test]
    fn test_report_creates_debt() {
        let throttle = MigrationThrottle::new(ThrottleConfig::default());
        let clock = ManualClock::new(0);
        throttle.budget(&clock, &busy());

        throttle.report(4 * MB, 0);
        assert!(throttle.accumulated_us() < 0);
        assert_eq!(throttle.budget(&clock, &busy()).max_bytes, 0);

        // Debt is paid back by elapsed time, never by more reports.
        clock.advance_us(200_000);
        let after = throttle.budget(&clock, &busy()).max_bytes;
        assert!(after < 200_000 << 3);
    }

    #[test]
    fn test_report_never_raises_budget() {
        let clock = ManualClock::new(0);
        let with_moves = MigrationThrottle::new(ThrottleConfig::default());
        let without = MigrationThrottle::new(ThrottleConfig::default());
        let moves = [0u64, 4096, 3 * MB, 17, MB / 2];

        for (step, bytes) in moves.iter().enumerate() {
            clock.advance_us(10_000 * step as u64);
            let a = with_moves.budget(&clock, &busy()).max_bytes;
            let b = without.budget(&clock, &busy()).max_bytes;
            assert!(a <= b);
            with_moves.report(*bytes, 0);
        }
    }

    #[test]
    fn test_disabled_rate() {
        let throttle = MigrationThrottle::new(ThrottleConfig {
            log2_rate_mbps: None,
            ..ThrottleConfig::default()
        });
        let clock = ManualClock::new(0);
        assert_eq!(throttle.budget(&clock, &busy()), MoveBudget::default());
    }

    #[test]
    fn test_free_vram_floor_on_discrete_only() {
        let idle = MemoryUsage {
            vram_size: 1024 * MB,
            visible_vram_size: 1024 * MB,
            ..MemoryUsage::default()
        };
        let clock = ManualClock::new(0);

        let dgpu = MigrationThrottle::new(ThrottleConfig::default());
        dgpu.budget(&clock, &idle);
        dgpu.report(64 * MB, 0);
        assert_eq!(dgpu.budget(&clock, &idle).max_bytes, 256 * MB);

        let apu = MigrationThrottle::new(ThrottleConfig {
            is_apu: true,
            ..ThrottleConfig::default()
        });
        apu.budget(&clock, &idle);
        apu.report(64 * MB, 0);
        assert_eq!(apu.budget(&clock, &idle).max_bytes, 0);
    }

    #[test]
    fn test_visible_budget_on_small_bar() {
        let usage = MemoryUsage {
            vram_size: 1024 * MB,
            vram_used: 1024 * MB,
            visible_vram_size: 256 * MB,
            ..MemoryUsage::default()
        };
        let throttle = MigrationThrottle::new(ThrottleConfig::default());
        let clock = ManualClock::new(0);
        let budget = throttle.budget(&clock, &usage);
        assert_eq!(budget.max_vis_bytes, 128 * MB);
    }
}
