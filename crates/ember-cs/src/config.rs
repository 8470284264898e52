//! # Submission Configuration
//!
//! Device-wide knobs for the submission path.

use ember_core::{Error, Result};
use ember_mem::ThrottleConfig;

/// Hard upper bound on jobs per submission
pub const MAX_GANG_SIZE: usize = 4;

/// Submission path configuration
#[derive(Debug, Clone)]
pub struct CsConfig {
    /// Maximum distinct engine targets per submission (1..=MAX_GANG_SIZE)
    pub max_gang_size: usize,
    /// Completion fences kept per context and engine (power of two)
    pub history_depth: usize,
    /// Buffer migration rate in MB/s (power of two, 0 disables moves)
    pub move_rate_mbps: u32,
    /// Cap on the accumulated migration allowance in microseconds
    pub move_window_us: u64,
    /// Integrated GPU sharing system memory
    pub is_apu: bool,
    /// Upper bound for waits on the submission path, in nanoseconds
    pub wait_timeout_ns: u64,
}

impl Default for CsConfig {
    fn default() -> Self {
        Self {
            max_gang_size: MAX_GANG_SIZE,
            history_depth: 32,
            move_rate_mbps: 8,
            move_window_us: 200_000,
            is_apu: false,
            wait_timeout_ns: 10_000_000_000,
        }
    }
}

impl CsConfig {
    /// Check the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_gang_size == 0 || self.max_gang_size > MAX_GANG_SIZE {
            return Err(Error::InvalidArgument);
        }
        if !self.history_depth.is_power_of_two() {
            return Err(Error::InvalidArgument);
        }
        if self.move_rate_mbps != 0 && !self.move_rate_mbps.is_power_of_two() {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    /// Migration throttle settings derived from this configuration
    pub fn throttle(&self) -> ThrottleConfig {
        ThrottleConfig {
            log2_rate_mbps: (self.move_rate_mbps != 0).then(|| self.move_rate_mbps.ilog2()),
            window_us: self.move_window_us,
            is_apu: self.is_apu,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = CsConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.throttle().log2_rate_mbps, Some(3));
    }

    #[test]
    fn test_rejects_bad_values() {
        let bad_rate = CsConfig {
            move_rate_mbps: 6,
            ..CsConfig::default()
        };
        assert_eq!(bad_rate.validate(), Err(Error::InvalidArgument));

        let bad_gang = CsConfig {
            max_gang_size: MAX_GANG_SIZE + 1,
            ..CsConfig::default()
        };
        assert!(bad_gang.validate().is_err());

        let bad_depth = CsConfig {
            history_depth: 24,
            ..CsConfig::default()
        };
        assert!(bad_depth.validate().is_err());
    }

    #[test]
    fn test_zero_rate_disables_moves() {
        let config = CsConfig {
            move_rate_mbps: 0,
            ..CsConfig::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.throttle().log2_rate_mbps, None);
    }
}
