//! Exponential retry delay with a ceiling.

use crate::config::PurgeConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base_secs: i64,
    pub multiplier: f64,
    pub cap_secs: i64,
}

impl BackoffPolicy {
    pub fn new(base_secs: i64, multiplier: f64, cap_secs: i64) -> Self {
        Self {
            base_secs,
            multiplier,
            cap_secs,
        }
    }

    pub fn from_config(config: &PurgeConfig) -> Self {
        Self::new(config.backoff_base_secs, config.backoff_multiplier, config.backoff_cap_secs)
    }

    /// Delay after the `attempts`-th failure: `min(base * multiplier^(attempts-1), cap)`.
    pub fn delay(&self, attempts: u32) -> i64 {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.base_secs as f64 * self.multiplier.max(1.0).powi(exponent);
        if !raw.is_finite() || raw >= self.cap_secs as f64 {
            self.cap_secs
        } else {
            (raw as i64).max(0)
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&PurgeConfig::default())
    }
}
