//! Re-subscribe policy applied after the transport closes the stream.

use std::time::Duration;

use echorelay_core::config::ResubscribeConfig;

/// How the relay gets its subscription back after the broker closed it.
/// Disabled by default: a closed stream stays closed unless the operator
/// opts in with `--resubscribe`.
#[derive(Debug, Clone, PartialEq)]
pub struct ResubscribePolicy {
    pub enabled: bool,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Attempts per closure before the relay stops trying. `None` retries
    /// forever.
    pub max_attempts: Option<u32>,
}

impl Default for ResubscribePolicy {
    fn default() -> Self {
        Self::from(&ResubscribeConfig::default())
    }
}

impl From<&ResubscribeConfig> for ResubscribePolicy {
    fn from(config: &ResubscribeConfig) -> Self {
        Self {
            enabled: config.enabled,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier,
            max_attempts: config.max_attempts,
        }
    }
}

impl ResubscribePolicy {
    /// Pause before re-subscribe attempt `attempt`, counted from 0 after the
    /// stream closed: `initial_delay * multiplier^attempt`, at most
    /// `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs).map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Whether attempt number `attempt` is still within the budget.
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt < max)
    }
}
