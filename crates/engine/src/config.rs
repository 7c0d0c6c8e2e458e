use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Pause after each remote call, per call kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimit {
    pub place_ms: u64,
    pub bulk_ms: u64,
    pub move_ms: u64,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            place_ms: 50,
            bulk_ms: 250,
            move_ms: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Shortest run the 3D optimizer turns into a bulk op; the 2D floor is twice this.
    pub min_batch_size: usize,
    /// Placement lists at or below this size are placed directly without optimizing.
    pub batch_threshold: usize,
    /// Extra attempts after the first write.
    pub max_retries: u32,
    pub retry_delays_ms: Vec<u64>,
    pub rate_limit: RateLimit,
    pub move_tolerance: f64,
    /// Closer than this, move-and-verify does not move at all.
    pub close_enough: f64,
    pub move_timeout_ms: u64,
    pub move_poll_ms: u64,
    pub drift_ceiling: f64,
    pub max_blocks: u64,
    /// Number of past runs kept for undo.
    pub undo_retention: usize,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            min_batch_size: 4,
            batch_threshold: 8,
            max_retries: 3,
            retry_delays_ms: vec![50, 100, 200],
            rate_limit: RateLimit::default(),
            move_tolerance: 2.0,
            close_enough: 4.0,
            move_timeout_ms: 5_000,
            move_poll_ms: 250,
            drift_ceiling: 10.0,
            max_blocks: 500_000,
            undo_retention: 5,
        }
    }
}

impl BuildConfig {
    /// Delay before retry number `attempt` (0-based); the last entry repeats.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let ms = self
            .retry_delays_ms
            .get(attempt as usize)
            .or(self.retry_delays_ms.last())
            .copied()
            .unwrap_or(0);
        Duration::from_millis(ms)
    }

    pub fn move_timeout(&self) -> Duration {
        Duration::from_millis(self.move_timeout_ms)
    }

    pub fn move_poll(&self) -> Duration {
        Duration::from_millis(self.move_poll_ms.max(1))
    }

    /// Same limits, no pauses. For sandboxes and tests.
    pub fn without_delays(mut self) -> Self {
        self.retry_delays_ms = vec![0];
        self.rate_limit = RateLimit {
            place_ms: 0,
            bulk_ms: 0,
            move_ms: 0,
        };
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_schedule_escalates_then_repeats() {
        let cfg = BuildConfig::default();
        assert_eq!(cfg.retry_delay(0), Duration::from_millis(50));
        assert_eq!(cfg.retry_delay(2), Duration::from_millis(200));
        assert_eq!(cfg.retry_delay(7), Duration::from_millis(200));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: BuildConfig =
            serde_json::from_str(r#"{"max_retries": 1, "rate_limit": {"bulk_ms": 10}}"#).unwrap();
        assert_eq!(cfg.max_retries, 1);
        assert_eq!(cfg.rate_limit.bulk_ms, 10);
        assert_eq!(cfg.rate_limit.place_ms, 50);
        assert_eq!(cfg.min_batch_size, 4);
    }
}
