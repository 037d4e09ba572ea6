use std::time::Duration;

use dossier_model::TaskID;

use crate::config::RetryConfig;

/// Exponential backoff with deterministic jitter per (task, attempt).
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// Whether a retryable failure on `attempt` earns another attempt.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts()
    }

    /// Delay to wait after failed `attempt` before the next one. The same
    /// task and attempt always get the same delay.
    pub fn delay_for(&self, task_id: TaskID, attempt: u32) -> Duration {
        let anchor = self.base_delay_ms(attempt);
        if anchor == 0 {
            return Duration::ZERO;
        }
        let (low, high) = self.jitter_window(anchor);
        let offset = match high - low {
            0 => 0,
            spread => jitter_seed(task_id, attempt) % (spread + 1),
        };
        Duration::from_millis(low + offset)
    }

    fn base_delay_ms(&self, attempt: u32) -> u64 {
        if attempt == 0 {
            return 0;
        }

        let exp = attempt.saturating_sub(1).min(62) as i32;
        let scaled = (self.config.backoff_base_ms as f64) * 2f64.powi(exp);
        let capped = scaled.min(self.config.backoff_max_ms as f64);
        capped.max(0.0) as u64
    }

    /// Inclusive millisecond range around `anchor`, never above the cap.
    fn jitter_window(&self, anchor: u64) -> (u64, u64) {
        let cap = self.config.backoff_max_ms;
        let ratio = f64::from(self.config.jitter_ratio.max(0.0));
        let half = ((anchor as f64 * ratio) as u64)
            .max(self.config.jitter_min_ms)
            .min(cap);
        let low = anchor.saturating_sub(half);
        let high = anchor.saturating_add(half).min(cap).max(low);
        (low, high)
    }
}

/// Folds the task id and attempt into 64 well-mixed bits.
fn jitter_seed(task_id: TaskID, attempt: u32) -> u64 {
    let id = task_id.0.as_u128();
    let folded = (id as u64) ^ ((id >> 64) as u64) ^ ((u64::from(attempt) << 48) | u64::from(attempt));

    // SplitMix64 finalizer
    let mut x = folded.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}
