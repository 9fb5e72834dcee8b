use serde::Deserialize;
use std::time::Duration;

/// Pipeline configuration.
///
/// Everything is passed in explicitly at construction time; nothing reads
/// ambient global state. Defaults mirror the reference deployment: three
/// workers, five submissions per second, three attempts with a 3s
/// exponential backoff.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AnchorConfig {
    /// Number of concurrent anchor workers.
    pub workers: usize,
    pub rate: RateLimitConfig,
    pub retry: RetryConfig,
    /// Bounded wait for ledger confirmation, in milliseconds.
    pub submit_timeout_ms: u64,
    /// Target ledger/network identifier recorded on each anchor.
    pub network: String,
    /// Age after which a PENDING anchor record is considered abandoned
    /// and eligible for the recovery sweep.
    pub stale_after_secs: u64,
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            rate: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            submit_timeout_ms: 30_000,
            network: "devnet".to_string(),
            stale_after_secs: 600,
        }
    }
}

impl AnchorConfig {
    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

/// Caps job starts per fixed time window, independent of pool size.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RateLimitConfig {
    pub max_starts: u32,
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_starts: 5,
            window_ms: 1_000,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryConfig {
    /// Total attempts per payment, including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 3_000,
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Backoff before the attempt following `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        Duration::from_millis((self.base_delay_ms as f64 * factor) as u64)
    }
}
