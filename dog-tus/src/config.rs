use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dog_blob::RetryParams;
use dog_core::DogConfigSnapshot;

/// Bytes buffered before a multipart part is emitted
pub const DEFAULT_BUFFER_SIZE: usize = 5 * 1024 * 1024;

/// Largest object a single upload may produce
pub const DEFAULT_MAX_UPLOAD_LENGTH: u64 = 1024 * 1024 * 1024;

/// Idle time after which an unfinished upload is discarded
pub const DEFAULT_EXPIRATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Tuning for the upload engine
#[derive(Debug, Clone)]
pub struct TusConfig {
    pub buffer_size: usize,
    pub max_upload_length: u64,
    pub expiration: Duration,
    pub retry: RetryParams,
    /// Prefix for the per-session spill object
    pub spill_prefix: String,
    pub reaper_interval: Duration,
}

impl Default for TusConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_upload_length: DEFAULT_MAX_UPLOAD_LENGTH,
            expiration: DEFAULT_EXPIRATION,
            retry: RetryParams::default(),
            spill_prefix: "temporary/".to_string(),
            reaper_interval: Duration::from_secs(60),
        }
    }
}

impl TusConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overlay values from a config snapshot. Keys:
    /// `buffer_size`, `max_upload_length`, `expiration_secs`,
    /// `retry.max_retries`, `retry.base_delay_ms`, `spill_prefix`,
    /// `reaper_interval_secs`. Missing or unparseable keys keep defaults.
    pub fn from_config(config: &DogConfigSnapshot) -> Self {
        let defaults = Self::default();
        let retry = RetryParams::new(
            config
                .get_u64("retry.max_retries")
                .map(|n| n.min(u32::MAX as u64) as u32)
                .unwrap_or(defaults.retry.max_retries),
            config
                .get_millis("retry.base_delay_ms")
                .unwrap_or(defaults.retry.base_delay),
        );

        Self {
            buffer_size: config.get_usize("buffer_size").unwrap_or(defaults.buffer_size).max(1),
            max_upload_length: config
                .get_u64("max_upload_length")
                .unwrap_or(defaults.max_upload_length),
            expiration: config.get_secs("expiration_secs").unwrap_or(defaults.expiration),
            retry,
            spill_prefix: config.get_string("spill_prefix").unwrap_or(defaults.spill_prefix),
            reaper_interval: config
                .get_secs("reaper_interval_secs")
                .unwrap_or(defaults.reaper_interval),
        }
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    pub fn with_max_upload_length(mut self, max_upload_length: u64) -> Self {
        self.max_upload_length = max_upload_length;
        self
    }

    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = expiration;
        self
    }

    pub fn with_retry(mut self, retry: RetryParams) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_spill_prefix(mut self, spill_prefix: impl Into<String>) -> Self {
        self.spill_prefix = spill_prefix.into();
        self
    }

    pub fn with_reaper_interval(mut self, reaper_interval: Duration) -> Self {
        self.reaper_interval = reaper_interval;
        self
    }

    /// Deadline for a session touched at `now`.
    pub fn expires_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let ttl = TimeDelta::from_std(self.expiration).unwrap_or(TimeDelta::MAX);
        now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dog_core::DogConfig;

    #[test]
    fn defaults_match_documented_values() {
        let config = TusConfig::default();
        assert_eq!(config.buffer_size, 5 * 1024 * 1024);
        assert_eq!(config.max_upload_length, 1 << 30);
        assert_eq!(config.expiration, Duration::from_secs(86_400));
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.base_delay, Duration::from_millis(100));
    }

    #[test]
    fn snapshot_overrides_defaults() {
        let mut raw = DogConfig::new();
        raw.set("buffer_size", "1024");
        raw.set("retry.max_retries", "2");
        raw.set("retry.base_delay_ms", "10");
        raw.set("expiration_secs", "oops");

        let config = TusConfig::from_config(&raw.snapshot());
        assert_eq!(config.buffer_size, 1024);
        assert_eq!(config.retry, RetryParams::new(2, Duration::from_millis(10)));
        assert_eq!(config.expiration, DEFAULT_EXPIRATION);
    }

    #[test]
    fn expiry_is_relative_to_now() {
        let config = TusConfig::default().with_expiration(Duration::from_secs(60));
        let now = Utc::now();
        assert_eq!(config.expires_from(now) - now, TimeDelta::seconds(60));
    }
}
