use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

/// Default on-disk budget for cached images (64 MB).
pub const DEFAULT_MAX_CACHE_BYTES: u64 = 64 * 1024 * 1024;

/// Largest single image that will be committed to the cache (8 MB).
pub const DEFAULT_MAX_ENTRY_BYTES: u64 = 8 * 1024 * 1024;

/// Number of downloads allowed to hold a connection at once.
pub const DEFAULT_MAX_CONCURRENCY: u32 = 4;

/// Retries after the first failed attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Base delay between attempts; attempt `n` waits `n + 1` times this.
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 500;

/// Period of the background maintenance pass.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// How long finished tasks stay visible in the task tree.
pub const DEFAULT_TASK_RETENTION_SECS: u64 = 30;

/// Bytes read from the front of a body for format sniffing.
pub const SNIFF_BYTES: usize = 16;

/// Title of the task group every image download is registered under.
pub const IMAGES_GROUP_TITLE: &str = "Images";

/// Top-level configuration for the image engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding cached images.
    pub cache_dir: String,
    /// Total bytes the cache may occupy before eviction kicks in.
    pub max_cache_bytes: u64,
    /// Images larger than this are streamed but never cached.
    pub max_entry_bytes: u64,
    /// Maximum number of concurrent downloads.
    pub max_concurrency: u32,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub connect_timeout_secs: u64,
    /// Whole-request timeout, zero disables it.
    pub request_timeout_secs: u64,
    pub user_agent: String,
    pub sweep_interval_secs: u64,
    pub task_retention_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_dir: String::new(),
            max_cache_bytes: DEFAULT_MAX_CACHE_BYTES,
            max_entry_bytes: DEFAULT_MAX_ENTRY_BYTES,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            connect_timeout_secs: 10,
            request_timeout_secs: 60,
            user_agent: format!("bb_image_engine/{}", env!("CARGO_PKG_VERSION")),
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            task_retention_secs: DEFAULT_TASK_RETENTION_SECS,
        }
    }
}

impl EngineConfig {
    /// Config with defaults rooted at `cache_dir`.
    pub fn with_cache_dir(cache_dir: impl Into<String>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            ..Self::default()
        }
    }

    /// Parse a TOML document; missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(text).context("invalid engine config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache_dir.trim().is_empty() {
            return Err(anyhow!("cache_dir must be set"));
        }
        if self.max_cache_bytes == 0 {
            return Err(anyhow!("max_cache_bytes must be > 0"));
        }
        if self.max_entry_bytes == 0 {
            return Err(anyhow!("max_entry_bytes must be > 0"));
        }
        if self.max_entry_bytes > self.max_cache_bytes {
            return Err(anyhow!(
                "max_entry_bytes {} exceeds max_cache_bytes {}",
                self.max_entry_bytes,
                self.max_cache_bytes
            ));
        }
        if self.max_concurrency == 0 {
            return Err(anyhow!("max_concurrency must be > 0"));
        }
        if self.sweep_interval_secs == 0 {
            return Err(anyhow!("sweep_interval_secs must be > 0"));
        }
        Ok(())
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn task_retention(&self) -> Duration {
        Duration::from_secs(self.task_retention_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toml_partial_uses_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            cache_dir = "/tmp/images"
            max_concurrency = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.cache_dir, "/tmp/images");
        assert_eq!(config.max_concurrency, 8);
        assert_eq!(config.max_cache_bytes, DEFAULT_MAX_CACHE_BYTES);
        assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(EngineConfig::default().validate().is_err());

        let mut config = EngineConfig::with_cache_dir("/tmp/images");
        assert!(config.validate().is_ok());

        config.max_entry_bytes = config.max_cache_bytes + 1;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::with_cache_dir("/tmp/images");
        config.max_concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_type_is_an_error() {
        assert!(EngineConfig::from_toml_str("cache_dir = 5").is_err());
    }
}
