// Environment-backed configuration for both binaries
// Every numeric option carries a validated range; out-of-range values fail startup.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default maximum upload payload (10 MiB).
pub const DEFAULT_MAX_UPLOAD_SIZE_BYTES: u64 = 10 * 1024 * 1024;

/// Configuration for the ingest service.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub database_url: String,
    pub audio_storage_dir: PathBuf,
    pub max_upload_size_bytes: u64,
    pub admin_token: String,
    pub internal_token: String,
    pub host: String,
    pub port: u16,
}

impl IngestConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: require_var("DATABASE_URL")?,
            audio_storage_dir: PathBuf::from(require_var("AUDIO_STORAGE_DIR")?),
            max_upload_size_bytes: parse_var(
                "MAX_UPLOAD_SIZE_BYTES",
                DEFAULT_MAX_UPLOAD_SIZE_BYTES,
                1024,
                1024 * 1024 * 1024,
            )?,
            admin_token: require_var("ADMIN_TOKEN")?,
            internal_token: require_var("INTERNAL_TOKEN")?,
            host: optional_var("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_var("PORT", 8080u16, 1, 65535)?,
        })
    }
}

/// Configuration for the VAD/dialogue worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub audio_storage_dir: PathBuf,
    pub vad_aggressiveness: u8,
    pub vad_frame_ms: u32,
    pub silence_gap_sec: u64,
    pub max_dialogue_sec: u64,
    pub poll_interval_sec: u64,
    pub batch_size: u32,
    pub max_retries: u32,
    pub retry_delay_sec: u64,
    pub stuck_timeout_sec: u64,
    pub recovery_interval_sec: u64,
    pub metrics_log_interval_sec: u64,
    pub dialogue_idle_close_sec: u64,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        let config = Self {
            database_url: require_var("DATABASE_URL")?,
            audio_storage_dir: PathBuf::from(require_var("AUDIO_STORAGE_DIR")?),
            vad_aggressiveness: parse_var("VAD_AGGRESSIVENESS", 2u8, 0, 3)?,
            vad_frame_ms: parse_var("VAD_FRAME_MS", 30u32, 10, 30)?,
            silence_gap_sec: parse_var("SILENCE_GAP_SEC", 12u64, 1, 3600)?,
            max_dialogue_sec: parse_var("MAX_DIALOGUE_SEC", 120u64, 1, 86_400)?,
            poll_interval_sec: parse_var("POLL_INTERVAL_SEC", 5u64, 1, 300)?,
            batch_size: parse_var("BATCH_SIZE", 10u32, 1, 100)?,
            max_retries: parse_var("MAX_RETRIES", 3u32, 0, 100)?,
            retry_delay_sec: parse_var("RETRY_DELAY_SEC", 2u64, 1, 600)?,
            stuck_timeout_sec: parse_var("STUCK_TIMEOUT_SEC", 600u64, 30, 86_400)?,
            recovery_interval_sec: parse_var("RECOVERY_INTERVAL_SEC", 60u64, 5, 3600)?,
            metrics_log_interval_sec: parse_var("METRICS_LOG_INTERVAL_SEC", 60u64, 5, 3600)?,
            dialogue_idle_close_sec: parse_var("DIALOGUE_IDLE_CLOSE_SEC", 3600u64, 60, 604_800)?,
        };

        if !matches!(config.vad_frame_ms, 10 | 20 | 30) {
            bail!(
                "VAD_FRAME_MS must be 10, 20 or 30 (got {})",
                config.vad_frame_ms
            );
        }

        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_sec)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_interval_sec)
    }

    pub fn metrics_log_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_log_interval_sec)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_sec)
    }
}

fn require_var(name: &str) -> Result<String> {
    let value = std::env::var(name).with_context(|| format!("{} is not set", name))?;
    if value.trim().is_empty() {
        bail!("{} is set but empty", name);
    }
    Ok(value)
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Parse an env var into a number, falling back to `default` when unset
/// and rejecting values outside `[min, max]`.
fn parse_var<T>(name: &str, default: T, min: T, max: T) -> Result<T>
where
    T: FromStr + PartialOrd + Copy + std::fmt::Display,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let value = match optional_var(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("{} is not a valid number: {:?}", name, raw))?,
        None => default,
    };

    if value < min || value > max {
        bail!("{} must be within [{}, {}] (got {})", name, min, max, value);
    }

    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests mutate process state; keep each var name unique per test.

    #[test]
    fn parse_var_uses_default_when_unset() {
        std::env::remove_var("SC_TEST_UNSET");
        let value: u64 = parse_var("SC_TEST_UNSET", 5, 1, 300).unwrap();
        assert_eq!(value, 5);
    }

    #[test]
    fn parse_var_reads_env() {
        std::env::set_var("SC_TEST_READS", "42");
        let value: u64 = parse_var("SC_TEST_READS", 5, 1, 300).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn parse_var_rejects_out_of_range() {
        std::env::set_var("SC_TEST_RANGE", "301");
        let result: Result<u64> = parse_var("SC_TEST_RANGE", 5, 1, 300);
        assert!(result.is_err());
    }

    #[test]
    fn parse_var_rejects_garbage() {
        std::env::set_var("SC_TEST_GARBAGE", "not-a-number");
        let result: Result<u64> = parse_var("SC_TEST_GARBAGE", 5, 1, 300);
        assert!(result.is_err());
    }

    #[test]
    fn require_var_rejects_empty() {
        std::env::set_var("SC_TEST_EMPTY", "  ");
        assert!(require_var("SC_TEST_EMPTY").is_err());
    }
}
