//! Application configuration loaded from the environment.
//!
//! Every setting has a default except the bot token. Values are validated
//! once at startup; invalid values fail with [`Error::Configuration`].

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::admission::RateLimiterConfig;
use crate::pipeline::{JobQueueConfig, WorkerPoolConfig};
use crate::policy::{ChannelLimits, RiskPolicy};
use crate::{Error, Result};

/// Telegram Bot API settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    #[serde(skip_serializing)]
    pub bot_token: String,
    pub api_base_url: String,
    pub request_timeout_secs: u64,
    pub upload_timeout_secs: u64,
    /// Long-poll timeout for `getUpdates`.
    pub poll_timeout_secs: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            api_base_url: "https://api.telegram.org".to_string(),
            request_timeout_secs: 30,
            upload_timeout_secs: 600,
            poll_timeout_secs: 30,
        }
    }
}

/// Queue and worker pool sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub capacity: usize,
    pub workers: usize,
    pub shutdown_grace_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 20,
            workers: 2,
            shutdown_grace_secs: 15,
        }
    }
}

impl QueueConfig {
    pub fn job_queue(&self) -> JobQueueConfig {
        JobQueueConfig {
            capacity: self.capacity,
        }
    }

    pub fn worker_pool(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            workers: self.workers,
            shutdown_grace_secs: self.shutdown_grace_secs,
        }
    }
}

/// Per-user admission limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub rate_limit_per_user: usize,
    pub rate_limit_window_secs: u64,
    pub max_active_jobs_per_user: usize,
    /// Zero disables session expiry.
    pub session_ttl_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            rate_limit_per_user: 6,
            rate_limit_window_secs: 10,
            max_active_jobs_per_user: 1,
            session_ttl_secs: 900,
        }
    }
}

impl LimitsConfig {
    pub fn rate_limiter(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            limit: self.rate_limit_per_user,
            window: Duration::from_secs(self.rate_limit_window_secs),
        }
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

/// Channel size thresholds in MiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelLimitsConfig {
    pub hard_mib: u64,
    pub safe_mib: u64,
    pub risky_mib: u64,
    pub document_only_mib: u64,
}

impl Default for ChannelLimitsConfig {
    fn default() -> Self {
        Self {
            hard_mib: 2000,
            safe_mib: 900,
            risky_mib: 1500,
            document_only_mib: 300,
        }
    }
}

impl ChannelLimitsConfig {
    pub fn to_limits(&self) -> ChannelLimits {
        ChannelLimits::from_mib(self.hard_mib, self.safe_mib, self.risky_mib, self.document_only_mib)
    }
}

/// External tool locations and per-stage timeouts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ytdlp_path: PathBuf,
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    pub extract_timeout_secs: u64,
    pub socket_timeout_secs: u64,
    /// Zero means no overall download deadline.
    pub download_timeout_secs: u64,
    pub download_retries: u32,
    pub merge_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    /// Time between the terminate signal and the kill.
    pub terminate_grace_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ytdlp_path: PathBuf::from("yt-dlp"),
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            extract_timeout_secs: 30,
            socket_timeout_secs: 30,
            download_timeout_secs: 0,
            download_retries: 3,
            merge_timeout_secs: 900,
            probe_timeout_secs: 20,
            terminate_grace_secs: 5,
        }
    }
}

impl ToolsConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_secs)
    }
}

/// Status message pacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    pub min_edit_interval_ms: u64,
    pub loop_interval_ms: u64,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            min_edit_interval_ms: 1000,
            loop_interval_ms: 1500,
        }
    }
}

impl StatusConfig {
    pub fn min_edit_interval(&self) -> Duration {
        Duration::from_millis(self.min_edit_interval_ms)
    }

    pub fn loop_interval(&self) -> Duration {
        Duration::from_millis(self.loop_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub telegram: TelegramConfig,
    pub queue: QueueConfig,
    pub limits: LimitsConfig,
    pub channel: ChannelLimitsConfig,
    pub risk: RiskPolicy,
    pub tools: ToolsConfig,
    pub status: StatusConfig,
    pub temp_root: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub log_filter: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            telegram: TelegramConfig::default(),
            queue: QueueConfig::default(),
            limits: LimitsConfig::default(),
            channel: ChannelLimitsConfig::default(),
            risk: RiskPolicy::default(),
            tools: ToolsConfig::default(),
            status: StatusConfig::default(),
            temp_root: PathBuf::from("./.tmp"),
            log_dir: None,
            log_filter: None,
        }
    }
}

impl AppConfig {
    /// Load from the process environment, reading `.env` first if present.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Re-read `.env` over the current environment and return the log
    /// filter it now selects.
    pub fn reload_log_filter() -> Option<String> {
        if let Err(e) = dotenvy::dotenv_override() {
            tracing::debug!(error = %e, "No .env file to reload");
        }
        Self::log_filter_from_lookup(|name| std::env::var(name).ok())
    }

    /// `LOG_FILTER`, or `LOG_LEVEL` applied to this crate's targets.
    pub fn log_filter_from_lookup<F>(lookup: F) -> Option<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        Env(lookup).log_filter()
    }

    /// Load from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);
        let defaults = Self::default();

        let telegram = TelegramConfig {
            bot_token: env.string("BOT_TOKEN").unwrap_or_default(),
            api_base_url: env
                .string("TELEGRAM_API_URL")
                .unwrap_or(defaults.telegram.api_base_url),
            request_timeout_secs: env.parse("TELEGRAM_REQUEST_TIMEOUT_SEC", defaults.telegram.request_timeout_secs)?,
            upload_timeout_secs: env.parse("TELEGRAM_UPLOAD_TIMEOUT_SEC", defaults.telegram.upload_timeout_secs)?,
            poll_timeout_secs: env.parse("TELEGRAM_POLL_TIMEOUT_SEC", defaults.telegram.poll_timeout_secs)?,
        };
        let queue = QueueConfig {
            capacity: env.parse("QUEUE_MAXSIZE", defaults.queue.capacity)?,
            workers: env.parse("MAX_PARALLEL_DOWNLOADS", defaults.queue.workers)?,
            shutdown_grace_secs: env.parse("SHUTDOWN_GRACE_SEC", defaults.queue.shutdown_grace_secs)?,
        };
        let limits = LimitsConfig {
            rate_limit_per_user: env.parse("RATE_LIMIT_PER_USER", defaults.limits.rate_limit_per_user)?,
            rate_limit_window_secs: env.parse("RATE_LIMIT_WINDOW_SEC", defaults.limits.rate_limit_window_secs)?,
            max_active_jobs_per_user: env.parse(
                "MAX_ACTIVE_JOBS_PER_USER",
                defaults.limits.max_active_jobs_per_user,
            )?,
            session_ttl_secs: env.parse("SESSION_TTL_SEC", defaults.limits.session_ttl_secs)?,
        };
        let channel = ChannelLimitsConfig {
            hard_mib: env.parse("TG_HARD_LIMIT_MB", defaults.channel.hard_mib)?,
            safe_mib: env.parse("TG_SAFE_LIMIT_MB", defaults.channel.safe_mib)?,
            risky_mib: env.parse("TG_RISKY_LIMIT_MB", defaults.channel.risky_mib)?,
            document_only_mib: env.parse("TG_DOCUMENT_ONLY_FROM_MB", defaults.channel.document_only_mib)?,
        };
        let risk = RiskPolicy {
            mux_overhead_factor: env.parse("MUX_OVERHEAD_FACTOR", defaults.risk.mux_overhead_factor)?,
            ..defaults.risk
        };
        let tools = ToolsConfig {
            ytdlp_path: env.string("YTDLP_PATH").map(PathBuf::from).unwrap_or(defaults.tools.ytdlp_path),
            ffmpeg_path: env.string("FFMPEG_PATH").map(PathBuf::from).unwrap_or(defaults.tools.ffmpeg_path),
            ffprobe_path: env
                .string("FFPROBE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.tools.ffprobe_path),
            extract_timeout_secs: env.parse("EXTRACT_TIMEOUT_SEC", defaults.tools.extract_timeout_secs)?,
            socket_timeout_secs: env.parse("SOCKET_TIMEOUT_SEC", defaults.tools.socket_timeout_secs)?,
            download_timeout_secs: env.parse("DOWNLOAD_TIMEOUT_SEC", defaults.tools.download_timeout_secs)?,
            download_retries: env.parse("DOWNLOAD_RETRIES", defaults.tools.download_retries)?,
            merge_timeout_secs: env.parse("MERGE_TIMEOUT_SEC", defaults.tools.merge_timeout_secs)?,
            probe_timeout_secs: env.parse("PROBE_TIMEOUT_SEC", defaults.tools.probe_timeout_secs)?,
            terminate_grace_secs: env.parse("TERMINATE_GRACE_SEC", defaults.tools.terminate_grace_secs)?,
        };
        let status = StatusConfig {
            min_edit_interval_ms: env.parse("STATUS_MIN_EDIT_INTERVAL_MS", defaults.status.min_edit_interval_ms)?,
            loop_interval_ms: env.parse("STATUS_LOOP_INTERVAL_MS", defaults.status.loop_interval_ms)?,
        };
        let log_filter = env.log_filter();

        let config = Self {
            telegram,
            queue,
            limits,
            channel,
            risk,
            tools,
            status,
            temp_root: env.string("TEMP_ROOT").map(PathBuf::from).unwrap_or(defaults.temp_root),
            log_dir: env.string("LOG_DIR").map(PathBuf::from),
            log_filter,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.telegram.bot_token.trim().is_empty() {
            return Err(Error::config("BOT_TOKEN is required"));
        }
        if self.telegram.request_timeout_secs == 0 || self.telegram.upload_timeout_secs == 0 {
            return Err(Error::config("telegram timeouts must be positive"));
        }
        if self.queue.capacity == 0 {
            return Err(Error::config("queue capacity must be positive"));
        }
        if self.queue.workers == 0 {
            return Err(Error::config("at least one worker is required"));
        }
        if self.limits.rate_limit_per_user == 0 || self.limits.rate_limit_window_secs == 0 {
            return Err(Error::config("rate limit and window must be positive"));
        }
        if self.limits.max_active_jobs_per_user == 0 {
            return Err(Error::config("per-user active job cap must be positive"));
        }
        self.channel.to_limits().validate()?;
        self.risk.validate()?;
        if self.tools.extract_timeout_secs == 0
            || self.tools.merge_timeout_secs == 0
            || self.tools.probe_timeout_secs == 0
        {
            return Err(Error::config("tool timeouts must be positive"));
        }
        if self.temp_root.as_os_str().is_empty() {
            return Err(Error::config("temp root must not be empty"));
        }
        Ok(())
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Trimmed value; blank counts as unset.
    fn string(&self, name: &str) -> Option<String> {
        (self.0)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn log_filter(&self) -> Option<String> {
        self.string("LOG_FILTER").or_else(|| {
            self.string("LOG_LEVEL").map(|level| {
                let level = level.to_ascii_lowercase();
                format!("media_courier={level},process_utils={level}")
            })
        })
    }

    fn parse<T>(&self, name: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(name) {
            Some(raw) => raw
                .parse()
                .map_err(|e| Error::config(format!("invalid value for {name}: {raw:?} ({e})"))),
            None => Ok(default),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<AppConfig> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn test_defaults_with_token() {
        let config = load(&[("BOT_TOKEN", "123:abc")]).unwrap();
        assert_eq!(config.telegram.bot_token, "123:abc");
        assert_eq!(config.queue.capacity, 20);
        assert_eq!(config.queue.workers, 2);
        assert_eq!(config.limits.rate_limit_per_user, 6);
        assert_eq!(config.channel.to_limits(), ChannelLimits::default());
        assert_eq!(config.tools.merge_timeout_secs, 900);
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn test_missing_token_rejected() {
        assert!(matches!(load(&[]), Err(Error::Configuration(_))));
        assert!(load(&[("BOT_TOKEN", "   ")]).is_err());
    }

    #[test]
    fn test_overrides_and_log_level() {
        let config = load(&[
            ("BOT_TOKEN", "t"),
            ("QUEUE_MAXSIZE", "5"),
            ("TG_SAFE_LIMIT_MB", "800"),
            ("FFMPEG_PATH", "/opt/ffmpeg"),
            ("LOG_LEVEL", "DEBUG"),
            ("LOG_DIR", "/var/log/courier"),
        ])
        .unwrap();
        assert_eq!(config.queue.capacity, 5);
        assert_eq!(config.channel.safe_mib, 800);
        assert_eq!(config.tools.ffmpeg_path, PathBuf::from("/opt/ffmpeg"));
        assert_eq!(
            config.log_filter.as_deref(),
            Some("media_courier=debug,process_utils=debug")
        );
        assert_eq!(config.log_dir, Some(PathBuf::from("/var/log/courier")));
    }

    #[test]
    fn test_log_filter_lookup() {
        let vars: HashMap<&str, &str> =
            [("LOG_LEVEL", "WARN")].into_iter().collect();
        assert_eq!(
            AppConfig::log_filter_from_lookup(|k| vars.get(k).map(|v| v.to_string())).as_deref(),
            Some("media_courier=warn,process_utils=warn")
        );

        let vars: HashMap<&str, &str> = [("LOG_FILTER", "media_courier=trace"), ("LOG_LEVEL", "warn")]
            .into_iter()
            .collect();
        assert_eq!(
            AppConfig::log_filter_from_lookup(|k| vars.get(k).map(|v| v.to_string())).as_deref(),
            Some("media_courier=trace")
        );
        assert_eq!(AppConfig::log_filter_from_lookup(|_| None), None);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(load(&[("BOT_TOKEN", "t"), ("QUEUE_MAXSIZE", "lots")]).is_err());
        assert!(load(&[("BOT_TOKEN", "t"), ("QUEUE_MAXSIZE", "0")]).is_err());
        assert!(load(&[("BOT_TOKEN", "t"), ("TG_SAFE_LIMIT_MB", "5000")]).is_err());
        assert!(load(&[("BOT_TOKEN", "t"), ("MAX_PARALLEL_DOWNLOADS", "0")]).is_err());
    }
}
