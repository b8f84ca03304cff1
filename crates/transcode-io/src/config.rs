//! Process-wide transcode settings.
//!
//! Per-invocation options live in [`OutputParams`](crate::OutputParams);
//! this is what stays the same for every transcode the server starts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TranscodeError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodeConfig {
    /// Directory holding FIFO files
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,

    /// Refuse concurrent readers on one transcode
    #[serde(default)]
    pub block_multiple_connections: bool,

    /// With `block_multiple_connections`: keep the first reader and refuse
    /// new ones, instead of dropping old readers for the newcomer
    #[serde(default)]
    pub keep_first_connection: bool,

    /// Allow SCR/PTS/DTS rewriting for time-seek emulation
    #[serde(default = "default_true")]
    pub timestamp_patching: bool,

    /// Wake-up interval of blocked buffer reads/writes
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Poll rounds a read waits for data before giving up
    #[serde(default = "default_read_retries")]
    pub read_retries: u32,

    /// Grace period between the last reader leaving and the process stop
    #[serde(default = "default_cleanup_delay_ms")]
    pub cleanup_delay_ms: u64,

    #[serde(default = "default_usage_report_interval_ms")]
    pub usage_report_interval_ms: u64,

    /// Consecutive empty reads after which a byte stream gives up
    #[serde(default = "default_stream_idle_reads")]
    pub stream_idle_reads: u32,

    /// Registry timeout for launches that don't set one, 0 disables
    #[serde(default)]
    pub default_timeout_ms: u64,

    #[serde(default = "default_terminate_timeout_ms")]
    pub default_terminate_timeout_ms: u64,

    /// How long a finished process waits for its output consumers
    #[serde(default = "default_consumer_join_ms")]
    pub consumer_join_ms: u64,

    /// Kernel buffer of native named pipes
    #[serde(default = "default_pipe_buffer_size")]
    pub pipe_buffer_size: u32,
}

fn default_temp_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_true() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_read_retries() -> u32 {
    15
}

fn default_cleanup_delay_ms() -> u64 {
    2500
}

fn default_usage_report_interval_ms() -> u64 {
    2000
}

fn default_stream_idle_reads() -> u32 {
    4
}

fn default_terminate_timeout_ms() -> u64 {
    5000
}

fn default_consumer_join_ms() -> u64 {
    1000
}

fn default_pipe_buffer_size() -> u32 {
    500_000
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            temp_dir: default_temp_dir(),
            block_multiple_connections: false,
            keep_first_connection: false,
            timestamp_patching: default_true(),
            poll_interval_ms: default_poll_interval_ms(),
            read_retries: default_read_retries(),
            cleanup_delay_ms: default_cleanup_delay_ms(),
            usage_report_interval_ms: default_usage_report_interval_ms(),
            stream_idle_reads: default_stream_idle_reads(),
            default_timeout_ms: 0,
            default_terminate_timeout_ms: default_terminate_timeout_ms(),
            consumer_join_ms: default_consumer_join_ms(),
            pipe_buffer_size: default_pipe_buffer_size(),
        }
    }
}

impl TranscodeConfig {
    /// Load from a TOML file. Missing keys take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
            .map_err(|e| TranscodeError::config(format!("{}: {e}", path.display())))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| TranscodeError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(TranscodeError::config("poll_interval_ms must be positive"));
        }
        if self.pipe_buffer_size == 0 {
            return Err(TranscodeError::config("pipe_buffer_size must be positive"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.cleanup_delay_ms)
    }

    pub fn usage_report_interval(&self) -> Duration {
        Duration::from_millis(self.usage_report_interval_ms)
    }

    pub fn consumer_join(&self) -> Duration {
        Duration::from_millis(self.consumer_join_ms)
    }
}
