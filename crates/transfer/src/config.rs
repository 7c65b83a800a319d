use std::time::Duration;

use serde::{Deserialize, Serialize};

use ferry_protocol::constants::{
    CHECKPOINT_FILE_NAME, CONNECT_TIMEOUT, DOWNLOAD_ATTEMPTS, RETRY_INTERVAL,
};

/// Tunables shared by every transfer of a registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Total attempts a download makes before giving up.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Delay between two download attempts, in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Connect timeout for every request, in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Upper bound on transfers moving data at the same time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_tasks: Option<usize>,

    /// File name of the checkpoint document inside each data directory.
    #[serde(default = "default_checkpoint_file")]
    pub checkpoint_file: String,
}

fn default_retry_attempts() -> u32 {
    DOWNLOAD_ATTEMPTS
}

fn default_retry_delay_ms() -> u64 {
    RETRY_INTERVAL.as_millis() as u64
}

fn default_connect_timeout_ms() -> u64 {
    CONNECT_TIMEOUT.as_millis() as u64
}

fn default_checkpoint_file() -> String {
    CHECKPOINT_FILE_NAME.to_string()
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_concurrent_tasks: None,
            checkpoint_file: default_checkpoint_file(),
        }
    }
}

impl TransferConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Attempts per download, never less than one.
    pub fn attempts(&self) -> u32 {
        self.retry_attempts.max(1)
    }
}
