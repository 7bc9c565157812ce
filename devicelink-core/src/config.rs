//! Runtime configuration, loadable from a TOML file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{LinkError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Base URL of the account-management endpoint.
    pub service_url: String,
    pub user_agent: String,
    pub database_path: PathBuf,
    /// Directory for temporary attachment downloads.
    pub cache_dir: PathBuf,
    pub device_name_prefix: String,
    pub prekey_batch_size: u32,
    pub job_workers: usize,
    pub job_idle_poll_ms: u64,
    pub retry_backoff_base_secs: u64,
    pub retry_backoff_max_secs: u64,
    pub attachment_size_limit: u64,
    pub request_timeout_secs: u64,
    /// Timeout for the link-completion call, which waits on the primary device.
    pub link_timeout_secs: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            service_url: "https://chat.example.org".to_string(),
            user_agent: concat!("devicelink/", env!("CARGO_PKG_VERSION")).to_string(),
            database_path: crate::platform::get_default_database_path(),
            cache_dir: crate::platform::get_cache_dir(),
            device_name_prefix: "devicelink".to_string(),
            prekey_batch_size: 100,
            job_workers: 4,
            job_idle_poll_ms: 1_000,
            retry_backoff_base_secs: 5,
            retry_backoff_max_secs: 300,
            attachment_size_limit: u32::MAX as u64,
            request_timeout_secs: 30,
            link_timeout_secs: 600,
        }
    }
}

impl LinkConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| LinkError::InvalidInput(format!("Invalid config: {}", e)))
    }

    /// Delay before the next attempt after `attempt` failed attempts.
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let secs = self
            .retry_backoff_base_secs
            .saturating_mul(2u64.saturating_pow(exp));
        Duration::from_secs(secs.min(self.retry_backoff_max_secs))
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.job_idle_poll_ms.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn link_timeout(&self) -> Duration {
        Duration::from_secs(self.link_timeout_secs)
    }
}
