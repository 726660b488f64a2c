use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::FailurePolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Size of the page worker pool shared by every job.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "default_max_remote_bytes")]
    pub max_remote_bytes: u64,
    #[serde(default = "default_max_archive_pages")]
    pub max_archive_pages: usize,
    /// Cap on the page bytes one source may expand to, across all its files.
    #[serde(default = "default_max_expanded_bytes")]
    pub max_expanded_bytes: u64,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_ocr_timeout_secs")]
    pub ocr_timeout_secs: u64,
    #[serde(default = "default_translate_timeout_secs")]
    pub translate_timeout_secs: u64,
    #[serde(default = "default_compose_timeout_secs")]
    pub compose_timeout_secs: u64,
    /// Attempts per external call, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Coordinator-level requeues of a page or acquisition after a storage fault.
    #[serde(default = "default_storage_retry_attempts")]
    pub storage_retry_attempts: u32,
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,
    #[serde(default)]
    pub ocr: Option<CapabilityEndpoint>,
    #[serde(default)]
    pub translation: Option<CapabilityEndpoint>,
    #[serde(default)]
    pub fonts_dir: Option<PathBuf>,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

/// An HTTP endpoint implementing the OCR or translation capability.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapabilityEndpoint {
    pub url: String,
    /// Name of the environment variable holding a bearer token.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8388
}

fn default_max_workers() -> usize {
    4
}

fn default_max_file_bytes() -> u64 {
    52_428_800 // 50MB
}

fn default_max_remote_bytes() -> u64 {
    209_715_200 // 200MB
}

fn default_max_archive_pages() -> usize {
    500
}

fn default_max_expanded_bytes() -> u64 {
    524_288_000 // 500MB
}

fn default_fetch_timeout_secs() -> u64 {
    60
}

fn default_ocr_timeout_secs() -> u64 {
    60
}

fn default_translate_timeout_secs() -> u64 {
    30
}

fn default_compose_timeout_secs() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    10_000
}

fn default_storage_retry_attempts() -> u32 {
    2
}

fn default_broadcast_capacity() -> usize {
    4096
}

fn default_max_request_bytes() -> usize {
    268_435_456 // 256MB
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            data_dir: None,
            max_workers: default_max_workers(),
            max_file_bytes: default_max_file_bytes(),
            max_remote_bytes: default_max_remote_bytes(),
            max_archive_pages: default_max_archive_pages(),
            max_expanded_bytes: default_max_expanded_bytes(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            ocr_timeout_secs: default_ocr_timeout_secs(),
            translate_timeout_secs: default_translate_timeout_secs(),
            compose_timeout_secs: default_compose_timeout_secs(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            storage_retry_attempts: default_storage_retry_attempts(),
            fail_fast: false,
            broadcast_capacity: default_broadcast_capacity(),
            max_request_bytes: default_max_request_bytes(),
            ocr: None,
            translation: None,
            fonts_dir: None,
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl PipelineConfig {
    pub fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::from_fail_fast(self.fail_fast)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn ocr_timeout(&self) -> Duration {
        Duration::from_secs(self.ocr_timeout_secs)
    }

    pub fn translate_timeout(&self) -> Duration {
        Duration::from_secs(self.translate_timeout_secs)
    }

    pub fn compose_timeout(&self) -> Duration {
        Duration::from_secs(self.compose_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
