use anyhow::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Worker configuration, loaded from a TOML file. Every field has a default
/// so a missing file or a partial file both work.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RunnerConfig {
    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub runner: JobRunnerConfig,

    #[serde(default)]
    pub push: PushConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Parent directory of per-task build directories.
    #[serde(default = "default_build_dir")]
    pub build_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobRunnerConfig {
    /// Ceiling on persisted job output, in bytes. Output past this is dropped.
    #[serde(default = "default_max_job_output")]
    pub max_job_output: usize,

    /// Delay before a pending output buffer is flushed to storage.
    #[serde(default = "default_output_flush_secs")]
    pub output_flush_secs: u64,

    /// Interval of access-token refresh events for runs that carry one.
    #[serde(default = "default_token_refresh_secs")]
    pub token_refresh_secs: u64,

    /// Record a one-time notice when a run hits the output ceiling.
    #[serde(default = "default_true")]
    pub print_limit_reached_message: bool,

    /// Command that creates a virtualenv, e.g. "python3 -m venv".
    #[serde(default = "default_venv_cmd")]
    pub venv_cmd: String,

    /// Local wheel/sdist directory the support package is installed from.
    /// When unset, jobs run without the support library preinstalled.
    #[serde(default)]
    pub support_package_dir: Option<PathBuf>,

    #[serde(default = "default_support_package")]
    pub support_package: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushConfig {
    /// Base URL of the orchestrator's push endpoints.
    #[serde(default = "default_push_base")]
    pub base_url: String,

    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,

    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8480
}
fn default_db_path() -> PathBuf {
    PathBuf::from("remora.sqlite")
}
fn default_build_dir() -> PathBuf {
    PathBuf::from("build")
}
fn default_max_job_output() -> usize {
    1_000_000
}
fn default_output_flush_secs() -> u64 {
    1
}
fn default_token_refresh_secs() -> u64 {
    30
}
fn default_true() -> bool {
    true
}
fn default_venv_cmd() -> String {
    "python3 -m venv".to_string()
}
fn default_support_package() -> String {
    "remora".to_string()
}
fn default_push_base() -> String {
    "http://127.0.0.1:8080/rest/remote".to_string()
}
fn default_max_retry_count() -> u32 {
    4
}
fn default_retry_interval_secs() -> u64 {
    5
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db_path: default_db_path(),
            build_dir: default_build_dir(),
        }
    }
}

impl Default for JobRunnerConfig {
    fn default() -> Self {
        Self {
            max_job_output: default_max_job_output(),
            output_flush_secs: default_output_flush_secs(),
            token_refresh_secs: default_token_refresh_secs(),
            print_limit_reached_message: default_true(),
            venv_cmd: default_venv_cmd(),
            support_package_dir: None,
            support_package: default_support_package(),
        }
    }
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            base_url: default_push_base(),
            max_retry_count: default_max_retry_count(),
            retry_interval_secs: default_retry_interval_secs(),
        }
    }
}

impl RunnerConfig {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("No config file at {}, using defaults.", path.display());
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path).await?;
        Ok(toml::from_str(&content)?)
    }
}

/// Config file location: `REMORA_CONFIG` when set, `remora.toml` otherwise.
pub fn config_path() -> PathBuf {
    std::env::var_os("REMORA_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("remora.toml"))
}
