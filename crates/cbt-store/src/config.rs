//! Engine configuration and store factory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use cbt_core::timer::TimerPolicy;
use cbt_core::traits::{LocalStore, RemoteStore};

use crate::file_local::FileLocalStore;
use crate::file_remote::FileRemoteStore;
use crate::rest::{RestRemoteStore, DEFAULT_RESULTS_TABLE, DEFAULT_SESSIONS_TABLE};

/// Where sessions and results are mirrored.
///
/// Note: Custom Debug impl masks API keys to prevent accidental exposure in logs.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RemoteConfig {
    Rest {
        base_url: String,
        api_key: String,
        #[serde(default = "default_sessions_table")]
        sessions_table: String,
        #[serde(default = "default_results_table")]
        results_table: String,
    },
    File {
        dir: PathBuf,
    },
}

impl std::fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteConfig::Rest {
                base_url,
                api_key: _,
                sessions_table,
                results_table,
            } => f
                .debug_struct("Rest")
                .field("base_url", base_url)
                .field("api_key", &"***")
                .field("sessions_table", sessions_table)
                .field("results_table", results_table)
                .finish(),
            RemoteConfig::File { dir } => f.debug_struct("File").field("dir", dir).finish(),
        }
    }
}

fn default_sessions_table() -> String {
    DEFAULT_SESSIONS_TABLE.to_string()
}
fn default_results_table() -> String {
    DEFAULT_RESULTS_TABLE.to_string()
}

/// Countdown tunables, see [`TimerPolicy`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimerConfig {
    #[serde(default = "default_anomaly_threshold")]
    pub anomaly_threshold_secs: u64,
    #[serde(default = "default_anomaly_deduction")]
    pub anomaly_deduction_secs: u64,
    #[serde(default = "default_low_time_warning")]
    pub low_time_warning_secs: u64,
    /// How often the interactive runner ticks.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
}

fn default_anomaly_threshold() -> u64 {
    TimerPolicy::default().anomaly_threshold_secs
}
fn default_anomaly_deduction() -> u64 {
    TimerPolicy::default().anomaly_deduction_secs
}
fn default_low_time_warning() -> u64 {
    TimerPolicy::default().low_time_warning_secs
}
fn default_tick_interval() -> u64 {
    1000
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            anomaly_threshold_secs: default_anomaly_threshold(),
            anomaly_deduction_secs: default_anomaly_deduction(),
            low_time_warning_secs: default_low_time_warning(),
            tick_interval_ms: default_tick_interval(),
        }
    }
}

impl TimerConfig {
    pub fn policy(&self) -> TimerPolicy {
        TimerPolicy {
            anomaly_threshold_secs: self.anomaly_threshold_secs,
            anomaly_deduction_secs: self.anomaly_deduction_secs,
            low_time_warning_secs: self.low_time_warning_secs,
        }
    }
}

/// Top-level cbt configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CbtConfig {
    /// Identity the attempt is stored under.
    #[serde(default = "default_user_id")]
    pub user_id: String,
    /// Directory searched for package files.
    #[serde(default = "default_packages_dir")]
    pub packages_dir: PathBuf,
    /// Directory of the device-local store.
    #[serde(default = "default_local_dir")]
    pub local_dir: PathBuf,
    /// Remote mirror; a file remote under `.cbt/remote` when absent.
    #[serde(default)]
    pub remote: Option<RemoteConfig>,
    #[serde(default)]
    pub timer: TimerConfig,
}

fn default_user_id() -> String {
    "local-user".to_string()
}
fn default_packages_dir() -> PathBuf {
    PathBuf::from("packages")
}
fn default_local_dir() -> PathBuf {
    PathBuf::from(".cbt/local")
}
fn default_remote_dir() -> PathBuf {
    PathBuf::from(".cbt/remote")
}

impl Default for CbtConfig {
    fn default() -> Self {
        Self {
            user_id: default_user_id(),
            packages_dir: default_packages_dir(),
            local_dir: default_local_dir(),
            remote: None,
            timer: TimerConfig::default(),
        }
    }
}

/// Resolve environment variable references like `${VAR_NAME}` in a string.
fn resolve_env_vars(s: &str) -> String {
    resolve_vars_with(s, |name| std::env::var(name).ok())
}

/// Substitute `${NAME}` references using `lookup`; unknown names become empty.
/// Substituted values are not scanned again.
fn resolve_vars_with(s: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut result = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        let Some(len) = rest[start..].find('}') else {
            break;
        };
        result.push_str(&rest[..start]);
        result.push_str(&lookup(&rest[start + 2..start + len]).unwrap_or_default());
        rest = &rest[start + len + 1..];
    }
    result.push_str(rest);
    result
}

fn resolve_remote_config(config: &RemoteConfig) -> RemoteConfig {
    match config {
        RemoteConfig::Rest {
            base_url,
            api_key,
            sessions_table,
            results_table,
        } => RemoteConfig::Rest {
            base_url: resolve_env_vars(base_url),
            api_key: resolve_env_vars(api_key),
            sessions_table: sessions_table.clone(),
            results_table: results_table.clone(),
        },
        RemoteConfig::File { dir } => RemoteConfig::File {
            dir: PathBuf::from(resolve_env_vars(&dir.to_string_lossy())),
        },
    }
}

/// Apply `CBT_USER_ID` and `CBT_REMOTE_API_KEY` style overrides.
fn apply_overrides(config: &mut CbtConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(user_id) = lookup("CBT_USER_ID") {
        config.user_id = user_id;
    }
    if let Some(key) = lookup("CBT_REMOTE_API_KEY") {
        if let Some(RemoteConfig::Rest { api_key, .. }) = config.remote.as_mut() {
            *api_key = key;
        }
    }
}

/// Load config from an explicit path, or search the well-known paths.
///
/// Search order without a path:
/// 1. `cbt.toml` in the current directory
/// 2. `~/.config/cbt/config.toml`
///
/// Environment variable overrides: `CBT_USER_ID`, `CBT_REMOTE_API_KEY`.
pub fn load_config_from(path: Option<&Path>) -> Result<CbtConfig> {
    let config_path = if let Some(p) = path {
        if p.exists() {
            Some(p.to_path_buf())
        } else {
            anyhow::bail!("config file not found: {}", p.display());
        }
    } else {
        let local = PathBuf::from("cbt.toml");
        if local.exists() {
            Some(local)
        } else {
            dirs_path()
                .map(|home| home.join("config.toml"))
                .filter(|global| global.exists())
        }
    };

    let mut config = match config_path {
        Some(path) => parse_config(&path)?,
        None => CbtConfig::default(),
    };

    apply_overrides(&mut config, |name| std::env::var(name).ok());
    config.remote = config.remote.as_ref().map(resolve_remote_config);

    Ok(config)
}

fn parse_config(path: &Path) -> Result<CbtConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    toml::from_str::<CbtConfig>(&content)
        .with_context(|| format!("failed to parse config: {}", path.display()))
}

fn dirs_path() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(|h| PathBuf::from(h).join(".config").join("cbt"))
}

/// Create the remote store described by the configuration.
pub fn create_remote_store(config: &CbtConfig) -> Result<Arc<dyn RemoteStore>> {
    match &config.remote {
        Some(RemoteConfig::Rest {
            base_url,
            api_key,
            sessions_table,
            results_table,
        }) => {
            if api_key.is_empty() {
                anyhow::bail!("remote api_key is empty (set CBT_REMOTE_API_KEY?)");
            }
            let store = RestRemoteStore::new(base_url, api_key)
                .context("failed to create REST remote store")?
                .with_tables(sessions_table, results_table);
            Ok(Arc::new(store))
        }
        Some(RemoteConfig::File { dir }) => Ok(Arc::new(FileRemoteStore::new(dir))),
        None => Ok(Arc::new(FileRemoteStore::new(default_remote_dir()))),
    }
}

/// Open the device-local store, creating its directory.
pub fn create_local_store(config: &CbtConfig) -> Result<Arc<dyn LocalStore>> {
    let store = FileLocalStore::open(&config.local_dir).with_context(|| {
        format!(
            "failed to open local store: {}",
            config.local_dir.display()
        )
    })?;
    Ok(Arc::new(store))
}
