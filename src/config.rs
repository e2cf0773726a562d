//! `hound.toml` configuration.
//!
//! ```toml
//! [plugins]
//! paths = ["plugins", "~/.config/bookhound/plugins"]
//! timeout_secs = 120
//! max_depth = 2
//!
//! [plugins.settings.openlibrary]
//! base_url = "https://openlibrary.org"
//! api_key = "${OPENLIBRARY_KEY}"
//!
//! [search]
//! shutdown_grace_secs = 5
//! wait_secs = 60
//!
//! [log]
//! level = "info"
//! ```
//!
//! Every section and key is optional. `${VAR}` in plugin settings is
//! replaced from the environment when the settings are handed to a plugin.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::LogLevel;

pub const CONFIG_FILE_NAME: &str = "hound.toml";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub plugins: PluginsConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Defaults for every key, used when no config file exists.
    pub fn minimal() -> Self {
        Self::default()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PluginsConfig {
    #[serde(default = "default_plugin_paths")]
    pub paths: Vec<PathBuf>,
    #[serde(default = "default_plugin_timeout")]
    pub timeout_secs: u64,
    /// How deep below each path to look for scripts.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    /// Per-plugin tables passed to `plugin.find` as its `config` argument.
    #[serde(default)]
    pub settings: BTreeMap<String, toml::Table>,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            paths: default_plugin_paths(),
            timeout_secs: default_plugin_timeout(),
            max_depth: default_max_depth(),
            settings: BTreeMap::new(),
        }
    }
}

impl PluginsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Plugin directories with `~` expanded.
    pub fn search_dirs(&self) -> Vec<PathBuf> {
        self.paths.iter().map(|p| expand_tilde(p)).collect()
    }

    /// Settings for the plugin called `name`, with `${VAR}` expanded.
    /// Empty when the plugin has no section.
    pub fn settings_for(&self, name: &str) -> toml::Table {
        self.settings
            .get(name)
            .map(|table| {
                table
                    .iter()
                    .map(|(k, v)| (k.clone(), expand_env_in_value(v)))
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn default_plugin_paths() -> Vec<PathBuf> {
    vec![
        PathBuf::from("plugins"),
        PathBuf::from("~/.config/bookhound/plugins"),
    ]
}
fn default_plugin_timeout() -> u64 {
    120
}
fn default_max_depth() -> usize {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    /// How long `shutdown` waits for cancelled plugins before abandoning them.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    /// Upper bound on a whole search. `0` waits for every plugin to finish.
    #[serde(default = "default_wait_secs")]
    pub wait_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_secs: default_shutdown_grace(),
            wait_secs: default_wait_secs(),
        }
    }
}

impl SearchConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn wait_limit(&self) -> Option<Duration> {
        (self.wait_secs > 0).then(|| Duration::from_secs(self.wait_secs))
    }
}

fn default_shutdown_grace() -> u64 {
    5
}
fn default_wait_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    #[serde(default = "default_log_level", deserialize_with = "deserialize_level")]
    pub level: LogLevel,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn deserialize_level<'de, D: Deserializer<'de>>(de: D) -> std::result::Result<LogLevel, D::Error> {
    let raw = String::deserialize(de)?;
    raw.parse().map_err(serde::de::Error::custom)
}

/// Read and validate a config file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    if config.plugins.timeout_secs == 0 {
        bail!("plugins.timeout_secs must be > 0");
    }
    if config.plugins.max_depth == 0 {
        bail!("plugins.max_depth must be >= 1");
    }
    if config.plugins.paths.is_empty() {
        bail!("plugins.paths must list at least one directory");
    }

    Ok(config)
}

/// Load `explicit` if given; otherwise the first existing default location,
/// falling back to [`Config::minimal`].
///
/// Default locations, in order: `./hound.toml`, then
/// `<config dir>/bookhound/hound.toml`.
pub fn load_or_default(explicit: Option<&Path>) -> Result<Config> {
    if let Some(path) = explicit {
        return load_config(path);
    }
    match default_locations().into_iter().find(|p| p.is_file()) {
        Some(path) => load_config(&path),
        None => Ok(Config::minimal()),
    }
}

fn default_locations() -> Vec<PathBuf> {
    let mut out = vec![PathBuf::from(CONFIG_FILE_NAME)];
    if let Some(dir) = dirs::config_dir() {
        out.push(dir.join("bookhound").join(CONFIG_FILE_NAME));
    }
    out
}

/// Replace a leading `~` with the home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

/// Expand `${VAR_NAME}` from the process environment. Unset variables
/// expand to the empty string; an unterminated `${` is left as is.
pub fn expand_env_vars(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        let Some(len) = rest[start..].find('}') else {
            break;
        };
        out.push_str(&rest[..start]);
        let var = &rest[start + 2..start + len];
        out.push_str(&std::env::var(var).unwrap_or_default());
        rest = &rest[start + len + 1..];
    }
    out.push_str(rest);
    out
}

fn expand_env_in_value(value: &toml::Value) -> toml::Value {
    match value {
        toml::Value::String(s) => toml::Value::String(expand_env_vars(s)),
        toml::Value::Array(items) => {
            toml::Value::Array(items.iter().map(expand_env_in_value).collect())
        }
        toml::Value::Table(table) => toml::Value::Table(
            table
                .iter()
                .map(|(k, v)| (k.clone(), expand_env_in_value(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}
