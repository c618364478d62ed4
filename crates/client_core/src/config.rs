use std::{collections::HashMap, fs, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;

pub const DEFAULT_SETTINGS_FILE: &str = "chat.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database_url: String,
    pub blob_base_url: String,
    /// Attempts for one versioned index write before giving up.
    pub index_write_attempts: u32,
    pub resubscribe_initial_backoff_ms: u64,
    pub resubscribe_max_backoff_ms: u64,
    pub resubscribe_max_attempts: u32,
    pub signal_buffer: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "sqlite://./data/chat.db".into(),
            blob_base_url: "blob://local/".into(),
            index_write_attempts: 5,
            resubscribe_initial_backoff_ms: 250,
            resubscribe_max_backoff_ms: 8_000,
            resubscribe_max_attempts: 8,
            signal_buffer: 64,
        }
    }
}

impl Settings {
    pub fn resubscribe_initial_backoff(&self) -> Duration {
        Duration::from_millis(self.resubscribe_initial_backoff_ms)
    }

    pub fn resubscribe_max_backoff(&self) -> Duration {
        Duration::from_millis(self.resubscribe_max_backoff_ms)
    }
}

/// Defaults, then `chat.toml` in the working directory, then `APP__*`
/// environment variables. An unreadable file is skipped.
pub fn load_settings() -> Settings {
    let mut settings = read_settings_file(Path::new(DEFAULT_SETTINGS_FILE))
        .ok()
        .flatten()
        .unwrap_or_default();
    apply_overrides(&mut settings, &env_overrides());
    settings
}

pub fn load_settings_from(path: &Path) -> anyhow::Result<Settings> {
    let mut settings = read_settings_file(path)?.unwrap_or_default();
    apply_overrides(&mut settings, &env_overrides());
    Ok(settings)
}

/// Keys missing from the file keep their defaults.
fn read_settings_file(path: &Path) -> anyhow::Result<Option<Settings>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read settings file '{}'", path.display()))?;
    let settings = toml::from_str(&raw)
        .with_context(|| format!("failed to parse settings file '{}'", path.display()))?;
    Ok(Some(settings))
}

fn env_overrides() -> HashMap<String, String> {
    std::env::vars()
        .filter_map(|(key, value)| {
            key.strip_prefix("APP__")
                .map(|name| (name.to_ascii_lowercase(), value))
        })
        .collect()
}

fn apply_overrides(settings: &mut Settings, overrides: &HashMap<String, String>) {
    if let Some(v) = overrides.get("database_url") {
        settings.database_url = v.clone();
    }
    if let Some(v) = overrides.get("blob_base_url") {
        settings.blob_base_url = v.clone();
    }
    if let Some(v) = parsed(overrides, "index_write_attempts") {
        settings.index_write_attempts = v;
    }
    if let Some(v) = parsed(overrides, "resubscribe_initial_backoff_ms") {
        settings.resubscribe_initial_backoff_ms = v;
    }
    if let Some(v) = parsed(overrides, "resubscribe_max_backoff_ms") {
        settings.resubscribe_max_backoff_ms = v;
    }
    if let Some(v) = parsed(overrides, "resubscribe_max_attempts") {
        settings.resubscribe_max_attempts = v;
    }
    if let Some(v) = parsed(overrides, "signal_buffer") {
        settings.signal_buffer = v;
    }
}

fn parsed<T: std::str::FromStr>(overrides: &HashMap<String, String>, key: &str) -> Option<T> {
    overrides.get(key).and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
