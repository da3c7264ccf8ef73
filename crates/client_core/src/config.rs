use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use tracing::warn;

use crate::{realtime::ReconnectPolicy, session::RefreshPolicy};

pub const DEFAULT_SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub server_url: String,
    pub database_url: String,
    pub refresh_buffer_secs: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_secs: u64,
    pub foreground_threshold_secs: u64,
    pub stable_connection_secs: u64,
    pub handshake_timeout_secs: u64,
    pub page_size: u32,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            database_url: "sqlite://./data/client.db".into(),
            refresh_buffer_secs: 300,
            reconnect_base_ms: 1_000,
            reconnect_max_secs: 30,
            foreground_threshold_secs: 5,
            stable_connection_secs: 60,
            handshake_timeout_secs: 10,
            page_size: 50,
        }
    }
}

impl ClientSettings {
    pub fn refresh_policy(&self) -> RefreshPolicy {
        RefreshPolicy {
            buffer: Duration::from_secs(self.refresh_buffer_secs),
            ..RefreshPolicy::default()
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.reconnect_base_ms),
            max_delay: Duration::from_secs(self.reconnect_max_secs),
            foreground_threshold: Duration::from_secs(self.foreground_threshold_secs),
            stable_after: Duration::from_secs(self.stable_connection_secs),
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    server_url: Option<String>,
    database_url: Option<String>,
    refresh_buffer_secs: Option<u64>,
    reconnect_base_ms: Option<u64>,
    reconnect_max_secs: Option<u64>,
    foreground_threshold_secs: Option<u64>,
    stable_connection_secs: Option<u64>,
    handshake_timeout_secs: Option<u64>,
    page_size: Option<u32>,
}

pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(DEFAULT_SETTINGS_FILE), |key| std::env::var(key).ok())
}

/// File values override defaults; `APP__*` variables override both.
pub fn load_settings_from(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file_cfg) => apply_file_settings(&mut settings, file_cfg),
            Err(err) => warn!(path = %path.display(), "config: ignoring unreadable settings file: {err}"),
        }
    }

    if let Some(v) = env("APP__SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = env("APP__DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = parsed_env(&env, "APP__REFRESH_BUFFER_SECS") {
        settings.refresh_buffer_secs = v;
    }
    if let Some(v) = parsed_env(&env, "APP__RECONNECT_BASE_MS") {
        settings.reconnect_base_ms = v;
    }
    if let Some(v) = parsed_env(&env, "APP__RECONNECT_MAX_SECS") {
        settings.reconnect_max_secs = v;
    }
    if let Some(v) = parsed_env(&env, "APP__FOREGROUND_THRESHOLD_SECS") {
        settings.foreground_threshold_secs = v;
    }
    if let Some(v) = parsed_env(&env, "APP__STABLE_CONNECTION_SECS") {
        settings.stable_connection_secs = v;
    }
    if let Some(v) = parsed_env(&env, "APP__HANDSHAKE_TIMEOUT_SECS") {
        settings.handshake_timeout_secs = v;
    }
    if let Some(v) = parsed_env(&env, "APP__PAGE_SIZE") {
        settings.page_size = v;
    }

    settings
}

fn apply_file_settings(settings: &mut ClientSettings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.server_url {
        settings.server_url = v;
    }
    if let Some(v) = file_cfg.database_url {
        settings.database_url = v;
    }
    if let Some(v) = file_cfg.refresh_buffer_secs {
        settings.refresh_buffer_secs = v;
    }
    if let Some(v) = file_cfg.reconnect_base_ms {
        settings.reconnect_base_ms = v;
    }
    if let Some(v) = file_cfg.reconnect_max_secs {
        settings.reconnect_max_secs = v;
    }
    if let Some(v) = file_cfg.foreground_threshold_secs {
        settings.foreground_threshold_secs = v;
    }
    if let Some(v) = file_cfg.stable_connection_secs {
        settings.stable_connection_secs = v;
    }
    if let Some(v) = file_cfg.handshake_timeout_secs {
        settings.handshake_timeout_secs = v;
    }
    if let Some(v) = file_cfg.page_size {
        settings.page_size = v;
    }
}

fn parsed_env<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "config: ignoring unparsable environment override");
            None
        }
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
