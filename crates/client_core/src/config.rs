use std::{collections::HashMap, fs, path::Path, time::Duration};

use tracing::warn;
use url::Url;

use crate::error::TransportError;

pub const SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub server_url: String,
    pub ws_path: String,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub poll_interval: Duration,
    pub typing_timeout: Duration,
    pub event_buffer: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:5000".into(),
            ws_path: "/ws".into(),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            max_reconnect_attempts: 5,
            poll_interval: Duration::from_secs(3),
            typing_timeout: Duration::from_secs(3),
            event_buffer: 256,
        }
    }
}

impl ClientSettings {
    /// Derives the real-time endpoint from the REST base url (`http` -> `ws`, `https` -> `wss`).
    pub fn websocket_url(&self) -> Result<Url, TransportError> {
        let mut url = Url::parse(self.server_url.trim())
            .map_err(|err| TransportError::InvalidUrl(format!("{}: {err}", self.server_url)))?;
        let scheme = match url.scheme() {
            "http" => "ws",
            "https" => "wss",
            other => {
                return Err(TransportError::InvalidUrl(format!(
                    "server_url must start with http:// or https://, got {other}://"
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|()| TransportError::InvalidUrl(format!("cannot switch scheme to {scheme}")))?;
        let path = format!(
            "{}/{}",
            url.path().trim_end_matches('/'),
            self.ws_path.trim_start_matches('/')
        );
        url.set_path(&path);
        Ok(url)
    }

    fn apply(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("server_url") {
            self.server_url = v;
        }
        if let Some(v) = lookup("ws_path") {
            self.ws_path = v;
        }
        if let Some(v) = parsed::<u64>("reconnect_base_ms", lookup("reconnect_base_ms")) {
            self.reconnect_base_delay = Duration::from_millis(v);
        }
        if let Some(v) = parsed::<u64>("reconnect_max_ms", lookup("reconnect_max_ms")) {
            self.reconnect_max_delay = Duration::from_millis(v);
        }
        if let Some(v) = parsed::<u32>(
            "reconnect_max_attempts",
            lookup("reconnect_max_attempts"),
        ) {
            self.max_reconnect_attempts = v;
        }
        if let Some(v) = parsed::<u64>("poll_interval_ms", lookup("poll_interval_ms")) {
            self.poll_interval = Duration::from_millis(v.max(1));
        }
        if let Some(v) = parsed::<u64>("typing_timeout_ms", lookup("typing_timeout_ms")) {
            self.typing_timeout = Duration::from_millis(v);
        }
        if let Some(v) = parsed::<usize>("event_buffer", lookup("event_buffer")) {
            self.event_buffer = v.max(1);
        }
    }
}

fn parsed<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Option<T> {
    let raw = raw?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable client setting");
            None
        }
    }
}

/// Defaults, then `client.toml` in the working directory, then `APP__*` environment overrides.
pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(SETTINGS_FILE))
}

pub fn load_settings_from(path: &Path) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<HashMap<String, toml::Value>>(&raw) {
            Ok(file_cfg) => settings.apply(|key| file_cfg.get(key).map(toml_value_to_string)),
            Err(err) => warn!(path = %path.display(), error = %err, "ignoring malformed settings file"),
        }
    }

    settings.apply(|key| std::env::var(format!("APP__{}", key.to_ascii_uppercase())).ok());
    settings
}

fn toml_value_to_string(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
