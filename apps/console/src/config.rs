use std::fs;

use serde::Deserialize;

#[derive(Debug)]
pub struct Settings {
    pub server_url: String,
    pub poll_interval_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".into(),
            poll_interval_ms: client_core::DEFAULT_POLL_INTERVAL.as_millis() as u64,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    server_url: Option<String>,
    poll_interval_ms: Option<u64>,
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("console.toml") {
        if let Ok(file_cfg) = toml::from_str::<FileSettings>(&raw) {
            if let Some(v) = file_cfg.server_url {
                settings.server_url = v;
            }
            if let Some(v) = file_cfg.poll_interval_ms {
                settings.poll_interval_ms = v;
            }
        }
    }

    if let Ok(v) = std::env::var("CONSOLE_SERVER_URL") {
        settings.server_url = v;
    }
    if let Ok(v) = std::env::var("APP__SERVER_URL") {
        settings.server_url = v;
    }

    if let Ok(v) = std::env::var("APP__POLL_INTERVAL_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.poll_interval_ms = parsed;
        }
    }

    settings
}

/// Accept bare `host:port` values; the stream client insists on an
/// http(s) scheme to derive the ws(s) endpoint from.
pub fn normalize_server_url(raw: &str) -> String {
    let raw = raw.trim().trim_end_matches('/');

    if raw.is_empty() {
        return Settings::default().server_url;
    }

    if raw.starts_with("http://") || raw.starts_with("https://") {
        return raw.to_string();
    }

    format!("http://{raw}")
}
