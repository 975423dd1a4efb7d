use std::time::Duration;

use event_channel::{Credentials, ReconnectPolicy};
use serde::Deserialize;

/// Settings read from `SIGNAL_*` environment variables (and `.env`).
#[derive(Debug, Default, Deserialize)]
pub struct ProbeConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub ws_url: Option<String>,
    #[serde(default)]
    pub log_path: Option<String>,
    #[serde(default)]
    pub reconnect_ms: Option<u64>,
    #[serde(default)]
    pub peer_id: Option<String>,
}

impl ProbeConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self::load(config::Config::builder().add_source(Self::environment()))
    }

    /// `SIGNAL_BASE_URL` and friends; no key is nested, so no separator.
    fn environment() -> config::Environment {
        config::Environment::with_prefix("SIGNAL").try_parsing(true)
    }

    fn load(builder: config::ConfigBuilder<config::builder::DefaultState>) -> Self {
        builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map(ProbeConfig::normalize)
            .unwrap_or_else(|err| {
                eprintln!("[signal-probe] ignoring unreadable configuration: {err}");
                ProbeConfig::default()
            })
    }

    fn normalize(mut self) -> Self {
        self.base_url = Self::normalize_opt(self.base_url.take());
        self.token = Self::normalize_opt(self.token.take());
        self.user_id = Self::normalize_opt(self.user_id.take());
        self.ws_url = Self::normalize_opt(self.ws_url.take());
        self.log_path = Self::normalize_opt(self.log_path.take());
        self.peer_id = Self::normalize_opt(self.peer_id.take());
        self.reconnect_ms = self.reconnect_ms.filter(|ms| *ms > 0);
        self
    }

    fn normalize_opt(value: Option<String>) -> Option<String> {
        value.and_then(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    /// `None` until both the user id and the token are configured.
    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.user_id, &self.token) {
            (Some(user_id), Some(token)) => Some(Credentials::new(user_id, token)),
            _ => None,
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        self.reconnect_ms
            .map(|ms| ReconnectPolicy::Fixed(Duration::from_millis(ms)))
            .unwrap_or_default()
    }
}
