//! Client configuration with defaults and environment overrides.

use std::time::Duration;

use crate::error::ConfigError;
use crate::session::{DEFAULT_IDLE_WINDOW, DEFAULT_SESSION_TOKEN};

pub const DEFAULT_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Bound on one complete exchange, connect through body.
    pub timeout: Duration,
    /// Send and expect JSON (`true`) or XML bodies.
    pub json_mode: bool,
    /// Skip TLS certificate and host name verification. Off by default.
    ///
    /// Unity Connection servers commonly run with self-signed certificates;
    /// enabling this also accepts any man-in-the-middle certificate, so
    /// prefer installing the server's CA where possible.
    pub accept_invalid_certs: bool,
    pub session_token_name: String,
    pub session_idle_window: Duration,
    /// Allow only one exchange in flight per client.
    pub serialize_calls: bool,
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            json_mode: true,
            accept_invalid_certs: false,
            session_token_name: DEFAULT_SESSION_TOKEN.to_string(),
            session_idle_window: DEFAULT_IDLE_WINDOW,
            serialize_calls: true,
            user_agent: concat!("cuc-rest-core/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl ClientConfig {
    /// Defaults overridden by environment variables.
    ///
    /// - `CUC_TIMEOUT_SECS`: default 15
    /// - `CUC_JSON_MODE`: `true` (default) or `false` for XML
    /// - `CUC_ACCEPT_INVALID_CERTS`: default `false`
    /// - `CUC_SESSION_TOKEN`: default `JSESSIONIDSSO`
    /// - `CUC_SESSION_IDLE_SECS`: default 60
    /// - `CUC_SERIALIZE_CALLS`: default `true`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env` with an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(secs) = parse_u64(&lookup, "CUC_TIMEOUT_SECS")? {
            config.timeout = Duration::from_secs(secs);
        }
        if let Some(json) = parse_flag(&lookup, "CUC_JSON_MODE")? {
            config.json_mode = json;
        }
        if let Some(accept) = parse_flag(&lookup, "CUC_ACCEPT_INVALID_CERTS")? {
            config.accept_invalid_certs = accept;
        }
        if let Some(token) = lookup("CUC_SESSION_TOKEN").filter(|t| !t.trim().is_empty()) {
            config.session_token_name = token.trim().to_string();
        }
        if let Some(secs) = parse_u64(&lookup, "CUC_SESSION_IDLE_SECS")? {
            config.session_idle_window = Duration::from_secs(secs);
        }
        if let Some(serialize) = parse_flag(&lookup, "CUC_SERIALIZE_CALLS")? {
            config.serialize_calls = serialize;
        }
        Ok(config)
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn json_mode(mut self, json_mode: bool) -> Self {
        self.json_mode = json_mode;
        self
    }

    pub fn serialize_calls(mut self, serialize: bool) -> Self {
        self.serialize_calls = serialize;
        self
    }

    /// Accept self-signed or otherwise unverifiable server certificates.
    pub fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    pub fn session_idle_window(mut self, window: Duration) -> Self {
        self.session_idle_window = window;
        self
    }
}

fn parse_u64(lookup: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<u64>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
    }
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<bool>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(Some(true)),
            "0" | "false" | "no" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidValue { key, value: raw }),
        },
    }
}
