//! Tuner configuration.
//!
//! A tuner instance is described by a [`TunerHostInfo`]: an identifier, the
//! backend's HTTP base URL and the provider options. The HTSP endpoint lives
//! on the same host as the HTTP URL, on `htsp_port`.
//!
//! Values can be overridden from the environment (`TVH_*`), which the probe
//! applies on top of its configuration file.

use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::HtspError;

/// Default HTTP base URL of a local backend.
pub const DEFAULT_URL: &str = "http://localhost:9981";

/// Default HTSP port.
pub const DEFAULT_HTSP_PORT: u16 = 9982;

/// Default client name announced in the hello request.
pub const DEFAULT_CLIENT_NAME: &str = "tvheadend-tuner";

/// Provider options stored with each tuner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TvheadendOptions {
    /// HTSP user name; anonymous access when absent.
    pub username: Option<String>,
    /// HTSP password.
    pub password: Option<String>,
    /// HTSP port on the backend host.
    pub htsp_port: u16,
    /// Client name sent during the handshake.
    pub client_name: String,
    /// TCP connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Interval between keep-alive requests in seconds.
    pub keepalive_interval_secs: u64,
    /// Upper bound on reply chunks accepted for a single event query.
    pub max_event_chunks: usize,
}

impl Default for TvheadendOptions {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            htsp_port: DEFAULT_HTSP_PORT,
            client_name: DEFAULT_CLIENT_NAME.to_string(),
            connect_timeout_secs: 10,
            keepalive_interval_secs: 30,
            max_event_chunks: 64,
        }
    }
}

impl TvheadendOptions {
    /// Apply `TVH_USERNAME`, `TVH_PASSWORD` and `TVH_HTSP_PORT` overrides.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(username) = lookup("TVH_USERNAME") {
            self.username = Some(username);
        }
        if let Some(password) = lookup("TVH_PASSWORD") {
            self.password = Some(password);
        }
        if let Some(port) = lookup("TVH_HTSP_PORT") {
            match port.parse() {
                Ok(port) => self.htsp_port = port,
                Err(_) => warn!("Ignoring invalid TVH_HTSP_PORT value: {}", port),
            }
        }
    }
}

/// One configured backend endpoint exposed to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunerHostInfo {
    /// Opaque tuner identifier; keys the per-tuner session.
    pub id: String,
    /// HTTP base URL of the backend, e.g. `http://localhost:9981`.
    pub url: String,
    #[serde(default)]
    pub options: TvheadendOptions,
}

impl TunerHostInfo {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            options: TvheadendOptions::default(),
        }
    }

    pub fn with_options(mut self, options: TvheadendOptions) -> Self {
        self.options = options;
        self
    }

    /// Apply `TVH_URL` plus the option overrides.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("TVH_URL") {
            self.url = url;
        }
        self.options.apply_overrides(lookup);
    }
}

/// Resolved connection parameters for one HTSP session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Label used in log lines (the tuner id).
    pub label: String,
    /// `host:port` of the HTSP endpoint.
    pub htsp_addr: String,
    /// HTTP base URL without a trailing slash.
    pub http_base_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_name: String,
    pub connect_timeout: Duration,
    pub keepalive_interval: Duration,
    pub max_event_chunks: usize,
}

impl SessionConfig {
    /// Resolve a tuner configuration into session parameters.
    pub fn from_tuner(tuner: &TunerHostInfo) -> Result<Self, HtspError> {
        let base = tuner.url.trim();
        let url = Url::parse(base)
            .map_err(|e| HtspError::Config(format!("invalid url '{}': {}", base, e)))?;

        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(HtspError::Config(format!(
                "unsupported url scheme '{}'",
                url.scheme()
            )));
        }

        let host = url
            .host_str()
            .ok_or_else(|| HtspError::Config(format!("url '{}' has no host", base)))?;

        let options = &tuner.options;
        if options.htsp_port == 0 {
            return Err(HtspError::Config("htsp_port must not be 0".to_string()));
        }
        if options.max_event_chunks == 0 {
            return Err(HtspError::Config(
                "max_event_chunks must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            label: tuner.id.clone(),
            htsp_addr: format!("{}:{}", host, options.htsp_port),
            http_base_url: base.trim_end_matches('/').to_string(),
            username: options.username.clone().filter(|u| !u.is_empty()),
            password: options.password.clone(),
            client_name: options.client_name.clone(),
            connect_timeout: Duration::from_secs(options.connect_timeout_secs.max(1)),
            keepalive_interval: Duration::from_secs(options.keepalive_interval_secs.max(1)),
            max_event_chunks: options.max_event_chunks,
        })
    }

    /// True when both configurations reach the same backend the same way.
    /// The label is ignored.
    pub fn same_endpoint(&self, other: &SessionConfig) -> bool {
        self.htsp_addr == other.htsp_addr
            && self.http_base_url == other.http_base_url
            && self.username == other.username
            && self.password == other.password
            && self.client_name == other.client_name
            && self.connect_timeout == other.connect_timeout
            && self.keepalive_interval == other.keepalive_interval
            && self.max_event_chunks == other.max_event_chunks
    }
}
