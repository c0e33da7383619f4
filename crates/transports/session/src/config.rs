//! Configuration types for DH2D sessions

use crate::connection::RetryPolicy;
use crate::media::TransportRole;
use crate::{Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Service-level configuration shared by every session of a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Service base URL (http://, https://, ws:// or wss://)
    pub endpoint: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:32101".to_string(),
        }
    }
}

impl ClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if `endpoint` is not an absolute http(s)/ws(s) URL.
    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.endpoint).map_err(|e| {
            Error::InvalidConfig(format!("endpoint is not a valid URL ({}): {}", e, self.endpoint))
        })?;
        match url.scheme() {
            "http" | "https" | "ws" | "wss" => Ok(()),
            other => Err(Error::InvalidConfig(format!(
                "endpoint must use http, https, ws or wss, got {}",
                other
            ))),
        }
    }

    /// `path` under the endpoint, with an http/https scheme
    pub fn http_url(&self, path: &str) -> Result<Url> {
        self.url_with_scheme(path, false)
    }

    /// `path` under the endpoint, with a ws/wss scheme
    pub fn ws_url(&self, path: &str) -> Result<Url> {
        self.url_with_scheme(path, true)
    }

    /// Control channel URL for a session
    pub fn control_url(&self, session: &SessionConfig) -> Result<Url> {
        let mut url = self.ws_url("/api/v1/digital_human")?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(session_id) = &session.session_id {
                query.append_pair("session_id", session_id);
            }
            query.append_pair("video_id", &session.video_id);
            query.append_pair("task", "dh_2d");
            if session.audio_input {
                query.append_pair("task", "audio_input");
            }
        }
        Ok(url)
    }

    /// Negotiation endpoint for one transport
    pub fn offer_url(&self, session_id: &str, role: TransportRole) -> Result<Url> {
        let path = match role {
            TransportRole::Primary => format!("/api/v1/session/{}/offer", session_id),
            TransportRole::AudioInput => format!("/api/v1/session/{}/offer/audio", session_id),
        };
        self.http_url(&path)
    }

    fn url_with_scheme(&self, path: &str, websocket: bool) -> Result<Url> {
        let base = self.endpoint.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        let mut url = Url::parse(&format!("{}/{}", base, path))
            .map_err(|e| Error::InvalidConfig(format!("invalid URL for {}: {}", path, e)))?;

        let secure = matches!(url.scheme(), "https" | "wss");
        let scheme = match (websocket, secure) {
            (true, true) => "wss",
            (true, false) => "ws",
            (false, true) => "https",
            (false, false) => "http",
        };
        url.set_scheme(scheme)
            .map_err(|_| Error::InvalidConfig(format!("cannot use {} scheme for {}", scheme, url)))?;
        Ok(url)
    }
}

/// Per-session configuration
///
/// Durations are in milliseconds; `0` disables an optional check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Session to resume; a random id is generated when absent
    pub session_id: Option<String>,

    /// Avatar/persona to render (default: "liruyun")
    pub video_id: String,

    /// Nominal video frame rate (default: 25)
    pub frame_rate: u32,

    /// Request the audio-input task and a send-only audio transport (default: false)
    pub audio_input: bool,

    /// Per-attempt connect timeout (default: 60000ms)
    pub connect_timeout_ms: u64,

    /// Scheduled rotation interval (default: 1200000ms = 20min)
    pub reconnect_interval_ms: u64,

    /// Audio/video drift ceiling (default: 10000ms)
    pub max_av_drift_ms: u64,

    /// Liveness ping interval (default: 10000ms)
    pub ping_interval_ms: u64,

    /// Time allowed for the matching pong (default: 5000ms)
    pub ping_timeout_ms: u64,

    /// Decode-stall threshold (default: 0 = disabled)
    pub max_stall_duration_ms: u64,

    /// Received-frame telemetry poll interval (default: 200ms)
    pub stats_interval_ms: u64,

    /// Drift check interval (default: 1000ms)
    pub drift_check_interval_ms: u64,

    /// Stall watchdog check interval (default: 1000ms)
    pub stall_check_interval_ms: u64,

    /// Cover fade-out before playback counts as ready (default: 500ms)
    pub cover_fade_ms: u64,

    /// Backoff between failed attempts
    pub retry: RetryPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_id: None,
            video_id: "liruyun".to_string(),
            frame_rate: 25,
            audio_input: false,
            connect_timeout_ms: 60_000,
            reconnect_interval_ms: 20 * 60 * 1000,
            max_av_drift_ms: 10_000,
            ping_interval_ms: 10_000,
            ping_timeout_ms: 5_000,
            max_stall_duration_ms: 0,
            stats_interval_ms: 200,
            drift_check_interval_ms: 1_000,
            stall_check_interval_ms: 1_000,
            cover_fade_ms: 500,
            retry: RetryPolicy::default(),
        }
    }
}

fn enabled(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl SessionConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `video_id` is empty
    /// - `frame_rate` is zero
    /// - `session_id` is set but empty
    ///
    /// A zero interval or limit is not an error; it disables the check.
    pub fn validate(&self) -> Result<()> {
        if self.video_id.trim().is_empty() {
            return Err(Error::InvalidConfig("video_id must not be empty".to_string()));
        }

        if self.frame_rate == 0 {
            return Err(Error::InvalidConfig("frame_rate must be positive".to_string()));
        }

        if let Some(id) = &self.session_id {
            if id.is_empty() {
                return Err(Error::InvalidConfig("session_id must not be empty".to_string()));
            }
        }

        Ok(())
    }

    /// Parse a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source)
            .map_err(|e| Error::InvalidConfig(format!("invalid session config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let source = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&source)
    }

    pub fn with_video_id(mut self, video_id: impl Into<String>) -> Self {
        self.video_id = video_id.into();
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_audio_input(mut self, enabled: bool) -> Self {
        self.audio_input = enabled;
        self
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        enabled(self.connect_timeout_ms)
    }

    pub fn reconnect_interval(&self) -> Option<Duration> {
        enabled(self.reconnect_interval_ms)
    }

    pub fn max_stall_duration(&self) -> Option<Duration> {
        enabled(self.max_stall_duration_ms)
    }

    /// Ping period and pong deadline; pinging needs both
    pub fn ping(&self) -> Option<(Duration, Duration)> {
        Some((enabled(self.ping_interval_ms)?, enabled(self.ping_timeout_ms)?))
    }

    pub fn stats_interval(&self) -> Option<Duration> {
        enabled(self.stats_interval_ms)
    }

    pub fn cover_fade(&self) -> Option<Duration> {
        enabled(self.cover_fade_ms)
    }

    /// Drift check period, or `None` when the drift check is disabled
    pub fn drift_check(&self) -> Option<Duration> {
        if self.max_av_drift_ms == 0 {
            return None;
        }
        enabled(self.drift_check_interval_ms)
    }

    /// Stall check period, or `None` when the watchdog is disabled
    pub fn stall_check(&self) -> Option<Duration> {
        self.max_stall_duration()?;
        enabled(self.stall_check_interval_ms)
    }
}

/// Random 13-character base-36 session identifier
pub fn generate_session_id() -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    (0..13)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}
