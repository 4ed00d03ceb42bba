//! Session Configuration
//!
//! Streaming session configuration schema with fail-fast validation.

use serde::{Deserialize, Serialize};

use crate::net::TransportKind;

/// Top-level configuration for one streaming session.
///
/// Validated with [`SessionConfig::validate`] before any network activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Recognizer endpoint (ws:// or wss:// for the WebSocket transport,
    /// http:// or https:// base for the HTTP fallback).
    pub endpoint: String,
    /// Credentials presented during the handshake.
    pub credentials: Credentials,
    /// Reconnect backoff parameters.
    pub backoff: BackoffSettings,
    /// Capture and framing parameters.
    pub audio: AudioSettings,
    /// Transcript retention limits.
    pub retention: RetentionSettings,
    /// Heartbeat parameters.
    pub heartbeat: HeartbeatSettings,
    /// Handshake acknowledgment timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Reorder window for out-of-order transcription events.
    pub reorder_window: u64,
    /// Ordered fallback transport chain. The first entry is the primary
    /// transport; escalation walks the list forward only.
    pub transports: Vec<TransportKind>,
    /// Consecutive protocol-fatal failures on one transport before
    /// escalating to the next one in the chain.
    pub escalation_threshold: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            credentials: Credentials::default(),
            backoff: BackoffSettings::default(),
            audio: AudioSettings::default(),
            retention: RetentionSettings::default(),
            heartbeat: HeartbeatSettings::default(),
            connect_timeout_ms: 10_000,
            reorder_window: 32,
            transports: vec![TransportKind::WebSocket, TransportKind::HttpStream],
            escalation_threshold: 3,
        }
    }
}

impl SessionConfig {
    /// Validate the configuration.
    ///
    /// Runs before any capture or network activity; every rejected field is
    /// a [`ConfigError`] naming the offending value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.is_empty() {
            return Err(ConfigError::MissingEndpoint);
        }
        let scheme_ok = ["ws://", "wss://", "http://", "https://"]
            .iter()
            .any(|s| self.endpoint.starts_with(s));
        if !scheme_ok {
            return Err(ConfigError::InvalidEndpoint(self.endpoint.clone()));
        }

        if self.credentials.api_key.is_empty() {
            return Err(ConfigError::MissingCredentials);
        }

        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::NonPositive("connect_timeout_ms"));
        }

        if self.transports.is_empty() {
            return Err(ConfigError::EmptyTransportChain);
        }
        for (i, kind) in self.transports.iter().enumerate() {
            if self.transports[..i].contains(kind) {
                return Err(ConfigError::DuplicateTransport(*kind));
            }
        }
        if self.escalation_threshold == 0 {
            return Err(ConfigError::NonPositive("escalation_threshold"));
        }

        self.backoff.validate()?;
        self.audio.validate()?;
        self.retention.validate()?;
        self.heartbeat.validate()?;

        Ok(())
    }
}

/// Credentials for the recognizer backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    /// API key sent in the setup message and transport headers.
    pub api_key: String,
}

/// Reconnect backoff parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffSettings {
    /// Base delay in milliseconds for the first retry.
    pub base_delay_ms: u64,
    /// Upper bound on any single delay.
    pub max_delay_ms: u64,
    /// Jitter applied to each delay, as a percentage of the delay (0-100).
    pub jitter_percent: u8,
    /// Attempts before giving up with a fatal connection error.
    pub max_attempts: u32,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 800,
            max_delay_ms: 30_000,
            jitter_percent: 20,
            max_attempts: 10,
        }
    }
}

impl BackoffSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.base_delay_ms == 0 {
            return Err(ConfigError::NonPositive("backoff.base_delay_ms"));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(ConfigError::InvalidRange(
                "backoff.max_delay_ms must be >= base_delay_ms",
            ));
        }
        if self.jitter_percent > 100 {
            return Err(ConfigError::InvalidRange(
                "backoff.jitter_percent must be <= 100",
            ));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::NonPositive("backoff.max_attempts"));
        }
        Ok(())
    }
}

/// Capture and framing parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    /// Target sample rate for outbound frames.
    pub sample_rate: u32,
    /// Target channel count (1 = mono).
    pub channels: u16,
    /// Duration of each emitted frame in milliseconds.
    pub frame_duration_ms: u32,
    /// Backend-required minimum frame duration. Frames below this are
    /// concatenated until the threshold is met; they are never sent short.
    pub min_frame_duration_ms: u32,
    /// Voice-activity tagging parameters.
    pub vad: VadSettings,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            frame_duration_ms: 200,
            min_frame_duration_ms: 100,
            vad: VadSettings::default(),
        }
    }
}

impl AudioSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate == 0 {
            return Err(ConfigError::NonPositive("audio.sample_rate"));
        }
        if self.channels == 0 {
            return Err(ConfigError::NonPositive("audio.channels"));
        }
        if !(100..=500).contains(&self.frame_duration_ms) {
            return Err(ConfigError::InvalidRange(
                "audio.frame_duration_ms must be within 100-500",
            ));
        }
        if self.min_frame_duration_ms == 0 || self.min_frame_duration_ms > self.frame_duration_ms {
            return Err(ConfigError::InvalidRange(
                "audio.min_frame_duration_ms must be within 1..=frame_duration_ms",
            ));
        }
        Ok(())
    }
}

/// Voice-activity tagging parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadSettings {
    /// Tag frames with speech/silence and let the consumer skip silence.
    pub enabled: bool,
    /// RMS energy threshold above which a frame counts as speech.
    pub energy_threshold: f32,
    /// Frames of trailing silence still tagged as speech after the last
    /// speech-tagged frame.
    pub hangover_frames: u32,
    /// Silence gap (milliseconds) treated as a turn boundary when the
    /// backend supplies no utterance ids.
    pub silence_gap_ms: u32,
    /// Keep-alive cadence while skipping silent frames, in frames.
    pub keepalive_every_frames: u32,
}

impl Default for VadSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            energy_threshold: 0.01,
            hangover_frames: 2,
            silence_gap_ms: 800,
            keepalive_every_frames: 10,
        }
    }
}

/// Transcript retention limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionSettings {
    /// Maximum sealed entries kept.
    pub max_entries: usize,
    /// Maximum age of a sealed entry in seconds (0 = unlimited).
    pub max_age_secs: u64,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            max_entries: 256,
            max_age_secs: 0,
        }
    }
}

impl RetentionSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_entries == 0 {
            return Err(ConfigError::NonPositive("retention.max_entries"));
        }
        Ok(())
    }
}

/// Heartbeat parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSettings {
    /// Ping interval in milliseconds.
    pub interval_ms: u64,
    /// Consecutive missed acknowledgments before the connection is
    /// declared stale.
    pub max_missed: u32,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            max_missed: 3,
        }
    }
}

impl HeartbeatSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_ms == 0 {
            return Err(ConfigError::NonPositive("heartbeat.interval_ms"));
        }
        if self.max_missed == 0 {
            return Err(ConfigError::NonPositive("heartbeat.max_missed"));
        }
        Ok(())
    }
}

/// Configuration errors. All are fatal and raised before any network
/// activity.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("endpoint is not configured")]
    MissingEndpoint,

    #[error("endpoint has an unsupported scheme: {0}")]
    InvalidEndpoint(String),

    #[error("credentials are not configured")]
    MissingCredentials,

    #[error("{0} must be positive")]
    NonPositive(&'static str),

    #[error("{0}")]
    InvalidRange(&'static str),

    #[error("transport chain is empty")]
    EmptyTransportChain,

    #[error("transport listed twice in chain: {0:?}")]
    DuplicateTransport(TransportKind),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> SessionConfig {
        SessionConfig {
            endpoint: "wss://recognizer.example.com/v1/stream".to_string(),
            credentials: Credentials {
                api_key: "test-key".to_string(),
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_missing_endpoint_rejected() {
        let config = SessionConfig::default();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingEndpoint)
        ));
    }

    #[test]
    fn test_bad_scheme_rejected() {
        let mut config = valid_config();
        config.endpoint = "ftp://recognizer.example.com".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn test_missing_credentials_rejected() {
        let mut config = valid_config();
        config.credentials.api_key.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingCredentials)
        ));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = valid_config();
        config.connect_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_transport_chain_rejected() {
        let mut config = valid_config();
        config.transports.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::EmptyTransportChain)
        ));
    }

    #[test]
    fn test_duplicate_transport_rejected() {
        let mut config = valid_config();
        config.transports = vec![TransportKind::WebSocket, TransportKind::WebSocket];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateTransport(_))
        ));
    }

    #[test]
    fn test_frame_duration_out_of_range_rejected() {
        let mut config = valid_config();
        config.audio.frame_duration_ms = 50;
        assert!(config.validate().is_err());

        config.audio.frame_duration_ms = 600;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_min_frame_duration_must_not_exceed_frame_duration() {
        let mut config = valid_config();
        config.audio.min_frame_duration_ms = config.audio.frame_duration_ms + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_max_below_base_rejected() {
        let mut config = valid_config();
        config.backoff.base_delay_ms = 5_000;
        config.backoff.max_delay_ms = 1_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_jitter_over_100_rejected() {
        let mut config = valid_config();
        config.backoff.jitter_percent = 150;
        assert!(config.validate().is_err());
    }
}
