//! Wire Protocol
//!
//! JSON messages exchanged with the remote recognizer. Audio payloads are
//! base64-encoded 16-bit little-endian PCM.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::audio::{encode_pcm16, AudioFrame};

/// Messages sent to the recognizer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Handshake. Must be acknowledged with [`ServerMessage::SetupAck`]
    /// before any audio flows.
    Setup {
        api_key: String,
        sample_rate: u32,
        channels: u16,
    },
    /// One frame of audio.
    Audio {
        seq: u64,
        data: String,
        mime_type: String,
    },
    /// Heartbeat ping.
    Ping { seq: u64 },
    /// Graceful termination.
    End,
}

/// Messages received from the recognizer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake acknowledgment.
    SetupAck {
        #[serde(default)]
        session: Option<String>,
    },
    /// Incremental recognition result for the open utterance.
    Partial {
        #[serde(default)]
        utterance_id: Option<String>,
        text: String,
        #[serde(default)]
        confidence: Option<f32>,
        seq: u64,
    },
    /// Final recognition result sealing the utterance.
    Final {
        #[serde(default)]
        utterance_id: Option<String>,
        text: String,
        #[serde(default)]
        confidence: Option<f32>,
        seq: u64,
    },
    /// Heartbeat acknowledgment.
    Pong { seq: u64 },
    /// Backend-reported error.
    Error { code: u16, message: String },
}

/// Protocol-level encoding errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame of {got} samples is below the {min}-sample minimum")]
    UndersizedFrame { got: usize, min: usize },

    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Encode an audio frame as a wire message.
///
/// Frames below `min_samples` are a protocol violation and are rejected
/// rather than sent; the framer is responsible for concatenating up to the
/// threshold. The one exception is the final flush on stop, where the
/// short remainder is padded with silence up to the minimum.
pub fn audio_message(
    frame: &AudioFrame,
    sample_rate: u32,
    min_samples: usize,
    is_final_flush: bool,
) -> Result<ClientMessage, ProtocolError> {
    let mut samples = frame.samples.clone();
    if samples.len() < min_samples {
        if !is_final_flush {
            return Err(ProtocolError::UndersizedFrame {
                got: samples.len(),
                min: min_samples,
            });
        }
        samples.resize(min_samples, 0.0);
    }

    Ok(ClientMessage::Audio {
        seq: frame.seq,
        data: BASE64.encode(encode_pcm16(&samples)),
        mime_type: format!("audio/pcm;rate={sample_rate}"),
    })
}

/// Parse one inbound JSON message.
pub fn parse_server_message(text: &str) -> Result<ServerMessage, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

/// Serialize one outbound message.
pub fn encode_client_message(message: &ClientMessage) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(message)?)
}
