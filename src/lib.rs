//! Streamscribe Library
//!
//! Real-time speech transcription over a streaming connection: audio
//! capture and framing, a managed transport with reconnect and fallback,
//! and reconciliation of partial results into a stable transcript.

pub mod audio;
pub mod config;
pub mod net;
pub mod session;
pub mod transcript;

pub use config::SessionConfig;
pub use session::{SessionController, SessionError, SessionEvent};
