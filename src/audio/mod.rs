//! Audio Module
//!
//! Capture, buffering, format conversion and voice-activity tagging.

mod buffer;
mod capture;
mod format;
mod vad;

pub use buffer::*;
pub use capture::*;
pub use format::*;
pub use vad::*;
