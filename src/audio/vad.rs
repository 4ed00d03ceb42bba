//! Voice Activity Tagging
//!
//! Short-term energy detector used to tag frames as speech or silence.
//! Lets the consumer skip transmitting silent frames and supplies the
//! silence-gap signal used to synthesize turn boundaries when the backend
//! sends no utterance ids.

use std::time::Duration;

use crate::config::VadSettings;

use super::format::rms_energy;

/// Per-frame verdict from the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VadVerdict {
    /// Whether the frame should be treated as speech (includes hangover).
    pub is_speech: bool,
    /// A silence gap long enough to count as a turn boundary ended at
    /// this frame.
    pub turn_boundary: bool,
}

/// Energy-based voice activity detector with hangover.
///
/// A frame is speech when its RMS energy exceeds the threshold. After the
/// last energetic frame, `hangover_frames` further frames stay tagged as
/// speech so trailing consonants are not clipped.
pub struct EnergyVad {
    settings: VadSettings,
    hangover_left: u32,
    silence_elapsed: Duration,
    in_turn: bool,
}

impl EnergyVad {
    pub fn new(settings: VadSettings) -> Self {
        Self {
            settings,
            hangover_left: 0,
            silence_elapsed: Duration::ZERO,
            in_turn: false,
        }
    }

    /// Classify one frame of samples covering `frame_duration`.
    pub fn classify(&mut self, samples: &[f32], frame_duration: Duration) -> VadVerdict {
        if !self.settings.enabled {
            return VadVerdict {
                is_speech: true,
                turn_boundary: false,
            };
        }

        let energetic = rms_energy(samples) > self.settings.energy_threshold;

        let is_speech = if energetic {
            self.hangover_left = self.settings.hangover_frames;
            true
        } else if self.hangover_left > 0 {
            self.hangover_left -= 1;
            true
        } else {
            false
        };

        let mut turn_boundary = false;
        if is_speech {
            self.in_turn = true;
            self.silence_elapsed = Duration::ZERO;
        } else if self.in_turn {
            self.silence_elapsed += frame_duration;
            if self.silence_elapsed >= Duration::from_millis(u64::from(self.settings.silence_gap_ms))
            {
                // One boundary per turn; stay quiet until speech resumes.
                self.in_turn = false;
                self.silence_elapsed = Duration::ZERO;
                turn_boundary = true;
            }
        }

        VadVerdict {
            is_speech,
            turn_boundary,
        }
    }
}
