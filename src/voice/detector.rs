//! Energy-based speech detection
//!
//! Frames are scored by RMS energy relative to a reference level, which gives
//! a speech probability in `[0, 1]`. Boundary decisions follow the usual
//! two-threshold scheme: a frame at or above the positive threshold starts
//! (or sustains) speech, and `redemption_frames` frames below the negative
//! threshold end it.

use std::collections::VecDeque;

use super::vad::RawVadEvent;
use crate::config::VadConfig;

/// Frame-based voice activity detector
pub struct EnergyDetector {
    config: VadConfig,
    pending: Vec<f32>,
    pre_speech: VecDeque<Vec<f32>>,
    speech: Vec<f32>,
    speaking: bool,
    redemption_counter: usize,
    speech_frames: usize,
}

impl EnergyDetector {
    /// Create a detector for the given configuration
    #[must_use]
    pub fn new(config: VadConfig) -> Self {
        Self {
            pending: Vec::with_capacity(config.frame_samples),
            pre_speech: VecDeque::with_capacity(config.pre_speech_pad_frames + 1),
            speech: Vec::new(),
            speaking: false,
            redemption_counter: 0,
            speech_frames: 0,
            config,
        }
    }

    /// Feed an arbitrary block of samples
    ///
    /// Samples are split into frames of `frame_samples`; a trailing partial
    /// frame is kept for the next call.
    pub fn push_samples(&mut self, samples: &[f32]) -> Vec<RawVadEvent> {
        let frame_len = self.config.frame_samples;
        let mut events = Vec::new();
        let mut rest = samples;

        while !rest.is_empty() {
            let take = (frame_len - self.pending.len()).min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if self.pending.len() == frame_len {
                let frame = std::mem::replace(&mut self.pending, Vec::with_capacity(frame_len));
                if let Some(event) = self.process_frame(&frame) {
                    events.push(event);
                }
            }
        }

        events
    }

    /// Process exactly one frame
    pub fn process_frame(&mut self, frame: &[f32]) -> Option<RawVadEvent> {
        let probability = self.speech_probability(frame);
        let positive = probability >= self.config.positive_speech_threshold;
        let negative = probability < self.config.negative_speech_threshold;
        let mut event = None;

        if positive {
            self.redemption_counter = 0;
        }

        if positive && !self.speaking {
            self.speaking = true;
            self.speech_frames = 0;
            self.speech.clear();
            for padded in self.pre_speech.drain(..) {
                self.speech.extend_from_slice(&padded);
            }
            tracing::trace!(probability, "speech start");
            event = Some(RawVadEvent::SpeechStart);
        }

        if self.speaking {
            self.speech.extend_from_slice(frame);
            if positive {
                self.speech_frames += 1;
            }

            if negative {
                self.redemption_counter += 1;
                if self.redemption_counter >= self.config.redemption_frames {
                    return Some(self.finish_segment());
                }
            }
        } else {
            self.pre_speech.push_back(frame.to_vec());
            while self.pre_speech.len() > self.config.pre_speech_pad_frames {
                self.pre_speech.pop_front();
            }
        }

        event
    }

    /// Close the current segment as an utterance or a misfire
    fn finish_segment(&mut self) -> RawVadEvent {
        self.speaking = false;
        self.redemption_counter = 0;
        let speech_frames = std::mem::take(&mut self.speech_frames);
        let audio = std::mem::take(&mut self.speech);

        if speech_frames >= self.config.min_speech_frames {
            tracing::debug!(samples = audio.len(), speech_frames, "speech end");
            RawVadEvent::SpeechEnd(audio)
        } else {
            tracing::debug!(speech_frames, "speech too short, misfire");
            RawVadEvent::Misfire
        }
    }

    /// Map a frame's RMS energy to a speech probability
    #[must_use]
    pub fn speech_probability(&self, frame: &[f32]) -> f32 {
        (calculate_energy(frame) / self.config.energy_reference).clamp(0.0, 1.0)
    }

    /// Whether a speech segment is currently open
    #[must_use]
    pub const fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Drop any partial frame and open segment
    pub fn reset(&mut self) {
        self.pending.clear();
        self.pre_speech.clear();
        self.speech.clear();
        self.speaking = false;
        self.redemption_counter = 0;
        self.speech_frames = 0;
    }
}

/// Calculate RMS energy of audio samples
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn calculate_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}
