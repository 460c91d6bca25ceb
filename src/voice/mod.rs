//! Voice processing module
//!
//! Handles microphone capture, voice activity detection, WAV encoding and
//! playback of synthesized speech.

mod capture;
mod detector;
mod microphone;
mod playback;
mod stream;
mod vad;
pub mod wav;

pub use capture::{AudioCapture, SAMPLE_RATE};
pub use detector::{EnergyDetector, calculate_energy};
pub use microphone::MicrophoneVad;
pub use playback::{
    AudioOutput, PlaybackCompletion, RateConverter, SpeakerOutput, StreamDecoder, effective_rate,
};
pub use stream::AudioStream;
pub use vad::{CapturedAudio, RawVadEvent, VadBackend, VadMonitor, VadSignal};
