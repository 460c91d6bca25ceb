//! Conversation state

use std::fmt;

use crate::error::{PipelineError, Stage};
use crate::voice::{CapturedAudio, wav};
use crate::{Error, Result};

/// Turn-taking phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Phase {
    /// Waiting for the voice activity monitor to load
    #[default]
    Idle,
    /// Armed and waiting for the user to speak
    Listening,
    /// User is speaking
    CapturingSpeech,
    /// Utterance is being transcribed or processed
    Processing,
    /// Waiting for synthesized speech
    AwaitingSynthesis,
    /// Assistant response is playing
    AssistantSpeaking,
    /// Session ended
    Stopped,
    /// A failure occurred; recoverable errors re-arm after a delay
    Error,
}

impl Phase {
    /// Stable name used in logs
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::CapturingSpeech => "capturing-speech",
            Self::Processing => "processing",
            Self::AwaitingSynthesis => "awaiting-synthesis",
            Self::AssistantSpeaking => "assistant-speaking",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of a recorded failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Voice activity monitor failed to load
    Init,
    /// Microphone access denied
    Permission,
    /// A remote pipeline stage failed
    Pipeline(Stage),
    /// Audio output failed
    Playback,
}

/// Last failure, kept for status output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDescriptor {
    /// What failed
    pub kind: ErrorKind,
    /// Human-readable reason
    pub message: String,
}

impl ErrorDescriptor {
    /// Create a descriptor
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Pipeline stage, when a remote call failed
    #[must_use]
    pub const fn stage(&self) -> Option<Stage> {
        match self.kind {
            ErrorKind::Pipeline(stage) => Some(stage),
            _ => None,
        }
    }

    /// Whether the failure ends the session
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self.kind, ErrorKind::Init | ErrorKind::Permission)
    }

    /// Short label for the failing component
    #[must_use]
    pub const fn source_label(&self) -> &'static str {
        match self.kind {
            ErrorKind::Init => "vad",
            ErrorKind::Permission => "microphone",
            ErrorKind::Pipeline(stage) => stage.as_str(),
            ErrorKind::Playback => "playback",
        }
    }

    /// Convert back into a crate error
    #[must_use]
    pub fn to_error(&self) -> Error {
        match self.kind {
            ErrorKind::Init => Error::Init(self.message.clone()),
            ErrorKind::Permission => Error::Permission(self.message.clone()),
            ErrorKind::Pipeline(stage) => PipelineError::new(stage, self.message.clone()).into(),
            ErrorKind::Playback => Error::Playback(self.message.clone()),
        }
    }
}

impl From<PipelineError> for ErrorDescriptor {
    fn from(err: PipelineError) -> Self {
        Self::new(ErrorKind::Pipeline(err.stage), err.message)
    }
}

impl fmt::Display for ErrorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.source_label(), self.message)
    }
}

/// State owned by the conversation driver
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationState {
    /// Current phase
    pub phase: Phase,
    /// Whether the voice activity monitor finished loading
    pub vad_ready: bool,
    /// Live utterance; results tagged with any other id are stale
    pub utterance_id: u64,
    /// Most recent transcript
    pub raw_transcript: Option<String>,
    /// Most recent failure
    pub last_error: Option<ErrorDescriptor>,
    /// A stop directive was received; the next playback ends the session
    pub closing: bool,
}

/// One captured utterance, consumed by transcription
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    /// Utterance this audio belongs to
    pub id: u64,
    /// Mono samples in `[-1, 1]`
    pub samples: Vec<f32>,
    /// Sample rate of `samples`
    pub sample_rate: u32,
}

impl Utterance {
    /// Tag captured audio with its utterance id
    #[must_use]
    pub fn new(id: u64, audio: CapturedAudio) -> Self {
        Self {
            id,
            samples: audio.samples,
            sample_rate: audio.sample_rate,
        }
    }

    /// Encode as a 16-bit PCM WAV file
    ///
    /// # Errors
    ///
    /// Returns `Error::EmptyInput` for an utterance without samples
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.samples.is_empty() {
            return Err(Error::EmptyInput);
        }
        wav::encode(&self.samples, self.sample_rate)
    }
}
