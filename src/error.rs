//! Error types for Parley

use std::fmt;

use thiserror::Error;

/// Result type alias for Parley operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Parley
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio device or codec error
    #[error("audio error: {0}")]
    Audio(String),

    /// Voice activity detector could not be loaded
    #[error("vad init error: {0}")]
    Init(String),

    /// Microphone access denied
    #[error("permission error: {0}")]
    Permission(String),

    /// Remote pipeline stage failed
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// Audio output failed while playing a response
    #[error("playback error: {0}")]
    Playback(String),

    /// Captured utterance contained no audio
    #[error("empty input: captured utterance has no samples")]
    EmptyInput,

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Whether the error ends the session instead of triggering a re-arm
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Init(_) | Self::Permission(_))
    }
}

/// Remote pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// `POST /transcribe`
    Transcribe,
    /// `POST /gemini_process`
    ProcessText,
    /// `GET /tts`
    Synthesize,
}

impl Stage {
    /// Stable lowercase name used in logs and status output
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transcribe => "transcribe",
            Self::ProcessText => "process-text",
            Self::Synthesize => "synthesize",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a single pipeline call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{stage} failed: {message}")]
pub struct PipelineError {
    /// Stage that failed
    pub stage: Stage,
    /// Human-readable reason, taken from the remote body when structured
    pub message: String,
}

impl PipelineError {
    /// Create a new pipeline error
    pub fn new(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_names() {
        assert_eq!(Stage::Transcribe.to_string(), "transcribe");
        assert_eq!(Stage::ProcessText.to_string(), "process-text");
        assert_eq!(Stage::Synthesize.to_string(), "synthesize");
    }

    #[test]
    fn pipeline_error_display() {
        let err = PipelineError::new(Stage::Transcribe, "500 Internal Server Error");
        assert_eq!(err.to_string(), "transcribe failed: 500 Internal Server Error");

        let wrapped = Error::from(err);
        assert!(!wrapped.is_fatal());
    }

    #[test]
    fn fatal_errors() {
        assert!(Error::Init("model missing".to_string()).is_fatal());
        assert!(Error::Permission("denied".to_string()).is_fatal());
        assert!(!Error::Playback("device lost".to_string()).is_fatal());
        assert!(!Error::EmptyInput.is_fatal());
    }
}
