//! Remote speech pipeline
//!
//! Each utterance makes three sequential calls: transcribe the captured
//! audio, process the transcript, then synthesize the processed reply.
//! Failures are normalized to [`PipelineError`] tagged with the stage.

mod http;

use async_trait::async_trait;

pub use http::HttpPipeline;

use crate::error::PipelineError;
use crate::voice::AudioStream;

/// Remote transcription, text processing and speech synthesis
#[async_trait]
pub trait Pipeline: Send + Sync {
    /// Transcribe a WAV-encoded utterance
    async fn transcribe(&self, audio: Vec<u8>) -> Result<String, PipelineError>;

    /// Turn a transcript into the assistant's reply
    async fn process_text(&self, text: &str) -> Result<String, PipelineError>;

    /// Synthesize speech for `text`
    ///
    /// The returned stream is pulled lazily so playback can begin while the
    /// body is still arriving.
    async fn synthesize(&self, text: &str) -> Result<AudioStream, PipelineError>;
}
