//! HTTP pipeline client

use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};

use super::Pipeline;
use crate::config::ServerConfig;
use crate::error::{PipelineError, Stage};
use crate::voice::AudioStream;
use crate::{Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// [`Pipeline`] backed by the speech server's HTTP endpoints
///
/// - `POST /transcribe` (multipart `file`) returns `{"transcript"}`
/// - `POST /gemini_process` (`{"text"}`) returns `{"processed_text"}`
/// - `GET /tts?text=` streams audio
///
/// Any endpoint may answer `{"error"}` instead.
#[derive(Clone)]
pub struct HttpPipeline {
    client: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
}

#[derive(Deserialize)]
struct TranscribeResponse {
    transcript: Option<String>,
    error: Option<String>,
}

#[derive(Serialize)]
struct ProcessRequest<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct ProcessResponse {
    processed_text: Option<String>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

impl HttpPipeline {
    /// Create a client for the configured server
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            request_timeout: config.request_timeout,
        })
    }

    /// Base URL requests are sent to
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }
}

#[async_trait]
impl Pipeline for HttpPipeline {
    async fn transcribe(&self, audio: Vec<u8>) -> std::result::Result<String, PipelineError> {
        let stage = Stage::Transcribe;
        tracing::debug!(bytes = audio.len(), "sending audio for transcription");

        let part = reqwest::multipart::Part::bytes(audio)
            .file_name("recording.wav")
            .mime_str("audio/wav")
            .map_err(|e| PipelineError::new(stage, e.to_string()))?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .client
            .post(self.url("transcribe"))
            .timeout(self.request_timeout)
            .multipart(form)
            .send()
            .await
            .map_err(|e| transport_error(stage, &e))?;

        let response = check_status(stage, response).await?;
        let body: TranscribeResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::new(stage, format!("invalid response: {e}")))?;

        if let Some(error) = body.error {
            return Err(PipelineError::new(stage, error));
        }
        let transcript = body
            .transcript
            .ok_or_else(|| PipelineError::new(stage, "response missing transcript"))?;

        tracing::debug!(chars = transcript.len(), "transcription received");
        Ok(transcript)
    }

    async fn process_text(&self, text: &str) -> std::result::Result<String, PipelineError> {
        let stage = Stage::ProcessText;
        tracing::debug!(chars = text.len(), "sending transcript for processing");

        let response = self
            .client
            .post(self.url("gemini_process"))
            .timeout(self.request_timeout)
            .json(&ProcessRequest { text })
            .send()
            .await
            .map_err(|e| transport_error(stage, &e))?;

        let response = check_status(stage, response).await?;
        let body: ProcessResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::new(stage, format!("invalid response: {e}")))?;

        if let Some(error) = body.error {
            return Err(PipelineError::new(stage, error));
        }
        body.processed_text
            .ok_or_else(|| PipelineError::new(stage, "response missing processed_text"))
    }

    async fn synthesize(&self, text: &str) -> std::result::Result<AudioStream, PipelineError> {
        let stage = Stage::Synthesize;
        let url = format!("{}?text={}", self.url("tts"), urlencoding::encode(text));
        tracing::debug!(chars = text.len(), "requesting speech synthesis");

        // Only the wait for a response is bounded; the body may stream for
        // as long as it keeps arriving
        let request = async {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| transport_error(stage, &e))?;
            check_status(stage, response).await
        };
        let response = tokio::time::timeout(self.request_timeout, request)
            .await
            .map_err(|_| timeout_error(stage, self.request_timeout))??;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);

        let body = response.bytes_stream().map_err(Error::from);
        let audio = AudioStream::new(content_type, body);
        Ok(audio.with_idle_timeout(self.request_timeout))
    }
}

fn transport_error(stage: Stage, err: &reqwest::Error) -> PipelineError {
    tracing::warn!(stage = %stage, error = %err, "pipeline request failed");
    PipelineError::new(stage, err.to_string())
}

fn timeout_error(stage: Stage, timeout: Duration) -> PipelineError {
    tracing::warn!(stage = %stage, timeout = ?timeout, "pipeline request timed out");
    PipelineError::new(stage, format!("no response within {}ms", timeout.as_millis()))
}

/// Pass successful responses through; turn others into a [`PipelineError`]
///
/// The message is the `error` field of a JSON body when present, otherwise
/// the HTTP status.
async fn check_status(
    stage: Stage,
    response: reqwest::Response,
) -> std::result::Result<reqwest::Response, PipelineError> {
    let status = response.status();
    tracing::debug!(stage = %stage, status = %status, "received response");

    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = error_message(&body).unwrap_or_else(|| status.to_string());
    tracing::warn!(stage = %stage, status = %status, message = %message, "pipeline stage error");
    Err(PipelineError::new(stage, message))
}

fn error_message(body: &str) -> Option<String> {
    serde_json::from_str::<ErrorBody>(body)
        .ok()
        .map(|b| b.error)
        .filter(|e| !e.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_message_prefers_json_body() {
        assert_eq!(
            error_message(r#"{"error": "no audio file"}"#),
            Some("no audio file".to_string())
        );
        assert_eq!(error_message("<html>oops</html>"), None);
        assert_eq!(error_message(r#"{"error": ""}"#), None);
        assert_eq!(error_message(""), None);
    }

    #[test]
    fn base_url_is_normalized() {
        let pipeline = HttpPipeline::new(&ServerConfig {
            base_url: "http://localhost:5000/".to_string(),
            request_timeout: Duration::from_secs(5),
        })
        .unwrap();
        assert_eq!(pipeline.base_url(), "http://localhost:5000");
        assert_eq!(pipeline.url("tts"), "http://localhost:5000/tts");
    }
}
