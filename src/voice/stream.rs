//! Lazily streamed audio handle

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, BoxStream, Stream, StreamExt};

use crate::{Error, Result};

/// Playable audio whose bytes are pulled on demand
///
/// Wraps a response body so playback can start before the whole payload
/// has arrived.
pub struct AudioStream {
    content_type: Option<String>,
    body: BoxStream<'static, Result<Bytes>>,
}

impl AudioStream {
    /// Wrap a byte stream
    pub fn new<S>(content_type: Option<String>, body: S) -> Self
    where
        S: Stream<Item = Result<Bytes>> + Send + 'static,
    {
        Self {
            content_type,
            body: body.boxed(),
        }
    }

    /// Wrap an already buffered payload
    pub fn from_bytes(content_type: Option<String>, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self::new(content_type, stream::iter(std::iter::once(Ok(data))))
    }

    /// Fail the stream when no chunk arrives within `idle`
    ///
    /// Slow streams that keep delivering are never cut off; only a stall
    /// longer than `idle` ends the stream, with an `Error::Audio`.
    #[must_use]
    pub fn with_idle_timeout(self, idle: Duration) -> Self {
        let Self { content_type, body } = self;
        let body = stream::unfold(Some(body), move |body| async move {
            let mut body = body?;
            match tokio::time::timeout(idle, body.next()).await {
                Ok(Some(chunk)) => Some((chunk, Some(body))),
                Ok(None) => None,
                Err(_) => {
                    tracing::warn!(idle = ?idle, "audio stream stalled");
                    let message = format!("no audio received for {}ms", idle.as_millis());
                    Some((Err(Error::Audio(message)), None))
                }
            }
        });
        Self::new(content_type, body)
    }

    /// Declared MIME type, if the source provided one
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Pull the next chunk
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes>> {
        self.body.next().await
    }

    /// Drain the stream into a single buffer
    ///
    /// # Errors
    ///
    /// Returns the first error produced by the underlying stream
    pub async fn collect_bytes(mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }
}

impl fmt::Debug for AudioStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioStream")
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}
