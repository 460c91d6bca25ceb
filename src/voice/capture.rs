//! Audio capture from microphone

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BuildStreamError, Device, PlayStreamError, SampleFormat, Stream, StreamConfig};

use super::playback::RateConverter;
use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Captures audio from the default input device
///
/// The device runs at its own default configuration; captured blocks are
/// downmixed to mono and resampled to [`SAMPLE_RATE`] before delivery.
/// The input stream is built once by [`AudioCapture::open`] and then paused
/// and resumed, so the device stays acquired between utterances.
pub struct AudioCapture {
    device: Device,
    config: StreamConfig,
    sample_format: SampleFormat,
    stream: Option<Stream>,
}

impl AudioCapture {
    /// Create a new audio capture instance
    ///
    /// # Errors
    ///
    /// Returns error if audio device cannot be opened
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Audio("no input device available".to_string()))?;

        let supported_config = device
            .default_input_config()
            .map_err(|e| Error::Audio(e.to_string()))?;
        let sample_format = supported_config.sample_format();
        let config = supported_config.config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            device_rate = config.sample_rate.0,
            channels = config.channels,
            format = ?sample_format,
            "audio capture initialized"
        );

        Ok(Self {
            device,
            config,
            sample_format,
            stream: None,
        })
    }

    /// Build the input stream, delivering 16 kHz mono blocks to `on_samples`
    ///
    /// The stream starts paused. No-op if already open.
    ///
    /// # Errors
    ///
    /// Returns `Error::Permission` if the device refuses access, otherwise
    /// `Error::Audio`
    pub fn open<F>(&mut self, mut on_samples: F) -> Result<()>
    where
        F: FnMut(&[f32]) + Send + 'static,
    {
        if self.stream.is_some() {
            return Ok(());
        }

        let channels = usize::from(self.config.channels.max(1));
        let mut converter = RateConverter::new(self.config.sample_rate.0, SAMPLE_RATE)?;
        let mut deliver = move |mono: Vec<f32>| match converter.push(&mono) {
            Ok(samples) if !samples.is_empty() => on_samples(&samples),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "dropping captured block"),
        };
        let on_error = |err: cpal::StreamError| {
            tracing::error!(error = %err, "audio capture error");
        };

        let stream = match self.sample_format {
            SampleFormat::F32 => self.device.build_input_stream(
                &self.config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    deliver(downmix(data, channels));
                },
                on_error,
                None,
            ),
            SampleFormat::I16 => self.device.build_input_stream(
                &self.config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    let data: Vec<f32> = data.iter().map(|&s| f32::from(s) / 32768.0).collect();
                    deliver(downmix(&data, channels));
                },
                on_error,
                None,
            ),
            other => {
                return Err(Error::Audio(format!(
                    "unsupported input sample format {other:?}"
                )));
            }
        }
        .map_err(|e| build_error(&e))?;

        // Some hosts start streams on build
        if let Err(e) = stream.pause() {
            tracing::trace!(error = %e, "input stream could not be paused after build");
        }

        self.stream = Some(stream);
        tracing::debug!("audio capture opened");
        Ok(())
    }

    /// Resume delivering samples
    ///
    /// # Errors
    ///
    /// Returns `Error::Permission` if the device refuses access, otherwise
    /// `Error::Audio`
    pub fn resume(&self) -> Result<()> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| Error::Audio("capture stream not open".to_string()))?;
        stream
            .play()
            .map_err(|e| play_error(&e))?;
        tracing::debug!("audio capture started");
        Ok(())
    }

    /// Pause delivery without releasing the device
    pub fn pause(&self) {
        if let Some(stream) = &self.stream {
            if let Err(e) = stream.pause() {
                tracing::warn!(error = %e, "failed to pause audio capture");
            } else {
                tracing::debug!("audio capture paused");
            }
        }
    }

    /// Release the input stream
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            tracing::debug!("audio capture stopped");
        }
    }

    /// Check if the input stream is open
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Get the sample rate
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }
}

/// Average interleaved frames down to one channel
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

fn build_error(err: &BuildStreamError) -> Error {
    let refused = match err {
        BuildStreamError::DeviceNotAvailable => true,
        BuildStreamError::BackendSpecific { err } => is_access_denial(&err.description),
        _ => false,
    };
    device_error("microphone unavailable", err, refused)
}

fn play_error(err: &PlayStreamError) -> Error {
    let refused = match err {
        PlayStreamError::DeviceNotAvailable => true,
        PlayStreamError::BackendSpecific { err } => is_access_denial(&err.description),
    };
    device_error("microphone refused to start", err, refused)
}

fn device_error(context: &str, err: &impl std::fmt::Display, refused: bool) -> Error {
    if refused {
        Error::Permission(format!("{context}: {err}"))
    } else {
        Error::Audio(format!("{context}: {err}"))
    }
}

fn is_access_denial(description: &str) -> bool {
    let description = description.to_ascii_lowercase();
    ["permission", "denied", "not authorized", "access"]
        .iter()
        .any(|needle| description.contains(needle))
}
