//! Audio playback to speakers
//!
//! Synthesized speech arrives as an [`AudioStream`]. WAV bodies are decoded
//! as bytes arrive so playback starts before the download completes; MP3
//! bodies are buffered and decoded once complete.

use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig};
use rubato::{FftFixedIn, Resampler};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::stream::AudioStream;
use crate::{Error, Result};

/// Resolves once playback has finished or failed
pub type PlaybackCompletion = oneshot::Receiver<Result<()>>;

/// Device that plays synthesized speech
pub trait AudioOutput {
    /// Start playing `audio`, superseding any current playback
    ///
    /// Failures to start are reported through the returned completion.
    fn play(&mut self, audio: AudioStream) -> PlaybackCompletion;

    /// Stop the current playback, if any
    fn stop(&mut self);
}

/// Resampler input block size
const RESAMPLE_CHUNK: usize = 1024;

/// Poll interval while waiting for the device to drain queued samples
const DRAIN_POLL: Duration = Duration::from_millis(20);

/// Plays audio to the default output device
pub struct SpeakerOutput {
    device: Device,
    config: StreamConfig,
    rate: f32,
    session: Option<PlaybackSession>,
}

struct PlaybackSession {
    _stream: Stream,
    feeder: JoinHandle<()>,
}

#[derive(Default)]
struct PlaybackQueue {
    samples: VecDeque<f32>,
    failed: Option<String>,
}

impl SpeakerOutput {
    /// Create a new audio playback instance
    ///
    /// `rate` is the playback speed multiplier.
    ///
    /// # Errors
    ///
    /// Returns error if audio device cannot be opened
    pub fn new(rate: f32) -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

        let supported_config = device
            .default_output_config()
            .map_err(|e| Error::Audio(e.to_string()))?;

        if supported_config.sample_format() != cpal::SampleFormat::F32 {
            tracing::warn!(
                format = ?supported_config.sample_format(),
                "output device prefers a non-f32 sample format"
            );
        }

        let config = supported_config.config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = config.sample_rate.0,
            channels = config.channels,
            rate,
            "audio playback initialized"
        );

        Ok(Self {
            device,
            config,
            rate,
            session: None,
        })
    }

    /// Output sample rate of the device
    #[must_use]
    pub const fn device_rate(&self) -> u32 {
        self.config.sample_rate.0
    }
}

impl AudioOutput for SpeakerOutput {
    fn play(&mut self, audio: AudioStream) -> PlaybackCompletion {
        self.stop();

        let (done_tx, done_rx) = oneshot::channel();
        let queue = Arc::new(Mutex::new(PlaybackQueue::default()));
        let channels = usize::from(self.config.channels.max(1));

        let callback_queue = Arc::clone(&queue);
        let error_queue = Arc::clone(&queue);

        let stream = self.device.build_output_stream(
            &self.config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let Ok(mut queue) = callback_queue.lock() else {
                    data.fill(0.0);
                    return;
                };
                for frame in data.chunks_mut(channels) {
                    let sample = queue.samples.pop_front().unwrap_or(0.0);
                    frame.fill(sample);
                }
            },
            move |err| {
                tracing::error!(error = %err, "audio playback error");
                if let Ok(mut queue) = error_queue.lock() {
                    queue.failed = Some(err.to_string());
                }
            },
            None,
        );

        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                done_tx.send(Err(Error::Playback(e.to_string()))).ok();
                return done_rx;
            }
        };

        if let Err(e) = stream.play() {
            done_tx.send(Err(Error::Playback(e.to_string()))).ok();
            return done_rx;
        }

        tracing::debug!(content_type = ?audio.content_type(), "playback started");

        let feeder = tokio::spawn(feed(
            audio,
            queue,
            self.rate,
            self.device_rate(),
            done_tx,
        ));

        self.session = Some(PlaybackSession {
            _stream: stream,
            feeder,
        });

        done_rx
    }

    fn stop(&mut self) {
        if let Some(session) = self.session.take() {
            session.feeder.abort();
            drop(session);
            tracing::debug!("playback stopped");
        }
    }
}

/// Pull, decode and queue the whole stream, then wait for the device to drain
async fn feed(
    mut audio: AudioStream,
    queue: Arc<Mutex<PlaybackQueue>>,
    rate: f32,
    device_rate: u32,
    done: oneshot::Sender<Result<()>>,
) {
    let result = match pump(&mut audio, &queue, rate, device_rate).await {
        Ok(queued) => {
            let drained = drain(&queue).await;
            tracing::debug!(samples = queued, "playback complete");
            drained
        }
        Err(e) => Err(e),
    };
    done.send(result).ok();
}

async fn pump(
    audio: &mut AudioStream,
    queue: &Mutex<PlaybackQueue>,
    rate: f32,
    device_rate: u32,
) -> Result<usize> {
    let mut decoder = StreamDecoder::new();
    let mut converter: Option<RateConverter> = None;
    let mut queued = 0;

    while let Some(chunk) = audio.next_chunk().await {
        let chunk = chunk.map_err(|e| Error::Playback(format!("audio stream failed: {e}")))?;
        let samples = decoder.push(&chunk)?;
        queued += enqueue(queue, &mut converter, &decoder, &samples, rate, device_rate)?;
    }

    let tail = decoder.finish()?;
    queued += enqueue(queue, &mut converter, &decoder, &tail, rate, device_rate)?;

    if let Some(converter) = converter.as_mut() {
        let flushed = converter.flush()?;
        queued += push_queue(queue, flushed)?;
    }

    Ok(queued)
}

fn enqueue(
    queue: &Mutex<PlaybackQueue>,
    converter: &mut Option<RateConverter>,
    decoder: &StreamDecoder,
    samples: &[f32],
    rate: f32,
    device_rate: u32,
) -> Result<usize> {
    if samples.is_empty() {
        return Ok(0);
    }

    if converter.is_none() {
        let source_rate = decoder
            .sample_rate()
            .ok_or_else(|| Error::Playback("audio sample rate unknown".to_string()))?;
        let effective = effective_rate(source_rate, rate);
        tracing::debug!(source_rate, effective, device_rate, "configuring resampler");
        *converter = Some(RateConverter::new(effective, device_rate)?);
    }
    let Some(converter) = converter.as_mut() else {
        return Ok(0);
    };

    let converted = converter.push(samples)?;
    push_queue(queue, converted)
}

fn push_queue(queue: &Mutex<PlaybackQueue>, samples: Vec<f32>) -> Result<usize> {
    let mut queue = queue
        .lock()
        .map_err(|_| Error::Playback("playback queue poisoned".to_string()))?;
    if let Some(message) = queue.failed.take() {
        return Err(Error::Playback(message));
    }
    let count = samples.len();
    queue.samples.extend(samples);
    Ok(count)
}

async fn drain(queue: &Mutex<PlaybackQueue>) -> Result<()> {
    loop {
        {
            let mut queue = queue
                .lock()
                .map_err(|_| Error::Playback("playback queue poisoned".to_string()))?;
            if let Some(message) = queue.failed.take() {
                return Err(Error::Playback(message));
            }
            if queue.samples.is_empty() {
                break;
            }
        }
        tokio::time::sleep(DRAIN_POLL).await;
    }

    // Small delay to ensure audio finishes
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok(())
}

/// Source rate the device should treat the audio as having
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn effective_rate(source_rate: u32, rate: f32) -> u32 {
    ((source_rate as f32) * rate).round().max(1.0) as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Container {
    Unknown,
    Wav,
    Mp3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PcmFormat {
    channels: usize,
    sample_rate: u32,
}

/// Incremental decoder for synthesized speech bodies
///
/// Detects the container from the first bytes. WAV streams yield samples as
/// soon as whole frames are available and ignore the declared data size,
/// which streaming servers leave at zero. Anything else is treated as MP3.
pub struct StreamDecoder {
    container: Container,
    buffer: Vec<u8>,
    format: Option<PcmFormat>,
    in_data: bool,
    mp3_rate: Option<u32>,
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDecoder {
    /// Create a decoder awaiting its first bytes
    #[must_use]
    pub const fn new() -> Self {
        Self {
            container: Container::Unknown,
            buffer: Vec::new(),
            format: None,
            in_data: false,
            mp3_rate: None,
        }
    }

    /// Feed the next chunk, returning any mono samples now decodable
    ///
    /// # Errors
    ///
    /// Returns `Error::Playback` for malformed or unsupported WAV headers
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<f32>> {
        self.buffer.extend_from_slice(chunk);

        if self.container == Container::Unknown {
            if self.buffer.len() < 4 {
                return Ok(Vec::new());
            }
            self.container = if self.buffer.starts_with(b"RIFF") {
                Container::Wav
            } else {
                Container::Mp3
            };
        }

        match self.container {
            Container::Wav => self.decode_wav(),
            Container::Mp3 | Container::Unknown => Ok(Vec::new()),
        }
    }

    /// Signal end of input, returning any remaining samples
    ///
    /// # Errors
    ///
    /// Returns `Error::Playback` if the stream ended mid-header or the MP3
    /// payload holds no frames
    pub fn finish(&mut self) -> Result<Vec<f32>> {
        match self.container {
            Container::Unknown if self.buffer.is_empty() => Ok(Vec::new()),
            Container::Unknown => Err(Error::Playback("audio payload too short".to_string())),
            Container::Wav if !self.in_data => Err(Error::Playback(
                "WAV stream ended before data chunk".to_string(),
            )),
            Container::Wav => {
                self.buffer.clear();
                Ok(Vec::new())
            }
            Container::Mp3 => {
                let data = std::mem::take(&mut self.buffer);
                let (samples, sample_rate) = decode_mp3(&data)?;
                self.mp3_rate = Some(sample_rate);
                Ok(samples)
            }
        }
    }

    /// Sample rate of the decoded audio, once known
    #[must_use]
    pub fn sample_rate(&self) -> Option<u32> {
        self.format.map(|f| f.sample_rate).or(self.mp3_rate)
    }

    fn decode_wav(&mut self) -> Result<Vec<f32>> {
        if !self.in_data && !self.parse_wav_header()? {
            return Ok(Vec::new());
        }

        let format = self
            .format
            .ok_or_else(|| Error::Playback("WAV format missing".to_string()))?;
        let frame_bytes = 2 * format.channels;
        let usable = self.buffer.len() / frame_bytes * frame_bytes;
        let samples = pcm16_to_mono(&self.buffer[..usable], format.channels);
        self.buffer.drain(..usable);
        Ok(samples)
    }

    /// Walk RIFF chunks; returns true once the data chunk is reached
    fn parse_wav_header(&mut self) -> Result<bool> {
        if self.buffer.len() < 12 {
            return Ok(false);
        }
        if !self.buffer[8..].starts_with(b"WAVE") {
            return Err(Error::Playback("RIFF payload is not WAVE".to_string()));
        }

        let mut pos = 12;
        loop {
            let Some(header) = self.buffer.get(pos..pos + 8) else {
                return Ok(false);
            };
            let size = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;

            if header.starts_with(b"data") {
                if self.format.is_none() {
                    return Err(Error::Playback(
                        "WAV data chunk precedes fmt chunk".to_string(),
                    ));
                }
                self.buffer.drain(..pos + 8);
                self.in_data = true;
                return Ok(true);
            }

            let is_fmt = header.starts_with(b"fmt ");
            let body_end = pos + 8 + size;
            let Some(body) = self.buffer.get(pos + 8..body_end) else {
                return Ok(false);
            };
            if is_fmt {
                self.format = Some(parse_fmt(body)?);
            }
            pos = body_end + (size & 1);
        }
    }
}

fn parse_fmt(body: &[u8]) -> Result<PcmFormat> {
    if body.len() < 16 {
        return Err(Error::Playback("WAV fmt chunk truncated".to_string()));
    }

    let tag = u16::from_le_bytes([body[0], body[1]]);
    let channels = u16::from_le_bytes([body[2], body[3]]);
    let sample_rate = u32::from_le_bytes([body[4], body[5], body[6], body[7]]);
    let bits = u16::from_le_bytes([body[14], body[15]]);

    if tag != 1 && tag != 0xFFFE {
        return Err(Error::Playback(format!("unsupported WAV format tag {tag:#06x}")));
    }
    if bits != 16 || channels == 0 {
        return Err(Error::Playback(format!(
            "unsupported WAV layout: {channels} channels, {bits}-bit"
        )));
    }

    Ok(PcmFormat {
        channels: usize::from(channels),
        sample_rate,
    })
}

#[allow(clippy::cast_precision_loss)]
fn pcm16_to_mono(bytes: &[u8], channels: usize) -> Vec<f32> {
    bytes
        .chunks_exact(2 * channels)
        .map(|frame| {
            let sum: f32 = frame
                .chunks_exact(2)
                .map(|s| f32::from(i16::from_le_bytes([s[0], s[1]])) / 32768.0)
                .sum();
            sum / channels as f32
        })
        .collect()
}

/// Decode MP3 bytes to mono f32 samples and their sample rate
fn decode_mp3(mp3_data: &[u8]) -> Result<(Vec<f32>, u32)> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();
    let mut sample_rate = None;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                sample_rate = u32::try_from(frame.sample_rate).ok();
                if frame.channels == 2 {
                    // Stereo: average channels
                    samples.extend(frame.data.chunks(2).map(|chunk| {
                        let left = f32::from(chunk[0]) / 32768.0;
                        let right = f32::from(chunk.get(1).copied().unwrap_or(chunk[0])) / 32768.0;
                        f32::midpoint(left, right)
                    }));
                } else {
                    samples.extend(frame.data.iter().map(|&s| f32::from(s) / 32768.0));
                }
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Playback(format!("MP3 decode error: {e}"))),
        }
    }

    let sample_rate =
        sample_rate.ok_or_else(|| Error::Playback("no MP3 frames decoded".to_string()))?;
    Ok((samples, sample_rate))
}

/// Streaming sample-rate conversion
///
/// Passes samples through untouched when both rates match.
pub struct RateConverter {
    resampler: Option<FftFixedIn<f64>>,
    pending: Vec<f64>,
    from_rate: u32,
    to_rate: u32,
}

impl RateConverter {
    /// Create a converter from `from_rate` to `to_rate`
    ///
    /// # Errors
    ///
    /// Returns error if the resampler cannot be constructed
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self> {
        let resampler = if from_rate == to_rate {
            None
        } else {
            Some(
                FftFixedIn::<f64>::new(
                    from_rate as usize,
                    to_rate as usize,
                    RESAMPLE_CHUNK,
                    2,
                    1,
                )
                .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?,
            )
        };

        Ok(Self {
            resampler,
            pending: Vec::with_capacity(RESAMPLE_CHUNK),
            from_rate,
            to_rate,
        })
    }

    /// Convert a block, holding back any partial resampler chunk
    ///
    /// # Errors
    ///
    /// Returns error if resampling fails
    pub fn push(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(samples.to_vec());
        };

        self.pending.extend(samples.iter().map(|&s| f64::from(s)));

        let mut output = Vec::new();
        while self.pending.len() >= RESAMPLE_CHUNK {
            let chunk: Vec<f64> = self.pending.drain(..RESAMPLE_CHUNK).collect();
            output.extend(process_chunk(resampler, chunk)?);
        }
        Ok(output)
    }

    /// Convert whatever is held back, padding the final chunk with silence
    ///
    /// # Errors
    ///
    /// Returns error if resampling fails
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn flush(&mut self) -> Result<Vec<f32>> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(Vec::new());
        };
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }

        let remaining = self.pending.len();
        let mut chunk = std::mem::take(&mut self.pending);
        chunk.resize(RESAMPLE_CHUNK, 0.0);

        let mut output = process_chunk(resampler, chunk)?;
        let keep = (remaining as f64 * f64::from(self.to_rate) / f64::from(self.from_rate))
            .ceil() as usize;
        output.truncate(keep);
        Ok(output)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn process_chunk(resampler: &mut FftFixedIn<f64>, chunk: Vec<f64>) -> Result<Vec<f32>> {
    let result = resampler
        .process(&[chunk], None)
        .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
    Ok(result
        .into_iter()
        .next()
        .unwrap_or_default()
        .into_iter()
        .map(|s| s as f32)
        .collect())
}
