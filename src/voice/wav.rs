//! PCM WAV encoding for captured utterances

use std::io::Cursor;

use crate::{Error, Result};

/// Size of the canonical PCM WAV header written by [`encode`]
pub const WAV_HEADER_LEN: usize = 44;

/// Encode normalized f32 samples as mono 16-bit PCM WAV
///
/// Samples outside `[-1.0, 1.0]` are clamped. Negative samples scale by
/// 32768 and positive ones by 32767, so both extremes map without overflow.
/// Empty input yields a header-only file.
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn encode(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::with_capacity(WAV_HEADER_LEN + samples.len() * 2));
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            writer
                .write_sample(quantize(sample))
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

/// Map one normalized sample to a signed 16-bit value
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn quantize(sample: f32) -> i16 {
    let s = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    let scaled = if s < 0.0 { s * 32768.0 } else { s * 32767.0 };
    scaled.round() as i16
}

/// Decode 16-bit PCM WAV bytes into normalized mono samples
///
/// Multi-channel input is averaged down to mono.
///
/// # Errors
///
/// Returns error if the bytes are not a 16-bit integer WAV file
pub fn decode(bytes: &[u8]) -> Result<(Vec<f32>, u32)> {
    let mut reader =
        hound::WavReader::new(Cursor::new(bytes)).map_err(|e| Error::Audio(e.to_string()))?;
    let spec = reader.spec();

    if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
        return Err(Error::Audio(format!(
            "unsupported WAV format: {:?} {}-bit",
            spec.sample_format, spec.bits_per_sample
        )));
    }

    let raw: Vec<i16> = reader
        .samples::<i16>()
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| Error::Audio(e.to_string()))?;

    let channels = usize::from(spec.channels.max(1));
    #[allow(clippy::cast_precision_loss)]
    let samples = raw
        .chunks(channels)
        .map(|frame| {
            let sum: f32 = frame.iter().map(|&s| f32::from(s) / 32768.0).sum();
            sum / frame.len() as f32
        })
        .collect();

    Ok((samples, spec.sample_rate))
}
