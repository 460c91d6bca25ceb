//! Configuration management for Parley
//!
//! Values resolve with priority env > TOML file > default.

pub mod file;

use std::time::Duration;

use crate::voice::SAMPLE_RATE;
use crate::{Error, Result};

pub use file::ParleyConfigFile;

/// Default backend URL (the reference server listens on port 5000)
pub const DEFAULT_BASE_URL: &str = "http://localhost:5000";

/// Parley configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Remote backend configuration
    pub server: ServerConfig,

    /// Voice activity detection configuration
    pub vad: VadConfig,

    /// Turn-taking configuration
    pub conversation: ConversationConfig,

    /// Audio output configuration
    pub playback: PlaybackConfig,
}

/// Remote backend configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Base URL for the pipeline endpoints
    pub base_url: String,

    /// Timeout for transcribe and process-text requests
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// Voice activity detection configuration
///
/// Thresholds are speech probabilities in `[0, 1]`. Frame counts are in
/// units of `frame_samples` at [`SAMPLE_RATE`].
#[derive(Debug, Clone, PartialEq)]
pub struct VadConfig {
    /// Probability at or above which a frame counts as speech
    pub positive_speech_threshold: f32,

    /// Probability below which a frame counts toward end of speech
    pub negative_speech_threshold: f32,

    /// Trailing non-speech frames required before declaring end of speech
    pub redemption_frames: usize,

    /// Speech frames required for an utterance not to be a misfire
    pub min_speech_frames: usize,

    /// Frames of audio kept from before speech start
    pub pre_speech_pad_frames: usize,

    /// Samples per detector frame
    pub frame_samples: usize,

    /// RMS energy that maps to a speech probability of 1.0
    pub energy_reference: f32,

    /// Target sample rate (fixed to match the detector)
    pub sample_rate: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            positive_speech_threshold: 0.5,
            negative_speech_threshold: 0.35,
            redemption_frames: 8,
            min_speech_frames: 3,
            pre_speech_pad_frames: 1,
            frame_samples: 1536,
            energy_reference: 0.06,
            sample_rate: SAMPLE_RATE,
        }
    }
}

impl VadConfig {
    /// Check thresholds and frame sizes
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first invalid field
    pub fn validate(&self) -> Result<()> {
        let unit = 0.0..=1.0;
        if !unit.contains(&self.positive_speech_threshold)
            || !unit.contains(&self.negative_speech_threshold)
        {
            return Err(Error::Config(
                "vad thresholds must be within [0, 1]".to_string(),
            ));
        }
        if self.negative_speech_threshold > self.positive_speech_threshold {
            return Err(Error::Config(
                "vad negative threshold must not exceed positive threshold".to_string(),
            ));
        }
        if self.frame_samples == 0 {
            return Err(Error::Config("vad frame_samples must be positive".to_string()));
        }
        if self.energy_reference <= 0.0 {
            return Err(Error::Config(
                "vad energy_reference must be positive".to_string(),
            ));
        }
        if self.sample_rate != SAMPLE_RATE {
            return Err(Error::Config(format!(
                "vad sample rate is fixed at {SAMPLE_RATE} Hz"
            )));
        }
        Ok(())
    }
}

/// Turn-taking configuration
#[derive(Debug, Clone)]
pub struct ConversationConfig {
    /// Keyword that ends the conversation when it leads a processed response
    pub stop_keyword: String,

    /// Spoken when the stop directive carries no farewell of its own
    pub farewell: String,

    /// Fixed delay before listening resumes after a failure
    pub error_recovery_delay: Duration,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            stop_keyword: "STOP".to_string(),
            farewell: "Goodbye!".to_string(),
            error_recovery_delay: Duration::from_millis(1500),
        }
    }
}

/// Audio output configuration
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Playback rate multiplier (0.25 to 4.0)
    pub rate: f32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self { rate: 1.0 }
    }
}

impl Config {
    /// Load configuration from the environment and the standard config file
    ///
    /// # Errors
    ///
    /// Returns error if a resolved value is invalid
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file();
        Self::from_sources(fc, |key| std::env::var(key).ok())
    }

    /// Resolve configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if an environment value cannot be parsed or a resolved
    /// value is out of range
    pub fn from_sources<F>(fc: ParleyConfigFile, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        // Server config (env > toml > default)
        let server = ServerConfig {
            base_url: env("PARLEY_SERVER_URL")
                .or(fc.server.base_url)
                .unwrap_or(defaults.server.base_url)
                .trim_end_matches('/')
                .to_string(),
            request_timeout: parse_env::<u64>(&env, "PARLEY_REQUEST_TIMEOUT")?
                .or(fc.server.request_timeout_secs)
                .map_or(defaults.server.request_timeout, Duration::from_secs),
        };

        if server.base_url.is_empty() {
            return Err(Error::Config("server base URL is empty".to_string()));
        }

        // VAD config (env > toml > default)
        let vad = VadConfig {
            positive_speech_threshold: parse_env(&env, "PARLEY_VAD_POSITIVE")?
                .or(fc.vad.positive_speech_threshold)
                .unwrap_or(defaults.vad.positive_speech_threshold),
            negative_speech_threshold: parse_env(&env, "PARLEY_VAD_NEGATIVE")?
                .or(fc.vad.negative_speech_threshold)
                .unwrap_or(defaults.vad.negative_speech_threshold),
            redemption_frames: parse_env(&env, "PARLEY_VAD_REDEMPTION_FRAMES")?
                .or(fc.vad.redemption_frames)
                .unwrap_or(defaults.vad.redemption_frames),
            min_speech_frames: fc
                .vad
                .min_speech_frames
                .unwrap_or(defaults.vad.min_speech_frames),
            pre_speech_pad_frames: fc
                .vad
                .pre_speech_pad_frames
                .unwrap_or(defaults.vad.pre_speech_pad_frames),
            frame_samples: fc.vad.frame_samples.unwrap_or(defaults.vad.frame_samples),
            energy_reference: fc
                .vad
                .energy_reference
                .unwrap_or(defaults.vad.energy_reference),
            sample_rate: SAMPLE_RATE,
        };
        vad.validate()?;

        // Conversation config (env > toml > default)
        let conversation = ConversationConfig {
            stop_keyword: env("PARLEY_STOP_KEYWORD")
                .or(fc.conversation.stop_keyword)
                .unwrap_or(defaults.conversation.stop_keyword),
            farewell: fc
                .conversation
                .farewell
                .unwrap_or(defaults.conversation.farewell),
            error_recovery_delay: parse_env::<u64>(&env, "PARLEY_RECOVERY_DELAY_MS")?
                .or(fc.conversation.error_recovery_delay_ms)
                .map_or(
                    defaults.conversation.error_recovery_delay,
                    Duration::from_millis,
                ),
        };

        if conversation.stop_keyword.trim().is_empty() {
            return Err(Error::Config("stop keyword is empty".to_string()));
        }

        let playback = PlaybackConfig {
            rate: parse_env(&env, "PARLEY_PLAYBACK_RATE")?
                .or(fc.playback.rate)
                .unwrap_or(defaults.playback.rate),
        };

        if !(0.25..=4.0).contains(&playback.rate) {
            return Err(Error::Config(format!(
                "playback rate {} outside 0.25..=4.0",
                playback.rate
            )));
        }

        Ok(Self {
            server,
            vad,
            conversation,
            playback,
        })
    }
}

/// Parse an optional environment value
fn parse_env<T>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    env(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| Error::Config(format!("invalid {key}={raw}: {e}")))
        })
        .transpose()
}
