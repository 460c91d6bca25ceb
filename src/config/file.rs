//! TOML configuration file loading
//!
//! Supports `~/.config/parley/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct ParleyConfigFile {
    /// Remote backend configuration
    #[serde(default)]
    pub server: ServerFileConfig,

    /// Voice activity detection tuning
    #[serde(default)]
    pub vad: VadFileConfig,

    /// Turn-taking behaviour
    #[serde(default)]
    pub conversation: ConversationFileConfig,

    /// Audio output configuration
    #[serde(default)]
    pub playback: PlaybackFileConfig,
}

/// Remote backend configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    /// Base URL serving `/transcribe`, `/gemini_process` and `/tts`
    pub base_url: Option<String>,

    /// Timeout for the transcribe and process-text calls
    pub request_timeout_secs: Option<u64>,
}

/// Voice activity detection tuning
#[derive(Debug, Default, Deserialize)]
pub struct VadFileConfig {
    pub positive_speech_threshold: Option<f32>,
    pub negative_speech_threshold: Option<f32>,
    pub redemption_frames: Option<usize>,
    pub min_speech_frames: Option<usize>,
    pub pre_speech_pad_frames: Option<usize>,
    pub frame_samples: Option<usize>,
    pub energy_reference: Option<f32>,
}

/// Turn-taking configuration
#[derive(Debug, Default, Deserialize)]
pub struct ConversationFileConfig {
    /// Keyword that ends the conversation when it leads a response
    pub stop_keyword: Option<String>,

    /// Line spoken when the stop directive carries no text of its own
    pub farewell: Option<String>,

    /// Delay before listening resumes after a failure
    pub error_recovery_delay_ms: Option<u64>,
}

/// Audio output configuration
#[derive(Debug, Default, Deserialize)]
pub struct PlaybackFileConfig {
    /// Playback rate multiplier
    pub rate: Option<f32>,
}

/// Load the TOML config file from the standard path
///
/// Returns `ParleyConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> ParleyConfigFile {
    config_file_path().map_or_else(ParleyConfigFile::default, |path| load_config_file_from(&path))
}

/// Load a TOML config file from an explicit path
///
/// Missing or malformed files fall back to defaults.
pub fn load_config_file_from(path: &Path) -> ParleyConfigFile {
    if !path.exists() {
        return ParleyConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                ParleyConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            ParleyConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/parley/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("parley").join("config.toml"))
}
