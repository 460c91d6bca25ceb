//! Parley - hands-free voice conversation with a remote assistant
//!
//! This library provides the core functionality for Parley:
//! - Voice activity detection over the microphone
//! - WAV encoding of captured utterances
//! - The remote transcribe / process / synthesize pipeline
//! - Turn-taking orchestration with stale-result discard and error recovery
//! - Streaming playback of synthesized speech
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    Voice                            │
//! │   Microphone  │  Energy VAD  │  Speaker playback    │
//! └────────────────────┬────────────────────────────────┘
//!                      │ signals / audio
//! ┌────────────────────▼────────────────────────────────┐
//! │                 Conversation                        │
//! │   Transition function  │  Driver  │  Status         │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │              Speech server (HTTP)                   │
//! │   /transcribe  │  /gemini_process  │  /tts          │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod conversation;
pub mod error;
pub mod pipeline;
pub mod voice;

pub use config::Config;
pub use conversation::{
    Conversation, ConversationHandle, ConversationState, Phase, StatusTag, StatusView,
};
pub use error::{Error, PipelineError, Result, Stage};
pub use pipeline::{HttpPipeline, Pipeline};
