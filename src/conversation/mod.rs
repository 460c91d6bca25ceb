//! Turn-taking orchestration
//!
//! ```text
//!  Idle ──ready──▶ Listening ──speech──▶ CapturingSpeech ──end──▶ Processing
//!                     ▲                                              │
//!                     │                                        transcribe,
//!                     │                                        process text
//!                     │                                              ▼
//!                     └──played── AssistantSpeaking ◀──audio── AwaitingSynthesis
//! ```
//!
//! Any recoverable failure parks the conversation in `Error` and re-arms
//! listening after a fixed delay.

mod driver;
mod machine;
mod state;
mod status;

pub use driver::{Conversation, ConversationHandle};
pub use machine::{Effect, Event, TurnPolicy, transition};
pub use state::{ConversationState, ErrorDescriptor, ErrorKind, Phase, Utterance};
pub use status::{Status, StatusTag, StatusView, status_for};
