//! Observable conversation status

use std::fmt;

use super::state::{ConversationState, Phase};

/// Coarse status category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusTag {
    Idle,
    Listening,
    Speaking,
    Processing,
    AiSpeaking,
    Error,
}

impl StatusTag {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Speaking => "speaking",
            Self::Processing => "processing",
            Self::AiSpeaking => "ai-speaking",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for StatusTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Human-readable status for one phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub label: &'static str,
    pub tag: StatusTag,
}

/// Map a phase to its status
#[must_use]
pub const fn status_for(phase: Phase) -> Status {
    let (label, tag) = match phase {
        Phase::Idle => ("Initializing…", StatusTag::Idle),
        Phase::Listening => ("Listening…", StatusTag::Listening),
        Phase::CapturingSpeech => ("Hearing you…", StatusTag::Speaking),
        Phase::Processing => ("Thinking…", StatusTag::Processing),
        Phase::AwaitingSynthesis => ("Preparing reply…", StatusTag::Processing),
        Phase::AssistantSpeaking => ("Speaking…", StatusTag::AiSpeaking),
        Phase::Stopped => ("Stopped", StatusTag::Idle),
        Phase::Error => ("Something went wrong", StatusTag::Error),
    };
    Status { label, tag }
}

/// Status published after every transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusView {
    pub phase: Phase,
    pub status: Status,
    /// Last error, rendered as `component: message`
    pub detail: Option<String>,
}

impl StatusView {
    /// Project the current state
    #[must_use]
    pub fn project(state: &ConversationState) -> Self {
        Self {
            phase: state.phase,
            status: status_for(state.phase),
            detail: state.last_error.as_ref().map(ToString::to_string),
        }
    }

    #[must_use]
    pub const fn tag(&self) -> StatusTag {
        self.status.tag
    }
}

impl Default for StatusView {
    fn default() -> Self {
        Self::project(&ConversationState::default())
    }
}

impl fmt::Display for StatusView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.status.tag, self.status.label)?;
        if let Some(detail) = &self.detail {
            write!(f, " ({detail})")?;
        }
        Ok(())
    }
}
