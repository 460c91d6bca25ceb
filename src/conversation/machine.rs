//! Turn-taking transition function
//!
//! [`transition`] is pure: it consumes the current state and one event and
//! returns the next state plus the effects the driver must execute. All
//! asynchronous work reports back as another [`Event`].

use std::time::Duration;

use super::state::{ConversationState, ErrorDescriptor, ErrorKind, Phase, Utterance};
use crate::config::ConversationConfig;
use crate::error::PipelineError;
use crate::voice::{AudioStream, CapturedAudio, VadSignal};

/// Input to the state machine
#[derive(Debug)]
pub enum Event {
    /// Voice activity monitor finished loading
    VadReady,
    /// Voice activity monitor failed to load
    VadFailed(String),
    /// Microphone access denied while arming
    PermissionDenied(String),
    /// User started speaking
    SpeechStarted,
    /// User stopped speaking
    SpeechEnded(CapturedAudio),
    /// Detected boundary was not speech
    Misfire,
    /// Transcription finished
    Transcribed { utterance_id: u64, text: String },
    /// Text processing finished
    Processed { utterance_id: u64, text: String },
    /// Synthesized speech is ready to stream
    Synthesized {
        utterance_id: u64,
        audio: AudioStream,
    },
    /// A remote stage failed
    StageFailed {
        utterance_id: u64,
        error: PipelineError,
    },
    /// Response playback completed
    PlaybackEnded { utterance_id: u64 },
    /// Response playback failed
    PlaybackFailed { utterance_id: u64, message: String },
    /// Recovery delay elapsed
    RearmDue { utterance_id: u64 },
    /// External stop request
    StopRequested,
}

impl From<VadSignal> for Event {
    fn from(signal: VadSignal) -> Self {
        match signal {
            VadSignal::SpeechStarted => Self::SpeechStarted,
            VadSignal::SpeechEnded(audio) => Self::SpeechEnded(audio),
            VadSignal::Misfire => Self::Misfire,
        }
    }
}

impl Event {
    /// Short name for logs
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::VadReady => "vad-ready",
            Self::VadFailed(_) => "vad-failed",
            Self::PermissionDenied(_) => "permission-denied",
            Self::SpeechStarted => "speech-started",
            Self::SpeechEnded(_) => "speech-ended",
            Self::Misfire => "misfire",
            Self::Transcribed { .. } => "transcribed",
            Self::Processed { .. } => "processed",
            Self::Synthesized { .. } => "synthesized",
            Self::StageFailed { .. } => "stage-failed",
            Self::PlaybackEnded { .. } => "playback-ended",
            Self::PlaybackFailed { .. } => "playback-failed",
            Self::RearmDue { .. } => "rearm-due",
            Self::StopRequested => "stop-requested",
        }
    }
}

/// Work requested by a transition
#[derive(Debug)]
pub enum Effect {
    /// Start forwarding microphone audio
    ArmVad,
    /// Pause forwarding microphone audio
    DisarmVad,
    /// Release the voice activity monitor
    TeardownVad,
    /// Encode and transcribe an utterance
    Transcribe(Utterance),
    /// Process a transcript
    ProcessText { utterance_id: u64, text: String },
    /// Synthesize a reply
    Synthesize { utterance_id: u64, text: String },
    /// Play synthesized speech
    StartPlayback {
        utterance_id: u64,
        audio: AudioStream,
    },
    /// Halt any playback in progress
    StopPlayback,
    /// Post [`Event::RearmDue`] after `delay`
    ScheduleRearm { utterance_id: u64, delay: Duration },
}

/// Conversation rules that come from configuration
#[derive(Debug, Clone)]
pub struct TurnPolicy {
    /// Leading keyword that ends the conversation
    pub stop_keyword: String,
    /// Spoken when a stop directive has no text of its own
    pub farewell: String,
    /// Delay before listening resumes after a recoverable failure
    pub recovery_delay: Duration,
}

impl Default for TurnPolicy {
    fn default() -> Self {
        Self::from(&ConversationConfig::default())
    }
}

impl From<&ConversationConfig> for TurnPolicy {
    fn from(config: &ConversationConfig) -> Self {
        Self {
            stop_keyword: config.stop_keyword.trim().to_string(),
            farewell: config.farewell.clone(),
            recovery_delay: config.error_recovery_delay,
        }
    }
}

impl TurnPolicy {
    /// Check a processed reply for a stop directive
    ///
    /// Returns the farewell to speak: whatever follows the keyword, or the
    /// configured farewell when nothing does. The keyword matches
    /// case-insensitively and must end at a word boundary.
    #[must_use]
    pub fn stop_directive(&self, text: &str) -> Option<String> {
        let trimmed = text.trim();
        let keyword = self.stop_keyword.as_str();
        if keyword.is_empty() {
            return None;
        }

        let head = trimmed.get(..keyword.len())?;
        if head.to_lowercase() != keyword.to_lowercase() {
            return None;
        }

        let rest = &trimmed[keyword.len()..];
        if rest.chars().next().is_some_and(char::is_alphanumeric) {
            return None;
        }

        let farewell = rest
            .trim_start_matches(|c: char| c.is_whitespace() || c.is_ascii_punctuation())
            .trim();
        Some(if farewell.is_empty() {
            self.farewell.clone()
        } else {
            farewell.to_string()
        })
    }
}

/// Apply one event
#[must_use]
pub fn transition(
    mut state: ConversationState,
    event: Event,
    policy: &TurnPolicy,
) -> (ConversationState, Vec<Effect>) {
    let mut effects = Vec::new();

    if state.phase == Phase::Stopped {
        return (state, effects);
    }

    // A fatal error only yields to an explicit stop
    if state.phase == Phase::Error
        && state.last_error.as_ref().is_some_and(ErrorDescriptor::is_fatal)
        && !matches!(event, Event::StopRequested)
    {
        return (state, effects);
    }

    match event {
        Event::VadReady => {
            state.vad_ready = true;
            if state.phase == Phase::Idle {
                state.phase = Phase::Listening;
                state.last_error = None;
                effects.push(Effect::ArmVad);
            }
        }

        Event::VadFailed(message) => {
            state.vad_ready = false;
            state.phase = Phase::Error;
            state.last_error = Some(ErrorDescriptor::new(ErrorKind::Init, message));
        }

        Event::PermissionDenied(message) => {
            state.phase = Phase::Error;
            state.last_error = Some(ErrorDescriptor::new(ErrorKind::Permission, message));
            state.vad_ready = false;
            effects.push(Effect::TeardownVad);
        }

        Event::SpeechStarted => {
            // Barge-in is suppressed: only a listening conversation reacts
            if state.phase == Phase::Listening {
                state.utterance_id += 1;
                state.phase = Phase::CapturingSpeech;
            }
        }

        Event::SpeechEnded(audio) => {
            if matches!(state.phase, Phase::Listening | Phase::CapturingSpeech) {
                if state.phase == Phase::Listening {
                    // Start was never observed
                    state.utterance_id += 1;
                }
                if audio.samples.is_empty() {
                    state.phase = Phase::Listening;
                } else {
                    state.phase = Phase::Processing;
                    effects.push(Effect::DisarmVad);
                    effects.push(Effect::Transcribe(Utterance::new(state.utterance_id, audio)));
                }
            }
        }

        Event::Misfire => {
            if matches!(state.phase, Phase::Listening | Phase::CapturingSpeech) {
                state.phase = Phase::Listening;
            }
        }

        Event::Transcribed { utterance_id, text } => {
            if is_live(&state, utterance_id, Phase::Processing) {
                if text.trim().is_empty() {
                    state.raw_transcript = Some(text);
                    state.phase = Phase::Listening;
                    state.last_error = None;
                    effects.push(Effect::ArmVad);
                } else {
                    state.raw_transcript = Some(text.clone());
                    effects.push(Effect::ProcessText { utterance_id, text });
                }
            }
        }

        Event::Processed { utterance_id, text } => {
            if is_live(&state, utterance_id, Phase::Processing) {
                if let Some(farewell) = policy.stop_directive(&text) {
                    state.closing = true;
                    state.phase = Phase::AwaitingSynthesis;
                    effects.push(Effect::Synthesize {
                        utterance_id,
                        text: farewell,
                    });
                } else if text.trim().is_empty() {
                    state.phase = Phase::Listening;
                    state.last_error = None;
                    effects.push(Effect::ArmVad);
                } else {
                    state.phase = Phase::AwaitingSynthesis;
                    effects.push(Effect::Synthesize { utterance_id, text });
                }
            }
        }

        Event::Synthesized {
            utterance_id,
            audio,
        } => {
            if is_live(&state, utterance_id, Phase::AwaitingSynthesis) {
                state.phase = Phase::AssistantSpeaking;
                effects.push(Effect::StartPlayback {
                    utterance_id,
                    audio,
                });
            }
        }

        Event::StageFailed {
            utterance_id,
            error,
        } => {
            if state.utterance_id == utterance_id
                && matches!(state.phase, Phase::Processing | Phase::AwaitingSynthesis)
            {
                recover(&mut state, error.into(), policy, &mut effects);
            }
        }

        Event::PlaybackEnded { utterance_id } => {
            if is_live(&state, utterance_id, Phase::AssistantSpeaking) {
                if state.closing {
                    state.phase = Phase::Stopped;
                    state.vad_ready = false;
                    effects.push(Effect::TeardownVad);
                } else {
                    state.phase = Phase::Listening;
                    state.last_error = None;
                    effects.push(Effect::ArmVad);
                }
            }
        }

        Event::PlaybackFailed {
            utterance_id,
            message,
        } => {
            if is_live(&state, utterance_id, Phase::AssistantSpeaking) {
                effects.push(Effect::StopPlayback);
                recover(
                    &mut state,
                    ErrorDescriptor::new(ErrorKind::Playback, message),
                    policy,
                    &mut effects,
                );
            }
        }

        Event::RearmDue { utterance_id } => {
            if is_live(&state, utterance_id, Phase::Error) {
                state.phase = Phase::Listening;
                effects.push(Effect::ArmVad);
            }
        }

        Event::StopRequested => {
            state.phase = Phase::Stopped;
            state.vad_ready = false;
            effects.push(Effect::StopPlayback);
            effects.push(Effect::TeardownVad);
        }
    }

    (state, effects)
}

fn is_live(state: &ConversationState, utterance_id: u64, phase: Phase) -> bool {
    state.utterance_id == utterance_id && state.phase == phase
}

/// Record a recoverable failure and schedule the re-arm
///
/// While closing there is nothing to return to, so the session ends.
fn recover(
    state: &mut ConversationState,
    error: ErrorDescriptor,
    policy: &TurnPolicy,
    effects: &mut Vec<Effect>,
) {
    state.last_error = Some(error);

    if state.closing {
        state.phase = Phase::Stopped;
        state.vad_ready = false;
        effects.push(Effect::TeardownVad);
        return;
    }

    state.phase = Phase::Error;
    effects.push(Effect::ScheduleRearm {
        utterance_id: state.utterance_id,
        delay: policy.recovery_delay,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Stage;

    fn policy() -> TurnPolicy {
        TurnPolicy::default()
    }

    fn step(state: ConversationState, event: Event) -> (ConversationState, Vec<Effect>) {
        transition(state, event, &policy())
    }

    fn audio(len: usize) -> CapturedAudio {
        CapturedAudio {
            samples: vec![0.1; len],
            sample_rate: 16000,
        }
    }

    fn in_phase(phase: Phase, utterance_id: u64) -> ConversationState {
        ConversationState {
            phase,
            vad_ready: true,
            utterance_id,
            ..ConversationState::default()
        }
    }

    #[test]
    fn vad_ready_starts_listening() {
        let (state, effects) = step(ConversationState::default(), Event::VadReady);
        assert_eq!(state.phase, Phase::Listening);
        assert!(state.vad_ready);
        assert!(matches!(effects.as_slice(), [Effect::ArmVad]));
    }

    #[test]
    fn vad_failure_is_fatal() {
        let (state, effects) = step(
            ConversationState::default(),
            Event::VadFailed("model missing".to_string()),
        );
        assert_eq!(state.phase, Phase::Error);
        assert!(state.last_error.as_ref().unwrap().is_fatal());
        assert!(effects.is_empty());

        // Nothing but a stop gets through afterwards
        let (state, effects) = step(state, Event::VadReady);
        assert_eq!(state.phase, Phase::Error);
        assert!(effects.is_empty());
    }

    #[test]
    fn permission_denied_tears_down() {
        let (state, effects) = step(
            in_phase(Phase::Listening, 0),
            Event::PermissionDenied("denied".to_string()),
        );
        assert_eq!(state.phase, Phase::Error);
        assert_eq!(
            state.last_error.as_ref().map(|e| e.kind),
            Some(ErrorKind::Permission)
        );
        assert!(matches!(effects.as_slice(), [Effect::TeardownVad]));
    }

    #[test]
    fn happy_path_cycle() {
        let (state, _) = step(in_phase(Phase::Listening, 0), Event::SpeechStarted);
        assert_eq!(state.phase, Phase::CapturingSpeech);
        assert_eq!(state.utterance_id, 1);

        let (state, effects) = step(state, Event::SpeechEnded(audio(1536)));
        assert_eq!(state.phase, Phase::Processing);
        assert!(matches!(
            effects.as_slice(),
            [Effect::DisarmVad, Effect::Transcribe(Utterance { id: 1, .. })]
        ));

        let (state, effects) = step(
            state,
            Event::Transcribed {
                utterance_id: 1,
                text: "hello".to_string(),
            },
        );
        assert_eq!(state.phase, Phase::Processing);
        assert_eq!(state.raw_transcript.as_deref(), Some("hello"));
        assert!(matches!(
            effects.as_slice(),
            [Effect::ProcessText { utterance_id: 1, text }] if text == "hello"
        ));

        let (state, effects) = step(
            state,
            Event::Processed {
                utterance_id: 1,
                text: "Hi there".to_string(),
            },
        );
        assert_eq!(state.phase, Phase::AwaitingSynthesis);
        assert!(matches!(
            effects.as_slice(),
            [Effect::Synthesize { utterance_id: 1, text }] if text == "Hi there"
        ));

        let (state, effects) = step(
            state,
            Event::Synthesized {
                utterance_id: 1,
                audio: AudioStream::from_bytes(None, vec![0u8; 4]),
            },
        );
        assert_eq!(state.phase, Phase::AssistantSpeaking);
        assert!(matches!(
            effects.as_slice(),
            [Effect::StartPlayback { utterance_id: 1, .. }]
        ));

        let (state, effects) = step(state, Event::PlaybackEnded { utterance_id: 1 });
        assert_eq!(state.phase, Phase::Listening);
        assert!(matches!(effects.as_slice(), [Effect::ArmVad]));
    }

    #[test]
    fn empty_utterance_returns_to_listening() {
        let (state, effects) = step(
            in_phase(Phase::CapturingSpeech, 1),
            Event::SpeechEnded(audio(0)),
        );
        assert_eq!(state.phase, Phase::Listening);
        assert!(effects.is_empty());
    }

    #[test]
    fn speech_end_without_start_opens_utterance() {
        let (state, effects) = step(in_phase(Phase::Listening, 4), Event::SpeechEnded(audio(10)));
        assert_eq!(state.utterance_id, 5);
        assert_eq!(state.phase, Phase::Processing);
        assert!(matches!(
            effects.as_slice(),
            [Effect::DisarmVad, Effect::Transcribe(Utterance { id: 5, .. })]
        ));
    }

    #[test]
    fn misfire_returns_to_listening() {
        let (state, effects) = step(in_phase(Phase::CapturingSpeech, 1), Event::Misfire);
        assert_eq!(state.phase, Phase::Listening);
        assert_eq!(state.utterance_id, 1);
        assert!(effects.is_empty());
    }

    #[test]
    fn barge_in_is_suppressed() {
        for phase in [
            Phase::Processing,
            Phase::AwaitingSynthesis,
            Phase::AssistantSpeaking,
            Phase::CapturingSpeech,
        ] {
            let before = in_phase(phase, 2);
            let (after, effects) = step(before.clone(), Event::SpeechStarted);
            assert_eq!(after, before);
            assert!(effects.is_empty());
        }
    }

    #[test]
    fn stale_results_are_discarded() {
        let before = in_phase(Phase::Processing, 3);

        let (after, effects) = step(
            before.clone(),
            Event::Transcribed {
                utterance_id: 2,
                text: "old".to_string(),
            },
        );
        assert_eq!(after, before);
        assert!(effects.is_empty());

        let (after, effects) = step(
            before.clone(),
            Event::StageFailed {
                utterance_id: 2,
                error: PipelineError::new(Stage::Transcribe, "late"),
            },
        );
        assert_eq!(after, before);
        assert!(effects.is_empty());

        let (after, effects) = step(before.clone(), Event::PlaybackEnded { utterance_id: 3 });
        assert_eq!(after, before);
        assert!(effects.is_empty());
    }

    fn after_failure(phase: Phase, utterance_id: u64) -> ConversationState {
        ConversationState {
            last_error: Some(PipelineError::new(Stage::Transcribe, "timeout").into()),
            ..in_phase(phase, utterance_id)
        }
    }

    #[test]
    fn blank_transcript_rearms() {
        let (state, effects) = step(
            after_failure(Phase::Processing, 1),
            Event::Transcribed {
                utterance_id: 1,
                text: "   ".to_string(),
            },
        );
        assert_eq!(state.phase, Phase::Listening);
        assert_eq!(state.last_error, None);
        assert!(matches!(effects.as_slice(), [Effect::ArmVad]));
    }

    #[test]
    fn blank_reply_rearms() {
        let (state, effects) = step(
            after_failure(Phase::Processing, 2),
            Event::Processed {
                utterance_id: 2,
                text: "\n".to_string(),
            },
        );
        assert_eq!(state.phase, Phase::Listening);
        assert_eq!(state.last_error, None);
        assert!(!state.closing);
        assert!(matches!(effects.as_slice(), [Effect::ArmVad]));
    }

    #[test]
    fn stage_failure_schedules_rearm() {
        let (state, effects) = step(
            in_phase(Phase::Processing, 1),
            Event::StageFailed {
                utterance_id: 1,
                error: PipelineError::new(Stage::Transcribe, "500 Internal Server Error"),
            },
        );
        assert_eq!(state.phase, Phase::Error);
        assert_eq!(
            state.last_error.as_ref().and_then(ErrorDescriptor::stage),
            Some(Stage::Transcribe)
        );
        assert!(matches!(
            effects.as_slice(),
            [Effect::ScheduleRearm { utterance_id: 1, delay }]
                if *delay == Duration::from_millis(1500)
        ));

        let (state, effects) = step(state, Event::RearmDue { utterance_id: 1 });
        assert_eq!(state.phase, Phase::Listening);
        assert!(state.last_error.is_some());
        assert!(matches!(effects.as_slice(), [Effect::ArmVad]));
    }

    #[test]
    fn playback_failure_stops_output_and_recovers() {
        let (state, effects) = step(
            in_phase(Phase::AssistantSpeaking, 2),
            Event::PlaybackFailed {
                utterance_id: 2,
                message: "device lost".to_string(),
            },
        );
        assert_eq!(state.phase, Phase::Error);
        assert!(matches!(
            effects.as_slice(),
            [Effect::StopPlayback, Effect::ScheduleRearm { utterance_id: 2, .. }]
        ));
    }

    #[test]
    fn stop_directive_plays_farewell_then_stops() {
        let (state, effects) = step(
            in_phase(Phase::Processing, 1),
            Event::Processed {
                utterance_id: 1,
                text: "STOP".to_string(),
            },
        );
        assert!(state.closing);
        assert_eq!(state.phase, Phase::AwaitingSynthesis);
        assert!(matches!(
            effects.as_slice(),
            [Effect::Synthesize { text, .. }] if text == "Goodbye!"
        ));

        let (state, _) = step(
            state,
            Event::Synthesized {
                utterance_id: 1,
                audio: AudioStream::from_bytes(None, Vec::new()),
            },
        );
        let (state, effects) = step(state, Event::PlaybackEnded { utterance_id: 1 });
        assert_eq!(state.phase, Phase::Stopped);
        assert!(matches!(effects.as_slice(), [Effect::TeardownVad]));

        // Stopped ignores everything
        let (state, effects) = step(state, Event::VadReady);
        assert_eq!(state.phase, Phase::Stopped);
        assert!(effects.is_empty());
    }

    #[test]
    fn failure_while_closing_ends_session() {
        let state = ConversationState {
            closing: true,
            ..in_phase(Phase::AwaitingSynthesis, 1)
        };
        let (state, effects) = step(
            state,
            Event::StageFailed {
                utterance_id: 1,
                error: PipelineError::new(Stage::Synthesize, "timeout"),
            },
        );
        assert_eq!(state.phase, Phase::Stopped);
        assert!(matches!(effects.as_slice(), [Effect::TeardownVad]));
    }

    #[test]
    fn stop_request_from_any_phase() {
        let (state, effects) = step(in_phase(Phase::AssistantSpeaking, 1), Event::StopRequested);
        assert_eq!(state.phase, Phase::Stopped);
        assert!(matches!(
            effects.as_slice(),
            [Effect::StopPlayback, Effect::TeardownVad]
        ));
    }

    #[test]
    fn stop_directive_parsing() {
        let policy = policy();
        assert_eq!(policy.stop_directive("STOP").as_deref(), Some("Goodbye!"));
        assert_eq!(
            policy.stop_directive("  stop. See you later!").as_deref(),
            Some("See you later!")
        );
        assert_eq!(
            policy.stop_directive("Stop: bye now").as_deref(),
            Some("bye now")
        );
        assert_eq!(policy.stop_directive("Stopwatch time"), None);
        assert_eq!(policy.stop_directive("Please stop"), None);
        assert_eq!(policy.stop_directive(""), None);
    }
}
