//! Async conversation driver
//!
//! Owns the [`ConversationState`] and processes one event at a time. Signals
//! from the voice activity monitor and results posted by spawned pipeline,
//! timer and playback tasks share a single loop, so the state needs no lock.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::Instrument;
use uuid::Uuid;

use super::machine::{self, Effect, Event, TurnPolicy};
use super::state::{ConversationState, Phase, Utterance};
use super::status::StatusView;
use crate::config::{Config, VadConfig};
use crate::error::{PipelineError, Stage};
use crate::pipeline::Pipeline;
use crate::voice::{AudioOutput, AudioStream, VadBackend, VadMonitor};
use crate::{Error, Result};

/// Cloneable handle for stopping a running conversation
#[derive(Clone)]
pub struct ConversationHandle {
    events: mpsc::UnboundedSender<Event>,
}

impl ConversationHandle {
    /// Request that the conversation stop
    pub fn stop(&self) {
        if self.events.send(Event::StopRequested).is_err() {
            tracing::debug!("conversation already finished");
        }
    }
}

/// Turn-taking conversation over a voice activity backend, a remote
/// pipeline and an audio output
pub struct Conversation<B, O> {
    state: ConversationState,
    policy: TurnPolicy,
    vad_config: VadConfig,
    monitor: VadMonitor<B>,
    pipeline: Arc<dyn Pipeline>,
    output: O,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    status_tx: watch::Sender<StatusView>,
    session_id: Uuid,
}

impl<B: VadBackend, O: AudioOutput> Conversation<B, O> {
    /// Create a conversation from loaded configuration
    pub fn new(backend: B, pipeline: Arc<dyn Pipeline>, output: O, config: &Config) -> Self {
        Self::with_parts(
            backend,
            pipeline,
            output,
            config.vad.clone(),
            TurnPolicy::from(&config.conversation),
        )
    }

    /// Create a conversation from explicit parts
    pub fn with_parts(
        backend: B,
        pipeline: Arc<dyn Pipeline>,
        output: O,
        vad_config: VadConfig,
        policy: TurnPolicy,
    ) -> Self {
        let state = ConversationState::default();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(StatusView::project(&state));

        Self {
            state,
            policy,
            vad_config,
            monitor: VadMonitor::new(backend),
            pipeline,
            output,
            events_tx,
            events_rx,
            status_tx,
            session_id: Uuid::new_v4(),
        }
    }

    /// Handle for stopping the conversation from another task
    #[must_use]
    pub fn handle(&self) -> ConversationHandle {
        ConversationHandle {
            events: self.events_tx.clone(),
        }
    }

    /// Subscribe to status updates
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<StatusView> {
        self.status_tx.subscribe()
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> &ConversationState {
        &self.state
    }

    /// Identifier used in log spans
    #[must_use]
    pub const fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Initialize the voice activity monitor and run until stopped
    ///
    /// Pipeline and playback failures are recovered from internally.
    ///
    /// # Errors
    ///
    /// Returns `Error::Init` or `Error::Permission` when the monitor cannot
    /// be loaded or the microphone cannot be acquired
    #[allow(clippy::future_not_send)]
    #[tracing::instrument(skip_all, fields(session = %self.session_id))]
    pub async fn run(&mut self) -> Result<()> {
        let recovery_delay_ms =
            u64::try_from(self.policy.recovery_delay.as_millis()).unwrap_or(u64::MAX);
        tracing::info!(
            stop_keyword = %self.policy.stop_keyword,
            recovery_delay_ms,
            "conversation starting"
        );

        match self.monitor.initialize(&self.vad_config) {
            Ok(()) => self.dispatch(Event::VadReady),
            Err(e) => {
                tracing::error!(error = %e, "voice activity monitor failed to load");
                self.dispatch(Event::VadFailed(error_message(e)));
            }
        }

        loop {
            if let Some(outcome) = self.outcome() {
                return outcome;
            }

            let event = tokio::select! {
                signal = self.monitor.next_signal() => Event::from(signal),
                Some(event) = self.events_rx.recv() => event,
            };
            self.dispatch(event);
        }
    }

    /// Terminal result once the conversation can make no further progress
    fn outcome(&mut self) -> Option<Result<()>> {
        match self.state.phase {
            Phase::Stopped => {
                self.monitor.teardown();
                tracing::info!("conversation stopped");
                Some(Ok(()))
            }
            Phase::Error => {
                let error = self
                    .state
                    .last_error
                    .as_ref()
                    .filter(|e| e.is_fatal())?
                    .to_error();
                self.output.stop();
                self.monitor.teardown();
                tracing::error!(error = %error, "conversation ended");
                Some(Err(error))
            }
            _ => None,
        }
    }

    fn dispatch(&mut self, event: Event) {
        let name = event.name();
        let before = self.state.phase;

        let (state, effects) =
            machine::transition(std::mem::take(&mut self.state), event, &self.policy);
        self.state = state;

        if self.state.phase == before {
            tracing::trace!(event = name, phase = %before, "event handled");
        } else {
            tracing::debug!(
                event = name,
                from = %before,
                to = %self.state.phase,
                utterance_id = self.state.utterance_id,
                "phase changed"
            );
        }

        self.publish();

        for effect in effects {
            self.apply(effect);
        }
    }

    fn publish(&self) {
        let view = StatusView::project(&self.state);
        let label = view.to_string();
        let changed = self.status_tx.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
        if changed {
            tracing::info!(status = %label, "status");
        }
    }

    fn post(&self, event: Event) {
        // The receiver lives as long as self
        self.events_tx.send(event).ok();
    }

    fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::ArmVad => {
                if let Err(e) = self.monitor.arm() {
                    tracing::error!(error = %e, "failed to arm voice activity monitor");
                    let event = match e {
                        Error::Permission(message) => Event::PermissionDenied(message),
                        other => Event::VadFailed(error_message(other)),
                    };
                    self.post(event);
                }
            }
            Effect::DisarmVad => self.monitor.disarm(),
            Effect::TeardownVad => self.monitor.teardown(),
            Effect::Transcribe(utterance) => self.spawn_transcribe(utterance),
            Effect::ProcessText { utterance_id, text } => {
                self.spawn_process(utterance_id, text);
            }
            Effect::Synthesize { utterance_id, text } => {
                self.spawn_synthesize(utterance_id, text);
            }
            Effect::StartPlayback {
                utterance_id,
                audio,
            } => self.start_playback(utterance_id, audio),
            Effect::StopPlayback => self.output.stop(),
            Effect::ScheduleRearm {
                utterance_id,
                delay,
            } => {
                let tx = self.events_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    tx.send(Event::RearmDue { utterance_id }).ok();
                });
            }
        }
    }

    fn spawn_transcribe(&self, utterance: Utterance) {
        let pipeline = Arc::clone(&self.pipeline);
        let tx = self.events_tx.clone();
        let utterance_id = utterance.id;
        let span = tracing::info_span!("transcribe", utterance_id);

        tokio::spawn(
            async move {
                let result = match utterance.encode() {
                    Ok(wav) => {
                        tracing::debug!(bytes = wav.len(), "utterance encoded");
                        pipeline.transcribe(wav).await
                    }
                    Err(e) => Err(PipelineError::new(Stage::Transcribe, e.to_string())),
                };
                let event = match result {
                    Ok(text) => {
                        tracing::info!(transcript = %text, "transcribed");
                        Event::Transcribed { utterance_id, text }
                    }
                    Err(error) => stage_failed(utterance_id, error),
                };
                tx.send(event).ok();
            }
            .instrument(span),
        );
    }

    fn spawn_process(&self, utterance_id: u64, text: String) {
        let pipeline = Arc::clone(&self.pipeline);
        let tx = self.events_tx.clone();
        let span = tracing::info_span!("process_text", utterance_id);

        tokio::spawn(
            async move {
                let event = match pipeline.process_text(&text).await {
                    Ok(text) => {
                        tracing::info!(reply = %text, "processed");
                        Event::Processed { utterance_id, text }
                    }
                    Err(error) => stage_failed(utterance_id, error),
                };
                tx.send(event).ok();
            }
            .instrument(span),
        );
    }

    fn spawn_synthesize(&self, utterance_id: u64, text: String) {
        let pipeline = Arc::clone(&self.pipeline);
        let tx = self.events_tx.clone();
        let span = tracing::info_span!("synthesize", utterance_id);

        tokio::spawn(
            async move {
                let event = match pipeline.synthesize(&text).await {
                    Ok(audio) => {
                        tracing::debug!(
                            content_type = ?audio.content_type(),
                            "synthesis streaming"
                        );
                        Event::Synthesized {
                            utterance_id,
                            audio,
                        }
                    }
                    Err(error) => stage_failed(utterance_id, error),
                };
                tx.send(event).ok();
            }
            .instrument(span),
        );
    }

    fn start_playback(&mut self, utterance_id: u64, audio: AudioStream) {
        let completion = self.output.play(audio);
        let tx = self.events_tx.clone();

        tokio::spawn(async move {
            let event = match completion.await {
                Ok(Ok(())) => Event::PlaybackEnded { utterance_id },
                Ok(Err(e)) => {
                    tracing::warn!(utterance_id, error = %e, "playback failed");
                    Event::PlaybackFailed {
                        utterance_id,
                        message: error_message(e),
                    }
                }
                // Superseded or stopped
                Err(_) => Event::PlaybackFailed {
                    utterance_id,
                    message: "playback cancelled".to_string(),
                },
            };
            tx.send(event).ok();
        });
    }
}

fn stage_failed(utterance_id: u64, error: PipelineError) -> Event {
    tracing::warn!(stage = %error.stage, error = %error.message, "pipeline stage failed");
    Event::StageFailed {
        utterance_id,
        error,
    }
}

/// Inner message of errors that already name their category
fn error_message(error: Error) -> String {
    match error {
        Error::Init(message) | Error::Permission(message) | Error::Playback(message) => message,
        other => other.to_string(),
    }
}
