//! Shared test utilities

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parley::config::VadConfig;
use parley::voice::{AudioOutput, AudioStream, PlaybackCompletion, RawVadEvent, VadBackend};
use parley::{Error, PipelineError, Result, Stage};
use tokio::sync::{mpsc, oneshot};

/// Samples in one detector frame with the default configuration
pub const FRAME: usize = 1536;

/// Poll `cond` until it holds, panicking after a few seconds
pub async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Counters and event injection for [`ScriptedVad`]
#[derive(Default)]
pub struct VadControl {
    loads: AtomicUsize,
    starts: AtomicUsize,
    pauses: AtomicUsize,
    destroys: AtomicUsize,
    armed: AtomicBool,
    sender: Mutex<Option<mpsc::UnboundedSender<RawVadEvent>>>,
}

impl VadControl {
    /// Push a raw event as if the engine had detected it
    pub fn emit(&self, event: RawVadEvent) {
        let sender = self.sender.lock().unwrap();
        sender
            .as_ref()
            .expect("backend not loaded")
            .send(event)
            .expect("monitor dropped");
    }

    /// Emit a complete utterance of `frames` frames
    pub fn speak(&self, frames: usize) {
        self.emit(RawVadEvent::SpeechStart);
        self.emit(RawVadEvent::SpeechEnd(vec![0.2; FRAME * frames]));
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn pauses(&self) -> usize {
        self.pauses.load(Ordering::SeqCst)
    }

    pub fn destroys(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }
}

/// [`VadBackend`] driven entirely by the test
pub struct ScriptedVad {
    control: Arc<VadControl>,
    fail_load: Option<String>,
    deny_microphone: bool,
}

impl ScriptedVad {
    pub fn new() -> (Self, Arc<VadControl>) {
        let control = Arc::new(VadControl::default());
        let vad = Self {
            control: Arc::clone(&control),
            fail_load: None,
            deny_microphone: false,
        };
        (vad, control)
    }

    pub fn failing_load(message: &str) -> (Self, Arc<VadControl>) {
        let (mut vad, control) = Self::new();
        vad.fail_load = Some(message.to_string());
        (vad, control)
    }

    pub fn denying_microphone() -> (Self, Arc<VadControl>) {
        let (mut vad, control) = Self::new();
        vad.deny_microphone = true;
        (vad, control)
    }
}

impl VadBackend for ScriptedVad {
    fn load(
        &mut self,
        _config: &VadConfig,
        events: mpsc::UnboundedSender<RawVadEvent>,
    ) -> Result<()> {
        self.control.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.fail_load {
            return Err(Error::Init(message.clone()));
        }
        *self.control.sender.lock().unwrap() = Some(events);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if self.deny_microphone {
            return Err(Error::Permission("microphone access denied".to_string()));
        }
        self.control.starts.fetch_add(1, Ordering::SeqCst);
        self.control.armed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn pause(&mut self) {
        self.control.pauses.fetch_add(1, Ordering::SeqCst);
        self.control.armed.store(false, Ordering::SeqCst);
    }

    fn destroy(&mut self) {
        self.control.destroys.fetch_add(1, Ordering::SeqCst);
        self.control.armed.store(false, Ordering::SeqCst);
    }
}

/// A call made against [`FakePipeline`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Transcribe(usize),
    ProcessText(String),
    Synthesize(String),
}

/// Audio returned by [`FakePipeline::synthesize`]
pub const FAKE_AUDIO: &[u8] = b"RIFF-fake-speech";

/// In-memory [`parley::Pipeline`] with scripted results
///
/// Unscripted calls succeed: transcripts read "hello" and replies echo
/// their input.
#[derive(Default)]
pub struct FakePipeline {
    transcripts: Mutex<VecDeque<std::result::Result<String, PipelineError>>>,
    replies: Mutex<VecDeque<std::result::Result<String, PipelineError>>>,
    synthesis_failures: Mutex<VecDeque<PipelineError>>,
    latency: Option<Duration>,
    calls: Mutex<Vec<Call>>,
}

impl FakePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transcript(self, result: std::result::Result<&str, PipelineError>) -> Self {
        self.transcripts
            .lock()
            .unwrap()
            .push_back(result.map(ToString::to_string));
        self
    }

    pub fn reply(self, result: std::result::Result<&str, PipelineError>) -> Self {
        self.replies
            .lock()
            .unwrap()
            .push_back(result.map(ToString::to_string));
        self
    }

    pub fn failing_synthesis(self, message: &str) -> Self {
        self.synthesis_failures
            .lock()
            .unwrap()
            .push_back(PipelineError::new(Stage::Synthesize, message));
        self
    }

    /// Delay every transcription by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl parley::Pipeline for FakePipeline {
    async fn transcribe(&self, audio: Vec<u8>) -> std::result::Result<String, PipelineError> {
        self.record(Call::Transcribe(audio.len()));
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let scripted = self.transcripts.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok("hello".to_string()))
    }

    async fn process_text(&self, text: &str) -> std::result::Result<String, PipelineError> {
        self.record(Call::ProcessText(text.to_string()));
        let scripted = self.replies.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(format!("echo: {text}")))
    }

    async fn synthesize(&self, text: &str) -> std::result::Result<AudioStream, PipelineError> {
        self.record(Call::Synthesize(text.to_string()));
        if let Some(error) = self.synthesis_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        Ok(AudioStream::from_bytes(Some("audio/wav".to_string()), FAKE_AUDIO))
    }
}

/// How [`FakeOutput`] completes playback
#[derive(Debug, Clone)]
pub enum Completion {
    /// Drain the stream, then report success
    Succeed,
    /// Report a device failure immediately
    Fail(String),
    /// Hold completion until [`OutputLog::finish`]
    Manual,
}

/// Observations of [`FakeOutput`]
#[derive(Default)]
pub struct OutputLog {
    plays: AtomicUsize,
    stops: AtomicUsize,
    completed: AtomicUsize,
    payloads: Mutex<Vec<Vec<u8>>>,
    pending: Mutex<Vec<oneshot::Sender<Result<()>>>>,
}

impl OutputLog {
    pub fn plays(&self) -> usize {
        self.plays.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.payloads.lock().unwrap().clone()
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Complete every held playback
    pub fn finish(&self) {
        for tx in self.pending.lock().unwrap().drain(..) {
            let _ = tx.send(Ok(()));
            self.completed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// [`AudioOutput`] that never touches a device
pub struct FakeOutput {
    mode: Completion,
    log: Arc<OutputLog>,
}

impl FakeOutput {
    pub fn new(mode: Completion) -> (Self, Arc<OutputLog>) {
        let log = Arc::new(OutputLog::default());
        let output = Self {
            mode,
            log: Arc::clone(&log),
        };
        (output, log)
    }
}

impl AudioOutput for FakeOutput {
    fn play(&mut self, audio: AudioStream) -> PlaybackCompletion {
        self.log.plays.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();

        match &self.mode {
            Completion::Succeed => {
                let log = Arc::clone(&self.log);
                tokio::spawn(async move {
                    let bytes = audio.collect_bytes().await.unwrap_or_default();
                    log.payloads.lock().unwrap().push(bytes);
                    log.completed.fetch_add(1, Ordering::SeqCst);
                    let _ = tx.send(Ok(()));
                });
            }
            Completion::Fail(message) => {
                let _ = tx.send(Err(Error::Playback(message.clone())));
            }
            Completion::Manual => {
                self.log.pending.lock().unwrap().push(tx);
            }
        }

        rx
    }

    fn stop(&mut self) {
        self.log.stops.fetch_add(1, Ordering::SeqCst);
        self.log.pending.lock().unwrap().clear();
    }
}
