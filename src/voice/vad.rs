//! Voice activity monitor
//!
//! [`VadBackend`] is the capability any detector engine must provide.
//! [`VadMonitor`] owns a backend's lifecycle and turns its raw callbacks into
//! the three signals the conversation consumes.

use tokio::sync::mpsc;

use crate::config::VadConfig;
use crate::{Error, Result};

/// Event reported by a detector engine
#[derive(Debug, Clone, PartialEq)]
pub enum RawVadEvent {
    /// Speech probability crossed the positive threshold
    SpeechStart,
    /// Speech ended; carries the captured samples
    SpeechEnd(Vec<f32>),
    /// A boundary was detected but the segment was too short to be speech
    Misfire,
}

/// Audio captured for one utterance
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedAudio {
    /// Normalized mono samples
    pub samples: Vec<f32>,
    /// Sample rate of `samples`
    pub sample_rate: u32,
}

/// Normalized monitor output
#[derive(Debug, Clone, PartialEq)]
pub enum VadSignal {
    /// User started speaking
    SpeechStarted,
    /// User stopped speaking
    SpeechEnded(CapturedAudio),
    /// Detected boundary was not speech
    Misfire,
}

/// Capability interface for a voice activity detection engine
///
/// Implementations push [`RawVadEvent`]s into the sender handed to
/// [`VadBackend::load`] while started.
pub trait VadBackend {
    /// Load models and devices
    ///
    /// # Errors
    ///
    /// Returns `Error::Init` if the engine or its assets cannot be loaded
    fn load(&mut self, config: &VadConfig, events: mpsc::UnboundedSender<RawVadEvent>)
    -> Result<()>;

    /// Start forwarding microphone audio into the detector
    ///
    /// # Errors
    ///
    /// Returns `Error::Permission` if microphone access is denied
    fn start(&mut self) -> Result<()>;

    /// Stop forwarding audio, keeping the device acquired
    fn pause(&mut self);

    /// Release every resource held by the engine
    fn destroy(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MonitorState {
    Uninitialized,
    Ready,
    Armed,
}

/// Lifecycle owner and signal normalizer for a [`VadBackend`]
pub struct VadMonitor<B> {
    backend: B,
    state: MonitorState,
    events: Option<mpsc::UnboundedReceiver<RawVadEvent>>,
    frame_samples: usize,
    sample_rate: u32,
}

impl<B: VadBackend> VadMonitor<B> {
    /// Wrap a backend; call [`VadMonitor::initialize`] before arming
    pub fn new(backend: B) -> Self {
        let defaults = VadConfig::default();
        Self {
            backend,
            state: MonitorState::Uninitialized,
            events: None,
            frame_samples: defaults.frame_samples,
            sample_rate: defaults.sample_rate,
        }
    }

    /// Load the backend
    ///
    /// No-op if already initialized.
    ///
    /// # Errors
    ///
    /// Returns `Error::Init` if the configuration is invalid or the backend
    /// fails to load
    pub fn initialize(&mut self, config: &VadConfig) -> Result<()> {
        if self.state != MonitorState::Uninitialized {
            return Ok(());
        }

        config
            .validate()
            .map_err(|e| Error::Init(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        self.backend.load(config, tx).map_err(|e| match e {
            Error::Init(_) => e,
            other => Error::Init(other.to_string()),
        })?;

        self.events = Some(rx);
        self.frame_samples = config.frame_samples;
        self.sample_rate = config.sample_rate;
        self.state = MonitorState::Ready;

        tracing::info!(
            frame_samples = self.frame_samples,
            sample_rate = self.sample_rate,
            "voice activity monitor ready"
        );
        Ok(())
    }

    /// Begin forwarding audio to the detector
    ///
    /// No-op if already armed.
    ///
    /// # Errors
    ///
    /// Returns `Error::Init` if the monitor is not initialized, or
    /// `Error::Permission` if microphone access is denied
    pub fn arm(&mut self) -> Result<()> {
        match self.state {
            MonitorState::Armed => Ok(()),
            MonitorState::Uninitialized => Err(Error::Init(
                "voice activity monitor is not initialized".to_string(),
            )),
            MonitorState::Ready => {
                self.backend.start()?;
                self.state = MonitorState::Armed;
                tracing::debug!("voice activity monitor armed");
                Ok(())
            }
        }
    }

    /// Stop forwarding audio without releasing the device
    pub fn disarm(&mut self) {
        if self.state == MonitorState::Armed {
            self.backend.pause();
            self.state = MonitorState::Ready;
            tracing::debug!("voice activity monitor disarmed");
        }
    }

    /// Release the backend; arming again requires [`VadMonitor::initialize`]
    pub fn teardown(&mut self) {
        if self.state == MonitorState::Uninitialized {
            return;
        }
        self.backend.destroy();
        self.events = None;
        self.state = MonitorState::Uninitialized;
        tracing::info!("voice activity monitor torn down");
    }

    /// Whether audio is being forwarded
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.state == MonitorState::Armed
    }

    /// Whether the backend is loaded
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.state != MonitorState::Uninitialized
    }

    /// Access the wrapped backend
    #[must_use]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// Wait for the next normalized signal
    ///
    /// Pends forever while the monitor is torn down.
    pub async fn next_signal(&mut self) -> VadSignal {
        loop {
            let Some(events) = self.events.as_mut() else {
                return std::future::pending().await;
            };

            match events.recv().await {
                Some(raw) => return self.normalize(raw),
                None => {
                    tracing::debug!("voice activity backend closed its event channel");
                    self.events = None;
                }
            }
        }
    }

    /// Translate a raw engine event
    ///
    /// Segments shorter than one frame are reported as misfires.
    #[must_use]
    pub fn normalize(&self, raw: RawVadEvent) -> VadSignal {
        match raw {
            RawVadEvent::SpeechStart => VadSignal::SpeechStarted,
            RawVadEvent::Misfire => VadSignal::Misfire,
            RawVadEvent::SpeechEnd(samples) if samples.len() < self.frame_samples => {
                tracing::debug!(samples = samples.len(), "suppressing empty utterance");
                VadSignal::Misfire
            }
            RawVadEvent::SpeechEnd(samples) => VadSignal::SpeechEnded(CapturedAudio {
                samples,
                sample_rate: self.sample_rate,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CountingBackend {
        loads: usize,
        starts: usize,
        pauses: usize,
        destroys: usize,
        deny_microphone: bool,
        events: Option<mpsc::UnboundedSender<RawVadEvent>>,
    }

    impl VadBackend for CountingBackend {
        fn load(
            &mut self,
            _config: &VadConfig,
            events: mpsc::UnboundedSender<RawVadEvent>,
        ) -> Result<()> {
            self.loads += 1;
            self.events = Some(events);
            Ok(())
        }

        fn start(&mut self) -> Result<()> {
            if self.deny_microphone {
                return Err(Error::Permission("denied".to_string()));
            }
            self.starts += 1;
            Ok(())
        }

        fn pause(&mut self) {
            self.pauses += 1;
        }

        fn destroy(&mut self) {
            self.destroys += 1;
            self.events = None;
        }
    }

    fn ready_monitor() -> VadMonitor<CountingBackend> {
        let mut monitor = VadMonitor::new(CountingBackend::default());
        monitor.initialize(&VadConfig::default()).unwrap();
        monitor
    }

    #[test]
    fn arm_is_idempotent() {
        let mut monitor = ready_monitor();
        monitor.arm().unwrap();
        monitor.arm().unwrap();
        assert!(monitor.is_armed());
        assert_eq!(monitor.backend().starts, 1);
    }

    #[test]
    fn disarm_then_rearm() {
        let mut monitor = ready_monitor();
        monitor.arm().unwrap();
        monitor.disarm();
        monitor.disarm();
        assert!(!monitor.is_armed());
        assert_eq!(monitor.backend().pauses, 1);

        monitor.arm().unwrap();
        assert_eq!(monitor.backend().starts, 2);
    }

    #[test]
    fn arm_requires_initialize() {
        let mut monitor = VadMonitor::new(CountingBackend::default());
        assert!(matches!(monitor.arm(), Err(Error::Init(_))));

        let mut monitor = ready_monitor();
        monitor.teardown();
        assert!(!monitor.is_initialized());
        assert!(matches!(monitor.arm(), Err(Error::Init(_))));
        assert_eq!(monitor.backend().destroys, 1);
    }

    #[test]
    fn initialize_twice_loads_once() {
        let mut monitor = ready_monitor();
        monitor.initialize(&VadConfig::default()).unwrap();
        assert_eq!(monitor.backend().loads, 1);
    }

    #[test]
    fn permission_denied_leaves_monitor_disarmed() {
        let mut monitor = VadMonitor::new(CountingBackend {
            deny_microphone: true,
            ..CountingBackend::default()
        });
        monitor.initialize(&VadConfig::default()).unwrap();
        assert!(matches!(monitor.arm(), Err(Error::Permission(_))));
        assert!(!monitor.is_armed());
    }

    #[test]
    fn invalid_config_is_init_error() {
        let mut monitor = VadMonitor::new(CountingBackend::default());
        let config = VadConfig {
            frame_samples: 0,
            ..VadConfig::default()
        };
        assert!(matches!(monitor.initialize(&config), Err(Error::Init(_))));
    }

    #[test]
    fn short_segments_become_misfires() {
        let monitor = ready_monitor();
        let frame = VadConfig::default().frame_samples;

        assert_eq!(
            monitor.normalize(RawVadEvent::SpeechEnd(Vec::new())),
            VadSignal::Misfire
        );
        assert_eq!(
            monitor.normalize(RawVadEvent::SpeechEnd(vec![0.1; frame - 1])),
            VadSignal::Misfire
        );
        assert!(matches!(
            monitor.normalize(RawVadEvent::SpeechEnd(vec![0.1; frame])),
            VadSignal::SpeechEnded(CapturedAudio { sample_rate: 16000, .. })
        ));
    }

    #[test]
    fn next_signal_pends_until_an_event_arrives() {
        let mut monitor = ready_monitor();
        let tx = monitor.backend().events.clone().unwrap();

        {
            let mut signal = tokio_test::task::spawn(monitor.next_signal());
            tokio_test::assert_pending!(signal.poll());
            tx.send(RawVadEvent::SpeechStart).unwrap();
            assert!(signal.is_woken());
            tokio_test::assert_ready_eq!(signal.poll(), VadSignal::SpeechStarted);
        }

        // Torn down monitors never yield
        monitor.teardown();
        let mut signal = tokio_test::task::spawn(monitor.next_signal());
        tokio_test::assert_pending!(signal.poll());
    }

    #[tokio::test]
    async fn next_signal_forwards_backend_events() {
        let mut monitor = ready_monitor();
        let tx = monitor.backend().events.clone().unwrap();

        tx.send(RawVadEvent::SpeechStart).unwrap();
        tx.send(RawVadEvent::Misfire).unwrap();

        assert_eq!(monitor.next_signal().await, VadSignal::SpeechStarted);
        assert_eq!(monitor.next_signal().await, VadSignal::Misfire);
    }
}
