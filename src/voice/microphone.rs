//! Microphone-backed voice activity detection

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use super::capture::AudioCapture;
use super::detector::EnergyDetector;
use super::vad::{RawVadEvent, VadBackend};
use crate::config::VadConfig;
use crate::{Error, Result};

/// [`VadBackend`] that runs an [`EnergyDetector`] over the default microphone
///
/// Detection happens inside the capture callback; events are pushed straight
/// into the monitor's channel.
#[derive(Default)]
pub struct MicrophoneVad {
    capture: Option<AudioCapture>,
    detector: Option<Arc<Mutex<EnergyDetector>>>,
    events: Option<mpsc::UnboundedSender<RawVadEvent>>,
    forwarding: Arc<AtomicBool>,
}

impl MicrophoneVad {
    /// Create an unloaded backend
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn reset_detector(&self) {
        if let Some(detector) = &self.detector {
            if let Ok(mut detector) = detector.lock() {
                detector.reset();
            }
        }
    }
}

impl VadBackend for MicrophoneVad {
    fn load(
        &mut self,
        config: &VadConfig,
        events: mpsc::UnboundedSender<RawVadEvent>,
    ) -> Result<()> {
        let capture = AudioCapture::new().map_err(|e| Error::Init(e.to_string()))?;

        self.capture = Some(capture);
        self.detector = Some(Arc::new(Mutex::new(EnergyDetector::new(config.clone()))));
        self.events = Some(events);
        self.forwarding.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        let (Some(capture), Some(detector), Some(events)) =
            (self.capture.as_mut(), self.detector.as_ref(), self.events.as_ref())
        else {
            return Err(Error::Init("microphone backend not loaded".to_string()));
        };

        if !capture.is_open() {
            let detector = Arc::clone(detector);
            let events = events.clone();
            let forwarding = Arc::clone(&self.forwarding);

            // First arm acquires the microphone
            capture.open(move |samples| {
                if !forwarding.load(Ordering::Relaxed) {
                    return;
                }
                let Ok(mut detector) = detector.lock() else {
                    return;
                };
                for event in detector.push_samples(samples) {
                    if events.send(event).is_err() {
                        tracing::trace!("voice activity monitor gone, dropping event");
                    }
                }
            })?;
        }

        self.reset_detector();
        self.forwarding.store(true, Ordering::SeqCst);

        if let Some(capture) = self.capture.as_ref() {
            if let Err(e) = capture.resume() {
                self.forwarding.store(false, Ordering::SeqCst);
                return Err(e);
            }
        }
        Ok(())
    }

    fn pause(&mut self) {
        self.forwarding.store(false, Ordering::SeqCst);
        if let Some(capture) = self.capture.as_ref() {
            capture.pause();
        }
        self.reset_detector();
    }

    fn destroy(&mut self) {
        self.forwarding.store(false, Ordering::SeqCst);
        if let Some(mut capture) = self.capture.take() {
            capture.close();
        }
        self.detector = None;
        self.events = None;
    }
}
