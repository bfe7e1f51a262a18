//! Microphone capture on a dedicated OS thread.
//!
//! Device reads are accumulated into fixed-size frames; the mute gate sits
//! after the read so the device never restarts when the user toggles mute.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use crate::error::VoiceError;

use super::codec::AudioFrame;

/// Source of mono f32 samples, e.g. an ALSA capture PCM.
pub trait CaptureBackend: Send {
    /// Acquire the device. Fails with `DeviceUnavailable`.
    fn open(&mut self, sample_rate: u32) -> Result<(), VoiceError>;

    /// Block until samples are available and copy them into `buf`.
    /// Returns the number of samples written.
    fn read(&mut self, buf: &mut [f32]) -> Result<usize, VoiceError>;

    /// Release the device. Must be safe to call more than once.
    fn close(&mut self);

    /// Preferred number of samples per `read`.
    fn period_samples(&self) -> usize {
        1024
    }
}

/// Shared on/off switch for outbound audio.
#[derive(Debug, Clone, Default)]
pub struct MuteGate(Arc<AtomicBool>);

impl MuteGate {
    pub fn set(&self, muted: bool) {
        self.0.store(muted, Ordering::SeqCst);
    }

    pub fn is_muted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct CaptureCounters {
    delivered: AtomicU64,
    gated: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaptureStats {
    pub frames_delivered: u64,
    pub frames_gated: u64,
}

/// Read side of the capture thread's frame counters.
#[derive(Debug, Clone, Default)]
pub struct CaptureMeter(Arc<CaptureCounters>);

impl CaptureMeter {
    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            frames_delivered: self.0.delivered.load(Ordering::Relaxed),
            frames_gated: self.0.gated.load(Ordering::Relaxed),
        }
    }
}

pub struct CapturePipeline {
    backend: Option<Box<dyn CaptureBackend>>,
    sample_rate: u32,
    frame_size: usize,
    gate: MuteGate,
    running: Arc<AtomicBool>,
    meter: CaptureMeter,
    handle: Option<JoinHandle<()>>,
}

impl CapturePipeline {
    pub fn new(
        backend: Box<dyn CaptureBackend>,
        sample_rate: u32,
        frame_size: usize,
        gate: MuteGate,
    ) -> Self {
        Self {
            backend: Some(backend),
            sample_rate,
            frame_size: frame_size.max(1),
            gate,
            running: Arc::new(AtomicBool::new(false)),
            meter: CaptureMeter::default(),
            handle: None,
        }
    }

    /// Open the device and start delivering frames to `on_frame`.
    ///
    /// `on_fault` is called at most once if the device fails after start.
    pub fn start<F, E>(&mut self, on_frame: F, on_fault: E) -> Result<(), VoiceError>
    where
        F: FnMut(AudioFrame) + Send + 'static,
        E: FnOnce(VoiceError) + Send + 'static,
    {
        if self.handle.is_some() {
            return Ok(());
        }
        let mut backend = self.backend.take().ok_or_else(|| {
            VoiceError::DeviceUnavailable("capture device already released".to_string())
        })?;

        if let Err(e) = backend.open(self.sample_rate) {
            backend.close();
            return Err(e);
        }

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let counters = self.meter.0.clone();
        let gate = self.gate.clone();
        let frame_size = self.frame_size;

        let spawned = thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || {
                capture_thread(backend, frame_size, gate, running, counters, on_frame, on_fault)
            });

        match spawned {
            Ok(handle) => {
                log::info!(
                    "Capture started: rate={}, frame_size={}",
                    self.sample_rate,
                    frame_size
                );
                self.handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                // The closure, and the opened backend with it, was dropped by the failed spawn.
                self.running.store(false, Ordering::SeqCst);
                Err(VoiceError::DeviceUnavailable(format!(
                    "failed to spawn capture thread: {}",
                    e
                )))
            }
        }
    }

    pub fn set_muted(&self, muted: bool) {
        self.gate.set(muted);
    }

    pub fn meter(&self) -> CaptureMeter {
        self.meter.clone()
    }

    /// Tell the thread to stop and hand it over without waiting for it.
    ///
    /// The thread closes the device itself once its current read returns.
    pub fn request_stop(&mut self) -> Option<JoinHandle<()>> {
        self.running.store(false, Ordering::SeqCst);
        // Never started: the device was never opened, just drop it.
        if let Some(mut backend) = self.backend.take() {
            backend.close();
        }
        self.handle.take()
    }

    /// Stop the thread and release the device, blocking until it exits. Idempotent.
    pub fn stop(&mut self) {
        if let Some(h) = self.request_stop() {
            let _ = h.join();
        }
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_thread<F, E>(
    mut backend: Box<dyn CaptureBackend>,
    frame_size: usize,
    gate: MuteGate,
    running: Arc<AtomicBool>,
    counters: Arc<CaptureCounters>,
    mut on_frame: F,
    on_fault: E,
) where
    F: FnMut(AudioFrame),
    E: FnOnce(VoiceError),
{
    let mut read_buf = vec![0f32; backend.period_samples().max(1)];
    let mut accum_buf: Vec<f32> = Vec::with_capacity(frame_size * 2);
    let mut fault = None;

    while running.load(Ordering::Relaxed) {
        let n = match backend.read(&mut read_buf) {
            Ok(n) => n,
            Err(e) => {
                log::error!("Capture device error: {}", e);
                fault = Some(e);
                break;
            }
        };
        accum_buf.extend_from_slice(&read_buf[..n.min(read_buf.len())]);

        while accum_buf.len() >= frame_size {
            let samples: Vec<f32> = accum_buf.drain(..frame_size).collect();
            if gate.is_muted() {
                counters.gated.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            counters.delivered.fetch_add(1, Ordering::Relaxed);
            on_frame(AudioFrame::new(samples));
        }
    }

    backend.close();
    log::info!("Capture stopped");
    if let Some(e) = fault {
        if running.load(Ordering::Relaxed) {
            on_fault(e);
        }
    }
}
