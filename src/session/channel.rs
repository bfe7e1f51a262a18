//! The per-session state machine.
//!
//! One tokio task owns every resource of a session and processes a single
//! event queue fed by the link task, the speaker timers and the audio threads'
//! fault callbacks. State and speaker changes are published through `watch`
//! channels; nothing else writes them.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};

use crate::audio::codec;
use crate::audio::{
    CapturePipeline, FrameClock, InboundAudioChunk, PlaybackBackend, PlaybackOutput,
    PlaybackScheduler,
};
use crate::error::VoiceError;

use super::link::{LinkEvent, LiveLink, cancelled};
use super::outbound::OutboundQueue;

/// Names of the participants currently shown as speaking.
pub type SpeakerSet = BTreeSet<String>;

/// Lifecycle of one voice session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    /// No credentials: the session exists but nothing is captured, sent or played.
    Simulated,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

/// Everything the session task reacts to.
#[derive(Debug)]
pub enum SessionEvent {
    Link(LinkEvent),
    SpeakerExpired(String),
    DeviceFault(VoiceError),
}

const EVENT_QUEUE_CAPACITY: usize = 64;

/// Timing knobs of a session.
#[derive(Debug, Clone)]
pub struct SessionTiming {
    pub speaker_timeout: Duration,
    pub teardown_timeout: Duration,
    pub playback_period_frames: usize,
    pub input_sample_rate: u32,
}

pub struct SessionChannel {
    assistant_name: String,
    timing: SessionTiming,

    capture: CapturePipeline,
    playback_backend: Option<Box<dyn PlaybackBackend>>,
    playback: Option<PlaybackOutput>,
    scheduler: Arc<PlaybackScheduler>,
    clock: Arc<FrameClock>,
    outbound: Arc<OutboundQueue>,

    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: mpsc::Receiver<SessionEvent>,
    state: Arc<watch::Sender<SessionState>>,
    speakers: Arc<watch::Sender<SpeakerSet>>,

    timers: JoinSet<()>,
    link: Option<JoinHandle<()>>,
    link_shutdown: watch::Sender<bool>,
}

impl SessionChannel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        assistant_name: &str,
        timing: SessionTiming,
        capture: CapturePipeline,
        playback_backend: Box<dyn PlaybackBackend>,
        scheduler: Arc<PlaybackScheduler>,
        clock: Arc<FrameClock>,
        outbound: Arc<OutboundQueue>,
        state: Arc<watch::Sender<SessionState>>,
        speakers: Arc<watch::Sender<SpeakerSet>>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (link_shutdown, _) = watch::channel(false);
        Self {
            assistant_name: assistant_name.to_string(),
            timing,
            capture,
            playback_backend: Some(playback_backend),
            playback: None,
            scheduler,
            clock,
            outbound,
            events_tx,
            events_rx,
            state,
            speakers,
            timers: JoinSet::new(),
            link: None,
            link_shutdown,
        }
    }

    /// Sender the link task reports into.
    pub fn events(&self) -> mpsc::Sender<SessionEvent> {
        self.events_tx.clone()
    }

    fn set_state(&self, next: SessionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            log::info!("Session state: {:?} -> {:?}", prev, next);
        }
    }

    fn current_state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Drive the session until the remote side ends it, it fails, or
    /// `shutdown` is signalled. Every resource is released before returning.
    pub async fn run(mut self, link: LiveLink, mut shutdown: watch::Receiver<bool>) {
        self.set_state(SessionState::Connecting);

        if let Err(e) = self.open_playback() {
            log::error!("Playback device: {}", e);
            self.set_state(SessionState::Failed);
            self.teardown().await;
            return;
        }

        self.link = Some(tokio::spawn(link.run(self.link_shutdown.subscribe())));

        loop {
            tokio::select! {
                _ = cancelled(&mut shutdown) => {
                    log::info!("Leaving voice session");
                    break;
                }
                Some(event) = self.events_rx.recv() => {
                    if !self.handle_event(event) {
                        break;
                    }
                }
                Some(_) = self.timers.join_next(), if !self.timers.is_empty() => {}
            }
        }

        self.teardown().await;
        if self.current_state() != SessionState::Failed {
            self.set_state(SessionState::Closed);
        }
    }

    fn open_playback(&mut self) -> Result<(), VoiceError> {
        let backend = self.playback_backend.take().ok_or_else(|| {
            VoiceError::DeviceUnavailable("playback device already released".to_string())
        })?;
        let faults = self.events_tx.clone();
        let output = PlaybackOutput::start(
            backend,
            self.scheduler.clone(),
            self.clock.clone(),
            self.timing.playback_period_frames,
            move |e| {
                let _ = faults.try_send(SessionEvent::DeviceFault(e));
            },
        )?;
        self.playback = Some(output);
        Ok(())
    }

    fn start_capture(&mut self) -> Result<(), VoiceError> {
        let outbound = self.outbound.clone();
        let rate = self.timing.input_sample_rate;
        let faults = self.events_tx.clone();
        self.capture.start(
            move |frame| {
                outbound.push(codec::encode(&frame.samples, rate));
            },
            move |e| {
                let _ = faults.try_send(SessionEvent::DeviceFault(e));
            },
        )
    }

    /// Returns `false` when the session has ended.
    fn handle_event(&mut self, event: SessionEvent) -> bool {
        match event {
            SessionEvent::Link(LinkEvent::Open) => {
                if self.current_state() != SessionState::Connecting {
                    return true;
                }
                if let Err(e) = self.start_capture() {
                    log::error!("Capture device: {}", e);
                    self.set_state(SessionState::Failed);
                    return false;
                }
                self.set_state(SessionState::Connected);
                let name = self.assistant_name.clone();
                self.speakers.send_if_modified(|set| set.insert(name));
                true
            }
            SessionEvent::Link(LinkEvent::Audio(chunk)) => {
                if self.current_state() == SessionState::Connected {
                    self.play_chunk(&chunk);
                }
                true
            }
            SessionEvent::Link(LinkEvent::Interrupted) => {
                let stopped = self.scheduler.interrupt();
                log::info!("Model interrupted by user, {} buffer(s) dropped", stopped);
                true
            }
            SessionEvent::Link(LinkEvent::TurnComplete) => {
                log::debug!("Model turn complete");
                true
            }
            SessionEvent::Link(LinkEvent::Closed(reason)) => {
                log::info!(
                    "Live session closed by remote: {}",
                    reason.as_deref().unwrap_or("no reason given")
                );
                self.set_state(SessionState::Closed);
                false
            }
            SessionEvent::Link(LinkEvent::Failed(e)) => {
                log::error!("Live session error: {}", e);
                self.set_state(SessionState::Failed);
                false
            }
            SessionEvent::SpeakerExpired(name) => {
                self.speakers.send_if_modified(|set| set.remove(&name));
                true
            }
            SessionEvent::DeviceFault(e) => {
                log::error!("Audio device fault: {}", e);
                self.set_state(SessionState::Failed);
                false
            }
        }
    }

    fn play_chunk(&mut self, chunk: &InboundAudioChunk) {
        let rate = self.scheduler.sample_rate();
        let buffer = match codec::decode_chunk(chunk, rate, 1) {
            Ok(buffer) => buffer,
            Err(e) => {
                log::warn!("Dropping inbound chunk: {}", e);
                return;
            }
        };
        if buffer.sample_rate != rate {
            log::warn!(
                "Dropping inbound chunk at {} Hz, output runs at {} Hz",
                buffer.sample_rate,
                rate
            );
            return;
        }
        if buffer.frames() == 0 {
            return;
        }

        self.scheduler.schedule(buffer);
        self.mark_speaking();
    }

    /// Show the assistant as speaking and clear it again after a fixed delay.
    fn mark_speaking(&mut self) {
        let name = self.assistant_name.clone();
        self.speakers.send_if_modified(|set| set.insert(name.clone()));

        let events = self.events_tx.clone();
        let after = self.timing.speaker_timeout;
        self.timers.spawn(async move {
            tokio::time::sleep(after).await;
            let _ = events.send(SessionEvent::SpeakerExpired(name)).await;
        });
    }

    async fn teardown(&mut self) {
        let capture_thread = self.capture.request_stop();
        self.scheduler.interrupt();
        let play_thread = self.playback.take().and_then(|mut p| p.request_stop());
        if let Some(mut backend) = self.playback_backend.take() {
            backend.close();
        }
        self.outbound.close();

        let limit = self.timing.teardown_timeout;
        tokio::join!(
            join_audio_thread(capture_thread, "audio-capture", limit),
            join_audio_thread(play_thread, "audio-play", limit),
        );

        self.link_shutdown.send_replace(true);
        if let Some(mut link) = self.link.take() {
            if tokio::time::timeout(self.timing.teardown_timeout, &mut link)
                .await
                .is_err()
            {
                log::warn!("Link did not stop within {:?}, aborting", self.timing.teardown_timeout);
                link.abort();
            }
        }

        self.timers.abort_all();
        self.speakers.send_if_modified(|set| {
            let had = !set.is_empty();
            set.clear();
            had
        });
        log::info!("Session resources released");
    }
}

impl Drop for SessionChannel {
    // Abort path: the task was cancelled before `teardown` ran.
    fn drop(&mut self) {
        self.link_shutdown.send_replace(true);
        if let Some(link) = self.link.take() {
            link.abort();
        }
        self.outbound.close();
        self.scheduler.interrupt();
        // No waiting here: each audio thread closes its device when it exits.
        drop(self.capture.request_stop());
        if let Some(mut playback) = self.playback.take() {
            drop(playback.request_stop());
        }
        if let Some(mut backend) = self.playback_backend.take() {
            backend.close();
        }
    }
}

/// Wait up to `limit` for an audio thread to exit.
///
/// The join runs on the blocking pool so a device call that never returns
/// cannot stall the runtime. On overrun the thread is left detached.
async fn join_audio_thread(
    thread: Option<std::thread::JoinHandle<()>>,
    name: &str,
    limit: Duration,
) {
    let Some(thread) = thread else {
        return;
    };
    let joined = tokio::task::spawn_blocking(move || thread.join());
    match tokio::time::timeout(limit, joined).await {
        Ok(Ok(Ok(()))) => {}
        Ok(_) => log::error!("{} thread panicked", name),
        Err(_) => log::warn!("{} thread did not stop within {:?}, detaching it", name, limit),
    }
}
