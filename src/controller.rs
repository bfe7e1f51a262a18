use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::audio::{
    AlsaBackends, AudioBackends, CaptureMeter, CapturePipeline, CaptureStats, FrameClock,
    MuteGate, PlaybackScheduler, ScheduledSlot,
};
use crate::config::Config;
use crate::error::VoiceError;
use crate::session::{
    LiveConnector, LiveLink, OutboundQueue, OutboundStats, SessionChannel, SessionSetup,
    SessionState, SessionTiming, SpeakerSet, WsConnector,
};

/// The voice channel being joined, as supplied by the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub id: String,
    pub name: String,
}

impl ChannelInfo {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub id: String,
    pub display_name: String,
    pub avatar: Option<String>,
}

/// Read-only view of a session, cheap to clone.
#[derive(Clone)]
pub struct SessionHandle {
    id: Uuid,
    channel: ChannelInfo,
    user: UserIdentity,
    state: watch::Receiver<SessionState>,
    speakers: watch::Receiver<SpeakerSet>,
    gate: MuteGate,
    capture: CaptureMeter,
    scheduler: Arc<PlaybackScheduler>,
    outbound: Arc<OutboundQueue>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn channel(&self) -> &ChannelInfo {
        &self.channel
    }

    pub fn user(&self) -> &UserIdentity {
        &self.user
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn active_speakers(&self) -> SpeakerSet {
        self.speakers.borrow().clone()
    }

    pub fn subscribe_speakers(&self) -> watch::Receiver<SpeakerSet> {
        self.speakers.clone()
    }

    pub fn is_muted(&self) -> bool {
        self.gate.is_muted()
    }

    /// Buffers scheduled or playing that have not finished yet.
    pub fn pending_buffers(&self) -> usize {
        self.scheduler.pending()
    }

    pub fn next_start_time(&self) -> Duration {
        self.scheduler.next_start_time()
    }

    pub fn scheduled_slots(&self) -> Vec<ScheduledSlot> {
        self.scheduler.slots()
    }

    pub fn outbound_stats(&self) -> OutboundStats {
        self.outbound.stats()
    }

    /// Microphone frames passed on and frames held back by the mute gate.
    pub fn capture_stats(&self) -> CaptureStats {
        self.capture.stats()
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("channel", &self.channel.name)
            .field("state", &self.state())
            .finish()
    }
}

struct ActiveSession {
    handle: SessionHandle,
    state: Arc<watch::Sender<SessionState>>,
    speakers: Arc<watch::Sender<SpeakerSet>>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ActiveSession {
    fn is_live(&self) -> bool {
        !self.state.borrow().is_terminal()
    }
}

/// Owns at most one voice session at a time.
pub struct SessionController {
    config: Config,
    connector: Option<Arc<dyn LiveConnector>>,
    backends: Arc<dyn AudioBackends>,
    active: Option<ActiveSession>,
}

impl SessionController {
    /// `connector` is `None` when no credentials are available; sessions are
    /// then simulated.
    pub fn new(
        config: Config,
        connector: Option<Arc<dyn LiveConnector>>,
        backends: Arc<dyn AudioBackends>,
    ) -> Self {
        Self {
            config,
            connector,
            backends,
            active: None,
        }
    }

    /// ALSA devices and the WebSocket endpoint named in `config`.
    pub fn from_config(config: Config) -> Self {
        let connector = config.api_key.as_deref().map(|key| {
            Arc::new(WsConnector::new(config.ws_url, key)) as Arc<dyn LiveConnector>
        });
        let backends = Arc::new(AlsaBackends::from_config(&config));
        Self::new(config, connector, backends)
    }

    pub fn active_session(&self) -> Option<SessionHandle> {
        self.active.as_ref().map(|a| a.handle.clone())
    }

    /// Join `channel`. Joining the channel that is already active returns its
    /// handle; joining another one while a session is live is refused.
    pub async fn join(
        &mut self,
        channel: ChannelInfo,
        user: UserIdentity,
    ) -> Result<SessionHandle, VoiceError> {
        if let Some(active) = self.active.take() {
            if active.is_live() {
                let result = if active.handle.channel.id == channel.id {
                    Ok(active.handle.clone())
                } else {
                    Err(VoiceError::AlreadyActive(active.handle.channel.name.clone()))
                };
                self.active = Some(active);
                return result;
            }
            // Ended on its own (remote close or failure); finish reaping it.
            self.finish(active).await;
        }

        let id = Uuid::new_v4();
        log::info!(
            "Joining voice channel '{}' as {} (session {})",
            channel.name,
            user.display_name,
            id
        );

        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (speakers_tx, speakers_rx) = watch::channel(SpeakerSet::new());
        let state_tx = Arc::new(state_tx);
        let speakers_tx = Arc::new(speakers_tx);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let gate = MuteGate::default();
        let clock = Arc::new(FrameClock::new(self.config.output_sample_rate));
        let scheduler = Arc::new(PlaybackScheduler::new(
            clock.clone(),
            self.config.output_sample_rate,
        ));
        let outbound = Arc::new(OutboundQueue::new(self.config.outbound_queue_capacity));
        let capture = self.connector.as_ref().map(|_| {
            CapturePipeline::new(
                self.backends.capture(),
                self.config.input_sample_rate,
                self.config.frame_size,
                gate.clone(),
            )
        });

        let handle = SessionHandle {
            id,
            channel: channel.clone(),
            user,
            state: state_rx,
            speakers: speakers_rx,
            gate,
            capture: capture.as_ref().map(CapturePipeline::meter).unwrap_or_default(),
            scheduler: scheduler.clone(),
            outbound: outbound.clone(),
        };

        let task = match (&self.connector, capture) {
            (Some(connector), Some(capture)) => {
                let timing = SessionTiming {
                    speaker_timeout: self.config.speaker_timeout,
                    teardown_timeout: self.config.teardown_timeout,
                    playback_period_frames: self.config.playback_period_frames,
                    input_sample_rate: self.config.input_sample_rate,
                };
                let session = SessionChannel::new(
                    self.config.assistant_name,
                    timing,
                    capture,
                    self.backends.playback(),
                    scheduler,
                    clock,
                    outbound.clone(),
                    state_tx.clone(),
                    speakers_tx.clone(),
                );
                let setup = SessionSetup {
                    model: self.config.model.to_string(),
                    voice: self.config.voice.to_string(),
                    system_instruction: self.config.instruction_for(&channel.name),
                };
                let link = LiveLink::new(
                    connector.clone(),
                    setup,
                    outbound,
                    session.events(),
                    self.config.connect_timeout,
                );
                Some(tokio::spawn(session.run(link, shutdown_rx)))
            }
            _ => {
                log::warn!("No API key found. Voice simulation mode only.");
                state_tx.send_replace(SessionState::Simulated);
                None
            }
        };

        self.active = Some(ActiveSession {
            handle: handle.clone(),
            state: state_tx,
            speakers: speakers_tx,
            shutdown: shutdown_tx,
            task,
        });
        Ok(handle)
    }

    /// Leave the session behind `handle`. Safe to call in any state and more
    /// than once; returns once every device is released.
    pub async fn leave(&mut self, handle: &SessionHandle) {
        match self.active.take_if(|a| a.handle.id == handle.id) {
            Some(active) => {
                log::info!("Leaving voice channel '{}'", active.handle.channel.name);
                self.finish(active).await;
            }
            None => log::debug!("Session {} already left", handle.id),
        }
    }

    pub fn set_muted(&self, handle: &SessionHandle, muted: bool) -> Result<(), VoiceError> {
        let active = self
            .active
            .as_ref()
            .filter(|a| a.handle.id == handle.id)
            .ok_or(VoiceError::UnknownSession(handle.id))?;
        active.handle.gate.set(muted);
        log::info!("Microphone {}", if muted { "muted" } else { "unmuted" });
        Ok(())
    }

    /// Leave whatever is active and join `channel`.
    pub async fn switch_channel(
        &mut self,
        channel: ChannelInfo,
        user: UserIdentity,
    ) -> Result<SessionHandle, VoiceError> {
        if let Some(active) = self.active.take() {
            if active.is_live() && active.handle.channel.id == channel.id {
                let handle = active.handle.clone();
                self.active = Some(active);
                return Ok(handle);
            }
            log::info!(
                "Switching from '{}' to '{}'",
                active.handle.channel.name,
                channel.name
            );
            self.finish(active).await;
        }
        self.join(channel, user).await
    }

    async fn finish(&self, mut active: ActiveSession) {
        // The session spends at most one timeout on its audio threads and one on its link.
        let limit = self.config.teardown_timeout * 2;
        active.shutdown.send_replace(true);
        if let Some(mut task) = active.task.take() {
            if tokio::time::timeout(limit, &mut task).await.is_err() {
                log::warn!(
                    "Session {} did not stop within {:?}, aborting",
                    active.handle.id,
                    limit
                );
                task.abort();
                // 等待任务真正被 drop，设备随之释放
                if tokio::time::timeout(self.config.teardown_timeout, task)
                    .await
                    .is_err()
                {
                    log::warn!("Session {} abort did not complete, detaching", active.handle.id);
                }
            }
        }

        active.state.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = SessionState::Closed;
                true
            }
        });
        active.speakers.send_replace(SpeakerSet::new());
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.shutdown.send_replace(true);
        }
    }
}
