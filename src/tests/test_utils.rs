use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::audio::codec;
use crate::audio::{AudioBackends, CaptureBackend, InboundAudioChunk, PlaybackBackend};
use crate::config::Config;
use crate::controller::{ChannelInfo, SessionController, SessionHandle, UserIdentity};
use crate::error::VoiceError;
use crate::session::{ClientMessage, LiveConnection, LiveConnector, ServerEvent, SessionState};

pub const WAIT: Duration = Duration::from_secs(3);

/// Config with small frames and short timers so scenarios run quickly.
pub fn test_config() -> Config {
    Config {
        frame_size: 512,
        playback_period_frames: 240,
        connect_timeout: Duration::from_millis(200),
        outbound_queue_capacity: 8,
        speaker_timeout: Duration::from_millis(100),
        teardown_timeout: Duration::from_millis(500),
        api_key: Some("test-key".to_string()),
        ..Config::default()
    }
}

pub fn general() -> ChannelInfo {
    ChannelInfo::new("general", "General")
}

pub fn random() -> ChannelInfo {
    ChannelInfo::new("random", "Random")
}

pub fn test_user() -> UserIdentity {
    UserIdentity {
        id: "u-1".to_string(),
        display_name: "Tester".to_string(),
        avatar: None,
    }
}

// ======================== Devices ========================

/// Counts device opens and closes across every fake handed out.
#[derive(Debug, Default)]
pub struct DeviceLedger {
    capture_opens: AtomicUsize,
    playback_opens: AtomicUsize,
    open_now: AtomicI64,
}

impl DeviceLedger {
    pub fn capture_opens(&self) -> usize {
        self.capture_opens.load(Ordering::SeqCst)
    }

    pub fn playback_opens(&self) -> usize {
        self.playback_opens.load(Ordering::SeqCst)
    }

    /// Devices currently held open.
    pub fn open_handles(&self) -> i64 {
        self.open_now.load(Ordering::SeqCst)
    }
}

pub struct FakeCapture {
    ledger: Arc<DeviceLedger>,
    fail_open: bool,
    stall: Option<Duration>,
    reads: usize,
    open: bool,
}

impl CaptureBackend for FakeCapture {
    fn open(&mut self, _sample_rate: u32) -> Result<(), VoiceError> {
        if self.fail_open {
            return Err(VoiceError::DeviceUnavailable("no microphone".to_string()));
        }
        self.open = true;
        self.ledger.capture_opens.fetch_add(1, Ordering::SeqCst);
        self.ledger.open_now.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn read(&mut self, buf: &mut [f32]) -> Result<usize, VoiceError> {
        self.reads += 1;
        match self.stall {
            // The first read succeeds, the second hangs like a wedged driver.
            Some(stall) if self.reads == 2 => std::thread::sleep(stall),
            _ => std::thread::sleep(Duration::from_millis(2)),
        }
        buf.fill(0.25);
        Ok(buf.len())
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.ledger.open_now.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn period_samples(&self) -> usize {
        256
    }
}

impl Drop for FakeCapture {
    fn drop(&mut self) {
        self.close();
    }
}

/// Consumes samples at the real-time pace of a 24 kHz device.
pub struct FakePlayback {
    ledger: Arc<DeviceLedger>,
    fail_open: bool,
    open: bool,
}

impl PlaybackBackend for FakePlayback {
    fn open(&mut self, _sample_rate: u32) -> Result<(), VoiceError> {
        if self.fail_open {
            return Err(VoiceError::DeviceUnavailable("no speaker".to_string()));
        }
        self.open = true;
        self.ledger.playback_opens.fetch_add(1, Ordering::SeqCst);
        self.ledger.open_now.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn write(&mut self, samples: &[f32]) -> Result<(), VoiceError> {
        let micros = samples.len() as u64 * 1_000_000 / 24_000;
        std::thread::sleep(Duration::from_micros(micros));
        Ok(())
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.ledger.open_now.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for FakePlayback {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Default)]
pub struct FakeBackends {
    pub ledger: Arc<DeviceLedger>,
    pub capture_fails: bool,
    pub playback_fails: bool,
    /// Block the second microphone read for this long.
    pub capture_stall: Option<Duration>,
}

impl AudioBackends for FakeBackends {
    fn capture(&self) -> Box<dyn CaptureBackend> {
        Box::new(FakeCapture {
            ledger: self.ledger.clone(),
            fail_open: self.capture_fails,
            stall: self.capture_stall,
            reads: 0,
            open: false,
        })
    }

    fn playback(&self) -> Box<dyn PlaybackBackend> {
        Box::new(FakePlayback {
            ledger: self.ledger.clone(),
            fail_open: self.playback_fails,
            open: false,
        })
    }
}

// ======================== Service ========================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectBehavior {
    /// The connect attempt is rejected straight away.
    Refuse,
    /// The connect attempt never finishes.
    NeverOpens,
    /// Connects and acknowledges the setup; further events come from the script.
    Open,
}

/// What happens to each microphone frame the session sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioSends {
    Deliver,
    /// Every frame fails with a recoverable send error.
    Fail,
    /// The socket reports it is gone.
    Disconnect,
    /// The send never completes.
    Stall,
}

/// Stand-in for the live service, driven from the test through a `Script`.
pub struct ScriptedConnector {
    behavior: ConnectBehavior,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<ServerEvent>>>,
    sent: Arc<Mutex<Vec<ClientMessage>>>,
    closed: Arc<AtomicBool>,
    audio_sends: AudioSends,
    connects: AtomicUsize,
}

/// Test side of a `ScriptedConnector`.
pub struct Script {
    tx: mpsc::UnboundedSender<ServerEvent>,
    sent: Arc<Mutex<Vec<ClientMessage>>>,
    closed: Arc<AtomicBool>,
    connector: Arc<ScriptedConnector>,
}

impl ScriptedConnector {
    pub fn new(behavior: ConnectBehavior) -> (Arc<Self>, Script) {
        Self::build(behavior, AudioSends::Deliver)
    }

    /// Opens normally but every audio frame fails to send.
    pub fn with_failing_sends() -> (Arc<Self>, Script) {
        Self::build(ConnectBehavior::Open, AudioSends::Fail)
    }

    /// Opens normally; audio frames go out as `audio_sends` says.
    pub fn with_audio_sends(audio_sends: AudioSends) -> (Arc<Self>, Script) {
        Self::build(ConnectBehavior::Open, audio_sends)
    }

    fn build(behavior: ConnectBehavior, audio_sends: AudioSends) -> (Arc<Self>, Script) {
        let (tx, rx) = mpsc::unbounded_channel();
        if behavior == ConnectBehavior::Open {
            let _ = tx.send(ServerEvent::SetupComplete);
        }
        let sent = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let connector = Arc::new(Self {
            behavior,
            inbound: Mutex::new(Some(rx)),
            sent: sent.clone(),
            closed: closed.clone(),
            audio_sends,
            connects: AtomicUsize::new(0),
        });
        let script = Script {
            tx,
            sent,
            closed,
            connector: connector.clone(),
        };
        (connector, script)
    }
}

#[async_trait]
impl LiveConnector for ScriptedConnector {
    async fn connect(&self) -> Result<Box<dyn LiveConnection>, VoiceError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            ConnectBehavior::Refuse => Err(VoiceError::Connection("connection refused".to_string())),
            ConnectBehavior::NeverOpens => std::future::pending().await,
            ConnectBehavior::Open => {
                let inbound = self
                    .inbound
                    .lock()
                    .unwrap()
                    .take()
                    .ok_or_else(|| VoiceError::Connection("script already used".to_string()))?;
                Ok(Box::new(ScriptedConnection {
                    inbound,
                    sent: self.sent.clone(),
                    closed: self.closed.clone(),
                    audio_sends: self.audio_sends,
                }))
            }
        }
    }
}

struct ScriptedConnection {
    inbound: mpsc::UnboundedReceiver<ServerEvent>,
    sent: Arc<Mutex<Vec<ClientMessage>>>,
    closed: Arc<AtomicBool>,
    audio_sends: AudioSends,
}

#[async_trait]
impl LiveConnection for ScriptedConnection {
    async fn send(&mut self, msg: ClientMessage) -> Result<(), VoiceError> {
        if matches!(msg, ClientMessage::RealtimeInput(_)) {
            match self.audio_sends {
                AudioSends::Deliver => {}
                AudioSends::Fail => {
                    return Err(VoiceError::SendFailure("socket buffer full".to_string()));
                }
                AudioSends::Disconnect => {
                    return Err(VoiceError::Connection("connection reset by peer".to_string()));
                }
                AudioSends::Stall => std::future::pending().await,
            }
        }
        self.sent.lock().unwrap().push(msg);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<ServerEvent, VoiceError>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl Script {
    pub fn push(&self, event: ServerEvent) {
        self.tx.send(event).expect("link stopped reading");
    }

    pub fn audio(&self, ms: u64, value: f32) {
        self.push(ServerEvent::Audio(audio_chunk(ms, value)));
    }

    pub fn sent_setup(&self) -> Option<ClientMessage> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .find(|m| matches!(m, ClientMessage::Setup(_)))
            .cloned()
    }

    pub fn audio_sent(&self) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|m| matches!(m, ClientMessage::RealtimeInput(_)))
            .count()
    }

    pub fn connection_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.connector.connects.load(Ordering::SeqCst)
    }
}

/// `ms` of constant-value mono PCM at 24 kHz, as the service sends it.
pub fn audio_chunk(ms: u64, value: f32) -> InboundAudioChunk {
    let samples = vec![value; (24_000 * ms / 1000) as usize];
    let blob = codec::encode(&samples, 24_000);
    InboundAudioChunk {
        data: blob.to_base64(),
        mime_type: blob.mime_type,
    }
}

// ======================== Harness ========================

pub fn controller_with(
    connector: Option<Arc<ScriptedConnector>>,
    backends: FakeBackends,
) -> (SessionController, Arc<DeviceLedger>) {
    let ledger = backends.ledger.clone();
    let connector = connector.map(|c| c as Arc<dyn LiveConnector>);
    let controller = SessionController::new(test_config(), connector, Arc::new(backends));
    (controller, ledger)
}

pub async fn wait_for_state(handle: &SessionHandle, want: SessionState) {
    let mut rx = handle.subscribe_state();
    tokio::time::timeout(WAIT, rx.wait_for(|s| *s == want))
        .await
        .unwrap_or_else(|_| panic!("never reached {:?}, stuck in {:?}", want, handle.state()))
        .expect("state channel closed");
}

/// Poll `check` until it holds or `WAIT` runs out.
pub async fn eventually<F>(what: &str, check: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
