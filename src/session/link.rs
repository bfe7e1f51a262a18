use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::audio::InboundAudioChunk;
use crate::error::VoiceError;

use super::channel::SessionEvent;
use super::outbound::OutboundQueue;
use super::protocol::{ClientMessage, ServerEvent, SessionSetup};
use super::transport::{LiveConnection, LiveConnector};

/// How long a graceful close may take before the socket is simply dropped.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// What the link reports to the session task.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// The service acknowledged the setup; audio may flow.
    Open,
    Audio(InboundAudioChunk),
    Interrupted,
    TurnComplete,
    Closed(Option<String>),
    Failed(VoiceError),
}

/// Resolves once `shutdown` is set, or once its sender is gone.
pub(crate) async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Owns the connection to the live service for one session.
///
/// Connects, performs the setup handshake, then pumps outbound audio from the
/// queue and inbound events into the session's event queue until the remote
/// side closes or shutdown is signalled.
pub struct LiveLink {
    connector: Arc<dyn LiveConnector>,
    setup: SessionSetup,
    outbound: Arc<OutboundQueue>,
    events: mpsc::Sender<SessionEvent>,
    connect_timeout: Duration,
}

impl LiveLink {
    pub fn new(
        connector: Arc<dyn LiveConnector>,
        setup: SessionSetup,
        outbound: Arc<OutboundQueue>,
        events: mpsc::Sender<SessionEvent>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            setup,
            outbound,
            events,
            connect_timeout,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let opened = tokio::select! {
            res = tokio::time::timeout(self.connect_timeout, self.open()) => res,
            _ = cancelled(&mut shutdown) => {
                log::info!("Connect cancelled");
                return;
            }
        };

        let mut conn = match opened {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                log::error!("Live session failed to open: {}", e);
                self.emit(LinkEvent::Failed(e), &mut shutdown).await;
                return;
            }
            Err(_) => {
                let e = VoiceError::Connection(format!(
                    "service did not open the session within {:?}",
                    self.connect_timeout
                ));
                log::error!("{}", e);
                self.emit(LinkEvent::Failed(e), &mut shutdown).await;
                return;
            }
        };

        log::info!("Live session open");
        if !self.emit(LinkEvent::Open, &mut shutdown).await {
            close_quietly(conn.as_mut()).await;
            return;
        }

        let ended = self.pump(conn.as_mut(), &mut shutdown).await;
        close_quietly(conn.as_mut()).await;
        if let Some(event) = ended {
            self.emit(event, &mut shutdown).await;
        }
        log::info!("Live link finished");
    }

    /// Connect and wait for the service to acknowledge the setup message.
    async fn open(&self) -> Result<Box<dyn LiveConnection>, VoiceError> {
        let mut conn = self.connector.connect().await?;

        let setup = ClientMessage::setup(&self.setup);
        log::debug!("Sending setup for model {}", self.setup.model);
        conn.send(setup)
            .await
            .map_err(|e| VoiceError::Connection(format!("setup not sent: {}", e)))?;

        loop {
            match conn.recv().await {
                Some(Ok(ServerEvent::SetupComplete)) => return Ok(conn),
                Some(Ok(ServerEvent::Closed(reason))) => {
                    return Err(VoiceError::Connection(format!(
                        "closed during setup: {}",
                        reason.unwrap_or_else(|| "no reason given".to_string())
                    )));
                }
                Some(Ok(other)) => log::debug!("Ignoring {:?} before setup completed", other),
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(VoiceError::Connection(
                        "connection ended during setup".to_string(),
                    ));
                }
            }
        }
    }

    /// Returns the event that ended the session, or `None` on shutdown.
    async fn pump(
        &self,
        conn: &mut dyn LiveConnection,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<LinkEvent> {
        let mut outbound_open = true;
        loop {
            tokio::select! {
                _ = cancelled(shutdown) => return None,

                event = conn.recv() => {
                    let forward = match event {
                        Some(Ok(ServerEvent::Audio(chunk))) => LinkEvent::Audio(chunk),
                        Some(Ok(ServerEvent::Interrupted)) => LinkEvent::Interrupted,
                        Some(Ok(ServerEvent::TurnComplete)) => LinkEvent::TurnComplete,
                        Some(Ok(ServerEvent::GoAway(time_left))) => {
                            log::warn!("Service will close the session soon (time left: {:?})", time_left);
                            continue;
                        }
                        Some(Ok(ServerEvent::SetupComplete)) => continue,
                        Some(Ok(ServerEvent::Closed(reason))) => return Some(LinkEvent::Closed(reason)),
                        Some(Err(e)) => return Some(LinkEvent::Failed(e)),
                        None => return Some(LinkEvent::Closed(None)),
                    };
                    if !self.emit(forward, shutdown).await {
                        return None;
                    }
                }

                blob = self.outbound.pop(), if outbound_open => {
                    let Some(blob) = blob else {
                        outbound_open = false;
                        continue;
                    };
                    // 不等待确认，失败的帧直接丢弃
                    tokio::select! {
                        res = conn.send(ClientMessage::realtime_audio(&blob)) => match res {
                            Ok(()) => self.outbound.record_sent(),
                            Err(e) if e.is_fatal() => return Some(LinkEvent::Failed(e)),
                            Err(e) => {
                                self.outbound.record_send_failure();
                                log::debug!("Dropped outbound frame: {}", e);
                            }
                        },
                        _ = cancelled(shutdown) => return None,
                    }
                }
            }
        }
    }

    /// Hand an event to the session task. `false` if the session is gone.
    async fn emit(&self, event: LinkEvent, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            res = self.events.send(SessionEvent::Link(event)) => res.is_ok(),
            _ = cancelled(shutdown) => false,
        }
    }
}

async fn close_quietly(conn: &mut dyn LiveConnection) {
    if tokio::time::timeout(CLOSE_GRACE, conn.close()).await.is_err() {
        log::warn!("Connection did not close within {:?}, dropping it", CLOSE_GRACE);
    }
}
