use std::collections::VecDeque;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use crate::error::VoiceError;

use super::protocol::{ClientMessage, ServerEvent, ServerMessage};

/// An open connection to the live voice service.
///
/// `recv` must be cancel safe: it is raced against outbound sends and shutdown.
#[async_trait]
pub trait LiveConnection: Send {
    async fn send(&mut self, msg: ClientMessage) -> Result<(), VoiceError>;

    /// Next event from the service; `None` once the stream has ended.
    async fn recv(&mut self) -> Option<Result<ServerEvent, VoiceError>>;

    async fn close(&mut self);
}

/// Opens connections to the live voice service.
#[async_trait]
pub trait LiveConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn LiveConnection>, VoiceError>;
}

/// WebSocket connector for the Gemini Live endpoint.
pub struct WsConnector {
    url: String,
    api_key: String,
}

impl WsConnector {
    pub fn new(url: &str, api_key: &str) -> Self {
        Self {
            url: url.to_string(),
            api_key: api_key.to_string(),
        }
    }

    fn endpoint(&self) -> Result<Url, VoiceError> {
        let mut url = Url::parse(&self.url)
            .map_err(|e| VoiceError::Connection(format!("invalid ws url '{}': {}", self.url, e)))?;
        url.query_pairs_mut().append_pair("key", &self.api_key);
        Ok(url)
    }
}

#[async_trait]
impl LiveConnector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn LiveConnection>, VoiceError> {
        let url = self.endpoint()?;
        // 不要把 key 打进日志
        log::info!("Connecting to {}...", self.url);
        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| VoiceError::Connection(e.to_string()))?;
        log::info!("Connected!");
        Ok(Box::new(WsConnection {
            ws,
            pending: VecDeque::new(),
        }))
    }
}

pub struct WsConnection {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    pending: VecDeque<ServerEvent>,
}

impl WsConnection {
    fn queue_payload(&mut self, payload: &[u8]) {
        match ServerMessage::parse(payload) {
            Ok(msg) => self.pending.extend(msg.into_events()),
            Err(e) => log::warn!("Ignoring unparseable server message: {}", e),
        }
    }
}

#[async_trait]
impl LiveConnection for WsConnection {
    async fn send(&mut self, msg: ClientMessage) -> Result<(), VoiceError> {
        let json = serde_json::to_string(&msg).map_err(|e| VoiceError::SendFailure(e.to_string()))?;
        self.ws
            .send(Message::Text(json.into()))
            .await
            .map_err(send_error)
    }

    async fn recv(&mut self) -> Option<Result<ServerEvent, VoiceError>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(Ok(event));
            }
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => self.queue_payload(text.as_bytes()),
                // 服务端也会用二进制帧下发 JSON
                Some(Ok(Message::Binary(data))) => self.queue_payload(&data),
                Some(Ok(Message::Close(frame))) => {
                    log::info!("Server closed connection: {:?}", frame);
                    let reason = frame
                        .map(|f| f.reason.as_str().to_string())
                        .filter(|r| !r.is_empty());
                    return Some(Ok(ServerEvent::Closed(reason)));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Some(Err(VoiceError::Connection(e.to_string()))),
                None => return None,
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.ws.close(None).await {
            log::debug!("WebSocket close: {}", e);
        }
    }
}

/// A socket that is gone ends the session; anything else costs one frame.
fn send_error(e: WsError) -> VoiceError {
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => VoiceError::Connection(e.to_string()),
        other => VoiceError::SendFailure(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_socket_on_send_is_fatal() {
        assert!(send_error(WsError::ConnectionClosed).is_fatal());
        assert!(send_error(WsError::AlreadyClosed).is_fatal());
        assert!(!send_error(WsError::Utf8("bad frame".into())).is_fatal());
    }

    #[test]
    fn endpoint_appends_key() {
        let connector = WsConnector::new("wss://example.test/ws/live", "secret key");
        let url = connector.endpoint().unwrap();
        assert_eq!(url.as_str(), "wss://example.test/ws/live?key=secret+key");
    }

    #[test]
    fn invalid_url_is_a_connection_error() {
        let connector = WsConnector::new("not a url", "k");
        assert!(matches!(connector.endpoint(), Err(VoiceError::Connection(_))));
    }
}
