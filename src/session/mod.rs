//! session - connection to the live voice service and the per-session state machine

pub mod channel;
pub mod link;
pub mod outbound;
pub mod protocol;
pub mod transport;

pub use channel::{SessionChannel, SessionEvent, SessionState, SessionTiming, SpeakerSet};
pub use link::{LinkEvent, LiveLink};
pub use outbound::{OutboundQueue, OutboundStats};
pub use protocol::{ClientMessage, ServerEvent, SessionSetup};
pub use transport::{LiveConnection, LiveConnector, WsConnector};
