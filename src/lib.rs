//! Voice session core for Orbita voice channels.
//!
//! Bridges the local microphone to a Gemini Live session and plays the
//! model's audio back gaplessly, with barge-in and mute.

pub mod audio;
pub mod config;
pub mod controller;
pub mod error;
pub mod session;

#[cfg(test)]
mod tests;

pub use config::Config;
pub use controller::{ChannelInfo, SessionController, SessionHandle, UserIdentity};
pub use error::VoiceError;
pub use session::{SessionState, SpeakerSet};
