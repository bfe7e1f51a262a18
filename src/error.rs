use thiserror::Error;
use uuid::Uuid;

/// Failures surfaced by the voice session core.
///
/// Only `DeviceUnavailable` and `Connection` end a session; a
/// `MalformedAudioData` chunk or a `SendFailure` frame is dropped and the
/// session keeps running.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VoiceError {
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("malformed audio data: {0}")]
    MalformedAudioData(String),

    #[error("send failure: {0}")]
    SendFailure(String),

    #[error("a voice session for channel '{0}' is already active")]
    AlreadyActive(String),

    #[error("no active voice session with id {0}")]
    UnknownSession(Uuid),
}

impl VoiceError {
    /// Whether this error terminates the session that raised it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VoiceError::DeviceUnavailable(_) | VoiceError::Connection(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_device_and_connection_errors_end_a_session() {
        assert!(VoiceError::DeviceUnavailable("hw:0".into()).is_fatal());
        assert!(VoiceError::Connection("reset".into()).is_fatal());
        assert!(!VoiceError::MalformedAudioData("odd length".into()).is_fatal());
        assert!(!VoiceError::SendFailure("buffer full".into()).is_fatal());
        assert!(!VoiceError::AlreadyActive("General".into()).is_fatal());
        assert!(!VoiceError::UnknownSession(Uuid::nil()).is_fatal());
    }
}
