//! audio - capture, playback scheduling and PCM codec
//!
//! Uses ALSA for audio I/O on dedicated OS threads (not tokio tasks) so
//! real-time reads and writes never contend with the network tasks.

mod alsa_device;
pub mod capture;
pub mod codec;
pub mod playback;

pub use alsa_device::{AlsaCapture, AlsaPlayback};
pub use capture::{CaptureBackend, CaptureMeter, CapturePipeline, CaptureStats, MuteGate};
pub use codec::{AudioFrame, DecodedBuffer, InboundAudioChunk, PcmBlob};
pub use playback::{
    FrameClock, OutputClock, PlaybackBackend, PlaybackOutput, PlaybackScheduler, ScheduledSlot,
};

use crate::config::Config;

/// Creates fresh device handles for each session.
pub trait AudioBackends: Send + Sync {
    fn capture(&self) -> Box<dyn CaptureBackend>;
    fn playback(&self) -> Box<dyn PlaybackBackend>;
}

/// ALSA devices named in the configuration.
#[derive(Debug, Clone)]
pub struct AlsaBackends {
    capture_device: String,
    playback_device: String,
    playback_channels: u32,
    period_frames: usize,
}

impl AlsaBackends {
    pub fn from_config(config: &Config) -> Self {
        Self {
            capture_device: config.capture_device.to_string(),
            playback_device: config.playback_device.to_string(),
            playback_channels: config.playback_channels,
            period_frames: config.playback_period_frames,
        }
    }
}

impl AudioBackends for AlsaBackends {
    fn capture(&self) -> Box<dyn CaptureBackend> {
        Box::new(AlsaCapture::new(&self.capture_device))
    }

    fn playback(&self) -> Box<dyn PlaybackBackend> {
        Box::new(AlsaPlayback::new(
            &self.playback_device,
            self.playback_channels,
            self.period_frames,
        ))
    }
}
