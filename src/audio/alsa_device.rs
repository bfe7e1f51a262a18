//! ALSA PCM device wrappers for audio capture and playback.

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result};

use crate::error::VoiceError;

use super::capture::CaptureBackend;
use super::codec::{sample_from_i16, sample_to_i16};
use super::playback::PlaybackBackend;

/// Give up on a single write after this many consecutive XRUN recoveries.
const MAX_WRITE_RECOVERIES: u32 = 3;

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone)]
pub struct AlsaParams {
    /// Actual number of channels
    pub channels: u32,
    /// Period size in frames (one frame = channels × sample_width)
    pub period_size: usize,
}

/// Open a PCM device for capture (recording).
pub fn open_capture(device: &str, sample_rate: u32, channels: u32) -> Result<(PCM, AlsaParams)> {
    open_pcm(device, Direction::Capture, sample_rate, channels, None, "Capture")
}

/// Open a PCM device for playback.
pub fn open_playback(
    device: &str,
    sample_rate: u32,
    channels: u32,
    period_size: Option<usize>,
) -> Result<(PCM, AlsaParams)> {
    open_pcm(
        device,
        Direction::Playback,
        sample_rate,
        channels,
        period_size,
        "Playback",
    )
}

fn open_pcm(
    device: &str,
    direction: Direction,
    sample_rate: u32,
    channels: u32,
    period_size: Option<usize>,
    dir_name: &str,
) -> Result<(PCM, AlsaParams)> {
    let pcm = PCM::new(device, direction, false)
        .with_context(|| format!("Failed to open PCM device '{}' for {}", device, dir_name))?;

    {
        let hwp = HwParams::any(&pcm).with_context(|| "Failed to initialize HwParams")?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::S16LE)?;
        hwp.set_channels(channels)?;
        hwp.set_rate_near(sample_rate, ValueOr::Nearest)?;
        if let Some(ps) = period_size {
            hwp.set_period_size_near(ps as alsa::pcm::Frames, ValueOr::Nearest)?;
        }
        pcm.hw_params(&hwp)?;
    }

    let (actual_rate, actual_channels, period_size) = {
        let hwp = pcm.hw_params_current()?;
        let rate = hwp.get_rate()?;
        let ch = hwp.get_channels()?;
        let ps = hwp.get_period_size()? as usize;
        (rate, ch, ps)
    };

    // The scheduler's timeline and the wire format both assume the exact rate.
    if actual_rate != sample_rate {
        anyhow::bail!(
            "{} device '{}' negotiated {} Hz, {} Hz required (use a plug device)",
            dir_name,
            device,
            actual_rate,
            sample_rate
        );
    }

    let params = AlsaParams {
        channels: actual_channels,
        period_size,
    };

    log::info!(
        "ALSA {}: device={}, rate={}, channels={}, period_size={}",
        dir_name,
        device,
        actual_rate,
        actual_channels,
        period_size,
    );

    Ok((pcm, params))
}

fn unavailable(e: anyhow::Error) -> VoiceError {
    VoiceError::DeviceUnavailable(format!("{:#}", e))
}

// ======================== Capture ========================

/// Mono capture from an ALSA device.
pub struct AlsaCapture {
    device: String,
    pcm: Option<PCM>,
    params: Option<AlsaParams>,
    read_buf: Vec<i16>,
}

impl AlsaCapture {
    pub fn new(device: &str) -> Self {
        Self {
            device: device.to_string(),
            pcm: None,
            params: None,
            read_buf: Vec::new(),
        }
    }
}

impl CaptureBackend for AlsaCapture {
    fn open(&mut self, sample_rate: u32) -> Result<(), VoiceError> {
        let (pcm, params) = open_capture(&self.device, sample_rate, 1).map_err(unavailable)?;
        self.pcm = Some(pcm);
        self.params = Some(params);
        Ok(())
    }

    fn read(&mut self, buf: &mut [f32]) -> Result<usize, VoiceError> {
        let pcm = self
            .pcm
            .as_ref()
            .ok_or_else(|| VoiceError::DeviceUnavailable("capture device not open".to_string()))?;
        let channels = self.params.as_ref().map_or(1, |p| p.channels.max(1)) as usize;

        let frames = buf.len();
        self.read_buf.resize(frames * channels, 0);
        let io = pcm
            .io_i16()
            .map_err(|e| VoiceError::DeviceUnavailable(e.to_string()))?;

        match io.readi(&mut self.read_buf) {
            Ok(n) => {
                // Average interleaved channels down to mono.
                for (i, out) in buf.iter_mut().take(n).enumerate() {
                    let frame = &self.read_buf[i * channels..(i + 1) * channels];
                    let sum: f32 = frame.iter().map(|s| sample_from_i16(*s)).sum();
                    *out = sum / channels as f32;
                }
                Ok(n)
            }
            Err(e) => {
                log::warn!("ALSA capture error: {}, recovering...", e);
                pcm.prepare().map_err(|e2| {
                    VoiceError::DeviceUnavailable(format!("failed to recover PCM capture: {}", e2))
                })?;
                Ok(0)
            }
        }
    }

    fn close(&mut self) {
        if let Some(pcm) = self.pcm.take() {
            let _ = pcm.drop();
            log::info!("ALSA Capture closed: device={}", self.device);
        }
        self.params = None;
    }

    fn period_samples(&self) -> usize {
        self.params.as_ref().map_or(1024, |p| p.period_size.max(1))
    }
}

// ======================== Playback ========================

/// Playback to an ALSA device; mono input is duplicated across `channels`.
pub struct AlsaPlayback {
    device: String,
    channels: u32,
    period_frames: usize,
    pcm: Option<PCM>,
    write_buf: Vec<i16>,
}

impl AlsaPlayback {
    pub fn new(device: &str, channels: u32, period_frames: usize) -> Self {
        Self {
            device: device.to_string(),
            channels: channels.max(1),
            period_frames,
            pcm: None,
            write_buf: Vec::new(),
        }
    }
}

impl PlaybackBackend for AlsaPlayback {
    fn open(&mut self, sample_rate: u32) -> Result<(), VoiceError> {
        let period = (self.period_frames > 0).then_some(self.period_frames);
        let (pcm, params) =
            open_playback(&self.device, sample_rate, self.channels, period).map_err(unavailable)?;
        self.channels = params.channels.max(1);
        self.pcm = Some(pcm);
        Ok(())
    }

    fn write(&mut self, samples: &[f32]) -> Result<(), VoiceError> {
        let pcm = self
            .pcm
            .as_ref()
            .ok_or_else(|| VoiceError::DeviceUnavailable("playback device not open".to_string()))?;
        let channels = self.channels as usize;

        self.write_buf.clear();
        for &sample in samples {
            let s = sample_to_i16(sample);
            self.write_buf.extend(std::iter::repeat_n(s, channels));
        }

        let io = pcm
            .io_i16()
            .map_err(|e| VoiceError::DeviceUnavailable(e.to_string()))?;

        // Retry short writes and XRUNs without losing frames.
        let total_frames = samples.len();
        let mut frames_written = 0;
        let mut retry_count = 0u32;
        while frames_written < total_frames {
            let offset = frames_written * channels;
            match io.writei(&self.write_buf[offset..]) {
                Ok(n) => {
                    frames_written += n;
                    retry_count = 0;
                }
                Err(e) => {
                    log::warn!("ALSA XRUN or error: {}, recovering...", e);
                    retry_count += 1;
                    if let Err(e2) = pcm.prepare() {
                        return Err(VoiceError::DeviceUnavailable(format!(
                            "failed to recover PCM playback: {}",
                            e2
                        )));
                    }
                    if retry_count >= MAX_WRITE_RECOVERIES {
                        log::error!(
                            "Max recovery retries ({}) reached. Dropping {} unwritten frames.",
                            retry_count,
                            total_frames - frames_written
                        );
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        if let Some(pcm) = self.pcm.take() {
            // Discard whatever is still queued in the hardware buffer.
            let _ = pcm.drop();
            log::info!("ALSA Playback closed: device={}", self.device);
        }
    }
}
