//! Conversion between f32 samples and 16-bit little-endian linear PCM.
//!
//! - Outbound: f32 frame → clamp → ×32767 → i16 LE bytes
//! - Inbound: base64 payload → i16 LE bytes → f32 buffer

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::{BufMut, Bytes, BytesMut};

use crate::error::VoiceError;

const PCM_SCALE: f32 = 32767.0;
const BYTES_PER_SAMPLE: usize = 2;

/// One hardware-sized slice of captured samples.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>) -> Self {
        Self { samples }
    }
}

/// Encoded outbound audio ready for the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBlob {
    pub data: Bytes,
    pub mime_type: String,
}

impl PcmBlob {
    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.data)
    }
}

/// Audio payload as received from the service, still transport-encoded.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundAudioChunk {
    pub data: String,
    pub mime_type: String,
}

/// Decoded interleaved samples plus the format needed to schedule them.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl DecodedBuffer {
    /// Number of sample frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    pub fn duration(&self) -> Duration {
        frames_to_duration(self.frames() as u64, self.sample_rate)
    }
}

/// Exact duration of `frames` at `sample_rate`, in whole nanoseconds.
pub fn frames_to_duration(frames: u64, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    let nanos = frames as u128 * 1_000_000_000 / sample_rate as u128;
    Duration::from_nanos(nanos as u64)
}

/// Frame index on a `sample_rate` timeline for the instant `at`, rounded to
/// the nearest frame so it inverts `frames_to_duration`.
pub fn duration_to_frames(at: Duration, sample_rate: u32) -> u64 {
    ((at.as_nanos() * sample_rate as u128 + 500_000_000) / 1_000_000_000) as u64
}

pub fn sample_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * PCM_SCALE).round() as i16
}

pub fn sample_from_i16(sample: i16) -> f32 {
    (sample as f32 / PCM_SCALE).clamp(-1.0, 1.0)
}

/// MIME type for outbound PCM at `sample_rate`.
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

/// Encode one captured frame as 16-bit signed little-endian PCM.
pub fn encode(frame: &[f32], sample_rate: u32) -> PcmBlob {
    let mut buf = BytesMut::with_capacity(frame.len() * BYTES_PER_SAMPLE);
    for &sample in frame {
        buf.put_i16_le(sample_to_i16(sample));
    }
    PcmBlob {
        data: buf.freeze(),
        mime_type: pcm_mime_type(sample_rate),
    }
}

/// Decode 16-bit signed little-endian PCM into normalized samples.
pub fn decode(bytes: &[u8], sample_rate: u32, channels: u16) -> Result<DecodedBuffer, VoiceError> {
    let block = BYTES_PER_SAMPLE * channels.max(1) as usize;
    if bytes.len() % block != 0 {
        return Err(VoiceError::MalformedAudioData(format!(
            "{} bytes is not a multiple of {} ({} channel(s) of 16-bit PCM)",
            bytes.len(),
            block,
            channels
        )));
    }

    let samples = bytes
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|pair| sample_from_i16(i16::from_le_bytes([pair[0], pair[1]])))
        .collect();

    Ok(DecodedBuffer {
        samples,
        sample_rate,
        channels,
    })
}

/// Decode a transport-encoded inbound chunk.
///
/// A `rate=` parameter in the chunk's MIME type overrides `default_rate`.
pub fn decode_chunk(
    chunk: &InboundAudioChunk,
    default_rate: u32,
    channels: u16,
) -> Result<DecodedBuffer, VoiceError> {
    let bytes = BASE64
        .decode(chunk.data.as_bytes())
        .map_err(|e| VoiceError::MalformedAudioData(format!("invalid base64 payload: {}", e)))?;
    let rate = rate_from_mime(&chunk.mime_type).unwrap_or(default_rate);
    decode(&bytes, rate, channels)
}

fn rate_from_mime(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .filter_map(|param| param.trim().strip_prefix("rate="))
        .find_map(|rate| rate.trim().parse().ok())
        .filter(|rate| *rate > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_clamps_and_scales() {
        let blob = encode(&[0.0, 1.0, -1.0, 2.0, -3.0, 0.5], 16000);
        let ints: Vec<i16> = blob
            .data
            .chunks_exact(2)
            .map(|p| i16::from_le_bytes([p[0], p[1]]))
            .collect();
        assert_eq!(ints, vec![0, 32767, -32767, 32767, -32767, 16384]);
        assert_eq!(blob.mime_type, "audio/pcm;rate=16000");
    }

    #[test]
    fn round_trip_stays_within_one_quantization_step() {
        let frame: Vec<f32> = (0..4096)
            .map(|i| ((i as f32) * 0.37).sin() * 1.2)
            .collect();
        let blob = encode(&frame, 16000);
        let decoded = decode(&blob.data, 16000, 1).unwrap();

        assert_eq!(decoded.samples.len(), frame.len());
        for (orig, back) in frame.iter().zip(&decoded.samples) {
            let expected = orig.clamp(-1.0, 1.0);
            assert!(
                (expected - back).abs() <= 1.0 / 32767.0,
                "sample {} came back as {}",
                expected,
                back
            );
        }
    }

    #[test]
    fn decode_rejects_partial_samples() {
        let err = decode(&[0, 1, 2], 24000, 1).unwrap_err();
        assert!(matches!(err, VoiceError::MalformedAudioData(_)));

        // Six bytes is three mono samples but one and a half stereo frames.
        assert!(decode(&[0; 6], 24000, 1).is_ok());
        assert!(decode(&[0; 6], 24000, 2).is_err());
    }

    #[test]
    fn decode_chunk_reads_rate_from_mime_type() {
        let raw = encode(&[0.25; 480], 48000);
        let chunk = InboundAudioChunk {
            data: raw.to_base64(),
            mime_type: "audio/pcm;rate=48000".to_string(),
        };
        let buffer = decode_chunk(&chunk, 24000, 1).unwrap();
        assert_eq!(buffer.sample_rate, 48000);
        assert_eq!(buffer.duration(), Duration::from_millis(10));

        let chunk = InboundAudioChunk {
            data: raw.to_base64(),
            mime_type: "audio/pcm".to_string(),
        };
        assert_eq!(decode_chunk(&chunk, 24000, 1).unwrap().sample_rate, 24000);
    }

    #[test]
    fn decode_chunk_rejects_bad_base64() {
        let chunk = InboundAudioChunk {
            data: "not*base64!".to_string(),
            mime_type: "audio/pcm;rate=24000".to_string(),
        };
        assert!(matches!(
            decode_chunk(&chunk, 24000, 1),
            Err(VoiceError::MalformedAudioData(_))
        ));
    }

    #[test]
    fn durations_are_exact() {
        assert_eq!(frames_to_duration(12000, 24000), Duration::from_millis(500));
        assert_eq!(frames_to_duration(7200, 24000), Duration::from_millis(300));
        assert_eq!(duration_to_frames(Duration::from_millis(800), 24000), 19200);
    }

    #[test]
    fn frame_index_survives_a_duration_round_trip() {
        // 1001 frames at 24 kHz is not a whole number of nanoseconds.
        for frames in [1, 1001, 2002, 48_001] {
            let at = frames_to_duration(frames, 24000);
            assert_eq!(duration_to_frames(at, 24000), frames);
        }
    }
}
