//! PCM16 wire codec for the live audio path.
//!
//! Microphone capture produces f32 samples in [-1.0, 1.0]; the wire wants
//! 16-bit little-endian PCM wrapped in base64. Model audio comes back the
//! same way at 24 kHz and is decoded into planar f32 buffers for playback.

use base64::engine::general_purpose;
use base64::Engine;

/// Sample rate the wire expects for microphone audio.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of audio the model sends back.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// MIME type attached to every outbound audio chunk.
pub const INPUT_MIME_TYPE: &str = "audio/pcm;rate=16000";

/// Quantize one f32 sample to signed 16-bit PCM.
///
/// Out-of-range input lands on the integer rails instead of wrapping.
pub(crate) fn quantize(sample: f32) -> i16 {
    // Float-to-int `as` casts saturate, so over-range values clamp.
    (sample * 32768.0).round() as i16
}

/// Encode f32 samples as interleaved 16-bit little-endian PCM bytes.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        out.extend_from_slice(&quantize(sample).to_le_bytes());
    }
    out
}

/// Encode f32 samples straight to the base64 string the wire carries.
pub fn encode_base64(samples: &[f32]) -> String {
    general_purpose::STANDARD.encode(encode_pcm16(samples))
}

/// Decode a base64 payload back to raw bytes.
pub fn from_base64(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    general_purpose::STANDARD.decode(data)
}

/// Model audio decoded into per-channel f32 buffers.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    /// One buffer per channel, all the same length.
    pub channels: Vec<Vec<f32>>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    /// Samples per channel.
    pub fn frames(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    /// Playback time of this chunk in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }
}

/// Decode interleaved 16-bit little-endian PCM into planar f32.
///
/// A trailing odd byte is dropped, and so is a trailing run of samples
/// too short to fill a whole frame across all channels.
pub fn decode_pcm16(bytes: &[u8], sample_rate: u32, channel_count: usize) -> DecodedAudio {
    if channel_count == 0 {
        return DecodedAudio {
            channels: Vec::new(),
            sample_rate,
        };
    }
    let frames = bytes.len() / 2 / channel_count;
    let mut channels = vec![Vec::with_capacity(frames); channel_count];
    for (i, pair) in bytes
        .chunks_exact(2)
        .take(frames * channel_count)
        .enumerate()
    {
        let sample = i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0;
        channels[i % channel_count].push(sample);
    }
    DecodedAudio {
        channels,
        sample_rate,
    }
}

/// Decode a base64 PCM payload in one step.
pub fn decode_base64(
    data: &str,
    sample_rate: u32,
    channel_count: usize,
) -> Result<DecodedAudio, base64::DecodeError> {
    Ok(decode_pcm16(&from_base64(data)?, sample_rate, channel_count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn round_trip_stays_within_one_step() {
        let mut rng = rand::rng();
        let signal: Vec<f32> = (0..4096).map(|_| rng.random_range(-1.0f32..1.0)).collect();
        let decoded = decode_pcm16(&encode_pcm16(&signal), INPUT_SAMPLE_RATE, 1);
        assert_eq!(decoded.frames(), signal.len());
        for (a, b) in signal.iter().zip(&decoded.channels[0]) {
            assert!((a - b).abs() <= 1.0 / 32768.0, "{a} decoded as {b}");
        }
    }

    #[test]
    fn full_scale_maps_to_the_rails() {
        assert_eq!(quantize(0.0), 0);
        assert_eq!(quantize(-1.0), i16::MIN);
        assert_eq!(quantize(1.0), i16::MAX);
    }

    #[test]
    fn over_range_samples_clamp() {
        let bytes = encode_pcm16(&[2.0, -2.0]);
        assert_eq!(&bytes[..2], &i16::MAX.to_le_bytes());
        assert_eq!(&bytes[2..], &i16::MIN.to_le_bytes());
    }

    #[test]
    fn trailing_odd_byte_is_dropped() {
        let mut bytes = encode_pcm16(&[0.25, -0.25]);
        bytes.push(0xab);
        let decoded = decode_pcm16(&bytes, OUTPUT_SAMPLE_RATE, 1);
        assert_eq!(decoded.frames(), 2);
    }

    #[test]
    fn partial_stereo_frame_is_dropped() {
        // Three samples cannot fill two stereo frames.
        let bytes = encode_pcm16(&[0.1, 0.2, 0.3]);
        let decoded = decode_pcm16(&bytes, OUTPUT_SAMPLE_RATE, 2);
        assert_eq!(decoded.channels.len(), 2);
        assert_eq!(decoded.frames(), 1);
        assert_eq!(decoded.channels[1].len(), 1);
    }

    #[test]
    fn duration_tracks_sample_rate() {
        let decoded = decode_pcm16(&vec![0u8; 48_000 * 2], OUTPUT_SAMPLE_RATE, 1);
        assert!((decoded.duration_secs() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn base64_round_trip() {
        let samples = [0.5f32, -0.5, 0.125];
        let decoded = decode_base64(&encode_base64(&samples), INPUT_SAMPLE_RATE, 1).unwrap();
        assert_eq!(decoded.frames(), 3);
        assert!((decoded.channels[0][2] - 0.125).abs() <= 1.0 / 32768.0);
    }

    #[test]
    fn garbage_base64_is_an_error() {
        assert!(decode_base64("not base64!!!", OUTPUT_SAMPLE_RATE, 1).is_err());
    }
}
