//! # PCM Transport Codec
//!
//! Validation and conversion for the 16-bit linear PCM frames exchanged with
//! the browser client, plus the base64 envelope used to embed synthesized
//! audio in JSON WebSocket messages.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// The audio format negotiated with the client.
///
/// ## Defaults:
/// 16kHz, mono, 16-bit: the format both the STT and TTS services speak
/// (`encoding=linear16`), so no resampling happens server-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u8,
    pub bit_depth: u8,
}

impl Default for PcmFormat {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            bit_depth: 16,
        }
    }
}

impl PcmFormat {
    pub fn new(sample_rate: u32, channels: u8, bit_depth: u8) -> Self {
        Self {
            sample_rate,
            channels,
            bit_depth,
        }
    }

    /// Bytes of audio per second at this format (used for duration math).
    pub fn bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.channels as usize * (self.bit_depth as usize / 8)
    }

    /// Duration in seconds of a raw PCM byte buffer at this format.
    pub fn duration_seconds(&self, byte_len: usize) -> f64 {
        byte_len as f64 / self.bytes_per_second() as f64
    }

    /// Validate an incoming microphone frame.
    ///
    /// ## Checks:
    /// 1. Non-empty
    /// 2. Even length (16-bit samples)
    ///
    /// Anything beyond structural validity is the STT service's problem; the
    /// client declares its format once at connection time.
    pub fn validate_chunk(&self, data: &[u8]) -> Result<(), String> {
        if data.is_empty() {
            return Err("Audio frame is empty".to_string());
        }
        if data.len() % 2 != 0 {
            return Err("Audio frame length must be even for 16-bit samples".to_string());
        }
        Ok(())
    }

    /// Decode raw little-endian bytes into 16-bit samples.
    pub fn decode_samples(&self, data: &[u8]) -> Result<Vec<i16>, String> {
        self.validate_chunk(data)?;

        let mut cursor = Cursor::new(data);
        let mut samples = Vec::with_capacity(data.len() / 2);
        while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
            samples.push(sample);
        }
        Ok(samples)
    }

    /// Encode 16-bit samples back into little-endian bytes.
    pub fn encode_samples(&self, samples: &[i16]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(samples.len() * 2);
        for &sample in samples {
            // Writing to a Vec cannot fail
            bytes.write_i16::<LittleEndian>(sample).unwrap();
        }
        bytes
    }
}

/// Wrap raw PCM bytes in base64 for the JSON `audio` message.
pub fn encode_base64(data: &[u8]) -> String {
    BASE64_STANDARD.encode(data)
}

/// Unwrap base64-embedded PCM (used by tests and any server-side playback
/// tooling; the browser client does the production-side decode).
pub fn decode_base64(data: &str) -> Result<Vec<u8>, String> {
    BASE64_STANDARD
        .decode(data)
        .map_err(|e| format!("Invalid base64 audio payload: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_format() {
        let format = PcmFormat::default();
        assert_eq!(format.sample_rate, 16000);
        assert_eq!(format.channels, 1);
        assert_eq!(format.bit_depth, 16);
        assert_eq!(format.bytes_per_second(), 32000);
    }

    #[test]
    fn test_validate_chunk() {
        let format = PcmFormat::default();
        assert!(format.validate_chunk(&[0u8; 320]).is_ok());
        assert!(format.validate_chunk(&[]).is_err());
        // Odd length cannot hold complete 16-bit samples
        assert!(format.validate_chunk(&[0u8; 321]).is_err());
    }

    #[test]
    fn test_sample_decode_encode() {
        let format = PcmFormat::default();
        let samples = vec![0i16, 1000, -1000, i16::MAX, i16::MIN];
        let bytes = format.encode_samples(&samples);
        assert_eq!(bytes.len(), samples.len() * 2);

        let decoded = format.decode_samples(&bytes).unwrap();
        assert_eq!(decoded, samples);
    }

    #[test]
    fn test_duration_math() {
        let format = PcmFormat::default();
        // 1 second of 16-bit mono 16kHz audio is 32000 bytes
        assert!((format.duration_seconds(32000) - 1.0).abs() < f64::EPSILON);
        assert!((format.duration_seconds(16000) - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_base64_envelope() {
        let pcm = vec![1u8, 2, 3, 4, 255, 0];
        let encoded = encode_base64(&pcm);
        let decoded = decode_base64(&encoded).unwrap();
        assert_eq!(decoded, pcm);

        assert!(decode_base64("not!!valid@@base64").is_err());
    }
}
