//! # Audio Transport Module
//!
//! Handles the fixed audio format that crosses the WebSocket boundary in both
//! directions: raw 16-bit PCM from the browser microphone on the way in, and
//! base64-wrapped 16-bit PCM from speech synthesis on the way out.
//!
//! ## Audio Format Requirements:
//! - **Sample Rate**: 16kHz (16,000 Hz) by default, negotiated via config
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: Mono (1 channel)
//! - **Encoding**: Little-endian signed integers
//!
//! The client performs raw sample-rate-specific buffer conversion, so this
//! framing must be preserved exactly across the boundary.

pub mod pcm;

pub use pcm::PcmFormat;
