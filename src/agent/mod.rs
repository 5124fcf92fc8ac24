//! # Voice Agent Module
//!
//! The conversational half of the server: upstream service clients and the
//! per-connection session that ties them together.
//!
//! ## Key Components:
//! - **Chat Backend**: OpenAI-compatible chat completions with tool calling
//! - **Transcriber**: streaming Deepgram speech-to-text over WebSocket
//! - **Synthesizer**: Deepgram text-to-speech returning raw PCM
//! - **Conversation Session**: state machine, history window, tool loop

pub mod llm;
pub mod prompt;
pub mod session;
pub mod stt;
pub mod tts;

pub use llm::{ChatBackend, ChatMessage, ChatOutcome, OpenAiChat};
pub use session::{ConversationSession, SessionLimits, SessionState, Speaker, TurnReply};
pub use stt::SttStream;
pub use tts::{DeepgramTts, SpeechSynthesizer};
