//! # Error Handling
//!
//! Two error families live here:
//!
//! - [`AppError`] covers the HTTP surface (health, metrics, config endpoints)
//!   and converts to JSON error responses via `ResponseError`.
//! - [`AgentError`] covers the voice pipeline (transcription, chat
//!   completion, synthesis, tool dispatch). These never become HTTP
//!   responses; they are logged, surfaced to the caller as a spoken apology
//!   plus an `error` WebSocket message, and counted toward the forced
//!   disconnect threshold.
//!
//! ## Error Response Format (HTTP):
//! ```json
//! {
//!   "error": {
//!     "type": "validation_error",
//!     "message": "Server port cannot be 0",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors surfaced by the HTTP API.
#[derive(Debug)]
pub enum AppError {
    /// Server-side problems (500)
    Internal(String),

    /// Client sent invalid or malformed data (400)
    BadRequest(String),

    /// Configuration file or environment variable problems (500)
    ConfigError(String),

    /// User input failed validation rules (400)
    ValidationError(String),

    /// Server is at its concurrent session capacity (503)
    CapacityExceeded(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::CapacityExceeded(msg) => write!(f, "Capacity exceeded: {}", msg),
        }
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
            AppError::ConfigError(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                msg.clone(),
            ),
            AppError::ValidationError(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "validation_error",
                msg.clone(),
            ),
            AppError::CapacityExceeded(msg) => (
                actix_web::http::StatusCode::SERVICE_UNAVAILABLE,
                "capacity_exceeded",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Which upstream service an [`AgentError::Upstream`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamService {
    Transcription,
    Chat,
    Synthesis,
}

impl fmt::Display for UpstreamService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamService::Transcription => write!(f, "transcription"),
            UpstreamService::Chat => write!(f, "chat"),
            UpstreamService::Synthesis => write!(f, "synthesis"),
        }
    }
}

/// Errors raised inside the voice agent pipeline.
#[derive(Debug)]
pub enum AgentError {
    /// An upstream service call failed after its retry was spent
    Upstream {
        service: UpstreamService,
        message: String,
    },

    /// An upstream service call did not complete within its deadline
    Timeout {
        service: UpstreamService,
        seconds: u64,
    },

    /// The LLM kept requesting tool calls past the per-turn round limit
    ToolLoopExceeded { rounds: u32 },

    /// The LLM response carried neither text nor tool calls
    EmptyCompletion,

    /// WebSocket or channel plumbing failure within the session
    Transport(String),
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::Upstream { service, message } => {
                write!(f, "{} service error: {}", service, message)
            }
            AgentError::Timeout { service, seconds } => {
                write!(f, "{} service timed out after {}s", service, seconds)
            }
            AgentError::ToolLoopExceeded { rounds } => {
                write!(f, "Tool call loop exceeded {} rounds", rounds)
            }
            AgentError::EmptyCompletion => {
                write!(f, "Chat completion contained no content")
            }
            AgentError::Transport(msg) => write!(f, "Transport error: {}", msg),
        }
    }
}

impl std::error::Error for AgentError {}

impl AgentError {
    /// Short description safe to show (and speak) to the caller. Upstream
    /// detail stays in the logs.
    pub fn user_message(&self) -> &'static str {
        match self {
            AgentError::Upstream { .. } | AgentError::Timeout { .. } => {
                "I'm having trouble reaching our systems right now."
            }
            AgentError::ToolLoopExceeded { .. } | AgentError::EmptyCompletion => {
                "I wasn't able to complete that request."
            }
            AgentError::Transport(_) => "The connection hit a problem.",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_error_display() {
        let err = AppError::ValidationError("Server port cannot be 0".to_string());
        assert_eq!(err.to_string(), "Validation error: Server port cannot be 0");
    }

    #[test]
    fn test_agent_error_display() {
        let err = AgentError::Upstream {
            service: UpstreamService::Chat,
            message: "status 500".to_string(),
        };
        assert_eq!(err.to_string(), "chat service error: status 500");

        let err = AgentError::Timeout {
            service: UpstreamService::Synthesis,
            seconds: 15,
        };
        assert_eq!(err.to_string(), "synthesis service timed out after 15s");
    }

    #[test]
    fn test_user_message_hides_detail() {
        let err = AgentError::Upstream {
            service: UpstreamService::Chat,
            message: "api key sk-secret rejected".to_string(),
        };
        assert!(!err.user_message().contains("sk-secret"));
    }
}
