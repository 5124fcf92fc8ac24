//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - Built-in defaults
//! - TOML configuration file (config.toml, optional)
//! - Environment variables with an APP_ prefix
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER_HOST, HOST/PORT platform overrides)
//! 2. Configuration file (config.toml)
//! 3. Default values
//!
//! Upstream API keys are env-only (`OPENAI_API_KEY`, `DEEPGRAM_API_KEY`) and
//! never serialized, so the `/api/v1/config` endpoint cannot leak them.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub audio: AudioConfig,
    pub agent: AgentConfig,
    pub session: SessionConfig,
    pub performance: PerformanceConfig,
    pub data: DataConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// PCM format expected from the browser microphone and produced for
/// playback. Both upstream speech services are asked for the same format,
/// so nothing is resampled server-side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u8,
    pub bit_depth: u8,
}

/// Upstream AI service selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Chat completion model for the conversation loop
    pub llm_model: String,
    /// Base URL of the OpenAI-compatible chat API
    pub llm_base_url: String,
    /// Deepgram streaming transcription model
    pub stt_model: String,
    /// Deepgram synthesis voice
    pub tts_voice: String,
    /// Read from OPENAI_API_KEY, never from files, never serialized
    #[serde(skip_serializing, default)]
    pub openai_api_key: String,
    /// Read from DEEPGRAM_API_KEY, never from files, never serialized
    #[serde(skip_serializing, default)]
    pub deepgram_api_key: String,
}

/// Per-conversation behavior limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Sliding window of turns kept as LLM context
    pub max_history_turns: usize,
    /// Tool call rounds allowed within a single turn
    pub max_tool_rounds: u32,
    /// Consecutive pipeline failures before the session is force-closed
    pub max_consecutive_failures: u32,
    /// Deadline applied to every upstream service call
    pub upstream_timeout_secs: u64,
    /// Caller phrases that end the conversation
    pub goodbye_phrases: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Path to a pharmacy dataset JSON file. When unset the bundled
    /// dataset is used.
    pub file: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            audio: AudioConfig {
                sample_rate: 16000,
                channels: 1,
                bit_depth: 16,
            },
            agent: AgentConfig {
                llm_model: "gpt-4o-mini".to_string(),
                llm_base_url: "https://api.openai.com/v1".to_string(),
                stt_model: "nova-3".to_string(),
                tts_voice: "aura-2-thalia-en".to_string(),
                openai_api_key: String::new(),
                deepgram_api_key: String::new(),
            },
            session: SessionConfig {
                max_history_turns: 20,
                max_tool_rounds: 5,
                max_consecutive_failures: 3,
                upstream_timeout_secs: 15,
                goodbye_phrases: vec![
                    "goodbye".to_string(),
                    "bye".to_string(),
                    "take care".to_string(),
                    "thank you for calling".to_string(),
                ],
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 10,
            },
            data: DataConfig { file: None },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, config.toml, and the environment.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        // Deployment platforms commonly inject bare HOST/PORT
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let mut config: AppConfig = settings.build()?.try_deserialize()?;

        // API keys are env-only
        if let Ok(key) = env::var("OPENAI_API_KEY") {
            config.agent.openai_api_key = key;
        }
        if let Ok(key) = env::var("DEEPGRAM_API_KEY") {
            config.agent.deepgram_api_key = key;
        }

        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// API keys are deliberately not checked here so the HTTP surface and
    /// the test suite can run without upstream credentials; the voice
    /// endpoint checks them at connection time.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.audio.sample_rate == 0 {
            return Err(anyhow::anyhow!("Audio sample rate cannot be 0"));
        }

        if self.audio.bit_depth != 16 {
            return Err(anyhow::anyhow!(
                "Only 16-bit PCM is supported, got {}-bit",
                self.audio.bit_depth
            ));
        }

        if self.audio.channels != 1 {
            return Err(anyhow::anyhow!(
                "Only mono audio is supported, got {} channels",
                self.audio.channels
            ));
        }

        if self.session.max_history_turns == 0 {
            return Err(anyhow::anyhow!("Max history turns must be greater than 0"));
        }

        if self.session.max_tool_rounds == 0 {
            return Err(anyhow::anyhow!("Max tool rounds must be greater than 0"));
        }

        if self.session.max_consecutive_failures == 0 {
            return Err(anyhow::anyhow!(
                "Max consecutive failures must be greater than 0"
            ));
        }

        if self.session.upstream_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Upstream timeout must be greater than 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!(
                "Max concurrent sessions must be greater than 0"
            ));
        }

        Ok(())
    }

    /// Apply a partial update from a JSON body (runtime config endpoint).
    /// Only fields that are safe to change while sessions are live are
    /// accepted; server binding, audio format, and API keys are not.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(agent) = partial_config.get("agent") {
            if let Some(model) = agent.get("llm_model").and_then(|v| v.as_str()) {
                self.agent.llm_model = model.to_string();
            }
            if let Some(model) = agent.get("stt_model").and_then(|v| v.as_str()) {
                self.agent.stt_model = model.to_string();
            }
            if let Some(voice) = agent.get("tts_voice").and_then(|v| v.as_str()) {
                self.agent.tts_voice = voice.to_string();
            }
        }

        if let Some(session) = partial_config.get("session") {
            if let Some(turns) = session.get("max_history_turns").and_then(|v| v.as_u64()) {
                self.session.max_history_turns = turns as usize;
            }
            if let Some(rounds) = session.get("max_tool_rounds").and_then(|v| v.as_u64()) {
                self.session.max_tool_rounds = rounds as u32;
            }
            if let Some(failures) = session
                .get("max_consecutive_failures")
                .and_then(|v| v.as_u64())
            {
                self.session.max_consecutive_failures = failures as u32;
            }
            if let Some(secs) = session.get("upstream_timeout_secs").and_then(|v| v.as_u64()) {
                self.session.upstream_timeout_secs = secs;
            }
        }

        if let Some(performance) = partial_config.get("performance") {
            if let Some(sessions) = performance
                .get("max_concurrent_sessions")
                .and_then(|v| v.as_u64())
            {
                self.performance.max_concurrent_sessions = sessions as usize;
            }
        }

        self.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.audio.sample_rate, 16000);
        assert_eq!(config.session.max_history_turns, 20);
        assert!(config
            .session
            .goodbye_phrases
            .contains(&"goodbye".to_string()));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.bit_depth = 24;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.session.max_tool_rounds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"agent": {"tts_voice": "aura-2-luna-en"}, "session": {"max_history_turns": 30}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.agent.tts_voice, "aura-2-luna-en");
        assert_eq!(config.session.max_history_turns, 30);
        // Untouched fields keep their values
        assert_eq!(config.agent.llm_model, "gpt-4o-mini");
    }

    #[test]
    fn test_update_rejects_invalid_values() {
        let mut config = AppConfig::default();
        let json = r#"{"session": {"max_tool_rounds": 0}}"#;
        assert!(config.update_from_json(json).is_err());
    }

    #[test]
    fn test_api_keys_not_serialized() {
        let mut config = AppConfig::default();
        config.agent.openai_api_key = "sk-secret".to_string();
        config.agent.deepgram_api_key = "dg-secret".to_string();

        let serialized = serde_json::to_string(&config).unwrap();
        assert!(!serialized.contains("sk-secret"));
        assert!(!serialized.contains("dg-secret"));
    }
}
