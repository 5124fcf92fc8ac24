//! # Chat Completion Backend
//!
//! Client for an OpenAI-compatible chat completions API with function
//! calling. Each call either yields assistant text or a batch of tool calls
//! the session must execute and feed back.
//!
//! ## Retry policy:
//! Retryable failures (connect errors, timeouts, 429, 5xx) get exactly one
//! retry after a short pause; everything else is reported immediately. The
//! session layer turns the reported error into a spoken apology.

use crate::error::{AgentError, UpstreamService};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

const RETRY_PAUSE: Duration = Duration::from_millis(500);

/// One message in the chat transcript sent to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self::plain("system", text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::plain("user", text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::plain("assistant", text)
    }

    /// The assistant message echoing tool calls back into the transcript,
    /// required by the API before the matching tool results.
    pub fn assistant_tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: None,
            tool_calls: Some(calls),
            tool_call_id: None,
        }
    }

    /// A tool result message answering one tool call.
    pub fn tool_result(call_id: impl Into<String>, result: &Value) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(result.to_string()),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
        }
    }

    fn plain(role: &str, text: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Some(text.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

/// A function invocation requested by the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded argument object, exactly as the API delivers it
    pub arguments: String,
}

/// What a single completion round produced.
#[derive(Debug, Clone)]
pub enum ChatOutcome {
    /// Final assistant text for this round
    Text(String),
    /// The LLM wants these tools executed before it can answer
    ToolCalls(Vec<ToolCall>),
}

/// Seam between the session loop and the chat service, mockable in tests.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<ChatOutcome, AgentError>;
}

/// Chat backend talking to an OpenAI-compatible HTTP API.
pub struct OpenAiChat {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    tools: Value,
}

impl OpenAiChat {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        tools: Value,
        timeout: Duration,
    ) -> Self {
        Self {
            // Client construction only fails on TLS backend misconfiguration
            client: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            tools,
        }
    }

    async fn send_request(
        &self,
        body: &ChatCompletionRequest<'_>,
    ) -> Result<ChatCompletionResponse, RequestError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(body)
            .send()
            .await
            .map_err(|err| RequestError {
                message: format!("Chat API request failed: {}", err),
                is_retryable: err.is_connect() || err.is_timeout(),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read chat API error body".to_string());
            return Err(map_http_error(status, body_text));
        }

        response.json().await.map_err(|err| RequestError {
            message: format!("Failed to parse chat API response: {}", err),
            is_retryable: false,
        })
    }
}

#[async_trait]
impl ChatBackend for OpenAiChat {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<ChatOutcome, AgentError> {
        let request = ChatCompletionRequest {
            model: &self.model,
            messages,
            tools: &self.tools,
            tool_choice: "auto",
            temperature: 0.7,
            max_tokens: 300,
        };

        match self.send_request(&request).await {
            Ok(parsed) => outcome_from_response(parsed),
            Err(err) if err.is_retryable => {
                warn!(error = %err.message, "Chat request failed, retrying once");
                tokio::time::sleep(RETRY_PAUSE).await;
                self.send_request(&request)
                    .await
                    .map_err(|err| AgentError::Upstream {
                        service: UpstreamService::Chat,
                        message: err.message,
                    })
                    .and_then(outcome_from_response)
            }
            Err(err) => Err(AgentError::Upstream {
                service: UpstreamService::Chat,
                message: err.message,
            }),
        }
    }
}

struct RequestError {
    message: String,
    is_retryable: bool,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    tools: &'a Value,
    tool_choice: &'a str,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

/// Tool calls win over text when both are present; an empty batch of tool
/// calls counts as text.
fn outcome_from_response(response: ChatCompletionResponse) -> Result<ChatOutcome, AgentError> {
    let Some(message) = response.choices.into_iter().next().map(|choice| choice.message) else {
        warn!("Chat API returned no choices");
        return Err(AgentError::EmptyCompletion);
    };

    if let Some(calls) = message.tool_calls {
        if !calls.is_empty() {
            debug!(count = calls.len(), "Completion requested tool calls");
            return Ok(ChatOutcome::ToolCalls(calls));
        }
    }

    message
        .content
        .filter(|text| !text.trim().is_empty())
        .map(ChatOutcome::Text)
        .ok_or(AgentError::EmptyCompletion)
}

fn map_http_error(status: StatusCode, body: String) -> RequestError {
    let message = serde_json::from_str::<ErrorResponse>(&body)
        .map(|wrapper| wrapper.error.message)
        .unwrap_or(body);

    let is_retryable = matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    );

    RequestError {
        message: format!("Chat API returned {}: {}", status.as_u16(), message),
        is_retryable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_serialization_shapes() {
        let user = serde_json::to_value(ChatMessage::user("hello")).unwrap();
        assert_eq!(user, json!({"role": "user", "content": "hello"}));

        let tool = serde_json::to_value(ChatMessage::tool_result(
            "call_1",
            &json!({"found": true}),
        ))
        .unwrap();
        assert_eq!(tool["role"], "tool");
        assert_eq!(tool["tool_call_id"], "call_1");
        assert_eq!(tool["content"], "{\"found\":true}");
        assert!(tool.get("tool_calls").is_none());
    }

    #[test]
    fn test_response_with_text() {
        let raw = json!({
            "choices": [{
                "message": {"role": "assistant", "content": "Your order is ready."}
            }]
        });
        let parsed: ChatCompletionResponse = serde_json::from_value(raw).unwrap();
        match outcome_from_response(parsed).unwrap() {
            ChatOutcome::Text(text) => assert_eq!(text, "Your order is ready."),
            other => panic!("expected text, got {:?}", other),
        }
    }

    #[test]
    fn test_response_with_tool_calls() {
        let raw = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_abc",
                        "type": "function",
                        "function": {
                            "name": "verify_member_id",
                            "arguments": "{\"member_id\": \"M1001\"}"
                        }
                    }]
                }
            }]
        });
        let parsed: ChatCompletionResponse = serde_json::from_value(raw).unwrap();
        match outcome_from_response(parsed).unwrap() {
            ChatOutcome::ToolCalls(calls) => {
                assert_eq!(calls.len(), 1);
                assert_eq!(calls[0].function.name, "verify_member_id");
                let args: Value = serde_json::from_str(&calls[0].function.arguments).unwrap();
                assert_eq!(args["member_id"], "M1001");
            }
            other => panic!("expected tool calls, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_response_is_empty_completion() {
        let raw = json!({"choices": [{"message": {"role": "assistant", "content": ""}}]});
        let parsed: ChatCompletionResponse = serde_json::from_value(raw).unwrap();
        assert!(matches!(
            outcome_from_response(parsed),
            Err(AgentError::EmptyCompletion)
        ));

        let raw = json!({"choices": []});
        let parsed: ChatCompletionResponse = serde_json::from_value(raw).unwrap();
        assert!(matches!(
            outcome_from_response(parsed),
            Err(AgentError::EmptyCompletion)
        ));
    }

    #[test]
    fn test_retryable_status_mapping() {
        assert!(map_http_error(StatusCode::TOO_MANY_REQUESTS, "{}".into()).is_retryable);
        assert!(map_http_error(StatusCode::SERVICE_UNAVAILABLE, "{}".into()).is_retryable);
        assert!(!map_http_error(StatusCode::UNAUTHORIZED, "{}".into()).is_retryable);
        assert!(!map_http_error(StatusCode::BAD_REQUEST, "{}".into()).is_retryable);
    }

    #[test]
    fn test_error_body_extraction() {
        let err = map_http_error(
            StatusCode::UNAUTHORIZED,
            r#"{"error": {"message": "Invalid API key"}}"#.to_string(),
        );
        assert!(err.message.contains("Invalid API key"));
        assert!(err.message.contains("401"));
    }
}
