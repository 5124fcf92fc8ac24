//! # Conversation Session
//!
//! Per-connection conversation state and the turn pipeline. The session owns
//! the state machine, the sliding history window, the verified-member
//! context, and the bounded tool call loop that runs between a finalized
//! transcript and the agent's spoken reply.
//!
//! ## State Machine:
//! ```text
//! Idle → Listening → Processing → Speaking → Listening → ...  → Closed
//! ```
//! Muting is orthogonal to the state: a muted session stays wherever it is
//! but stops accepting microphone audio.
//!
//! ## Turn Pipeline:
//! 1. Finalized transcript arrives, session moves to Processing
//! 2. Chat completion runs; tool calls are dispatched and fed back, up to
//!    the configured round limit
//! 3. Final text becomes an agent turn, the caller synthesizes and plays it
//!
//! Tool call exchanges live only inside the turn; the durable history holds
//! spoken turns, so the window math never counts plumbing messages.

use crate::agent::llm::{ChatBackend, ChatMessage, ChatOutcome};
use crate::agent::prompt::{APOLOGY, FAILURE_GOODBYE, SYSTEM_PROMPT};
use crate::error::{AgentError, UpstreamService};
use crate::pharmacy::{AgentContext, FunctionDispatcher};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Connected, pipeline not yet started
    Idle,
    /// Accepting microphone audio
    Listening,
    /// A transcript is running through the LLM and tools
    Processing,
    /// Synthesized reply is being delivered
    Speaking,
    /// Terminal; no transition leaves this state
    Closed,
}

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Assistant,
}

/// One spoken turn in the conversation.
#[derive(Debug, Clone, Serialize)]
pub struct Turn {
    pub id: Uuid,
    pub speaker: Speaker,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Behavior limits, taken from `SessionConfig` at connection time.
#[derive(Debug, Clone)]
pub struct SessionLimits {
    pub max_history_turns: usize,
    pub max_tool_rounds: u32,
    pub max_consecutive_failures: u32,
    pub upstream_timeout: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_history_turns: 20,
            max_tool_rounds: 5,
            max_consecutive_failures: 3,
            upstream_timeout: Duration::from_secs(15),
        }
    }
}

/// Spoken fallback chosen after a pipeline failure.
#[derive(Debug, Clone, Copy)]
pub struct FailurePlan {
    /// The apology (or farewell) to speak in place of a reply
    pub apology: &'static str,
    /// The failure streak hit its threshold; hang up after the apology
    pub disconnect: bool,
}

/// Outcome of a completed turn.
#[derive(Debug, Clone)]
pub struct TurnReply {
    /// Final assistant text, ready for synthesis
    pub text: String,
    /// The assistant signed off; hang up after the reply plays
    pub end_call: bool,
}

/// All conversational state for one voice connection.
pub struct ConversationSession {
    pub id: Uuid,
    state: SessionState,
    muted: bool,
    history: VecDeque<Turn>,
    context: AgentContext,
    limits: SessionLimits,
    goodbye_phrases: Vec<String>,
    consecutive_failures: u32,
}

impl ConversationSession {
    pub fn new(limits: SessionLimits, goodbye_phrases: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: SessionState::Idle,
            muted: false,
            history: VecDeque::new(),
            context: AgentContext::default(),
            limits,
            goodbye_phrases,
            consecutive_failures: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to a new state. Closed is terminal; attempts to leave it are
    /// logged and ignored.
    pub fn set_state(&mut self, state: SessionState) {
        if self.state == SessionState::Closed {
            if state != SessionState::Closed {
                warn!(session_id = %self.id, ?state, "Ignoring transition out of closed state");
            }
            return;
        }
        debug!(session_id = %self.id, from = ?self.state, to = ?state, "Session state change");
        self.state = state;
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn set_muted(&mut self, muted: bool) {
        if self.muted != muted {
            info!(session_id = %self.id, muted, "Session mute changed");
            self.muted = muted;
        }
    }

    /// Microphone audio is only forwarded while listening and unmuted.
    pub fn accepts_audio(&self) -> bool {
        self.state == SessionState::Listening && !self.muted
    }

    pub fn history(&self) -> impl Iterator<Item = &Turn> {
        self.history.iter()
    }

    pub fn turn_count(&self) -> usize {
        self.history.len()
    }

    /// Append a spoken turn, evicting the oldest beyond the window.
    pub fn push_turn(&mut self, speaker: Speaker, text: impl Into<String>) {
        self.history.push_back(Turn {
            id: Uuid::new_v4(),
            speaker,
            text: text.into(),
            timestamp: Utc::now(),
        });
        while self.history.len() > self.limits.max_history_turns {
            self.history.pop_front();
        }
    }

    /// Wipe conversation state back to a fresh session. The connection,
    /// state machine position, and mute flag survive.
    pub fn reset(&mut self) {
        info!(session_id = %self.id, "Session reset");
        self.history.clear();
        self.context.clear();
        self.consecutive_failures = 0;
    }

    /// Does this reply close out the conversation? Matched against the
    /// assistant's farewell (the persona signs off once the caller says
    /// goodbye), so the hangup happens after the farewell plays.
    pub fn is_goodbye(&self, text: &str) -> bool {
        let lowered = text.to_lowercase();
        self.goodbye_phrases
            .iter()
            .any(|phrase| lowered.contains(phrase.as_str()))
    }

    /// Count a pipeline failure. Returns true once the consecutive failure
    /// threshold is reached and the session should be force-closed.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures += 1;
        warn!(
            session_id = %self.id,
            failures = self.consecutive_failures,
            threshold = self.limits.max_consecutive_failures,
            "Pipeline failure recorded"
        );
        self.consecutive_failures >= self.limits.max_consecutive_failures
    }

    /// A completed turn clears the failure streak.
    pub fn clear_failures(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Record a pipeline failure and pick the spoken fallback. The apology
    /// joins the history as an assistant turn; at the threshold the farewell
    /// variant is chosen and the session closes.
    pub fn plan_failure_reply(&mut self) -> FailurePlan {
        let disconnect = self.record_failure();
        let apology = if disconnect { FAILURE_GOODBYE } else { APOLOGY };
        self.push_turn(Speaker::Assistant, apology);
        if disconnect {
            self.set_state(SessionState::Closed);
        }
        FailurePlan {
            apology,
            disconnect,
        }
    }

    /// Run one full turn: transcript in, assistant text out, tool calls
    /// dispatched in between.
    ///
    /// The user turn joins the history immediately, so even a failed turn
    /// keeps what the caller said. The agent turn only joins on success.
    pub async fn run_turn(
        &mut self,
        user_text: &str,
        chat: &dyn ChatBackend,
        dispatcher: &FunctionDispatcher,
    ) -> Result<TurnReply, AgentError> {
        self.push_turn(Speaker::User, user_text);

        let mut messages = self.transcript_messages();

        for round in 0..self.limits.max_tool_rounds {
            let outcome = tokio::time::timeout(self.limits.upstream_timeout, chat.complete(&messages))
                .await
                .map_err(|_| AgentError::Timeout {
                    service: UpstreamService::Chat,
                    seconds: self.limits.upstream_timeout.as_secs(),
                })??;

            match outcome {
                ChatOutcome::Text(text) => {
                    debug!(session_id = %self.id, rounds = round, "Turn completed");
                    self.push_turn(Speaker::Assistant, text.clone());
                    self.clear_failures();
                    let end_call = self.is_goodbye(&text);
                    return Ok(TurnReply { text, end_call });
                }
                ChatOutcome::ToolCalls(calls) => {
                    messages.push(ChatMessage::assistant_tool_calls(calls.clone()));
                    for call in calls {
                        let result = self.execute_tool_call(&call.function.name, &call.function.arguments, dispatcher);
                        messages.push(ChatMessage::tool_result(call.id, &result));
                    }
                }
            }
        }

        Err(AgentError::ToolLoopExceeded {
            rounds: self.limits.max_tool_rounds,
        })
    }

    fn execute_tool_call(
        &mut self,
        name: &str,
        raw_arguments: &str,
        dispatcher: &FunctionDispatcher,
    ) -> Value {
        match serde_json::from_str::<Value>(raw_arguments) {
            Ok(args) => dispatcher.dispatch(name, &args, &mut self.context),
            Err(err) => {
                warn!(session_id = %self.id, function = name, error = %err, "Unparseable tool arguments");
                json!({ "error": format!("Arguments were not valid JSON: {}", err) })
            }
        }
    }

    /// System prompt plus the spoken history, in LLM message form.
    fn transcript_messages(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.history.len() + 1);
        messages.push(ChatMessage::system(SYSTEM_PROMPT));
        for turn in &self.history {
            messages.push(match turn.speaker {
                Speaker::User => ChatMessage::user(turn.text.clone()),
                Speaker::Assistant => ChatMessage::assistant(turn.text.clone()),
            });
        }
        messages
    }

    #[cfg(test)]
    pub fn context(&self) -> &AgentContext {
        &self.context
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::llm::{FunctionCall, ToolCall};
    use crate::pharmacy::PharmacyStore;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::Mutex;

    /// Scripted chat backend: pops one reply per completion call.
    struct MockChat {
        script: Mutex<VecDeque<MockReply>>,
        seen: Mutex<Vec<Vec<ChatMessage>>>,
    }

    enum MockReply {
        Text(&'static str),
        Calls(Vec<ToolCall>),
        Fail,
    }

    impl MockChat {
        fn new(script: Vec<MockReply>) -> Self {
            Self {
                script: Mutex::new(script.into_iter().collect()),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatBackend for MockChat {
        async fn complete(&self, messages: &[ChatMessage]) -> Result<ChatOutcome, AgentError> {
            self.seen.lock().unwrap().push(messages.to_vec());
            match self.script.lock().unwrap().pop_front() {
                Some(MockReply::Text(text)) => Ok(ChatOutcome::Text(text.to_string())),
                Some(MockReply::Calls(calls)) => Ok(ChatOutcome::ToolCalls(calls)),
                Some(MockReply::Fail) | None => Err(AgentError::Upstream {
                    service: UpstreamService::Chat,
                    message: "scripted failure".to_string(),
                }),
            }
        }
    }

    fn tool_call(name: &str, arguments: &str) -> ToolCall {
        ToolCall {
            id: format!("call_{}", name),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: name.to_string(),
                arguments: arguments.to_string(),
            },
        }
    }

    fn session() -> ConversationSession {
        ConversationSession::new(
            SessionLimits::default(),
            vec!["goodbye".to_string(), "thank you for calling".to_string()],
        )
    }

    fn dispatcher() -> FunctionDispatcher {
        FunctionDispatcher::new(Arc::new(PharmacyStore::bundled().unwrap()))
    }

    #[tokio::test]
    async fn test_plain_text_turn() {
        let mut session = session();
        let chat = MockChat::new(vec![MockReply::Text("Sure, what's your member ID?")]);

        let reply = session
            .run_turn("I want to check my order", &chat, &dispatcher())
            .await
            .unwrap();

        assert_eq!(reply.text, "Sure, what's your member ID?");
        assert!(!reply.end_call);
        assert_eq!(session.turn_count(), 2);

        // The LLM saw the system prompt and the user turn
        let seen = chat.seen.lock().unwrap();
        assert_eq!(seen[0][0].role, "system");
        assert_eq!(seen[0][1].role, "user");
    }

    #[tokio::test]
    async fn test_tool_round_then_text() {
        let mut session = session();
        let chat = MockChat::new(vec![
            MockReply::Calls(vec![tool_call(
                "verify_member_id",
                r#"{"member_id": "m 1 0 0 1"}"#,
            )]),
            MockReply::Text("Thanks Sarah, you're verified."),
        ]);

        let reply = session
            .run_turn("my member id is m 1 0 0 1", &chat, &dispatcher())
            .await
            .unwrap();

        assert_eq!(reply.text, "Thanks Sarah, you're verified.");
        assert_eq!(session.context().member_id.as_deref(), Some("M1001"));

        // Second completion saw the tool exchange appended
        let seen = chat.seen.lock().unwrap();
        let second = &seen[1];
        assert!(second.iter().any(|m| m.role == "tool"
            && m.content.as_deref().unwrap_or("").contains("Sarah Mitchell")));

        // But the durable history only holds spoken turns
        drop(seen);
        assert_eq!(session.turn_count(), 2);
    }

    #[tokio::test]
    async fn test_tool_loop_bounded() {
        let mut session = session();
        let looping: Vec<MockReply> = (0..10)
            .map(|_| {
                MockReply::Calls(vec![tool_call(
                    "verify_member_id",
                    r#"{"member_id": "M1001"}"#,
                )])
            })
            .collect();
        let chat = MockChat::new(looping);

        let err = session
            .run_turn("verify me forever", &chat, &dispatcher())
            .await
            .unwrap_err();

        match err {
            AgentError::ToolLoopExceeded { rounds } => assert_eq!(rounds, 5),
            other => panic!("expected tool loop error, got {}", other),
        }
        // The LLM was consulted exactly max_tool_rounds times
        assert_eq!(chat.seen.lock().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_bad_tool_arguments_become_tool_error() {
        let mut session = session();
        let chat = MockChat::new(vec![
            MockReply::Calls(vec![tool_call("verify_member_id", "not json {{{")]),
            MockReply::Text("Could you repeat your member ID?"),
        ]);

        let reply = session
            .run_turn("em one oh oh one", &chat, &dispatcher())
            .await
            .unwrap();
        assert_eq!(reply.text, "Could you repeat your member ID?");

        let seen = chat.seen.lock().unwrap();
        assert!(seen[1].iter().any(|m| m.role == "tool"
            && m.content.as_deref().unwrap_or("").contains("not valid JSON")));
    }

    #[tokio::test]
    async fn test_failed_turn_keeps_user_text() {
        let mut session = session();
        let chat = MockChat::new(vec![MockReply::Fail]);

        let err = session
            .run_turn("hello?", &chat, &dispatcher())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Upstream { .. }));

        // User turn survives, no agent turn was added
        assert_eq!(session.turn_count(), 1);
        assert_eq!(session.history().next().unwrap().speaker, Speaker::User);
    }

    #[tokio::test]
    async fn test_farewell_reply_sets_end_call() {
        let mut session = session();
        let chat = MockChat::new(vec![MockReply::Text("Thank you for calling. Goodbye!")]);

        let reply = session
            .run_turn("that's all, thanks", &chat, &dispatcher())
            .await
            .unwrap();
        assert!(reply.end_call);
    }

    #[tokio::test]
    async fn test_ordinary_reply_keeps_call_open() {
        let mut session = session();
        let chat = MockChat::new(vec![MockReply::Text("Your order is still processing.")]);

        let reply = session
            .run_turn("is my order ready", &chat, &dispatcher())
            .await
            .unwrap();
        assert!(!reply.end_call);
    }

    #[test]
    fn test_goodbye_matching_is_case_insensitive() {
        let session = session();
        assert!(session.is_goodbye("GOODBYE"));
        assert!(session.is_goodbye("ok Thank You For Calling"));
        assert!(!session.is_goodbye("good buy prices"));
    }

    #[test]
    fn test_history_window_evicts_oldest() {
        let mut session = ConversationSession::new(
            SessionLimits {
                max_history_turns: 4,
                ..SessionLimits::default()
            },
            vec![],
        );

        for i in 0..10 {
            session.push_turn(Speaker::User, format!("turn {}", i));
        }

        assert_eq!(session.turn_count(), 4);
        // Oldest surviving turn is number 6
        assert_eq!(session.history().next().unwrap().text, "turn 6");
    }

    #[test]
    fn test_audio_gating() {
        let mut session = session();
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!session.accepts_audio());

        session.set_state(SessionState::Listening);
        assert!(session.accepts_audio());

        session.set_muted(true);
        assert!(!session.accepts_audio());
        session.set_muted(false);

        session.set_state(SessionState::Processing);
        assert!(!session.accepts_audio());
        session.set_state(SessionState::Speaking);
        assert!(!session.accepts_audio());
    }

    #[test]
    fn test_closed_is_terminal() {
        let mut session = session();
        session.set_state(SessionState::Closed);
        session.set_state(SessionState::Listening);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_reset_clears_conversation_not_connection() {
        let mut session = session();
        session.set_state(SessionState::Listening);
        session.set_muted(true);
        session.push_turn(Speaker::User, "hello");
        session.record_failure();

        session.reset();

        assert_eq!(session.turn_count(), 0);
        assert!(session.context().member_id.is_none());
        // State machine position and mute flag survive a reset
        assert_eq!(session.state(), SessionState::Listening);
        assert!(session.is_muted());
    }

    #[test]
    fn test_failure_reply_below_threshold_apologizes() {
        let mut session = session();
        session.set_state(SessionState::Listening);

        let plan = session.plan_failure_reply();

        assert!(!plan.disconnect);
        assert_eq!(plan.apology, APOLOGY);
        // The apology joined the history as a spoken assistant turn
        assert_eq!(session.turn_count(), 1);
        let turn = session.history().next().unwrap();
        assert_eq!(turn.speaker, Speaker::Assistant);
        assert_eq!(turn.text, APOLOGY);
        assert_eq!(session.state(), SessionState::Listening);
    }

    #[test]
    fn test_failure_reply_at_threshold_closes_session() {
        let mut session = session();
        session.set_state(SessionState::Listening);

        assert!(!session.plan_failure_reply().disconnect);
        assert!(!session.plan_failure_reply().disconnect);
        let plan = session.plan_failure_reply();

        assert!(plan.disconnect);
        assert_eq!(plan.apology, FAILURE_GOODBYE);
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.turn_count(), 3);
    }

    #[test]
    fn test_completed_turn_resets_failure_streak() {
        let mut session = session();
        session.plan_failure_reply();
        session.plan_failure_reply();
        session.clear_failures();

        // The streak starts over; two more failures stay below the threshold
        assert!(!session.plan_failure_reply().disconnect);
        assert!(!session.plan_failure_reply().disconnect);
    }

    #[test]
    fn test_failure_threshold() {
        let mut session = session();
        assert!(!session.record_failure());
        assert!(!session.record_failure());
        assert!(session.record_failure());

        session.clear_failures();
        assert!(!session.record_failure());
    }
}
