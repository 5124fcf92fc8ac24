//! # Voice WebSocket Handler
//!
//! The realtime endpoint for voice conversations. Browsers connect to
//! `/ws/voice`, stream raw microphone PCM as binary frames, and receive JSON
//! messages carrying transcripts, status changes, base64 reply audio, and
//! errors.
//!
//! ## WebSocket Protocol:
//! - **Client → Server**: binary PCM frames (16-bit, 16kHz, mono), plus JSON
//!   controls: `{"type":"ping"}`, `{"type":"reset"}`,
//!   `{"type":"mute","muted":bool}`
//! - **Server → Client**: JSON `transcript`, `status`, `audio`, `error`,
//!   `disconnect`, `pong`
//!
//! ## Pipeline:
//! Each connection is one actor. Microphone frames are forwarded to the
//! transcription stream while the session is listening; finalized
//! transcripts come back as actor messages and launch a turn task (LLM plus
//! tools plus synthesis) that reports its result through further actor
//! messages. The session lock serializes turns, so a transcript that lands
//! mid-turn waits rather than interleaving.

use crate::agent::llm::ChatBackend;
use crate::agent::prompt::GREETING;
use crate::agent::session::{ConversationSession, SessionLimits, SessionState, Speaker, TurnReply};
use crate::agent::stt::{SttConfig, SttStream};
use crate::agent::tts::SpeechSynthesizer;
use crate::agent::OpenAiChat;
use crate::audio::pcm::{self, PcmFormat};
use crate::error::{AgentError, AppError, UpstreamService};
use crate::pharmacy::{dispatcher::tool_declarations, FunctionDispatcher};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Messages the server sends to the browser.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// A finalized utterance from either side of the conversation
    #[serde(rename = "transcript")]
    Transcript { text: String, speaker: Speaker },

    /// Pipeline status for driving the client UI
    #[serde(rename = "status")]
    Status {
        status: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Synthesized reply audio, base64 PCM
    #[serde(rename = "audio")]
    Audio {
        data: String,
        #[serde(rename = "sampleRate")]
        sample_rate: u32,
        encoding: &'static str,
    },

    /// A turn failed; the conversation continues unless a disconnect follows
    #[serde(rename = "error")]
    Error { message: String },

    /// The server is about to close the connection
    #[serde(rename = "disconnect")]
    Disconnect { reason: String },

    /// Reply to a client ping
    #[serde(rename = "pong")]
    Pong,
}

/// Control messages the browser sends as text frames.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "ping")]
    Ping,

    /// Wipe the conversation and start fresh on the same connection
    #[serde(rename = "reset")]
    Reset,

    /// Pause or resume microphone forwarding
    #[serde(rename = "mute")]
    Mute { muted: bool },
}

/// Transcription stream is up; hold the handle for audio forwarding.
#[derive(Message)]
#[rtype(result = "()")]
struct SttReady(SttStream);

/// A finalized caller utterance arrived from the transcription stream.
#[derive(Message)]
#[rtype(result = "()")]
struct FinalTranscript(String);

/// Ship one JSON message to the client.
#[derive(Message)]
#[rtype(result = "()")]
struct SendToClient(ServerMessage);

/// Announce the disconnect and close the socket.
#[derive(Message)]
#[rtype(result = "()")]
struct CloseConnection {
    reason: String,
}

/// Actor for one voice conversation.
pub struct VoiceWebSocket {
    session: Arc<RwLock<ConversationSession>>,
    chat: Arc<dyn ChatBackend>,
    tts: Arc<dyn SpeechSynthesizer>,
    dispatcher: Arc<FunctionDispatcher>,
    stt: Option<SttStream>,
    stt_config: SttConfig,
    pcm: PcmFormat,
    upstream_timeout: Duration,
    app_state: web::Data<AppState>,
    last_heartbeat: Instant,
    /// Tasks spawned for this connection; aborted when the actor stops
    pipeline_tasks: Vec<JoinHandle<()>>,
}

impl VoiceWebSocket {
    #[allow(clippy::too_many_arguments)]
    fn new(
        session: ConversationSession,
        chat: Arc<dyn ChatBackend>,
        tts: Arc<dyn SpeechSynthesizer>,
        dispatcher: Arc<FunctionDispatcher>,
        stt_config: SttConfig,
        pcm: PcmFormat,
        upstream_timeout: Duration,
        app_state: web::Data<AppState>,
    ) -> Self {
        Self {
            session: Arc::new(RwLock::new(session)),
            chat,
            tts,
            dispatcher,
            stt: None,
            stt_config,
            pcm,
            upstream_timeout,
            app_state,
            last_heartbeat: Instant::now(),
            pipeline_tasks: Vec::new(),
        }
    }

    /// Track a spawned task so teardown can abort it. Finished handles are
    /// pruned here so the list stays bounded across a long conversation.
    fn track_task(&mut self, task: JoinHandle<()>) {
        self.pipeline_tasks.retain(|existing| !existing.is_finished());
        self.pipeline_tasks.push(task);
    }

    /// Tear down everything this connection spawned. In-flight turn and
    /// transcript pump tasks abort at their next await point, which releases
    /// the session lock so the closed state can land.
    fn shutdown_pipeline(&mut self) {
        for task in self.pipeline_tasks.drain(..) {
            task.abort();
        }

        if let Some(stt) = self.stt.take() {
            stt.finish();
        }

        let session = self.session.clone();
        tokio::spawn(async move {
            session.write().await.set_state(SessionState::Closed);
        });
    }

    /// Apply a mute change inline when the session lock is free. During a
    /// turn the lock is held, so the change lands once the turn releases it;
    /// audio is dropped outside the listening state either way.
    fn apply_mute(&self, muted: bool) {
        match self.session.try_write() {
            Ok(mut guard) => guard.set_muted(muted),
            Err(_) => {
                let session = self.session.clone();
                tokio::spawn(async move {
                    session.write().await.set_muted(muted);
                });
            }
        }
    }

    fn send_message(ctx: &mut ws::WebsocketContext<Self>, message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(err) => error!(error = %err, "Failed to serialize server message"),
        }
    }

    /// Forward a microphone frame to the transcription stream, or drop it.
    /// Runs in the actor's sync context, so only a non-blocking state peek
    /// is possible; a contended lock counts as "not listening right now".
    fn handle_audio_frame(&mut self, data: &[u8]) {
        let accepts = self
            .session
            .try_read()
            .map(|session| session.accepts_audio())
            .unwrap_or(false);

        if !accepts {
            return;
        }

        if let Err(err) = self.pcm.validate_chunk(data) {
            debug!(error = %err, "Dropping malformed audio frame");
            return;
        }

        if let Some(stt) = &self.stt {
            stt.send_audio(data.to_vec());
        }
    }

    /// Deliver the greeting: spoken turn, transcript, audio, then listening.
    fn start_greeting(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let addr = ctx.address();
        let session = self.session.clone();
        let tts = self.tts.clone();
        let sample_rate = self.pcm.sample_rate;

        let task = tokio::spawn(async move {
            {
                let mut guard = session.write().await;
                guard.push_turn(Speaker::Assistant, GREETING);
            }

            addr.do_send(SendToClient(ServerMessage::Transcript {
                text: GREETING.to_string(),
                speaker: Speaker::Assistant,
            }));

            match tts.synthesize(GREETING).await {
                Ok(audio) => {
                    addr.do_send(SendToClient(ServerMessage::Audio {
                        data: pcm::encode_base64(&audio),
                        sample_rate,
                        encoding: "linear16",
                    }));
                }
                Err(err) => {
                    // Text transcript already went out; the caller can read
                    warn!(error = %err, "Greeting synthesis failed");
                }
            }

            session.write().await.set_state(SessionState::Listening);
            addr.do_send(SendToClient(ServerMessage::Status {
                status: "ready",
                message: None,
            }));
        });
        self.track_task(task);
    }

    /// Run a full turn off the actor thread and report back via messages.
    fn start_turn(&mut self, transcript: String, ctx: &mut ws::WebsocketContext<Self>) {
        let addr = ctx.address();
        let session = self.session.clone();
        let chat = self.chat.clone();
        let tts = self.tts.clone();
        let dispatcher = self.dispatcher.clone();
        let sample_rate = self.pcm.sample_rate;
        let timeout = self.upstream_timeout;

        let task = tokio::spawn(async move {
            let mut guard = session.write().await;
            if guard.state() == SessionState::Closed {
                return;
            }
            guard.set_state(SessionState::Processing);

            addr.do_send(SendToClient(ServerMessage::Transcript {
                text: transcript.clone(),
                speaker: Speaker::User,
            }));
            addr.do_send(SendToClient(ServerMessage::Status {
                status: "thinking",
                message: None,
            }));

            let result = guard.run_turn(&transcript, chat.as_ref(), dispatcher.as_ref()).await;

            match result {
                Ok(reply) => {
                    guard.set_state(SessionState::Speaking);
                    drop(guard);
                    deliver_reply(addr, session, tts.as_ref(), sample_rate, timeout, reply).await;
                }
                Err(err) => {
                    drop(guard);
                    handle_turn_failure(addr, session, tts.as_ref(), sample_rate, err).await;
                }
            }
        });
        self.track_task(task);
    }
}

/// What the transcript pump observed from the transcription stream.
#[derive(Debug, PartialEq)]
enum SttEvent {
    /// A finalized caller utterance
    Transcript(String),
    /// The stream died while the conversation was still live
    Lost,
}

/// Drain finalized transcripts out of the transcription stream. When the
/// channel closes while the session is not yet closed, the stream died under
/// a live conversation and `Lost` is emitted so the caller is told.
async fn pump_transcripts(
    session: Arc<RwLock<ConversationSession>>,
    mut transcripts: mpsc::Receiver<String>,
    emit: impl Fn(SttEvent),
) {
    while let Some(text) = transcripts.recv().await {
        emit(SttEvent::Transcript(text));
    }

    if session.read().await.state() == SessionState::Closed {
        debug!("Transcript channel closed");
    } else {
        error!("Transcription stream ended mid-conversation");
        emit(SttEvent::Lost);
    }
}

/// Synthesize and ship the agent's reply, then return to listening or hang
/// up after a goodbye.
async fn deliver_reply(
    addr: Addr<VoiceWebSocket>,
    session: Arc<RwLock<ConversationSession>>,
    tts: &dyn SpeechSynthesizer,
    sample_rate: u32,
    timeout: Duration,
    reply: TurnReply,
) {
    addr.do_send(SendToClient(ServerMessage::Status {
        status: "speaking",
        message: None,
    }));
    addr.do_send(SendToClient(ServerMessage::Transcript {
        text: reply.text.clone(),
        speaker: Speaker::Assistant,
    }));

    let synthesized = tokio::time::timeout(timeout, tts.synthesize(&reply.text))
        .await
        .map_err(|_| AgentError::Timeout {
            service: UpstreamService::Synthesis,
            seconds: timeout.as_secs(),
        })
        .and_then(|inner| inner);

    match synthesized {
        Ok(audio) => {
            addr.do_send(SendToClient(ServerMessage::Audio {
                data: pcm::encode_base64(&audio),
                sample_rate,
                encoding: "linear16",
            }));

            if reply.end_call {
                session.write().await.set_state(SessionState::Closed);
                addr.do_send(CloseConnection {
                    reason: "goodbye".to_string(),
                });
            } else {
                session.write().await.set_state(SessionState::Listening);
                addr.do_send(SendToClient(ServerMessage::Status {
                    status: "ready",
                    message: None,
                }));
            }
        }
        Err(err) => {
            handle_turn_failure(addr, session, tts, sample_rate, err).await;
        }
    }
}

/// A turn failed: tell the caller, speak an apology, and either keep
/// listening or hang up once the failure streak hits the threshold.
async fn handle_turn_failure(
    addr: Addr<VoiceWebSocket>,
    session: Arc<RwLock<ConversationSession>>,
    tts: &dyn SpeechSynthesizer,
    sample_rate: u32,
    err: AgentError,
) {
    error!(error = %err, "Voice turn failed");

    let plan = session.write().await.plan_failure_reply();

    addr.do_send(SendToClient(ServerMessage::Error {
        message: err.user_message().to_string(),
    }));

    addr.do_send(SendToClient(ServerMessage::Transcript {
        text: plan.apology.to_string(),
        speaker: Speaker::Assistant,
    }));

    // Best effort; the error and transcript messages already went out
    if let Ok(audio) = tts.synthesize(plan.apology).await {
        addr.do_send(SendToClient(ServerMessage::Audio {
            data: pcm::encode_base64(&audio),
            sample_rate,
            encoding: "linear16",
        }));
    }

    if plan.disconnect {
        addr.do_send(CloseConnection {
            reason: "repeated failures".to_string(),
        });
    } else {
        session.write().await.set_state(SessionState::Listening);
        addr.do_send(SendToClient(ServerMessage::Status {
            status: "ready",
            message: None,
        }));
    }
}

impl Actor for VoiceWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let session_id = self
            .session
            .try_read()
            .map(|s| s.id.to_string())
            .unwrap_or_default();
        info!(session_id = %session_id, "Voice connection started");

        // Heartbeat: ping every 30s, drop clients silent for 60s
        ctx.run_interval(Duration::from_secs(30), |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > Duration::from_secs(60) {
                warn!("Voice connection heartbeat timeout, closing");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });

        Self::send_message(
            ctx,
            &ServerMessage::Status {
                status: "connected",
                message: Some("Voice session established".to_string()),
            },
        );

        // Bring up the transcription stream and pump its transcripts into
        // the actor's mailbox. A stream that dies under a live conversation
        // is reported to the caller before the socket closes.
        let addr = ctx.address();
        let stt_config = self.stt_config.clone();
        let session = self.session.clone();
        let task = tokio::spawn(async move {
            match SttStream::connect(&stt_config).await {
                Ok((stream, transcripts)) => {
                    addr.do_send(SttReady(stream));
                    let pump_addr = addr.clone();
                    pump_transcripts(session, transcripts, move |event| match event {
                        SttEvent::Transcript(text) => {
                            pump_addr.do_send(FinalTranscript(text));
                        }
                        SttEvent::Lost => {
                            let err =
                                AgentError::Transport("transcription stream ended".to_string());
                            pump_addr.do_send(SendToClient(ServerMessage::Error {
                                message: err.user_message().to_string(),
                            }));
                            pump_addr.do_send(CloseConnection {
                                reason: "transcription lost".to_string(),
                            });
                        }
                    })
                    .await;
                }
                Err(err) => {
                    error!(error = %err, "Transcription stream setup failed");
                    addr.do_send(SendToClient(ServerMessage::Error {
                        message: err.user_message().to_string(),
                    }));
                    addr.do_send(CloseConnection {
                        reason: "transcription unavailable".to_string(),
                    });
                }
            }
        });
        self.track_task(task);

        self.start_greeting(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!("Voice connection stopped");
        self.shutdown_pipeline();
        self.app_state.decrement_active_sessions();
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for VoiceWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Binary(data)) => {
                self.handle_audio_frame(&data);
            }
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Ping) => {
                    self.last_heartbeat = Instant::now();
                    Self::send_message(ctx, &ServerMessage::Pong);
                }
                Ok(ClientMessage::Reset) => {
                    let addr = ctx.address();
                    let session = self.session.clone();
                    tokio::spawn(async move {
                        session.write().await.reset();
                        addr.do_send(SendToClient(ServerMessage::Status {
                            status: "ready",
                            message: Some("Conversation reset".to_string()),
                        }));
                    });
                }
                Ok(ClientMessage::Mute { muted }) => {
                    // Fire and forget; no acknowledgment message
                    self.apply_mute(muted);
                }
                Err(err) => {
                    debug!(error = %err, "Ignoring unrecognized client message");
                }
            },
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(?reason, "Client closed voice connection");
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(error = %err, "Voice socket protocol error");
                ctx.stop();
            }
        }
    }
}

impl Handler<SttReady> for VoiceWebSocket {
    type Result = ();

    fn handle(&mut self, msg: SttReady, _ctx: &mut Self::Context) {
        debug!("Transcription stream attached");
        self.stt = Some(msg.0);
    }
}

impl Handler<FinalTranscript> for VoiceWebSocket {
    type Result = ();

    fn handle(&mut self, msg: FinalTranscript, ctx: &mut Self::Context) {
        self.start_turn(msg.0, ctx);
    }
}

impl Handler<SendToClient> for VoiceWebSocket {
    type Result = ();

    fn handle(&mut self, msg: SendToClient, ctx: &mut Self::Context) {
        Self::send_message(ctx, &msg.0);
    }
}

impl Handler<CloseConnection> for VoiceWebSocket {
    type Result = ();

    fn handle(&mut self, msg: CloseConnection, ctx: &mut Self::Context) {
        info!(reason = %msg.reason, "Closing voice connection");
        Self::send_message(ctx, &ServerMessage::Disconnect { reason: msg.reason });
        ctx.close(Some(ws::CloseReason::from(ws::CloseCode::Normal)));
        ctx.stop();
    }
}

/// HTTP upgrade handler for `/ws/voice`.
///
/// Rejects the connection before the upgrade when the server is at its
/// session capacity or upstream credentials are missing.
pub async fn voice_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!(
        peer = ?req.connection_info().peer_addr(),
        "New voice connection request"
    );

    let config = app_state.get_config();

    if config.agent.openai_api_key.is_empty() || config.agent.deepgram_api_key.is_empty() {
        return Err(AppError::ConfigError(
            "Voice endpoint requires OPENAI_API_KEY and DEEPGRAM_API_KEY".to_string(),
        )
        .into());
    }

    let max_sessions = config.performance.max_concurrent_sessions;
    if let Err(active) = app_state.try_acquire_session(max_sessions) {
        warn!(active, max_sessions, "Rejecting voice connection at capacity");
        return Err(AppError::CapacityExceeded(format!(
            "Server is at its limit of {} concurrent sessions",
            max_sessions
        ))
        .into());
    }

    let pcm = PcmFormat::new(
        config.audio.sample_rate,
        config.audio.channels,
        config.audio.bit_depth,
    );

    let limits = SessionLimits {
        max_history_turns: config.session.max_history_turns,
        max_tool_rounds: config.session.max_tool_rounds,
        max_consecutive_failures: config.session.max_consecutive_failures,
        upstream_timeout: Duration::from_secs(config.session.upstream_timeout_secs),
    };
    let session = ConversationSession::new(limits, config.session.goodbye_phrases.clone());

    let chat = Arc::new(OpenAiChat::new(
        config.agent.llm_base_url.clone(),
        config.agent.openai_api_key.clone(),
        config.agent.llm_model.clone(),
        tool_declarations(),
        Duration::from_secs(config.session.upstream_timeout_secs),
    ));

    let tts = Arc::new(crate::agent::DeepgramTts::new(
        config.agent.deepgram_api_key.clone(),
        config.agent.tts_voice.clone(),
        config.audio.sample_rate,
        Duration::from_secs(config.session.upstream_timeout_secs),
    ));

    let stt_config = SttConfig {
        api_key: config.agent.deepgram_api_key.clone(),
        model: config.agent.stt_model.clone(),
        sample_rate: config.audio.sample_rate,
        channels: config.audio.channels,
    };

    let dispatcher = Arc::new(FunctionDispatcher::new(app_state.store.clone()));

    let websocket = VoiceWebSocket::new(
        session,
        chat,
        tts,
        dispatcher,
        stt_config,
        pcm,
        Duration::from_secs(config.session.upstream_timeout_secs),
        app_state.clone(),
    );

    match ws::start(websocket, &req, stream) {
        Ok(response) => Ok(response),
        Err(err) => {
            // The actor never started, so its stopped() won't release the slot
            app_state.decrement_active_sessions();
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::llm::{ChatMessage, ChatOutcome};
    use crate::config::AppConfig;
    use crate::pharmacy::PharmacyStore;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct StubChat;

    #[async_trait]
    impl ChatBackend for StubChat {
        async fn complete(&self, _messages: &[ChatMessage]) -> Result<ChatOutcome, AgentError> {
            Ok(ChatOutcome::Text("ok".to_string()))
        }
    }

    struct StubTts;

    #[async_trait]
    impl SpeechSynthesizer for StubTts {
        async fn synthesize(&self, _text: &str) -> Result<Vec<u8>, AgentError> {
            Ok(Vec::new())
        }
    }

    fn test_socket() -> VoiceWebSocket {
        let app_state = web::Data::new(AppState::new(
            AppConfig::default(),
            PharmacyStore::bundled().unwrap(),
        ));
        let dispatcher = Arc::new(FunctionDispatcher::new(app_state.store.clone()));
        let session = ConversationSession::new(SessionLimits::default(), vec!["goodbye".into()]);

        VoiceWebSocket::new(
            session,
            Arc::new(StubChat),
            Arc::new(StubTts),
            dispatcher,
            SttConfig {
                api_key: String::new(),
                model: "nova-3".to_string(),
                sample_rate: 16000,
                channels: 1,
            },
            PcmFormat::default(),
            Duration::from_secs(15),
            app_state,
        )
    }

    async fn wait_for_closed(session: &Arc<RwLock<ConversationSession>>) {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if let Ok(guard) = session.try_read() {
                if guard.state() == SessionState::Closed {
                    return;
                }
            }
            assert!(Instant::now() < deadline, "session never reached closed");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_shutdown_aborts_in_flight_turn() {
        let mut socket = test_socket();

        // Stand-in for a turn task: it takes the session write lock and
        // never finishes on its own.
        let session = socket.session.clone();
        let holder = tokio::spawn(async move {
            let _guard = session.write().await;
            std::future::pending::<()>().await;
        });

        let deadline = Instant::now() + Duration::from_secs(2);
        while socket.session.try_read().is_ok() {
            assert!(Instant::now() < deadline, "holder task never took the lock");
            tokio::task::yield_now().await;
        }
        socket.track_task(holder);

        socket.shutdown_pipeline();

        // The abort released the lock, letting the closed state land
        wait_for_closed(&socket.session).await;
        assert!(socket.pipeline_tasks.is_empty());
    }

    #[tokio::test]
    async fn test_stt_loss_mid_conversation_is_reported() {
        let session = Arc::new(RwLock::new(ConversationSession::new(
            SessionLimits::default(),
            vec![],
        )));
        session.write().await.set_state(SessionState::Listening);

        let (tx, rx) = mpsc::channel(4);
        tx.send("is my order ready".to_string()).await.unwrap();
        // Reader task death on a socket error drops the sender
        drop(tx);

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        pump_transcripts(session, rx, move |event| sink.lock().unwrap().push(event)).await;

        let events = events.lock().unwrap();
        assert_eq!(
            events[0],
            SttEvent::Transcript("is my order ready".to_string())
        );
        assert_eq!(events[1], SttEvent::Lost);
    }

    #[tokio::test]
    async fn test_stt_close_after_hangup_is_quiet() {
        let session = Arc::new(RwLock::new(ConversationSession::new(
            SessionLimits::default(),
            vec![],
        )));
        session.write().await.set_state(SessionState::Closed);

        let (tx, rx) = mpsc::channel::<String>(4);
        drop(tx);

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        pump_transcripts(session, rx, move |event| sink.lock().unwrap().push(event)).await;

        assert!(events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mute_applies_while_lock_is_free() {
        let socket = test_socket();

        socket.apply_mute(true);
        assert!(socket.session.try_read().unwrap().is_muted());

        socket.apply_mute(false);
        assert!(!socket.session.try_read().unwrap().is_muted());
    }

    #[test]
    fn test_server_message_wire_format() {
        let msg = ServerMessage::Transcript {
            text: "Hi, thanks for calling.".to_string(),
            speaker: Speaker::Assistant,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "transcript");
        assert_eq!(json["speaker"], "assistant");

        let msg = ServerMessage::Audio {
            data: "AAAA".to_string(),
            sample_rate: 16000,
            encoding: "linear16",
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "audio");
        assert_eq!(json["sampleRate"], 16000);
        assert_eq!(json["encoding"], "linear16");

        let msg = ServerMessage::Status {
            status: "thinking",
            message: None,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["status"], "thinking");
        // Absent message field is omitted, not null
        assert!(json.get("message").is_none());
    }

    #[test]
    fn test_client_message_parsing() {
        match serde_json::from_str::<ClientMessage>(r#"{"type":"ping"}"#).unwrap() {
            ClientMessage::Ping => {}
            other => panic!("expected ping, got {:?}", other),
        }

        match serde_json::from_str::<ClientMessage>(r#"{"type":"mute","muted":true}"#).unwrap() {
            ClientMessage::Mute { muted } => assert!(muted),
            other => panic!("expected mute, got {:?}", other),
        }

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"unknown"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>("not json").is_err());
    }

    #[test]
    fn test_disconnect_message_shape() {
        let msg = ServerMessage::Disconnect {
            reason: "goodbye".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"disconnect\""));
        assert!(json.contains("goodbye"));
    }
}
