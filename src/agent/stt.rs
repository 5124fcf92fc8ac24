//! # Streaming Transcription Client
//!
//! Bridges microphone PCM from the browser connection to the Deepgram
//! streaming transcription API over an outbound WebSocket. Interim results
//! are disabled; the service only emits finalized utterances, which arrive
//! on a channel the connection actor listens to.
//!
//! ## Lifecycle:
//! One [`SttStream`] per voice session. Audio frames go in through a bounded
//! channel (a full buffer drops the frame, never blocks the actor), final
//! transcripts come out through another. Dropping the handle tears down both
//! I/O tasks and the upstream socket.

use crate::error::{AgentError, UpstreamService};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Frames of silence tolerance: the service drops idle connections, so a
/// keepalive goes out whenever no audio has flowed for this long.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Audio frames buffered toward the upstream socket before drops begin.
const AUDIO_BUFFER_FRAMES: usize = 64;

/// Connection parameters for the transcription service.
#[derive(Debug, Clone)]
pub struct SttConfig {
    pub api_key: String,
    pub model: String,
    pub sample_rate: u32,
    pub channels: u8,
}

impl SttConfig {
    fn listen_url(&self) -> String {
        format!(
            "wss://api.deepgram.com/v1/listen?model={}&encoding=linear16&sample_rate={}&channels={}&interim_results=false",
            self.model, self.sample_rate, self.channels
        )
    }
}

enum SttCommand {
    Audio(Vec<u8>),
    Finish,
}

/// Handle to a live transcription stream.
pub struct SttStream {
    command_tx: mpsc::Sender<SttCommand>,
}

impl SttStream {
    /// Open the upstream socket and spawn the I/O tasks. Returns the handle
    /// plus the channel finalized transcripts arrive on.
    pub async fn connect(
        config: &SttConfig,
    ) -> Result<(Self, mpsc::Receiver<String>), AgentError> {
        let mut request =
            config
                .listen_url()
                .into_client_request()
                .map_err(|err| AgentError::Upstream {
                    service: UpstreamService::Transcription,
                    message: format!("Bad transcription URL: {}", err),
                })?;

        let auth = format!("Token {}", config.api_key)
            .parse()
            .map_err(|_| AgentError::Upstream {
                service: UpstreamService::Transcription,
                message: "API key contains invalid header characters".to_string(),
            })?;
        request.headers_mut().insert("Authorization", auth);

        let (ws_stream, _) =
            tokio_tungstenite::connect_async(request)
                .await
                .map_err(|err| AgentError::Upstream {
                    service: UpstreamService::Transcription,
                    message: format!("Failed to connect to transcription service: {}", err),
                })?;

        info!(model = %config.model, "Transcription stream connected");

        let (mut sink, mut stream) = ws_stream.split();
        let (command_tx, mut command_rx) = mpsc::channel::<SttCommand>(AUDIO_BUFFER_FRAMES);
        let (transcript_tx, transcript_rx) = mpsc::channel::<String>(16);

        // Writer: audio frames out, keepalives while idle, CloseStream to
        // flush the final utterance on finish.
        tokio::spawn(async move {
            let mut keepalive = interval(KEEPALIVE_INTERVAL);
            keepalive.tick().await; // first tick fires immediately
            loop {
                tokio::select! {
                    command = command_rx.recv() => match command {
                        Some(SttCommand::Audio(frame)) => {
                            keepalive.reset();
                            if let Err(err) = sink.send(Message::Binary(frame)).await {
                                warn!(error = %err, "Transcription socket write failed");
                                break;
                            }
                        }
                        Some(SttCommand::Finish) => {
                            let close = r#"{"type":"CloseStream"}"#.to_string();
                            let _ = sink.send(Message::Text(close)).await;
                            break;
                        }
                        None => {
                            let _ = sink.close().await;
                            break;
                        }
                    },
                    _ = keepalive.tick() => {
                        let ping = r#"{"type":"KeepAlive"}"#.to_string();
                        if sink.send(Message::Text(ping)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        // Reader: forward finalized non-empty transcripts.
        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(raw)) => {
                        if let Some(transcript) = extract_final_transcript(&raw) {
                            debug!(text = %transcript, "Final transcript received");
                            if transcript_tx.send(transcript).await.is_err() {
                                break; // session is gone
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!("Transcription service closed the stream");
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        error!(error = %err, "Transcription socket read failed");
                        break;
                    }
                }
            }
        });

        Ok((Self { command_tx }, transcript_rx))
    }

    /// Queue a microphone frame toward the service. A full buffer drops the
    /// frame; transcription degrades gracefully under backpressure.
    pub fn send_audio(&self, frame: Vec<u8>) {
        if let Err(mpsc::error::TrySendError::Full(_)) =
            self.command_tx.try_send(SttCommand::Audio(frame))
        {
            warn!("Transcription buffer full, dropping audio frame");
        }
    }

    /// Ask the service to flush any buffered audio into a final transcript
    /// and end the stream.
    pub fn finish(&self) {
        let _ = self.command_tx.try_send(SttCommand::Finish);
    }
}

#[derive(Deserialize)]
struct ListenEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    is_final: bool,
    channel: Option<ListenChannel>,
}

#[derive(Deserialize)]
struct ListenChannel {
    alternatives: Vec<ListenAlternative>,
}

#[derive(Deserialize)]
struct ListenAlternative {
    transcript: String,
}

/// Pull the finalized transcript out of a service event, if there is one.
/// Metadata events, interim results, and empty transcripts all yield `None`.
fn extract_final_transcript(raw: &str) -> Option<String> {
    let event: ListenEvent = serde_json::from_str(raw).ok()?;
    if event.event_type != "Results" || !event.is_final {
        return None;
    }

    let transcript = event
        .channel?
        .alternatives
        .into_iter()
        .next()?
        .transcript
        .trim()
        .to_string();

    if transcript.is_empty() {
        None
    } else {
        Some(transcript)
    }
}
