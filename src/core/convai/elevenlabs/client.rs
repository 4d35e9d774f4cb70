//! ElevenLabs Conversational AI WebSocket client.
//!
//! # Connection flow
//!
//! 1. With an API key, request a signed URL from the REST API; without one,
//!    use the public conversation endpoint.
//! 2. Open the WebSocket. Both steps share one timeout.
//! 3. Spawn a task that owns the socket. It answers pings itself and turns
//!    every other server message into an [`AgentEvent`] for the session.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, error, info, trace, warn};

use super::config::{API_KEY_HEADER, ElevenLabsConfig};
use super::messages::{ClientMessage, ServerMessage, TypedClientMessage, translate};
use crate::core::convai::base::{
    AgentCommand, AgentConnection, AgentConnector, AgentEvent, COMMAND_CHANNEL_CAPACITY,
    ConvAIError, ConvAIResult, EVENT_CHANNEL_CAPACITY,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Deserialize)]
struct SignedUrlResponse {
    signed_url: String,
}

/// Opens ElevenLabs conversations.
pub struct ElevenLabsConnector {
    config: ElevenLabsConfig,
    http: reqwest::Client,
}

impl ElevenLabsConnector {
    pub fn new(config: ElevenLabsConfig) -> ConvAIResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.connect_timeout)
            .build()
            .map_err(|e| ConvAIError::InvalidConfiguration(e.to_string()))?;
        Ok(Self { config, http })
    }

    /// URL to open the conversation WebSocket against.
    pub async fn connection_url(&self, agent_id: &str) -> ConvAIResult<String> {
        match self.config.api_key.as_deref() {
            Some(api_key) => self.get_signed_url(agent_id, api_key).await,
            None => {
                debug!("No ElevenLabs API key configured, using public conversation URL");
                Ok(self.config.public_ws_url(agent_id)?.to_string())
            }
        }
    }

    async fn get_signed_url(&self, agent_id: &str, api_key: &str) -> ConvAIResult<String> {
        let endpoint = self.config.signed_url_endpoint(agent_id)?;

        let response = self
            .http
            .get(endpoint)
            .header(API_KEY_HEADER, api_key)
            .send()
            .await
            .map_err(|e| ConvAIError::SetupFailed(format!("Signed URL request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ConvAIError::SetupFailed(format!(
                "Failed to get signed URL ({status}): {body}"
            )));
        }

        let signed: SignedUrlResponse = response
            .json()
            .await
            .map_err(|e| ConvAIError::SetupFailed(format!("Invalid signed URL response: {e}")))?;

        Ok(signed.signed_url)
    }

    async fn open(&self, agent_id: &str) -> ConvAIResult<AgentConnection> {
        let url = self.connection_url(agent_id).await?;

        let (ws_stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| ConvAIError::SetupFailed(format!("WebSocket handshake failed: {e}")))?;

        info!(agent_id = %agent_id, "Connected to ElevenLabs Conversational AI");

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let open = Arc::new(AtomicBool::new(true));

        let task = tokio::spawn(run_connection(ws_stream, command_rx, event_tx, open.clone()));

        Ok(AgentConnection::new(command_tx, event_rx, open, Some(task)))
    }
}

#[async_trait]
impl AgentConnector for ElevenLabsConnector {
    async fn connect(&self, agent_id: &str) -> ConvAIResult<AgentConnection> {
        let timeout = self.config.connect_timeout;
        tokio::time::timeout(timeout, self.open(agent_id))
            .await
            .map_err(|_| {
                ConvAIError::SetupFailed(format!(
                    "Connection not established within {}s",
                    timeout.as_secs()
                ))
            })?
    }

    fn provider_name(&self) -> &'static str {
        "elevenlabs"
    }
}

/// Socket loop for one conversation.
///
/// Ends when the server closes, the socket errors, or the session drops its
/// event receiver. Dropping `events` on exit is what tells the session the
/// AI leg has closed.
async fn run_connection(
    ws_stream: WsStream,
    mut commands: mpsc::Receiver<AgentCommand>,
    events: mpsc::Sender<AgentEvent>,
    open: Arc<AtomicBool>,
) {
    let (mut ws_sink, mut ws_stream) = ws_stream.split();
    let mut closing = false;

    loop {
        tokio::select! {
            command = commands.recv(), if !closing => {
                match command {
                    Some(AgentCommand::Close) | None => {
                        debug!("Closing ElevenLabs connection");
                        closing = true;
                        open.store(false, Ordering::SeqCst);
                        if let Err(e) = ws_sink.send(Message::Close(None)).await {
                            debug!("Failed to send close frame: {}", e);
                            break;
                        }
                    }
                    Some(command) => {
                        let Some(message) = ClientMessage::from_command(command) else {
                            continue;
                        };
                        let json = match serde_json::to_string(&message) {
                            Ok(j) => j,
                            Err(e) => {
                                error!("Failed to serialize ElevenLabs message: {}", e);
                                continue;
                            }
                        };
                        if let Err(e) = ws_sink.send(Message::Text(json.into())).await {
                            warn!("Failed to send ElevenLabs message: {}", e);
                            break;
                        }
                    }
                }
            }

            msg = ws_stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let message = match serde_json::from_str::<ServerMessage>(&text) {
                            Ok(m) => m,
                            Err(e) => {
                                warn!("Failed to parse ElevenLabs message: {}", e);
                                continue;
                            }
                        };

                        match translate(message) {
                            Some(AgentEvent::Ping { event_id }) => {
                                trace!(event_id, "Answering ElevenLabs ping");
                                let pong = ClientMessage::Typed(TypedClientMessage::Pong { event_id });
                                let json = match serde_json::to_string(&pong) {
                                    Ok(j) => j,
                                    Err(e) => {
                                        error!("Failed to serialize pong: {}", e);
                                        continue;
                                    }
                                };
                                if let Err(e) = ws_sink.send(Message::Text(json.into())).await {
                                    warn!("Failed to send pong: {}", e);
                                    break;
                                }
                            }
                            Some(event) => {
                                if events.send(event).await.is_err() {
                                    debug!("Session no longer listening, stopping ElevenLabs task");
                                    break;
                                }
                            }
                            None => {
                                debug!("Ignoring unhandled ElevenLabs message: {}", truncate(&text, 120));
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!("ElevenLabs closed the connection: {:?}", frame);
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = ws_sink.send(Message::Pong(data)).await {
                            debug!("Failed to send WebSocket pong: {}", e);
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("ElevenLabs WebSocket error: {}", e);
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    open.store(false, Ordering::SeqCst);
    debug!("ElevenLabs connection task finished");
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
