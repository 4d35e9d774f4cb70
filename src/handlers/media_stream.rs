//! Media stream WebSocket handler
//!
//! Twilio connects here once per call. The socket is split into a reader
//! that parses inbound frames into [`MediaStreamEvent`]s and a writer that
//! serializes [`OutboundMediaEvent`]s; a [`SessionController`] sits between
//! them and owns the call until it reaches a terminal state.

use std::sync::Arc;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use crate::core::session::{SessionController, SessionState};
use crate::core::telephony::{MediaStreamEvent, OutboundMediaEvent};
use crate::state::AppState;

/// Channel buffer between the socket tasks and the controller
const CHANNEL_BUFFER_SIZE: usize = 1024;

/// Maximum WebSocket frame size (1 MB). Media frames are 20ms of audio.
const MAX_WS_FRAME_SIZE: usize = 1024 * 1024;

/// Maximum WebSocket message size (1 MB)
const MAX_WS_MESSAGE_SIZE: usize = 1024 * 1024;

/// How long the writer may take to flush and close after the session ends
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Media stream WebSocket handler
///
/// `GET /outbound-media-stream` upgrades to a WebSocket speaking the Twilio
/// media stream protocol.
pub async fn media_stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    debug!("Media stream WebSocket upgrade requested");

    ws.max_frame_size(MAX_WS_FRAME_SIZE)
        .max_message_size(MAX_WS_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_media_socket(socket, state))
}

async fn handle_media_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundMediaEvent>(CHANNEL_BUFFER_SIZE);
    let (inbound_tx, inbound_rx) = mpsc::channel::<MediaStreamEvent>(CHANNEL_BUFFER_SIZE);

    let controller = SessionController::new(state.session_context(), inbound_rx, outbound_tx);
    let session_id = controller.session_id();
    info!(session_id = %session_id, "Media stream connection established");

    // Writer: runs until the controller drops its sender, then closes the socket
    let writer_task = tokio::spawn(async move {
        while let Some(event) = outbound_rx.recv().await {
            let json = match event.to_json() {
                Ok(json) => json,
                Err(e) => {
                    error!("Failed to serialize outbound media event: {}", e);
                    continue;
                }
            };
            if let Err(e) = sender.send(Message::Text(json.into())).await {
                debug!("Failed to send media stream message: {}", e);
                break;
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    // Reader: ends when the media socket closes, which the controller sees
    // as the end of its inbound channel
    let reader_task = tokio::spawn(async move {
        while let Some(message) = receiver.next().await {
            match message {
                Ok(Message::Text(text)) => match MediaStreamEvent::parse(text.as_str()) {
                    Ok(event) => {
                        if inbound_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Dropping malformed media stream message: {}", e),
                },
                Ok(Message::Binary(data)) => {
                    debug!("Ignoring binary media stream frame: {} bytes", data.len());
                }
                Ok(Message::Close(_)) => {
                    debug!("Media stream closed by peer");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Media stream WebSocket error: {}", e);
                    break;
                }
            }
        }
    });

    let outcome = controller.run().await;

    reader_task.abort();
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer_task)
        .await
        .is_err()
    {
        warn!(session_id = %session_id, "Media stream writer did not finish in time");
    }

    match outcome.final_state {
        SessionState::Closed => info!(
            session_id = %session_id,
            conversation_id = outcome.conversation_id.as_deref().unwrap_or("-"),
            "Media stream connection terminated"
        ),
        state => warn!(
            session_id = %session_id,
            state = %state,
            "Media stream connection terminated without completing the call"
        ),
    }
}
