//! Base traits and types for conversational-AI agent connections.
//!
//! This module defines the provider-neutral side of the AI leg. Providers
//! translate their own wire vocabulary into [`AgentEvent`] and accept
//! [`AgentCommand`] in return, so the session controller never sees
//! provider-specific field names.
//!
//! # Audio Format
//!
//! Audio is carried as base64 text exactly as the telephony leg produced it
//! (8kHz mu-law for Twilio media streams). Nothing here decodes it.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::core::initiation::InitiationMessage;
use crate::core::telephony::CallControl;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur on the AI leg.
#[derive(Debug, Error)]
pub enum ConvAIError {
    /// Signed URL acquisition or WebSocket handshake failed
    #[error("Setup failed: {0}")]
    SetupFailed(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Not connected
    #[error("Not connected")]
    NotConnected,
}

/// Result type for AI leg operations.
pub type ConvAIResult<T> = Result<T, ConvAIError>;

// =============================================================================
// Canonical Event Types
// =============================================================================

/// One base64-encoded audio chunk, relayed without inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub payload: String,
}

impl AudioFrame {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
        }
    }
}

/// Who said an utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UtteranceRole {
    /// The AI agent
    Agent,
    /// The caller
    User,
}

impl fmt::Display for UtteranceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UtteranceRole::Agent => write!(f, "agent"),
            UtteranceRole::User => write!(f, "user"),
        }
    }
}

/// A finished line of conversation text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    pub role: UtteranceRole,
    pub text: String,
}

/// Data carried by the provider's handshake-complete event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitiationMetadata {
    pub conversation_id: String,
    pub agent_output_audio_format: Option<String>,
    pub user_input_audio_format: Option<String>,
}

/// Canonical inbound events from the AI leg.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// The conversation exists; the session may now send its initialization
    InitiationMetadata(InitiationMetadata),
    /// Agent speech for the caller
    Audio(AudioFrame),
    /// Caller barge-in: queued playback must be flushed
    Interruption,
    /// Keepalive probe. Answered by the provider adapter and never
    /// delivered to the session.
    Ping { event_id: u64 },
    /// Transcript line for the persistence collaborator
    Utterance(Utterance),
}

/// Canonical outbound commands to the AI leg.
#[derive(Debug, Clone)]
pub enum AgentCommand {
    /// Session initialization, sent once after the metadata event
    Initiate(InitiationMessage),
    /// Caller audio
    UserAudio(AudioFrame),
    /// Keepalive reply
    Pong { event_id: u64 },
    /// Half-close the connection
    Close,
}

// =============================================================================
// Connection Handle
// =============================================================================

/// Channel capacity for commands sent to the AI connection task.
pub const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// Channel capacity for events delivered to the session.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

struct CallBinding {
    call_sid: String,
    call_control: Arc<dyn CallControl>,
    tracker: TaskTracker,
}

/// Exclusive handle to one live AI connection.
///
/// The transport runs in its own task; this handle talks to it through two
/// bounded channels. The `open` flag is shared with that task and drops to
/// `false` as soon as the transport ends.
pub struct AgentConnection {
    commands: mpsc::Sender<AgentCommand>,
    events: mpsc::Receiver<AgentEvent>,
    open: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
    call: Option<CallBinding>,
    closed: bool,
}

impl AgentConnection {
    /// Wrap a running transport task.
    pub fn new(
        commands: mpsc::Sender<AgentCommand>,
        events: mpsc::Receiver<AgentEvent>,
        open: Arc<AtomicBool>,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            commands,
            events,
            open,
            task,
            call: None,
            closed: false,
        }
    }

    /// Whether the transport is still open.
    pub fn is_open(&self) -> bool {
        !self.closed && self.open.load(Ordering::SeqCst)
    }

    /// Bind the telephony call so that closing this connection also ends the call.
    pub fn bind_call(
        &mut self,
        call_sid: impl Into<String>,
        call_control: Arc<dyn CallControl>,
        tracker: TaskTracker,
    ) {
        self.call = Some(CallBinding {
            call_sid: call_sid.into(),
            call_control,
            tracker,
        });
    }

    /// Forward caller audio.
    ///
    /// Silently does nothing when the connection is not open. When the
    /// transport is backed up the frame is dropped rather than queued.
    /// Returns whether the frame was handed to the transport.
    pub fn send_user_audio(&self, frame: AudioFrame) -> bool {
        if !self.is_open() {
            return false;
        }
        match self.commands.try_send(AgentCommand::UserAudio(frame)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("AI command channel full, dropping caller audio frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Send a control command (initialization, pong).
    pub async fn send(&self, command: AgentCommand) -> ConvAIResult<()> {
        if !self.is_open() {
            return Err(ConvAIError::NotConnected);
        }
        self.commands
            .send(command)
            .await
            .map_err(|_| ConvAIError::NotConnected)
    }

    /// Next event from the provider, or `None` once the transport has ended.
    pub async fn recv(&mut self) -> Option<AgentEvent> {
        self.events.recv().await
    }

    /// Half-close the connection.
    ///
    /// Asks the transport to send a close frame and keeps reading until the
    /// provider finishes. If a call is bound, the telephony side is asked to
    /// mark it completed; that request is best-effort and never retried.
    /// Calling this more than once has no further effect.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        if self.open.load(Ordering::SeqCst) && self.commands.send(AgentCommand::Close).await.is_err()
        {
            debug!("AI transport already gone while closing");
        }
        self.closed = true;

        if let Some(binding) = self.call.take() {
            let CallBinding {
                call_sid,
                call_control,
                tracker,
            } = binding;
            tracker.spawn(async move {
                match call_control.complete_call(&call_sid).await {
                    Ok(()) => info!(call_sid = %call_sid, "Call marked completed"),
                    Err(e) => warn!(call_sid = %call_sid, "Failed to mark call completed: {}", e),
                }
            });
        }
    }
}

impl Drop for AgentConnection {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// =============================================================================
// Connector Trait
// =============================================================================

/// Opens AI connections for sessions.
#[async_trait]
pub trait AgentConnector: Send + Sync {
    /// Acquire a connection URL and complete the handshake for `agent_id`.
    ///
    /// Fails with [`ConvAIError::SetupFailed`] when either step fails.
    async fn connect(&self, agent_id: &str) -> ConvAIResult<AgentConnection>;

    /// Short provider name for logs.
    fn provider_name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_connection(
        capacity: usize,
    ) -> (
        AgentConnection,
        mpsc::Receiver<AgentCommand>,
        mpsc::Sender<AgentEvent>,
        Arc<AtomicBool>,
    ) {
        let (cmd_tx, cmd_rx) = mpsc::channel(capacity);
        let (ev_tx, ev_rx) = mpsc::channel(capacity);
        let open = Arc::new(AtomicBool::new(true));
        let conn = AgentConnection::new(cmd_tx, ev_rx, open.clone(), None);
        (conn, cmd_rx, ev_tx, open)
    }

    #[test]
    fn test_utterance_role_display() {
        assert_eq!(UtteranceRole::Agent.to_string(), "agent");
        assert_eq!(UtteranceRole::User.to_string(), "user");
    }

    #[test]
    fn test_error_display() {
        let err = ConvAIError::SetupFailed("bad key".to_string());
        assert!(err.to_string().contains("Setup failed"));
        assert_eq!(ConvAIError::NotConnected.to_string(), "Not connected");
    }

    #[tokio::test]
    async fn test_send_user_audio_when_closed_is_noop() {
        let (conn, mut cmd_rx, _ev_tx, open) = test_connection(4);
        open.store(false, Ordering::SeqCst);

        assert!(!conn.send_user_audio(AudioFrame::new("AAAA")));
        assert!(cmd_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_user_audio_drops_when_full() {
        let (conn, mut cmd_rx, _ev_tx, _open) = test_connection(1);

        assert!(conn.send_user_audio(AudioFrame::new("first")));
        assert!(!conn.send_user_audio(AudioFrame::new("second")));

        match cmd_rx.recv().await {
            Some(AgentCommand::UserAudio(frame)) => assert_eq!(frame.payload, "first"),
            other => panic!("Unexpected command: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut conn, mut cmd_rx, _ev_tx, _open) = test_connection(4);

        conn.close().await;
        conn.close().await;

        assert!(matches!(cmd_rx.recv().await, Some(AgentCommand::Close)));
        assert!(cmd_rx.try_recv().is_err());
        assert!(!conn.is_open());
        assert!(!conn.send_user_audio(AudioFrame::new("late")));
    }

    #[tokio::test]
    async fn test_send_rejects_after_transport_end() {
        let (conn, _cmd_rx, _ev_tx, open) = test_connection(4);
        open.store(false, Ordering::SeqCst);

        let result = conn.send(AgentCommand::Pong { event_id: 1 }).await;
        assert!(matches!(result, Err(ConvAIError::NotConnected)));
    }
}
