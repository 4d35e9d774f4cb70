//! Per-call session: model, state machine and controller.

mod controller;
mod state;

pub use controller::{SessionContext, SessionController, SessionOutcome};
pub use state::{SessionError, SessionResult, SessionState};

use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::initiation::{ConfigMode, ResolvedInitiation};

/// State of one bridged call.
///
/// Owned by a single [`SessionController`]; nothing else mutates it.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    state: SessionState,
    transitions: Vec<SessionState>,
    pub stream_sid: Option<String>,
    pub call_sid: Option<String>,
    conversation_id: Option<String>,
    pub initiation: Option<ResolvedInitiation>,
    pub started_at: Option<Instant>,
    /// When the session entered `CLOSING`; the call duration ends here
    pub closing_at: Option<Instant>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: SessionState::AwaitStart,
            transitions: vec![SessionState::AwaitStart],
            stream_sid: None,
            call_sid: None,
            conversation_id: None,
            initiation: None,
            started_at: None,
            closing_at: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Every state entered so far, starting with `AWAIT_START`.
    pub fn transitions(&self) -> &[SessionState] {
        &self.transitions
    }

    pub fn transition(&mut self, next: SessionState) -> SessionResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        let mode = self.mode().map(|m| m.to_string());
        info!(
            session_id = %self.id,
            stream_sid = self.stream_sid.as_deref().unwrap_or("-"),
            mode = mode.as_deref().unwrap_or("-"),
            from = %self.state,
            to = %next,
            "Session state changed"
        );
        self.state = next;
        self.transitions.push(next);
        Ok(())
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    /// Record the conversation id. Once set it never changes; later values
    /// are ignored and `false` is returned.
    pub fn set_conversation_id(&mut self, conversation_id: impl Into<String>) -> bool {
        let conversation_id = conversation_id.into();
        match &self.conversation_id {
            Some(existing) => {
                if *existing != conversation_id {
                    warn!(
                        session_id = %self.id,
                        existing = %existing,
                        ignored = %conversation_id,
                        "Conversation id already set"
                    );
                }
                false
            }
            None => {
                self.conversation_id = Some(conversation_id);
                true
            }
        }
    }

    pub fn mode(&self) -> Option<ConfigMode> {
        self.initiation.as_ref().map(|i| i.mode)
    }

    pub fn external_ref_id(&self) -> Option<&str> {
        self.initiation
            .as_ref()
            .and_then(|i| i.external_ref_id.as_deref())
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
