use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Lifecycle of one bridged call.
///
/// ```text
/// AWAIT_START -> AI_CONNECTING -> AWAIT_METADATA -> ACTIVE -> CLOSING -> CLOSED
///      \______________\_________________\
///                                        -> FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    AwaitStart,
    AiConnecting,
    AwaitMetadata,
    Active,
    Closing,
    Closed,
    Failed,
}

impl SessionState {
    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (AwaitStart, AiConnecting)
                | (AiConnecting, AwaitMetadata)
                | (AwaitMetadata, Active)
                | (Active, Closing)
                | (Closing, Closed)
                | (AwaitStart | AiConnecting | AwaitMetadata, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    /// Before the agent connection has opened.
    pub fn is_pre_open(self) -> bool {
        matches!(self, SessionState::AwaitStart | SessionState::AiConnecting)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::AwaitStart => "AWAIT_START",
            SessionState::AiConnecting => "AI_CONNECTING",
            SessionState::AwaitMetadata => "AWAIT_METADATA",
            SessionState::Active => "ACTIVE",
            SessionState::Closing => "CLOSING",
            SessionState::Closed => "CLOSED",
            SessionState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Invalid session transition from {from} to {to}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },
}

pub type SessionResult<T> = Result<T, SessionError>;
