//! ElevenLabs Conversational AI WebSocket message types.
//!
//! Server messages are tagged by `type` and nest their data in a
//! `<type>_event` object. Client messages are either typed control messages
//! or bare `user_audio_chunk` frames.

use serde::{Deserialize, Serialize};

use crate::core::convai::base::{
    AgentCommand, AgentEvent, AudioFrame, InitiationMetadata, Utterance, UtteranceRole,
};
use crate::core::initiation::InitiationMessage;

// =============================================================================
// Server Messages
// =============================================================================

/// Messages received from ElevenLabs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake complete; carries the conversation id
    ConversationInitiationMetadata {
        conversation_initiation_metadata_event: InitiationMetadataEvent,
    },

    /// Agent speech. Depending on API version the chunk is under
    /// `audio.chunk` or `audio_event.audio_base_64`.
    Audio {
        #[serde(default)]
        audio: Option<AudioChunk>,
        #[serde(default)]
        audio_event: Option<AudioEvent>,
    },

    /// Caller interrupted the agent
    Interruption {
        #[serde(default)]
        interruption_event: Option<serde_json::Value>,
    },

    /// Keepalive; must be answered with a pong carrying the same id
    Ping {
        #[serde(default)]
        ping_event: Option<PingEvent>,
    },

    AgentResponse {
        #[serde(default)]
        agent_response_event: Option<AgentResponseEvent>,
    },

    UserTranscript {
        #[serde(default)]
        user_transcription_event: Option<UserTranscriptionEvent>,
    },

    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InitiationMetadataEvent {
    pub conversation_id: String,
    #[serde(default)]
    pub agent_output_audio_format: Option<String>,
    #[serde(default)]
    pub user_input_audio_format: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AudioChunk {
    #[serde(default)]
    pub chunk: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AudioEvent {
    #[serde(default)]
    pub audio_base_64: Option<String>,
    #[serde(default)]
    pub event_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PingEvent {
    #[serde(default)]
    pub event_id: Option<u64>,
    #[serde(default)]
    pub ping_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AgentResponseEvent {
    pub agent_response: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UserTranscriptionEvent {
    pub user_transcript: String,
}

/// Map a server message onto the canonical event vocabulary.
///
/// Returns `None` for messages with no effect: unknown types, audio without
/// a payload, and pings without an event id.
pub fn translate(message: ServerMessage) -> Option<AgentEvent> {
    match message {
        ServerMessage::ConversationInitiationMetadata {
            conversation_initiation_metadata_event: event,
        } => Some(AgentEvent::InitiationMetadata(InitiationMetadata {
            conversation_id: event.conversation_id,
            agent_output_audio_format: event.agent_output_audio_format,
            user_input_audio_format: event.user_input_audio_format,
        })),
        ServerMessage::Audio { audio, audio_event } => audio
            .and_then(|a| a.chunk)
            .filter(|c| !c.is_empty())
            .or_else(|| {
                audio_event
                    .and_then(|e| e.audio_base_64)
                    .filter(|c| !c.is_empty())
            })
            .map(|payload| AgentEvent::Audio(AudioFrame { payload })),
        ServerMessage::Interruption { .. } => Some(AgentEvent::Interruption),
        ServerMessage::Ping { ping_event } => ping_event
            .and_then(|p| p.event_id)
            .map(|event_id| AgentEvent::Ping { event_id }),
        ServerMessage::AgentResponse {
            agent_response_event,
        } => agent_response_event.map(|e| {
            AgentEvent::Utterance(Utterance {
                role: UtteranceRole::Agent,
                text: e.agent_response,
            })
        }),
        ServerMessage::UserTranscript {
            user_transcription_event,
        } => user_transcription_event.map(|e| {
            AgentEvent::Utterance(Utterance {
                role: UtteranceRole::User,
                text: e.user_transcript,
            })
        }),
        ServerMessage::Unknown => None,
    }
}

// =============================================================================
// Client Messages
// =============================================================================

/// Typed control messages sent to ElevenLabs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TypedClientMessage {
    ConversationInitiationClientData(InitiationMessage),
    Pong { event_id: u64 },
}

/// Any message sent to ElevenLabs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ClientMessage {
    Typed(TypedClientMessage),
    /// Caller audio, base64 as received from the media leg
    UserAudio { user_audio_chunk: String },
}

impl ClientMessage {
    /// Wire form of a canonical command. `Close` has none.
    pub fn from_command(command: AgentCommand) -> Option<Self> {
        match command {
            AgentCommand::Initiate(message) => Some(ClientMessage::Typed(
                TypedClientMessage::ConversationInitiationClientData(message),
            )),
            AgentCommand::UserAudio(frame) => Some(ClientMessage::UserAudio {
                user_audio_chunk: frame.payload,
            }),
            AgentCommand::Pong { event_id } => {
                Some(ClientMessage::Typed(TypedClientMessage::Pong { event_id }))
            }
            AgentCommand::Close => None,
        }
    }
}
