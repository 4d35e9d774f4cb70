//! ElevenLabs Conversational AI provider.
//!
//! - `config`: endpoints, credentials and timeouts
//! - `messages`: wire vocabulary and translation to canonical events
//! - `client`: signed-URL acquisition and the socket task

mod client;
mod config;
mod messages;

pub use client::ElevenLabsConnector;
pub use config::{API_KEY_HEADER, CONVERSATION_PATH, ElevenLabsConfig, SIGNED_URL_PATH};
pub use messages::{
    AgentResponseEvent, AudioChunk, AudioEvent, ClientMessage, InitiationMetadataEvent, PingEvent,
    ServerMessage, TypedClientMessage, UserTranscriptionEvent, translate,
};
