//! Conversational-AI (agent) leg.
//!
//! `base` holds the provider-neutral handle and event vocabulary; each
//! provider lives in its own submodule.

pub mod base;
pub mod elevenlabs;

use std::sync::Arc;

pub use base::{
    AgentCommand, AgentConnection, AgentConnector, AgentEvent, AudioFrame, ConvAIError,
    ConvAIResult, InitiationMetadata, Utterance, UtteranceRole,
};
pub use elevenlabs::{ElevenLabsConfig, ElevenLabsConnector};

use crate::config::ServerConfig;

/// Build the agent connector described by the server configuration.
pub fn create_connector(config: &ServerConfig) -> ConvAIResult<Arc<dyn AgentConnector>> {
    let connector = ElevenLabsConnector::new(ElevenLabsConfig::from_server_config(config))?;
    Ok(Arc::new(connector))
}
