//! ElevenLabs Conversational AI connection settings.

use std::time::Duration;

use url::Url;

use crate::config::ServerConfig;
use crate::core::convai::base::{ConvAIError, ConvAIResult};

/// REST path that issues signed conversation URLs.
pub const SIGNED_URL_PATH: &str = "/v1/convai/conversation/get_signed_url";

/// WebSocket path for public (unauthenticated) agents.
pub const CONVERSATION_PATH: &str = "/v1/convai/conversation";

/// Header carrying the API key.
pub const API_KEY_HEADER: &str = "xi-api-key";

#[derive(Debug, Clone)]
pub struct ElevenLabsConfig {
    /// Without a key the public conversation endpoint is used.
    pub api_key: Option<String>,
    pub api_url: String,
    pub ws_url: String,
    /// Bound on signed-URL acquisition plus handshake.
    pub connect_timeout: Duration,
}

impl ElevenLabsConfig {
    pub fn from_server_config(config: &ServerConfig) -> Self {
        Self {
            api_key: config.elevenlabs_api_key.clone(),
            api_url: config.elevenlabs_api_url.clone(),
            ws_url: config.elevenlabs_ws_url.clone(),
            connect_timeout: config.convai_connect_timeout(),
        }
    }

    /// URL for requesting a signed conversation URL.
    pub fn signed_url_endpoint(&self, agent_id: &str) -> ConvAIResult<Url> {
        build_url(&self.api_url, SIGNED_URL_PATH, agent_id)
    }

    /// Direct WebSocket URL for public agents.
    pub fn public_ws_url(&self, agent_id: &str) -> ConvAIResult<Url> {
        build_url(&self.ws_url, CONVERSATION_PATH, agent_id)
    }
}

fn build_url(base: &str, path: &str, agent_id: &str) -> ConvAIResult<Url> {
    let raw = format!("{}{}", base.trim_end_matches('/'), path);
    Url::parse_with_params(&raw, &[("agent_id", agent_id)])
        .map_err(|e| ConvAIError::InvalidConfiguration(format!("Invalid URL '{raw}': {e}")))
}
