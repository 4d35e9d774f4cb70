//! Session initialization resolver.
//!
//! Twilio hands custom parameters to the stream as a flat string map. Two
//! shapes are accepted:
//!
//! - **Advanced**: a `config` parameter holding base64 JSON (optionally
//!   percent-encoded on top) with `dynamic_variables` and
//!   `conversation_config_override`.
//! - **Legacy**: flat `prompt` and `first_message` parameters.
//!
//! [`resolve`] turns either shape into the single
//! `conversation_initiation_client_data` payload the agent expects.

use std::collections::HashMap;
use std::fmt;

use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

/// Custom parameter carrying the encoded advanced payload
pub const CONFIG_PARAM: &str = "config";
/// Legacy system prompt parameter
pub const PROMPT_PARAM: &str = "prompt";
/// Legacy greeting parameter
pub const FIRST_MESSAGE_PARAM: &str = "first_message";

/// Prompt used when a legacy session supplies none
pub const FALLBACK_PROMPT: &str = "you are a gary from the phone store";
/// Greeting used when a legacy session supplies none
pub const FALLBACK_FIRST_MESSAGE: &str = "hey there! how can I help you today?";

// Twilio and browsers both produce padded and unpadded base64.
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Why an advanced payload could not be decoded.
///
/// Never escapes [`resolve`]; a failed decode falls back to an empty override.
#[derive(Debug, Error)]
pub enum InitiationError {
    #[error("Invalid encoding: {0}")]
    Encoding(String),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Decoded payload is not a JSON object")]
    NotAnObject,
}

pub type InitiationResult<T> = Result<T, InitiationError>;

/// Which parameter shape a session used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigMode {
    Legacy,
    Advanced,
}

impl fmt::Display for ConfigMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigMode::Legacy => write!(f, "legacy"),
            ConfigMode::Advanced => write!(f, "advanced"),
        }
    }
}

/// Body of the `conversation_initiation_client_data` message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InitiationMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dynamic_variables: Option<Map<String, Value>>,
    /// Always carries an `agent` object
    pub conversation_config_override: Map<String, Value>,
}

impl InitiationMessage {
    /// Build a message, enforcing the `agent` object on the override.
    pub fn new(
        dynamic_variables: Option<Map<String, Value>>,
        mut conversation_config_override: Map<String, Value>,
    ) -> Self {
        ensure_agent(&mut conversation_config_override);
        Self {
            dynamic_variables,
            conversation_config_override,
        }
    }

    /// Override with nothing but an empty `agent` object.
    pub fn empty_override() -> Self {
        Self::new(None, Map::new())
    }
}

/// Outcome of resolving a session's start parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedInitiation {
    pub mode: ConfigMode,
    pub message: InitiationMessage,
    pub external_ref_id: Option<String>,
}

impl ResolvedInitiation {
    /// Dynamic variables, empty for legacy sessions.
    pub fn dynamic_variables(&self) -> Map<String, Value> {
        self.message.dynamic_variables.clone().unwrap_or_default()
    }
}

/// Decoded advanced payload.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AdvancedConfig {
    pub dynamic_variables: Map<String, Value>,
    pub conversation_config_override: Map<String, Value>,
}

/// Resolve raw start parameters into one initialization message.
///
/// The advanced `config` parameter wins when present. Decode failures are
/// logged and yield an empty override. `external_ref_key` names the dynamic
/// variable (or flat parameter) that carries the caller's correlation id.
pub fn resolve(params: &HashMap<String, String>, external_ref_key: &str) -> ResolvedInitiation {
    if let Some(raw) = params.get(CONFIG_PARAM) {
        let message = match decode_advanced(raw) {
            Ok(config) => {
                debug!(
                    dynamic_variables = config.dynamic_variables.len(),
                    "Decoded advanced session configuration"
                );
                InitiationMessage::new(
                    Some(config.dynamic_variables),
                    config.conversation_config_override,
                )
            }
            Err(e) => {
                warn!("Failed to decode advanced configuration, using empty override: {}", e);
                InitiationMessage::empty_override()
            }
        };

        let external_ref_id = message
            .dynamic_variables
            .as_ref()
            .and_then(|vars| vars.get(external_ref_key))
            .and_then(value_as_ref_id)
            .or_else(|| flat_ref_id(params, external_ref_key));

        return ResolvedInitiation {
            mode: ConfigMode::Advanced,
            message,
            external_ref_id,
        };
    }

    let prompt = non_empty(params.get(PROMPT_PARAM)).unwrap_or(FALLBACK_PROMPT);
    let first_message = non_empty(params.get(FIRST_MESSAGE_PARAM)).unwrap_or(FALLBACK_FIRST_MESSAGE);

    let mut agent = Map::new();
    agent.insert(
        "prompt".to_string(),
        serde_json::json!({ "prompt": prompt }),
    );
    agent.insert(
        "first_message".to_string(),
        Value::String(first_message.to_string()),
    );
    let mut conversation_config_override = Map::new();
    conversation_config_override.insert("agent".to_string(), Value::Object(agent));

    ResolvedInitiation {
        mode: ConfigMode::Legacy,
        message: InitiationMessage::new(None, conversation_config_override),
        external_ref_id: flat_ref_id(params, external_ref_key),
    }
}

/// Decode the advanced `config` parameter.
///
/// The value is percent-decoded, then base64-decoded, then parsed as a JSON
/// object. Missing or non-object members default to empty maps.
pub fn decode_advanced(raw: &str) -> InitiationResult<AdvancedConfig> {
    let unescaped = urlencoding::decode(raw.trim())
        .map_err(|e| InitiationError::Encoding(e.to_string()))?;

    let normalized: String = unescaped
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            other => other,
        })
        .collect();

    let bytes = LENIENT_BASE64
        .decode(normalized.as_bytes())
        .map_err(|e| InitiationError::Encoding(e.to_string()))?;

    let value: Value = serde_json::from_slice(&bytes)?;
    let Value::Object(mut root) = value else {
        return Err(InitiationError::NotAnObject);
    };

    Ok(AdvancedConfig {
        dynamic_variables: take_object(&mut root, "dynamic_variables"),
        conversation_config_override: take_object(&mut root, "conversation_config_override"),
    })
}

/// Guarantee `override.agent` is an object.
pub fn ensure_agent(conversation_config_override: &mut Map<String, Value>) {
    if !matches!(conversation_config_override.get("agent"), Some(Value::Object(_))) {
        conversation_config_override.insert("agent".to_string(), Value::Object(Map::new()));
    }
}

fn take_object(root: &mut Map<String, Value>, key: &str) -> Map<String, Value> {
    match root.remove(key) {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(String::as_str).filter(|v| !v.trim().is_empty())
}

fn flat_ref_id(params: &HashMap<String, String>, key: &str) -> Option<String> {
    non_empty(params.get(key)).map(str::to_string)
}

fn value_as_ref_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
