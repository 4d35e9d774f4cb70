//! Twilio media stream message types.
//!
//! Twilio speaks JSON text frames discriminated by an `event` field. Inbound
//! events cover the stream lifecycle and caller audio; outbound events carry
//! agent audio and barge-in clears.
//!
//! See: https://www.twilio.com/docs/voice/media-streams/websocket-messages

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while decoding or encoding media stream frames.
#[derive(Debug, Error)]
pub enum MediaStreamError {
    #[error("Failed to parse media stream event: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Failed to serialize media stream event: {0}")]
    Serialization(String),
}

pub type MediaStreamResult<T> = Result<T, MediaStreamError>;

// =============================================================================
// Inbound Events
// =============================================================================

/// Events Twilio sends over the media stream.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum MediaStreamEvent {
    /// First frame after the socket opens
    Connected {
        #[serde(default)]
        protocol: Option<String>,
        #[serde(default)]
        version: Option<String>,
    },

    /// Stream metadata, sent once before any media
    Start { start: StartPayload },

    /// Caller audio
    Media { media: MediaPayload },

    /// Playback of a named mark finished
    Mark {
        #[serde(default)]
        mark: Option<MarkPayload>,
    },

    /// Keypad digit
    Dtmf {
        #[serde(default)]
        dtmf: Option<DtmfPayload>,
    },

    /// The stream ended
    Stop {
        #[serde(default)]
        stop: Option<StopPayload>,
    },

    /// Anything else
    #[serde(other)]
    Unknown,
}

impl MediaStreamEvent {
    /// Parse one text frame.
    pub fn parse(text: &str) -> MediaStreamResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Event name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            MediaStreamEvent::Connected { .. } => "connected",
            MediaStreamEvent::Start { .. } => "start",
            MediaStreamEvent::Media { .. } => "media",
            MediaStreamEvent::Mark { .. } => "mark",
            MediaStreamEvent::Dtmf { .. } => "dtmf",
            MediaStreamEvent::Stop { .. } => "stop",
            MediaStreamEvent::Unknown => "unknown",
        }
    }
}

/// Payload of the `start` event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartPayload {
    pub stream_sid: String,
    pub call_sid: String,
    #[serde(default)]
    pub account_sid: Option<String>,
    #[serde(default)]
    pub tracks: Vec<String>,
    /// `<Parameter>` values from the TwiML `<Stream>`; always strings
    #[serde(default)]
    pub custom_parameters: HashMap<String, String>,
    #[serde(default)]
    pub media_format: Option<MediaFormat>,
}

/// Audio format announced in `start`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaFormat {
    pub encoding: String,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Payload of the `media` event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MediaPayload {
    #[serde(default)]
    pub track: Option<String>,
    #[serde(default)]
    pub chunk: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    /// Base64 mu-law audio
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MarkPayload {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DtmfPayload {
    #[serde(default)]
    pub track: Option<String>,
    pub digit: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopPayload {
    #[serde(default)]
    pub account_sid: Option<String>,
    #[serde(default)]
    pub call_sid: Option<String>,
}

// =============================================================================
// Outbound Events
// =============================================================================

/// Events sent back to Twilio.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum OutboundMediaEvent {
    /// Agent audio for playback
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        media: OutboundMedia,
    },

    /// Flush queued playback
    Clear {
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMedia {
    pub payload: String,
}

impl OutboundMediaEvent {
    pub fn media(stream_sid: impl Into<String>, payload: impl Into<String>) -> Self {
        OutboundMediaEvent::Media {
            stream_sid: stream_sid.into(),
            media: OutboundMedia {
                payload: payload.into(),
            },
        }
    }

    pub fn clear(stream_sid: impl Into<String>) -> Self {
        OutboundMediaEvent::Clear {
            stream_sid: stream_sid.into(),
        }
    }

    pub fn to_json(&self) -> MediaStreamResult<String> {
        serde_json::to_string(self).map_err(|e| MediaStreamError::Serialization(e.to_string()))
    }
}
