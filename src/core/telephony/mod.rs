//! Telephony (media) leg.
//!
//! - `messages`: Twilio media stream event vocabulary
//! - `call_control`: REST call completion

pub mod call_control;
pub mod messages;

pub use call_control::{CallControl, CallControlError, CallControlResult, TwilioCallControl};
pub use messages::{
    MediaPayload, MediaStreamError, MediaStreamEvent, MediaStreamResult, OutboundMediaEvent,
    StartPayload,
};
