//! HTTP and WebSocket request handlers
//!
//! - `api` - Health check endpoint
//! - `media_stream` - Twilio media stream WebSocket, one session per connection

pub mod api;
pub mod media_stream;

pub use media_stream::media_stream_handler;
