//! Media stream WebSocket route configuration

use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::handlers::media_stream_handler;
use crate::state::AppState;
use std::sync::Arc;

/// Create the media stream WebSocket router
///
/// # Endpoint
///
/// `GET /outbound-media-stream` - WebSocket upgrade for a Twilio media stream
///
/// # Protocol
///
/// Twilio sends JSON text frames tagged by `event`:
/// 1. `connected`, then `start` carrying `streamSid`, `callSid` and the
///    call's `customParameters`
/// 2. `media` frames with base64 μ-law audio
/// 3. `stop` when the call ends
///
/// The server answers with `media` frames carrying agent audio and `clear`
/// when the agent is interrupted.
pub fn create_media_stream_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/outbound-media-stream", get(media_stream_handler))
        .layer(TraceLayer::new_for_http())
}
