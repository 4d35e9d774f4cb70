//! Process-wide application state shared by every handler.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::core::convai::{AgentConnector, create_connector};
use crate::core::persistence::{ConversationStore, LogConversationStore};
use crate::core::report::CallEndReporter;
use crate::core::session::SessionContext;
use crate::core::telephony::{CallControl, TwilioCallControl};

/// Bound on a single call-completion request.
const CALL_CONTROL_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared state handed to every route.
///
/// Sessions never share mutable state; everything here is either read-only
/// or internally synchronized.
pub struct AppState {
    pub config: ServerConfig,
    pub connector: Arc<dyn AgentConnector>,
    pub call_control: Option<Arc<dyn CallControl>>,
    pub reporter: Arc<CallEndReporter>,
    pub store: Arc<dyn ConversationStore>,
    /// Background report and persistence work, drained on shutdown
    pub tracker: TaskTracker,
}

impl AppState {
    pub fn new(config: ServerConfig) -> anyhow::Result<Arc<Self>> {
        let connector = create_connector(&config)?;

        let call_control: Option<Arc<dyn CallControl>> =
            match (&config.twilio_account_sid, &config.twilio_auth_token) {
                (Some(sid), Some(token)) => Some(Arc::new(TwilioCallControl::new(
                    config.twilio_api_url.clone(),
                    sid.clone(),
                    token.clone(),
                    CALL_CONTROL_TIMEOUT,
                )?)),
                _ => {
                    warn!("Twilio credentials not configured, calls will not be completed on agent close");
                    None
                }
            };

        let reporter = Arc::new(CallEndReporter::from_server_config(&config)?);
        if reporter.is_enabled() {
            info!(
                backup = config.report_backup_url.is_some(),
                "Call-end reporting enabled"
            );
        } else {
            info!("Call-end reporting disabled");
        }

        Ok(Arc::new(Self {
            config,
            connector,
            call_control,
            reporter,
            store: Arc::new(LogConversationStore),
            tracker: TaskTracker::new(),
        }))
    }

    /// Assemble state from already-built parts.
    pub fn from_parts(
        config: ServerConfig,
        connector: Arc<dyn AgentConnector>,
        call_control: Option<Arc<dyn CallControl>>,
        reporter: Arc<CallEndReporter>,
        store: Arc<dyn ConversationStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            connector,
            call_control,
            reporter,
            store,
            tracker: TaskTracker::new(),
        })
    }

    /// Everything a new session needs.
    pub fn session_context(&self) -> SessionContext {
        SessionContext {
            agent_id: self.config.elevenlabs_agent_id.clone(),
            connector: Arc::clone(&self.connector),
            call_control: self.call_control.clone(),
            reporter: Arc::clone(&self.reporter),
            store: Arc::clone(&self.store),
            tracker: self.tracker.clone(),
            pre_active_audio: self.config.pre_active_audio,
            metadata_timeout: self.config.convai_connect_timeout(),
            closing_grace: self.config.closing_grace(),
            external_ref_key: self.config.external_ref_key.clone(),
        }
    }
}
