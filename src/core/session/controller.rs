//! Per-call session controller.
//!
//! One controller task owns a call's two legs. It reacts to whichever of
//! its inputs is ready:
//!
//! - parsed events from the media (Twilio) connection
//! - completion of the agent connection setup
//! - canonical events from the agent (ElevenLabs) connection
//! - the pending deadline (initiation metadata or closing grace)
//!
//! Events from one leg are handled in arrival order; the two legs interleave
//! freely. All state lives in the controller, so sessions share nothing.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::{Session, SessionState};
use crate::config::PreActiveAudioPolicy;
use crate::core::convai::{
    AgentCommand, AgentConnection, AgentConnector, AgentEvent, AudioFrame, ConvAIError,
    ConvAIResult, InitiationMetadata, Utterance,
};
use crate::core::initiation;
use crate::core::persistence::{CallRecord, ConversationStore, UtteranceRecord};
use crate::core::report::{CallEndReporter, CallReport, call_duration_secs};
use crate::core::telephony::{CallControl, MediaStreamEvent, OutboundMediaEvent, StartPayload};

/// Records queued per session so they reach the store in order.
const PERSISTENCE_QUEUE_CAPACITY: usize = 64;

/// Process-wide collaborators a session needs. Cheap to clone.
#[derive(Clone)]
pub struct SessionContext {
    pub agent_id: String,
    pub connector: Arc<dyn AgentConnector>,
    pub call_control: Option<Arc<dyn CallControl>>,
    pub reporter: Arc<CallEndReporter>,
    pub store: Arc<dyn ConversationStore>,
    /// Tracks detached report and persistence work for shutdown drain
    pub tracker: TaskTracker,
    pub pre_active_audio: PreActiveAudioPolicy,
    /// Longest wait for initiation metadata once the agent is connected
    pub metadata_timeout: Duration,
    pub closing_grace: Duration,
    pub external_ref_key: String,
}

/// What a finished session looked like.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub session_id: Uuid,
    pub final_state: SessionState,
    pub transitions: Vec<SessionState>,
    pub conversation_id: Option<String>,
    /// Report dispatched at CLOSED; `None` for failed sessions
    pub report: Option<CallReport>,
}

enum Input {
    Media(Option<MediaStreamEvent>),
    Connected(ConvAIResult<AgentConnection>),
    Agent(Option<AgentEvent>),
    DeadlineExpired,
    Idle,
}

enum PersistenceItem {
    Utterance(UtteranceRecord),
    Call(CallRecord),
}

pub struct SessionController {
    ctx: SessionContext,
    session: Session,
    media_in: mpsc::Receiver<MediaStreamEvent>,
    media_out: mpsc::Sender<OutboundMediaEvent>,
    media_open: bool,
    connecting: Option<JoinHandle<ConvAIResult<AgentConnection>>>,
    agent: Option<AgentConnection>,
    agent_closed: bool,
    custom_parameters: HashMap<String, String>,
    pending_audio: VecDeque<AudioFrame>,
    dropped_frames: u64,
    /// Armed in `AWAIT_METADATA` and `CLOSING`
    deadline: Option<Instant>,
    persistence: Option<mpsc::Sender<PersistenceItem>>,
    report: Option<CallReport>,
}

impl SessionController {
    /// `media_in` yields parsed media events and ends when the media socket
    /// closes. `media_out` feeds the media socket writer.
    pub fn new(
        ctx: SessionContext,
        media_in: mpsc::Receiver<MediaStreamEvent>,
        media_out: mpsc::Sender<OutboundMediaEvent>,
    ) -> Self {
        Self {
            ctx,
            session: Session::new(),
            media_in,
            media_out,
            media_open: true,
            connecting: None,
            agent: None,
            agent_closed: false,
            custom_parameters: HashMap::new(),
            pending_audio: VecDeque::new(),
            dropped_frames: 0,
            deadline: None,
            persistence: None,
            report: None,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session.id()
    }

    /// Drive the session until it is CLOSED or FAILED.
    pub async fn run(mut self) -> SessionOutcome {
        debug!(session_id = %self.session.id(), "Session awaiting stream start");

        while !self.session.state().is_terminal() {
            let input = tokio::select! {
                event = self.media_in.recv(), if self.media_open => Input::Media(event),
                result = join_connect(&mut self.connecting), if self.connecting.is_some() => {
                    Input::Connected(result)
                }
                event = recv_agent(&mut self.agent), if self.agent.is_some() && !self.agent_closed => {
                    Input::Agent(event)
                }
                _ = sleep_until_deadline(self.deadline), if self.deadline.is_some() => {
                    Input::DeadlineExpired
                }
                else => Input::Idle,
            };

            self.handle(input).await;
        }

        self.finish()
    }

    async fn handle(&mut self, input: Input) {
        match input {
            Input::Media(Some(event)) => self.on_media_event(event).await,
            Input::Media(None) => self.on_media_closed().await,
            Input::Connected(result) => {
                self.connecting = None;
                self.on_connected(result).await;
            }
            Input::Agent(Some(event)) => self.on_agent_event(event).await,
            Input::Agent(None) => self.on_agent_closed().await,
            Input::DeadlineExpired => self.on_deadline_expired().await,
            Input::Idle => self.on_idle().await,
        }
    }

    // =========================================================================
    // Media leg
    // =========================================================================

    async fn on_media_event(&mut self, event: MediaStreamEvent) {
        match event {
            MediaStreamEvent::Start { start } => self.on_start(start),
            MediaStreamEvent::Media { media } => self.on_caller_audio(AudioFrame::new(media.payload)),
            MediaStreamEvent::Stop { .. } => self.on_stop().await,
            MediaStreamEvent::Unknown => {
                debug!(session_id = %self.session.id(), "Ignoring unknown media stream event");
            }
            other => {
                debug!(
                    session_id = %self.session.id(),
                    event = other.name(),
                    "Media stream event"
                );
            }
        }
    }

    fn on_start(&mut self, start: StartPayload) {
        if self.session.state() != SessionState::AwaitStart {
            warn!(
                session_id = %self.session.id(),
                stream_sid = %start.stream_sid,
                "Ignoring duplicate start event"
            );
            return;
        }

        info!(
            session_id = %self.session.id(),
            stream_sid = %start.stream_sid,
            call_sid = %start.call_sid,
            "Media stream started"
        );
        self.session.stream_sid = Some(start.stream_sid);
        self.session.call_sid = Some(start.call_sid);
        self.session.started_at = Some(Instant::now());
        self.custom_parameters = start.custom_parameters;

        if !self.advance(SessionState::AiConnecting) {
            return;
        }

        let connector = Arc::clone(&self.ctx.connector);
        let agent_id = self.ctx.agent_id.clone();
        debug!(
            session_id = %self.session.id(),
            provider = connector.provider_name(),
            "Connecting to agent"
        );
        self.connecting = Some(tokio::spawn(
            async move { connector.connect(&agent_id).await },
        ));
    }

    fn on_caller_audio(&mut self, frame: AudioFrame) {
        if let Some(agent) = self.agent.as_ref().filter(|a| a.is_open()) {
            trace!("Forwarding caller audio");
            agent.send_user_audio(frame);
            return;
        }

        let state = self.session.state();
        if !state.is_pre_open() {
            self.dropped_frames += 1;
            trace!(state = %state, "Dropping caller audio, agent connection not open");
            return;
        }

        match self.ctx.pre_active_audio {
            PreActiveAudioPolicy::Drop => {
                self.dropped_frames += 1;
                trace!("Dropping caller audio received before agent connection opened");
            }
            PreActiveAudioPolicy::Buffer { max_frames } => {
                if self.pending_audio.len() >= max_frames && self.pending_audio.pop_front().is_some()
                {
                    self.dropped_frames += 1;
                }
                self.pending_audio.push_back(frame);
            }
        }
    }

    async fn on_stop(&mut self) {
        info!(session_id = %self.session.id(), "Media stream stop received");
        match self.session.state() {
            SessionState::Active => self.begin_closing("media stream stopped").await,
            SessionState::Closing | SessionState::Closed | SessionState::Failed => {}
            _ => {
                self.fail("media stream stopped before the session was active")
                    .await
            }
        }
    }

    async fn on_media_closed(&mut self) {
        self.media_open = false;
        debug!(session_id = %self.session.id(), "Media connection closed");
        match self.session.state() {
            SessionState::Active => self.begin_closing("media connection closed").await,
            SessionState::Closing => self.try_finish_closing(),
            SessionState::Closed | SessionState::Failed => {}
            _ => {
                self.fail("media connection closed before the session was active")
                    .await
            }
        }
    }

    /// Send to the media leg, stamped with the session's stream id.
    async fn forward_to_media(&mut self, make: impl FnOnce(String) -> OutboundMediaEvent) {
        let Some(stream_sid) = self.session.stream_sid.clone() else {
            debug!("Dropping outbound media event, no stream id yet");
            return;
        };
        if self.media_out.send(make(stream_sid)).await.is_err() {
            debug!(session_id = %self.session.id(), "Media writer gone, dropping outbound event");
        }
    }

    // =========================================================================
    // Agent leg
    // =========================================================================

    async fn on_connected(&mut self, result: ConvAIResult<AgentConnection>) {
        let mut connection = match result {
            Ok(connection) => connection,
            Err(e) => {
                error!(session_id = %self.session.id(), "Agent connection setup failed: {}", e);
                self.fail("agent connection setup failed").await;
                return;
            }
        };

        if self.session.state() != SessionState::AiConnecting {
            connection.close().await;
            return;
        }

        if let (Some(call_control), Some(call_sid)) =
            (self.ctx.call_control.as_ref(), self.session.call_sid.as_ref())
        {
            connection.bind_call(
                call_sid.clone(),
                Arc::clone(call_control),
                self.ctx.tracker.clone(),
            );
        }
        self.agent = Some(connection);
        self.agent_closed = false;

        if !self.advance(SessionState::AwaitMetadata) {
            return;
        }
        self.deadline = Some(Instant::now() + self.ctx.metadata_timeout);

        if let Some(agent) = self.agent.as_ref() {
            if !self.pending_audio.is_empty() {
                debug!(frames = self.pending_audio.len(), "Flushing buffered caller audio");
            }
            for frame in self.pending_audio.drain(..) {
                agent.send_user_audio(frame);
            }
        }
    }

    async fn on_agent_event(&mut self, event: AgentEvent) {
        match event {
            AgentEvent::InitiationMetadata(metadata) => self.on_initiation_metadata(metadata).await,
            AgentEvent::Audio(frame) => {
                trace!("Forwarding agent audio");
                self.forward_to_media(|sid| OutboundMediaEvent::media(sid, frame.payload))
                    .await;
            }
            AgentEvent::Interruption => {
                debug!(session_id = %self.session.id(), "Agent interrupted, clearing playback");
                self.forward_to_media(|sid| OutboundMediaEvent::clear(sid)).await;
            }
            AgentEvent::Ping { event_id } => {
                if let Some(agent) = self.agent.as_ref() {
                    if let Err(e) = agent.send(AgentCommand::Pong { event_id }).await {
                        debug!("Failed to answer ping: {}", e);
                    }
                }
            }
            AgentEvent::Utterance(utterance) => self.record_utterance(utterance),
        }
    }

    async fn on_initiation_metadata(&mut self, metadata: InitiationMetadata) {
        if self.session.state() != SessionState::AwaitMetadata {
            warn!(
                session_id = %self.session.id(),
                state = %self.session.state(),
                conversation_id = %metadata.conversation_id,
                "Ignoring unexpected initiation metadata"
            );
            return;
        }

        let resolved = initiation::resolve(&self.custom_parameters, &self.ctx.external_ref_key);
        info!(
            session_id = %self.session.id(),
            conversation_id = %metadata.conversation_id,
            mode = %resolved.mode,
            external_ref_id = resolved.external_ref_id.as_deref().unwrap_or("-"),
            "Agent conversation started"
        );

        let message = resolved.message.clone();
        self.session.initiation = Some(resolved);

        let sent = match self.agent.as_ref() {
            Some(agent) => agent.send(AgentCommand::Initiate(message)).await,
            None => Err(ConvAIError::NotConnected),
        };
        if let Err(e) = sent {
            warn!(session_id = %self.session.id(), "Failed to send initiation: {}", e);
            self.fail("agent connection lost during initiation").await;
            return;
        }

        self.session.set_conversation_id(metadata.conversation_id);
        self.deadline = None;
        self.advance(SessionState::Active);
    }

    async fn on_agent_closed(&mut self) {
        self.agent_closed = true;
        info!(session_id = %self.session.id(), "Agent connection closed");
        match self.session.state() {
            SessionState::Active => self.begin_closing("agent connection closed").await,
            SessionState::Closing => self.try_finish_closing(),
            SessionState::Closed | SessionState::Failed => {}
            _ => {
                self.fail("agent connection closed before the session was active")
                    .await
            }
        }
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    async fn begin_closing(&mut self, reason: &str) {
        if !self.advance(SessionState::Closing) {
            return;
        }
        info!(session_id = %self.session.id(), reason, "Session closing");
        let now = Instant::now();
        self.session.closing_at = Some(now);
        self.deadline = Some(now + self.ctx.closing_grace);

        if let Some(agent) = self.agent.as_mut() {
            agent.close().await;
        }
        self.try_finish_closing();
    }

    fn try_finish_closing(&mut self) {
        let agent_done = self.agent_closed || self.agent.is_none();
        if self.session.state() == SessionState::Closing && !self.media_open && agent_done {
            self.finish_closed("both connections closed");
        }
    }

    async fn on_deadline_expired(&mut self) {
        self.deadline = None;
        match self.session.state() {
            SessionState::AwaitMetadata => {
                warn!(
                    session_id = %self.session.id(),
                    timeout_ms = self.ctx.metadata_timeout.as_millis() as u64,
                    "Agent sent no initiation metadata"
                );
                self.fail("initiation metadata not received").await;
            }
            SessionState::Closing => {
                warn!(
                    session_id = %self.session.id(),
                    media_open = self.media_open,
                    agent_open = !self.agent_closed,
                    "Closing grace period elapsed, forcing close"
                );
                self.finish_closed("closing grace period elapsed");
            }
            _ => {}
        }
    }

    async fn on_idle(&mut self) {
        match self.session.state() {
            SessionState::Active => self.begin_closing("no connection left to read").await,
            SessionState::Closing => self.finish_closed("no connection left to read"),
            state if state.can_transition_to(SessionState::Failed) => {
                self.fail("no connection left to read").await
            }
            _ => {}
        }
    }

    fn finish_closed(&mut self, reason: &str) {
        if !self.advance(SessionState::Closed) {
            return;
        }
        self.deadline = None;

        let ended = self.session.closing_at.unwrap_or_else(Instant::now);
        let duration_secs = self
            .session
            .started_at
            .map(|started| call_duration_secs(started, ended))
            .unwrap_or(0);

        let report = CallReport {
            stream_sid: self.session.stream_sid.clone().unwrap_or_default(),
            call_sid: self.session.call_sid.clone().unwrap_or_default(),
            external_ref_id: self.session.external_ref_id().map(str::to_string),
            conversation_id: self.session.conversation_id().map(str::to_string),
            duration_secs,
            dynamic_variables: self
                .session
                .initiation
                .as_ref()
                .map(|i| i.dynamic_variables())
                .unwrap_or_default(),
        };

        info!(
            session_id = %self.session.id(),
            call_sid = %report.call_sid,
            conversation_id = report.conversation_id.as_deref().unwrap_or("-"),
            duration_secs,
            dropped_frames = self.dropped_frames,
            reason,
            "Session closed"
        );

        if self.report.is_none() {
            self.ctx.reporter.dispatch(&self.ctx.tracker, report.clone());
            self.persist(PersistenceItem::Call(CallRecord {
                stream_sid: report.stream_sid.clone(),
                call_sid: report.call_sid.clone(),
                external_ref_id: report.external_ref_id.clone(),
                agent_id: self.ctx.agent_id.clone(),
                conversation_id: report.conversation_id.clone(),
                duration_secs,
            }));
            self.report = Some(report);
        }
    }

    async fn fail(&mut self, reason: &str) {
        if !self.advance(SessionState::Failed) {
            return;
        }
        warn!(session_id = %self.session.id(), reason, "Session failed");
        self.deadline = None;

        if let Some(handle) = self.connecting.take() {
            handle.abort();
        }
        if let Some(agent) = self.agent.as_mut() {
            agent.close().await;
        }
        self.pending_audio.clear();
    }

    fn finish(mut self) -> SessionOutcome {
        if let Some(handle) = self.connecting.take() {
            handle.abort();
        }
        SessionOutcome {
            session_id: self.session.id(),
            final_state: self.session.state(),
            transitions: self.session.transitions().to_vec(),
            conversation_id: self.session.conversation_id().map(str::to_string),
            report: self.report.take(),
        }
    }

    fn advance(&mut self, next: SessionState) -> bool {
        match self.session.transition(next) {
            Ok(()) => true,
            Err(e) => {
                error!(session_id = %self.session.id(), "{}", e);
                false
            }
        }
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    fn record_utterance(&mut self, utterance: Utterance) {
        let record = UtteranceRecord {
            role: utterance.role,
            text: utterance.text,
            call_sid: self.session.call_sid.clone().unwrap_or_default(),
            external_ref_id: self.session.external_ref_id().map(str::to_string),
            conversation_id: self.session.conversation_id().map(str::to_string),
        };
        self.persist(PersistenceItem::Utterance(record));
    }

    /// Queue a record for this session's writer task, starting it on first use.
    fn persist(&mut self, item: PersistenceItem) {
        let sender = self.persistence.get_or_insert_with(|| {
            let (tx, mut rx) = mpsc::channel::<PersistenceItem>(PERSISTENCE_QUEUE_CAPACITY);
            let store = Arc::clone(&self.ctx.store);
            self.ctx.tracker.spawn(async move {
                while let Some(item) = rx.recv().await {
                    let result = match item {
                        PersistenceItem::Utterance(record) => store.record_utterance(record).await,
                        PersistenceItem::Call(record) => store.record_call(record).await,
                    };
                    if let Err(e) = result {
                        warn!("Failed to persist conversation record: {}", e);
                    }
                }
            });
            tx
        });

        if sender.try_send(item).is_err() {
            warn!(session_id = %self.session.id(), "Persistence queue full, dropping record");
        }
    }
}

async fn join_connect(
    handle: &mut Option<JoinHandle<ConvAIResult<AgentConnection>>>,
) -> ConvAIResult<AgentConnection> {
    match handle.as_mut() {
        Some(handle) => match handle.await {
            Ok(result) => result,
            Err(e) => Err(ConvAIError::SetupFailed(format!("Connect task failed: {e}"))),
        },
        None => std::future::pending().await,
    }
}

async fn recv_agent(agent: &mut Option<AgentConnection>) -> Option<AgentEvent> {
    match agent.as_mut() {
        Some(agent) => agent.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::convai::UtteranceRole;
    use crate::core::persistence::{MemoryConversationStore, PersistenceError, PersistenceResult};
    use crate::core::report::ErrorLog;
    use crate::core::telephony::CallControlResult;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    struct FakeAgent {
        commands: mpsc::Receiver<AgentCommand>,
        events: Option<mpsc::Sender<AgentEvent>>,
        open: Arc<AtomicBool>,
    }

    impl FakeAgent {
        async fn next_command(&mut self) -> AgentCommand {
            timeout(WAIT, self.commands.recv())
                .await
                .expect("timed out waiting for agent command")
                .expect("command channel closed")
        }

        async fn emit(&self, event: AgentEvent) {
            self.events
                .as_ref()
                .expect("agent already closed")
                .send(event)
                .await
                .unwrap();
        }

        fn close(&mut self) {
            self.open.store(false, Ordering::SeqCst);
            self.events = None;
        }
    }

    fn fake_connection() -> (AgentConnection, FakeAgent) {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (ev_tx, ev_rx) = mpsc::channel(32);
        let open = Arc::new(AtomicBool::new(true));
        (
            AgentConnection::new(cmd_tx, ev_rx, open.clone(), None),
            FakeAgent {
                commands: cmd_rx,
                events: Some(ev_tx),
                open,
            },
        )
    }

    struct FakeConnector {
        connection: Mutex<Option<AgentConnection>>,
        gate: Option<Arc<Notify>>,
    }

    impl FakeConnector {
        fn ready() -> (Arc<Self>, FakeAgent) {
            let (connection, agent) = fake_connection();
            let connector = Arc::new(Self {
                connection: Mutex::new(Some(connection)),
                gate: None,
            });
            (connector, agent)
        }

        fn gated() -> (Arc<Self>, FakeAgent, Arc<Notify>) {
            let (connection, agent) = fake_connection();
            let gate = Arc::new(Notify::new());
            let connector = Arc::new(Self {
                connection: Mutex::new(Some(connection)),
                gate: Some(gate.clone()),
            });
            (connector, agent, gate)
        }

        fn refusing() -> Arc<Self> {
            Arc::new(Self {
                connection: Mutex::new(None),
                gate: None,
            })
        }
    }

    #[async_trait]
    impl AgentConnector for FakeConnector {
        async fn connect(&self, _agent_id: &str) -> ConvAIResult<AgentConnection> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.connection
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| ConvAIError::SetupFailed("refused".to_string()))
        }

        fn provider_name(&self) -> &'static str {
            "fake"
        }
    }

    #[derive(Default)]
    struct CountingCallControl {
        completed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CallControl for CountingCallControl {
        async fn complete_call(&self, call_sid: &str) -> CallControlResult<()> {
            self.completed.lock().unwrap().push(call_sid.to_string());
            Ok(())
        }
    }

    struct Harness {
        media_tx: Option<mpsc::Sender<MediaStreamEvent>>,
        media_rx: mpsc::Receiver<OutboundMediaEvent>,
        handle: JoinHandle<SessionOutcome>,
        tracker: TaskTracker,
        store: Arc<MemoryConversationStore>,
        call_control: Arc<CountingCallControl>,
    }

    impl Harness {
        async fn send(&self, json: &str) {
            let event = MediaStreamEvent::parse(json).unwrap();
            self.media_tx.as_ref().unwrap().send(event).await.unwrap();
        }

        async fn start(&self) {
            self.send(
                r#"{"event":"start","start":{"streamSid":"MZ1","callSid":"CA1","customParameters":{"external_ref_id":"ref-7"}}}"#,
            )
            .await;
        }

        async fn media(&self, payload: &str) {
            self.send(&format!(
                r#"{{"event":"media","media":{{"payload":"{payload}"}}}}"#
            ))
            .await;
        }

        async fn stop(&self) {
            self.send(r#"{"event":"stop"}"#).await;
        }

        async fn next_outbound(&mut self) -> OutboundMediaEvent {
            timeout(WAIT, self.media_rx.recv())
                .await
                .expect("timed out waiting for outbound media")
                .expect("media channel closed")
        }

        fn close_media(&mut self) {
            self.media_tx = None;
        }

        async fn outcome(self) -> (SessionOutcome, TaskTracker, Arc<MemoryConversationStore>, Arc<CountingCallControl>) {
            let outcome = timeout(WAIT, self.handle)
                .await
                .expect("session did not finish")
                .unwrap();
            self.tracker.close();
            timeout(WAIT, self.tracker.wait()).await.unwrap();
            (outcome, self.tracker, self.store, self.call_control)
        }
    }

    fn disabled_reporter() -> Arc<CallEndReporter> {
        Arc::new(
            CallEndReporter::new(
                None,
                None,
                Duration::from_secs(1),
                ErrorLog::new(std::env::temp_dir().join("phone-bridge-unused.txt")),
            )
            .unwrap(),
        )
    }

    struct FailingStore;

    #[async_trait]
    impl ConversationStore for FailingStore {
        async fn record_utterance(&self, _record: UtteranceRecord) -> PersistenceResult<()> {
            Err(PersistenceError::Storage("database unavailable".to_string()))
        }

        async fn record_call(&self, _record: CallRecord) -> PersistenceResult<()> {
            Err(PersistenceError::Storage("database unavailable".to_string()))
        }
    }

    fn test_context(
        connector: Arc<FakeConnector>,
        policy: PreActiveAudioPolicy,
        reporter: Arc<CallEndReporter>,
        closing_grace: Duration,
    ) -> SessionContext {
        SessionContext {
            agent_id: "agent_test".to_string(),
            connector,
            call_control: None,
            reporter,
            store: Arc::new(MemoryConversationStore::new()),
            tracker: TaskTracker::new(),
            pre_active_audio: policy,
            metadata_timeout: WAIT,
            closing_grace,
            external_ref_key: "external_ref_id".to_string(),
        }
    }

    /// Spawn a controller whose call control and store are observable.
    fn spawn_with(mut ctx: SessionContext, store: Option<Arc<dyn ConversationStore>>) -> Harness {
        let memory = Arc::new(MemoryConversationStore::new());
        let call_control = Arc::new(CountingCallControl::default());
        ctx.call_control = Some(call_control.clone());
        ctx.store = store.unwrap_or_else(|| memory.clone());
        let tracker = ctx.tracker.clone();

        let (media_tx, media_in) = mpsc::channel(32);
        let (media_out, media_rx) = mpsc::channel(32);
        let handle = tokio::spawn(SessionController::new(ctx, media_in, media_out).run());

        Harness {
            media_tx: Some(media_tx),
            media_rx,
            handle,
            tracker,
            store: memory,
            call_control,
        }
    }

    fn spawn_session(
        connector: Arc<FakeConnector>,
        policy: PreActiveAudioPolicy,
        reporter: Arc<CallEndReporter>,
        closing_grace: Duration,
    ) -> Harness {
        spawn_with(test_context(connector, policy, reporter, closing_grace), None)
    }

    fn metadata(conversation_id: &str) -> AgentEvent {
        AgentEvent::InitiationMetadata(InitiationMetadata {
            conversation_id: conversation_id.to_string(),
            agent_output_audio_format: None,
            user_input_audio_format: None,
        })
    }

    /// Drive a session to ACTIVE and return it with its fake agent.
    async fn active_session(reporter: Arc<CallEndReporter>) -> (Harness, FakeAgent) {
        let (connector, mut agent) = FakeConnector::ready();
        let harness = spawn_session(
            connector,
            PreActiveAudioPolicy::Drop,
            reporter,
            Duration::from_secs(5),
        );
        harness.start().await;
        agent.emit(metadata("conv_1")).await;
        assert!(matches!(agent.next_command().await, AgentCommand::Initiate(_)));
        (harness, agent)
    }

    const HAPPY_PATH: [SessionState; 6] = [
        SessionState::AwaitStart,
        SessionState::AiConnecting,
        SessionState::AwaitMetadata,
        SessionState::Active,
        SessionState::Closing,
        SessionState::Closed,
    ];

    #[tokio::test]
    async fn test_happy_path_state_sequence() {
        let (mut harness, mut agent) = active_session(disabled_reporter()).await;

        harness.media("AAAA").await;
        match agent.next_command().await {
            AgentCommand::UserAudio(frame) => assert_eq!(frame.payload, "AAAA"),
            other => panic!("Unexpected command: {:?}", other),
        }

        agent.emit(AgentEvent::Audio(AudioFrame::new("BBBB"))).await;
        assert_eq!(
            harness.next_outbound().await,
            OutboundMediaEvent::media("MZ1", "BBBB")
        );

        harness.stop().await;
        assert!(matches!(agent.next_command().await, AgentCommand::Close));
        agent.close();
        harness.close_media();

        let (outcome, _, store, call_control) = harness.outcome().await;
        assert_eq!(outcome.transitions, HAPPY_PATH.to_vec());
        assert_eq!(outcome.final_state, SessionState::Closed);
        assert_eq!(outcome.conversation_id.as_deref(), Some("conv_1"));

        let report = outcome.report.unwrap();
        assert_eq!(report.stream_sid, "MZ1");
        assert_eq!(report.call_sid, "CA1");
        assert_eq!(report.external_ref_id.as_deref(), Some("ref-7"));
        assert_eq!(report.conversation_id.as_deref(), Some("conv_1"));

        let calls = store.calls().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].agent_id, "agent_test");
        assert_eq!(*call_control.completed.lock().unwrap(), vec!["CA1".to_string()]);
    }

    #[tokio::test]
    async fn test_initiation_uses_legacy_fallback() {
        let (connector, mut agent) = FakeConnector::ready();
        let harness = spawn_session(
            connector,
            PreActiveAudioPolicy::Drop,
            disabled_reporter(),
            Duration::from_secs(5),
        );
        harness.start().await;
        agent.emit(metadata("conv_1")).await;

        match agent.next_command().await {
            AgentCommand::Initiate(message) => {
                let agent_override = &message.conversation_config_override["agent"];
                assert_eq!(agent_override["prompt"]["prompt"], initiation::FALLBACK_PROMPT);
                assert_eq!(
                    agent_override["first_message"],
                    initiation::FALLBACK_FIRST_MESSAGE
                );
            }
            other => panic!("Unexpected command: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_pre_open_audio_dropped_then_forwarded() {
        let (connector, mut agent, gate) = FakeConnector::gated();
        let harness = spawn_session(
            connector,
            PreActiveAudioPolicy::Drop,
            disabled_reporter(),
            Duration::from_secs(5),
        );

        harness.start().await;
        harness.media("AAAA").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        gate.notify_one();

        agent.emit(metadata("conv_1")).await;
        assert!(matches!(agent.next_command().await, AgentCommand::Initiate(_)));

        harness.media("AAAA").await;
        match agent.next_command().await {
            AgentCommand::UserAudio(frame) => assert_eq!(frame.payload, "AAAA"),
            other => panic!("Unexpected command: {:?}", other),
        }

        // Nothing else was queued before the close
        harness.stop().await;
        assert!(matches!(agent.next_command().await, AgentCommand::Close));
    }

    #[tokio::test]
    async fn test_buffer_policy_flushes_on_open() {
        let (connector, mut agent, gate) = FakeConnector::gated();
        let harness = spawn_session(
            connector,
            PreActiveAudioPolicy::Buffer { max_frames: 2 },
            disabled_reporter(),
            Duration::from_secs(5),
        );

        harness.start().await;
        harness.media("one").await;
        harness.media("two").await;
        harness.media("three").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        gate.notify_one();

        for expected in ["two", "three"] {
            match agent.next_command().await {
                AgentCommand::UserAudio(frame) => assert_eq!(frame.payload, expected),
                other => panic!("Unexpected command: {:?}", other),
            }
        }

        agent.emit(metadata("conv_1")).await;
        assert!(matches!(agent.next_command().await, AgentCommand::Initiate(_)));
    }

    #[tokio::test]
    async fn test_connect_failure_fails_session() {
        let harness = spawn_session(
            FakeConnector::refusing(),
            PreActiveAudioPolicy::Drop,
            disabled_reporter(),
            Duration::from_secs(5),
        );
        harness.start().await;

        let (outcome, _, store, call_control) = harness.outcome().await;
        assert_eq!(
            outcome.transitions,
            vec![
                SessionState::AwaitStart,
                SessionState::AiConnecting,
                SessionState::Failed
            ]
        );
        assert!(outcome.report.is_none());
        assert!(store.calls().await.is_empty());
        assert!(call_control.completed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_media_close_before_start_fails() {
        let (connector, _agent) = FakeConnector::ready();
        let mut harness = spawn_session(
            connector,
            PreActiveAudioPolicy::Drop,
            disabled_reporter(),
            Duration::from_secs(5),
        );
        harness.close_media();

        let (outcome, ..) = harness.outcome().await;
        assert_eq!(
            outcome.transitions,
            vec![SessionState::AwaitStart, SessionState::Failed]
        );
    }

    #[tokio::test]
    async fn test_agent_close_before_metadata_fails() {
        let (connector, mut agent) = FakeConnector::ready();
        let harness = spawn_session(
            connector,
            PreActiveAudioPolicy::Drop,
            disabled_reporter(),
            Duration::from_secs(5),
        );
        harness.start().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        agent.close();

        let (outcome, ..) = harness.outcome().await;
        assert_eq!(outcome.final_state, SessionState::Failed);
        assert!(!outcome.transitions.contains(&SessionState::Active));
        assert!(outcome.report.is_none());
    }

    #[tokio::test]
    async fn test_stop_and_agent_close_report_once() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/report"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let reporter = Arc::new(
            CallEndReporter::new(
                Some(format!("{}/report", server.uri())),
                None,
                Duration::from_secs(2),
                ErrorLog::new(std::env::temp_dir().join("phone-bridge-unused.txt")),
            )
            .unwrap(),
        );

        let (mut harness, mut agent) = active_session(reporter).await;

        agent.close();
        harness.stop().await;
        harness.close_media();

        let (outcome, _, store, call_control) = harness.outcome().await;
        assert_eq!(outcome.transitions, HAPPY_PATH.to_vec());
        assert!(outcome.report.is_some());
        assert_eq!(store.calls().await.len(), 1);
        assert_eq!(call_control.completed.lock().unwrap().len(), 1);

        server.verify().await;
    }

    #[tokio::test]
    async fn test_interruption_clears_and_utterances_recorded() {
        let (mut harness, mut agent) = active_session(disabled_reporter()).await;

        agent.emit(AgentEvent::Interruption).await;
        assert_eq!(harness.next_outbound().await, OutboundMediaEvent::clear("MZ1"));

        agent
            .emit(AgentEvent::Utterance(Utterance {
                role: UtteranceRole::Agent,
                text: "Hello, how can I help?".to_string(),
            }))
            .await;
        agent
            .emit(AgentEvent::Utterance(Utterance {
                role: UtteranceRole::User,
                text: "I need a phone".to_string(),
            }))
            .await;

        agent.close();
        harness.close_media();

        let (outcome, _, store, _) = harness.outcome().await;
        assert_eq!(outcome.final_state, SessionState::Closed);

        let utterances = store.utterances().await;
        assert_eq!(utterances.len(), 2);
        assert_eq!(utterances[0].role, UtteranceRole::Agent);
        assert_eq!(utterances[1].text, "I need a phone");
        assert_eq!(utterances[1].external_ref_id.as_deref(), Some("ref-7"));
        assert_eq!(utterances[1].conversation_id.as_deref(), Some("conv_1"));
        assert_eq!(store.calls().await.len(), 1);
    }

    #[tokio::test]
    async fn test_grace_expiry_forces_closed() {
        let (connector, mut agent) = FakeConnector::ready();
        let mut harness = spawn_session(
            connector,
            PreActiveAudioPolicy::Drop,
            disabled_reporter(),
            Duration::from_millis(100),
        );
        harness.start().await;
        agent.emit(metadata("conv_1")).await;
        assert!(matches!(agent.next_command().await, AgentCommand::Initiate(_)));

        harness.stop().await;
        assert!(matches!(agent.next_command().await, AgentCommand::Close));
        // Agent never acknowledges the close
        harness.close_media();

        let (outcome, ..) = harness.outcome().await;
        assert_eq!(outcome.transitions, HAPPY_PATH.to_vec());
        drop(agent);
    }

    #[tokio::test]
    async fn test_duration_excludes_closing_grace() {
        let (connector, mut agent) = FakeConnector::ready();
        let mut harness = spawn_session(
            connector,
            PreActiveAudioPolicy::Drop,
            disabled_reporter(),
            Duration::from_millis(1_500),
        );
        harness.start().await;
        agent.emit(metadata("conv_1")).await;
        assert!(matches!(agent.next_command().await, AgentCommand::Initiate(_)));

        harness.stop().await;
        assert!(matches!(agent.next_command().await, AgentCommand::Close));
        // Agent stays open, so the session waits out the whole grace period
        harness.close_media();

        let (outcome, _, store, _) = harness.outcome().await;
        assert_eq!(outcome.transitions, HAPPY_PATH.to_vec());
        assert_eq!(outcome.report.unwrap().duration_secs, 0);
        assert_eq!(store.calls().await[0].duration_secs, 0);
        drop(agent);
    }

    #[tokio::test]
    async fn test_missing_metadata_fails_session() {
        let (connector, mut agent) = FakeConnector::ready();
        let mut ctx = test_context(
            connector,
            PreActiveAudioPolicy::Drop,
            disabled_reporter(),
            Duration::from_secs(5),
        );
        ctx.metadata_timeout = Duration::from_millis(200);
        let harness = spawn_with(ctx, None);
        harness.start().await;

        // The agent connects but never sends initiation metadata
        assert!(matches!(agent.next_command().await, AgentCommand::Close));

        let (outcome, _, store, call_control) = harness.outcome().await;
        assert_eq!(
            outcome.transitions,
            vec![
                SessionState::AwaitStart,
                SessionState::AiConnecting,
                SessionState::AwaitMetadata,
                SessionState::Failed
            ]
        );
        assert!(outcome.conversation_id.is_none());
        assert!(outcome.report.is_none());
        assert!(store.calls().await.is_empty());
        // Closing the agent leg hangs up the call
        assert_eq!(*call_control.completed.lock().unwrap(), vec!["CA1".to_string()]);
        drop(agent);
    }

    #[tokio::test]
    async fn test_store_errors_do_not_block_close() {
        let (connector, mut agent) = FakeConnector::ready();
        let ctx = test_context(
            connector,
            PreActiveAudioPolicy::Drop,
            disabled_reporter(),
            Duration::from_secs(5),
        );
        let mut harness = spawn_with(ctx, Some(Arc::new(FailingStore)));
        harness.start().await;
        agent.emit(metadata("conv_1")).await;
        assert!(matches!(agent.next_command().await, AgentCommand::Initiate(_)));

        agent
            .emit(AgentEvent::Utterance(Utterance {
                role: UtteranceRole::User,
                text: "Hello?".to_string(),
            }))
            .await;
        agent.close();
        harness.close_media();

        let (outcome, _, _, call_control) = harness.outcome().await;
        assert_eq!(outcome.transitions, HAPPY_PATH.to_vec());
        assert_eq!(outcome.report.unwrap().conversation_id.as_deref(), Some("conv_1"));
        assert_eq!(*call_control.completed.lock().unwrap(), vec!["CA1".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_and_duplicate_start_are_ignored() {
        let (mut harness, mut agent) = active_session(disabled_reporter()).await;

        harness.send(r#"{"event":"mystery"}"#).await;
        harness
            .send(r#"{"event":"start","start":{"streamSid":"MZ2","callSid":"CA2"}}"#)
            .await;
        harness.media("CCCC").await;

        match agent.next_command().await {
            AgentCommand::UserAudio(frame) => assert_eq!(frame.payload, "CCCC"),
            other => panic!("Unexpected command: {:?}", other),
        }

        agent.emit(AgentEvent::Audio(AudioFrame::new("DDDD"))).await;
        assert_eq!(
            harness.next_outbound().await,
            OutboundMediaEvent::media("MZ1", "DDDD")
        );
    }
}
