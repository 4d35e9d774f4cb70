pub mod convai;
pub mod initiation;
pub mod persistence;
pub mod report;
pub mod session;
pub mod telephony;

// Re-export commonly used types for convenience
pub use convai::{
    AgentCommand, AgentConnection, AgentConnector, AgentEvent, AudioFrame, ConvAIError,
    ConvAIResult, ElevenLabsConnector, create_connector,
};

pub use initiation::{ConfigMode, InitiationMessage, ResolvedInitiation};

pub use persistence::{ConversationStore, LogConversationStore, MemoryConversationStore};

pub use report::{CallEndReporter, CallReport, ErrorLog, ReportError};

pub use session::{SessionContext, SessionController, SessionOutcome, SessionState};

pub use telephony::{
    CallControl, MediaStreamEvent, OutboundMediaEvent, TwilioCallControl,
};
