//! Analysis orchestration for the Vitals health assistant.
//!
//! Decides which analysis a conversation is due for, hands it to the
//! scheduler, runs the promoted jobs as parallel capability calls, and
//! publishes per-conversation progress.

pub mod config;
pub mod orchestrator;
pub mod report;
pub mod source;
pub mod stages;
pub mod status;

pub use config::{AnalysisServiceConfig, EngineConfig, OrchestratorConfig};
pub use orchestrator::{AnalysisOrchestrator, CompletionCallback, ManualTrigger};
pub use report::{AnalysisRunReport, SubJobOutcome, SubJobStatus};
pub use source::{ConversationSnapshot, ConversationSource, InMemoryConversations};
pub use status::{ActiveAnalysis, ConversationAnalysisState};
