//! Remote analysis capabilities for the Vitals engine.
//!
//! Each capability is one opaque call: diagnosis, solution, memory, or the
//! topic/solution pass over a whole conversation. Nothing here schedules work;
//! callers decide when a call is allowed to run.

mod client;
mod error;
mod traits;
mod types;

pub use client::{HttpAnalyzer, HttpAnalyzerConfig};
pub use error::{AnalysisError, Result};
pub use traits::Analyzer;
pub use types::{
    AnalysisPayload, AnalysisRequest, AnalysisResult, Capability, ConversationMessage,
    DeepContext, HealthDataSummary, Role, recent_window,
};
