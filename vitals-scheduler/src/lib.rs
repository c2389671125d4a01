//! Scheduling and throttling for background conversation analysis.
//!
//! All bookkeeping lives in one [`ThrottleState`]. The [`Scheduler`] owns it
//! behind a single lock, so every enqueue, admission check, promotion,
//! completion and cancellation observes and leaves a consistent state.

mod config;
mod error;
mod gatekeeper;
mod rate_window;
mod runtime;
mod state;
mod types;

pub use config::ThrottleLimits;
pub use error::{Result, SchedulerError};
pub use gatekeeper::{Decision, Denial, DenyReason, can_run};
pub use rate_window::RateWindow;
pub use runtime::{PromotionReceiver, Scheduler};
pub use state::{
    CancelReport, ConversationLoad, DrainStep, EnqueueReceipt, SchedulerSnapshot, ThrottleState,
};
pub use types::{AnalysisJob, ConversationId, JobId, JobType, MANUAL_PRIORITY, PatientId};
