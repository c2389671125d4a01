use crate::error::Result;
use crate::types::{AnalysisRequest, AnalysisResult};
use async_trait::async_trait;

#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Run one capability against a conversation.
    ///
    /// A transport failure is an `Err`. A service that answered but could not
    /// analyze returns `Ok` with `success == false`; callers treat both as a
    /// failed sub-job.
    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisResult>;
}
