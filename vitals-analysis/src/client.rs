use crate::error::{AnalysisError, Result};
use crate::traits::Analyzer;
use crate::types::{AnalysisRequest, AnalysisResult};
use async_trait::async_trait;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct HttpAnalyzerConfig {
    /// Service root; capability paths are appended as `/analysis/{capability}`.
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

/// Analyzer backed by a JSON-over-HTTP analysis service.
#[derive(Clone)]
pub struct HttpAnalyzer {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpAnalyzer {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(cfg: HttpAnalyzerConfig) -> Result<Self> {
        let base_url = cfg.base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(AnalysisError::InvalidInput(
                "analysis base_url must not be empty".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Ok(Self {
            base_url,
            api_key: cfg.api_key.filter(|k| !k.trim().is_empty()),
            client,
        })
    }

    pub fn endpoint(&self, request: &AnalysisRequest) -> String {
        format!("{}/analysis/{}", self.base_url, request.capability.as_str())
    }
}

#[async_trait]
impl Analyzer for HttpAnalyzer {
    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(capability = %request.capability, conversation_id = %request.conversation_id)
    )]
    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisResult> {
        if request.conversation_id.trim().is_empty() {
            return Err(AnalysisError::InvalidInput(
                "conversation_id must not be empty".to_string(),
            ));
        }

        let mut builder = self.client.post(self.endpoint(request)).json(request);
        if let Some(key) = self.api_key.as_deref() {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(AnalysisError::Http(format!(
                "analysis {} status={status} body={body}",
                request.capability
            )));
        }

        let parsed: AnalysisResult = serde_json::from_str(&body)?;
        if !parsed.success && parsed.error.is_none() {
            return Err(AnalysisError::Rejected(format!(
                "{} reported failure without an error message",
                request.capability
            )));
        }
        Ok(parsed)
    }
}
