//! Engine configuration loader.
//!
//! Every setting has a built-in default, so a config file is optional.

use crate::stages::default_stage_labels;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use vitals_analysis::HttpAnalyzerConfig;
use vitals_scheduler::ThrottleLimits;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub scheduler: ThrottleLimits,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub analysis: AnalysisServiceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// A regular analysis is due every N messages.
    #[serde(default = "default_regular_interval")]
    pub regular_interval: u32,
    /// A deep analysis is due every N messages; wins over regular.
    #[serde(default = "default_deep_interval")]
    pub deep_interval: u32,
    #[serde(default = "default_deep_stage_duration_ms")]
    pub deep_stage_duration_ms: u64,
    #[serde(default = "default_stage_labels")]
    pub stage_labels: Vec<String>,
    /// Messages sent to the diagnosis and solution capabilities.
    #[serde(default = "default_recent_message_window")]
    pub recent_message_window: usize,
}

fn default_regular_interval() -> u32 {
    1
}

fn default_deep_interval() -> u32 {
    6
}

fn default_deep_stage_duration_ms() -> u64 {
    2_500
}

fn default_recent_message_window() -> usize {
    6
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            regular_interval: default_regular_interval(),
            deep_interval: default_deep_interval(),
            deep_stage_duration_ms: default_deep_stage_duration_ms(),
            stage_labels: default_stage_labels(),
            recent_message_window: default_recent_message_window(),
        }
    }
}

impl OrchestratorConfig {
    pub fn deep_stage_duration(&self) -> Duration {
        Duration::from_millis(self.deep_stage_duration_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.regular_interval == 0 {
            return Err(anyhow::anyhow!("orchestrator.regular_interval must be > 0"));
        }
        if self.deep_interval == 0 {
            return Err(anyhow::anyhow!("orchestrator.deep_interval must be > 0"));
        }
        if self.deep_stage_duration_ms == 0 {
            return Err(anyhow::anyhow!(
                "orchestrator.deep_stage_duration_ms must be > 0"
            ));
        }
        if self.stage_labels.iter().all(|label| label.trim().is_empty()) {
            return Err(anyhow::anyhow!(
                "orchestrator.stage_labels must contain at least one label"
            ));
        }
        if self.recent_message_window == 0 {
            return Err(anyhow::anyhow!(
                "orchestrator.recent_message_window must be > 0"
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisServiceConfig {
    /// Analysis service root. Unset means no remote analyzer is configured.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default = "default_analysis_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_analysis_timeout_seconds() -> u64 {
    60
}

impl Default for AnalysisServiceConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            timeout_seconds: default_analysis_timeout_seconds(),
        }
    }
}

impl EngineConfig {
    /// Load from `path`, or from the default path when it exists.
    /// Without a file, built-in defaults apply. Env overrides apply either way.
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = match path {
            Some(path) => Some(path),
            None => {
                let default_path = default_config_path();
                tokio::fs::try_exists(&default_path)
                    .await
                    .unwrap_or(false)
                    .then_some(default_path)
            }
        };

        let mut cfg = match path {
            Some(path) => {
                let contents = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;
                Self::parse(&contents)
                    .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?
            }
            None => Self::default(),
        };

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("VITALS_ANALYSIS_URL") {
            if !v.trim().is_empty() {
                self.analysis.base_url = Some(v);
            }
        }
        if let Ok(v) = std::env::var("VITALS_ANALYSIS_API_KEY") {
            if !v.trim().is_empty() {
                self.analysis.api_key = Some(v);
            }
        }
        if let Ok(v) = std::env::var("VITALS_MAX_CONCURRENT") {
            match v.trim().parse::<usize>() {
                Ok(n) => self.scheduler.max_concurrent = n,
                Err(e) => {
                    tracing::warn!(value = %v, error = %e, "ignoring invalid VITALS_MAX_CONCURRENT");
                }
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.scheduler
            .validate()
            .map_err(|e| anyhow::anyhow!("scheduler: {e}"))?;
        self.orchestrator.validate()?;
        if let Some(url) = self.analysis.base_url.as_deref() {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(anyhow::anyhow!(
                    "analysis.base_url must start with http:// or https://"
                ));
            }
        }
        if self.analysis.timeout_seconds == 0 {
            return Err(anyhow::anyhow!("analysis.timeout_seconds must be > 0"));
        }
        Ok(())
    }

    pub fn http_analyzer_config(&self) -> Option<HttpAnalyzerConfig> {
        let base_url = self
            .analysis
            .base_url
            .clone()
            .filter(|url| !url.trim().is_empty())?;
        Some(HttpAnalyzerConfig {
            base_url,
            api_key: self.analysis.api_key.clone(),
            timeout: Duration::from_secs(self.analysis.timeout_seconds),
        })
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".vitals").join("config.toml")
}
