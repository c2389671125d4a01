//! Staged progress labels for deep analysis.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub fn default_stage_labels() -> Vec<String> {
    [
        "Analyzing Data",
        "Checking Symptoms",
        "Relating Data",
        "Reviewing Patterns",
        "Finalizing Insights",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

/// Stage shown after `tick` stage durations. Freezes on the last stage.
pub fn stage_index(tick: usize, stage_count: usize) -> usize {
    tick.min(stage_count.saturating_sub(1))
}

/// Advances through the labels on a timer until stopped or dropped.
pub struct StageAnimator {
    cancel: CancellationToken,
}

impl StageAnimator {
    /// `on_stage` is called from the animator task, never from `start` itself.
    pub fn start<F>(labels: Vec<String>, stage_duration: Duration, on_stage: F) -> Self
    where
        F: Fn(usize, &str) + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move {
            let labels = labels
                .into_iter()
                .filter(|label| !label.trim().is_empty())
                .collect::<Vec<_>>();
            if labels.is_empty() {
                return;
            }
            let mut tick = 0_usize;
            loop {
                let index = stage_index(tick, labels.len());
                on_stage(index, &labels[index]);
                if index + 1 == labels.len() {
                    break;
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(stage_duration) => {}
                }
                tick += 1;
            }
        });
        Self { cancel }
    }

    pub fn stop(self) {
        self.cancel.cancel();
    }
}

impl Drop for StageAnimator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
