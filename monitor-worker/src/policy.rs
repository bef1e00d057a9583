use monitor_common::event::AnalysisResult;

/// Decides which analysis results warrant a notification.
#[derive(Debug, Clone)]
pub struct NotificationPolicy {
    labels: Vec<String>,
    min_confidence: f64,
}

impl NotificationPolicy {
    pub fn new<I, S>(labels: I, min_confidence: f64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            labels: labels
                .into_iter()
                .map(|label| label.as_ref().trim().to_lowercase())
                .collect(),
            min_confidence,
        }
    }

    /// True when the label is one we notify about, compared case-insensitively, and the oracle
    /// is confident enough.
    pub fn crosses_threshold(&self, result: &AnalysisResult) -> bool {
        let label = result.label.to_lowercase();

        result.confidence >= self.min_confidence && self.labels.iter().any(|l| *l == label)
    }
}

impl Default for NotificationPolicy {
    fn default() -> Self {
        NotificationPolicy::new(["negative", "critical"], 0.8)
    }
}
