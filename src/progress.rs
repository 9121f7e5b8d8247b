use serde_json::Value;

/// Body of a 202 reply to a long-running operation (fork, join, savepoint
/// revert, export). The `value` holds the URL of the progress resource to
/// poll; some endpoints nest it under `value.progress_url`.
#[derive(Debug, serde::Deserialize)]
pub(crate) struct ProgressReply {
    #[serde(default)]
    value: Value,
}

impl ProgressReply {
    pub(crate) fn progress_url(&self) -> Option<String> {
        match &self.value {
            Value::String(url) => Some(url.clone()),
            Value::Object(map) => map
                .get("progress_url")
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        }
    }
}

/// Polled progress state. `progress` runs 0..=100; a negative value means
/// the job failed and `message` carries the server's reason.
#[derive(Debug, serde::Deserialize)]
pub(crate) struct ProgressStatus {
    #[serde(default)]
    pub(crate) progress: f64,
    #[serde(default)]
    pub(crate) message: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
pub(crate) struct ProgressView {
    pub(crate) value: ProgressStatus,
}

impl ProgressStatus {
    pub(crate) fn is_complete(&self) -> bool {
        self.progress >= 100.0
    }

    pub(crate) fn is_failed(&self) -> bool {
        self.progress < 0.0
    }
}
