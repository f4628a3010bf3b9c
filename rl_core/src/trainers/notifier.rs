// Completion notification sent when a training run stops early
use std::time::Duration;

use tracing::{info, warn};

/// Status reported to an external listener when training stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Stopped,
}

impl CompletionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionStatus::Stopped => "stopped",
        }
    }
}

/// Delivery is best effort: implementations log failures and never return
/// them.
pub trait CompletionNotifier: Send {
    fn notify(&self, status: CompletionStatus);
}

/// Does nothing; used when no listener is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl CompletionNotifier for NoopNotifier {
    fn notify(&self, _status: CompletionStatus) {}
}

/// Posts the form `training=<status>` to `<base_url>/completion`.
pub struct HttpCompletionNotifier {
    endpoint: String,
    client: reqwest::blocking::Client,
}

impl HttpCompletionNotifier {
    pub fn new(base_url: &str) -> Result<Self, reqwest::Error> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            endpoint: Self::endpoint(base_url),
            client,
        })
    }

    fn endpoint(base_url: &str) -> String {
        format!("{}/completion", base_url.trim_end_matches('/'))
    }
}

impl CompletionNotifier for HttpCompletionNotifier {
    fn notify(&self, status: CompletionStatus) {
        let result = self
            .client
            .post(&self.endpoint)
            .form(&[("training", status.as_str())])
            .send()
            .and_then(|response| response.error_for_status());
        match result {
            Ok(_) => info!(endpoint = %self.endpoint, status = status.as_str(), "completion notified"),
            Err(err) => warn!(
                endpoint = %self.endpoint,
                error = %err,
                "failed to deliver completion notification"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_joins_completion_path() {
        assert_eq!(
            HttpCompletionNotifier::endpoint("http://localhost:5000/"),
            "http://localhost:5000/completion"
        );
        assert_eq!(
            HttpCompletionNotifier::endpoint("http://localhost:5000"),
            "http://localhost:5000/completion"
        );
    }

    #[test]
    fn unreachable_listener_is_not_fatal() {
        // port 9 (discard) is closed on test machines; the call must return
        let notifier = HttpCompletionNotifier::new("http://127.0.0.1:9").unwrap();
        notifier.notify(CompletionStatus::Stopped);
    }
}
