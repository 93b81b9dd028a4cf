use std::time::Duration;

#[derive(Debug, thiserror::Error)]
/// Failures from platform API backends. Adapters convert these into
/// `ScanOutcome::Failure`; they never cross the orchestrator boundary.
pub enum BackendError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{service} API answered HTTP {status}")]
    Status { service: &'static str, status: u16 },
    #[error("{service} credentials missing: {key}")]
    MissingCredentials {
        service: &'static str,
        key: &'static str,
    },
    #[error("unexpected {service} payload: {detail}")]
    Payload {
        service: &'static str,
        detail: String,
    },
    #[error("{service} did not answer within {timeout:?}")]
    Timeout {
        service: &'static str,
        timeout: Duration,
    },
}

impl BackendError {
    /// Short operator-facing summary, used as the scan error message.
    #[must_use]
    pub fn summary(&self) -> String {
        self.to_string()
    }

    /// Full cause chain for the error details field.
    #[must_use]
    pub fn details(&self) -> String {
        let mut chain = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            chain.push_str(": ");
            chain.push_str(&cause.to_string());
            source = cause.source();
        }
        chain
    }
}
