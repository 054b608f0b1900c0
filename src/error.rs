use thiserror::Error;

use crate::enrichment::ProviderError;
use crate::event::EventError;
use crate::input::InputError;
use crate::workflow::WorkflowError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Event error: {0}")]
    Event(#[from] EventError),
    #[error("Enrichment error: {0}")]
    Provider(#[from] ProviderError),
    #[error("Input error: {0}")]
    Input(#[from] InputError),
    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Config error: {0}")]
    Config(String),
    #[error("Invalid ingest request: {0}")]
    InvalidIngest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type RelayResult<T> = Result<T, Error>;

impl Error {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Error::Internal(message.into())
    }

    /// Machine-readable reason, the same one the subsystem error reports.
    pub fn code(&self) -> String {
        match self {
            Error::Event(_) => "invalid_queue_policy".to_string(),
            Error::Provider(e) => e.code(),
            Error::Input(e) => e.code().to_string(),
            Error::Workflow(e) => e.code().to_string(),
            Error::Config(_) => "invalid_config".to_string(),
            Error::InvalidIngest(_) => "invalid_ingest".to_string(),
            Error::Internal(_) => "internal".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_come_from_subsystems() {
        let err: Error = InputError::ReadOnly("loopback".to_string()).into();
        assert_eq!(err.code(), "read_only_input");

        let err: Error = ProviderError::Http { status: 503 }.into();
        assert_eq!(err.code(), "http_503");

        let err: Error = WorkflowError::NotFound("wf".to_string()).into();
        assert_eq!(err.code(), "workflow_not_found");

        assert_eq!(Error::internal("boom").code(), "internal");
    }
}
