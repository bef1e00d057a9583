use std::time;

use monitor_common::event::{EventId, FailureCause, FailureKind};
use monitor_common::store::StoreError;
use thiserror::Error;

/// Enumeration of errors returned by the `AnalysisClient`.
#[derive(Error, Debug)]
pub enum AnalysisError {
    /// Network failure, timeout, 429 or 5xx. Retryable. `circuit_open` is set when the call was
    /// refused locally without reaching the oracle.
    #[error("analysis oracle unavailable: {reason}")]
    OracleUnavailable { reason: String, circuit_open: bool },
    #[error("analysis oracle rejected the request: {0}")]
    OracleRejected(String),
    #[error("analysis oracle returned a malformed response: {0}")]
    OracleMalformed(String),
    #[error("analysis interrupted by shutdown")]
    Interrupted,
}

impl AnalysisError {
    pub fn unavailable(reason: &str) -> Self {
        AnalysisError::OracleUnavailable {
            reason: reason.to_owned(),
            circuit_open: false,
        }
    }

    pub fn circuit_open() -> Self {
        AnalysisError::OracleUnavailable {
            reason: "circuit breaker is open".to_owned(),
            circuit_open: true,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AnalysisError::OracleUnavailable {
                circuit_open: false,
                ..
            }
        )
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(
            self,
            AnalysisError::OracleUnavailable {
                circuit_open: true,
                ..
            }
        )
    }

    /// The cause to record when this error ends an event. `None` for errors that should not.
    pub fn failure_cause(&self) -> Option<FailureCause> {
        let kind = match self {
            AnalysisError::OracleUnavailable {
                circuit_open: true,
                ..
            }
            | AnalysisError::Interrupted => return None,
            AnalysisError::OracleUnavailable { .. } => FailureKind::OracleUnavailable,
            AnalysisError::OracleRejected(_) => FailureKind::OracleRejected,
            AnalysisError::OracleMalformed(_) => FailureKind::OracleMalformed,
        };

        Some(FailureCause::new(kind, &self.to_string()))
    }

    /// Label used when reporting metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            AnalysisError::OracleUnavailable {
                circuit_open: true,
                ..
            } => "circuit_open",
            AnalysisError::OracleUnavailable { .. } => "unavailable",
            AnalysisError::OracleRejected(_) => "rejected",
            AnalysisError::OracleMalformed(_) => "malformed",
            AnalysisError::Interrupted => "interrupted",
        }
    }
}

/// Enumeration of errors returned by a `WorkflowEngine` or the `NotificationDispatcher`.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Network failure, timeout, 429 or 5xx. Retryable, after `retry_after` if the engine asked.
    #[error("workflow engine unavailable: {reason}")]
    WorkflowUnavailable {
        reason: String,
        retry_after: Option<time::Duration>,
    },
    #[error("workflow engine rejected the trigger: {0}")]
    WorkflowRejected(String),
    #[error("dispatch interrupted by shutdown")]
    Interrupted,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DispatchError {
    pub fn unavailable(reason: &str) -> Self {
        DispatchError::WorkflowUnavailable {
            reason: reason.to_owned(),
            retry_after: None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::WorkflowUnavailable { .. })
    }

    pub fn failure_cause(&self) -> Option<FailureCause> {
        let kind = match self {
            DispatchError::WorkflowUnavailable { .. } => FailureKind::WorkflowUnavailable,
            DispatchError::WorkflowRejected(_) => FailureKind::WorkflowRejected,
            DispatchError::Interrupted | DispatchError::Store(_) => return None,
        };

        Some(FailureCause::new(kind, &self.to_string()))
    }
}

/// Enumeration of errors that stop the processing of one event without ending it.
/// The event keeps its current status and is picked up again later.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("processing interrupted by shutdown")]
    Interrupted,
    #[error("event {0} has no persisted analysis")]
    MissingAnalysis(EventId),
    #[error("event {0} has no persisted dispatch record")]
    MissingDispatchRecord(EventId),
}

/// Enumeration of errors related to the initialization of the worker.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("failed to build an http client: {0}")]
    HttpClient(#[from] reqwest::Error),
    #[error("invalid url {0}")]
    InvalidUrl(String),
    #[error("invalid text extraction pattern: {0}")]
    InvalidPattern(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}
