//! # Dispatcher
//!
//! Delivery of notification triggers to the external workflow engine.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use http::StatusCode;
use monitor_common::event::{
    AnalysisResult, DispatchOutcome, DispatchRecord, Event, EventId, IdempotencyKey, TriggerKey,
};
use monitor_common::retry::RetryPolicy;
use monitor_common::store::EventStore;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{DispatchError, WorkerError};
use crate::http::{
    build_http_client, is_retryable_status, parse_retry_after_header, response_excerpt,
};

/// Body of a request to the workflow engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRequest {
    pub idempotency_key: IdempotencyKey,
    pub event_id: EventId,
    pub trigger_key: TriggerKey,
    pub source: String,
    pub label: String,
    pub confidence: f64,
    pub payload: String,
    pub timestamp: DateTime<Utc>,
}

impl TriggerRequest {
    pub fn new(record: &DispatchRecord, event: &Event, analysis: &AnalysisResult) -> Self {
        Self {
            idempotency_key: record.idempotency_key,
            event_id: record.event_id,
            trigger_key: record.trigger.key.clone(),
            source: event.source.clone(),
            label: analysis.label.clone(),
            confidence: analysis.confidence,
            payload: event.payload.clone(),
            timestamp: event.timestamp,
        }
    }
}

/// Boundary of the workflow engine. Implementations make exactly one request per call.
/// A request whose idempotency key was already accepted must succeed without starting a new run.
#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    async fn trigger(&self, request: &TriggerRequest) -> Result<(), DispatchError>;
}

/// A `WorkflowEngine` reached over HTTP, such as an n8n webhook node.
pub struct HttpWorkflowEngine {
    client: reqwest::Client,
    url: reqwest::Url,
    api_key: Option<String>,
}

impl HttpWorkflowEngine {
    pub fn new(
        url: &str,
        api_key: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, WorkerError> {
        let url = url
            .parse()
            .map_err(|_| WorkerError::InvalidUrl(url.to_owned()))?;

        Ok(Self {
            client: build_http_client(request_timeout)?,
            url,
            api_key,
        })
    }
}

#[async_trait]
impl WorkflowEngine for HttpWorkflowEngine {
    async fn trigger(&self, request: &TriggerRequest) -> Result<(), DispatchError> {
        let mut builder = self
            .client
            .post(self.url.clone())
            .header("Idempotency-Key", request.idempotency_key.to_string())
            .json(request);
        if let Some(api_key) = &self.api_key {
            builder = builder.header("X-API-KEY", api_key);
        }

        let response = builder
            .send()
            .await
            .map_err(|error| DispatchError::unavailable(&error.to_string()))?;

        let status = response.status();
        // The engine already accepted this idempotency key.
        if status.is_success() || status == StatusCode::CONFLICT {
            return Ok(());
        }

        let retry_after = parse_retry_after_header(response.headers());
        let reason = format!("{}: {}", status, response_excerpt(response).await);

        if is_retryable_status(status) {
            Err(DispatchError::WorkflowUnavailable {
                reason,
                retry_after,
            })
        } else {
            Err(DispatchError::WorkflowRejected(reason))
        }
    }
}

/// Settings of a `NotificationDispatcher`.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Total attempts per record, including attempts made before a restart.
    pub max_attempts: u32,
    pub retry_policy: RetryPolicy,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_policy: RetryPolicy::build(2, Duration::from_secs(1))
                .maximum_interval(Duration::from_secs(60))
                .jitter(0.2)
                .provide(),
        }
    }
}

/// Delivers `DispatchRecord`s to a `WorkflowEngine`, persisting the record before every attempt
/// so an interrupted delivery resumes with the same idempotency key and attempt count.
pub struct NotificationDispatcher {
    engine: Arc<dyn WorkflowEngine>,
    store: Arc<dyn EventStore>,
    settings: DispatchSettings,
    shutdown: CancellationToken,
}

impl NotificationDispatcher {
    pub fn new(
        engine: Arc<dyn WorkflowEngine>,
        store: Arc<dyn EventStore>,
        settings: DispatchSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            engine,
            store,
            settings,
            shutdown,
        }
    }

    /// Deliver `record`, retrying unavailable errors up to the attempt ceiling.
    ///
    /// `record` is updated in place and persisted as it goes. It ends `delivered` on success,
    /// `exhausted` when the ceiling is reached and `rejected` when the engine refuses the
    /// trigger; the last two are returned as errors. On `Interrupted` or a store error the record
    /// is left `pending`.
    pub async fn dispatch(
        &self,
        record: &mut DispatchRecord,
        request: &TriggerRequest,
    ) -> Result<DispatchOutcome, DispatchError> {
        match record.outcome {
            DispatchOutcome::Pending => (),
            DispatchOutcome::Delivered => return Ok(DispatchOutcome::Delivered),
            DispatchOutcome::Exhausted => {
                return Err(DispatchError::unavailable("dispatch attempts exhausted"))
            }
            DispatchOutcome::Rejected => {
                return Err(DispatchError::WorkflowRejected(
                    "trigger previously rejected".to_owned(),
                ))
            }
        }

        let labels = [("trigger_key", record.trigger.key.to_string())];

        loop {
            // No new request once shutdown is requested: the record stays pending for recovery.
            if self.shutdown.is_cancelled() {
                return Err(DispatchError::Interrupted);
            }
            if record.attempts >= self.settings.max_attempts {
                return self
                    .finish(
                        record,
                        DispatchOutcome::Exhausted,
                        DispatchError::unavailable("dispatch attempts exhausted"),
                    )
                    .await;
            }

            record.attempts += 1;
            record.last_attempt_at = Some(Utc::now());
            self.store.save_dispatch_record(record).await?;
            metrics::counter!("monitor_dispatch_attempts_total").increment(1);

            match self.engine.trigger(request).await {
                Ok(()) => {
                    record.outcome = DispatchOutcome::Delivered;
                    self.store.save_dispatch_record(record).await?;

                    info!(
                        event_id = %record.event_id,
                        attempts = record.attempts,
                        "notification delivered"
                    );
                    metrics::counter!(
                        "monitor_dispatch_outcomes_total",
                        &[("outcome", "delivered")]
                    )
                    .increment(1);
                    return Ok(DispatchOutcome::Delivered);
                }
                Err(error @ DispatchError::WorkflowUnavailable { .. }) => {
                    if record.attempts >= self.settings.max_attempts {
                        return self
                            .finish(record, DispatchOutcome::Exhausted, error)
                            .await;
                    }

                    let retry_after = match &error {
                        DispatchError::WorkflowUnavailable { retry_after, .. } => *retry_after,
                        _ => None,
                    };
                    let interval = self
                        .settings
                        .retry_policy
                        .jittered_interval(record.attempts, retry_after);
                    warn!(
                        event_id = %record.event_id,
                        attempt = record.attempts,
                        "dispatch failed, retrying in {:?}: {}",
                        interval,
                        error
                    );
                    metrics::counter!("monitor_dispatch_retries_total", &labels).increment(1);

                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Err(DispatchError::Interrupted),
                        _ = tokio::time::sleep(interval) => (),
                    }
                }
                Err(error) => {
                    return self
                        .finish(record, DispatchOutcome::Rejected, error)
                        .await;
                }
            }
        }
    }

    async fn finish(
        &self,
        record: &mut DispatchRecord,
        outcome: DispatchOutcome,
        error: DispatchError,
    ) -> Result<DispatchOutcome, DispatchError> {
        record.outcome = outcome;
        self.store.save_dispatch_record(record).await?;

        error!(
            event_id = %record.event_id,
            attempts = record.attempts,
            outcome = ?outcome,
            "notification not delivered: {}",
            error
        );
        let outcome_label = match outcome {
            DispatchOutcome::Exhausted => "exhausted",
            _ => "rejected",
        };
        metrics::counter!(
            "monitor_dispatch_outcomes_total",
            &[("outcome", outcome_label)]
        )
        .increment(1);

        Err(error)
    }
}
