//! # Event
//!
//! Data model shared by the store, the worker and its collaborators.
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Namespace used to derive idempotency keys from event ids.
/// Changing it would make every in-flight dispatch look new to the workflow engine.
const IDEMPOTENCY_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a4e_93b7_4d0a_8c55_1e7f_b2d9_0a31);

#[derive(Error, Debug, PartialEq, Eq)]
#[error("{0} is not a valid EventStatus")]
pub struct ParseEventStatusError(pub String);

/// Identifier assigned to an `Event` at ingestion. Ids are monotonically increasing, so ordering by
/// id is ordering by arrival.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct EventId(pub i64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Enumeration of possible statuses for an Event.
/// Pending: An event waiting to be picked up by a worker.
/// Analyzing: An event claimed by a worker that is waiting on the analysis oracle.
/// Analyzed: An event with a persisted `AnalysisResult` and no notification decision yet.
/// Dispatching: An event whose notification is being delivered to the workflow engine.
/// Notified: An event whose notification was delivered.
/// Failed: An event that could not be analyzed or notified. The cause is recorded with it.
/// Suppressed: An event that did not need a notification, or whose notification was deduplicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "event_status")]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Pending,
    Analyzing,
    Analyzed,
    Dispatching,
    Notified,
    Failed,
    Suppressed,
}

impl EventStatus {
    /// Terminal statuses are never left once reached.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventStatus::Notified | EventStatus::Failed | EventStatus::Suppressed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Analyzing => "analyzing",
            EventStatus::Analyzed => "analyzed",
            EventStatus::Dispatching => "dispatching",
            EventStatus::Notified => "notified",
            EventStatus::Failed => "failed",
            EventStatus::Suppressed => "suppressed",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Allow casting EventStatus from strings.
impl FromStr for EventStatus {
    type Err = ParseEventStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EventStatus::Pending),
            "analyzing" => Ok(EventStatus::Analyzing),
            "analyzed" => Ok(EventStatus::Analyzed),
            "dispatching" => Ok(EventStatus::Dispatching),
            "notified" => Ok(EventStatus::Notified),
            "failed" => Ok(EventStatus::Failed),
            "suppressed" => Ok(EventStatus::Suppressed),
            invalid => Err(ParseEventStatusError(invalid.to_owned())),
        }
    }
}

/// Category of a terminal failure recorded with an `Event`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    OracleUnavailable,
    OracleRejected,
    OracleMalformed,
    WorkflowUnavailable,
    WorkflowRejected,
}

/// The reason an `Event` ended up `failed`.
/// Serialized into the store so failed events can be inspected and replayed by hand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureCause {
    pub kind: FailureKind,
    pub message: String,
    pub failed_at: DateTime<Utc>,
}

impl FailureCause {
    pub fn new(kind: FailureKind, message: &str) -> Self {
        Self {
            kind,
            message: message.to_owned(),
            failed_at: Utc::now(),
        }
    }
}

/// A monitored data point as stored by an `EventStore`.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: EventId,
    pub source: String,
    pub payload: String,
    pub timestamp: DateTime<Utc>,
    pub status: EventStatus,
    /// Time of the last status transition.
    pub updated_at: DateTime<Utc>,
    pub error: Option<FailureCause>,
}

/// A NewEvent to be appended to an `EventStore`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub source: String,
    pub payload: String,
    pub timestamp: DateTime<Utc>,
}

impl NewEvent {
    pub fn new(source: &str, payload: &str) -> Self {
        Self {
            source: source.to_owned(),
            payload: payload.to_owned(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Classification of one `Event` as returned by the analysis oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub event_id: EventId,
    pub label: String,
    pub confidence: f64,
    /// The oracle response as received, kept for audit.
    pub raw_response: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AnalysisResult {
    pub fn new(
        event_id: EventId,
        label: &str,
        confidence: f64,
        raw_response: serde_json::Value,
    ) -> Self {
        Self {
            event_id,
            label: label.to_owned(),
            confidence,
            raw_response,
            created_at: Utc::now(),
        }
    }
}

/// Deduplication unit for notifications: one per source and classification label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TriggerKey(String);

impl TriggerKey {
    pub fn new(source: &str, label: &str) -> Self {
        TriggerKey(format!("{}:{}", source, label.to_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for TriggerKey {
    fn from(value: String) -> Self {
        TriggerKey(value)
    }
}

impl fmt::Display for TriggerKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A decision to notify about an `Event` whose analysis crossed the notification threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationTrigger {
    pub key: TriggerKey,
    pub event_id: EventId,
    /// Time of the dedup claim on `key`.
    pub created_at: DateTime<Utc>,
}

impl NotificationTrigger {
    pub fn new(event: &Event, analysis: &AnalysisResult) -> Self {
        Self {
            key: TriggerKey::new(&event.source, &analysis.label),
            event_id: event.id,
            // Truncated to what PostgreSQL stores, so the time read back is the time claimed.
            created_at: Utc::now().trunc_subsecs(6),
        }
    }
}

/// Key sent along every delivery so the workflow engine can discard duplicate runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey(pub Uuid);

impl IdempotencyKey {
    /// Keys are derived from the event id alone, so a re-driven dispatch reuses the same key.
    pub fn for_event(event_id: EventId) -> Self {
        IdempotencyKey(Uuid::new_v5(
            &IDEMPOTENCY_NAMESPACE,
            format!("event:{}", event_id.0).as_bytes(),
        ))
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Enumeration of possible outcomes of a `DispatchRecord`.
/// Pending: Delivery has not succeeded yet and attempts remain.
/// Delivered: The workflow engine accepted the trigger.
/// Exhausted: Every allowed attempt failed with a retryable error.
/// Rejected: The workflow engine refused the trigger; retrying would not help.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "dispatch_outcome")]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DispatchOutcome {
    Pending,
    Delivered,
    Exhausted,
    Rejected,
}

impl DispatchOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DispatchOutcome::Pending)
    }
}

/// Delivery bookkeeping for one `NotificationTrigger`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub event_id: EventId,
    pub idempotency_key: IdempotencyKey,
    pub trigger: NotificationTrigger,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub outcome: DispatchOutcome,
}

impl DispatchRecord {
    pub fn new(trigger: NotificationTrigger) -> Self {
        Self {
            event_id: trigger.event_id,
            idempotency_key: IdempotencyKey::for_event(trigger.event_id),
            trigger,
            attempts: 0,
            last_attempt_at: None,
            outcome: DispatchOutcome::Pending,
        }
    }
}
