//! # Store
//!
//! The narrow persistence interface used by the pipeline, with a PostgreSQL backend for
//! production and an in-memory backend for tests and local runs.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::event::{
    AnalysisResult, DispatchRecord, Event, EventId, EventStatus, FailureCause, NewEvent,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryEventStore;
pub use postgres::PgEventStore;

/// Enumeration of errors for operations with an `EventStore`.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The backend could not be reached or the query failed. Always fatal to the current attempt
    /// only: the event stays where it is and is picked up again later.
    #[error("event store unavailable during {command}: {error}")]
    StoreUnavailable {
        command: String,
        error: sqlx::Error,
    },
    #[error("event {0} not found")]
    NotFound(EventId),
    #[error("stored row for event {id} could not be decoded: {reason}")]
    Corrupted { id: EventId, reason: String },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Persistence collaborator of the pipeline.
///
/// Status changes go through `update_status`, which is a compare-and-set on the current status:
/// it only applies when the event is still in `from`, so two workers can never both move the
/// same event forward.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append a new event in `pending` status and return its id.
    async fn append(&self, event: NewEvent) -> StoreResult<EventId>;

    async fn get(&self, id: EventId) -> StoreResult<Event>;

    /// List up to `limit` events in `status`, oldest id first.
    async fn list_by_status(&self, status: EventStatus, limit: usize) -> StoreResult<Vec<Event>>;

    /// List up to `limit` events in `status` whose last transition happened before `older_than`,
    /// oldest id first.
    async fn list_stale(
        &self,
        status: EventStatus,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Event>>;

    /// Move an event from `from` to `to`, recording `cause` when given. Returns whether the
    /// transition was applied. A transition with `from == to` only refreshes `updated_at`.
    async fn update_status(
        &self,
        id: EventId,
        from: EventStatus,
        to: EventStatus,
        cause: Option<FailureCause>,
    ) -> StoreResult<bool>;

    /// Persist the analysis of an event. Results are immutable: saving a second result for the
    /// same event keeps the first one.
    async fn save_analysis(&self, result: &AnalysisResult) -> StoreResult<()>;

    async fn get_analysis(&self, id: EventId) -> StoreResult<Option<AnalysisResult>>;

    /// Insert or update the dispatch record of an event.
    async fn save_dispatch_record(&self, record: &DispatchRecord) -> StoreResult<()>;

    async fn get_dispatch_record(&self, id: EventId) -> StoreResult<Option<DispatchRecord>>;
}
