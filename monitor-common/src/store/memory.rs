use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::{EventStore, StoreError, StoreResult};
use crate::event::{
    AnalysisResult, DispatchRecord, Event, EventId, EventStatus, FailureCause, NewEvent,
};

/// An `EventStore` kept in process memory.
///
/// Rows live in sharded maps, so a status update only locks the shard holding that event and
/// unrelated events never wait on each other. Nothing survives a restart: use `PgEventStore` for
/// anything that needs crash recovery across processes.
#[derive(Default)]
pub struct MemoryEventStore {
    next_id: AtomicI64,
    events: DashMap<EventId, Event>,
    analyses: DashMap<EventId, AnalysisResult>,
    dispatch_records: DashMap<EventId, DispatchRecord>,
    unavailable: AtomicBool,
    failing_transition: Mutex<Option<(EventStatus, EventStatus)>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail with `StoreUnavailable`, until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Overwrite the status of an event, bypassing compare-and-set. Used to stage crash scenarios.
    pub fn force_status(&self, id: EventId, status: EventStatus, updated_at: DateTime<Utc>) {
        if let Some(mut event) = self.events.get_mut(&id) {
            event.status = status;
            event.updated_at = updated_at;
        }
    }

    /// Make the next `update_status` from `from` to `to` fail with `StoreUnavailable`.
    pub fn fail_next_transition(&self, from: EventStatus, to: EventStatus) {
        if let Ok(mut failing) = self.failing_transition.lock() {
            *failing = Some((from, to));
        }
    }

    pub fn count_by_status(&self, status: EventStatus) -> usize {
        self.events.iter().filter(|e| e.status == status).count()
    }

    pub fn dispatch_record_count(&self) -> usize {
        self.dispatch_records.len()
    }

    fn check_available(&self, command: &str) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(unavailable(command));
        }
        Ok(())
    }

    fn take_failing_transition(&self, from: EventStatus, to: EventStatus) -> bool {
        match self.failing_transition.lock() {
            Ok(mut failing) if *failing == Some((from, to)) => failing.take().is_some(),
            _ => false,
        }
    }

    fn collect<F>(&self, limit: usize, filter: F) -> Vec<Event>
    where
        F: Fn(&Event) -> bool,
    {
        let mut events: Vec<Event> = self
            .events
            .iter()
            .filter(|entry| filter(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        events.sort_by_key(|event| event.id);
        events.truncate(limit);
        events
    }
}

fn unavailable(command: &str) -> StoreError {
    StoreError::StoreUnavailable {
        command: command.to_owned(),
        error: sqlx::Error::PoolTimedOut,
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(&self, event: NewEvent) -> StoreResult<EventId> {
        self.check_available("append")?;

        let id = EventId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.events.insert(
            id,
            Event {
                id,
                source: event.source,
                payload: event.payload,
                timestamp: event.timestamp,
                status: EventStatus::Pending,
                updated_at: Utc::now(),
                error: None,
            },
        );

        Ok(id)
    }

    async fn get(&self, id: EventId) -> StoreResult<Event> {
        self.check_available("get")?;

        self.events
            .get(&id)
            .map(|event| event.value().clone())
            .ok_or(StoreError::NotFound(id))
    }

    async fn list_by_status(&self, status: EventStatus, limit: usize) -> StoreResult<Vec<Event>> {
        self.check_available("list_by_status")?;

        Ok(self.collect(limit, |event| event.status == status))
    }

    async fn list_stale(
        &self,
        status: EventStatus,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Event>> {
        self.check_available("list_stale")?;

        Ok(self.collect(limit, |event| {
            event.status == status && event.updated_at < older_than
        }))
    }

    async fn update_status(
        &self,
        id: EventId,
        from: EventStatus,
        to: EventStatus,
        cause: Option<FailureCause>,
    ) -> StoreResult<bool> {
        self.check_available("update_status")?;
        if self.take_failing_transition(from, to) {
            return Err(unavailable("update_status"));
        }

        let mut event = self.events.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if event.status != from {
            return Ok(false);
        }

        event.status = to;
        event.updated_at = Utc::now();
        if cause.is_some() {
            event.error = cause;
        }

        Ok(true)
    }

    async fn save_analysis(&self, result: &AnalysisResult) -> StoreResult<()> {
        self.check_available("save_analysis")?;

        self.analyses
            .entry(result.event_id)
            .or_insert_with(|| result.clone());

        Ok(())
    }

    async fn get_analysis(&self, id: EventId) -> StoreResult<Option<AnalysisResult>> {
        self.check_available("get_analysis")?;

        Ok(self.analyses.get(&id).map(|result| result.value().clone()))
    }

    async fn save_dispatch_record(&self, record: &DispatchRecord) -> StoreResult<()> {
        self.check_available("save_dispatch_record")?;

        self.dispatch_records
            .insert(record.event_id, record.clone());

        Ok(())
    }

    async fn get_dispatch_record(&self, id: EventId) -> StoreResult<Option<DispatchRecord>> {
        self.check_available("get_dispatch_record")?;

        Ok(self
            .dispatch_records
            .get(&id)
            .map(|record| record.value().clone()))
    }
}
