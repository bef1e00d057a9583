use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use uuid::Uuid;

use super::{EventStore, StoreError, StoreResult};
use crate::event::{
    AnalysisResult, DispatchOutcome, DispatchRecord, Event, EventId, EventStatus, FailureCause,
    IdempotencyKey, NewEvent, NotificationTrigger, TriggerKey,
};

#[derive(sqlx::FromRow)]
struct EventRow {
    id: EventId,
    source: String,
    payload: String,
    occurred_at: DateTime<Utc>,
    status: EventStatus,
    updated_at: DateTime<Utc>,
    error: Option<Json<FailureCause>>,
}

impl From<EventRow> for Event {
    fn from(row: EventRow) -> Self {
        Event {
            id: row.id,
            source: row.source,
            payload: row.payload,
            timestamp: row.occurred_at,
            status: row.status,
            updated_at: row.updated_at,
            error: row.error.map(|cause| cause.0),
        }
    }
}

#[derive(sqlx::FromRow)]
struct AnalysisRow {
    event_id: EventId,
    label: String,
    confidence: f64,
    raw_response: Json<serde_json::Value>,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct DispatchRecordRow {
    event_id: EventId,
    idempotency_key: Uuid,
    trigger_key: String,
    trigger_created_at: DateTime<Utc>,
    attempts: i32,
    last_attempt_at: Option<DateTime<Utc>>,
    outcome: DispatchOutcome,
}

impl TryFrom<DispatchRecordRow> for DispatchRecord {
    type Error = StoreError;

    fn try_from(row: DispatchRecordRow) -> Result<Self, Self::Error> {
        let attempts = u32::try_from(row.attempts).map_err(|_| StoreError::Corrupted {
            id: row.event_id,
            reason: format!("negative attempt count {}", row.attempts),
        })?;

        Ok(DispatchRecord {
            event_id: row.event_id,
            idempotency_key: IdempotencyKey(row.idempotency_key),
            trigger: NotificationTrigger {
                key: TriggerKey::from(row.trigger_key),
                event_id: row.event_id,
                created_at: row.trigger_created_at,
            },
            attempts,
            last_attempt_at: row.last_attempt_at,
            outcome: row.outcome,
        })
    }
}

fn unavailable(command: &str) -> impl FnOnce(sqlx::Error) -> StoreError + '_ {
    move |error| StoreError::StoreUnavailable {
        command: command.to_owned(),
        error,
    }
}

/// An `EventStore` backed by PostgreSQL tables created by the workspace migrations.
#[derive(Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    /// Initialize a new PgEventStore connecting to `url`.
    pub async fn new(url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(unavailable("connect"))?;

        Ok(Self { pool })
    }

    /// Initialize a new PgEventStore from an existing pool.
    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn append(&self, event: NewEvent) -> StoreResult<EventId> {
        let id: EventId = sqlx::query_scalar(
            r#"
INSERT INTO monitor_events
    (source, payload, occurred_at, status, updated_at)
VALUES
    ($1, $2, $3, 'pending'::event_status, NOW())
RETURNING id
            "#,
        )
        .bind(&event.source)
        .bind(&event.payload)
        .bind(event.timestamp)
        .fetch_one(&self.pool)
        .await
        .map_err(unavailable("INSERT"))?;

        Ok(id)
    }

    async fn get(&self, id: EventId) -> StoreResult<Event> {
        let row: Option<EventRow> = sqlx::query_as(
            r#"
SELECT id, source, payload, occurred_at, status, updated_at, error
FROM monitor_events
WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable("SELECT"))?;

        row.map(Event::from).ok_or(StoreError::NotFound(id))
    }

    async fn list_by_status(&self, status: EventStatus, limit: usize) -> StoreResult<Vec<Event>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
SELECT id, source, payload, occurred_at, status, updated_at, error
FROM monitor_events
WHERE status = $1
ORDER BY id
LIMIT $2
            "#,
        )
        .bind(status)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable("SELECT"))?;

        Ok(rows.into_iter().map(Event::from).collect())
    }

    async fn list_stale(
        &self,
        status: EventStatus,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Event>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
SELECT id, source, payload, occurred_at, status, updated_at, error
FROM monitor_events
WHERE status = $1 AND updated_at < $2
ORDER BY id
LIMIT $3
            "#,
        )
        .bind(status)
        .bind(older_than)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable("SELECT"))?;

        Ok(rows.into_iter().map(Event::from).collect())
    }

    async fn update_status(
        &self,
        id: EventId,
        from: EventStatus,
        to: EventStatus,
        cause: Option<FailureCause>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
UPDATE monitor_events
SET
    status = $3,
    updated_at = NOW(),
    error = COALESCE($4, error)
WHERE
    id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(from)
        .bind(to)
        .bind(cause.map(Json))
        .execute(&self.pool)
        .await
        .map_err(unavailable("UPDATE"))?;

        Ok(result.rows_affected() == 1)
    }

    async fn save_analysis(&self, result: &AnalysisResult) -> StoreResult<()> {
        sqlx::query(
            r#"
INSERT INTO analysis_results
    (event_id, label, confidence, raw_response, created_at)
VALUES
    ($1, $2, $3, $4, $5)
ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(result.event_id)
        .bind(&result.label)
        .bind(result.confidence)
        .bind(Json(&result.raw_response))
        .bind(result.created_at)
        .execute(&self.pool)
        .await
        .map_err(unavailable("INSERT"))?;

        Ok(())
    }

    async fn get_analysis(&self, id: EventId) -> StoreResult<Option<AnalysisResult>> {
        let row: Option<AnalysisRow> = sqlx::query_as(
            r#"
SELECT event_id, label, confidence, raw_response, created_at
FROM analysis_results
WHERE event_id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable("SELECT"))?;

        Ok(row.map(|row| AnalysisResult {
            event_id: row.event_id,
            label: row.label,
            confidence: row.confidence,
            raw_response: row.raw_response.0,
            created_at: row.created_at,
        }))
    }

    async fn save_dispatch_record(&self, record: &DispatchRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
INSERT INTO dispatch_records
    (event_id, idempotency_key, trigger_key, trigger_created_at, attempts, last_attempt_at, outcome)
VALUES
    ($1, $2, $3, $4, $5, $6, $7)
ON CONFLICT (event_id) DO UPDATE
SET
    attempts = EXCLUDED.attempts,
    last_attempt_at = EXCLUDED.last_attempt_at,
    outcome = EXCLUDED.outcome
            "#,
        )
        .bind(record.event_id)
        .bind(record.idempotency_key.0)
        .bind(record.trigger.key.as_str())
        .bind(record.trigger.created_at)
        .bind(i32::try_from(record.attempts).unwrap_or(i32::MAX))
        .bind(record.last_attempt_at)
        .bind(record.outcome)
        .execute(&self.pool)
        .await
        .map_err(unavailable("UPSERT"))?;

        Ok(())
    }

    async fn get_dispatch_record(&self, id: EventId) -> StoreResult<Option<DispatchRecord>> {
        let row: Option<DispatchRecordRow> = sqlx::query_as(
            r#"
SELECT event_id, idempotency_key, trigger_key, trigger_created_at, attempts, last_attempt_at, outcome
FROM dispatch_records
WHERE event_id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable("SELECT"))?;

        row.map(DispatchRecord::try_from).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::FailureKind;

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a PostgreSQL database at DATABASE_URL"]
    async fn test_can_append_and_claim_event(db: PgPool) {
        let store = PgEventStore::new_from_pool(db);

        let id = store
            .append(NewEvent::new("status-page", "outage detected"))
            .await
            .expect("failed to append event");

        let pending = store
            .list_by_status(EventStatus::Pending, 10)
            .await
            .expect("failed to list events");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].payload, "outage detected");

        assert!(store
            .update_status(id, EventStatus::Pending, EventStatus::Analyzing, None)
            .await
            .unwrap());
        assert!(!store
            .update_status(id, EventStatus::Pending, EventStatus::Analyzing, None)
            .await
            .unwrap());
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a PostgreSQL database at DATABASE_URL"]
    async fn test_failure_cause_is_recorded(db: PgPool) {
        let store = PgEventStore::new_from_pool(db);
        let id = store.append(NewEvent::new("blog", "x")).await.unwrap();
        store
            .update_status(id, EventStatus::Pending, EventStatus::Analyzing, None)
            .await
            .unwrap();

        let cause = FailureCause::new(FailureKind::OracleMalformed, "missing label");
        store
            .update_status(
                id,
                EventStatus::Analyzing,
                EventStatus::Failed,
                Some(cause.clone()),
            )
            .await
            .unwrap();

        let event = store.get(id).await.unwrap();
        assert_eq!(event.status, EventStatus::Failed);
        assert_eq!(event.error.map(|c| c.kind), Some(FailureKind::OracleMalformed));
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a PostgreSQL database at DATABASE_URL"]
    async fn test_dispatch_record_upsert(db: PgPool) {
        let store = PgEventStore::new_from_pool(db);
        let id = store.append(NewEvent::new("blog", "x")).await.unwrap();
        let mut record = DispatchRecord::new(NotificationTrigger {
            key: TriggerKey::new("blog", "critical"),
            event_id: id,
            created_at: Utc::now(),
        });

        store.save_dispatch_record(&record).await.unwrap();
        record.attempts = 2;
        record.last_attempt_at = Some(Utc::now());
        record.outcome = DispatchOutcome::Delivered;
        store.save_dispatch_record(&record).await.unwrap();

        let stored = store.get_dispatch_record(id).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 2);
        assert_eq!(stored.outcome, DispatchOutcome::Delivered);
        assert_eq!(stored.idempotency_key, IdempotencyKey::for_event(id));
    }
}
