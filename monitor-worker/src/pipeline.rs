//! # Pipeline
//!
//! The per-event state machine:
//!
//! ```text
//! pending -> analyzing -> analyzed -> dispatching -> notified
//!               |  \          \             \
//!               |   failed     suppressed    failed
//!               \-> pending (oracle circuit open, or shutdown)
//! ```
//!
//! Every transition is a compare-and-set in the `EventStore`, and whatever a later stage needs is
//! persisted before the transition into it. This makes it possible to resume any non-terminal
//! event from the stage it was left in.
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, SubsecRound, Utc};
use monitor_common::event::{
    AnalysisResult, DispatchOutcome, DispatchRecord, Event, EventId, EventStatus, FailureCause,
    NotificationTrigger,
};
use monitor_common::store::EventStore;
use tracing::{debug, error, info, warn};

use crate::analysis::AnalysisClient;
use crate::dedup::Deduplicator;
use crate::dispatcher::{NotificationDispatcher, TriggerRequest};
use crate::error::{AnalysisError, DispatchError, PipelineError};
use crate::policy::NotificationPolicy;

/// The dedup claim of a persisted trigger when its event is resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResumedClaim {
    /// The record is final, nothing will be sent.
    NotNeeded,
    /// The trigger holds its key since this time.
    Held(DateTime<Utc>),
    /// Another trigger holds the key.
    Taken,
}

impl ResumedClaim {
    fn claimed_at(self) -> Option<DateTime<Utc>> {
        match self {
            ResumedClaim::Held(claimed_at) => Some(claimed_at),
            ResumedClaim::NotNeeded | ResumedClaim::Taken => None,
        }
    }
}

pub struct Pipeline {
    store: Arc<dyn EventStore>,
    analysis: AnalysisClient,
    policy: NotificationPolicy,
    dedup: Deduplicator,
    dispatcher: NotificationDispatcher,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn EventStore>,
        analysis: AnalysisClient,
        policy: NotificationPolicy,
        dedup: Deduplicator,
        dispatcher: NotificationDispatcher,
    ) -> Self {
        Self {
            store,
            analysis,
            policy,
            dedup,
            dispatcher,
        }
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub fn analysis(&self) -> &AnalysisClient {
        &self.analysis
    }

    pub fn deduplicator(&self) -> &Deduplicator {
        &self.dedup
    }

    /// Drive `event` from the stage it is in as far as it can go, and return the status it was
    /// left in.
    ///
    /// A `pending` event is claimed first; if another worker claimed it, nothing is done. Errors
    /// leave the event in a non-terminal status for a later pickup: they never mark it failed.
    pub async fn process(&self, event: Event) -> Result<EventStatus, PipelineError> {
        let start = Instant::now();
        let event_id = event.id;

        let result = match event.status {
            EventStatus::Pending => self.claim(event).await,
            EventStatus::Analyzing => self.resume_analysis(event).await,
            EventStatus::Analyzed => self.resume_decision(event).await,
            EventStatus::Dispatching => self.resume_dispatch(event).await,
            status => Ok(status),
        };

        let status_label = match &result {
            Ok(status) => status.as_str(),
            Err(PipelineError::Interrupted) => "interrupted",
            Err(_) => "error",
        };
        metrics::counter!("monitor_events_processed_total", &[("status", status_label)])
            .increment(1);
        metrics::histogram!("monitor_event_processing_duration_seconds")
            .record(start.elapsed().as_secs_f64());
        debug!(event_id = %event_id, "processing ended with {}", status_label);

        result
    }

    async fn claim(&self, event: Event) -> Result<EventStatus, PipelineError> {
        if !self
            .transition(event.id, EventStatus::Pending, EventStatus::Analyzing, None)
            .await?
        {
            return self.current_status(event.id).await;
        }

        self.analyze(event).await
    }

    async fn resume_analysis(&self, event: Event) -> Result<EventStatus, PipelineError> {
        if !self
            .transition(event.id, EventStatus::Analyzing, EventStatus::Analyzing, None)
            .await?
        {
            return self.current_status(event.id).await;
        }

        self.analyze(event).await
    }

    async fn resume_decision(&self, event: Event) -> Result<EventStatus, PipelineError> {
        let analysis = self
            .store
            .get_analysis(event.id)
            .await?
            .ok_or(PipelineError::MissingAnalysis(event.id))?;

        // The record is saved before the transition to dispatching: we stopped in between.
        if let Some(mut record) = self.store.get_dispatch_record(event.id).await? {
            let claim = self.try_claim(&mut record);
            // Never sent, and another trigger was notified since: this one is a duplicate.
            if claim == ResumedClaim::Taken && record.attempts == 0 {
                info!(
                    event_id = %event.id,
                    trigger_key = %record.trigger.key,
                    "trigger key taken while the event was stopped"
                );
                return self.suppress(event.id, "duplicate").await;
            }

            let claimed_at = claim.claimed_at();
            match self
                .transition(event.id, EventStatus::Analyzed, EventStatus::Dispatching, None)
                .await
            {
                Ok(true) => (),
                Ok(false) => {
                    self.release(&record, claimed_at);
                    return self.current_status(event.id).await;
                }
                Err(error) => {
                    self.release(&record, claimed_at);
                    return Err(error);
                }
            }
            return self.dispatch(event, analysis, record, claimed_at).await;
        }

        self.decide(event, analysis).await
    }

    async fn resume_dispatch(&self, event: Event) -> Result<EventStatus, PipelineError> {
        let analysis = self
            .store
            .get_analysis(event.id)
            .await?
            .ok_or(PipelineError::MissingAnalysis(event.id))?;
        let mut record = self
            .store
            .get_dispatch_record(event.id)
            .await?
            .ok_or(PipelineError::MissingDispatchRecord(event.id))?;

        if !self
            .transition(
                event.id,
                EventStatus::Dispatching,
                EventStatus::Dispatching,
                None,
            )
            .await?
        {
            return self.current_status(event.id).await;
        }

        // Past the decision: the dispatch goes ahead even if the key was taken meanwhile.
        let claimed_at = self.try_claim(&mut record).claimed_at();
        self.dispatch(event, analysis, record, claimed_at).await
    }

    /// Analyze an event in `analyzing`, reusing a persisted analysis if there is one.
    async fn analyze(&self, event: Event) -> Result<EventStatus, PipelineError> {
        let analysis = match self.store.get_analysis(event.id).await? {
            Some(analysis) => {
                info!(event_id = %event.id, "reusing persisted analysis");
                analysis
            }
            None => match self.analysis.analyze(event.id, &event.payload).await {
                Ok(result) => {
                    self.store.save_analysis(&result).await?;
                    // Analyses are immutable: keep whichever was persisted first.
                    self.store
                        .get_analysis(event.id)
                        .await?
                        .unwrap_or(result)
                }
                Err(error) => return self.analysis_failed(event.id, error).await,
            },
        };

        if !self
            .transition(event.id, EventStatus::Analyzing, EventStatus::Analyzed, None)
            .await?
        {
            return self.current_status(event.id).await;
        }

        self.decide(event, analysis).await
    }

    async fn analysis_failed(
        &self,
        event_id: EventId,
        error: AnalysisError,
    ) -> Result<EventStatus, PipelineError> {
        match error.failure_cause() {
            // Nothing is wrong with the event itself: put it back in the queue.
            None => {
                info!(event_id = %event_id, "returning event to the queue: {}", error);
                if !self
                    .transition(event_id, EventStatus::Analyzing, EventStatus::Pending, None)
                    .await?
                {
                    return self.current_status(event_id).await;
                }
                match error {
                    AnalysisError::Interrupted => Err(PipelineError::Interrupted),
                    _ => Ok(EventStatus::Pending),
                }
            }
            Some(cause) => {
                error!(event_id = %event_id, "analysis failed: {}", error);
                self.fail(event_id, EventStatus::Analyzing, cause).await
            }
        }
    }

    /// Decide whether an event in `analyzed` needs a notification, and dispatch it if so.
    async fn decide(
        &self,
        event: Event,
        analysis: AnalysisResult,
    ) -> Result<EventStatus, PipelineError> {
        if !self.policy.crosses_threshold(&analysis) {
            return self.suppress(event.id, "below_threshold").await;
        }

        let trigger = NotificationTrigger::new(&event, &analysis);
        let now = trigger.created_at;
        if !self.dedup.should_notify(&trigger.key, now) {
            info!(event_id = %event.id, trigger_key = %trigger.key, "duplicate trigger suppressed");
            return self.suppress(event.id, "duplicate").await;
        }

        let record = DispatchRecord::new(trigger);
        let entered = match self.enter_dispatch(&record).await {
            Ok(entered) => entered,
            Err(error) => {
                self.release(&record, Some(now));
                return Err(error);
            }
        };
        if !entered {
            self.release(&record, Some(now));
            return self.current_status(event.id).await;
        }

        self.dispatch(event, analysis, record, Some(now)).await
    }

    async fn enter_dispatch(&self, record: &DispatchRecord) -> Result<bool, PipelineError> {
        self.store.save_dispatch_record(record).await?;

        self.transition(
            record.event_id,
            EventStatus::Analyzed,
            EventStatus::Dispatching,
            None,
        )
        .await
    }

    /// Deliver the notification of an event in `dispatching`.
    async fn dispatch(
        &self,
        event: Event,
        analysis: AnalysisResult,
        mut record: DispatchRecord,
        claimed_at: Option<DateTime<Utc>>,
    ) -> Result<EventStatus, PipelineError> {
        let request = TriggerRequest::new(&record, &event, &analysis);

        match self.dispatcher.dispatch(&mut record, &request).await {
            Ok(_) => {
                if !self
                    .transition(
                        event.id,
                        EventStatus::Dispatching,
                        EventStatus::Notified,
                        None,
                    )
                    .await?
                {
                    return self.current_status(event.id).await;
                }
                info!(event_id = %event.id, trigger_key = %record.trigger.key, "event notified");
                Ok(EventStatus::Notified)
            }
            // The record stays pending, and the claim with it: the event will be resumed.
            Err(DispatchError::Interrupted) => Err(PipelineError::Interrupted),
            Err(DispatchError::Store(error)) => Err(error.into()),
            Err(error) => {
                self.release(&record, claimed_at);
                match error.failure_cause() {
                    Some(cause) => self.fail(event.id, EventStatus::Dispatching, cause).await,
                    None => Err(PipelineError::Interrupted),
                }
            }
        }
    }

    async fn suppress(
        &self,
        id: EventId,
        reason: &'static str,
    ) -> Result<EventStatus, PipelineError> {
        if !self
            .transition(id, EventStatus::Analyzed, EventStatus::Suppressed, None)
            .await?
        {
            return self.current_status(id).await;
        }

        metrics::counter!("monitor_events_suppressed_total", &[("reason", reason)]).increment(1);
        Ok(EventStatus::Suppressed)
    }

    async fn fail(
        &self,
        id: EventId,
        from: EventStatus,
        cause: FailureCause,
    ) -> Result<EventStatus, PipelineError> {
        if !self
            .transition(id, from, EventStatus::Failed, Some(cause))
            .await?
        {
            return self.current_status(id).await;
        }

        Ok(EventStatus::Failed)
    }

    /// Find or renew the dedup claim of a resumed trigger. A renewed claim is recorded as the
    /// trigger time, and persisted with the record before the next attempt.
    fn try_claim(&self, record: &mut DispatchRecord) -> ResumedClaim {
        if record.outcome != DispatchOutcome::Pending {
            return ResumedClaim::NotNeeded;
        }

        let key = &record.trigger.key;
        if self.dedup.holds(key, record.trigger.created_at) {
            return ResumedClaim::Held(record.trigger.created_at);
        }

        let now = Utc::now().trunc_subsecs(6);
        if self.dedup.should_notify(key, now) {
            record.trigger.created_at = now;
            ResumedClaim::Held(now)
        } else {
            ResumedClaim::Taken
        }
    }

    fn release(&self, record: &DispatchRecord, claimed_at: Option<DateTime<Utc>>) {
        if let Some(claimed_at) = claimed_at {
            self.dedup.release(&record.trigger.key, claimed_at);
        }
    }

    async fn transition(
        &self,
        id: EventId,
        from: EventStatus,
        to: EventStatus,
        cause: Option<FailureCause>,
    ) -> Result<bool, PipelineError> {
        let applied = self.store.update_status(id, from, to, cause).await?;

        if applied {
            if from != to {
                metrics::counter!(
                    "monitor_events_transitions_total",
                    &[("from", from.as_str()), ("to", to.as_str())]
                )
                .increment(1);
            }
        } else {
            warn!(event_id = %id, "event is no longer {}, leaving it alone", from);
        }

        Ok(applied)
    }

    async fn current_status(&self, id: EventId) -> Result<EventStatus, PipelineError> {
        Ok(self.store.get(id).await?.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use monitor_common::event::{FailureKind, NewEvent};
    use monitor_common::retry::RetryPolicy;
    use monitor_common::store::MemoryEventStore;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use crate::analysis::AnalysisSettings;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::dispatcher::DispatchSettings;
    use crate::test_utils::{EngineReply, OracleReply, ScriptedEngine, ScriptedOracle};

    struct Harness {
        store: Arc<MemoryEventStore>,
        oracle: Arc<ScriptedOracle>,
        engine: Arc<ScriptedEngine>,
        pipeline: Pipeline,
        shutdown: CancellationToken,
    }

    fn harness(oracle: ScriptedOracle, engine: ScriptedEngine) -> Harness {
        let store = Arc::new(MemoryEventStore::new());
        let oracle = Arc::new(oracle);
        let engine = Arc::new(engine);
        let shutdown = CancellationToken::new();

        let analysis = AnalysisClient::new(
            oracle.clone(),
            AnalysisSettings {
                timeout: Duration::from_secs(1),
                max_retries: 1,
                retry_policy: RetryPolicy::build(1, Duration::from_millis(1)).provide(),
                circuit_breaker: CircuitBreakerConfig {
                    failure_threshold: 2,
                    failure_window: Duration::from_secs(60),
                    open_duration: Duration::from_secs(30),
                },
            },
            shutdown.clone(),
        );
        let dispatcher = NotificationDispatcher::new(
            engine.clone(),
            store.clone(),
            DispatchSettings {
                max_attempts: 3,
                retry_policy: RetryPolicy::build(1, Duration::from_millis(1)).provide(),
            },
            shutdown.clone(),
        );
        let pipeline = Pipeline::new(
            store.clone(),
            analysis,
            NotificationPolicy::default(),
            Deduplicator::in_memory(Duration::from_secs(15 * 60)),
            dispatcher,
        );

        Harness {
            store,
            oracle,
            engine,
            pipeline,
            shutdown,
        }
    }

    async fn pending(store: &MemoryEventStore, source: &str, payload: &str) -> Event {
        let id = store.append(NewEvent::new(source, payload)).await.unwrap();
        store.get(id).await.unwrap()
    }

    #[tokio::test]
    async fn test_below_threshold_is_suppressed() {
        let h = harness(
            ScriptedOracle::new(OracleReply::classify("positive", 0.95)),
            ScriptedEngine::new(EngineReply::Accept),
        );
        let event = pending(&h.store, "reviews", "great service!").await;

        let status = h.pipeline.process(event.clone()).await.unwrap();

        assert_eq!(status, EventStatus::Suppressed);
        assert_eq!(h.store.get(event.id).await.unwrap().status, EventStatus::Suppressed);
        assert!(h.store.get_analysis(event.id).await.unwrap().is_some());
        assert!(h.store.get_dispatch_record(event.id).await.unwrap().is_none());
        assert_eq!(h.engine.calls(), 0);
    }

    #[tokio::test]
    async fn test_crossing_threshold_is_notified() {
        let h = harness(
            ScriptedOracle::new(OracleReply::classify("critical", 0.9)),
            ScriptedEngine::new(EngineReply::Accept),
        );
        let event = pending(&h.store, "status-page", "outage detected").await;

        let status = h.pipeline.process(event.clone()).await.unwrap();

        assert_eq!(status, EventStatus::Notified);
        let record = h.store.get_dispatch_record(event.id).await.unwrap().unwrap();
        assert_eq!(record.outcome, DispatchOutcome::Delivered);
        assert_eq!(record.trigger.key.as_str(), "status-page:critical");
        assert_eq!(h.engine.runs(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_trigger_is_suppressed() {
        let h = harness(
            ScriptedOracle::new(OracleReply::classify("critical", 0.9)),
            ScriptedEngine::new(EngineReply::Accept),
        );
        let first = pending(&h.store, "status-page", "outage detected").await;
        let second = pending(&h.store, "status-page", "outage still ongoing").await;

        assert_eq!(h.pipeline.process(first).await.unwrap(), EventStatus::Notified);
        assert_eq!(
            h.pipeline.process(second.clone()).await.unwrap(),
            EventStatus::Suppressed
        );
        assert!(h.store.get_dispatch_record(second.id).await.unwrap().is_none());
        assert_eq!(h.engine.calls(), 1);
    }

    #[tokio::test]
    async fn test_rejected_analysis_fails_the_event() {
        let h = harness(
            ScriptedOracle::new(OracleReply::Rejected),
            ScriptedEngine::new(EngineReply::Accept),
        );
        let event = pending(&h.store, "status-page", "outage detected").await;

        assert_eq!(
            h.pipeline.process(event.clone()).await.unwrap(),
            EventStatus::Failed
        );
        let stored = h.store.get(event.id).await.unwrap();
        assert_eq!(
            stored.error.map(|cause| cause.kind),
            Some(FailureKind::OracleRejected)
        );
    }

    #[tokio::test]
    async fn test_open_circuit_returns_the_event_to_the_queue() {
        let h = harness(
            ScriptedOracle::new(OracleReply::Unavailable),
            ScriptedEngine::new(EngineReply::Accept),
        );
        let first = pending(&h.store, "status-page", "outage detected").await;
        let second = pending(&h.store, "status-page", "outage detected").await;

        // Two calls, which also open the circuit.
        assert_eq!(h.pipeline.process(first).await.unwrap(), EventStatus::Failed);
        assert_eq!(h.oracle.calls(), 2);

        assert_eq!(
            h.pipeline.process(second.clone()).await.unwrap(),
            EventStatus::Pending
        );
        let stored = h.store.get(second.id).await.unwrap();
        assert_eq!(stored.status, EventStatus::Pending);
        assert_eq!(stored.error, None);
        assert_eq!(h.oracle.calls(), 2);
    }

    #[tokio::test]
    async fn test_failed_dispatch_releases_the_dedup_claim() {
        let h = harness(
            ScriptedOracle::new(OracleReply::classify("critical", 0.9)),
            ScriptedEngine::new(EngineReply::Accept),
        );
        h.engine.push(EngineReply::Rejected);
        let first = pending(&h.store, "status-page", "outage detected").await;
        let second = pending(&h.store, "status-page", "outage detected").await;

        assert_eq!(
            h.pipeline.process(first.clone()).await.unwrap(),
            EventStatus::Failed
        );
        let stored = h.store.get(first.id).await.unwrap();
        assert_eq!(
            stored.error.map(|cause| cause.kind),
            Some(FailureKind::WorkflowRejected)
        );
        let record = h.store.get_dispatch_record(first.id).await.unwrap().unwrap();
        assert_eq!(record.outcome, DispatchOutcome::Rejected);

        assert_eq!(
            h.pipeline.process(second).await.unwrap(),
            EventStatus::Notified
        );
    }

    #[tokio::test]
    async fn test_claimed_event_is_left_alone() {
        let h = harness(
            ScriptedOracle::new(OracleReply::classify("critical", 0.9)),
            ScriptedEngine::new(EngineReply::Accept),
        );
        let event = pending(&h.store, "status-page", "outage detected").await;
        h.store
            .update_status(event.id, EventStatus::Pending, EventStatus::Analyzing, None)
            .await
            .unwrap();

        // A stale copy that still reads pending.
        let status = h.pipeline.process(event).await.unwrap();

        assert_eq!(status, EventStatus::Analyzing);
        assert_eq!(h.oracle.calls(), 0);
    }

    #[tokio::test]
    async fn test_store_outage_never_fails_the_event() {
        let h = harness(
            ScriptedOracle::new(OracleReply::classify("critical", 0.9)),
            ScriptedEngine::new(EngineReply::Accept),
        );
        let event = pending(&h.store, "status-page", "outage detected").await;
        h.store.set_unavailable(true);

        let error = h.pipeline.process(event.clone()).await.unwrap_err();
        assert!(matches!(error, PipelineError::Store(_)));

        h.store.set_unavailable(false);
        assert_eq!(h.store.get(event.id).await.unwrap().status, EventStatus::Pending);
        assert_eq!(h.pipeline.process(event).await.unwrap(), EventStatus::Notified);
    }

    #[tokio::test]
    async fn test_resumed_analyzed_event_with_record_is_dispatched() {
        let h = harness(
            ScriptedOracle::new(OracleReply::classify("critical", 0.9)),
            ScriptedEngine::new(EngineReply::Accept),
        );
        let event = pending(&h.store, "status-page", "outage detected").await;
        let analysis = AnalysisResult::new(
            event.id,
            "critical",
            0.9,
            json!({"label": "critical", "confidence": 0.9}),
        );
        h.store.save_analysis(&analysis).await.unwrap();
        let record = DispatchRecord::new(NotificationTrigger::new(&event, &analysis));
        h.store.save_dispatch_record(&record).await.unwrap();
        h.store.force_status(event.id, EventStatus::Analyzed, Utc::now());

        let event = h.store.get(event.id).await.unwrap();
        assert_eq!(h.pipeline.process(event).await.unwrap(), EventStatus::Notified);
        assert_eq!(h.oracle.calls(), 0);
        assert_eq!(h.engine.requests()[0].idempotency_key, record.idempotency_key);
    }

    #[tokio::test]
    async fn test_resumed_trigger_is_suppressed_when_its_key_was_taken() {
        let h = harness(
            ScriptedOracle::new(OracleReply::classify("critical", 0.9)),
            ScriptedEngine::new(EngineReply::Accept),
        );
        let first = pending(&h.store, "status-page", "outage detected").await;
        let second = pending(&h.store, "status-page", "outage still ongoing").await;
        h.store
            .fail_next_transition(EventStatus::Analyzed, EventStatus::Dispatching);

        let error = h.pipeline.process(first.clone()).await.unwrap_err();
        assert!(matches!(error, PipelineError::Store(_)));
        assert_eq!(h.store.get(first.id).await.unwrap().status, EventStatus::Analyzed);
        assert!(h.store.get_dispatch_record(first.id).await.unwrap().is_some());

        // Claims are told apart by their time.
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(h.pipeline.process(second).await.unwrap(), EventStatus::Notified);

        let first = h.store.get(first.id).await.unwrap();
        assert_eq!(h.pipeline.process(first).await.unwrap(), EventStatus::Suppressed);
        assert_eq!(h.engine.calls(), 1);
        assert_eq!(h.engine.runs(), 1);
    }

    #[tokio::test]
    async fn test_resumed_trigger_is_dispatched_when_its_key_is_free() {
        let h = harness(
            ScriptedOracle::new(OracleReply::classify("critical", 0.9)),
            ScriptedEngine::new(EngineReply::Accept),
        );
        let event = pending(&h.store, "status-page", "outage detected").await;
        h.store
            .fail_next_transition(EventStatus::Analyzed, EventStatus::Dispatching);

        assert!(h.pipeline.process(event.clone()).await.is_err());

        let event = h.store.get(event.id).await.unwrap();
        assert_eq!(h.pipeline.process(event).await.unwrap(), EventStatus::Notified);
        assert_eq!(h.oracle.calls(), 1);
        assert_eq!(h.engine.runs(), 1);
    }

    #[tokio::test]
    async fn test_failed_resumed_dispatch_releases_its_own_claim() {
        let h = harness(
            ScriptedOracle::new(OracleReply::classify("critical", 0.9)),
            ScriptedEngine::new(EngineReply::Accept),
        );
        h.engine.push(EngineReply::Rejected);
        let first = pending(&h.store, "status-page", "outage detected").await;
        let second = pending(&h.store, "status-page", "outage still ongoing").await;
        let analysis = AnalysisResult::new(
            first.id,
            "critical",
            0.9,
            json!({"label": "critical", "confidence": 0.9}),
        );
        h.store.save_analysis(&analysis).await.unwrap();
        let record = DispatchRecord::new(NotificationTrigger::new(&first, &analysis));
        h.store.save_dispatch_record(&record).await.unwrap();
        h.store
            .force_status(first.id, EventStatus::Dispatching, Utc::now());
        // The claim made when the event was first decided.
        assert!(h
            .pipeline
            .deduplicator()
            .should_notify(&record.trigger.key, record.trigger.created_at));

        let first = h.store.get(first.id).await.unwrap();
        assert_eq!(h.pipeline.process(first).await.unwrap(), EventStatus::Failed);

        assert_eq!(h.pipeline.process(second).await.unwrap(), EventStatus::Notified);
        assert_eq!(h.engine.runs(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_during_analysis_sends_nothing() {
        let h = harness(
            ScriptedOracle::new(OracleReply::classify("critical", 0.9))
                .with_delay(Duration::from_millis(200)),
            ScriptedEngine::new(EngineReply::Accept),
        );
        let event = pending(&h.store, "status-page", "outage detected").await;
        let cancel = h.shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let error = h.pipeline.process(event.clone()).await.unwrap_err();

        assert!(matches!(error, PipelineError::Interrupted));
        assert_eq!(h.oracle.calls(), 1);
        assert_eq!(h.engine.calls(), 0);
        assert_eq!(
            h.store.get(event.id).await.unwrap().status,
            EventStatus::Dispatching
        );
        let record = h.store.get_dispatch_record(event.id).await.unwrap().unwrap();
        assert_eq!(record.outcome, DispatchOutcome::Pending);
        assert_eq!(record.attempts, 0);
    }
}
