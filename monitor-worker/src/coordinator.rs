//! # Coordinator
//!
//! Feeds events to the `Pipeline` with bounded concurrency. Two loops share one worker pool:
//! the pickup loop claims `pending` events oldest first, and the recovery loop re-drives events
//! that were left in an intermediate stage, typically by a crash.
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use monitor_common::event::{Event, EventId, EventStatus};
use monitor_common::health::HealthHandle;
use monitor_common::store::StoreError;
use tokio::sync::Semaphore;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::PipelineError;
use crate::pipeline::Pipeline;

/// Statuses an event can be left in when processing stops midway.
const RESUMABLE_STATUSES: [EventStatus; 3] = [
    EventStatus::Analyzing,
    EventStatus::Analyzed,
    EventStatus::Dispatching,
];

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub name: String,
    pub poll_interval: Duration,
    pub dequeue_batch_size: u32,
    pub max_concurrent_jobs: usize,
    /// Events whose last transition is older than this are considered abandoned.
    pub stale_threshold: Duration,
    pub recovery_interval: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            name: "monitor-worker".to_owned(),
            poll_interval: Duration::from_millis(100),
            dequeue_batch_size: 100,
            max_concurrent_jobs: 16,
            stale_threshold: Duration::from_secs(300),
            recovery_interval: Duration::from_secs(60),
        }
    }
}

/// Removes an event from the in-flight set when its task ends, even by panic.
struct InFlightGuard {
    id: EventId,
    in_flight: Arc<DashMap<EventId, Instant>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.id);
    }
}

pub struct PipelineCoordinator {
    pipeline: Arc<Pipeline>,
    settings: CoordinatorSettings,
    semaphore: Arc<Semaphore>,
    /// Events with a live task in this process, and when it started.
    in_flight: Arc<DashMap<EventId, Instant>>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl PipelineCoordinator {
    pub fn new(
        pipeline: Arc<Pipeline>,
        settings: CoordinatorSettings,
        shutdown: CancellationToken,
    ) -> Self {
        let permits = settings.max_concurrent_jobs.max(1);

        Self {
            pipeline,
            settings,
            semaphore: Arc::new(Semaphore::new(permits)),
            in_flight: Arc::new(DashMap::new()),
            tasks: TaskTracker::new(),
            shutdown,
        }
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_in_flight(&self, id: EventId) -> bool {
        self.in_flight.contains_key(&id)
    }

    /// Claim and process pending events until shutdown is requested, then wait for the events
    /// in flight.
    pub async fn run(&self, liveness: HealthHandle) {
        let mut interval = tokio::time::interval(self.settings.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let batch_size_histogram = metrics::histogram!("monitor_dequeue_batch_size");

        info!("{} started picking up events", self.settings.name);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => (),
            }

            liveness.report_healthy();
            self.report_saturation();

            match self.poll_once().await {
                Ok(0) => (),
                Ok(spawned) => batch_size_histogram.record(spawned as f64),
                Err(error) => error!("error while listing pending events: {}", error),
            }
        }

        info!(
            "{} stopped picking up events, waiting for {} in flight",
            self.settings.name,
            self.in_flight()
        );
        self.drain().await;
    }

    /// List pending events and spawn a task for each, up to the free capacity of the pool.
    /// Returns how many tasks were spawned.
    pub async fn poll_once(&self) -> Result<usize, StoreError> {
        // Every claim would be returned to the queue without reaching the oracle.
        if !self.pipeline.analysis().is_accepting() {
            debug!("oracle circuit is open, not picking up events");
            return Ok(0);
        }

        let capacity = self
            .semaphore
            .available_permits()
            .min(self.settings.dequeue_batch_size as usize);
        if capacity == 0 {
            return Ok(0);
        }

        // Events spawned but not claimed yet are still listed as pending.
        let events = self
            .pipeline
            .store()
            .list_by_status(EventStatus::Pending, capacity + self.in_flight())
            .await?;

        let mut spawned = 0;
        for event in events {
            if spawned == capacity {
                break;
            }
            if self.spawn(event).await {
                spawned += 1;
            }
        }

        Ok(spawned)
    }

    /// Re-drive events left in an intermediate stage until shutdown is requested. The first
    /// round runs immediately, which covers recovery at startup.
    pub async fn run_recovery(&self, liveness: HealthHandle) {
        let mut interval = tokio::time::interval(self.settings.recovery_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => (),
            }

            liveness.report_healthy();

            match self.recover_once().await {
                Ok(0) => (),
                Ok(recovered) => info!("re-driving {} stale events", recovered),
                Err(error) => error!("error while listing stale events: {}", error),
            }

            let purged = self.pipeline.deduplicator().purge_expired(Utc::now());
            if purged > 0 {
                debug!("purged {} expired dedup entries", purged);
            }
        }
    }

    /// Spawn a task for every stale event not already in flight here. Returns how many tasks
    /// were spawned.
    pub async fn recover_once(&self) -> Result<usize, StoreError> {
        let Some(older_than) = chrono::Duration::from_std(self.settings.stale_threshold)
            .ok()
            .and_then(|threshold| Utc::now().checked_sub_signed(threshold))
        else {
            return Ok(0);
        };
        let limit = self.settings.dequeue_batch_size as usize;

        let mut recovered = 0;
        for status in RESUMABLE_STATUSES {
            let events = self
                .pipeline
                .store()
                .list_stale(status, older_than, limit)
                .await?;

            for event in events {
                let event_id = event.id;
                if self.spawn(event).await {
                    warn!(event_id = %event_id, "re-driving event stuck in {}", status);
                    metrics::counter!(
                        "monitor_events_recovered_total",
                        &[("status", status.as_str())]
                    )
                    .increment(1);
                    recovered += 1;
                }
            }
        }

        Ok(recovered)
    }

    /// Wait for every spawned task to finish.
    pub async fn drain(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// Spawn a task processing `event`, waiting for a free worker. Returns false if the event is
    /// already in flight or shutdown was requested.
    async fn spawn(&self, event: Event) -> bool {
        if self.shutdown.is_cancelled() || self.is_in_flight(event.id) {
            return false;
        }

        let permit = tokio::select! {
            _ = self.shutdown.cancelled() => return false,
            permit = self.semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return false,
            },
        };

        match self.in_flight.entry(event.id) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(entry) => {
                entry.insert(Instant::now());
            }
        }
        let guard = InFlightGuard {
            id: event.id,
            in_flight: self.in_flight.clone(),
        };
        let pipeline = self.pipeline.clone();

        self.tasks.spawn(async move {
            // Held until the task ends.
            let _permit = permit;
            let _guard = guard;
            let event_id = event.id;

            match pipeline.process(event).await {
                Ok(status) => debug!(event_id = %event_id, "event left {}", status),
                Err(PipelineError::Interrupted) => {
                    info!(event_id = %event_id, "event processing interrupted by shutdown")
                }
                Err(error) => warn!(
                    event_id = %event_id,
                    "event processing stopped, it will be picked up again: {}", error
                ),
            }
        });

        true
    }

    fn report_saturation(&self) {
        let total = self.settings.max_concurrent_jobs.max(1);
        metrics::gauge!("monitor_worker_saturation_percent")
            .set(1f64 - self.semaphore.available_permits() as f64 / total as f64);
    }
}
