//! # Health
//!
//! Liveness reporting for the long running loops of the worker. The pickup loop, the recovery
//! loop and the source poller each hold a `HealthHandle` and report on every tick. The process
//! is healthy while every registered loop reported within its deadline.
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use time::OffsetDateTime;
use tracing::warn;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Registered, never reported.
    Starting,
    /// Reported healthy, must report again before the deadline.
    HealthyUntil(OffsetDateTime),
    Unhealthy,
    /// Missed its deadline.
    Stalled,
}

impl ComponentStatus {
    /// The status as of `now`: a passed deadline turns into `Stalled`.
    fn at(self, now: OffsetDateTime) -> Self {
        match self {
            ComponentStatus::HealthyUntil(until) if until <= now => ComponentStatus::Stalled,
            status => status,
        }
    }

    fn is_healthy(&self) -> bool {
        matches!(self, ComponentStatus::HealthyUntil(_))
    }
}

/// Result of a health check, renders as 200 or 500 with the status of each component.
#[derive(Debug, Default)]
pub struct HealthStatus {
    pub healthy: bool,
    pub components: BTreeMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let code = if self.healthy {
            StatusCode::OK
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };

        (code, format!("{:?}", self.components)).into_response()
    }
}

/// Handed to a loop so it can report its own status.
#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: time::Duration,
    components: Arc<DashMap<String, ComponentStatus>>,
}

impl HealthHandle {
    /// Must be called more often than the deadline given at registration.
    pub fn report_healthy(&self) {
        let until = OffsetDateTime::now_utc().saturating_add(self.deadline);
        self.report_status(ComponentStatus::HealthyUntil(until));
    }

    pub fn report_status(&self, status: ComponentStatus) {
        self.components.insert(self.component.clone(), status);
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<DashMap<String, ComponentStatus>>,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Arc::new(DashMap::new()),
        }
    }

    /// Register a component that must report at least once per `deadline`.
    pub fn register(&self, component: &str, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component: component.to_owned(),
            deadline: time::Duration::try_from(deadline).unwrap_or(time::Duration::MAX),
            components: self.components.clone(),
        };
        handle.report_status(ComponentStatus::Starting);
        handle
    }

    /// Overall status, healthy only if at least one component is registered and all are
    /// healthy. Can be used as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let now = OffsetDateTime::now_utc();
        let components: BTreeMap<_, _> = self
            .components
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().at(now)))
            .collect();
        let healthy = !components.is_empty() && components.values().all(|s| s.is_healthy());

        if !healthy {
            warn!("{} health check failed: {:?}", self.name, components);
        }

        HealthStatus {
            healthy,
            components,
        }
    }
}
