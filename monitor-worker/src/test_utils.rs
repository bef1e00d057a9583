//! Scripted collaborators for tests of the worker and of crates embedding it.
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use monitor_common::event::IdempotencyKey;
use serde_json::{json, Value};

use crate::analysis::AnalysisOracle;
use crate::dispatcher::{TriggerRequest, WorkflowEngine};
use crate::error::{AnalysisError, DispatchError};

#[derive(Debug, Clone)]
pub enum OracleReply {
    /// Answer with this body.
    Raw(Value),
    Unavailable,
    Rejected,
    /// Never answer.
    Hang,
}

impl OracleReply {
    pub fn classify(label: &str, confidence: f64) -> Self {
        OracleReply::Raw(json!({ "label": label, "confidence": confidence }))
    }
}

/// An `AnalysisOracle` answering from a script: queued replies first, then the first rule whose
/// pattern appears in the payload, then the fallback.
pub struct ScriptedOracle {
    queue: Mutex<VecDeque<OracleReply>>,
    rules: Mutex<Vec<(String, OracleReply)>>,
    fallback: OracleReply,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedOracle {
    pub fn new(fallback: OracleReply) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            rules: Mutex::new(Vec::new()),
            fallback,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Wait this long before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_rule(self, pattern: &str, reply: OracleReply) -> Self {
        self.rules
            .lock()
            .unwrap()
            .push((pattern.to_owned(), reply));
        self
    }

    pub fn push(&self, reply: OracleReply) {
        self.queue.lock().unwrap().push_back(reply);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_reply(&self, payload: &str) -> OracleReply {
        if let Some(reply) = self.queue.lock().unwrap().pop_front() {
            return reply;
        }

        self.rules
            .lock()
            .unwrap()
            .iter()
            .find(|(pattern, _)| payload.contains(pattern.as_str()))
            .map(|(_, reply)| reply.clone())
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl AnalysisOracle for ScriptedOracle {
    async fn classify(&self, payload: &str) -> Result<Value, AnalysisError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match self.next_reply(payload) {
            OracleReply::Raw(value) => Ok(value),
            OracleReply::Unavailable => Err(AnalysisError::unavailable("503 Service Unavailable")),
            OracleReply::Rejected => Err(AnalysisError::OracleRejected(
                "400 Bad Request".to_owned(),
            )),
            OracleReply::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(AnalysisError::unavailable("hung up"))
            }
        }
    }

    fn endpoint(&self) -> &str {
        "scripted-oracle"
    }
}

#[derive(Debug, Clone)]
pub enum EngineReply {
    Accept,
    Unavailable,
    /// Unavailable, asking to retry after the given delay.
    Throttled(Duration),
    Rejected,
}

/// A `WorkflowEngine` answering from a script, that records every request and honors
/// idempotency keys: an accepted key never starts a second run.
pub struct ScriptedEngine {
    queue: Mutex<VecDeque<EngineReply>>,
    fallback: EngineReply,
    delay: Option<Duration>,
    requests: Mutex<Vec<TriggerRequest>>,
    runs: Mutex<HashSet<IdempotencyKey>>,
}

impl ScriptedEngine {
    pub fn new(fallback: EngineReply) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            fallback,
            delay: None,
            requests: Mutex::new(Vec::new()),
            runs: Mutex::new(HashSet::new()),
        }
    }

    /// Wait this long before answering each request.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push(&self, reply: EngineReply) {
        self.queue.lock().unwrap().push_back(reply);
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<TriggerRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Number of workflow runs started, one per distinct accepted idempotency key.
    pub fn runs(&self) -> usize {
        self.runs.lock().unwrap().len()
    }
}

#[async_trait]
impl WorkflowEngine for ScriptedEngine {
    async fn trigger(&self, request: &TriggerRequest) -> Result<(), DispatchError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let reply = self
            .queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match reply {
            EngineReply::Accept => {
                self.runs.lock().unwrap().insert(request.idempotency_key);
                Ok(())
            }
            EngineReply::Unavailable => Err(DispatchError::unavailable("502 Bad Gateway")),
            EngineReply::Throttled(retry_after) => Err(DispatchError::WorkflowUnavailable {
                reason: "429 Too Many Requests".to_owned(),
                retry_after: Some(retry_after),
            }),
            EngineReply::Rejected => Err(DispatchError::WorkflowRejected(
                "400 Bad Request".to_owned(),
            )),
        }
    }
}
