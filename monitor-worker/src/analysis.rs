//! # Analysis
//!
//! Classification of event payloads by the external analysis oracle.
//!
//! `AnalysisClient::analyze` is a single call from the caller's point of view: it enforces a
//! per-call timeout, retries calls that failed because the oracle could not be reached and
//! fails fast while the circuit breaker in front of the oracle is open.
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use monitor_common::event::{AnalysisResult, EventId};
use monitor_common::retry::RetryPolicy;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::error::{AnalysisError, WorkerError};
use crate::http::{build_http_client, is_retryable_status, response_excerpt};

/// Boundary of the analysis oracle. Implementations make exactly one request per call and
/// return the response body undecoded.
#[async_trait]
pub trait AnalysisOracle: Send + Sync {
    async fn classify(&self, payload: &str) -> Result<Value, AnalysisError>;

    /// Identifies the endpoint for logs and the circuit breaker name.
    fn endpoint(&self) -> &str;
}

/// An `AnalysisOracle` reached over HTTP: a JSON POST of `{"text": payload}` answered with
/// `{"label": str, "confidence": float}`.
pub struct HttpOracle {
    client: reqwest::Client,
    url: reqwest::Url,
    api_key: Option<String>,
}

impl HttpOracle {
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
impl AnalysisOracle for HttpOracle {
    async fn classify(&self, payload: &str) -> Result<Value, AnalysisError> {
        let mut request = self
            .client
            .post(self.url.clone())
            .json(&json!({ "text": payload }));
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|error| AnalysisError::unavailable(&error.to_string()))?;

        let status = response.status();
        if is_retryable_status(status) {
            return Err(AnalysisError::unavailable(&format!(
                "{}: {}",
                status,
                response_excerpt(response).await
            )));
        }
        if !status.is_success() {
            return Err(AnalysisError::OracleRejected(format!(
                "{}: {}",
                status,
                response_excerpt(response).await
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|error| AnalysisError::unavailable(&error.to_string()))?;

        serde_json::from_str(&body)
            .map_err(|error| AnalysisError::OracleMalformed(format!("invalid JSON body: {}", error)))
    }

    fn endpoint(&self) -> &str {
        self.url.as_str()
    }
}

/// Settings of an `AnalysisClient`.
#[derive(Debug, Clone)]
pub struct AnalysisSettings {
    pub timeout: Duration,
    /// Retries after the first call. Only unavailable errors are retried.
    pub max_retries: u32,
    pub retry_policy: RetryPolicy,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_policy: RetryPolicy::build(2, Duration::from_millis(500))
                .maximum_interval(Duration::from_secs(10))
                .jitter(0.2)
                .provide(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

pub struct AnalysisClient {
    oracle: Arc<dyn AnalysisOracle>,
    breaker: CircuitBreaker,
    settings: AnalysisSettings,
    shutdown: CancellationToken,
}

impl AnalysisClient {
    pub fn new(
        oracle: Arc<dyn AnalysisOracle>,
        settings: AnalysisSettings,
        shutdown: CancellationToken,
    ) -> Self {
        let breaker = CircuitBreaker::new(oracle.endpoint(), settings.circuit_breaker);

        Self {
            oracle,
            breaker,
            settings,
            shutdown,
        }
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Whether a call made now would reach the oracle, rather than fail on the open circuit.
    pub fn is_accepting(&self) -> bool {
        self.breaker.is_accepting(Instant::now())
    }

    /// Classify the payload of an event, retrying while the oracle is unreachable.
    ///
    /// Returns `AnalysisError::Interrupted` without calling the oracle once shutdown is
    /// requested, including while waiting to retry.
    pub async fn analyze(
        &self,
        event_id: EventId,
        payload: &str,
    ) -> Result<AnalysisResult, AnalysisError> {
        let mut attempt: u32 = 0;

        loop {
            if self.shutdown.is_cancelled() {
                return Err(AnalysisError::Interrupted);
            }
            attempt += 1;

            match self.call_once(event_id, payload).await {
                Ok(result) => return Ok(result),
                Err(error) if error.is_retryable() && attempt <= self.settings.max_retries => {
                    let interval = self.settings.retry_policy.jittered_interval(attempt, None);
                    warn!(
                        event_id = %event_id,
                        attempt,
                        "oracle call failed, retrying in {:?}: {}",
                        interval,
                        error
                    );
                    metrics::counter!("monitor_oracle_retries_total").increment(1);

                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Err(AnalysisError::Interrupted),
                        _ = tokio::time::sleep(interval) => (),
                    }
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn call_once(
        &self,
        event_id: EventId,
        payload: &str,
    ) -> Result<AnalysisResult, AnalysisError> {
        if !self.breaker.allow(Instant::now()) {
            metrics::counter!("monitor_oracle_calls_total", &[("result", "circuit_open")])
                .increment(1);
            return Err(AnalysisError::circuit_open());
        }

        let start = Instant::now();
        let outcome = match tokio::time::timeout(self.settings.timeout, self.oracle.classify(payload))
            .await
        {
            Ok(outcome) => outcome.and_then(|raw| parse_oracle_response(event_id, raw)),
            Err(_) => Err(AnalysisError::unavailable(&format!(
                "timed out after {:?}",
                self.settings.timeout
            ))),
        };
        let now = Instant::now();
        metrics::histogram!("monitor_oracle_call_duration_seconds")
            .record(now.duration_since(start).as_secs_f64());

        match &outcome {
            Ok(result) => {
                debug!(event_id = %event_id, label = %result.label, "oracle classified event");
                self.breaker.record_success(now);
            }
            Err(AnalysisError::OracleUnavailable { .. }) => self.breaker.record_failure(now),
            // The oracle answered, so it is reachable.
            Err(_) => self.breaker.record_success(now),
        }

        let result_label = match &outcome {
            Ok(_) => "ok",
            Err(error) => error.kind(),
        };
        metrics::counter!("monitor_oracle_calls_total", &[("result", result_label)]).increment(1);

        outcome
    }
}

/// Validate an oracle response: a non-empty `label` and a `confidence` within [0.0, 1.0].
pub fn parse_oracle_response(event_id: EventId, raw: Value) -> Result<AnalysisResult, AnalysisError> {
    let label = match raw.get("label").and_then(Value::as_str).map(str::trim) {
        Some(label) if !label.is_empty() => label.to_owned(),
        _ => {
            return Err(AnalysisError::OracleMalformed(
                "missing or empty label".to_owned(),
            ))
        }
    };

    let confidence = match raw.get("confidence").and_then(Value::as_f64) {
        Some(confidence) if (0.0..=1.0).contains(&confidence) => confidence,
        Some(confidence) => {
            return Err(AnalysisError::OracleMalformed(format!(
                "confidence {} is out of range",
                confidence
            )))
        }
        None => {
            return Err(AnalysisError::OracleMalformed(
                "missing confidence".to_owned(),
            ))
        }
    };

    Ok(AnalysisResult::new(event_id, &label, confidence, raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{OracleReply, ScriptedOracle};
    use httpmock::prelude::*;

    fn settings(max_retries: u32) -> AnalysisSettings {
        AnalysisSettings {
            timeout: Duration::from_millis(200),
            max_retries,
            retry_policy: RetryPolicy::build(1, Duration::from_millis(1)).provide(),
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 5,
                failure_window: Duration::from_secs(60),
                open_duration: Duration::from_secs(30),
            },
        }
    }

    fn client(oracle: Arc<ScriptedOracle>, max_retries: u32) -> AnalysisClient {
        AnalysisClient::new(oracle, settings(max_retries), CancellationToken::new())
    }

    #[test]
    fn test_parse_oracle_response() {
        let result =
            parse_oracle_response(EventId(1), json!({"label": "critical", "confidence": 0.9}))
                .unwrap();
        assert_eq!(result.label, "critical");
        assert_eq!(result.confidence, 0.9);
        assert_eq!(result.raw_response["label"], "critical");

        for raw in [
            json!({"confidence": 0.9}),
            json!({"label": "", "confidence": 0.9}),
            json!({"label": "critical"}),
            json!({"label": "critical", "confidence": "high"}),
            json!({"label": "critical", "confidence": 1.5}),
            json!({"label": "critical", "confidence": -0.1}),
            json!(["critical", 0.9]),
        ] {
            assert!(matches!(
                parse_oracle_response(EventId(1), raw),
                Err(AnalysisError::OracleMalformed(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_analyze_returns_the_classification() {
        let oracle = Arc::new(ScriptedOracle::new(OracleReply::classify("positive", 0.95)));
        let client = client(oracle.clone(), 3);

        let result = client.analyze(EventId(3), "great service!").await.unwrap();

        assert_eq!(result.event_id, EventId(3));
        assert_eq!(result.label, "positive");
        assert_eq!(oracle.calls(), 1);
    }

    #[tokio::test]
    async fn test_analyze_retries_unavailable_then_succeeds() {
        let oracle = Arc::new(ScriptedOracle::new(OracleReply::classify("critical", 0.9)));
        oracle.push(OracleReply::Unavailable);
        oracle.push(OracleReply::Unavailable);
        let client = client(oracle.clone(), 3);

        let result = client.analyze(EventId(1), "outage detected").await.unwrap();

        assert_eq!(result.label, "critical");
        assert_eq!(oracle.calls(), 3);
    }

    #[tokio::test]
    async fn test_analyze_gives_up_after_max_retries() {
        let oracle = Arc::new(ScriptedOracle::new(OracleReply::Unavailable));
        let client = client(oracle.clone(), 3);

        let error = client.analyze(EventId(1), "outage detected").await.unwrap_err();

        assert!(matches!(
            error,
            AnalysisError::OracleUnavailable {
                circuit_open: false,
                ..
            }
        ));
        assert_eq!(oracle.calls(), 4);
    }

    #[tokio::test]
    async fn test_analyze_never_retries_rejected_or_malformed() {
        let oracle = Arc::new(ScriptedOracle::new(OracleReply::Rejected));
        let client = client(oracle.clone(), 3);
        assert!(matches!(
            client.analyze(EventId(1), "x").await,
            Err(AnalysisError::OracleRejected(_))
        ));
        assert_eq!(oracle.calls(), 1);

        let oracle = Arc::new(ScriptedOracle::new(OracleReply::Raw(
            json!({"label": "critical"}),
        )));
        let client = self::client(oracle.clone(), 3);
        assert!(matches!(
            client.analyze(EventId(1), "x").await,
            Err(AnalysisError::OracleMalformed(_))
        ));
        assert_eq!(oracle.calls(), 1);
    }

    #[tokio::test]
    async fn test_analyze_times_out_slow_calls() {
        let oracle = Arc::new(ScriptedOracle::new(OracleReply::Hang));
        let client = client(oracle.clone(), 0);

        let error = client.analyze(EventId(1), "x").await.unwrap_err();

        assert!(error.is_retryable());
        assert!(error.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_open_circuit_fails_fast_without_calling_the_oracle() {
        let oracle = Arc::new(ScriptedOracle::new(OracleReply::Unavailable));
        let client = client(oracle.clone(), 0);

        for _ in 0..5 {
            drop(client.analyze(EventId(1), "x").await);
        }
        assert_eq!(oracle.calls(), 5);
        assert!(!client.is_accepting());

        let error = client.analyze(EventId(1), "x").await.unwrap_err();
        assert!(error.is_circuit_open());
        assert_eq!(oracle.calls(), 5);
    }

    #[tokio::test]
    async fn test_rejections_reset_the_failure_streak() {
        let oracle = Arc::new(ScriptedOracle::new(OracleReply::Unavailable));
        for _ in 0..4 {
            oracle.push(OracleReply::Unavailable);
        }
        oracle.push(OracleReply::Rejected);
        for _ in 0..4 {
            oracle.push(OracleReply::Unavailable);
        }
        let client = client(oracle.clone(), 0);

        for _ in 0..9 {
            drop(client.analyze(EventId(1), "x").await);
        }

        assert!(client.is_accepting());
        assert_eq!(oracle.calls(), 9);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_the_retry_loop() {
        let oracle = Arc::new(ScriptedOracle::new(OracleReply::Unavailable));
        let shutdown = CancellationToken::new();
        let mut settings = settings(3);
        settings.retry_policy = RetryPolicy::build(1, Duration::from_secs(3600)).provide();
        let client = AnalysisClient::new(oracle.clone(), settings, shutdown.clone());

        let cancel = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
        let error = client.analyze(EventId(1), "x").await.unwrap_err();

        assert!(matches!(error, AnalysisError::Interrupted));
        assert_eq!(oracle.calls(), 1);
    }

    #[tokio::test]
    async fn test_no_call_after_shutdown() {
        let oracle = Arc::new(ScriptedOracle::new(OracleReply::classify("critical", 0.9)));
        let shutdown = CancellationToken::new();
        let client = AnalysisClient::new(oracle.clone(), settings(3), shutdown.clone());

        shutdown.cancel();
        let error = client.analyze(EventId(1), "x").await.unwrap_err();

        assert!(matches!(error, AnalysisError::Interrupted));
        assert_eq!(oracle.calls(), 0);
    }

    #[tokio::test]
    async fn test_http_oracle_classifies() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/classify")
                    .header("authorization", "Bearer secret")
                    .json_body(json!({"text": "outage detected"}));
                then.status(200)
                    .json_body(json!({"label": "critical", "confidence": 0.9}));
            })
            .await;

        let oracle = HttpOracle::new(
            &server.url("/v1/classify"),
            Some("secret".to_owned()),
            Duration::from_secs(5),
        )
        .unwrap();
        let raw = oracle.classify("outage detected").await.unwrap();

        mock.assert_async().await;
        assert_eq!(raw["label"], "critical");
    }

    #[tokio::test]
    async fn test_http_oracle_maps_statuses() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/busy");
                then.status(503).body("overloaded");
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/bad");
                then.status(400).body("text is required");
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/html");
                then.status(200).body("<html>oops</html>");
            })
            .await;

        let oracle = |path: &str| {
            HttpOracle::new(&server.url(path), None, Duration::from_secs(5)).unwrap()
        };

        let error = oracle("/busy").classify("x").await.unwrap_err();
        assert!(error.is_retryable());
        assert!(error.to_string().contains("overloaded"));

        let error = oracle("/bad").classify("x").await.unwrap_err();
        assert!(matches!(error, AnalysisError::OracleRejected(_)));

        let error = oracle("/html").classify("x").await.unwrap_err();
        assert!(matches!(error, AnalysisError::OracleMalformed(_)));
    }

    #[tokio::test]
    async fn test_http_oracle_unreachable_is_unavailable() {
        // Nothing listens on the discard port.
        let oracle =
            HttpOracle::new("http://127.0.0.1:9/classify", None, Duration::from_secs(1)).unwrap();

        let error = oracle.classify("x").await.unwrap_err();
        assert!(error.is_retryable());
    }
}
