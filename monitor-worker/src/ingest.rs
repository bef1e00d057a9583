//! # Ingest
//!
//! Polling of monitored sources. Each poll fetches a source, reduces the body to its visible
//! text and appends an event when that text changed since the previous poll.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use monitor_common::event::NewEvent;
use monitor_common::health::HealthHandle;
use monitor_common::store::EventStore;
use regex::Regex;
use reqwest::header;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SourceSpec;
use crate::error::WorkerError;

/// Reduces fetched documents to the text a reader would see.
pub struct TextExtractor {
    hidden_blocks: Regex,
    tags: Regex,
}

impl TextExtractor {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            hidden_blocks: Regex::new(
                r"(?is)<(script|style|noscript)\b[^>]*>.*?</(script|style|noscript)\s*>",
            )?,
            tags: Regex::new(r"(?s)<!--.*?-->|<[^>]*>")?,
        })
    }

    /// Extract the text of `body`. Markup is stripped when the body looks like HTML. Lines are
    /// trimmed, phrases separated by double spaces are put on their own line and blank chunks
    /// are dropped.
    pub fn extract(&self, body: &str, is_html: bool) -> String {
        let text = if is_html {
            let visible = self.hidden_blocks.replace_all(body, " ");
            decode_entities(&self.tags.replace_all(&visible, "\n"))
        } else {
            body.to_owned()
        };

        text.lines()
            .flat_map(|line| line.trim().split("  "))
            .map(str::trim)
            .filter(|chunk| !chunk.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        // Last, so that "&amp;lt;" decodes to "&lt;".
        .replace("&amp;", "&")
}

fn looks_like_html(content_type: Option<&str>, body: &str) -> bool {
    match content_type {
        Some(content_type) => content_type.contains("html"),
        None => body.trim_start().starts_with('<'),
    }
}

pub struct SourcePoller {
    client: reqwest::Client,
    sources: Vec<SourceSpec>,
    store: Arc<dyn EventStore>,
    extractor: TextExtractor,
    /// Text extracted by the previous successful poll of each source.
    last_seen: HashMap<String, String>,
    poll_interval: Duration,
    shutdown: CancellationToken,
}

impl SourcePoller {
    pub fn new(
        sources: Vec<SourceSpec>,
        store: Arc<dyn EventStore>,
        poll_interval: Duration,
        request_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Result<Self, WorkerError> {
        let client = reqwest::Client::builder()
            .user_agent("Monitor Worker")
            .timeout(request_timeout)
            .build()?;
        let extractor =
            TextExtractor::new().map_err(|error| WorkerError::InvalidPattern(error.to_string()))?;

        Ok(Self {
            client,
            sources,
            store,
            extractor,
            last_seen: HashMap::new(),
            poll_interval,
            shutdown,
        })
    }

    /// Poll every source on an interval until shutdown is requested.
    pub async fn run(mut self, liveness: HealthHandle) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("polling {} sources", self.sources.len());

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => (),
            }

            liveness.report_healthy();
            let appended = self.poll_once().await;
            if appended > 0 {
                info!("appended {} events from monitored sources", appended);
            }
        }
    }

    /// Poll every source once and return how many events were appended. Failures are logged
    /// and the source is polled again on the next round.
    pub async fn poll_once(&mut self) -> usize {
        let mut appended = 0;

        for index in 0..self.sources.len() {
            let source = self.sources[index].clone();

            let text = match self.fetch_text(&source).await {
                Ok(text) => text,
                Err(error) => {
                    warn!(source = %source.id, "failed to fetch source: {}", error);
                    metrics::counter!(
                        "monitor_source_fetch_errors_total",
                        &[("source", source.id.clone())]
                    )
                    .increment(1);
                    continue;
                }
            };

            if text.is_empty() || self.last_seen.get(&source.id) == Some(&text) {
                debug!(source = %source.id, "source unchanged");
                continue;
            }

            match self.store.append(NewEvent::new(&source.id, &text)).await {
                Ok(id) => {
                    debug!(source = %source.id, event_id = %id, "source changed");
                    metrics::counter!(
                        "monitor_events_ingested_total",
                        &[("source", source.id.clone())]
                    )
                    .increment(1);
                    self.last_seen.insert(source.id.clone(), text);
                    appended += 1;
                }
                // Not recorded as seen, so the change is appended on the next round.
                Err(error) => warn!(source = %source.id, "failed to append event: {}", error),
            }
        }

        appended
    }

    async fn fetch_text(&self, source: &SourceSpec) -> Result<String, reqwest::Error> {
        let response = self
            .client
            .get(source.url.clone())
            .send()
            .await?
            .error_for_status()?;

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let body = response.text().await?;

        Ok(self.extractor.extract(
            &body,
            looks_like_html(content_type.as_deref(), &body),
        ))
    }
}
