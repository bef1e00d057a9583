//! Helpers shared by the HTTP clients of the worker.
use std::time;

use futures::StreamExt;
use http::StatusCode;
use reqwest::{header, Client};

/// Response bodies are only kept for error messages, so we never read more than this.
const MAX_RESPONSE_BODY: usize = 1024;

pub fn build_http_client(request_timeout: time::Duration) -> reqwest::Result<Client> {
    let mut headers = header::HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );

    reqwest::Client::builder()
        .default_headers(headers)
        .user_agent("Monitor Worker")
        .timeout(request_timeout)
        .build()
}

/// 429 and 5xx mean the remote end may accept the same request later.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Attempt to parse a Retry-After header, which can hold a number of seconds or an RFC2822 date.
/// Returns `None` when the header is absent, invalid or already in the past.
pub fn parse_retry_after_header(header_map: &header::HeaderMap) -> Option<time::Duration> {
    let retry_after = header_map.get(header::RETRY_AFTER)?.to_str().ok()?;

    if let Ok(u) = retry_after.parse::<u64>() {
        return Some(time::Duration::from_secs(u));
    }

    if let Ok(dt) = chrono::DateTime::parse_from_rfc2822(retry_after) {
        let duration =
            chrono::DateTime::<chrono::offset::Utc>::from(dt) - chrono::offset::Utc::now();

        // This can only fail when negative, in which case we return None.
        return duration.to_std().ok();
    }

    None
}

/// Read at most the first `MAX_RESPONSE_BODY` bytes of a response, for error reporting.
pub async fn response_excerpt(response: reqwest::Response) -> String {
    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::with_capacity(MAX_RESPONSE_BODY);

    while let Some(Ok(chunk)) = stream.next().await {
        let remaining = MAX_RESPONSE_BODY - buffer.len();
        if chunk.len() >= remaining {
            buffer.extend_from_slice(&chunk[..remaining]);
            break;
        }
        buffer.extend_from_slice(&chunk);
    }

    String::from_utf8_lossy(&buffer).into_owned()
}
