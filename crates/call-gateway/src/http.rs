//! Helpers that turn a `reqwest` exchange into a producer outcome.
//!
//! A producer built with these helpers distinguishes transport failures,
//! HTTP status failures (with any `Retry-After` hint) and payload-shape
//! failures, which is what the retry executor classifies on.

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::error::ProducerError;

/// Longest error body kept in a `ProducerError::Status`.
const MAX_ERROR_BODY: usize = 512;

/// Send `request` and decode a successful JSON body as `T`.
pub async fn send_json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, ProducerError> {
    let response = request.send().await?;
    let status = response.status();

    if !status.is_success() {
        let retry_after = parse_retry_after(response.headers(), Utc::now());
        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        return Err(ProducerError::Status {
            status: status.as_u16(),
            retry_after,
            body,
        });
    }

    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| ProducerError::Payload(e.to_string()))
}

/// `Retry-After` as a wait, from either delta-seconds or an HTTP-date.
/// A date in the past yields a zero wait.
pub fn parse_retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}
