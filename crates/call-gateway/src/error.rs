use serde_json::json;
use std::time::Duration;
use thiserror::Error;

/// Failure reported by a producer for a single downstream call.
#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("HTTP {status}: {body}")]
    Status {
        status: u16,
        /// Server-provided wait before the next attempt (`Retry-After`).
        retry_after: Option<Duration>,
        body: String,
    },

    #[error("Malformed payload: {0}")]
    Payload(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ProducerError {
    pub fn status(status: u16, body: impl Into<String>) -> Self {
        ProducerError::Status {
            status,
            retry_after: None,
            body: body.into(),
        }
    }

    /// A 429 carrying the server's retry-after hint.
    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        ProducerError::Status {
            status: 429,
            retry_after,
            body: "rate limited".to_string(),
        }
    }

    /// Transport-level failure (timeout or connection). Always retryable.
    pub fn is_transport(&self) -> bool {
        matches!(self, ProducerError::Timeout(_) | ProducerError::Connection(_))
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            ProducerError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProducerError::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ProducerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProducerError::Timeout(err.to_string())
        } else if err.is_connect() {
            ProducerError::Connection(err.to_string())
        } else if err.is_decode() {
            ProducerError::Payload(err.to_string())
        } else if err.is_builder() {
            ProducerError::InvalidRequest(err.to_string())
        } else if let Some(status) = err.status() {
            ProducerError::status(status.as_u16(), err.to_string())
        } else {
            // Request/body/redirect failures happen on the wire.
            ProducerError::Connection(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ProducerError {
    fn from(err: serde_json::Error) -> Self {
        ProducerError::Payload(err.to_string())
    }
}

/// Outcome of a gateway call that produced no value.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Non-retryable failure, surfaced on the attempt that observed it.
    #[error("Terminal failure after {attempts} attempt(s): {source}")]
    Terminal {
        attempts: u32,
        #[source]
        source: ProducerError,
    },

    /// Every attempt failed with a retryable error.
    #[error("Retries exhausted after {attempts} attempt(s): {last}")]
    ExhaustedRetries {
        attempts: u32,
        #[source]
        last: ProducerError,
    },
}

impl GatewayError {
    pub fn attempts(&self) -> u32 {
        match self {
            GatewayError::Terminal { attempts, .. } | GatewayError::ExhaustedRetries { attempts, .. } => *attempts,
        }
    }

    pub fn last_failure(&self) -> &ProducerError {
        match self {
            GatewayError::Terminal { source, .. } => source,
            GatewayError::ExhaustedRetries { last, .. } => last,
        }
    }

    /// Status code of the downstream response behind this error, if any.
    pub fn upstream_status(&self) -> Option<u16> {
        self.last_failure().status_code()
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, GatewayError::ExhaustedRetries { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Terminal { .. } => "terminal",
            GatewayError::ExhaustedRetries { .. } => "exhausted_retries",
        }
    }

    /// Status an outer HTTP layer should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::Terminal { .. } => 502,
            GatewayError::ExhaustedRetries { last: ProducerError::Timeout(_), .. } => 504,
            GatewayError::ExhaustedRetries { .. } => 503,
        }
    }

    /// Structured JSON body for an outer HTTP layer. Never carries a backtrace.
    pub fn error_body(&self) -> serde_json::Value {
        json!({
            "success": false,
            "error": self.to_string(),
            "kind": self.kind(),
            "attempts": self.attempts(),
            "upstream_status": self.upstream_status(),
        })
    }
}

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for GatewayError {
    fn into_response(self) -> axum::response::Response {
        let status = axum::http::StatusCode::from_u16(self.http_status())
            .unwrap_or(axum::http::StatusCode::BAD_GATEWAY);
        (status, axum::Json(self.error_body())).into_response()
    }
}

/// Durable cache tier failure. Degrades to a cache miss, never fails a fetch.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Durable cache unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),

    #[error("Cached payload is not valid JSON: {0}")]
    Payload(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {field} must be {requirement}")]
    Invalid {
        field: &'static str,
        requirement: &'static str,
    },

    #[error("Invalid value {value:?} for environment variable {name}")]
    Env { name: String, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        assert!(ProducerError::Timeout("t".into()).is_transport());
        assert!(ProducerError::Connection("c".into()).is_transport());
        assert!(!ProducerError::status(500, "boom").is_transport());
        assert!(!ProducerError::Payload("p".into()).is_transport());
    }

    #[test]
    fn test_retry_after_only_on_status() {
        let err = ProducerError::rate_limited(Some(Duration::from_secs(7)));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(err.status_code(), Some(429));
        assert_eq!(ProducerError::Timeout("t".into()).retry_after(), None);
    }

    #[test]
    fn test_http_status_mapping() {
        let terminal = GatewayError::Terminal {
            attempts: 1,
            source: ProducerError::status(404, "not found"),
        };
        assert_eq!(terminal.http_status(), 502);
        assert_eq!(terminal.upstream_status(), Some(404));

        let exhausted = GatewayError::ExhaustedRetries {
            attempts: 3,
            last: ProducerError::status(503, "unavailable"),
        };
        assert_eq!(exhausted.http_status(), 503);

        let timed_out = GatewayError::ExhaustedRetries {
            attempts: 3,
            last: ProducerError::Timeout("deadline".into()),
        };
        assert_eq!(timed_out.http_status(), 504);
    }

    #[test]
    fn test_error_body_shape() {
        let err = GatewayError::ExhaustedRetries {
            attempts: 3,
            last: ProducerError::status(500, "internal"),
        };
        let body = err.error_body();
        assert_eq!(body["success"], false);
        assert_eq!(body["kind"], "exhausted_retries");
        assert_eq!(body["attempts"], 3);
        assert_eq!(body["upstream_status"], 500);
        assert!(body["error"].as_str().unwrap().contains("HTTP 500"));
    }

    #[test]
    fn test_serde_error_is_payload() {
        let err: ProducerError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, ProducerError::Payload(_)));
    }

    #[cfg(feature = "axum")]
    #[test]
    fn test_into_response_uses_mapped_status() {
        use axum::response::IntoResponse;

        let err = GatewayError::ExhaustedRetries {
            attempts: 3,
            last: ProducerError::Timeout("deadline".into()),
        };
        assert_eq!(err.into_response().status(), axum::http::StatusCode::GATEWAY_TIMEOUT);
    }
}
