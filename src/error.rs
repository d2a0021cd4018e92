use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// Type alias for Result with TriageError
pub type Result<T> = std::result::Result<T, TriageError>;

/// Error taxonomy for the triage pipeline
#[derive(Error, Debug)]
pub enum TriageError {
    /// Gmail API returned an error
    #[error("Gmail API error: {0}")]
    ApiError(String),

    /// Credential is no longer usable; the mailbox must be re-authorized
    #[error("Credential expired: {0}")]
    CredentialExpired(String),

    /// Authentication flow failed (CLI only)
    #[error("Authentication failed: {0}")]
    AuthError(String),

    /// Provider answered 429
    #[error("Rate limit exceeded (retry hint: {retry_after:?}s)")]
    RateLimitExceeded { retry_after: Option<u64> },

    /// Local quota budget is exhausted for longer than the caller may block
    #[error("Quota budget exhausted for mailbox {mailbox_id}, wait {wait:?}")]
    QuotaWait { mailbox_id: String, wait: Duration },

    /// Reservation can never succeed (cost larger than the window)
    #[error("Rate limit error: {0}")]
    RateLimitError(String),

    /// Emergency stop is active for the mailbox
    #[error("Mailbox {0} is paused")]
    MailboxPaused(String),

    /// Network-related error (connection issues, timeouts, etc.)
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Server returned 5xx error
    #[error("Server error (HTTP {status}): {message}")]
    ServerError { status: u16, message: String },

    /// Resource not found (404)
    #[error("Message not found: {0}")]
    MessageNotFound(String),

    /// History cursor is too old for the provider to replay
    #[error("Change cursor expired: {0}")]
    CursorExpired(String),

    /// Bad request (400)
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Forbidden (403)
    #[error("Access forbidden: {0}")]
    Forbidden(String),

    /// Invalid message format or parsing error
    #[error("Invalid message format: {0}")]
    InvalidMessageFormat(String),

    /// Label-related errors
    #[error("Label error: {0}")]
    LabelError(String),

    /// Tier-2 classification failed or timed out
    #[error("Assisted classification error: {0}")]
    AssistedError(String),

    /// Body content reached the pipeline or an irreversible operation was attempted
    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    #[error("Undo window for record {record_id} closed at {deadline}")]
    UndoExpired {
        record_id: String,
        deadline: DateTime<Utc>,
    },

    #[error("Record {0} was already undone")]
    AlreadyUndone(String),

    #[error("Record {0} has no executed action to undo")]
    NothingToUndo(String),

    #[error("Record not found: {0}")]
    RecordNotFound(String),

    #[error("Mailbox not found: {0}")]
    MailboxNotFound(String),

    /// SQLite failure
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// IO error (file operations, etc.)
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Internal state errors (join failures, poisoned state)
    #[error("State error: {0}")]
    StateError(String),
}

impl TriageError {
    /// Check if the error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TriageError::RateLimitExceeded { .. }
                | TriageError::QuotaWait { .. }
                | TriageError::ServerError { .. }
                | TriageError::NetworkError(_)
        )
    }

    /// Check if the error is permanent and should not be retried
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    /// Rejections the user caused; reported back, never alerted on
    pub fn is_user_rejection(&self) -> bool {
        matches!(
            self,
            TriageError::UndoExpired { .. }
                | TriageError::AlreadyUndone(_)
                | TriageError::NothingToUndo(_)
                | TriageError::RecordNotFound(_)
        )
    }

    /// Errors the executor must hand to the worker instead of recording on the ledger
    pub fn must_propagate(&self) -> bool {
        matches!(
            self,
            TriageError::CredentialExpired(_)
                | TriageError::MailboxPaused(_)
                | TriageError::PolicyViolation(_)
                | TriageError::QuotaWait { .. }
        )
    }

    /// Delay hint carried by the error, if any
    pub fn retry_delay(&self) -> Option<Duration> {
        match self {
            TriageError::RateLimitExceeded {
                retry_after: Some(secs),
            } => Some(Duration::from_secs(*secs)),
            TriageError::QuotaWait { wait, .. } => Some(*wait),
            _ => None,
        }
    }
}

/// Parse the Retry-After header from an HTTP response
///
/// Accepts both delay-seconds ("120") and HTTP-date formats. Returns `None`
/// when the header is missing, invalid, or names a time in the past, so the
/// caller falls back to its own backoff schedule.
fn parse_retry_after_header<B>(response: &hyper::Response<B>) -> Option<u64> {
    let value = response.headers().get("retry-after")?.to_str().ok()?;

    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }

    let http_date = httpdate::parse_http_date(value).ok()?;
    http_date
        .duration_since(std::time::SystemTime::now())
        .ok()
        .map(|d| d.as_secs())
}

impl From<google_gmail1::Error> for TriageError {
    fn from(error: google_gmail1::Error) -> Self {
        match error {
            google_gmail1::Error::Failure(ref response) => {
                let status = response.status();
                let status_code = status.as_u16();
                let message = format!(
                    "HTTP {}: {}",
                    status_code,
                    status.canonical_reason().unwrap_or("Unknown")
                );

                match status_code {
                    401 => TriageError::CredentialExpired(message),
                    429 => TriageError::RateLimitExceeded {
                        retry_after: parse_retry_after_header(response),
                    },
                    404 => TriageError::MessageNotFound("Resource not found".to_string()),
                    400 => TriageError::BadRequest(message),
                    403 => TriageError::Forbidden(message),
                    500..=599 => TriageError::ServerError {
                        status: status_code,
                        message,
                    },
                    _ => TriageError::ApiError(message),
                }
            }
            // The token source failed; the credential provider already decided it is unusable
            google_gmail1::Error::MissingToken(ref err) => {
                TriageError::CredentialExpired(err.to_string())
            }
            google_gmail1::Error::BadRequest(ref err) => {
                TriageError::BadRequest(format!("{}", err))
            }
            google_gmail1::Error::HttpError(ref err) => {
                TriageError::NetworkError(format!("Connection error: {}", err))
            }
            google_gmail1::Error::Io(err) => TriageError::NetworkError(err.to_string()),
            _ => TriageError::ApiError(error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        let rate_limit = TriageError::RateLimitExceeded {
            retry_after: Some(5),
        };
        assert!(rate_limit.is_transient());
        assert!(!rate_limit.is_permanent());

        let server_error = TriageError::ServerError {
            status: 503,
            message: "Service unavailable".to_string(),
        };
        assert!(server_error.is_transient());

        let network_error = TriageError::NetworkError("Connection timeout".to_string());
        assert!(network_error.is_transient());
    }

    #[test]
    fn test_permanent_errors() {
        assert!(TriageError::BadRequest("Invalid query".to_string()).is_permanent());
        assert!(TriageError::MessageNotFound("msg123".to_string()).is_permanent());
        assert!(TriageError::CredentialExpired("revoked".to_string()).is_permanent());
        assert!(TriageError::PolicyViolation("body fetched".to_string()).is_permanent());
    }

    #[test]
    fn test_user_rejections() {
        assert!(TriageError::AlreadyUndone("r1".to_string()).is_user_rejection());
        assert!(TriageError::UndoExpired {
            record_id: "r1".to_string(),
            deadline: Utc::now(),
        }
        .is_user_rejection());
        assert!(!TriageError::NetworkError("x".to_string()).is_user_rejection());
    }

    #[test]
    fn test_must_propagate() {
        assert!(TriageError::CredentialExpired("x".to_string()).must_propagate());
        assert!(TriageError::MailboxPaused("mb".to_string()).must_propagate());
        assert!(TriageError::PolicyViolation("x".to_string()).must_propagate());
        assert!(!TriageError::ServerError {
            status: 500,
            message: "x".to_string()
        }
        .must_propagate());
    }

    #[test]
    fn test_retry_delay_hints() {
        let err = TriageError::RateLimitExceeded {
            retry_after: Some(12),
        };
        assert_eq!(err.retry_delay(), Some(Duration::from_secs(12)));

        let err = TriageError::RateLimitExceeded { retry_after: None };
        assert_eq!(err.retry_delay(), None);

        let err = TriageError::QuotaWait {
            mailbox_id: "mb".to_string(),
            wait: Duration::from_millis(1500),
        };
        assert_eq!(err.retry_delay(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_parse_retry_after_header_integer() {
        let mut response = hyper::Response::builder().status(429).body(()).unwrap();
        response.headers_mut().insert(
            "retry-after",
            hyper::header::HeaderValue::from_static("120"),
        );

        assert_eq!(parse_retry_after_header(&response), Some(120));
    }

    #[test]
    fn test_parse_retry_after_header_missing() {
        let response = hyper::Response::builder().status(429).body(()).unwrap();
        assert_eq!(parse_retry_after_header(&response), None);
    }

    #[test]
    fn test_parse_retry_after_header_invalid() {
        let mut response = hyper::Response::builder().status(429).body(()).unwrap();
        response.headers_mut().insert(
            "retry-after",
            hyper::header::HeaderValue::from_static("invalid"),
        );

        assert_eq!(parse_retry_after_header(&response), None);
    }

    #[test]
    fn test_parse_retry_after_header_http_date() {
        let mut response = hyper::Response::builder().status(429).body(()).unwrap();
        let future_time = std::time::SystemTime::now() + Duration::from_secs(60);
        let http_date = httpdate::fmt_http_date(future_time);

        response.headers_mut().insert(
            "retry-after",
            hyper::header::HeaderValue::from_str(&http_date).unwrap(),
        );

        let retry_after = parse_retry_after_header(&response).unwrap();
        assert!(
            (58..=61).contains(&retry_after),
            "Expected ~60, got {}",
            retry_after
        );
    }

    #[test]
    fn test_parse_retry_after_header_past_http_date() {
        let mut response = hyper::Response::builder().status(429).body(()).unwrap();
        let past_time = std::time::SystemTime::now() - Duration::from_secs(60);
        let http_date = httpdate::fmt_http_date(past_time);

        response.headers_mut().insert(
            "retry-after",
            hyper::header::HeaderValue::from_str(&http_date).unwrap(),
        );

        assert_eq!(parse_retry_after_header(&response), None);
    }
}
