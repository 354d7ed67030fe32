//! Shared HTTP plumbing: the error type and client construction.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{service} returned {status}: {body}")]
    Status {
        service: &'static str,
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("{service} reported error {code}: {message}")]
    Remote {
        service: &'static str,
        code: i64,
        message: String,
    },
    #[error("malformed {service} response: {reason}")]
    Malformed {
        service: &'static str,
        reason: String,
    },
    #[error("{0} is not configured")]
    NotConfigured(&'static str),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl NetError {
    pub(crate) fn malformed(service: &'static str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            service,
            reason: reason.into(),
        }
    }
}

/// Build a client whose every request is bounded by `timeout`.
pub fn build_client(timeout: Duration) -> Result<reqwest::Client, NetError> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

/// Build a client for long streamed responses: `idle` bounds connecting and
/// each wait for more body bytes, not the whole transfer.
pub fn build_streaming_client(idle: Duration) -> Result<reqwest::Client, NetError> {
    Ok(reqwest::Client::builder()
        .connect_timeout(idle)
        .read_timeout(idle)
        .build()?)
}

/// Pass successful responses through; turn anything else into [`NetError::Status`].
pub(crate) async fn check_status(
    service: &'static str,
    response: reqwest::Response,
) -> Result<reqwest::Response, NetError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(NetError::Status {
        service,
        status,
        body,
    })
}

pub(crate) fn require<'a>(
    value: &'a Option<String>,
    what: &'static str,
) -> Result<&'a str, NetError> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or(NetError::NotConfigured(what))
}
