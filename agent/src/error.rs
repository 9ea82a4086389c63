use std::fmt;
use std::io;
use std::time::Duration;

use http::{HeaderMap, StatusCode};
use thiserror::Error;

use crate::client::Body;

/// Errors surfaced by sessions, pools and the request client.
///
/// Transport and session failures are always scoped to a single stream or a
/// single session. A failed session never takes down its group, and a failed
/// stream never takes down its siblings.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport or TLS handshake failure while establishing a session.
    #[error("session connect error: {0}")]
    Connect(#[source] io::Error),
    /// The session did not become ready within the connect timeout.
    #[error("session connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    /// No session lease could be granted within the connect timeout.
    #[error("no session could be acquired within {0:?}")]
    AcquireTimeout(Duration),
    /// Response headers did not arrive within the response timeout.
    #[error("timeout awaiting response for {0:?}")]
    ResponseTimeout(Duration),
    #[error("h2 layer error")]
    H2(#[from] h2::Error),
    /// A response with status >= 400 converted into a structured error.
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("failed to decode body as JSON")]
    Decode(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The session or its pool was torn down while the call was pending.
    #[error("session closed")]
    SessionClosed,
}

impl Error {
    /// Whether this is one of the timeout errors (connect, acquire or response).
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::ConnectTimeout(_) | Error::AcquireTimeout(_) | Error::ResponseTimeout(_)
        )
    }

    /// The HTTP status code, if this is a status error.
    pub fn http_status(&self) -> Option<StatusCode> {
        match self {
            Error::Http(err) => Some(err.status_code),
            _ => None,
        }
    }
}

/// Structured error for responses with status >= 400.
///
/// Carries the status, the response headers and the buffered body. The display
/// message is taken from a `message` field of a JSON body when present,
/// otherwise from the canonical reason phrase.
#[derive(Debug)]
pub struct HttpError {
    pub status_code: StatusCode,
    pub status_message: String,
    pub headers: Option<HeaderMap>,
    pub body: Option<Body>,
    message: String,
}

impl HttpError {
    pub fn new(status_code: StatusCode, headers: Option<HeaderMap>, body: Option<Body>) -> Self {
        let status_message = status_code
            .canonical_reason()
            .unwrap_or("Unknown Status")
            .to_owned();
        let message = body
            .as_ref()
            .and_then(Body::message)
            .map(str::to_owned)
            .unwrap_or_else(|| {
                format!("Response code {} ({})", status_code.as_u16(), status_message)
            });
        HttpError {
            status_code,
            status_message,
            headers,
            body,
            message,
        }
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HttpError {}

/// Checks whether `err` is an HTTP status error with one of the `expected`
/// status codes. An empty slice matches any status error.
pub fn is_http_error(err: &Error, expected: &[u16]) -> bool {
    match err {
        Error::Http(http_err) => {
            expected.is_empty() || expected.contains(&http_err.status_code.as_u16())
        }
        _ => false,
    }
}
