//! Reply encoding and correlation.
//!
//! Pure mapping from a call outcome to the reply envelope that goes back to
//! the caller. Success bodies pass through untouched; failures become
//!
//! ```json
//! {"error": {"kind": "MethodNotFound", "message": "..."}}
//! ```
//!
//! The correlation id of the call is copied onto the reply verbatim, and the
//! reply's `method` slot (the AMQP `type` property) carries the status,
//! [`STATUS_SUCCESS`] or [`STATUS_ERROR`], so callers never infer failure
//! from the body shape.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{Address, Envelope};

/// Reply status for a successful call.
pub const STATUS_SUCCESS: &str = "success";

/// Reply status for a call answered with an error body.
pub const STATUS_ERROR: &str = "error";

/// Kind tag carried by an error reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// No handler registered for the call's method name.
    MethodNotFound,
    /// The handler returned an application-level failure or panicked.
    HandlerError,
    /// The handler's result could not be serialized.
    EncodingFailed,
    /// The handler exceeded the per-call timeout.
    Timeout,
}

impl ErrorKind {
    /// Wire name of the kind, also used as a metrics label.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::MethodNotFound => "MethodNotFound",
            ErrorKind::HandlerError => "HandlerError",
            ErrorKind::EncodingFailed => "EncodingFailed",
            ErrorKind::Timeout => "Timeout",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-call failure. Always answered with an error reply, never fatal to the
/// consumer loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct CallError {
    pub kind: ErrorKind,
    pub message: String,
}

impl CallError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            ErrorKind::MethodNotFound,
            format!("no handler registered for method {method:?}"),
        )
    }

    pub fn handler(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::HandlerError, message)
    }

    pub fn encoding(err: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::EncodingFailed,
            format!("failed to encode result: {err}"),
        )
    }

    pub fn timeout(limit: Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("handler did not finish within {}ms", limit.as_millis()),
        )
    }
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ErrorReply {
    error: CallError,
}

/// Serialize `err` into the error reply body.
pub fn encode_error(err: &CallError) -> Bytes {
    // ---
    #[derive(Serialize)]
    struct Borrowed<'a> {
        error: &'a CallError,
    }

    match serde_json::to_vec(&Borrowed { error: err }) {
        Ok(body) => Bytes::from(body),
        // Only string and unit-variant fields; serialization cannot fail.
        Err(_) => Bytes::from_static(
            br#"{"error":{"kind":"EncodingFailed","message":"failed to encode error"}}"#,
        ),
    }
}

/// Build the reply envelope for a finished call.
///
/// `reply_to` becomes the delivery address and `correlation_id` is copied as
/// given.
pub fn encode_reply(
    reply_to: Address,
    correlation_id: Option<Arc<str>>,
    outcome: &Result<Bytes, CallError>,
) -> Envelope {
    // ---
    let (status, body) = match outcome {
        Ok(body) => (STATUS_SUCCESS, body.clone()),
        Err(err) => (STATUS_ERROR, encode_error(err)),
    };

    let mut reply = Envelope::response(reply_to, body, correlation_id);
    reply.method = Some(Arc::from(status));
    reply
}

/// Inverse of [`encode_reply`] for callers: split a reply into the success
/// payload or the error it carries.
///
/// Only a [`STATUS_ERROR`] status is read as a failure; any other status,
/// including none, passes the body through.
pub fn decode_reply(status: Option<&str>, body: &[u8]) -> Result<Bytes, CallError> {
    // ---
    if status != Some(STATUS_ERROR) {
        return Ok(Bytes::copy_from_slice(body));
    }

    match serde_json::from_slice::<ErrorReply>(body) {
        Ok(reply) => Err(reply.error),
        Err(e) => Err(CallError::new(
            ErrorKind::EncodingFailed,
            format!("malformed error reply: {e}"),
        )),
    }
}
