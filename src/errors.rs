//! Error utility types shared across subsystems.

use std::{fmt, io};

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

/// Wrapper for [`std::io::Error`].
#[derive(Debug)]
#[repr(transparent)]
pub struct IoError(io::Error);

impl From<io::Error> for IoError {
    fn from(value: io::Error) -> Self {
        Self(value)
    }
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, kind={:?}", self.0, self.0.kind())?;
        if let Some(raw) = self.0.raw_os_error() {
            write!(f, ", raw={raw}")?;
        }
        Ok(())
    }
}

/// Render an HTTP error body in the `{"error": ..., "cause": ...}` shape required by the
/// HTTP frontend, as opposed to the teacher's RFC7807 `problemdetails` format.
///
/// This is the one deliberate departure from `uxum`'s error-response convention: the wire
/// contract for this service is fixed by the spec, and differs from RFC7807.
pub fn error_body(
    status: StatusCode,
    error: &str,
    cause: impl fmt::Display,
) -> axum::response::Response {
    (
        status,
        Json(json!({ "error": error, "cause": cause.to_string() })),
    )
        .into_response()
}
