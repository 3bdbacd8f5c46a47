//! The error kinds shared by every public operation in the workspace.
//!
//! These map directly onto §7 of the design: a small, closed set of kinds
//! that every layer (coordination client, object store client, Data
//! Manager, ReadDB, service shell) either returns directly or wraps with
//! additional context. The HTTP layer collapses all of them to a single
//! sanitized message plus a status code — see `kilnforge-gateway`.

use thiserror::Error;

/// Result type alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// The closed set of error kinds described in the design's error model.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input. Never retried; surfaced to the caller as-is.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The referenced resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller is authenticated but not permitted to perform this
    /// operation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The caller's credentials are missing or invalid.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// A compare-and-swap retry budget was exhausted, or an optimistic
    /// concurrency check failed.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The coordination store or object store is transiently unreachable
    /// or overloaded. Retried with backoff inside background loops;
    /// surfaced as 503 on the write path when retries would block too
    /// long.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// A batch would not fit within `SegmentMaxBytes`.
    #[error("too large: {0}")]
    TooLarge(String),

    /// A checksum mismatch or unexpected framing was observed. Fatal for
    /// the affected subsystem — never silently discarded.
    #[error("corruption: {0}")]
    Corruption(String),

    /// An error from the coordination store client, too store-specific to
    /// warrant its own kind.
    #[error("coordination store error: {0}")]
    Coordination(String),

    /// An error from the object store client, too store-specific to
    /// warrant its own kind.
    #[error("object store error: {0}")]
    ObjectStore(String),

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An I/O error from local disk (ReadDB's embedded store).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for errors that are safe to retry without caller involvement
    /// (the coordination/object store layers already do this internally;
    /// this is for callers deciding whether to retry a whole operation).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Unavailable(_) | Error::Conflict(_))
    }

    /// True for errors that indicate data corruption and must halt the
    /// affected subsystem rather than be silently skipped.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Corruption(_))
    }

    /// Map to the HTTP status code the service shell's error responder
    /// uses (§6): `400/401/403/404/409/503/500`.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::InvalidRequest(_) | Error::TooLarge(_) => 400,
            Error::Unauthorized(_) => 401,
            Error::Forbidden(_) => 403,
            Error::NotFound(_) => 404,
            Error::Conflict(_) => 409,
            Error::Unavailable(_) => 503,
            Error::Corruption(_)
            | Error::Coordination(_)
            | Error::ObjectStore(_)
            | Error::Serialization(_)
            | Error::Io(_) => 500,
        }
    }

    /// The sanitized message returned to HTTP callers. Internal error
    /// variants never leak their detail; everything else is safe to show
    /// verbatim since it was produced from the caller's own request.
    pub fn public_message(&self) -> String {
        match self {
            Error::InvalidRequest(m)
            | Error::NotFound(m)
            | Error::Forbidden(m)
            | Error::Unauthorized(m)
            | Error::Conflict(m)
            | Error::TooLarge(m) => m.clone(),
            Error::Unavailable(_) => "service temporarily unavailable".to_string(),
            _ => "internal server error".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(Error::Unavailable("etcd down".into()).is_retryable());
        assert!(Error::Conflict("cas failed".into()).is_retryable());
        assert!(!Error::NotFound("x".into()).is_retryable());
    }

    #[test]
    fn fatal_classification() {
        assert!(Error::Corruption("crc mismatch".into()).is_fatal());
        assert!(!Error::Unavailable("x".into()).is_fatal());
    }

    #[test]
    fn status_codes() {
        assert_eq!(Error::InvalidRequest("x".into()).status_code(), 400);
        assert_eq!(Error::Unauthorized("x".into()).status_code(), 401);
        assert_eq!(Error::Forbidden("x".into()).status_code(), 403);
        assert_eq!(Error::NotFound("x".into()).status_code(), 404);
        assert_eq!(Error::Conflict("x".into()).status_code(), 409);
        assert_eq!(Error::Unavailable("x".into()).status_code(), 503);
        assert_eq!(Error::Corruption("x".into()).status_code(), 500);
    }

    #[test]
    fn public_message_sanitizes_internal_errors() {
        let e = Error::Coordination("dial tcp 10.0.0.1:2379: connection refused".into());
        assert_eq!(e.public_message(), "internal server error");

        let e = Error::NotFound("project myorg/web".into());
        assert_eq!(e.public_message(), "project myorg/web");
    }
}
