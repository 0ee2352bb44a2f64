//! Terminal engine failures and the HTTP-status → [`ErrorKind`] classifier
//! used by the retry loop (SPEC_FULL.md §4.H step 7, §7).

use ccrelay_common::ErrorKind;
use time::OffsetDateTime;

#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct EngineError {
    pub kind: ErrorKind,
    pub message: String,
    /// Present only for `Capacity`/`RateLimit` failures, for rendering the
    /// "resets in H m s" / absolute timestamp client message.
    pub reset_at: Option<OffsetDateTime>,
}

impl EngineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), reset_at: None }
    }

    pub fn with_reset(kind: ErrorKind, message: impl Into<String>, reset_at: OffsetDateTime) -> Self {
        Self { kind, message: message.into(), reset_at: Some(reset_at) }
    }
}

/// 5xx/network failures are transient; 400/403 are terminal; 401/429 are
/// handled specially by the retry loop before this classifier ever sees
/// them (SPEC_FULL.md §4.H steps 5-7).
pub fn classify_status(status: u16) -> ErrorKind {
    match status {
        400 | 404 | 405 | 409 | 413 | 414 | 415 | 422 => ErrorKind::BadRequest,
        401 => ErrorKind::AuthInvalid,
        403 => ErrorKind::Permission,
        429 => ErrorKind::RateLimit,
        500..=599 => ErrorKind::Transient,
        _ => ErrorKind::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_classify_as_transient() {
        assert_eq!(classify_status(503), ErrorKind::Transient);
    }

    #[test]
    fn forbidden_classifies_as_permission() {
        assert_eq!(classify_status(403), ErrorKind::Permission);
    }
}
