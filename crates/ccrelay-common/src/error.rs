use serde::{Deserialize, Serialize};

/// The one error taxonomy every upstream/client-facing failure is categorised
/// into (SPEC_FULL.md §3, §7). No raw status codes escape past this boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    RateLimit,
    AuthInvalid,
    Transient,
    BadRequest,
    Permission,
    Capacity,
    Unknown,
}

impl ErrorKind {
    /// HTTP status this kind maps to at the Anthropic-compatible client boundary.
    pub fn client_status(self) -> u16 {
        match self {
            ErrorKind::RateLimit => 400,
            ErrorKind::AuthInvalid => 401,
            ErrorKind::Permission => 403,
            ErrorKind::BadRequest => 400,
            ErrorKind::Transient => 503,
            ErrorKind::Capacity => 400,
            ErrorKind::Unknown => 500,
        }
    }

    /// Anthropic `error.type` string for this kind.
    pub fn client_error_type(self) -> &'static str {
        match self {
            ErrorKind::RateLimit => "invalid_request_error",
            ErrorKind::AuthInvalid => "authentication_error",
            ErrorKind::Permission => "permission_error",
            ErrorKind::BadRequest => "invalid_request_error",
            ErrorKind::Transient => "api_error",
            ErrorKind::Capacity => "invalid_request_error",
            ErrorKind::Unknown => "api_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_maps_to_400_so_clients_dont_auto_retry() {
        assert_eq!(ErrorKind::RateLimit.client_status(), 400);
        assert_eq!(ErrorKind::RateLimit.client_error_type(), "invalid_request_error");
    }

    #[test]
    fn capacity_carries_same_shape_as_rate_limit() {
        assert_eq!(ErrorKind::Capacity.client_status(), 400);
    }
}
