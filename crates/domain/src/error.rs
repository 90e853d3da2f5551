/// Shared error type used across all drydock crates.
///
/// Variants map one-to-one onto the HTTP status the gateway surfaces, so
/// every layer classifies failures once and the API boundary stays dumb.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Caller input was malformed or exceeds a quota. No state changed.
    #[error("validation: {0}")]
    Validation(String),

    /// Missing or expired credentials.
    #[error("auth: {0}")]
    Auth(String),

    /// Authenticated, but the caller's role does not permit the operation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Illegal state transition or concurrent conflicting write.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Backend call failed but is retryable (network flake, API throttling).
    #[error("backend (transient): {0}")]
    BackendTransient(String),

    /// Backend reported a permanent failure; the resource must be torn down.
    #[error("backend (fatal): {0}")]
    BackendFatal(String),

    /// A forwarded upstream call failed; the upstream status is relayed.
    #[error("upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("database: {0}")]
    Database(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    /// The HTTP status code the gateway surfaces for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::Validation(_) => 400,
            Error::Auth(_) => 401,
            Error::Forbidden(_) => 403,
            Error::NotFound(_) => 404,
            Error::Conflict(_) => 409,
            Error::BackendTransient(_) => 503,
            Error::BackendFatal(_) => 502,
            Error::Upstream { status, .. } => *status,
            Error::Database(_) => 500,
            Error::Internal(_) => 500,
        }
    }

    /// Whether a retry with backoff may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::BackendTransient(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_follows_taxonomy() {
        assert_eq!(Error::Validation("x".into()).http_status(), 400);
        assert_eq!(Error::Auth("x".into()).http_status(), 401);
        assert_eq!(Error::Forbidden("x".into()).http_status(), 403);
        assert_eq!(Error::NotFound("x".into()).http_status(), 404);
        assert_eq!(Error::Conflict("x".into()).http_status(), 409);
        assert_eq!(Error::BackendTransient("x".into()).http_status(), 503);
        assert_eq!(Error::BackendFatal("x".into()).http_status(), 502);
        assert_eq!(
            Error::Upstream { status: 429, message: "x".into() }.http_status(),
            429
        );
    }

    #[test]
    fn only_backend_transient_is_retryable() {
        assert!(Error::BackendTransient("x".into()).is_transient());
        assert!(!Error::BackendFatal("x".into()).is_transient());
        assert!(!Error::Conflict("x".into()).is_transient());
    }
}
