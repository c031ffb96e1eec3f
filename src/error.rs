//! Error types shared across the crate.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FlipperError>;

/// Error taxonomy for the scanner.
///
/// Transient variants (`RateLimited`, `ServerError`, `Timeout`) are retried
/// by the upstream client before they surface here; everything else fails
/// the call immediately.
#[derive(Error, Debug)]
pub enum FlipperError {
    #[error("rate limited by upstream, resume in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("access token expired")]
    AuthExpired,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("upstream error {status}: {body}")]
    ServerError { status: u16, body: String },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("decode: {0}")]
    Decode(String),

    #[error("canceled")]
    Canceled,

    #[error("bad input: {0}")]
    BadInput(String),

    #[error("storage: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("http: {0}")]
    Http(reqwest::Error),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl FlipperError {
    /// Whether the upstream client may retry the request.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FlipperError::RateLimited { .. }
                | FlipperError::ServerError { .. }
                | FlipperError::Timeout(_)
                | FlipperError::Http(_)
        )
    }
}

impl From<reqwest::Error> for FlipperError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FlipperError::Timeout(err.to_string())
        } else if err.is_decode() {
            FlipperError::Decode(err.to_string())
        } else {
            FlipperError::Http(err)
        }
    }
}

impl From<serde_json::Error> for FlipperError {
    fn from(err: serde_json::Error) -> Self {
        FlipperError::Decode(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(FlipperError::RateLimited { retry_after_secs: 5 }.is_transient());
        assert!(FlipperError::ServerError { status: 502, body: String::new() }.is_transient());
        assert!(FlipperError::Timeout("read".into()).is_transient());
        assert!(!FlipperError::NotFound("type 34".into()).is_transient());
        assert!(!FlipperError::BadInput("radius".into()).is_transient());
        assert!(!FlipperError::AuthExpired.is_transient());
    }

    #[test]
    fn json_errors_map_to_decode() {
        let err = serde_json::from_str::<i64>("not json").unwrap_err();
        assert!(matches!(FlipperError::from(err), FlipperError::Decode(_)));
    }
}
