//! Error types.
//!
//! Three families:
//!
//! - [`Error`]: configuration and infrastructure failures. Returned by
//!   registration calls and by [`Server`](crate::Server). Never produced while
//!   a request is being served.
//! - [`EncodeError`]: an [`Encoder`](crate::Encoder) could not produce a
//!   body. Recovered by the response writer and turned into a 500.
//! - [`RespondError`]: the per-request sink refused a write.
//!
//! Application-level failures (404, 422, etc.) are not errors at all here:
//! they are encoders that map to an error status.

use http::Method;

/// Boxed error used for body streams and encoder causes.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Configuration and infrastructure errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Binding a port or accepting a connection failed.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// The same method + pattern pair was registered twice.
    #[error("route `{method} {path}` is already registered")]
    DuplicateRoute { method: Method, path: String },

    /// The router rejected the pattern (bad parameter syntax, overlap).
    #[error("invalid route `{path}`: {source}")]
    InvalidRoute {
        path: String,
        #[source]
        source: matchit::InsertError,
    },

    /// A CORS origin that is neither `*` nor `scheme://host[:port]`.
    #[error("invalid CORS origin `{0}`")]
    InvalidOrigin(String),

    /// Anything else detected while building the app or reading config.
    #[error("configuration: {0}")]
    Config(String),
}

/// An encoder failed to turn its value into bytes.
#[derive(Debug, thiserror::Error)]
#[error("encode: {0}")]
pub struct EncodeError(#[source] BoxError);

impl EncodeError {
    pub fn new(cause: impl Into<BoxError>) -> Self {
        Self(cause.into())
    }
}

impl From<serde_json::Error> for EncodeError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(e)
    }
}

/// The per-request sink refused a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RespondError {
    /// A response was already committed for this request.
    #[error("response already written")]
    AlreadyWritten,

    /// The request was canceled before anything was written.
    #[error("request canceled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::error::Error as _;

    #[test]
    fn encode_error_displays_and_chains_its_cause() {
        let err = EncodeError::new("upstream closed");
        assert_eq!(err.to_string(), "encode: upstream closed");
        assert_eq!(err.source().map(ToString::to_string).as_deref(), Some("upstream closed"));
    }
}
