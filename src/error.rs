//! Error taxonomy for the CIP driver.
//!
//! Three kinds of fault cross the API boundary:
//!
//! - [`CipError::Comm`] - transport-level failures (connect, send, receive,
//!   socket options). Always wraps the underlying cause and always propagates.
//! - [`CipError::Request`] - a request that could not be built (unparseable
//!   connection path, invalid segment). Raised before anything touches the
//!   wire.
//! - [`CipError::Response`] - a protocol-level failure promoted to a fault.
//!   Most protocol failures are *not* errors: they travel as the `error`
//!   field of a [`crate::MessageResult`]. Only convenience wrappers (module
//!   info retrieval, the exhausted forward-open fallback) promote them.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CipError>;

type Source = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised by the CIP driver.
#[derive(Debug, Error)]
pub enum CipError {
    /// Transport-level failure: connect, send, receive or socket option.
    #[error("{context}")]
    Comm {
        context: String,
        #[source]
        source: Option<Source>,
    },

    /// The request is malformed and was never sent on the wire.
    #[error("invalid request: {context}")]
    Request {
        context: String,
        #[source]
        source: Option<Source>,
    },

    /// A protocol-level failure promoted to a fault by a wrapper.
    #[error("{context}")]
    Response {
        context: String,
        #[source]
        source: Option<Source>,
    },
}

impl CipError {
    pub(crate) fn comm(context: impl Into<String>) -> Self {
        CipError::Comm {
            context: context.into(),
            source: None,
        }
    }

    pub(crate) fn comm_with(
        context: impl Into<String>,
        source: impl Into<Source>,
    ) -> Self {
        CipError::Comm {
            context: context.into(),
            source: Some(source.into()),
        }
    }

    pub(crate) fn request(context: impl Into<String>) -> Self {
        CipError::Request {
            context: context.into(),
            source: None,
        }
    }

    pub(crate) fn request_with(
        context: impl Into<String>,
        source: impl Into<Source>,
    ) -> Self {
        CipError::Request {
            context: context.into(),
            source: Some(source.into()),
        }
    }

    pub(crate) fn response(context: impl Into<String>) -> Self {
        CipError::Response {
            context: context.into(),
            source: None,
        }
    }

    /// True for transport-level faults.
    pub fn is_comm(&self) -> bool {
        matches!(self, CipError::Comm { .. })
    }
}
