use std::time::Duration;

use thiserror::Error;

use crate::value::Value;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Failure establishing a sandbox session.
///
/// Cloneable so that every caller waiting on the same in-flight setup
/// observes the same outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("sandbox handshake timed out after {}ms", .0.as_millis())]
    HandshakeTimeout(Duration),

    #[error("failed to launch sandbox: {0}")]
    Launch(String),

    #[error("sandbox transport closed during handshake")]
    TransportClosed,
}

#[derive(Error, Debug)]
pub enum Error {
    /// The sandbox could not be established; the session has been discarded.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The session went away while a request was outstanding.
    #[error("sandbox channel closed")]
    ChannelClosed,

    /// Script evaluation failed inside the sandbox.
    #[error("script error: {}", .error.describe())]
    Eval { error: Value },

    /// A value needs structural marshalling but raw passthrough was requested.
    #[error("{kind} value could not be cloned")]
    DataClone { kind: &'static str },

    /// A frame could not be encoded or decoded.
    #[error("frame codec error: {0}")]
    Codec(#[from] isobridge_cbor::Error),
}

impl Error {
    /// The reconstructed error value for evaluation failures.
    #[must_use]
    pub const fn eval_error(&self) -> Option<&Value> {
        match self {
            Self::Eval { error } => Some(error),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Session(SessionError::HandshakeTimeout(_)))
    }
}
