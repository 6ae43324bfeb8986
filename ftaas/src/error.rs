use std::fmt;

use thiserror::Error;

/// Result type for File API operations.
pub type Result<T> = std::result::Result<T, Error>;

/// What went wrong at the transport level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The connection could not be established
    Connect,
    /// The per-call deadline elapsed
    Timeout,
    /// The request or response body could not be transferred
    Body,
    /// Any other network failure
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            TransportErrorKind::Connect => "connect",
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Body => "body",
            TransportErrorKind::Other => "other",
        };
        f.write_str(kind)
    }
}

/// Errors that can occur while authenticating or uploading.
#[derive(Debug, Error)]
pub enum Error {
    /// The identity provider did not issue a usable credential
    #[error("Failed to obtain access token: {message}")]
    AuthFailure { message: String },

    /// Network failure while talking to the upload endpoint
    #[error("Transport error ({kind}): {message}")]
    Transport { kind: TransportErrorKind, message: String },

    /// The upload endpoint rejected the bearer token
    #[error("Access token rejected by the upload endpoint (HTTP {status})")]
    AuthRejected { status: u16 },

    /// The backend failed to process the upload (5xx, 408 or 429)
    #[error("Server error (HTTP {status}): {body}")]
    Server { status: u16, body: String },

    /// The backend refused the request; `body` is its payload, verbatim
    #[error("Upload rejected by the backend (HTTP {status}): {body}")]
    Validation { status: u16, body: String },

    /// The local content stream could not be read
    #[error("Failed to read upload content: {0}")]
    Encoding(#[source] std::io::Error),

    /// The request is invalid before anything is sent
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    /// A successful response did not describe an uploaded file
    #[error("Invalid upload response: {message}")]
    InvalidResponse { message: String },

    /// The upload was canceled before it completed
    #[error("Upload canceled")]
    Canceled,

    /// Configuration is missing or inconsistent
    #[error("Invalid configuration: {message}")]
    Config { message: String },

    /// Unexpected failure inside the client
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Whether the upload client may retry the call that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport { .. } | Error::Server { .. })
    }

    /// HTTP status carried by this error, if it came from a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::AuthRejected { status }
            | Error::Server { status, .. }
            | Error::Validation { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Map a failed HTTP response to its error kind.
    pub(crate) fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Error::AuthRejected { status },
            408 | 429 | 500..=599 => Error::Server { status, body },
            _ => Error::Validation { status, body },
        }
    }

    pub(crate) fn from_reqwest(error: reqwest::Error) -> Self {
        let kind = if error.is_timeout() {
            TransportErrorKind::Timeout
        } else if error.is_connect() {
            TransportErrorKind::Connect
        } else if error.is_body() || error.is_decode() {
            TransportErrorKind::Body
        } else {
            TransportErrorKind::Other
        };

        Error::Transport {
            kind,
            message: error.to_string(),
        }
    }
}
