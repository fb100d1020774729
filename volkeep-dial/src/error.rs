//! Error types for endpoint resolution and dialing.

use std::io;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DialError {
    #[error("invalid endpoint: {endpoint}")]
    InvalidEndpoint { endpoint: String },

    #[error("dialing {endpoint} timed out after {timeout:?}")]
    DeadlineExceeded { endpoint: String, timeout: Duration },

    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("no transport security set for {endpoint} (pass Insecure or Tls)")]
    NoTransportSecurity { endpoint: String },

    #[error("unix endpoint {endpoint} requires the custom dialer")]
    DialerRequired { endpoint: String },

    #[error("transport error for {endpoint}: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: tonic::transport::Error,
    },
}

impl DialError {
    pub fn invalid_endpoint(endpoint: impl Into<String>) -> Self {
        Self::InvalidEndpoint {
            endpoint: endpoint.into(),
        }
    }

    /// True if the failure was the connect deadline elapsing.
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Self::DeadlineExceeded { .. })
    }
}

impl From<DialError> for io::Error {
    fn from(err: DialError) -> Self {
        match err {
            DialError::DeadlineExceeded { .. } => io::Error::new(io::ErrorKind::TimedOut, err),
            DialError::InvalidEndpoint { .. } => io::Error::new(io::ErrorKind::InvalidInput, err),
            DialError::Connect { source, .. } => source,
            other => io::Error::other(other),
        }
    }
}

impl From<DialError> for tonic::Status {
    fn from(err: DialError) -> Self {
        match &err {
            DialError::DeadlineExceeded { .. } => tonic::Status::deadline_exceeded(err.to_string()),
            DialError::InvalidEndpoint { .. }
            | DialError::NoTransportSecurity { .. }
            | DialError::DialerRequired { .. } => {
                tonic::Status::invalid_argument(err.to_string())
            }
            DialError::Connect { .. } | DialError::Transport { .. } => {
                tonic::Status::unavailable(err.to_string())
            }
        }
    }
}
