//! Error types for the CSI controller.

use std::io;
use thiserror::Error;
use tonic::Status;

use crate::capability::Rejection;
use crate::config::ConfigError;
use crate::keylock::LockTimeout;

pub type Result<T> = std::result::Result<T, Error>;

/// Extension trait for validating required fields.
///
/// Returns `INVALID_ARGUMENT` status if the field is missing or empty.
pub trait Require<T> {
    fn require(self, name: &str) -> std::result::Result<T, Status>;
}

impl Require<String> for String {
    fn require(self, name: &str) -> std::result::Result<String, Status> {
        if self.is_empty() {
            Err(Status::invalid_argument(format!("{name} missing in request")))
        } else {
            Ok(self)
        }
    }
}

impl<T> Require<Vec<T>> for Vec<T> {
    fn require(self, name: &str) -> std::result::Result<Vec<T>, Status> {
        if self.is_empty() {
            Err(Status::invalid_argument(format!("{name} missing in request")))
        } else {
            Ok(self)
        }
    }
}

impl<T> Require<T> for Option<T> {
    fn require(self, name: &str) -> std::result::Result<T, Status> {
        self.ok_or_else(|| Status::invalid_argument(format!("{name} missing in request")))
    }
}

/// Controller errors with structured context.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Rejected(#[from] Rejection),

    #[error(transparent)]
    LockTimeout(#[from] LockTimeout),

    #[error("{operation} for volume {volume} exceeded the request deadline")]
    BackendTimeout {
        operation: &'static str,
        volume: String,
    },

    #[error("invalid capacity range: {reason}")]
    InvalidCapacity { reason: &'static str },

    #[error("endpoint error: {0}")]
    Endpoint(#[from] volkeep_dial::DialError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("gRPC server error: {0}")]
    Server(#[from] tonic::transport::Error),

    #[error("reflection service error: {0}")]
    Reflection(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        match &err {
            // UNIMPLEMENTED: Recognized but unsupported capability or access mode
            Error::Rejected(_) => tonic::Status::unimplemented(err.to_string()),

            // DEADLINE_EXCEEDED: Request deadline elapsed while waiting
            Error::LockTimeout(_) | Error::BackendTimeout { .. } => {
                tonic::Status::deadline_exceeded(err.to_string())
            }

            // INVALID_ARGUMENT: Client provided invalid input
            Error::InvalidCapacity { .. } | Error::Endpoint(_) => {
                tonic::Status::invalid_argument(err.to_string())
            }

            // INTERNAL: Infrastructure errors
            Error::Config(_) | Error::Server(_) | Error::Reflection(_) | Error::Io(_) => {
                tonic::Status::internal(err.to_string())
            }
        }
    }
}
