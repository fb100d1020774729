//! Per-request call context.
//!
//! gRPC clients send their deadline as a `grpc-timeout` header. The controller
//! turns it into an absolute [`Instant`] once, on arrival, and uses it to bound
//! both the wait for a volume lock and the backend call.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tonic::metadata::MetadataMap;

use crate::error::Error;

const GRPC_TIMEOUT_HEADER: &str = "grpc-timeout";
/// The gRPC wire format allows at most eight digits.
const GRPC_TIMEOUT_MAX_DIGITS: usize = 8;
/// Taken off the client's timeout so the controller answers
/// `DEADLINE_EXCEEDED` before tonic's own `grpc-timeout` layer cancels the
/// call. Never more than half the timeout.
pub const DEADLINE_MARGIN: Duration = Duration::from_millis(20);

/// Deadline information carried from the inbound request to the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallContext {
    deadline: Option<Instant>,
}

impl CallContext {
    /// A context without a deadline.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// Build a context from request metadata. A missing or malformed
    /// `grpc-timeout` header means no deadline. The deadline lands
    /// [`DEADLINE_MARGIN`] ahead of the client's.
    pub fn from_metadata(metadata: &MetadataMap) -> Self {
        let timeout = metadata
            .get(GRPC_TIMEOUT_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_grpc_timeout);
        match timeout {
            Some(timeout) => Self::with_timeout(timeout - DEADLINE_MARGIN.min(timeout / 2)),
            None => Self::background(),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, zero once it has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// The earlier of the request deadline and `now + cap`.
    pub fn capped_deadline(&self, cap: Option<Duration>) -> Option<Instant> {
        let capped = cap.map(|c| Instant::now() + c);
        match (self.deadline, capped) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Run a backend call, failing with `DEADLINE_EXCEEDED` if the request
    /// deadline passes first. Backend errors are returned unchanged.
    pub async fn run<F, T>(
        &self,
        operation: &'static str,
        volume: &str,
        call: F,
    ) -> Result<T, tonic::Status>
    where
        F: Future<Output = Result<T, tonic::Status>>,
    {
        let Some(deadline) = self.deadline else {
            return call.await;
        };
        match tokio::time::timeout_at(deadline, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::BackendTimeout {
                operation,
                volume: volume.to_string(),
            }
            .into()),
        }
    }
}

/// Parse a `grpc-timeout` value: up to eight ASCII digits followed by one of
/// `H`, `M`, `S`, `m`, `u`, `n`.
pub fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    let unit = value.chars().last()?;
    let digits = &value[..value.len() - unit.len_utf8()];
    if digits.is_empty()
        || digits.len() > GRPC_TIMEOUT_MAX_DIGITS
        || !digits.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    let amount: u64 = digits.parse().ok()?;

    let timeout = match unit {
        'H' => Duration::from_secs(amount * 60 * 60),
        'M' => Duration::from_secs(amount * 60),
        'S' => Duration::from_secs(amount),
        'm' => Duration::from_millis(amount),
        'u' => Duration::from_micros(amount),
        'n' => Duration::from_nanos(amount),
        _ => return None,
    };
    Some(timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn parse_grpc_timeout_units() {
        assert_eq!(parse_grpc_timeout("2H"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_grpc_timeout("3M"), Some(Duration::from_secs(180)));
        assert_eq!(parse_grpc_timeout("10S"), Some(Duration::from_secs(10)));
        assert_eq!(parse_grpc_timeout("250m"), Some(Duration::from_millis(250)));
        assert_eq!(parse_grpc_timeout("99u"), Some(Duration::from_micros(99)));
        assert_eq!(parse_grpc_timeout("5n"), Some(Duration::from_nanos(5)));
    }

    #[test]
    fn parse_grpc_timeout_rejects_malformed() {
        assert_eq!(parse_grpc_timeout(""), None);
        assert_eq!(parse_grpc_timeout("S"), None);
        assert_eq!(parse_grpc_timeout("10"), None);
        assert_eq!(parse_grpc_timeout("10s"), None);
        assert_eq!(parse_grpc_timeout("-1S"), None);
        assert_eq!(parse_grpc_timeout("123456789S"), None);
    }

    #[tokio::test]
    async fn from_metadata_reads_grpc_timeout() {
        let mut metadata = MetadataMap::new();
        metadata.insert(GRPC_TIMEOUT_HEADER, "5S".parse().unwrap());
        let ctx = CallContext::from_metadata(&metadata);
        let remaining = ctx.remaining().unwrap();
        assert!(remaining <= Duration::from_secs(5));
        assert!(remaining > Duration::from_secs(4));

        assert_eq!(CallContext::from_metadata(&MetadataMap::new()).deadline(), None);
    }

    #[tokio::test]
    async fn from_metadata_finishes_ahead_of_client_deadline() {
        let mut metadata = MetadataMap::new();
        metadata.insert(GRPC_TIMEOUT_HEADER, "100m".parse().unwrap());
        let remaining = CallContext::from_metadata(&metadata).remaining().unwrap();
        assert!(remaining <= Duration::from_millis(100) - DEADLINE_MARGIN);

        // Short timeouts keep at least half their budget.
        metadata.insert(GRPC_TIMEOUT_HEADER, "10m".parse().unwrap());
        let remaining = CallContext::from_metadata(&metadata).remaining().unwrap();
        assert!(remaining <= Duration::from_millis(5));
        assert!(remaining > Duration::from_millis(2));
    }

    #[tokio::test]
    async fn capped_deadline_picks_earlier() {
        let ctx = CallContext::with_timeout(Duration::from_secs(60));
        let capped = ctx.capped_deadline(Some(Duration::from_millis(10))).unwrap();
        assert!(capped < ctx.deadline().unwrap());

        let ctx = CallContext::background();
        assert_eq!(ctx.capped_deadline(None), None);
        assert!(ctx.capped_deadline(Some(Duration::from_secs(1))).is_some());
    }

    #[tokio::test]
    async fn run_times_out_slow_call() {
        let ctx = CallContext::with_timeout(Duration::from_millis(5));
        let err = ctx
            .run("create_volume", "vol-1", std::future::pending::<Result<(), tonic::Status>>())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::DeadlineExceeded);
    }

    #[tokio::test]
    async fn run_passes_backend_errors_through() {
        let ctx = CallContext::with_timeout(Duration::from_secs(5));
        let err = ctx
            .run("check_volume_exists", "vol-1", async {
                Err::<(), _>(tonic::Status::not_found("vol-1 gone"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
        assert_eq!(err.message(), "vol-1 gone");
    }
}
