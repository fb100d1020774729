//! Shared driver state.
//!
//! One [`DriverState`] is shared by every service through an `Arc`. It holds
//! the validated configuration, the backend, and the per-volume lock table.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::config::Config;
use crate::context::CallContext;
use crate::csi::controller_service_capability::rpc::Type as RpcType;
use crate::error::{Error, Result};
use crate::keylock::{KeyGuard, KeyLock};

pub struct DriverState {
    pub config: Config,
    backend: Arc<dyn Backend>,
    locks: KeyLock,
    /// Resolved once from `config.controller.capabilities`.
    capabilities: Vec<RpcType>,
    /// Cleared once shutdown starts and in-flight requests are draining.
    accepting: AtomicBool,
}

impl DriverState {
    pub fn new(config: Config, backend: Arc<dyn Backend>) -> Result<Self> {
        config.validate()?;
        let capabilities = config.controller.rpc_capabilities()?;
        Ok(Self {
            config,
            backend,
            locks: KeyLock::new(),
            capabilities,
            accepting: AtomicBool::new(true),
        })
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn capabilities(&self) -> &[RpcType] {
        &self.capabilities
    }

    pub fn locks(&self) -> &KeyLock {
        &self.locks
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Mark the driver as draining. Probe reports not-ready from here on.
    pub fn stop_accepting(&self) {
        if self.accepting.swap(false, Ordering::AcqRel) {
            info!(in_flight = self.locks.len(), "draining in-flight requests");
        }
    }

    /// Take exclusive hold of a volume name for the rest of a request.
    ///
    /// The wait is bounded by the request deadline, further capped by
    /// `controller.lock_wait_timeout_ms` when configured.
    pub async fn lock_volume(&self, name: &str, ctx: &CallContext) -> Result<KeyGuard> {
        let deadline = ctx.capped_deadline(self.config.controller.lock_wait_timeout());
        if self.locks.is_locked(name) {
            debug!(volume = name, "waiting for in-flight request on volume");
        }
        self.locks.lock_until(name, deadline).await.map_err(|e| {
            warn!(volume = name, "gave up waiting for volume lock");
            Error::from(e)
        })
    }
}

impl std::fmt::Debug for DriverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverState")
            .field("config", &self.config)
            .field("locks", &self.locks)
            .field("capabilities", &self.capabilities)
            .field("accepting", &self.is_accepting())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backend::MemoryBackend;
    use crate::config::ConfigError;

    fn state_with(config: Config) -> Result<DriverState> {
        DriverState::new(config, Arc::new(MemoryBackend::default()))
    }

    #[test]
    fn new_resolves_capabilities() {
        let state = state_with(Config::default()).unwrap();
        assert_eq!(state.capabilities(), &[RpcType::CreateDeleteVolume]);
    }

    #[test]
    fn stop_accepting_is_sticky() {
        let state = state_with(Config::default()).unwrap();
        assert!(state.is_accepting());
        state.stop_accepting();
        state.stop_accepting();
        assert!(!state.is_accepting());
    }

    #[test]
    fn new_rejects_invalid_config() {
        let mut config = Config::default();
        config.controller.capabilities = vec!["NOT_A_CAPABILITY".to_string()];
        let err = state_with(config).unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ConfigError::UnknownCapability { .. })
        ));
    }

    #[tokio::test]
    async fn lock_volume_honors_configured_cap() {
        let mut config = Config::default();
        config.controller.lock_wait_timeout_ms = Some(10);
        let state = state_with(config).unwrap();

        let ctx = CallContext::with_timeout(Duration::from_secs(30));
        let _held = state.lock_volume("vol-a", &ctx).await.unwrap();

        let started = tokio::time::Instant::now();
        let err = state.lock_volume("vol-a", &ctx).await.unwrap_err();
        assert!(matches!(err, Error::LockTimeout(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn lock_volume_honors_request_deadline() {
        let state = state_with(Config::default()).unwrap();
        let _held = state
            .lock_volume("vol-a", &CallContext::background())
            .await
            .unwrap();

        let ctx = CallContext::with_timeout(Duration::from_millis(10));
        let status: tonic::Status = state.lock_volume("vol-a", &ctx).await.unwrap_err().into();
        assert_eq!(status.code(), tonic::Code::DeadlineExceeded);
    }
}
