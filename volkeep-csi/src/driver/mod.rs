//! CSI driver.
//!
//! - `Driver`: binds the configured endpoint and serves the gRPC services
//! - `DriverState`: shared state handed to every service (in `state`)

mod state;

pub use state::DriverState;

use std::fs;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use tokio::net::{TcpListener, UnixListener};
use tonic::transport::Server;
use tracing::{info, warn};
use volkeep_dial::{Endpoint, Scheme};

use crate::backend::Backend;
use crate::config::Config;
use crate::controller::ControllerService;
use crate::csi::{
    FILE_DESCRIPTOR_SET, controller_server::ControllerServer, identity_server::IdentityServer,
};
use crate::error::{Error, Result};
use crate::identity::IdentityService;

/// Execute a cleanup operation, logging any errors without failing.
///
/// Use this for cleanup paths where a failure must not mask the outcome of
/// the main operation.
fn log_cleanup_error<F, E>(operation: &str, f: F)
where
    F: FnOnce() -> std::result::Result<(), E>,
    E: std::fmt::Display,
{
    if let Err(e) = f() {
        warn!(operation, error = %e, "cleanup failed");
    }
}

/// The CSI controller plugin.
pub struct Driver {
    state: Arc<DriverState>,
}

impl Driver {
    pub fn new(config: Config, backend: Arc<dyn Backend>) -> Result<Self> {
        Ok(Self {
            state: Arc::new(DriverState::new(config, backend)?),
        })
    }

    pub fn state(&self) -> &Arc<DriverState> {
        &self.state
    }

    /// Serve until the process is killed.
    pub async fn run(&self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves, then drain in-flight requests.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let endpoint = Endpoint::parse(&self.state.config.endpoint)?;
        info!(
            name = %self.state.config.name,
            version = %self.state.config.version,
            %endpoint,
            "starting CSI controller"
        );

        let state = self.state.clone();
        let shutdown = async move {
            shutdown.await;
            state.stop_accepting();
        };

        match endpoint.scheme() {
            Scheme::Unix => self.run_unix(endpoint.address(), shutdown).await,
            Scheme::Tcp => self.run_tcp(endpoint.address(), shutdown).await,
        }
    }

    async fn run_unix<F>(&self, path: &str, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // A socket left behind by a previous run would make bind fail.
        if Path::new(path).exists() {
            fs::remove_file(path)?;
        }
        if let Some(parent) = Path::new(path).parent() {
            fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(path)?;
        let incoming = tokio_stream::wrappers::UnixListenerStream::new(listener);

        let result = self.serve_grpc(incoming, shutdown).await;
        log_cleanup_error("remove socket file", || fs::remove_file(path));
        result
    }

    async fn run_tcp<F>(&self, addr: &str, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(addr).await?;
        let incoming = tokio_stream::wrappers::TcpListenerStream::new(listener);

        self.serve_grpc(incoming, shutdown).await
    }

    async fn serve_grpc<S, IO, E, F>(&self, incoming: S, shutdown: F) -> Result<()>
    where
        S: tokio_stream::Stream<Item = std::result::Result<IO, E>> + Send + 'static,
        IO: tokio::io::AsyncRead
            + tokio::io::AsyncWrite
            + tonic::transport::server::Connected
            + Send
            + Unpin
            + 'static,
        E: std::error::Error + Send + Sync + 'static,
        F: Future<Output = ()> + Send + 'static,
    {
        let reflection = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
            .build_v1()
            .map_err(|e| Error::Reflection(e.to_string()))?;

        Server::builder()
            .add_service(reflection)
            .add_service(IdentityServer::new(IdentityService::new(
                self.state.clone(),
            )))
            .add_service(ControllerServer::new(ControllerService::new(
                self.state.clone(),
            )))
            .serve_with_incoming_shutdown(incoming, shutdown)
            .await?;

        info!("CSI controller stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;
    use tokio::sync::oneshot;
    use tonic::Request;
    use volkeep_dial::{DialOption, choose_dial_opts, connect};

    use super::*;
    use crate::backend::MemoryBackend;
    use crate::csi;
    use crate::test_util::{create_request, mount_cap};

    use csi::volume_capability::access_mode::Mode;

    #[tokio::test]
    async fn serves_identity_and_controller_over_unix_socket() {
        let temp_dir = TempDir::new().unwrap();
        let socket = temp_dir.path().join("sub").join("csi.sock");
        let endpoint = format!("unix://{}", socket.display());

        let config = Config {
            endpoint: endpoint.clone(),
            ..Default::default()
        };
        let driver = Driver::new(config, Arc::new(MemoryBackend::default())).unwrap();

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            driver
                .run_until(async {
                    let _ = stop_rx.await;
                })
                .await
        });

        // Wait for the listener to appear.
        for _ in 0..100 {
            if socket.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let opts = choose_dial_opts(&endpoint, [DialOption::Timeout(Duration::from_secs(5))]);
        let channel = connect(&endpoint, opts).await.unwrap();

        let mut identity = csi::identity_client::IdentityClient::new(channel.clone());
        let probe = identity
            .probe(Request::new(csi::ProbeRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(probe.ready, Some(true));

        let mut controller = csi::controller_client::ControllerClient::new(channel);
        let volume = controller
            .create_volume(Request::new(create_request(
                "vol-1",
                vec![mount_cap(Mode::SingleNodeWriter)],
            )))
            .await
            .unwrap()
            .into_inner()
            .volume
            .unwrap();
        assert_eq!(volume.volume_id, "vol-1");

        let err = controller
            .create_volume(Request::new(create_request("", vec![mount_cap(
                Mode::SingleNodeWriter,
            )])))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
        assert_eq!(err.message(), "Name missing in request");

        stop_tx.send(()).unwrap();
        server.await.unwrap().unwrap();
        assert!(!socket.exists(), "socket file is removed on shutdown");
    }

    #[tokio::test]
    async fn lock_wait_past_deadline_is_deadline_exceeded_over_the_wire() {
        let temp_dir = TempDir::new().unwrap();
        let socket = temp_dir.path().join("csi.sock");
        let endpoint = format!("unix://{}", socket.display());

        let config = Config {
            endpoint: endpoint.clone(),
            ..Default::default()
        };
        let backend = Arc::new(MemoryBackend::default());
        let driver = Driver::new(config, backend.clone()).unwrap();
        let state = driver.state().clone();
        let _held = state.locks().lock("vol-1").await;

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            driver
                .run_until(async {
                    let _ = stop_rx.await;
                })
                .await
        });
        for _ in 0..100 {
            if socket.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let channel = connect(&endpoint, choose_dial_opts(&endpoint, []))
            .await
            .unwrap();
        let mut controller = csi::controller_client::ControllerClient::new(channel);
        let mut request = Request::new(create_request(
            "vol-1",
            vec![mount_cap(Mode::SingleNodeWriter)],
        ));
        request.set_timeout(Duration::from_millis(100));
        let err = controller.create_volume(request).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::DeadlineExceeded);
        assert_eq!(backend.volume_count(), 0);

        stop_tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn replaces_stale_socket_file() {
        let temp_dir = TempDir::new().unwrap();
        let socket = temp_dir.path().join("csi.sock");
        fs::write(&socket, b"stale").unwrap();

        let config = Config {
            endpoint: format!("unix://{}", socket.display()),
            ..Default::default()
        };
        let driver = Driver::new(config, Arc::new(MemoryBackend::default())).unwrap();
        driver.run_until(async {}).await.unwrap();
    }

    #[test]
    fn new_rejects_bad_endpoint() {
        let config = Config {
            endpoint: "ftp://example.com".to_string(),
            ..Default::default()
        };
        let result = Driver::new(config, Arc::new(MemoryBackend::default()));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
