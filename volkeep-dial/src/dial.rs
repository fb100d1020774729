//! Deadline-bounded dialing and gRPC channel construction.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};
use tonic::transport::{Channel, ClientTlsConfig, Uri};
use tower::service_fn;
use tracing::debug;

use crate::endpoint::{Endpoint, Scheme, UNIX_PREFIX};
use crate::error::DialError;

/// Connect deadline used by the custom dialer when no
/// [`DialOption::ConnectTimeout`] is given.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Authority placed in the request URI when the custom dialer picks the
/// actual target. gRPC still needs a well-formed `:authority`.
const PLACEHOLDER_AUTHORITY: &str = "localhost";

/// A live stream to an endpoint.
#[derive(Debug)]
pub enum Connection {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Unix(stream) => Pin::new(stream).poll_write_vectored(cx, bufs),
            Self::Tcp(stream) => Pin::new(stream).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            Self::Unix(stream) => stream.is_write_vectored(),
            Self::Tcp(stream) => stream.is_write_vectored(),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Unix(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tcp(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Run a connect future, failing with [`DialError::DeadlineExceeded`] if it
/// does not finish within `timeout`.
pub async fn with_deadline<F, T>(
    endpoint: &str,
    timeout: Duration,
    connect: F,
) -> Result<T, DialError>
where
    F: Future<Output = io::Result<T>>,
{
    match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(conn)) => Ok(conn),
        Ok(Err(source)) => Err(DialError::Connect {
            endpoint: endpoint.to_string(),
            source,
        }),
        Err(_) => Err(DialError::DeadlineExceeded {
            endpoint: endpoint.to_string(),
            timeout,
        }),
    }
}

/// Resolve `endpoint` and connect to it within `timeout`.
pub async fn dial(endpoint: &str, timeout: Duration) -> Result<Connection, DialError> {
    dial_with(endpoint, timeout, open).await
}

async fn open(endpoint: Endpoint) -> io::Result<Connection> {
    match endpoint.scheme() {
        Scheme::Unix => UnixStream::connect(endpoint.address())
            .await
            .map(Connection::Unix),
        Scheme::Tcp => TcpStream::connect(endpoint.address())
            .await
            .map(Connection::Tcp),
    }
}

async fn dial_with<F, Fut>(
    endpoint: &str,
    timeout: Duration,
    open: F,
) -> Result<Connection, DialError>
where
    F: FnOnce(Endpoint) -> Fut,
    Fut: Future<Output = io::Result<Connection>>,
{
    let resolved = Endpoint::parse(endpoint)?;
    debug!(endpoint = %resolved, ?timeout, "dialing");
    with_deadline(endpoint, timeout, open(resolved)).await
}

/// Options applied when building a gRPC channel with [`connect`].
#[derive(Debug, Clone)]
pub enum DialOption {
    /// Make every connection through [`dial`] instead of tonic's TCP
    /// connector. Required for Unix-domain endpoints.
    CustomDialer,
    /// Plaintext transport.
    Insecure,
    /// Deadline for establishing a connection.
    ConnectTimeout(Duration),
    /// Deadline applied to every request on the channel.
    Timeout(Duration),
    /// TLS transport.
    Tls(ClientTlsConfig),
    UserAgent(String),
}

/// Default options for `endpoint`, followed by `opts`.
///
/// Unix-domain endpoints get [`DialOption::CustomDialer`] and
/// [`DialOption::Insecure`] in front of the caller's options. Anything else
/// gets the caller's options unchanged.
pub fn choose_dial_opts(
    endpoint: &str,
    opts: impl IntoIterator<Item = DialOption>,
) -> Vec<DialOption> {
    if endpoint.starts_with(UNIX_PREFIX) {
        [DialOption::CustomDialer, DialOption::Insecure]
            .into_iter()
            .chain(opts)
            .collect()
    } else {
        opts.into_iter().collect()
    }
}

#[derive(Default)]
struct ChannelSettings {
    custom_dialer: bool,
    insecure: bool,
    connect_timeout: Option<Duration>,
    timeout: Option<Duration>,
    tls: Option<ClientTlsConfig>,
    user_agent: Option<String>,
}

impl ChannelSettings {
    fn from_opts(opts: impl IntoIterator<Item = DialOption>) -> Self {
        let mut settings = Self::default();
        for opt in opts {
            match opt {
                DialOption::CustomDialer => settings.custom_dialer = true,
                DialOption::Insecure => settings.insecure = true,
                DialOption::ConnectTimeout(t) => settings.connect_timeout = Some(t),
                DialOption::Timeout(t) => settings.timeout = Some(t),
                DialOption::Tls(config) => settings.tls = Some(config),
                DialOption::UserAgent(ua) => settings.user_agent = Some(ua),
            }
        }
        settings
    }
}

/// Build a gRPC channel to `endpoint` honouring `opts`.
///
/// Transport security must be chosen explicitly: pass [`DialOption::Insecure`]
/// or [`DialOption::Tls`]. [`choose_dial_opts`] does this for Unix sockets.
pub async fn connect(
    endpoint: &str,
    opts: impl IntoIterator<Item = DialOption>,
) -> Result<Channel, DialError> {
    let resolved = Endpoint::parse(endpoint)?;
    let settings = ChannelSettings::from_opts(opts);

    if !settings.insecure && settings.tls.is_none() {
        return Err(DialError::NoTransportSecurity {
            endpoint: endpoint.to_string(),
        });
    }
    if resolved.is_local() && !settings.custom_dialer {
        return Err(DialError::DialerRequired {
            endpoint: endpoint.to_string(),
        });
    }

    let transport_err = |source| DialError::Transport {
        endpoint: endpoint.to_string(),
        source,
    };

    let uri_scheme = if settings.tls.is_some() { "https" } else { "http" };
    let authority = if settings.custom_dialer {
        PLACEHOLDER_AUTHORITY
    } else {
        resolved.address()
    };
    let mut channel = tonic::transport::Endpoint::from_shared(format!("{uri_scheme}://{authority}"))
        .map_err(transport_err)?;

    if let Some(timeout) = settings.timeout {
        channel = channel.timeout(timeout);
    }
    if let Some(timeout) = settings.connect_timeout {
        channel = channel.connect_timeout(timeout);
    }
    if let Some(user_agent) = settings.user_agent {
        channel = channel.user_agent(user_agent).map_err(transport_err)?;
    }
    if let Some(tls) = settings.tls {
        channel = channel.tls_config(tls).map_err(transport_err)?;
    }

    debug!(
        endpoint = %resolved,
        custom_dialer = settings.custom_dialer,
        insecure = settings.insecure,
        "connecting gRPC channel"
    );

    if settings.custom_dialer {
        let target = endpoint.to_string();
        let dial_timeout = settings.connect_timeout.unwrap_or(DEFAULT_DIAL_TIMEOUT);
        channel
            .connect_with_connector(service_fn(move |_: Uri| {
                let target = target.clone();
                async move {
                    dial(&target, dial_timeout)
                        .await
                        .map(TokioIo::new)
                        .map_err(io::Error::from)
                }
            }))
            .await
            .map_err(transport_err)
    } else {
        channel.connect().await.map_err(transport_err)
    }
}
