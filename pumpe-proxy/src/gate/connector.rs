//! Per-gate transport plumbing.
//!
//! Every gate carries a [`Dialer`] for raw tunnel connections and a
//! [`GateClient`] for issuing HTTP requests through its own egress. The
//! client is a pooled hyper client over a [`GateConnector`], a
//! `tower::Service<Uri>` that dials through the gate's transport and wraps
//! the stream in TLS when the request scheme asks for it.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use arti_client::TorClient;
use bytes::Bytes;
use http::{Request, Response, Uri};
use http_body_util::BodyExt;
use http_body_util::combinators::BoxBody;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tor_rtcompat::PreferredRuntime;
use tower::Service;

use pumpe_core::GateError;

use crate::netstack::WgDevice;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The unified body type used on both legs of the proxy.
pub type ProxyBody = BoxBody<Bytes, BoxError>;

/// Anything a gate can hand back as a raw tunnel connection.
pub trait GateIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> GateIo for T {}

pub type BoxedIo = Box<dyn GateIo>;

/// An empty request body in the proxy's body type.
pub(crate) fn empty_body() -> ProxyBody {
    http_body_util::Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

/// A full request/response body in the proxy's body type.
pub(crate) fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    http_body_util::Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

/// How a gate opens raw connections.
#[derive(Clone)]
pub(crate) enum Dialer {
    /// Plain TCP from the host network.
    Tcp { timeout: Duration },
    /// Through an embedded Tor client. The slot is emptied on close and
    /// swapped on refresh, so every dial sees the current client.
    Tor {
        client: Arc<ArcSwapOption<TorClient<PreferredRuntime>>>,
    },
    /// Through a userspace WireGuard tunnel.
    WireGuard { device: Arc<WgDevice> },
    /// In-memory connections for tests.
    #[cfg(test)]
    Mem(crate::gate::testing::MemDialer),
}

impl Dialer {
    pub(crate) async fn dial(&self, host: &str, port: u16) -> io::Result<BoxedIo> {
        match self {
            Dialer::Tcp { timeout } => {
                let stream =
                    tokio::time::timeout(*timeout, TcpStream::connect((host, port)))
                        .await
                        .map_err(|_| {
                            io::Error::new(io::ErrorKind::TimedOut, "connect timed out")
                        })??;

                Ok(Box::new(stream))
            }

            Dialer::Tor { client } => {
                let client = client.load_full().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::NotConnected, "tor client is closed")
                })?;

                let stream = client.connect((host, port)).await.map_err(io::Error::other)?;

                Ok(Box::new(stream))
            }

            Dialer::WireGuard { device } => {
                let stream = device.dial(host, port).await?;

                Ok(Box::new(stream))
            }

            #[cfg(test)]
            Dialer::Mem(mem) => mem.dial(host, port),
        }
    }

    /// Dial an `authority` of the `host[:port]` form.
    pub(crate) async fn dial_addr(&self, addr: &str) -> io::Result<BoxedIo> {
        let (host, port) = split_authority(addr)?;
        self.dial(host, port).await
    }
}

/// Split `host:port`, tolerating bracketed IPv6 literals.
pub(crate) fn split_authority(addr: &str) -> io::Result<(&str, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "address has no port"))?;

    let port: u16 = port
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid port"))?;

    Ok((host.trim_matches(['[', ']']), port))
}

fn tls_config() -> Arc<rustls::ClientConfig> {
    static TLS: OnceLock<Arc<rustls::ClientConfig>> = OnceLock::new();

    TLS.get_or_init(|| {
        let roots =
            rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        Arc::new(
            rustls::ClientConfig::builder_with_provider(Arc::new(
                rustls::crypto::ring::default_provider(),
            ))
            .with_safe_default_protocol_versions()
            .expect("ring provider supports the default protocol versions")
            .with_root_certificates(roots)
            .with_no_client_auth(),
        )
    })
    .clone()
}

/// A connection produced by [`GateConnector`], adapted to hyper's I/O
/// traits.
pub(crate) struct GateConn {
    inner: TokioIo<BoxedIo>,
}

impl GateConn {
    fn new(io: BoxedIo) -> Self {
        Self {
            inner: TokioIo::new(io),
        }
    }
}

impl hyper::rt::Read for GateConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl hyper::rt::Write for GateConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl Connection for GateConn {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

/// Dials upstream hosts through a gate's transport, wrapping `https`
/// targets in TLS so a gate's client can fetch secure URLs end to end.
#[derive(Clone)]
pub(crate) struct GateConnector {
    dialer: Dialer,
}

impl GateConnector {
    pub(crate) fn new(dialer: Dialer) -> Self {
        Self { dialer }
    }
}

impl Service<Uri> for GateConnector {
    type Response = GateConn;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<GateConn, BoxError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let dialer = self.dialer.clone();

        Box::pin(async move {
            let host = uri
                .host()
                .ok_or_else(|| format!("request uri has no host: {uri}"))?
                .trim_matches(['[', ']'])
                .to_string();

            let https = uri.scheme_str() == Some("https");
            let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });

            let io = dialer.dial(&host, port).await?;

            if !https {
                return Ok(GateConn::new(io));
            }

            let name = rustls::pki_types::ServerName::try_from(host)?;
            let tls = TlsConnector::from(tls_config()).connect(name, io).await?;

            Ok(GateConn::new(Box::new(tls)))
        })
    }
}

/// A gate's HTTP client. The hyper variant pools connections over the
/// gate's connector and bounds every request by the configured client
/// timeout, mirroring the per-gate client timeout of the wire contract.
#[derive(Clone, Debug)]
pub(crate) enum GateClient {
    Hyper {
        client: Client<GateConnector, ProxyBody>,
        timeout: Duration,
    },
    #[cfg(test)]
    Mock(crate::gate::testing::MockDoer),
}

impl GateClient {
    pub(crate) fn new(dialer: Dialer, timeout: Duration) -> Self {
        let client: Client<GateConnector, ProxyBody> =
            Client::builder(TokioExecutor::new()).build(GateConnector::new(dialer));

        GateClient::Hyper { client, timeout }
    }

    pub(crate) async fn send(
        &self,
        req: Request<ProxyBody>,
    ) -> Result<Response<ProxyBody>, GateError> {
        match self {
            GateClient::Hyper { client, timeout } => {
                let resp = tokio::time::timeout(*timeout, client.request(req))
                    .await
                    .map_err(|_| GateError::DeadlineExceeded)?
                    .map_err(|err| GateError::Transport(err.to_string()))?;

                Ok(resp.map(|body| body.map_err(|err| Box::new(err) as BoxError).boxed()))
            }

            #[cfg(test)]
            GateClient::Mock(doer) => doer.send(req),
        }
    }
}
