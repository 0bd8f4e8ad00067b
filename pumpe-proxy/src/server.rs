//! The listener: sniffs each accepted connection, hands CONNECT streams
//! straight to the tunnel pipeline, and serves everything else through
//! hyper — management paths into the axum router, absolute-form HTTP into
//! the forward pipeline.

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::Router;
use bytes::{Bytes, BytesMut};
use http::{Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{debug, warn};

use pumpe_core::GateError;

use crate::gate::connector::full_body;
use crate::gate::{BoxError, GateSet, ProxyBody};
use crate::proxy::{ProxyService, text_response};

const CONNECT_PREFIX: &[u8] = b"CONNECT ";

/// Accept connections until the shutdown token fires. In-flight
/// connections drain gracefully.
pub async fn run(
    listener: TcpListener,
    set: Arc<GateSet>,
    admin: Router,
    shutdown: CancellationToken,
) -> io::Result<()> {
    let svc = ProxyService::new(set);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,

            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        continue;
                    }
                };

                let svc = svc.clone();
                let admin = admin.clone();
                let shutdown = shutdown.clone();

                tokio::spawn(async move {
                    if let Err(err) = handle_conn(stream, peer, svc, admin, shutdown).await {
                        debug!(peer = %peer, error = %err, "connection ended with error");
                    }
                });
            }
        }
    }

    Ok(())
}

async fn handle_conn(
    mut stream: TcpStream,
    peer: SocketAddr,
    svc: ProxyService,
    admin: Router,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Sniff just enough bytes to tell CONNECT from everything else.
    let mut sniffed = BytesMut::with_capacity(CONNECT_PREFIX.len());

    loop {
        let seen = sniffed.len().min(CONNECT_PREFIX.len());
        if sniffed[..seen] != CONNECT_PREFIX[..seen] {
            break;
        }
        if sniffed.len() >= CONNECT_PREFIX.len() {
            break;
        }

        let n = stream.read_buf(&mut sniffed).await?;
        if n == 0 {
            return Ok(());
        }
    }

    if sniffed.len() >= CONNECT_PREFIX.len() && &sniffed[..CONNECT_PREFIX.len()] == CONNECT_PREFIX {
        debug!(peer = %peer, "handling connect tunnel");
        svc.handle_connect(stream, sniffed).await?;
        return Ok(());
    }

    let io = TokioIo::new(PrefixedIo::new(sniffed.freeze(), stream));

    let service = service_fn(move |req: Request<Incoming>| {
        let svc = svc.clone();
        let admin = admin.clone();

        async move { route(req, peer, svc, admin).await }
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection_with_upgrades(io, service);
    tokio::pin!(conn);

    tokio::select! {
        res = conn.as_mut() => res?,
        _ = shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            let _ = conn.as_mut().await;
        }
    }

    Ok(())
}

async fn route<B>(
    req: Request<B>,
    peer: SocketAddr,
    svc: ProxyService,
    admin: Router,
) -> Result<Response<ProxyBody>, Infallible>
where
    B: http_body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<BoxError>,
{
    // CONNECT tunnels are served on the raw connection by the accept
    // loop; one that reaches the HTTP machinery instead (an HTTP/2
    // CONNECT does) cannot take ownership of the transport.
    if req.method() == Method::CONNECT {
        let err = GateError::HijackingNotSupported;
        warn!(peer = %peer, "connect request on the http machinery");
        return Ok(text_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()));
    }

    // Management and health paths are origin-form requests addressed to
    // the proxy itself, never proxied traffic.
    if req.uri().scheme().is_none() && req.uri().path().starts_with("/v1/") {
        let resp = match admin.oneshot(req.map(axum::body::Body::new)).await {
            Ok(resp) => resp,
            Err(never) => match never {},
        };

        return Ok(buffer_response(resp).await);
    }

    if req.uri().scheme_str() == Some("http") {
        debug!(peer = %peer, host = %req.uri().host().unwrap_or(""), "handling forward request");

        return match svc.handle_http(req, &peer.ip().to_string()).await {
            Ok(resp) => Ok(resp),
            Err(err) => {
                warn!(peer = %peer, error = %err, "forward request failed");
                Ok(text_response(StatusCode::BAD_GATEWAY, &err.to_string()))
            }
        };
    }

    warn!(peer = %peer, uri = %req.uri(), "unsupported scheme");
    Ok(text_response(StatusCode::BAD_REQUEST, "unsupported scheme"))
}

/// Admin responses are small JSON bodies; buffer them into the unified
/// body type.
async fn buffer_response(resp: Response<axum::body::Body>) -> Response<ProxyBody> {
    let (parts, body) = resp.into_parts();

    let bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            warn!(error = %err, "failed to read admin response body");
            Bytes::new()
        }
    };

    Response::from_parts(parts, full_body(bytes))
}

/// Replays sniffed bytes before reading from the inner stream, so hyper
/// sees the request from its first byte.
struct PrefixedIo {
    prefix: Bytes,
    inner: TcpStream,
}

impl PrefixedIo {
    fn new(prefix: Bytes, inner: TcpStream) -> Self {
        Self { prefix, inner }
    }
}

impl AsyncRead for PrefixedIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix[..n]);
            this.prefix = this.prefix.slice(n..);
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PrefixedIo {
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

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::gate::testing;
    use crate::service::GateAdmin;
    use pumpe_core::Kind;
    use pumpe_core::config::SetConfig;

    async fn spawn_server() -> (SocketAddr, CancellationToken) {
        let set = Arc::new(GateSet::new(
            SetConfig {
                default_kind: Kind::Direct,
                ..SetConfig::default()
            },
            testing::direct_gate(),
            Vec::new(),
            Vec::new(),
        ));

        let admin = crate::admin::router(Arc::new(GateAdmin::new(Arc::clone(&set))));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();

        let token = shutdown.clone();
        tokio::spawn(async move {
            let _ = run(listener, set, admin, token).await;
        });

        (addr, shutdown)
    }

    #[tokio::test]
    async fn serves_management_api_on_proxy_port() {
        let (addr, shutdown) = spawn_server().await;

        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(
            b"GET /v1/_internal/status HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        )
        .await
        .unwrap();

        let mut out = Vec::new();
        conn.read_to_end(&mut out).await.unwrap();
        let text = String::from_utf8_lossy(&out);

        assert!(text.starts_with("HTTP/1.1 200"), "got: {text}");
        assert!(text.contains(r#""status":"ok""#), "got: {text}");

        shutdown.cancel();
    }

    #[tokio::test]
    async fn rejects_origin_form_requests_outside_api() {
        let (addr, shutdown) = spawn_server().await;

        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(
            b"GET /somewhere HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        )
        .await
        .unwrap();

        let mut out = Vec::new();
        conn.read_to_end(&mut out).await.unwrap();
        let text = String::from_utf8_lossy(&out);

        assert!(text.starts_with("HTTP/1.1 400"), "got: {text}");
        assert!(text.contains("unsupported scheme"), "got: {text}");

        shutdown.cancel();
    }

    #[tokio::test]
    async fn connect_on_http_machinery_is_rejected() {
        let set = Arc::new(GateSet::new(
            SetConfig {
                default_kind: Kind::Direct,
                ..SetConfig::default()
            },
            testing::direct_gate(),
            Vec::new(),
            Vec::new(),
        ));
        let admin = crate::admin::router(Arc::new(GateAdmin::new(Arc::clone(&set))));
        let svc = ProxyService::new(set);
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();

        let req = Request::builder()
            .method(Method::CONNECT)
            .uri("example.com:443")
            .body(full_body(""))
            .unwrap();

        let resp = route(req, peer, svc, admin).await.unwrap();

        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"connection hijacking is not supported");
    }

    #[tokio::test]
    async fn connect_is_detected_from_the_first_bytes() {
        let (addr, shutdown) = spawn_server().await;

        let mut conn = TcpStream::connect(addr).await.unwrap();
        // Written in two pieces to exercise the sniffing loop.
        conn.write_all(b"CONN").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.write_all(b"ECT 127.0.0.1:1 HTTP/1.1\r\n\r\n").await.unwrap();

        let mut out = Vec::new();
        conn.read_to_end(&mut out).await.unwrap();
        let text = String::from_utf8_lossy(&out);

        // The duplex peer for the direct gate's test dialer is dropped, so
        // the dial fails and the raw 502 line comes back.
        assert!(text.starts_with("HTTP/1.1 502 Bad Gateway\r\n"), "got: {text}");

        shutdown.cancel();
    }
}
