//! The per-request proxy pipelines.
//!
//! CONNECT requests are served on the hijacked client connection: the
//! proxy parses the request head itself, dials the destination through
//! the chosen gate, answers with a raw `200 Connection established` line,
//! and copies bytes both ways until the tunnel drains. Plain HTTP
//! requests are rewritten (hop-by-hop hygiene, `X-Forwarded-For`) and
//! issued through the gate's HTTP client, with the upstream response
//! mirrored back.

pub mod headers;

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Request, Response, StatusCode};
use http_body_util::BodyExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

use pumpe_core::{GateError, Kind};

use crate::gate::connector::full_body;
use crate::gate::{BoxError, ExitGate, GateSet, ProxyBody};
use headers::{
    HEADER_GATE_ID, HEADER_GATE_TYPE, append_forwarded_for, copy_headers, remote_addr_from_host,
    strip_connection_headers, strip_hop_headers,
};

const DATA_200: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";
const MAX_HEAD: usize = 8192;

/// Decrements the gate's in-flight counter when the request is done, no
/// matter how the pipeline exits.
struct ReqGuard {
    gate: ExitGate,
}

impl ReqGuard {
    fn new(gate: &ExitGate) -> Self {
        gate.add_req();
        Self { gate: gate.clone() }
    }
}

impl Drop for ReqGuard {
    fn drop(&mut self) {
        self.gate.did_req();
    }
}

/// A response body that keeps the gate's in-flight count held until the
/// last byte has been relayed. The gate must stay referenced while the
/// upstream body is still streaming through it, or a drain could mutate
/// the gate under a live transfer.
struct GuardedBody {
    inner: ProxyBody,
    _guard: ReqGuard,
}

impl GuardedBody {
    fn wrap(inner: ProxyBody, guard: ReqGuard) -> ProxyBody {
        BodyExt::boxed(GuardedBody {
            inner,
            _guard: guard,
        })
    }
}

impl http_body::Body for GuardedBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Result<http_body::Frame<Bytes>, BoxError>>> {
        std::pin::Pin::new(&mut self.get_mut().inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}

#[derive(Clone)]
pub struct ProxyService {
    set: Arc<GateSet>,
}

impl ProxyService {
    pub fn new(set: Arc<GateSet>) -> Self {
        Self { set }
    }

    /// Serve a CONNECT tunnel on the raw (hijacked) client connection.
    /// `initial` holds bytes already consumed from the stream by the
    /// accept loop's sniffing.
    pub async fn handle_connect<S>(&self, mut client: S, mut initial: BytesMut) -> Result<(), GateError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (authority, head, head_len) = read_connect_head(&mut client, &mut initial).await?;
        let leftover = initial.split_off(head_len);

        debug!(authority = %authority, "connect tunnel requested");

        let gate = match self.pick_gate(&head).await {
            Ok(gate) => gate,
            Err(err) => {
                write_err_to_conn(&mut client, &err).await;
                return Err(err);
            }
        };

        let _guard = ReqGuard::new(&gate);

        let addr = remote_addr_from_host(&authority);

        let upstream = match gate.dial(&addr).await {
            Ok(upstream) => upstream,
            Err(err) => {
                write_err_to_conn(&mut client, &err).await;
                return Err(err);
            }
        };

        client.write_all(DATA_200).await.map_err(GateError::Io)?;

        let (mut client_rd, mut client_wr) = tokio::io::split(client);
        let (mut upstream_rd, mut upstream_wr) = tokio::io::split(upstream);

        if !leftover.is_empty() {
            upstream_wr
                .write_all(&leftover)
                .await
                .map_err(GateError::Io)?;
        }

        // Two copies, each propagating EOF to its peer with a write-close
        // so TLS close-notify style shutdowns pass through cleanly.
        let client_to_upstream = async {
            let _ = tokio::io::copy(&mut client_rd, &mut upstream_wr).await;
            let _ = upstream_wr.shutdown().await;
        };

        let upstream_to_client = async {
            let _ = tokio::io::copy(&mut upstream_rd, &mut client_wr).await;
            let _ = client_wr.shutdown().await;
        };

        tokio::join!(client_to_upstream, upstream_to_client);

        Ok(())
    }

    /// Forward a plain (absolute-form) HTTP request through a gate and
    /// mirror the upstream response.
    pub async fn handle_http<B>(
        &self,
        req: Request<B>,
        client_ip: &str,
    ) -> Result<Response<ProxyBody>, GateError>
    where
        B: http_body::Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        let gate = self.pick_gate(req.headers()).await?;

        let guard = ReqGuard::new(&gate);

        let (mut parts, body) = req.into_parts();

        strip_hop_headers(&mut parts.headers);
        strip_connection_headers(&mut parts.headers);
        append_forwarded_for(&mut parts.headers, client_ip);

        let outbound = Request::from_parts(parts, body.map_err(Into::into).boxed());

        let resp = match gate.send(outbound).await {
            Ok(resp) => resp,
            Err(err) => {
                warn!(gate.id = %gate.id(), error = %err, "upstream request failed");
                return Ok(text_response(StatusCode::BAD_GATEWAY, "server error"));
            }
        };

        let (mut parts, body) = resp.into_parts();

        strip_hop_headers(&mut parts.headers);
        strip_connection_headers(&mut parts.headers);

        // The in-flight count stays held until the body finishes
        // streaming to the client.
        let mut out = Response::new(GuardedBody::wrap(body, guard));
        *out.status_mut() = parts.status;
        copy_headers(out.headers_mut(), &parts.headers);

        Ok(out)
    }

    /// Pick a gate from the steering headers: an explicit id wins, then an
    /// explicit kind, then a random ready gate of the default kind.
    pub(crate) async fn pick_gate(&self, headers: &HeaderMap) -> Result<ExitGate, GateError> {
        if let Some(value) = headers.get(HEADER_GATE_ID) {
            let raw = value.to_str().map_err(|_| GateError::InvalidUuid)?;
            if !raw.is_empty() {
                let id = Uuid::parse_str(raw).map_err(|_| GateError::InvalidUuid)?;
                return self.set.by_id(id);
            }
        }

        if let Some(value) = headers.get(HEADER_GATE_TYPE) {
            let raw = value.to_str().map_err(|_| GateError::KindUnknown)?;
            if !raw.is_empty() {
                let kind = Kind::parse(raw)?;
                return self.set.by_kind(kind).await;
            }
        }

        self.set.random().await
    }
}

/// A small plain-text response in the pipeline's body type.
pub(crate) fn text_response(status: StatusCode, msg: &str) -> Response<ProxyBody> {
    let mut resp = Response::new(full_body(msg.to_string()));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp.headers_mut().insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );

    resp
}

/// Read and parse the CONNECT request head, returning the target
/// authority, the request headers, and the head's byte length within
/// `initial`.
async fn read_connect_head<S>(
    client: &mut S,
    initial: &mut BytesMut,
) -> Result<(String, HeaderMap, usize), GateError>
where
    S: AsyncRead + Unpin,
{
    loop {
        {
            let mut header_buf = [httparse::EMPTY_HEADER; 64];
            let mut parsed = httparse::Request::new(&mut header_buf);

            match parsed.parse(initial) {
                Ok(httparse::Status::Complete(head_len)) => {
                    let method = parsed.method.unwrap_or("");
                    if !method.eq_ignore_ascii_case("CONNECT") {
                        return Err(GateError::Transport(format!(
                            "expected CONNECT, got {method}"
                        )));
                    }

                    let authority = parsed.path.unwrap_or("").to_string();

                    let mut head = HeaderMap::new();
                    for header in parsed.headers.iter() {
                        if let (Ok(name), Ok(value)) = (
                            HeaderName::from_bytes(header.name.as_bytes()),
                            HeaderValue::from_bytes(header.value),
                        ) {
                            head.append(name, value);
                        }
                    }

                    return Ok((authority, head, head_len));
                }
                Ok(httparse::Status::Partial) => {}
                Err(err) => {
                    return Err(GateError::Transport(format!("malformed request head: {err}")));
                }
            }
        }

        if initial.len() > MAX_HEAD {
            return Err(GateError::Transport("request head too large".into()));
        }

        let n = client.read_buf(initial).await.map_err(GateError::Io)?;
        if n == 0 {
            return Err(GateError::Transport(
                "client closed before sending request head".into(),
            ));
        }
    }
}

/// Write an HTTP error line straight onto the hijacked connection; no
/// response machinery exists for it at this point.
async fn write_err_to_conn<W: AsyncWrite + Unpin>(conn: &mut W, err: &GateError) {
    let msg = err.to_string();
    let data = format!(
        "HTTP/1.1 502 Bad Gateway\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{msg}",
        msg.len(),
    );

    let _ = conn.write_all(data.as_bytes()).await;
}
