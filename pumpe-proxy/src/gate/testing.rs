//! Test fakes: in-memory dialers and canned HTTP doers, so gate and
//! pipeline behaviour can be exercised without any real network.

use std::io;
use std::sync::Arc;

use http::{Request, Response, StatusCode};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use uuid::Uuid;

use pumpe_core::{DIRECT_GATE_ID, GateError};

use super::connector::{BoxedIo, Dialer, GateClient, ProxyBody, full_body};
use super::direct::DirectGate;
use super::tor::{TorControl, TorGate};
use super::wireguard::{WgHandle, WireGuardGate};

type DialFn = dyn Fn(&str, u16) -> io::Result<BoxedIo> + Send + Sync;

/// A dialer backed by a closure, usually producing in-memory duplex
/// connections.
#[derive(Clone)]
pub(crate) struct MemDialer {
    inner: Arc<DialFn>,
}

impl MemDialer {
    pub(crate) fn new(f: impl Fn(&str, u16) -> io::Result<BoxedIo> + Send + Sync + 'static) -> Self {
        Self { inner: Arc::new(f) }
    }

    /// Every dial opens a fresh duplex pair; the far end is delivered on
    /// the returned channel for the test to drive.
    pub(crate) fn pair() -> (Self, mpsc::UnboundedReceiver<DuplexStream>) {
        let (tx, rx) = mpsc::unbounded_channel();

        let dialer = Self::new(move |_host, _port| {
            let (near, far) = tokio::io::duplex(64 * 1024);
            tx.send(far)
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "test receiver dropped"))?;
            Ok(Box::new(near) as BoxedIo)
        });

        (dialer, rx)
    }

    /// A dialer that always fails with `msg`.
    pub(crate) fn failing(msg: &'static str) -> Self {
        Self::new(move |_host, _port| Err(io::Error::other(msg)))
    }

    pub(crate) fn dial(&self, host: &str, port: u16) -> io::Result<BoxedIo> {
        (self.inner)(host, port)
    }
}

type DoFn = dyn Fn(Request<ProxyBody>) -> Result<Response<ProxyBody>, GateError> + Send + Sync;

/// An HTTP doer backed by a closure.
#[derive(Clone)]
pub(crate) struct MockDoer {
    inner: Arc<DoFn>,
}

impl MockDoer {
    pub(crate) fn new(
        f: impl Fn(Request<ProxyBody>) -> Result<Response<ProxyBody>, GateError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self { inner: Arc::new(f) }
    }

    /// Always answers 200 with an empty body.
    pub(crate) fn ok() -> Self {
        Self::with_status(StatusCode::OK)
    }

    pub(crate) fn with_status(status: StatusCode) -> Self {
        Self::new(move |_req| {
            Ok(Response::builder()
                .status(status)
                .body(full_body(""))
                .expect("static response"))
        })
    }

    pub(crate) fn failing(err: fn() -> GateError) -> Self {
        Self::new(move |_req| Err(err()))
    }

    pub(crate) fn send(&self, req: Request<ProxyBody>) -> Result<Response<ProxyBody>, GateError> {
        (self.inner)(req)
    }
}

pub(crate) fn direct_gate() -> DirectGate {
    let (dialer, _) = MemDialer::pair();
    DirectGate::with_parts(DIRECT_GATE_ID, Dialer::Mem(dialer), GateClient::Mock(MockDoer::ok()))
}

pub(crate) fn direct_gate_with(dialer: MemDialer, doer: MockDoer) -> DirectGate {
    DirectGate::with_parts(DIRECT_GATE_ID, Dialer::Mem(dialer), GateClient::Mock(doer))
}

pub(crate) fn tor_gate(id: Uuid) -> TorGate {
    tor_gate_with_ctrl(
        id,
        TorControl::Mock {
            on_newnym: None,
            on_close: None,
        },
    )
}

pub(crate) fn tor_gate_with_ctrl(id: Uuid, ctrl: TorControl) -> TorGate {
    let (dialer, _) = MemDialer::pair();
    TorGate::with_parts(id, ctrl, Dialer::Mem(dialer), GateClient::Mock(MockDoer::ok()))
}

pub(crate) fn tor_gate_with_doer(id: Uuid, doer: MockDoer) -> TorGate {
    let (dialer, _) = MemDialer::pair();
    TorGate::with_parts(
        id,
        TorControl::Mock {
            on_newnym: None,
            on_close: None,
        },
        Dialer::Mem(dialer),
        GateClient::Mock(doer),
    )
}

pub(crate) fn wg_gate(id: Uuid) -> WireGuardGate {
    wg_gate_with(id, WgHandle::Mock { on_down: None }, MockDoer::ok())
}

pub(crate) fn wg_gate_with(id: Uuid, dev: WgHandle, doer: MockDoer) -> WireGuardGate {
    let (dialer, _) = MemDialer::pair();
    WireGuardGate::with_parts(id, dev, Dialer::Mem(dialer), GateClient::Mock(doer))
}
