//! Exit gates and the set that owns them.
//!
//! Three concrete gate types share a common core (id, kind, state cell)
//! and differ in their transports. The set stores Tor and WireGuard gates
//! in typed maps and hands out [`ExitGate`] handles, a cheap tagged
//! dispatch over `Arc`s of the concrete types, for the duration of a
//! request.

pub(crate) mod connector;
pub mod direct;
pub mod set;
pub mod tor;
pub mod wireguard;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;
use std::time::{Duration, Instant};

use http::{Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use tokio::task::JoinSet;
use tracing::debug;
use uuid::Uuid;

use pumpe_core::{GateError, GateState, Kind, StateCell, join_errs};

pub use connector::{BoxError, BoxedIo, ProxyBody};
pub use direct::DirectGate;
pub use set::GateSet;
pub use tor::TorGate;
pub use wireguard::WireGuardGate;

use connector::{GateClient, empty_body};

/// The warm-up target. A gate is considered functional when it can fetch
/// this URL through its own egress.
pub(crate) const WARMUP_URL: &str = "https://httpbin.org/status/200";

/// Identity and state shared by every gate variant.
#[derive(Debug)]
pub(crate) struct GateCore {
    id: Uuid,
    kind: Kind,
    state: StateCell,
}

impl GateCore {
    pub(crate) fn new(kind: Kind, id: Uuid) -> Self {
        Self {
            id,
            kind,
            state: StateCell::new(),
        }
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn kind(&self) -> Kind {
        self.kind
    }

    pub(crate) fn state(&self) -> &StateCell {
        &self.state
    }
}

/// A borrowed gate: the per-request handle handed out by the set.
#[derive(Clone, Debug)]
pub enum ExitGate {
    Direct(Arc<DirectGate>),
    Tor(Arc<TorGate>),
    WireGuard(Arc<WireGuardGate>),
}

impl ExitGate {
    fn core(&self) -> &GateCore {
        match self {
            ExitGate::Direct(gate) => gate.core(),
            ExitGate::Tor(gate) => gate.core(),
            ExitGate::WireGuard(gate) => gate.core(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.core().id()
    }

    pub fn kind(&self) -> Kind {
        self.core().kind()
    }

    pub fn add_req(&self) {
        self.core().state().add_req();
    }

    pub fn did_req(&self) {
        self.core().state().did_req();
    }

    pub(crate) fn req_count(&self) -> u64 {
        self.core().state().req_count()
    }

    pub(crate) fn state(&self) -> GateState {
        self.core().state().get()
    }

    pub(crate) fn set_state(&self, state: GateState) {
        let cell = self.core().state();
        match state {
            GateState::Ready => cell.to_ready(),
            GateState::Maintenance => cell.to_maintenance(),
            GateState::Closed => cell.to_closed(),
        }
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.core().state().is_ready()
    }

    pub(crate) fn has_no_reqs(&self) -> bool {
        self.core().state().has_no_reqs()
    }

    pub(crate) fn reset_reqs(&self) {
        self.core().state().reset_reqs()
    }

    /// Open a raw TCP connection to `addr` (`host[:port]`) through this
    /// gate's egress.
    pub async fn dial(&self, addr: &str) -> Result<BoxedIo, GateError> {
        match self {
            ExitGate::Direct(gate) => gate.dial(addr).await,
            ExitGate::Tor(gate) => gate.dial(addr).await,
            ExitGate::WireGuard(gate) => gate.dial(addr).await,
        }
    }

    /// Issue an HTTP request through this gate's client.
    pub async fn send(&self, req: Request<ProxyBody>) -> Result<Response<ProxyBody>, GateError> {
        match self {
            ExitGate::Direct(gate) => gate.send(req).await,
            ExitGate::Tor(gate) => gate.send(req).await,
            ExitGate::WireGuard(gate) => gate.send(req).await,
        }
    }

    pub(crate) fn refresh(&self) -> Result<(), GateError> {
        match self {
            ExitGate::Direct(gate) => gate.refresh(),
            ExitGate::Tor(gate) => gate.refresh(),
            ExitGate::WireGuard(gate) => gate.refresh(),
        }
    }

    pub(crate) async fn close(&self) -> Result<(), GateError> {
        match self {
            ExitGate::Direct(gate) => gate.close().await,
            ExitGate::Tor(gate) => gate.close().await,
            ExitGate::WireGuard(gate) => gate.close().await,
        }
    }

    pub(crate) async fn warmup(&self) -> Result<Duration, GateError> {
        match self {
            ExitGate::Direct(gate) => gate.warmup().await,
            ExitGate::Tor(gate) => gate.warmup().await,
            ExitGate::WireGuard(gate) => gate.warmup().await,
        }
    }
}

/// GET the warm-up URL through `client` and measure wall-clock latency.
pub(crate) async fn warmup_client(client: &GateClient) -> Result<Duration, GateError> {
    let req = Request::builder()
        .method(Method::GET)
        .uri(WARMUP_URL)
        .body(empty_body())
        .map_err(|err| GateError::Transport(err.to_string()))?;

    let start = Instant::now();

    let resp = client.send(req).await?;
    let status = resp.status();
    let _ = resp.into_body().collect().await;

    if status != StatusCode::OK {
        return Err(GateError::WarmupBadResponse);
    }

    Ok(start.elapsed())
}

/// Warm up every gate in the list concurrently; per-gate failures are
/// aggregated, not short-circuited.
pub(crate) async fn warmup_list(gates: Vec<ExitGate>) -> Result<(), GateError> {
    if gates.is_empty() {
        return Ok(());
    }

    let mut tasks = JoinSet::new();
    for gate in gates {
        tasks.spawn(async move {
            let latency = gate.warmup().await?;
            debug!(gate.id = %gate.id(), gate.kind = %gate.kind(), ?latency, "gate warmed up");
            Ok::<(), GateError>(())
        });
    }

    join_errs(collect_errs(tasks).await)
}

/// Close every gate in the list concurrently, aggregating failures.
pub(crate) async fn shutdown_list(gates: Vec<ExitGate>) -> Result<(), GateError> {
    if gates.is_empty() {
        return Ok(());
    }

    let mut tasks = JoinSet::new();
    for gate in gates {
        tasks.spawn(async move { gate.close().await });
    }

    join_errs(collect_errs(tasks).await)
}

async fn collect_errs(mut tasks: JoinSet<Result<(), GateError>>) -> Vec<GateError> {
    let mut errs = Vec::new();

    while let Some(res) = tasks.join_next().await {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(err)) => errs.push(err),
            Err(join) => errs.push(GateError::Transport(format!("gate task failed: {join}"))),
        }
    }

    errs
}
