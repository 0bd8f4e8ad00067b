//! The direct gate: egress over the host's own network. Always present,
//! always ready, never refreshed or closed.

use std::time::Duration;

use http::{Request, Response};
use uuid::Uuid;

use pumpe_core::{DIRECT_GATE_ID, GateError, Kind};

use super::connector::{BoxedIo, Dialer, GateClient, ProxyBody};
use super::{GateCore, warmup_client};

#[derive(Debug)]
pub struct DirectGate {
    core: GateCore,
    dialer: Dialer,
    client: GateClient,
}

impl DirectGate {
    /// The production gate: plain TCP dials and a pooled client, both
    /// bounded by the configured client timeout.
    pub fn new(timeout: Duration) -> Self {
        let dialer = Dialer::Tcp { timeout };
        let client = GateClient::new(dialer.clone(), timeout);

        Self::with_parts(DIRECT_GATE_ID, dialer, client)
    }

    pub(crate) fn with_parts(id: Uuid, dialer: Dialer, client: GateClient) -> Self {
        Self {
            core: GateCore::new(Kind::Direct, id),
            dialer,
            client,
        }
    }

    pub(crate) fn core(&self) -> &GateCore {
        &self.core
    }

    pub fn id(&self) -> Uuid {
        self.core.id()
    }

    pub(crate) async fn dial(&self, addr: &str) -> Result<BoxedIo, GateError> {
        Ok(self.dialer.dial_addr(addr).await?)
    }

    pub(crate) async fn send(
        &self,
        req: Request<ProxyBody>,
    ) -> Result<Response<ProxyBody>, GateError> {
        self.client.send(req).await
    }

    pub(crate) fn refresh(&self) -> Result<(), GateError> {
        Err(GateError::NotImplemented)
    }

    pub(crate) async fn close(&self) -> Result<(), GateError> {
        Ok(())
    }

    pub(crate) async fn warmup(&self) -> Result<Duration, GateError> {
        warmup_client(&self.client).await
    }
}
