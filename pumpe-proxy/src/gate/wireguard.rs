//! WireGuard gates over the in-process userspace device.
//!
//! Born at startup from parsed `.conf` files, never refreshed, never
//! created at runtime. Closing brings the device down and then destroys
//! it, best effort.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use http::{Request, Response};
use uuid::Uuid;

use pumpe_core::wgconf::WgConfig;
use pumpe_core::{GateError, Kind};

use super::connector::{BoxedIo, Dialer, GateClient, ProxyBody};
use super::{GateCore, warmup_client};
use crate::netstack::WgDevice;

#[derive(Debug)]
pub(crate) enum WgHandle {
    Device(Arc<WgDevice>),
    #[cfg(test)]
    Mock {
        on_down: Option<Arc<dyn Fn() -> Result<(), GateError> + Send + Sync>>,
    },
}

impl WgHandle {
    fn down(&self) -> Result<(), GateError> {
        match self {
            WgHandle::Device(dev) => dev.down(),

            #[cfg(test)]
            WgHandle::Mock { on_down } => match on_down {
                Some(f) => f(),
                None => Ok(()),
            },
        }
    }

    fn close(&self) {
        match self {
            WgHandle::Device(dev) => dev.close(),

            #[cfg(test)]
            WgHandle::Mock { .. } => {}
        }
    }
}

#[derive(Debug)]
pub struct WireGuardGate {
    core: GateCore,
    dev: WgHandle,
    dialer: Dialer,
    client: GateClient,
}

impl WireGuardGate {
    /// Bring up a userspace device for `cfg` and wrap it as a gate.
    pub async fn create(
        cfg: &WgConfig,
        dns: IpAddr,
        http_tout: Duration,
    ) -> Result<WireGuardGate, GateError> {
        let dev = Arc::new(WgDevice::create(cfg, dns).await?);

        let dialer = Dialer::WireGuard {
            device: Arc::clone(&dev),
        };
        let client = GateClient::new(dialer.clone(), http_tout);

        Ok(Self::with_parts(
            Uuid::new_v4(),
            WgHandle::Device(dev),
            dialer,
            client,
        ))
    }

    pub(crate) fn with_parts(
        id: Uuid,
        dev: WgHandle,
        dialer: Dialer,
        client: GateClient,
    ) -> Self {
        Self {
            core: GateCore::new(Kind::WireGuard, id),
            dev,
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
        self.dev.down()?;
        self.dev.close();

        Ok(())
    }

    pub(crate) async fn warmup(&self) -> Result<Duration, GateError> {
        warmup_client(&self.client).await
    }
}
