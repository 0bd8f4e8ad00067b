//! Tor gates: one embedded Tor client per gate.
//!
//! Each gate bootstraps its own arti client with private state and cache
//! directories, so gates correspond to independent Tor instances with
//! their own circuits. Rotating a gate's exit ("NEWNYM") atomically swaps
//! the client for an isolated one; streams opened afterwards use fresh
//! circuits while in-flight streams finish on the old ones.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use arti_client::config::CfgPath;
use arti_client::{TorClient, TorClientConfig};
use http::{Request, Response};
use tor_rtcompat::PreferredRuntime;
use uuid::Uuid;

use pumpe_core::{GateError, Kind};

use super::connector::{BoxedIo, Dialer, GateClient, ProxyBody};
use super::{GateCore, warmup_client};

/// The handle a Tor gate uses to rotate and terminate its embedded
/// client.
#[derive(Debug)]
pub(crate) enum TorControl {
    Arti {
        client: Arc<ArcSwapOption<TorClient<PreferredRuntime>>>,
    },
    #[cfg(test)]
    Mock {
        on_newnym: Option<Arc<dyn Fn() -> Result<(), GateError> + Send + Sync>>,
        on_close: Option<Arc<dyn Fn() -> Result<(), GateError> + Send + Sync>>,
    },
}

impl TorControl {
    fn newnym(&self) -> Result<(), GateError> {
        match self {
            TorControl::Arti { client } => {
                let current = client
                    .load_full()
                    .ok_or_else(|| GateError::Transport("tor client is closed".into()))?;

                client.store(Some(Arc::new(current.isolated_client())));

                Ok(())
            }

            #[cfg(test)]
            TorControl::Mock { on_newnym, .. } => match on_newnym {
                Some(f) => f(),
                None => Ok(()),
            },
        }
    }

    fn close(&self) -> Result<(), GateError> {
        match self {
            TorControl::Arti { client } => {
                // Dropping the last clone tears the instance down.
                client.store(None);
                Ok(())
            }

            #[cfg(test)]
            TorControl::Mock { on_close, .. } => match on_close {
                Some(f) => f(),
                None => Ok(()),
            },
        }
    }
}

#[derive(Debug)]
pub struct TorGate {
    core: GateCore,
    refreshing: AtomicBool,
    ctrl: TorControl,
    dialer: Dialer,
    client: GateClient,
}

impl TorGate {
    /// Bootstrap a fresh embedded Tor client, bounded by `startup_tout`.
    pub async fn create(startup_tout: Duration, http_tout: Duration) -> Result<TorGate, GateError> {
        let id = Uuid::new_v4();

        let base = std::env::temp_dir().join(format!("pumpe-tor-{id}"));
        let state_dir = base.join("state");
        let cache_dir = base.join("cache");
        tokio::fs::create_dir_all(&state_dir).await?;
        tokio::fs::create_dir_all(&cache_dir).await?;

        let mut builder = TorClientConfig::builder();
        builder
            .storage()
            .state_dir(CfgPath::new(state_dir.to_string_lossy().into_owned()))
            .cache_dir(CfgPath::new(cache_dir.to_string_lossy().into_owned()))
            .permissions()
            .dangerously_trust_everyone();
        let config = builder
            .build()
            .map_err(|err| GateError::Transport(err.to_string()))?;

        let client = tokio::time::timeout(startup_tout, TorClient::create_bootstrapped(config))
            .await
            .map_err(|_| GateError::DeadlineExceeded)?
            .map_err(|err| GateError::Transport(err.to_string()))?;

        let slot = Arc::new(ArcSwapOption::new(Some(Arc::new(client))));
        let dialer = Dialer::Tor {
            client: Arc::clone(&slot),
        };
        let http = GateClient::new(dialer.clone(), http_tout);

        Ok(Self::with_parts(id, TorControl::Arti { client: slot }, dialer, http))
    }

    pub(crate) fn with_parts(
        id: Uuid,
        ctrl: TorControl,
        dialer: Dialer,
        client: GateClient,
    ) -> Self {
        Self {
            core: GateCore::new(Kind::Tor, id),
            refreshing: AtomicBool::new(false),
            ctrl,
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

    /// Rotate the exit circuits. At most one refresh runs at a time; a
    /// concurrent call observes [`GateError::GateIsRefreshing`].
    pub(crate) fn refresh(&self) -> Result<(), GateError> {
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(GateError::GateIsRefreshing);
        }

        let out = self.ctrl.newnym();
        self.refreshing.store(false, Ordering::Release);

        out
    }

    pub(crate) async fn close(&self) -> Result<(), GateError> {
        self.ctrl.close()
    }

    pub(crate) async fn warmup(&self) -> Result<Duration, GateError> {
        warmup_client(&self.client).await
    }
}
