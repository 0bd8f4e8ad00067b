//! The gate set: the concurrent registry that owns every gate.
//!
//! Selection hands out gates that are `Ready`; maintenance detaches a gate
//! from discovery first (state change + map removal) and then waits for
//! its in-flight counter to drain before anything destructive happens.
//! Once the shutting latch fires, no new Tor gate is admitted and no new
//! drain starts, while in-flight requests run to completion.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use pumpe_core::config::SetConfig;
use pumpe_core::{GateError, GateMap, GateState, Kind, join_errs};

use super::direct::DirectGate;
use super::tor::TorGate;
use super::wireguard::WireGuardGate;
use super::{ExitGate, shutdown_list, warmup_list};

/// Creates Tor gates for runtime admission.
#[derive(Clone)]
pub(crate) enum TorFactory {
    Arti,
    #[cfg(test)]
    Mock(Arc<dyn Fn() -> Result<TorGate, GateError> + Send + Sync>),
}

impl TorFactory {
    async fn create(
        &self,
        startup_tout: std::time::Duration,
        http_tout: std::time::Duration,
    ) -> Result<TorGate, GateError> {
        match self {
            TorFactory::Arti => TorGate::create(startup_tout, http_tout).await,

            #[cfg(test)]
            TorFactory::Mock(f) => f(),
        }
    }
}

pub struct GateSet {
    cfg: SetConfig,

    shutting: CancellationToken,
    shut_once: AtomicBool,
    warming: AtomicBool,

    direct: Arc<DirectGate>,
    tors: GateMap<TorGate>,
    wgs: GateMap<WireGuardGate>,

    factory: TorFactory,
}

impl GateSet {
    pub fn new(
        cfg: SetConfig,
        direct: DirectGate,
        tors: Vec<TorGate>,
        wgs: Vec<WireGuardGate>,
    ) -> GateSet {
        let tor_map = GateMap::with_capacity(tors.len());
        for gate in tors {
            tor_map.set(gate.id(), Arc::new(gate));
        }

        let wg_map = GateMap::with_capacity(wgs.len());
        for gate in wgs {
            wg_map.set(gate.id(), Arc::new(gate));
        }

        GateSet {
            cfg,
            shutting: CancellationToken::new(),
            shut_once: AtomicBool::new(false),
            warming: AtomicBool::new(false),
            direct: Arc::new(direct),
            tors: tor_map,
            wgs: wg_map,
            factory: TorFactory::Arti,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_factory(mut self, factory: TorFactory) -> GateSet {
        self.factory = factory;
        self
    }

    /// Look up a gate by id; only `Ready` gates are handed out. A gate
    /// that exists but is in maintenance is an observable
    /// [`GateError::GateNotReady`]; a gate mid-refresh has been removed
    /// from the maps and reads as [`GateError::GateNotFound`].
    pub fn by_id(&self, id: Uuid) -> Result<ExitGate, GateError> {
        let gate = self.by_id_any(id)?;

        if !gate.is_ready() {
            return Err(GateError::GateNotReady);
        }

        Ok(gate)
    }

    /// A ready gate of `kind`. Direct is always ready and returns
    /// immediately; the pooled kinds poll until a ready gate appears or
    /// the loop deadline passes.
    pub async fn by_kind(&self, kind: Kind) -> Result<ExitGate, GateError> {
        if kind == Kind::Direct {
            return Ok(ExitGate::Direct(Arc::clone(&self.direct)));
        }

        self.by_kind_ready(kind).await
    }

    /// A ready gate of the default kind, or of a per-request random kind
    /// when kind randomisation is on.
    pub async fn random(&self) -> Result<ExitGate, GateError> {
        self.by_kind(self.kind_or_default()).await
    }

    /// Admit a new Tor gate. The factory runs on a detached task bounded
    /// by the Tor startup timeout, so a management client disconnecting
    /// mid-bootstrap cannot orphan a half-started instance.
    pub async fn create(self: &Arc<Self>, kind: Kind) -> Result<Uuid, GateError> {
        if kind != Kind::Tor {
            return Err(GateError::KindNotSupported);
        }

        // Starting a tor instance takes time; there is little sense in
        // doing it during shutdown.
        if self.is_shutting() {
            return Err(GateError::SetIsShutting);
        }

        if self.tors.len() >= self.cfg.tor_max {
            return Err(GateError::TorMaxReached);
        }

        let set = Arc::clone(self);
        let startup_tout = self.cfg.tor_startup_tout;
        let http_tout = self.cfg.http_timeout;

        let task = tokio::spawn(async move {
            let gate = set.factory.create(startup_tout, http_tout).await?;
            let id = gate.id();
            set.tors.set(id, Arc::new(gate));

            Ok::<Uuid, GateError>(id)
        });

        task.await
            .map_err(|err| GateError::Transport(format!("tor factory task failed: {err}")))?
    }

    /// All gate ids of `kind`.
    pub fn gate_ids(&self, kind: Kind) -> Result<Vec<Uuid>, GateError> {
        match kind {
            Kind::Direct => Ok(vec![self.direct.id()]),
            Kind::Tor => Ok(self.tors.keys()),
            Kind::WireGuard => Ok(self.wgs.keys()),
            Kind::Unknown => Err(GateError::KindUnknown),
        }
    }

    /// Drain and refresh one Tor gate, then re-admit it.
    pub async fn refresh_one(self: &Arc<Self>, id: Uuid) -> Result<(), GateError> {
        let set = Arc::clone(self);

        let task = tokio::spawn(async move { set.refresh_inner(id).await });

        task.await
            .map_err(|err| GateError::Transport(format!("refresh task failed: {err}")))?
    }

    /// Drain and close one gate. The gate does not come back.
    pub async fn close_one(self: &Arc<Self>, id: Uuid) -> Result<(), GateError> {
        let set = Arc::clone(self);

        let task = tokio::spawn(async move { set.close_inner(id).await });

        task.await
            .map_err(|err| GateError::Transport(format!("close task failed: {err}")))?
    }

    /// Warm up all pooled gates in two concurrent groups, one task per
    /// gate. Only one warm-up runs at a time.
    pub async fn warmup(&self) -> Result<(), GateError> {
        if self.is_shutting() {
            return Err(GateError::Joined(vec![GateError::SetIsShutting]));
        }

        if self
            .warming
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(GateError::Joined(vec![GateError::SetIsWarmingUp]));
        }

        let result = self.warmup_all().await;
        self.warming.store(false, Ordering::Release);

        result
    }

    /// Idempotent: the first call closes the latch and fans out `close`
    /// over every pooled gate; later calls return immediately.
    pub async fn shutdown(&self) -> Result<(), GateError> {
        if self.shut_once.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.shutting.cancel();

        let mut groups: JoinSet<Result<(), GateError>> = JoinSet::new();

        let tors: Vec<ExitGate> = self.tors.values().into_iter().map(ExitGate::Tor).collect();
        if !tors.is_empty() {
            groups.spawn(shutdown_list(tors));
        }

        let wgs: Vec<ExitGate> = self.wgs.values().into_iter().map(ExitGate::WireGuard).collect();
        if !wgs.is_empty() {
            groups.spawn(shutdown_list(wgs));
        }

        join_errs(collect_group_errs(groups).await)
    }

    pub(crate) fn is_shutting(&self) -> bool {
        self.shutting.is_cancelled()
    }

    async fn warmup_all(&self) -> Result<(), GateError> {
        let mut groups: JoinSet<Result<(), GateError>> = JoinSet::new();

        let tors: Vec<ExitGate> = self.tors.values().into_iter().map(ExitGate::Tor).collect();
        if !tors.is_empty() {
            groups.spawn(warmup_list(tors));
        }

        let wgs: Vec<ExitGate> = self.wgs.values().into_iter().map(ExitGate::WireGuard).collect();
        if !wgs.is_empty() {
            groups.spawn(warmup_list(wgs));
        }

        join_errs(collect_group_errs(groups).await)
    }

    fn by_id_any(&self, id: Uuid) -> Result<ExitGate, GateError> {
        if id == self.direct.id() {
            return Ok(ExitGate::Direct(Arc::clone(&self.direct)));
        }

        if let Some(gate) = self.tors.get(&id) {
            return Ok(ExitGate::Tor(gate));
        }

        if let Some(gate) = self.wgs.get(&id) {
            return Ok(ExitGate::WireGuard(gate));
        }

        Err(GateError::GateNotFound)
    }

    async fn by_kind_ready(&self, kind: Kind) -> Result<ExitGate, GateError> {
        let wait = async {
            loop {
                if self.is_shutting() {
                    return Err(GateError::SetIsShutting);
                }

                let gate = self.pick(kind)?;
                if gate.is_ready() {
                    return Ok(gate);
                }

                tokio::time::sleep(self.cfg.random_loop_delay).await;
            }
        };

        match tokio::time::timeout(self.cfg.random_loop_tout, wait).await {
            Ok(out) => out,
            Err(_) => Err(GateError::DeadlineExceeded),
        }
    }

    fn pick(&self, kind: Kind) -> Result<ExitGate, GateError> {
        match kind {
            Kind::Direct => Ok(ExitGate::Direct(Arc::clone(&self.direct))),
            Kind::Tor => self
                .tors
                .random()
                .map(ExitGate::Tor)
                .ok_or(GateError::NoRandomGate),
            Kind::WireGuard => self
                .wgs
                .random()
                .map(ExitGate::WireGuard)
                .ok_or(GateError::NoRandomGate),
            Kind::Unknown => Err(GateError::KindUnknown),
        }
    }

    fn kind_or_default(&self) -> Kind {
        self.kind_or_default_n(rand::random::<u64>())
    }

    fn kind_or_default_n(&self, n: u64) -> Kind {
        if !self.cfg.randomise_kinds {
            return self.cfg.default_kind;
        }

        if n % 2 == 0 { Kind::Tor } else { Kind::WireGuard }
    }

    async fn refresh_inner(&self, id: Uuid) -> Result<(), GateError> {
        if id == self.direct.id() {
            return Err(GateError::KindNotSupported);
        }

        let gate = self.by_id_any(id)?;

        if gate.kind() != Kind::Tor {
            return Err(GateError::KindNotSupported);
        }

        self.for_state(&gate, GateState::Maintenance).await?;

        if let Err(err) = gate.refresh() {
            // The gate stays detached in maintenance; the caller may retry.
            warn!(gate.id = %id, error = %err, "refresh failed, gate left in maintenance");
            return Err(err);
        }

        self.to_state(&gate, GateState::Ready);

        Ok(())
    }

    async fn close_inner(&self, id: Uuid) -> Result<(), GateError> {
        if id == self.direct.id() {
            return Err(GateError::KindNotSupported);
        }

        let gate = self.by_id_any(id)?;

        self.for_state(&gate, GateState::Closed).await?;

        gate.close().await
    }

    /// The drain primitive: detach the gate from discovery, then wait for
    /// its in-flight counter to reach zero.
    ///
    /// On a drain deadline the gate has already been moved to `target`
    /// and removed from its map, and either the client gave up or the
    /// gate is busy serving connections. Operations are meant to be
    /// retried, so the revert path restores the gate to its original,
    /// selectable condition rather than leaving it dangling.
    pub(crate) async fn for_state(
        &self,
        gate: &ExitGate,
        target: GateState,
    ) -> Result<(), GateError> {
        let orig = gate.state();
        gate.set_state(target);

        let id = gate.id();
        match gate.kind() {
            Kind::Tor => self.tors.remove(&id),
            Kind::WireGuard => self.wgs.remove(&id),
            _ => {}
        }

        let wait = async {
            loop {
                if self.is_shutting() {
                    return Err(GateError::SetIsShutting);
                }

                if gate.has_no_reqs() {
                    return Ok(());
                }

                tokio::time::sleep(self.cfg.state_loop_delay).await;
            }
        };

        match tokio::time::timeout(self.cfg.state_loop_tout, wait).await {
            Ok(out) => out,
            Err(_) => {
                self.to_state(gate, orig);
                Err(GateError::DeadlineExceeded)
            }
        }
    }

    /// The completion finalizer: zero the in-flight counter, set the
    /// state, and re-admit pooled gates into their map.
    pub(crate) fn to_state(&self, gate: &ExitGate, state: GateState) {
        gate.reset_reqs();
        gate.set_state(state);

        match gate {
            ExitGate::Direct(_) => {}
            ExitGate::Tor(inner) => self.tors.set(inner.id(), Arc::clone(inner)),
            ExitGate::WireGuard(inner) => self.wgs.set(inner.id(), Arc::clone(inner)),
        }
    }

    #[cfg(test)]
    pub(crate) fn tor_map(&self) -> &GateMap<TorGate> {
        &self.tors
    }

    #[cfg(test)]
    pub(crate) fn wg_map(&self) -> &GateMap<WireGuardGate> {
        &self.wgs
    }
}

async fn collect_group_errs(mut groups: JoinSet<Result<(), GateError>>) -> Vec<GateError> {
    let mut errs = Vec::new();

    while let Some(res) = groups.join_next().await {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(err)) => errs.push(err),
            Err(join) => errs.push(GateError::Transport(format!("gate group failed: {join}"))),
        }
    }

    errs
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http::StatusCode;

    use super::super::testing;
    use super::super::tor::TorControl;
    use super::super::wireguard::WgHandle;
    use super::*;
    use pumpe_core::DIRECT_GATE_ID;

    const TOR_ID: Uuid = Uuid::from_u128(0xad0be000_0000_4000_a000_000000000001u128);
    const WG_ID: Uuid = Uuid::from_u128(0xad0be000_0000_4000_a000_000000000002u128);

    fn quick_cfg() -> SetConfig {
        SetConfig {
            random_loop_tout: Duration::from_millis(200),
            random_loop_delay: Duration::from_millis(5),
            state_loop_tout: Duration::from_millis(200),
            state_loop_delay: Duration::from_millis(5),
            ..SetConfig::default()
        }
    }

    fn basic_set(cfg: SetConfig) -> Arc<GateSet> {
        Arc::new(GateSet::new(
            cfg,
            testing::direct_gate(),
            vec![testing::tor_gate(TOR_ID)],
            vec![testing::wg_gate(WG_ID)],
        ))
    }

    #[tokio::test]
    async fn by_id_direct() {
        let set = basic_set(quick_cfg());

        let gate = set.by_id(DIRECT_GATE_ID).unwrap();
        assert_eq!(gate.kind(), Kind::Direct);
        assert_eq!(gate.id(), DIRECT_GATE_ID);
    }

    #[tokio::test]
    async fn by_id_not_found() {
        let set = basic_set(quick_cfg());

        let err = set.by_id(Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, GateError::GateNotFound));
    }

    #[tokio::test]
    async fn by_id_not_ready() {
        let set = basic_set(quick_cfg());

        let gate = set.by_id(TOR_ID).unwrap();
        gate.set_state(GateState::Maintenance);

        let err = set.by_id(TOR_ID).unwrap_err();
        assert!(matches!(err, GateError::GateNotReady));
    }

    #[tokio::test]
    async fn by_kind_direct_is_immediate() {
        let set = basic_set(quick_cfg());

        let gate = set.by_kind(Kind::Direct).await.unwrap();
        assert_eq!(gate.kind(), Kind::Direct);
    }

    #[tokio::test]
    async fn by_kind_returns_ready_gate() {
        let set = basic_set(quick_cfg());

        let gate = set.by_kind(Kind::Tor).await.unwrap();
        assert_eq!(gate.id(), TOR_ID);

        let gate = set.by_kind(Kind::WireGuard).await.unwrap();
        assert_eq!(gate.id(), WG_ID);
    }

    #[tokio::test]
    async fn by_kind_empty_map() {
        let set = Arc::new(GateSet::new(
            quick_cfg(),
            testing::direct_gate(),
            Vec::new(),
            Vec::new(),
        ));

        let err = set.by_kind(Kind::Tor).await.unwrap_err();
        assert!(matches!(err, GateError::NoRandomGate));
    }

    #[tokio::test]
    async fn by_kind_unknown() {
        let set = basic_set(quick_cfg());

        let err = set.by_kind(Kind::Unknown).await.unwrap_err();
        assert!(matches!(err, GateError::KindUnknown));
    }

    #[tokio::test]
    async fn by_kind_shutting() {
        let set = basic_set(quick_cfg());
        set.shutting.cancel();

        let err = set.by_kind(Kind::Tor).await.unwrap_err();
        assert!(matches!(err, GateError::SetIsShutting));
    }

    #[tokio::test]
    async fn by_kind_times_out_when_not_ready() {
        let set = basic_set(quick_cfg());

        set.by_id(TOR_ID).unwrap().set_state(GateState::Maintenance);

        let err = set.by_kind(Kind::Tor).await.unwrap_err();
        assert!(matches!(err, GateError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn by_kind_picks_up_gate_turning_ready() {
        let mut cfg = quick_cfg();
        cfg.random_loop_tout = Duration::from_secs(5);
        let set = basic_set(cfg);

        let gate = set.by_id(TOR_ID).unwrap();
        gate.set_state(GateState::Maintenance);

        let picker = {
            let set = Arc::clone(&set);
            tokio::spawn(async move { set.by_kind(Kind::Tor).await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        gate.set_state(GateState::Ready);

        let picked = picker.await.unwrap().unwrap();
        assert_eq!(picked.id(), TOR_ID);
    }

    #[tokio::test]
    async fn kind_or_default() {
        let set = basic_set(quick_cfg());
        assert_eq!(set.kind_or_default_n(0), Kind::Tor);
        assert_eq!(set.kind_or_default_n(1), Kind::Tor);

        let mut cfg = quick_cfg();
        cfg.default_kind = Kind::Direct;
        cfg.randomise_kinds = true;
        let set = basic_set(cfg);
        assert_eq!(set.kind_or_default_n(2), Kind::Tor);
        assert_eq!(set.kind_or_default_n(3), Kind::WireGuard);
    }

    #[tokio::test]
    async fn create_rejects_non_tor() {
        let set = basic_set(quick_cfg());

        for kind in [Kind::Direct, Kind::WireGuard, Kind::Unknown] {
            let err = set.create(kind).await.unwrap_err();
            assert!(matches!(err, GateError::KindNotSupported));
        }
    }

    #[tokio::test]
    async fn create_inserts_new_gate() {
        let id = Uuid::new_v4();
        let set = Arc::new(
            GateSet::new(quick_cfg(), testing::direct_gate(), Vec::new(), Vec::new())
                .with_factory(TorFactory::Mock(Arc::new(move || {
                    Ok(testing::tor_gate(id))
                }))),
        );

        let created = set.create(Kind::Tor).await.unwrap();
        assert_eq!(created, id);
        assert_eq!(set.tor_map().len(), 1);
        assert!(set.by_id(id).is_ok());
    }

    #[tokio::test]
    async fn create_respects_tor_max() {
        let mut cfg = quick_cfg();
        cfg.tor_max = 1;

        let set = Arc::new(
            GateSet::new(
                cfg,
                testing::direct_gate(),
                vec![testing::tor_gate(TOR_ID)],
                Vec::new(),
            )
            .with_factory(TorFactory::Mock(Arc::new(|| {
                Ok(testing::tor_gate(Uuid::new_v4()))
            }))),
        );

        let err = set.create(Kind::Tor).await.unwrap_err();
        assert!(matches!(err, GateError::TorMaxReached));
        assert_eq!(set.tor_map().len(), 1);
    }

    #[tokio::test]
    async fn create_propagates_factory_error() {
        let set = Arc::new(
            GateSet::new(quick_cfg(), testing::direct_gate(), Vec::new(), Vec::new())
                .with_factory(TorFactory::Mock(Arc::new(|| {
                    Err(GateError::Transport("bootstrap failed".into()))
                }))),
        );

        let err = set.create(Kind::Tor).await.unwrap_err();
        assert_eq!(err.to_string(), "bootstrap failed");
        assert_eq!(set.tor_map().len(), 0);
    }

    #[tokio::test]
    async fn shutdown_poisons_create() {
        let set = basic_set(quick_cfg());

        set.shutdown().await.unwrap();

        let err = set.create(Kind::Tor).await.unwrap_err();
        assert!(matches!(err, GateError::SetIsShutting));
    }

    #[tokio::test]
    async fn gate_ids_per_kind() {
        let set = basic_set(quick_cfg());

        assert_eq!(set.gate_ids(Kind::Direct).unwrap(), vec![DIRECT_GATE_ID]);
        assert_eq!(set.gate_ids(Kind::Tor).unwrap(), vec![TOR_ID]);
        assert_eq!(set.gate_ids(Kind::WireGuard).unwrap(), vec![WG_ID]);
        assert!(matches!(
            set.gate_ids(Kind::Unknown),
            Err(GateError::KindUnknown)
        ));
    }

    #[tokio::test]
    async fn for_state_detaches_gate() {
        let set = basic_set(quick_cfg());

        let gate = set.by_id(TOR_ID).unwrap();
        set.for_state(&gate, GateState::Maintenance).await.unwrap();

        assert_eq!(gate.state(), GateState::Maintenance);
        assert!(set.tor_map().get(&TOR_ID).is_none());
        // Detached mid-maintenance reads as not found, not not-ready.
        assert!(matches!(set.by_id(TOR_ID), Err(GateError::GateNotFound)));
    }

    #[tokio::test]
    async fn for_state_wireguard() {
        let set = basic_set(quick_cfg());

        let gate = set.by_id(WG_ID).unwrap();
        set.for_state(&gate, GateState::Maintenance).await.unwrap();

        assert_eq!(gate.state(), GateState::Maintenance);
        assert!(set.wg_map().get(&WG_ID).is_none());
    }

    #[tokio::test]
    async fn for_state_shutting_leaves_gate_detached() {
        let set = basic_set(quick_cfg());
        set.shutting.cancel();

        let gate = set.by_id(TOR_ID).unwrap();
        gate.add_req();

        let err = set
            .for_state(&gate, GateState::Maintenance)
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::SetIsShutting));
        assert_eq!(gate.state(), GateState::Maintenance);
        assert!(!gate.has_no_reqs());
    }

    #[tokio::test]
    async fn for_state_deadline_restores_gate() {
        let set = basic_set(quick_cfg());

        let gate = set.by_id(TOR_ID).unwrap();
        gate.add_req();

        let err = set
            .for_state(&gate, GateState::Maintenance)
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::DeadlineExceeded));

        // Reverted: back in the map, original state, counter zeroed by
        // the shared finalizer.
        assert_eq!(gate.state(), GateState::Ready);
        assert!(set.tor_map().get(&TOR_ID).is_some());
        assert_eq!(gate.req_count(), 0);
    }

    #[tokio::test]
    async fn for_state_waits_for_drain() {
        let mut cfg = quick_cfg();
        cfg.state_loop_tout = Duration::from_secs(5);
        let set = basic_set(cfg);

        let gate = set.by_id(TOR_ID).unwrap();
        gate.add_req();

        let drainer = {
            let set = Arc::clone(&set);
            let gate = gate.clone();
            tokio::spawn(async move { set.for_state(&gate, GateState::Closed).await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        gate.did_req();

        drainer.await.unwrap().unwrap();
        assert_eq!(gate.state(), GateState::Closed);
        assert_eq!(gate.req_count(), 0);
        assert!(set.tor_map().get(&TOR_ID).is_none());
    }

    #[tokio::test]
    async fn to_state_readmits_and_resets() {
        let set = basic_set(quick_cfg());

        let gate = set.by_id(TOR_ID).unwrap();
        set.for_state(&gate, GateState::Maintenance).await.unwrap();
        gate.add_req();

        set.to_state(&gate, GateState::Ready);

        assert_eq!(gate.state(), GateState::Ready);
        assert!(gate.has_no_reqs());
        assert!(set.by_id(TOR_ID).is_ok());
    }

    #[tokio::test]
    async fn refresh_one_rejects_direct() {
        let set = basic_set(quick_cfg());

        let err = set.refresh_one(DIRECT_GATE_ID).await.unwrap_err();
        assert!(matches!(err, GateError::KindNotSupported));
    }

    #[tokio::test]
    async fn refresh_one_missing_gate() {
        let set = basic_set(quick_cfg());

        let err = set.refresh_one(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, GateError::GateNotFound));
    }

    #[tokio::test]
    async fn refresh_one_rejects_wireguard() {
        let set = basic_set(quick_cfg());

        let err = set.refresh_one(WG_ID).await.unwrap_err();
        assert!(matches!(err, GateError::KindNotSupported));
    }

    #[tokio::test]
    async fn refresh_one_shutting() {
        let set = basic_set(quick_cfg());
        set.shutting.cancel();

        let err = set.refresh_one(TOR_ID).await.unwrap_err();
        assert!(matches!(err, GateError::SetIsShutting));
    }

    #[tokio::test]
    async fn refresh_one_success() {
        let set = basic_set(quick_cfg());

        set.refresh_one(TOR_ID).await.unwrap();

        let gate = set.by_id(TOR_ID).unwrap();
        assert_eq!(gate.state(), GateState::Ready);
        assert!(gate.has_no_reqs());
    }

    #[tokio::test]
    async fn refresh_one_error_leaves_gate_detached() {
        let set = Arc::new(GateSet::new(
            quick_cfg(),
            testing::direct_gate(),
            vec![testing::tor_gate_with_ctrl(
                TOR_ID,
                TorControl::Mock {
                    on_newnym: Some(Arc::new(|| {
                        Err(GateError::Transport("something_went_wrong".into()))
                    })),
                    on_close: None,
                },
            )],
            Vec::new(),
        ));

        let err = set.refresh_one(TOR_ID).await.unwrap_err();
        assert_eq!(err.to_string(), "something_went_wrong");

        // Detached in maintenance until an operator retries.
        assert!(set.tor_map().get(&TOR_ID).is_none());
        assert!(matches!(set.by_id(TOR_ID), Err(GateError::GateNotFound)));
    }

    #[tokio::test]
    async fn refresh_one_with_inflight_times_out_and_restores() {
        let mut cfg = quick_cfg();
        cfg.state_loop_tout = Duration::from_millis(50);
        let set = basic_set(cfg);

        let gate = set.by_id(TOR_ID).unwrap();
        gate.add_req();

        let err = set.refresh_one(TOR_ID).await.unwrap_err();
        assert!(matches!(err, GateError::DeadlineExceeded));

        let gate = set.by_id(TOR_ID).unwrap();
        assert_eq!(gate.state(), GateState::Ready);
    }

    #[tokio::test]
    async fn close_one_rejects_direct() {
        let set = basic_set(quick_cfg());

        let err = set.close_one(DIRECT_GATE_ID).await.unwrap_err();
        assert!(matches!(err, GateError::KindNotSupported));
    }

    #[tokio::test]
    async fn close_one_missing_gate() {
        let set = basic_set(quick_cfg());

        let err = set.close_one(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, GateError::GateNotFound));
    }

    #[tokio::test]
    async fn close_one_tor() {
        let set = basic_set(quick_cfg());

        set.close_one(TOR_ID).await.unwrap();

        assert!(set.tor_map().get(&TOR_ID).is_none());
        assert!(matches!(set.by_id(TOR_ID), Err(GateError::GateNotFound)));
    }

    #[tokio::test]
    async fn close_one_wireguard() {
        let set = basic_set(quick_cfg());

        set.close_one(WG_ID).await.unwrap();
        assert!(set.wg_map().get(&WG_ID).is_none());
    }

    #[tokio::test]
    async fn close_one_propagates_close_error() {
        let set = Arc::new(GateSet::new(
            quick_cfg(),
            testing::direct_gate(),
            Vec::new(),
            vec![testing::wg_gate_with(
                WG_ID,
                WgHandle::Mock {
                    on_down: Some(Arc::new(|| {
                        Err(GateError::Transport("device stuck".into()))
                    })),
                },
                testing::MockDoer::ok(),
            )],
        ));

        let err = set.close_one(WG_ID).await.unwrap_err();
        assert_eq!(err.to_string(), "device stuck");
        // The gate is already out of the maps; it does not come back.
        assert!(set.wg_map().get(&WG_ID).is_none());
    }

    #[tokio::test]
    async fn warmup_ok() {
        let set = basic_set(quick_cfg());

        set.warmup().await.unwrap();
    }

    #[tokio::test]
    async fn warmup_shutting() {
        let set = basic_set(quick_cfg());
        set.shutting.cancel();

        let err = set.warmup().await.unwrap_err();
        match err {
            GateError::Joined(inner) => {
                assert_eq!(inner.len(), 1);
                assert!(matches!(inner[0], GateError::SetIsShutting));
            }
            other => panic!("expected joined error, got {other}"),
        }
    }

    #[tokio::test]
    async fn warmup_aggregates_failures() {
        let set = Arc::new(GateSet::new(
            quick_cfg(),
            testing::direct_gate(),
            vec![testing::tor_gate_with_doer(
                TOR_ID,
                testing::MockDoer::with_status(StatusCode::INTERNAL_SERVER_ERROR),
            )],
            vec![testing::wg_gate(WG_ID)],
        ));

        let err = set.warmup().await.unwrap_err();
        match err {
            GateError::Joined(groups) => {
                assert_eq!(groups.len(), 1);
                match &groups[0] {
                    GateError::Joined(inner) => {
                        assert_eq!(inner.len(), 1);
                        assert!(matches!(inner[0], GateError::WarmupBadResponse));
                    }
                    other => panic!("expected joined group error, got {other}"),
                }
            }
            other => panic!("expected joined error, got {other}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn warmup_is_exclusive() {
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let (entered_tx, entered_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = std::sync::Mutex::new(release_rx);

        let blocking_doer = testing::MockDoer::new(move |_req| {
            entered_tx.send(()).unwrap();
            release_rx.lock().unwrap().recv().unwrap();
            Ok(http::Response::builder()
                .status(StatusCode::OK)
                .body(crate::gate::connector::full_body(""))
                .unwrap())
        });

        let set = Arc::new(GateSet::new(
            quick_cfg(),
            testing::direct_gate(),
            vec![testing::tor_gate_with_doer(TOR_ID, blocking_doer)],
            Vec::new(),
        ));

        let first = {
            let set = Arc::clone(&set);
            tokio::spawn(async move { set.warmup().await })
        };

        entered_rx.recv().unwrap();

        let err = set.warmup().await.unwrap_err();
        match err {
            GateError::Joined(inner) => {
                assert!(matches!(inner[0], GateError::SetIsWarmingUp));
            }
            other => panic!("expected joined error, got {other}"),
        }

        release_tx.send(()).unwrap();
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let set = basic_set(quick_cfg());

        set.shutdown().await.unwrap();
        assert!(set.is_shutting());

        set.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_aggregates_close_errors() {
        let set = Arc::new(GateSet::new(
            quick_cfg(),
            testing::direct_gate(),
            vec![testing::tor_gate_with_ctrl(
                TOR_ID,
                TorControl::Mock {
                    on_newnym: None,
                    on_close: Some(Arc::new(|| {
                        Err(GateError::Transport("tor close failed".into()))
                    })),
                },
            )],
            vec![testing::wg_gate(WG_ID)],
        ));

        let err = set.shutdown().await.unwrap_err();
        assert!(err.to_string().contains("tor close failed"));

        // Still idempotent after a failed first round.
        set.shutdown().await.unwrap();
    }
}
