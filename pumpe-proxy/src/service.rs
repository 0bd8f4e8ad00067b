//! The management façade: thin operations over the gate set, consumed by
//! the admin HTTP handlers.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use pumpe_core::{GateError, Kind};

use crate::gate::GateSet;

/// Gate ids per kind, as listed by the management API.
#[derive(Debug, Serialize)]
pub struct GateIds {
    pub direct: Vec<Uuid>,
    pub tor: Vec<Uuid>,
    pub wireguard: Vec<Uuid>,
}

pub struct GateAdmin {
    set: Arc<GateSet>,
}

impl GateAdmin {
    pub fn new(set: Arc<GateSet>) -> Self {
        Self { set }
    }

    /// Ids for all three kinds; the first lookup failure wins.
    pub fn gates(&self) -> Result<GateIds, GateError> {
        let direct = self.set.gate_ids(Kind::Direct)?;
        let tor = self.set.gate_ids(Kind::Tor)?;
        let wireguard = self.set.gate_ids(Kind::WireGuard)?;

        Ok(GateIds {
            direct,
            tor,
            wireguard,
        })
    }

    pub async fn create(&self, kind: Kind) -> Result<Uuid, GateError> {
        self.set.create(kind).await
    }

    pub async fn refresh(&self, id: Uuid) -> Result<(), GateError> {
        self.set.refresh_one(id).await
    }

    pub async fn stop(&self, id: Uuid) -> Result<(), GateError> {
        self.set.close_one(id).await
    }
}
