//! Exit-gate kinds and well-known identifiers.

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::GateError;

/// The fixed identifier of the direct gate, so clients can pin it without
/// discovering it first.
pub const DIRECT_GATE_ID: Uuid = Uuid::from_u128(0xfacade00_0000_4000_a000_000000000000u128);

/// The kind of an exit gate.
///
/// `Unknown` is only ever produced by a failed parse; it is never stored as
/// a gate's kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Unknown,
    Direct,
    Tor,
    WireGuard,
}

impl Kind {
    /// Stable lowercase wire form, used in headers, the API, and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Unknown => "unknown",
            Kind::Direct => "direct",
            Kind::Tor => "tor",
            Kind::WireGuard => "wireguard",
        }
    }

    /// Parse the wire form. Anything unrecognised, including `"unknown"`
    /// itself, is a [`GateError::KindUnknown`].
    pub fn parse(raw: &str) -> Result<Kind, GateError> {
        match raw {
            "direct" => Ok(Kind::Direct),
            "tor" => Ok(Kind::Tor),
            "wireguard" => Ok(Kind::WireGuard),
            _ => Err(GateError::KindUnknown),
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Kind {
    type Err = GateError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Kind::parse(raw)
    }
}

impl Serialize for Kind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Kind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;

        Kind::parse(&raw).map_err(|_| de::Error::custom(GateError::KindUnknown))
    }
}
