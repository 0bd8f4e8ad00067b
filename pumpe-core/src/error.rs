//! The closed set of error kinds shared by the gate set, the gates, and the
//! proxy pipelines.
//!
//! Every subsystem either returns one of these kinds or wraps an underlying
//! transport error verbatim. Only the management HTTP layer converts kinds
//! to status codes.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GateError {
    #[error("unknown kind")]
    KindUnknown,

    #[error("unsupported kind")]
    KindNotSupported,

    #[error("not implemented")]
    NotImplemented,

    #[error("set is shutting")]
    SetIsShutting,

    #[error("set is warming up")]
    SetIsWarmingUp,

    #[error("no random gate")]
    NoRandomGate,

    #[error("gate not found")]
    GateNotFound,

    #[error("reached maximum number of tor gates")]
    TorMaxReached,

    #[error("warmup finished with bad response")]
    WarmupBadResponse,

    #[error("gate not ready")]
    GateNotReady,

    #[error("gate is refreshing")]
    GateIsRefreshing,

    #[error("invalid param")]
    InvalidParam,

    #[error("invalid uuid")]
    InvalidUuid,

    #[error("connection hijacking is not supported")]
    HijackingNotSupported,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("invalid wireguard config")]
    InvalidWgConfig,

    #[error("invalid wireguard key")]
    InvalidWgKey,

    #[error("invalid wireguard iface private key")]
    InvalidWgIfacePrivateKey,

    #[error("invalid wireguard iface address")]
    InvalidWgIfaceAddress,

    #[error("invalid wireguard peer public key")]
    InvalidWgPeerPublicKey,

    #[error("invalid wireguard peer endpoint")]
    InvalidWgPeerEndpoint,

    #[error("invalid wireguard peer allowed_ip")]
    InvalidWgPeerAllowedIp,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// An underlying transport failure (dial, TLS, HTTP client, Tor
    /// bootstrap), carried as its textual form.
    #[error("{0}")]
    Transport(String),

    /// Several errors aggregated by a fan-out operation.
    #[error("{}", join_display(.0))]
    Joined(Vec<GateError>),
}

impl GateError {
    /// True when `self` is the same kind as `other`, ignoring payloads.
    pub fn is_kind(&self, other: &GateError) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

fn join_display(errs: &[GateError]) -> String {
    errs.iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Aggregate the outcomes of a fan-out: no errors is `Ok`, one or more is a
/// single [`GateError::Joined`].
pub fn join_errs(errs: Vec<GateError>) -> Result<(), GateError> {
    if errs.is_empty() {
        Ok(())
    } else {
        Err(GateError::Joined(errs))
    }
}
