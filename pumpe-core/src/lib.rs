//! Domain model and infrastructure for the pumpe exit-gate proxy.
//!
//! This crate holds everything that does not touch the network: gate kinds
//! and identifiers, the error taxonomy, the per-gate state cell, the
//! concurrent gate map, environment configuration, and WireGuard config
//! file parsing. The networking half lives in `pumpe-proxy`.

pub mod config;
pub mod error;
pub mod kind;
pub mod map;
pub mod state;
pub mod wgconf;

pub use error::{GateError, join_errs};
pub use kind::{DIRECT_GATE_ID, Kind};
pub use map::GateMap;
pub use state::{GateState, StateCell};
