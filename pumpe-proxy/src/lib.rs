//! Forward HTTP/HTTPS proxy that multiplexes client requests across a
//! managed pool of exit gates: a direct network egress, embedded Tor
//! clients, and userspace WireGuard tunnels.
//!
//! Clients point any HTTP client at the proxy and may steer individual
//! requests onto a specific gate (`Proxy-Pumpe-Gate-Id`) or a specific
//! kind of gate (`Proxy-Pumpe-Gate-Type`); otherwise a ready gate of the
//! default kind is picked pseudo-randomly. A small management API under
//! `/v1/_service/gates` lists, creates, refreshes and stops gates at
//! runtime.

pub mod admin;
pub mod gate;
pub mod netstack;
pub mod proxy;
pub mod server;
pub mod service;
