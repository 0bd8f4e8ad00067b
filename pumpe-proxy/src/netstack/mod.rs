//! Userspace WireGuard: a boringtun session and a smoltcp network stack
//! pumped by a dedicated task, exposed as an async dialer.
//!
//! No TUN device, no root. The gate dials a destination, the pump opens a
//! virtual TCP socket inside the tunnel, and the two ends meet in a
//! [`VirtualStream`].

mod pump;
mod stream;

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use boringtun::noise::Tunn;
use boringtun::x25519::{PublicKey, StaticSecret};
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use smoltcp::iface::{Config, Interface};
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr, IpEndpoint};
use tokio::net::UdpSocket;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use pumpe_core::GateError;
use pumpe_core::wgconf::{WgConfig, decode_wg_key};

use pump::{ConnRequest, Pump, VirtualDevice};
pub use stream::VirtualStream;

const CONN_QUEUE: usize = 64;
const STREAM_QUEUE: usize = 64;

/// A running userspace WireGuard device.
#[derive(Debug)]
pub struct WgDevice {
    conn_tx: mpsc::Sender<ConnRequest>,
    wake: Arc<Notify>,
    stop: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    resolver: TokioAsyncResolver,
}

impl WgDevice {
    /// Bring the device up: decode keys, connect the encrypted UDP leg to
    /// the peer endpoint, assemble the virtual interface, and start the
    /// pump.
    pub async fn create(cfg: &WgConfig, dns: IpAddr) -> Result<WgDevice, GateError> {
        let private_key = decode_wg_key(&cfg.iface.private_key)?;
        let peer_public_key = decode_wg_key(&cfg.peer.public_key)?;

        let endpoint = resolve_endpoint(&cfg.peer.endpoint).await?;

        let udp = UdpSocket::bind("0.0.0.0:0").await?;
        udp.connect(endpoint).await?;
        let udp = Arc::new(udp);

        let tunn = Tunn::new(
            StaticSecret::from(private_key),
            PublicKey::from(peer_public_key),
            None,
            None,
            0,
            None,
        );

        let mut cidrs = Vec::new();
        for raw in &cfg.iface.address {
            let cidr: IpCidr = raw
                .parse()
                .map_err(|_| GateError::InvalidWgIfaceAddress)?;
            cidrs.push(cidr);
        }

        let local_ip = cidrs
            .iter()
            .map(|cidr| cidr.address())
            .find(|addr| matches!(addr, IpAddress::Ipv4(_)))
            .ok_or(GateError::InvalidWgIfaceAddress)?;

        let mut device = VirtualDevice::new();
        let mut iface = Interface::new(
            Config::new(HardwareAddress::Ip),
            &mut device,
            smoltcp::time::Instant::from_millis(0),
        );
        iface.update_ip_addrs(|addrs| {
            for cidr in &cidrs {
                let _ = addrs.push(*cidr);
            }
        });
        let _ = iface
            .routes_mut()
            .add_default_ipv4_route(std::net::Ipv4Addr::new(0, 0, 0, 1));

        let (conn_tx, conn_rx) = mpsc::channel(CONN_QUEUE);
        let wake = Arc::new(Notify::new());
        let stop = CancellationToken::new();

        let pump = Pump::new(udp, tunn, device, iface, local_ip);
        let task = tokio::spawn(pump.run(conn_rx, Arc::clone(&wake), stop.clone()));

        debug!(endpoint = %endpoint, "wireguard device up");

        Ok(WgDevice {
            conn_tx,
            wake,
            stop,
            task: Mutex::new(Some(task)),
            resolver: resolver_for(dns),
        })
    }

    /// Open a TCP connection to `host:port` through the tunnel. Names are
    /// resolved with the device's DNS server, preferring IPv4 since the
    /// tunnel only has a default IPv4 route.
    pub async fn dial(&self, host: &str, port: u16) -> io::Result<VirtualStream> {
        if self.stop.is_cancelled() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "wireguard device is down",
            ));
        }

        let ip = self.resolve(host).await?;

        let (to_client_tx, to_client_rx) = mpsc::channel(STREAM_QUEUE);
        let (from_client_tx, from_client_rx) = mpsc::channel(STREAM_QUEUE);
        let (connected_tx, connected_rx) = oneshot::channel();

        self.conn_tx
            .send(ConnRequest {
                remote: IpEndpoint::new(ip_to_smoltcp(ip), port),
                to_client: to_client_tx,
                from_client: from_client_rx,
                connected: connected_tx,
            })
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::NotConnected, "wireguard pump exited"))?;
        self.wake.notify_one();

        match connected_rx.await {
            Ok(Ok(())) => Ok(VirtualStream::new(
                to_client_rx,
                from_client_tx,
                Arc::clone(&self.wake),
            )),
            Ok(Err(reason)) => Err(io::Error::new(io::ErrorKind::ConnectionRefused, reason)),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "wireguard pump dropped the connection",
            )),
        }
    }

    /// Stop passing traffic. Existing virtual streams observe EOF.
    pub fn down(&self) -> Result<(), GateError> {
        self.stop.cancel();
        self.wake.notify_one();
        Ok(())
    }

    /// Destroy the device, best effort.
    pub fn close(&self) {
        self.stop.cancel();
        self.wake.notify_one();

        if let Ok(mut task) = self.task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }

    async fn resolve(&self, host: &str) -> io::Result<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }

        let lookup = self
            .resolver
            .lookup_ip(host)
            .await
            .map_err(io::Error::other)?;

        let mut first = None;
        for ip in lookup.iter() {
            if ip.is_ipv4() {
                return Ok(ip);
            }
            if first.is_none() {
                first = Some(ip);
            }
        }

        first.ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no address for {host}"))
        })
    }
}

fn resolver_for(dns: IpAddr) -> TokioAsyncResolver {
    let servers = NameServerConfigGroup::from_ips_clear(&[dns], 53, true);
    let config = ResolverConfig::from_parts(None, Vec::new(), servers);

    TokioAsyncResolver::tokio(config, ResolverOpts::default())
}

async fn resolve_endpoint(endpoint: &str) -> Result<SocketAddr, GateError> {
    let mut addrs = tokio::net::lookup_host(endpoint)
        .await
        .map_err(|_| GateError::InvalidWgPeerEndpoint)?;

    addrs
        .find(SocketAddr::is_ipv4)
        .ok_or(GateError::InvalidWgPeerEndpoint)
}

fn ip_to_smoltcp(ip: IpAddr) -> IpAddress {
    match ip {
        IpAddr::V4(addr) => IpAddress::Ipv4(addr),
        IpAddr::V6(addr) => IpAddress::Ipv6(addr),
    }
}
