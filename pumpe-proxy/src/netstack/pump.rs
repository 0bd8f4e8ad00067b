//! The device pump: one task per WireGuard gate that owns the boringtun
//! session, the smoltcp interface, and every virtual connection inside the
//! tunnel.
//!
//! The pump multiplexes three flows: encrypted datagrams to and from the
//! peer over UDP, decrypted IP packets through the virtual phy device, and
//! per-connection byte channels bridging smoltcp sockets to
//! [`VirtualStream`](super::stream::VirtualStream)s.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use boringtun::noise::{Tunn, TunnResult};
use bytes::Bytes;
use smoltcp::iface::{Interface, SocketHandle, SocketSet};
use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::socket::tcp;
use smoltcp::wire::{IpAddress, IpEndpoint, IpListenEndpoint};
use tokio::net::UdpSocket;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub(crate) const MTU: usize = 1420;

const UDP_BUF: usize = 65536;
const TCP_SOCKET_BUF: usize = 262144;
const STREAM_CHUNK: usize = 16384;
const PENDING_MAX_BYTES: usize = 1024 * 1024;
const LOCAL_PORT_START: u16 = 40000;
const LOCAL_PORT_END: u16 = 65000;
const TIMER_TICK: Duration = Duration::from_millis(100);
const ACTIVE_POLL: Duration = Duration::from_millis(1);
const UDP_BURST: usize = 64;

/// A dial request from a gate to the pump.
pub(crate) struct ConnRequest {
    pub(crate) remote: IpEndpoint,
    pub(crate) to_client: mpsc::Sender<Bytes>,
    pub(crate) from_client: mpsc::Receiver<Bytes>,
    pub(crate) connected: oneshot::Sender<Result<(), String>>,
}

fn smoltcp_now() -> smoltcp::time::Instant {
    let millis = std::time::SystemTime::UNIX_EPOCH
        .elapsed()
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);

    smoltcp::time::Instant::from_millis(millis)
}

// An in-memory phy for smoltcp: packets in, packets out, no wire.

pub(crate) struct VirtualDevice {
    pub(crate) inbound: VecDeque<Vec<u8>>,
    pub(crate) outbound: VecDeque<Vec<u8>>,
    caps: DeviceCapabilities,
}

impl VirtualDevice {
    pub(crate) fn new() -> Self {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = MTU;

        Self {
            inbound: VecDeque::new(),
            outbound: VecDeque::new(),
            caps,
        }
    }
}

pub(crate) struct VirtRxToken(Vec<u8>);

impl RxToken for VirtRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.0)
    }
}

pub(crate) struct VirtTxToken<'a>(&'a mut VecDeque<Vec<u8>>);

impl<'a> TxToken for VirtTxToken<'a> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buf = vec![0u8; len];
        let out = f(&mut buf);
        self.0.push_back(buf);
        out
    }
}

impl Device for VirtualDevice {
    type RxToken<'a> = VirtRxToken;
    type TxToken<'a> = VirtTxToken<'a>;

    fn receive(
        &mut self,
        _timestamp: smoltcp::time::Instant,
    ) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        self.inbound
            .pop_front()
            .map(|pkt| (VirtRxToken(pkt), VirtTxToken(&mut self.outbound)))
    }

    fn transmit(&mut self, _timestamp: smoltcp::time::Instant) -> Option<Self::TxToken<'_>> {
        Some(VirtTxToken(&mut self.outbound))
    }

    fn capabilities(&self) -> DeviceCapabilities {
        self.caps.clone()
    }
}

struct ConnEntry {
    handle: SocketHandle,
    to_client: Option<mpsc::Sender<Bytes>>,
    from_client: mpsc::Receiver<Bytes>,
    connected: Option<oneshot::Sender<Result<(), String>>>,
    pending_in: VecDeque<Bytes>,
    pending_in_bytes: usize,
    pending_out: VecDeque<Bytes>,
    pending_out_bytes: usize,
    client_write_closed: bool,
    fin_sent: bool,
}

pub(crate) struct Pump {
    udp: Arc<UdpSocket>,
    tunn: Tunn,
    device: VirtualDevice,
    iface: Interface,
    sockets: SocketSet<'static>,
    local_ip: IpAddress,
    conns: Vec<ConnEntry>,
    next_port: u16,
    pending_net: VecDeque<Vec<u8>>,
}

impl Pump {
    pub(crate) fn new(
        udp: Arc<UdpSocket>,
        tunn: Tunn,
        device: VirtualDevice,
        iface: Interface,
        local_ip: IpAddress,
    ) -> Self {
        Self {
            udp,
            tunn,
            device,
            iface,
            sockets: SocketSet::new(vec![]),
            local_ip,
            conns: Vec::new(),
            next_port: LOCAL_PORT_START,
            pending_net: VecDeque::new(),
        }
    }

    pub(crate) async fn run(
        mut self,
        mut conn_rx: mpsc::Receiver<ConnRequest>,
        wake: Arc<Notify>,
        stop: CancellationToken,
    ) {
        let mut udp_buf = vec![0u8; UDP_BUF];
        let mut scratch = vec![0u8; UDP_BUF + 32];
        let mut timer_deadline = Instant::now();

        loop {
            if stop.is_cancelled() {
                break;
            }

            let now_std = Instant::now();
            if now_std >= timer_deadline {
                let res = self.tunn.update_timers(&mut scratch);
                self.queue_net(res);
                timer_deadline = now_std + TIMER_TICK;
            }

            while let Ok(req) = conn_rx.try_recv() {
                self.add_connection(req);
            }

            self.pump_udp_in(&mut udp_buf, &mut scratch);
            self.flush_udp();

            let now = smoltcp_now();
            let _ = self.iface.poll(now, &mut self.device, &mut self.sockets);

            while let Some(plain) = self.device.outbound.pop_front() {
                let res = self.tunn.encapsulate(&plain, &mut scratch);
                self.queue_net(res);
            }
            self.flush_udp();

            self.service_connections();

            let has_work = !self.device.inbound.is_empty()
                || !self.device.outbound.is_empty()
                || !self.pending_net.is_empty();
            if has_work {
                tokio::task::yield_now().await;
                continue;
            }

            let delay = self
                .iface
                .poll_delay(now, &self.sockets)
                .map(|d| Duration::from_micros(d.total_micros()))
                .unwrap_or(TIMER_TICK);
            let cap = if self.conns.is_empty() { TIMER_TICK } else { ACTIVE_POLL };
            let wait = delay
                .min(cap)
                .min(timer_deadline.saturating_duration_since(Instant::now()));

            tokio::select! {
                _ = self.udp.readable() => {}
                req = conn_rx.recv() => {
                    match req {
                        Some(req) => self.add_connection(req),
                        None => break,
                    }
                }
                _ = wake.notified() => {}
                _ = tokio::time::sleep(wait) => {}
                _ = stop.cancelled() => break,
            }
        }

        debug!("wireguard pump stopped");
    }

    fn queue_net(&mut self, res: TunnResult<'_>) {
        if let TunnResult::WriteToNetwork(out) = res {
            self.pending_net.push_back(out.to_vec());
        }
    }

    fn pump_udp_in(&mut self, udp_buf: &mut [u8], scratch: &mut [u8]) {
        for _ in 0..UDP_BURST {
            match self.udp.try_recv(udp_buf) {
                Ok(n) => {
                    match self.tunn.decapsulate(None, &udp_buf[..n], scratch) {
                        TunnResult::WriteToTunnelV4(plain, _)
                        | TunnResult::WriteToTunnelV6(plain, _) => {
                            self.device.inbound.push_back(plain.to_vec());
                        }
                        TunnResult::WriteToNetwork(out) => {
                            self.pending_net.push_back(out.to_vec());
                            // Flush queued packets held back while the
                            // handshake was in flight.
                            loop {
                                match self.tunn.decapsulate(None, &[], scratch) {
                                    TunnResult::WriteToNetwork(out) => {
                                        self.pending_net.push_back(out.to_vec());
                                    }
                                    _ => break,
                                }
                            }
                        }
                        _ => {}
                    }
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!(error = %err, "wireguard udp receive failed");
                    break;
                }
            }
        }
    }

    fn flush_udp(&mut self) {
        for _ in 0..UDP_BURST {
            let Some(front) = self.pending_net.front() else {
                break;
            };

            match self.udp.try_send(front) {
                Ok(_) => {
                    self.pending_net.pop_front();
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!(error = %err, "wireguard udp send failed");
                    self.pending_net.pop_front();
                }
            }
        }
    }

    fn add_connection(&mut self, req: ConnRequest) {
        let local_port = self.next_port;
        self.next_port = if self.next_port >= LOCAL_PORT_END {
            LOCAL_PORT_START
        } else {
            self.next_port + 1
        };

        let mut sock = tcp::Socket::new(
            tcp::SocketBuffer::new(vec![0u8; TCP_SOCKET_BUF]),
            tcp::SocketBuffer::new(vec![0u8; TCP_SOCKET_BUF]),
        );

        let local = IpListenEndpoint {
            addr: Some(self.local_ip),
            port: local_port,
        };

        match sock.connect(self.iface.context(), req.remote, local) {
            Ok(()) => {
                let handle = self.sockets.add(sock);
                self.conns.push(ConnEntry {
                    handle,
                    to_client: Some(req.to_client),
                    from_client: req.from_client,
                    connected: Some(req.connected),
                    pending_in: VecDeque::new(),
                    pending_in_bytes: 0,
                    pending_out: VecDeque::new(),
                    pending_out_bytes: 0,
                    client_write_closed: false,
                    fin_sent: false,
                });
            }
            Err(err) => {
                let _ = req.connected.send(Err(format!("connect: {err}")));
            }
        }
    }

    fn service_connections(&mut self) {
        let mut remove: Vec<usize> = Vec::new();

        for (i, entry) in self.conns.iter_mut().enumerate() {
            let sock = self.sockets.get_mut::<tcp::Socket>(entry.handle);

            if let Some(tx) = entry.connected.take() {
                if sock.may_send() {
                    let _ = tx.send(Ok(()));
                } else if sock.state() == tcp::State::Closed {
                    let _ = tx.send(Err("connection refused".into()));
                    remove.push(i);
                    continue;
                } else {
                    entry.connected = Some(tx);
                }
            }

            // Tunnel -> client.
            while sock.can_recv() && entry.pending_out_bytes < PENDING_MAX_BYTES {
                let mut buf = [0u8; STREAM_CHUNK];
                match sock.recv_slice(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        entry.pending_out_bytes += n;
                        entry.pending_out.push_back(Bytes::copy_from_slice(&buf[..n]));
                    }
                    Err(_) => break,
                }
            }

            let mut client_gone = false;
            while let Some(chunk) = entry.pending_out.pop_front() {
                let Some(tx) = entry.to_client.as_ref() else {
                    break;
                };

                match tx.try_send(chunk) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(chunk)) => {
                        entry.pending_out.push_front(chunk);
                        break;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        client_gone = true;
                        break;
                    }
                }
            }
            entry.pending_out_bytes = entry.pending_out.iter().map(Bytes::len).sum();

            if client_gone {
                sock.abort();
                remove.push(i);
                continue;
            }

            // Remote sent FIN and everything has been handed over: signal
            // EOF to the reader, keep the write direction usable.
            if !sock.may_recv()
                && sock.state() != tcp::State::SynSent
                && sock.state() != tcp::State::SynReceived
                && entry.pending_out.is_empty()
            {
                entry.to_client = None;
            }

            // Client -> tunnel.
            loop {
                if entry.pending_in_bytes >= PENDING_MAX_BYTES {
                    break;
                }
                match entry.from_client.try_recv() {
                    Ok(chunk) => {
                        entry.pending_in_bytes += chunk.len();
                        entry.pending_in.push_back(chunk);
                    }
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        entry.client_write_closed = true;
                        break;
                    }
                }
            }

            while sock.can_send() {
                let Some(front) = entry.pending_in.front_mut() else {
                    break;
                };

                match sock.send_slice(front) {
                    Ok(sent) if sent == front.len() => {
                        entry.pending_in_bytes -= sent;
                        entry.pending_in.pop_front();
                    }
                    Ok(sent) => {
                        entry.pending_in_bytes -= sent;
                        let rest = front.slice(sent..);
                        *front = rest;
                        break;
                    }
                    Err(_) => break,
                }
            }

            if entry.client_write_closed && entry.pending_in.is_empty() && !entry.fin_sent {
                sock.close();
                entry.fin_sent = true;
            }

            if !sock.is_open() && entry.pending_out.is_empty() {
                remove.push(i);
            }
        }

        for i in remove.into_iter().rev() {
            let entry = self.conns.remove(i);
            self.sockets.remove(entry.handle);
        }
    }
}
