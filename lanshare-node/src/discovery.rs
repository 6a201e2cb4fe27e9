//! LAN discovery: UDP broadcast announce/response, tie-broken dialing, update detection.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use lanshare_core::version::{channel, is_newer};
use lanshare_core::wire::{decode_datagram, encode_datagram, MAX_DATAGRAM_LEN};
use lanshare_core::{DiscoveryKind, DiscoveryMessage};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::{NodeEvent, UpdateSource};
use crate::net;
use crate::node::{signalled, Node};

fn bind_socket(port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
    std_sock.set_broadcast(true)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

impl Node {
    /// Bind the discovery port and spawn the listener and the announcer.
    pub(crate) async fn start_discovery(self: &Arc<Self>) -> std::io::Result<Vec<JoinHandle<()>>> {
        let socket = Arc::new(bind_socket(self.config.discovery_port)?);
        let dest = SocketAddr::new(
            net::broadcast_addr(self.ip).into(),
            self.config.discovery_port,
        );
        info!(port = self.config.discovery_port, %dest, "discovery started");
        Ok(vec![
            tokio::spawn(self.clone().listen(socket.clone())),
            tokio::spawn(self.clone().announce_loop(socket, dest)),
        ])
    }

    pub(crate) async fn announcement(&self, kind: DiscoveryKind) -> DiscoveryMessage {
        DiscoveryMessage {
            kind,
            id: self.id.clone(),
            name: self.name().await,
            ip: self.ip.to_string(),
            port: self.local_port(),
            web_port: Some(self.config.web_port),
            version: Some(crate::VERSION.to_string()),
            pub_key: Some(*self.keypair.public_key()),
        }
    }

    async fn send_discovery(&self, socket: &UdpSocket, kind: DiscoveryKind, to: SocketAddr) {
        let msg = self.announcement(kind).await;
        let bytes = match encode_datagram(&msg) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "cannot encode discovery datagram");
                return;
            }
        };
        if let Err(e) = socket.send_to(&bytes, to).await {
            debug!(%to, error = %e, "discovery send failed");
        }
    }

    /// Initial burst, then a steady re-announce until stopped.
    async fn announce_loop(self: Arc<Self>, socket: Arc<UdpSocket>, dest: SocketAddr) {
        let timing = &self.config.timing;
        let mut stop = self.stop_tx.subscribe();
        for i in 0..timing.announce_burst {
            if i > 0 {
                tokio::select! {
                    _ = signalled(&mut stop) => return,
                    _ = tokio::time::sleep(timing.announce_spacing) => {}
                }
            }
            self.send_discovery(&socket, DiscoveryKind::Announce, dest).await;
        }
        let mut tick = tokio::time::interval(timing.reannounce_interval);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = signalled(&mut stop) => break,
                _ = tick.tick() => {
                    self.send_discovery(&socket, DiscoveryKind::Announce, dest).await;
                }
            }
        }
        debug!("announcer stopped");
    }

    async fn listen(self: Arc<Self>, socket: Arc<UdpSocket>) {
        let mut stop = self.stop_tx.subscribe();
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        loop {
            let (n, from) = tokio::select! {
                _ = signalled(&mut stop) => break,
                r = socket.recv_from(&mut buf) => match r {
                    Ok(r) => r,
                    Err(e) => {
                        debug!(error = %e, "discovery receive failed");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                        continue;
                    }
                },
            };
            match decode_datagram(&buf[..n]) {
                Ok(msg) => self.handle_discovery(&socket, msg, from).await,
                Err(e) => debug!(%from, error = %e, "ignoring malformed datagram"),
            }
        }
        debug!("discovery listener stopped");
    }

    pub(crate) async fn handle_discovery(
        self: &Arc<Self>,
        socket: &UdpSocket,
        msg: DiscoveryMessage,
        from: SocketAddr,
    ) {
        if msg.id == self.id {
            return;
        }
        self.check_version(&msg, from);
        if self.registry.is_active(&msg.id).await {
            return;
        }
        debug!(peer = %msg.id, kind = ?msg.kind, %from, "discovered");
        if msg.kind == DiscoveryKind::Announce {
            self.send_discovery(socket, DiscoveryKind::Response, from).await;
        }
        // only the smaller ID dials
        if self.id.as_str() < msg.id.as_str() {
            let ip = if msg.ip.is_empty() {
                from.ip().to_string()
            } else {
                msg.ip
            };
            let node = self.clone();
            tokio::spawn(async move {
                node.connect_to_peer(&ip, msg.port, &msg.id, &msg.name).await;
            });
        }
    }

    /// Emit `UpdateAvailable` the first time a peer advertises a given newer version.
    fn check_version(&self, msg: &DiscoveryMessage, from: SocketAddr) {
        let Some(version) = msg.version.as_deref() else {
            return;
        };
        if !is_newer(version, crate::VERSION) {
            return;
        }
        let first = match self.known_updates.lock() {
            Ok(mut seen) => seen.insert(version.to_string()),
            Err(_) => false,
        };
        if !first {
            return;
        }
        info!(peer = %msg.id, %version, "newer version seen on the network");
        self.events.emit(NodeEvent::UpdateAvailable(UpdateSource {
            ip: if msg.ip.is_empty() {
                from.ip().to_string()
            } else {
                msg.ip.clone()
            },
            name: msg.name.clone(),
            version: version.to_string(),
            channel: channel(version),
            web_port: msg.web_port.unwrap_or(self.config.web_port),
        }));
    }
}
