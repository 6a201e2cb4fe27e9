//! Peer links: dial with retry, accept with handshake, and the per-peer read loop that
//! feeds the dispatch channel.

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use lanshare_core::wire::{decode_frame, encode_frame, FrameDecodeError, MAX_FRAME_LEN};
use lanshare_core::{HandshakeInfo, Message, MessageKind, Payload};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::events::NodeEvent;
use crate::net;
use crate::node::{signalled, supervised, Inbound, Node};
use crate::registry::{Admission, Peer};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Write side of one TCP link. Frames are written under a lock so concurrent senders
/// (chat, file streaming) never interleave on the socket.
pub struct PeerConn {
    id: u64,
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    closed: watch::Sender<bool>,
}

impl fmt::Debug for PeerConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConn")
            .field("id", &self.id)
            .field("closed", &*self.closed.borrow())
            .finish()
    }
}

impl PeerConn {
    pub fn new(writer: impl AsyncWrite + Send + Unpin + 'static) -> Arc<Self> {
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            writer: Mutex::new(Box::new(writer)),
            closed,
        })
    }

    /// Unique per link; identifies which connection a registry entry belongs to.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn send(&self, msg: &Message) -> Result<()> {
        let frame = encode_frame(msg)?;
        let mut w = self.writer.lock().await;
        w.write_all(&frame).await?;
        w.flush().await?;
        Ok(())
    }

    /// Signal the read loop to stop.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Close and shut down the write half. A writer busy on a stuck socket is left to
    /// the read loop's exit.
    pub async fn shutdown(&self) {
        self.close();
        if let Ok(mut w) = self.writer.try_lock() {
            let _ = w.shutdown().await;
        }
    }
}

/// Buffered reader yielding one decoded message per newline-terminated frame.
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
    /// Prefix of `buf` already known to hold no newline.
    scanned: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            scanned: 0,
        }
    }

    /// Next message, or `None` on clean EOF between frames.
    pub async fn next_message(&mut self) -> std::io::Result<Option<Message>> {
        let mut chunk = [0u8; 16 * 1024];
        loop {
            if self.buf[self.scanned..].contains(&b'\n') {
                match decode_frame(&self.buf) {
                    Ok((msg, consumed)) => {
                        self.buf.drain(..consumed);
                        self.scanned = 0;
                        return Ok(Some(msg));
                    }
                    Err(FrameDecodeError::NeedMore) => {}
                    Err(e) => return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
                }
            } else if self.buf.len() > MAX_FRAME_LEN {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    FrameDecodeError::TooLarge,
                ));
            }
            self.scanned = self.buf.len();
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                if self.buf.iter().all(u8::is_ascii_whitespace) {
                    return Ok(None);
                }
                return Err(std::io::ErrorKind::UnexpectedEof.into());
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Removes a peer ID from the in-flight dial set when the dial finishes.
struct DialGuard<'a> {
    dialing: &'a std::sync::Mutex<HashSet<String>>,
    id: String,
}

impl Drop for DialGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut d) = self.dialing.lock() {
            d.remove(&self.id);
        }
    }
}

impl Node {
    pub(crate) async fn handshake_info(&self) -> HandshakeInfo {
        HandshakeInfo {
            public_key: *self.keypair.public_key(),
            name: self.name().await,
            port: self.local_port(),
        }
    }

    fn begin_dial(&self, id: &str) -> Option<DialGuard<'_>> {
        let mut d = self.dialing.lock().ok()?;
        if !d.insert(id.to_string()) {
            return None;
        }
        Some(DialGuard {
            dialing: &self.dialing,
            id: id.to_string(),
        })
    }

    /// Dial a peer and send our handshake. Returns whether a new link was established.
    /// Failures are logged; discovery will try again later.
    pub async fn connect_to_peer(self: &Arc<Self>, ip: &str, port: u16, id: &str, name: &str) -> bool {
        if port == 0 {
            debug!(peer = %id, "ignoring peer without a port");
            return false;
        }
        if id == self.id || self.is_stopped() || self.registry.is_active(id).await {
            return false;
        }
        let Some(_guard) = self.begin_dial(id) else {
            debug!(peer = %id, "dial already in progress");
            return false;
        };

        let addr = format!("{ip}:{port}");
        let timing = &self.config.timing;
        let mut stream = None;
        for attempt in 1..=timing.dial_retries.max(1) {
            match TcpStream::connect(&addr).await {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => {
                    warn!(peer = %id, %addr, attempt, error = %e, "dial failed");
                    if attempt < timing.dial_retries && !self.is_stopped() {
                        tokio::time::sleep(timing.dial_backoff * attempt).await;
                    }
                }
            }
        }
        let Some(stream) = stream else {
            info!(peer = %id, %addr, "giving up on peer until next discovery");
            return false;
        };
        if let Err(e) = net::set_keepalive(&stream, timing.keepalive) {
            debug!(peer = %id, error = %e, "keepalive not set");
        }

        let (reader, writer) = stream.into_split();
        let conn = PeerConn::new(writer);
        let peer = Peer {
            id: id.to_string(),
            name: name.to_string(),
            ip: ip.to_string(),
            port,
            conn: conn.clone(),
            is_active: true,
            outbound: true,
            last_seen: Utc::now(),
            public_key: None,
            shared_key: None,
        };
        if self.registry.admit_outbound(peer).await.is_err() {
            debug!(peer = %id, "already connected, dropping new link");
            conn.shutdown().await;
            return false;
        }

        let handshake = match Message::new(&self.id, id, Payload::Handshake(self.handshake_info().await)) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "cannot build handshake");
                self.registry.remove_if_current(id, conn.id()).await;
                return false;
            }
        };
        if let Err(e) = conn.send(&handshake).await {
            warn!(peer = %id, error = %e, "handshake send failed");
            self.registry.remove_if_current(id, conn.id()).await;
            return false;
        }
        info!(peer = %id, %addr, "connected, handshake sent");
        self.spawn_read_loop(id.to_string(), conn, FrameReader::new(reader));
        true
    }

    pub(crate) async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut stop = self.stop_tx.subscribe();
        loop {
            tokio::select! {
                res = listener.accept() => match res {
                    Ok((stream, remote)) => {
                        let node = self.clone();
                        tokio::spawn(supervised("inbound", async move {
                            node.handle_inbound(stream, remote).await
                        }));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                },
                _ = signalled(&mut stop) => break,
            }
        }
        debug!("listener closed");
    }

    /// Accepted socket: the first frame must be a handshake, anything else drops the link.
    pub(crate) async fn handle_inbound(self: Arc<Self>, stream: TcpStream, remote: SocketAddr) {
        if let Err(e) = net::set_keepalive(&stream, self.config.timing.keepalive) {
            debug!(%remote, error = %e, "keepalive not set");
        }
        let (reader, writer) = stream.into_split();
        let mut frames = FrameReader::new(reader);
        let first = tokio::time::timeout(self.config.timing.handshake_timeout, frames.next_message()).await;
        let msg = match first {
            Ok(Ok(Some(msg))) if msg.kind == MessageKind::Handshake => msg,
            Ok(Ok(Some(msg))) => {
                warn!(%remote, kind = ?msg.kind, "first message is not a handshake");
                return;
            }
            Ok(Ok(None)) => {
                debug!(%remote, "closed before handshake");
                return;
            }
            Ok(Err(e)) => {
                warn!(%remote, error = %e, "bad handshake frame");
                return;
            }
            Err(_) => {
                warn!(%remote, "handshake timed out");
                return;
            }
        };
        let info = match msg.payload() {
            Ok(Payload::Handshake(info)) => info,
            Ok(_) => return,
            Err(e) => {
                warn!(%remote, error = %e, "invalid handshake");
                return;
            }
        };
        if msg.from.is_empty() || msg.from == self.id {
            warn!(%remote, from = %msg.from, "handshake with unusable sender id");
            return;
        }
        if self.is_stopped() {
            return;
        }

        let peer_id = msg.from;
        let key = self.keypair.session_key(&info.public_key);
        let conn = PeerConn::new(writer);
        let peer = Peer {
            id: peer_id.clone(),
            name: info.name.clone(),
            ip: remote.ip().to_string(),
            port: info.port,
            conn: conn.clone(),
            is_active: true,
            outbound: false,
            last_seen: Utc::now(),
            public_key: Some(info.public_key),
            shared_key: Some(key),
        };
        let replaced = match self.registry.admit_inbound(peer, &self.id).await {
            Admission::Inserted => false,
            Admission::Replaced(old) => {
                info!(peer = %peer_id, "replacing existing link with inbound one");
                old.shutdown().await;
                true
            }
            Admission::Rejected => {
                info!(peer = %peer_id, "rejecting duplicate inbound link, we are the dialer");
                conn.shutdown().await;
                return;
            }
        };

        let response = match Message::new(
            &self.id,
            &peer_id,
            Payload::HandshakeResponse(self.handshake_info().await),
        ) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "cannot build handshake response");
                self.registry.remove_if_current(&peer_id, conn.id()).await;
                return;
            }
        };
        if let Err(e) = conn.send(&response).await {
            warn!(peer = %peer_id, error = %e, "handshake response failed");
            self.registry.remove_if_current(&peer_id, conn.id()).await;
            return;
        }
        if replaced {
            debug!(peer = %peer_id, %remote, "link replaced, peer stays online");
        } else {
            info!(peer = %peer_id, name = %info.name, %remote, "peer online (inbound)");
            self.events.emit(NodeEvent::PeerOnline {
                id: peer_id.clone(),
                name: info.name,
            });
        }
        self.spawn_read_loop(peer_id, conn, frames);
    }

    /// Run the read loop as a task scoped to this link; cleanup runs even if it panics.
    fn spawn_read_loop(
        self: &Arc<Self>,
        peer_id: String,
        conn: Arc<PeerConn>,
        frames: FrameReader<OwnedReadHalf>,
    ) {
        let Some(tx) = self.dispatch_sender() else {
            conn.close();
            return;
        };
        let node = self.clone();
        tokio::spawn(async move {
            supervised(
                "read loop",
                node.clone().read_loop(peer_id.clone(), conn.clone(), frames, tx),
            )
            .await;
            node.finish_peer(&peer_id, &conn).await;
        });
    }

    async fn read_loop(
        self: Arc<Self>,
        peer_id: String,
        conn: Arc<PeerConn>,
        mut frames: FrameReader<OwnedReadHalf>,
        tx: mpsc::Sender<Inbound>,
    ) {
        let mut stop = self.stop_tx.subscribe();
        let mut closed = conn.closed();
        loop {
            tokio::select! {
                res = frames.next_message() => match res {
                    Ok(Some(message)) => {
                        self.registry.touch(&peer_id).await;
                        let inbound = Inbound {
                            peer_id: peer_id.clone(),
                            conn_id: conn.id(),
                            message,
                        };
                        if tx.send(inbound).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!(peer = %peer_id, "peer closed the connection");
                        break;
                    }
                    Err(e) => {
                        debug!(peer = %peer_id, error = %e, "read failed");
                        break;
                    }
                },
                _ = signalled(&mut closed) => break,
                _ = signalled(&mut stop) => break,
            }
        }
    }

    /// Link is gone: drop the entry unless a newer link already replaced it.
    async fn finish_peer(&self, peer_id: &str, conn: &Arc<PeerConn>) {
        conn.shutdown().await;
        let Some(peer) = self.registry.remove_if_current(peer_id, conn.id()).await else {
            debug!(peer = %peer_id, "stale link closed");
            return;
        };
        info!(peer = %peer_id, name = %peer.name, "peer offline");
        self.fail_peer_transfers(peer_id).await;
        self.events.emit(NodeEvent::PeerOffline {
            id: peer.id,
            name: peer.name,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{expect_event, no_event, TestNode};
    use lanshare_core::Keypair;
    use std::time::Duration;

    async fn raw_handshake(addr: SocketAddr, from: &str) -> (FrameReader<OwnedReadHalf>, tokio::net::tcp::OwnedWriteHalf) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (r, mut w) = stream.into_split();
        let msg = Message::new(
            from,
            "",
            Payload::Handshake(HandshakeInfo {
                public_key: *Keypair::generate().public_key(),
                name: from.to_string(),
                port: 1,
            }),
        )
        .unwrap();
        w.write_all(&encode_frame(&msg).unwrap()).await.unwrap();
        (FrameReader::new(r), w)
    }

    async fn next(frames: &mut FrameReader<OwnedReadHalf>) -> Option<Message> {
        tokio::time::timeout(Duration::from_secs(5), frames.next_message())
            .await
            .expect("read timed out")
            .unwrap_or(None)
    }

    #[tokio::test]
    async fn frame_reader_splits_stream() {
        let a = encode_frame(&Message::chat("x", "all", "one")).unwrap();
        let b = encode_frame(&Message::chat("x", "all", "two")).unwrap();
        let mut bytes = a.clone();
        bytes.extend_from_slice(&b);
        let mut reader = FrameReader::new(&bytes[..]);
        assert_eq!(reader.next_message().await.unwrap().unwrap().content, "one");
        assert_eq!(reader.next_message().await.unwrap().unwrap().content, "two");
        assert!(reader.next_message().await.unwrap().is_none());

        let mut truncated = FrameReader::new(&a[..a.len() - 3]);
        assert!(truncated.next_message().await.is_err());
    }

    #[tokio::test]
    async fn handshake_derives_equal_keys() {
        let mut a = TestNode::start("10.0.0.1_100", "alice").await;
        let mut b = TestNode::start("10.0.0.2_200", "bob").await;
        assert!(
            a.node
                .connect_to_peer("127.0.0.1", b.addr.port(), b.node.id(), "bob")
                .await
        );
        expect_event(&mut a.events, |e| matches!(e, NodeEvent::PeerOnline { name, .. } if name == "bob")).await;
        expect_event(&mut b.events, |e| matches!(e, NodeEvent::PeerOnline { name, .. } if name == "alice")).await;

        let a_peers = a.node.peers().await;
        let b_peers = b.node.peers().await;
        assert_eq!(a_peers.len(), 1);
        assert_eq!(b_peers.len(), 1);
        assert!(a_peers[0].outbound && a_peers[0].has_shared_key);
        assert!(!b_peers[0].outbound && b_peers[0].has_shared_key);
        assert_eq!(b_peers[0].port, a.addr.port());

        let ka = a.node.registry.shared_key(b.node.id()).await.unwrap();
        let kb = b.node.registry.shared_key(a.node.id()).await.unwrap();
        assert_eq!(ka, kb);
    }

    #[tokio::test]
    async fn connect_skips_bad_port_self_and_active() {
        let mut a = TestNode::start("a_1", "alice").await;
        let b = TestNode::start("b_1", "bob").await;
        assert!(!a.node.connect_to_peer("127.0.0.1", 0, "b_1", "bob").await);
        assert!(!a.node.connect_to_peer("127.0.0.1", a.addr.port(), "a_1", "me").await);
        assert!(a.node.connect_to_peer("127.0.0.1", b.addr.port(), "b_1", "bob").await);
        expect_event(&mut a.events, |e| matches!(e, NodeEvent::PeerOnline { .. })).await;
        assert!(!a.node.connect_to_peer("127.0.0.1", b.addr.port(), "b_1", "bob").await);
        assert_eq!(a.node.peers().await.len(), 1);
    }

    #[tokio::test]
    async fn dial_gives_up_after_retries() {
        let a = TestNode::start("a_1", "alice").await;
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = closed.local_addr().unwrap().port();
        drop(closed);
        assert!(!a.node.connect_to_peer("127.0.0.1", port, "b_1", "bob").await);
        assert!(a.node.peers().await.is_empty());
    }

    #[tokio::test]
    async fn non_handshake_first_message_is_dropped() {
        let n = TestNode::start("m_5", "mid").await;
        let stream = TcpStream::connect(n.addr).await.unwrap();
        let (r, mut w) = stream.into_split();
        w.write_all(&encode_frame(&Message::chat("a_1", "all", "hi")).unwrap())
            .await
            .unwrap();
        let mut frames = FrameReader::new(r);
        assert!(next(&mut frames).await.is_none());
        assert!(n.node.peers().await.is_empty());
    }

    #[tokio::test]
    async fn duplicate_inbound_resolved_by_id_order() {
        let n = TestNode::start("m_5", "mid").await;

        // remote "a_1" sorts before us: a newer inbound link replaces the old one
        let (mut c1, _w1) = raw_handshake(n.addr, "a_1").await;
        assert_eq!(next(&mut c1).await.unwrap().kind, MessageKind::HandshakeResponse);
        let (mut c2, _w2) = raw_handshake(n.addr, "a_1").await;
        assert_eq!(next(&mut c2).await.unwrap().kind, MessageKind::HandshakeResponse);
        assert!(next(&mut c1).await.is_none());

        // remote "z_9" sorts after us: we should have dialed, so the duplicate is refused
        let (mut c3, _w3) = raw_handshake(n.addr, "z_9").await;
        assert_eq!(next(&mut c3).await.unwrap().kind, MessageKind::HandshakeResponse);
        let (mut c4, _w4) = raw_handshake(n.addr, "z_9").await;
        assert!(next(&mut c4).await.is_none());

        tokio::time::sleep(Duration::from_millis(100)).await;
        let peers = n.node.peers().await;
        assert_eq!(peers.len(), 2);
        assert!(peers.iter().all(|p| p.is_active));
    }

    #[tokio::test]
    async fn frame_reader_reassembles_small_reads() {
        let frame = encode_frame(&Message::chat("x", "all", &"y".repeat(50_000))).unwrap();
        let mut bytes = b"\n\n".to_vec();
        bytes.extend_from_slice(&frame);
        bytes.extend_from_slice(&frame);
        let (mut tx, rx) = tokio::io::duplex(1024);
        let writer = tokio::spawn(async move {
            for piece in bytes.chunks(777) {
                tx.write_all(piece).await.unwrap();
            }
        });
        let mut reader = FrameReader::new(rx);
        for _ in 0..2 {
            let msg = reader.next_message().await.unwrap().unwrap();
            assert_eq!(msg.content.len(), 50_000);
        }
        writer.await.unwrap();
        assert!(reader.next_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn frame_reader_rejects_unterminated_oversized_frame() {
        let (mut tx, rx) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let junk = vec![b'a'; 64 * 1024];
            while tx.write_all(&junk).await.is_ok() {}
        });
        let mut reader = FrameReader::new(rx);
        let err = reader.next_message().await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn replacing_a_link_keeps_peer_online_without_new_event() {
        let mut n = TestNode::start("m_5", "mid").await;
        let (mut c1, _w1) = raw_handshake(n.addr, "a_1").await;
        assert_eq!(next(&mut c1).await.unwrap().kind, MessageKind::HandshakeResponse);
        expect_event(&mut n.events, |e| matches!(e, NodeEvent::PeerOnline { id, .. } if id == "a_1")).await;

        let (mut c2, _w2) = raw_handshake(n.addr, "a_1").await;
        assert_eq!(next(&mut c2).await.unwrap().kind, MessageKind::HandshakeResponse);
        assert!(next(&mut c1).await.is_none());
        no_event(&mut n.events, |e| {
            matches!(e, NodeEvent::PeerOnline { .. } | NodeEvent::PeerOffline { .. })
        })
        .await;
        assert!(n.node.peers().await[0].is_active);
    }

    #[tokio::test]
    async fn peer_offline_when_remote_stops() {
        let mut a = TestNode::start("a_1", "alice").await;
        let mut b = TestNode::start("b_1", "bob").await;
        a.node
            .connect_to_peer("127.0.0.1", b.addr.port(), "b_1", "bob")
            .await;
        expect_event(&mut a.events, |e| matches!(e, NodeEvent::PeerOnline { .. })).await;
        expect_event(&mut b.events, |e| matches!(e, NodeEvent::PeerOnline { .. })).await;
        b.node.stop().await;
        expect_event(&mut a.events, |e| matches!(e, NodeEvent::PeerOffline { id, .. } if id == "b_1")).await;
        assert!(a.node.peers().await.is_empty());
    }
}
