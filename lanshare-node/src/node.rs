//! The node: identity, shared state, lifecycle, and the chat-facing operations.

use std::collections::HashSet;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;

use chrono::Utc;
use lanshare_core::identity::node_id;
use lanshare_core::protocol::generate_message_id;
use lanshare_core::{Keypair, Message, PublicKey, SessionKey, TransferTable, BROADCAST_RECIPIENT};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::NodeConfig;
use crate::error::{NodeError, Result};
use crate::events::{ChatMessage, EventSink, NodeEvent};
use crate::net;
use crate::registry::{PeerRegistry, PeerSnapshot};
use crate::store::{BlockList, HistoryStore, StoredMessage};

/// One message read from a peer link, tagged with the link it came from.
#[derive(Debug)]
pub(crate) struct Inbound {
    pub peer_id: String,
    pub conn_id: u64,
    pub message: Message,
}

/// Run `fut` as its own task and wait for it; a panic is logged instead of propagated.
pub(crate) async fn supervised<F>(what: &'static str, fut: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Err(e) = tokio::spawn(fut).await {
        if e.is_panic() {
            error!(task = what, "task panicked");
        }
    }
}

/// Resolves once the watched flag is true (or its sender is gone).
pub(crate) async fn signalled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|v| *v).await;
}

pub struct Node {
    pub(crate) id: String,
    pub(crate) ip: Ipv4Addr,
    name: RwLock<String>,
    pub(crate) config: NodeConfig,
    pub(crate) keypair: Keypair,
    storage_key: SessionKey,
    port: AtomicU16,
    pub(crate) registry: PeerRegistry,
    pub(crate) transfers: RwLock<TransferTable>,
    pub(crate) history: Arc<dyn HistoryStore>,
    pub(crate) blocklist: Arc<dyn BlockList>,
    pub(crate) events: EventSink,
    dispatch_tx: std::sync::Mutex<Option<mpsc::Sender<Inbound>>>,
    dispatch_rx: Mutex<Option<mpsc::Receiver<Inbound>>>,
    pub(crate) stop_tx: watch::Sender<bool>,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    pub(crate) dialing: std::sync::Mutex<HashSet<String>>,
    pub(crate) known_updates: std::sync::Mutex<HashSet<String>>,
}

impl Node {
    /// New node with a fresh key pair and an ID derived from the local IP and start time.
    pub fn new(
        config: NodeConfig,
        history: Arc<dyn HistoryStore>,
        blocklist: Arc<dyn BlockList>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<NodeEvent>) {
        let ip = config.local_ip.unwrap_or_else(net::local_ipv4);
        let id = node_id(&ip.to_string(), Utc::now());
        Self::with_id(config, id, history, blocklist)
    }

    pub fn with_id(
        config: NodeConfig,
        id: String,
        history: Arc<dyn HistoryStore>,
        blocklist: Arc<dyn BlockList>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<NodeEvent>) {
        let ip = config.local_ip.unwrap_or_else(net::local_ipv4);
        let keypair = Keypair::generate();
        let storage_key = keypair.storage_key();
        let (events, events_rx) = EventSink::channel();
        let (dispatch_tx, dispatch_rx) = mpsc::channel(config.timing.dispatch_capacity.max(1));
        let (stop_tx, _) = watch::channel(false);
        let node = Arc::new(Node {
            id,
            ip,
            name: RwLock::new(config.name.clone()),
            port: AtomicU16::new(config.tcp_port),
            config,
            keypair,
            storage_key,
            registry: PeerRegistry::new(),
            transfers: RwLock::new(TransferTable::new()),
            history,
            blocklist,
            events,
            dispatch_tx: std::sync::Mutex::new(Some(dispatch_tx)),
            dispatch_rx: Mutex::new(Some(dispatch_rx)),
            stop_tx,
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            dialing: std::sync::Mutex::new(HashSet::new()),
            known_updates: std::sync::Mutex::new(HashSet::new()),
        });
        (node, events_rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub async fn name(&self) -> String {
        self.name.read().await.clone()
    }

    pub fn public_key(&self) -> &PublicKey {
        self.keypair.public_key()
    }

    /// TCP port actually bound (the configured one until `start`).
    pub fn local_port(&self) -> u16 {
        self.port.load(Ordering::SeqCst)
    }

    pub(crate) fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.is_stopped()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(NodeError::NotRunning)
        }
    }

    pub(crate) fn dispatch_sender(&self) -> Option<mpsc::Sender<Inbound>> {
        self.dispatch_tx.lock().ok()?.clone()
    }

    /// Bind the listener and spawn the accept loop, dispatch consumer and discovery.
    /// Returns the bound address.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        if self.is_stopped() {
            return Err(NodeError::NotRunning);
        }
        let rx = self.dispatch_rx.lock().await.take();
        let Some(rx) = rx else {
            return Ok(SocketAddr::new(self.bind_ip().into(), self.local_port()));
        };

        let listener = self.bind_listener().await?;
        let addr = listener.local_addr()?;
        self.port.store(addr.port(), Ordering::SeqCst);
        self.started.store(true, Ordering::SeqCst);

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(self.clone().run_dispatch(rx)));
        tasks.push(tokio::spawn(self.clone().accept_loop(listener)));
        if self.config.enable_discovery {
            match self.start_discovery().await {
                Ok(handles) => tasks.extend(handles),
                Err(e) => warn!(port = self.config.discovery_port, error = %e, "discovery unavailable"),
            }
        }
        info!(id = %self.id, %addr, name = %self.name().await, "node started");
        Ok(addr)
    }

    fn bind_ip(&self) -> Ipv4Addr {
        if self.config.local_ip.is_some() {
            self.ip
        } else {
            Ipv4Addr::UNSPECIFIED
        }
    }

    /// Retry the configured port a few times, then walk the next few ports.
    async fn bind_listener(&self) -> Result<TcpListener> {
        let ip = self.bind_ip();
        let timing = &self.config.timing;
        let base = self.config.tcp_port;
        if base == 0 {
            return Ok(TcpListener::bind((ip, 0)).await?);
        }
        let mut last_err = None;
        for attempt in 1..=timing.listen_retries.max(1) {
            match TcpListener::bind((ip, base)).await {
                Ok(l) => return Ok(l),
                Err(e) => {
                    warn!(port = base, attempt, error = %e, "listen failed");
                    last_err = Some(e);
                    if attempt < timing.listen_retries {
                        tokio::time::sleep(timing.dial_backoff * attempt).await;
                    }
                }
            }
        }
        for offset in 1..=timing.listen_fallback_ports {
            let Some(port) = base.checked_add(offset) else {
                break;
            };
            match TcpListener::bind((ip, port)).await {
                Ok(l) => {
                    info!(port, "listening on fallback port");
                    return Ok(l);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err
            .unwrap_or_else(|| std::io::Error::other("no port available"))
            .into())
    }

    /// Stop every loop and close every link. Safe to call more than once.
    pub async fn stop(&self) {
        if self.stop_tx.send_replace(true) {
            return;
        }
        info!(id = %self.id, "stopping node");
        for conn in self.registry.connections().await {
            conn.shutdown().await;
        }
        // read loops hold the remaining senders; the channel closes once they exit
        if let Ok(mut tx) = self.dispatch_tx.lock() {
            tx.take();
        }
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for mut task in tasks {
            if tokio::time::timeout(self.config.timing.stop_timeout, &mut task)
                .await
                .is_err()
            {
                warn!("task did not stop in time, aborting");
                task.abort();
            }
        }
        self.history.close();
        debug!("node stopped");
    }

    pub async fn peers(&self) -> Vec<PeerSnapshot> {
        self.registry.snapshot().await
    }

    /// Persist (sealed with the storage key) and announce a delivered chat message.
    pub(crate) async fn deliver(&self, chat: ChatMessage) {
        match StoredMessage::seal(&self.storage_key, &chat) {
            Ok(record) => {
                if let Err(e) = self.history.persist(record) {
                    warn!(error = %e, "history persist failed");
                }
            }
            Err(e) => warn!(error = %e, "cannot seal history record"),
        }
        self.events.emit(NodeEvent::NewMessage(chat));
    }

    /// Send a public chat message to every active peer.
    pub async fn broadcast_chat(&self, text: &str) -> Result<ChatMessage> {
        self.ensure_running()?;
        let msg = Message::chat(&self.id, BROADCAST_RECIPIENT, text);
        for peer in self.registry.active_handles().await {
            let mut out = msg.clone();
            out.to = BROADCAST_RECIPIENT.to_string();
            match peer.shared_key {
                Some(key) => out.seal_content(&key)?,
                None => warn!(peer = %peer.id, "no shared key yet, chat sent in clear"),
            }
            if let Err(e) = peer.conn.send(&out).await {
                warn!(peer = %peer.id, error = %e, "chat send failed");
            }
        }
        let chat = self.own_chat(&msg, BROADCAST_RECIPIENT.to_string(), false).await;
        self.deliver(chat.clone()).await;
        Ok(chat)
    }

    /// Send a private chat message to the active peer named `peer_name`.
    pub async fn send_private(&self, peer_name: &str, text: &str) -> Result<ChatMessage> {
        self.ensure_running()?;
        let peer = self
            .registry
            .find_by_name(peer_name)
            .await
            .ok_or_else(|| NodeError::PeerNotFound(peer_name.to_string()))?;
        let msg = Message::chat(&self.id, &peer.id, text);
        let mut out = msg.clone();
        match peer.shared_key {
            Some(key) => out.seal_content(&key)?,
            None => warn!(peer = %peer.id, "no shared key yet, chat sent in clear"),
        }
        peer.conn.send(&out).await?;
        let chat = self.own_chat(&msg, peer.name.clone(), true).await;
        self.deliver(chat.clone()).await;
        Ok(chat)
    }

    async fn own_chat(&self, msg: &Message, recipient: String, is_private: bool) -> ChatMessage {
        ChatMessage {
            sender: self.name().await,
            recipient,
            content: msg.content.clone(),
            timestamp: msg.timestamp.unwrap_or_else(Utc::now),
            is_own: true,
            is_private,
            message_type: msg.message_type.unwrap_or_default(),
            message_id: msg
                .message_id
                .clone()
                .unwrap_or_else(generate_message_id),
            reply_to_id: msg.reply_to_id.clone(),
        }
    }

    /// Change the local display name and tell every active peer.
    pub async fn set_name(&self, new_name: &str) -> Result<()> {
        let new_name = new_name.trim();
        if new_name.is_empty() {
            return Ok(());
        }
        *self.name.write().await = new_name.to_string();
        if !self.is_running() {
            return Ok(());
        }
        let msg = Message::update_name(&self.id, new_name);
        for peer in self.registry.active_handles().await {
            if let Err(e) = peer.conn.send(&msg).await {
                warn!(peer = %peer.id, error = %e, "rename notice failed");
            }
        }
        info!(name = %new_name, "display name changed");
        Ok(())
    }

    /// Newest `n` history records, decrypted. Records that fail to open are skipped.
    pub fn recent_messages(&self, n: usize) -> anyhow::Result<Vec<ChatMessage>> {
        let records = self.history.load_recent(n)?;
        Ok(records
            .iter()
            .filter_map(|r| match r.open(&self.storage_key) {
                Ok(chat) => Some(chat),
                Err(e) => {
                    warn!(message_id = %r.message_id, error = %e, "skipping unreadable history record");
                    None
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{expect_event, link, no_event, TestNode};

    #[tokio::test]
    async fn broadcast_reaches_peer_encrypted_and_is_stored() {
        let mut a = TestNode::start("a_1", "alice").await;
        let mut b = TestNode::start("b_1", "bob").await;
        link(&mut a, &mut b).await;

        let sent = a.node.broadcast_chat("hello mesh").await.unwrap();
        assert!(sent.is_own);
        let got = expect_event(&mut b.events, |e| matches!(e, NodeEvent::NewMessage(_))).await;
        let NodeEvent::NewMessage(chat) = got else { unreachable!() };
        assert_eq!(chat.content, "hello mesh");
        assert_eq!(chat.sender, "alice");
        assert_eq!(chat.recipient, BROADCAST_RECIPIENT);
        assert!(!chat.is_own && !chat.is_private);
        assert_eq!(chat.message_id, sent.message_id);

        // stored sealed, readable through the node
        assert_eq!(b.history.len(), 1);
        let stored = b.history.load_recent(1).unwrap();
        assert!(!stored[0].ciphertext.windows(10).any(|w| w == b"hello mesh"));
        assert_eq!(b.node.recent_messages(10).unwrap()[0].content, "hello mesh");
        assert_eq!(a.node.recent_messages(10).unwrap()[0].content, "hello mesh");
    }

    #[tokio::test]
    async fn private_message_by_name() {
        let mut a = TestNode::start("a_1", "alice").await;
        let mut b = TestNode::start("b_1", "bob").await;
        link(&mut a, &mut b).await;

        let sent = a.node.send_private("bob", "just you").await.unwrap();
        assert!(sent.is_private);
        assert_eq!(sent.recipient, "bob");
        let got = expect_event(&mut b.events, |e| matches!(e, NodeEvent::NewMessage(_))).await;
        let NodeEvent::NewMessage(chat) = got else { unreachable!() };
        assert!(chat.is_private);
        assert_eq!(chat.recipient, "bob");
        assert_eq!(chat.content, "just you");

        assert!(matches!(
            a.node.send_private("carol", "?").await,
            Err(NodeError::PeerNotFound(name)) if name == "carol"
        ));
    }

    #[tokio::test]
    async fn blocked_sender_is_neither_delivered_nor_stored() {
        let mut a = TestNode::start("a_1", "alice").await;
        let mut b = TestNode::start("b_1", "bob").await;
        b.blocklist.block(format!("127.0.0.1:{}", a.addr.port()));
        link(&mut a, &mut b).await;

        a.node.broadcast_chat("let me in").await.unwrap();
        // same link, processed in order: the rename marks the chat as handled
        a.node.set_name("alicia").await.unwrap();
        let ev = expect_event(&mut b.events, |e| {
            matches!(e, NodeEvent::NewMessage(_) | NodeEvent::PeerRenamed { .. })
        })
        .await;
        assert!(matches!(ev, NodeEvent::PeerRenamed { .. }));
        assert!(b.history.is_empty());
    }

    #[tokio::test]
    async fn rename_updates_registry_and_history() {
        let mut a = TestNode::start("a_1", "alice").await;
        let mut b = TestNode::start("b_1", "bob").await;
        link(&mut a, &mut b).await;

        a.node.broadcast_chat("before").await.unwrap();
        expect_event(&mut b.events, |e| matches!(e, NodeEvent::NewMessage(_))).await;
        a.node.set_name("alicia").await.unwrap();
        let ev = expect_event(&mut b.events, |e| matches!(e, NodeEvent::PeerRenamed { .. })).await;
        let NodeEvent::PeerRenamed { old, new, .. } = ev else { unreachable!() };
        assert_eq!((old.as_str(), new.as_str()), ("alice", "alicia"));
        assert_eq!(b.node.peers().await[0].name, "alicia");
        assert_eq!(b.node.recent_messages(5).unwrap()[0].sender, "alicia");
    }

    #[tokio::test]
    async fn operations_need_a_running_node() {
        let a = TestNode::unstarted("a_1", "alice");
        assert!(matches!(
            a.node.broadcast_chat("x").await,
            Err(NodeError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_closes_history() {
        let mut a = TestNode::start("a_1", "alice").await;
        a.node.stop().await;
        a.node.stop().await;
        assert!(a.history.is_closed());
        assert!(!a.node.is_running());
        assert!(matches!(a.node.start().await, Err(NodeError::NotRunning)));
        no_event(&mut a.events, |e| matches!(e, NodeEvent::PeerOffline { .. })).await;
    }

    #[tokio::test]
    async fn listener_walks_to_next_port_when_busy() {
        let busy = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = busy.local_addr().unwrap().port();
        let mut config = crate::test_support::config();
        config.tcp_port = port;
        config.timing.listen_retries = 1;
        let (node, _events) = Node::with_id(
            config,
            "a_1".into(),
            Arc::new(crate::store::MemoryHistory::new()),
            Arc::new(crate::store::MemoryBlockList::default()),
        );
        match node.start().await {
            Ok(addr) => assert_ne!(addr.port(), port),
            // every fallback port taken on this host
            Err(NodeError::Io(_)) => {}
            Err(e) => panic!("unexpected error {e}"),
        }
        node.stop().await;
    }
}
