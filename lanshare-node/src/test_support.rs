//! Loopback nodes for tests.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::config::NodeConfig;
use crate::events::NodeEvent;
use crate::node::Node;
use crate::store::{MemoryBlockList, MemoryHistory};

/// Loopback-only, ephemeral port, no discovery, short timers.
pub(crate) fn config() -> NodeConfig {
    let mut c = NodeConfig::default();
    c.local_ip = Some(Ipv4Addr::LOCALHOST);
    c.tcp_port = 0;
    c.enable_discovery = false;
    c.download_dir = std::env::temp_dir().join("lanshare-test-downloads");
    c.timing.dial_retries = 2;
    c.timing.dial_backoff = Duration::from_millis(10);
    c.timing.handshake_timeout = Duration::from_secs(2);
    c.timing.stop_timeout = Duration::from_secs(2);
    c
}

pub(crate) struct TestNode {
    pub node: Arc<Node>,
    pub events: UnboundedReceiver<NodeEvent>,
    pub addr: SocketAddr,
    pub history: Arc<MemoryHistory>,
    pub blocklist: Arc<MemoryBlockList>,
    pub dir: TempDir,
}

impl TestNode {
    pub fn unstarted(id: &str, name: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut c = config();
        c.name = name.to_string();
        c.download_dir = dir.path().join("downloads");
        let history = Arc::new(MemoryHistory::new());
        let blocklist = Arc::new(MemoryBlockList::default());
        let (node, events) = Node::with_id(c, id.to_string(), history.clone(), blocklist.clone());
        TestNode {
            node,
            events,
            addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            history,
            blocklist,
            dir,
        }
    }

    pub async fn start(id: &str, name: &str) -> Self {
        let mut t = Self::unstarted(id, name);
        t.addr = t.node.start().await.unwrap();
        t
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        let _ = self.node.stop_tx.send_replace(true);
    }
}

/// `a` dials `b`; returns once both sides report the other online.
pub(crate) async fn link(a: &mut TestNode, b: &mut TestNode) {
    let b_id = b.node.id().to_string();
    let a_id = a.node.id().to_string();
    let name = b.node.name().await;
    assert!(
        a.node
            .connect_to_peer("127.0.0.1", b.addr.port(), &b_id, &name)
            .await
    );
    expect_event(&mut a.events, |e| matches!(e, NodeEvent::PeerOnline { id, .. } if *id == b_id)).await;
    expect_event(&mut b.events, |e| matches!(e, NodeEvent::PeerOnline { id, .. } if *id == a_id)).await;
}

/// First event matching `pred`, skipping others. Panics after 5s.
pub(crate) async fn expect_event(
    rx: &mut UnboundedReceiver<NodeEvent>,
    pred: impl Fn(&NodeEvent) -> bool,
) -> NodeEvent {
    let wait = async {
        while let Some(ev) = rx.recv().await {
            if pred(&ev) {
                return ev;
            }
        }
        panic!("event channel closed");
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("timed out waiting for event")
}

/// Asserts nothing matching `pred` shows up for a short while.
pub(crate) async fn no_event(
    rx: &mut UnboundedReceiver<NodeEvent>,
    pred: impl Fn(&NodeEvent) -> bool,
) {
    let wait = async {
        while let Some(ev) = rx.recv().await {
            if pred(&ev) {
                return Some(ev);
            }
        }
        None
    };
    if let Ok(Some(ev)) = tokio::time::timeout(Duration::from_millis(300), wait).await {
        panic!("unexpected event {ev:?}");
    }
}
