//! Peer registry: the one map of who is reachable. All access goes through the lock
//! inside [`PeerRegistry`]; callers get owned snapshots and handles, never references.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use lanshare_core::{HandshakeInfo, PublicKey, SessionKey};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::connection::PeerConn;

/// Canonical entry for one remote node.
#[derive(Debug)]
pub struct Peer {
    pub id: String,
    pub name: String,
    pub ip: String,
    /// Listening port advertised by the peer, not the socket's source port.
    pub port: u16,
    pub conn: Arc<PeerConn>,
    pub is_active: bool,
    /// We dialed this link.
    pub outbound: bool,
    pub last_seen: DateTime<Utc>,
    pub public_key: Option<PublicKey>,
    pub shared_key: Option<SessionKey>,
}

impl Peer {
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    fn handle(&self) -> PeerHandle {
        PeerHandle {
            id: self.id.clone(),
            name: self.name.clone(),
            address: self.address(),
            conn: self.conn.clone(),
            shared_key: self.shared_key,
        }
    }
}

/// What a task needs to talk to a peer, detached from the registry lock.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    pub id: String,
    pub name: String,
    pub address: String,
    pub conn: Arc<PeerConn>,
    pub shared_key: Option<SessionKey>,
}

/// Read-only view for the UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSnapshot {
    pub id: String,
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub is_active: bool,
    pub outbound: bool,
    pub last_seen: DateTime<Utc>,
    pub has_shared_key: bool,
}

/// Outcome of registering an accepted connection.
#[derive(Debug)]
pub enum Admission {
    Inserted,
    /// An active entry existed and was replaced; the old link must be closed.
    Replaced(Arc<PeerConn>),
    /// Local ID is smaller, so this side should have dialed: the duplicate is refused.
    Rejected,
}

#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<String, Peer>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_active(&self, id: &str) -> bool {
        self.peers
            .read()
            .await
            .get(id)
            .map(|p| p.is_active)
            .unwrap_or(false)
    }

    /// Register a dialed link. Fails (handing the peer back) if an active entry exists.
    pub async fn admit_outbound(&self, peer: Peer) -> Result<(), Peer> {
        let mut peers = self.peers.write().await;
        if peers.get(&peer.id).map(|p| p.is_active).unwrap_or(false) {
            return Err(peer);
        }
        peers.insert(peer.id.clone(), peer);
        Ok(())
    }

    /// Register an accepted link, resolving duplicates by ID order.
    pub async fn admit_inbound(&self, peer: Peer, local_id: &str) -> Admission {
        let mut peers = self.peers.write().await;
        let existing = match peers.get(&peer.id) {
            Some(p) if p.is_active => Some(p.conn.clone()),
            _ => None,
        };
        match existing {
            Some(_) if local_id < peer.id.as_str() => Admission::Rejected,
            Some(old) => {
                peers.insert(peer.id.clone(), peer);
                Admission::Replaced(old)
            }
            None => {
                peers.insert(peer.id.clone(), peer);
                Admission::Inserted
            }
        }
    }

    /// Remove the entry only while it still belongs to connection `conn_id`.
    pub async fn remove_if_current(&self, id: &str, conn_id: u64) -> Option<Peer> {
        let mut peers = self.peers.write().await;
        if peers.get(id).map(|p| p.conn.id()) != Some(conn_id) {
            return None;
        }
        let mut peer = peers.remove(id)?;
        peer.is_active = false;
        Some(peer)
    }

    /// Close connection `conn_id` of peer `id`, if it is still the registered one.
    pub async fn close_conn(&self, id: &str, conn_id: u64) {
        if let Some(p) = self.peers.read().await.get(id) {
            if p.conn.id() == conn_id {
                p.conn.close();
            }
        }
    }

    /// Store the remote key material and details from a handshake response.
    /// Returns the peer's name, or `None` if the link was replaced meanwhile.
    pub async fn complete_handshake(
        &self,
        id: &str,
        conn_id: u64,
        info: &HandshakeInfo,
        key: SessionKey,
    ) -> Option<String> {
        let mut peers = self.peers.write().await;
        let peer = peers.get_mut(id).filter(|p| p.conn.id() == conn_id)?;
        peer.public_key = Some(info.public_key);
        peer.shared_key = Some(key);
        if !info.name.is_empty() {
            peer.name = info.name.clone();
        }
        if info.port != 0 {
            peer.port = info.port;
        }
        peer.last_seen = Utc::now();
        Some(peer.name.clone())
    }

    /// Returns the previous name when it changed.
    pub async fn rename(&self, id: &str, new_name: &str) -> Option<String> {
        let mut peers = self.peers.write().await;
        let peer = peers.get_mut(id)?;
        if peer.name == new_name {
            return None;
        }
        Some(std::mem::replace(&mut peer.name, new_name.to_string()))
    }

    pub async fn touch(&self, id: &str) {
        if let Some(p) = self.peers.write().await.get_mut(id) {
            p.last_seen = Utc::now();
        }
    }

    pub async fn handle(&self, id: &str) -> Option<PeerHandle> {
        self.peers
            .read()
            .await
            .get(id)
            .filter(|p| p.is_active)
            .map(Peer::handle)
    }

    pub async fn find_by_name(&self, name: &str) -> Option<PeerHandle> {
        self.peers
            .read()
            .await
            .values()
            .find(|p| p.is_active && p.name == name)
            .map(Peer::handle)
    }

    pub async fn shared_key(&self, id: &str) -> Option<SessionKey> {
        self.peers.read().await.get(id).and_then(|p| p.shared_key)
    }

    pub async fn active_handles(&self) -> Vec<PeerHandle> {
        self.peers
            .read()
            .await
            .values()
            .filter(|p| p.is_active)
            .map(Peer::handle)
            .collect()
    }

    pub async fn connections(&self) -> Vec<Arc<PeerConn>> {
        self.peers
            .read()
            .await
            .values()
            .map(|p| p.conn.clone())
            .collect()
    }

    pub async fn snapshot(&self) -> Vec<PeerSnapshot> {
        let mut out: Vec<PeerSnapshot> = self
            .peers
            .read()
            .await
            .values()
            .map(|p| PeerSnapshot {
                id: p.id.clone(),
                name: p.name.clone(),
                ip: p.ip.clone(),
                port: p.port,
                is_active: p.is_active,
                outbound: p.outbound,
                last_seen: p.last_seen,
                has_shared_key: p.shared_key.is_some(),
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }
}
