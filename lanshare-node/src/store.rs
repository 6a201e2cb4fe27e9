//! Collaborators the node consumes: chat history (encrypted at rest) and the block-list.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use lanshare_core::identity::{self, CryptoError, SessionKey};
use lanshare_core::protocol::ChatKind;

use crate::events::ChatMessage;

/// A history record. Metadata is in clear; content is sealed with the node's storage key.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub sender: String,
    pub recipient: String,
    pub timestamp: DateTime<Utc>,
    pub is_own: bool,
    pub is_private: bool,
    pub message_type: ChatKind,
    pub message_id: String,
    pub reply_to_id: Option<String>,
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
}

impl StoredMessage {
    pub fn seal(key: &SessionKey, msg: &ChatMessage) -> Result<Self, CryptoError> {
        let sealed = identity::seal(key, msg.content.as_bytes())?;
        Ok(StoredMessage {
            sender: msg.sender.clone(),
            recipient: msg.recipient.clone(),
            timestamp: msg.timestamp,
            is_own: msg.is_own,
            is_private: msg.is_private,
            message_type: msg.message_type,
            message_id: msg.message_id.clone(),
            reply_to_id: msg.reply_to_id.clone(),
            ciphertext: sealed.ciphertext,
            nonce: sealed.nonce.to_vec(),
        })
    }

    pub fn open(&self, key: &SessionKey) -> Result<ChatMessage, CryptoError> {
        let plain = identity::open(key, &self.ciphertext, &self.nonce)?;
        Ok(ChatMessage {
            sender: self.sender.clone(),
            recipient: self.recipient.clone(),
            content: String::from_utf8_lossy(&plain).into_owned(),
            timestamp: self.timestamp,
            is_own: self.is_own,
            is_private: self.is_private,
            message_type: self.message_type,
            message_id: self.message_id.clone(),
            reply_to_id: self.reply_to_id.clone(),
        })
    }
}

/// Persistent chat history. Implementations only ever see sealed content.
pub trait HistoryStore: Send + Sync {
    fn persist(&self, msg: StoredMessage) -> anyhow::Result<()>;
    /// The newest `n` records, oldest first.
    fn load_recent(&self, n: usize) -> anyhow::Result<Vec<StoredMessage>>;
    /// Re-key records after a peer renames itself.
    fn rename_sender(&self, old: &str, new: &str) -> anyhow::Result<()>;
    fn close(&self);
}

/// In-process history. Lost on exit.
#[derive(Debug, Default)]
pub struct MemoryHistory {
    records: Mutex<Vec<StoredMessage>>,
    closed: AtomicBool,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl HistoryStore for MemoryHistory {
    fn persist(&self, msg: StoredMessage) -> anyhow::Result<()> {
        if self.is_closed() {
            anyhow::bail!("history store is closed");
        }
        self.records
            .lock()
            .map_err(|_| anyhow::anyhow!("history lock poisoned"))?
            .push(msg);
        Ok(())
    }

    fn load_recent(&self, n: usize) -> anyhow::Result<Vec<StoredMessage>> {
        let records = self
            .records
            .lock()
            .map_err(|_| anyhow::anyhow!("history lock poisoned"))?;
        let skip = records.len().saturating_sub(n);
        Ok(records[skip..].to_vec())
    }

    fn rename_sender(&self, old: &str, new: &str) -> anyhow::Result<()> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| anyhow::anyhow!("history lock poisoned"))?;
        for r in records.iter_mut() {
            if r.sender == old {
                r.sender = new.to_string();
            }
            if r.is_private && r.recipient == old {
                r.recipient = new.to_string();
            }
        }
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Access control consulted before delivering inbound chat.
pub trait BlockList: Send + Sync {
    /// `address` is the peer's reachable `ip:port`.
    fn is_blocked(&self, address: &str) -> bool;
}

#[derive(Debug, Default)]
pub struct MemoryBlockList {
    blocked: RwLock<HashSet<String>>,
}

impl MemoryBlockList {
    pub fn new<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            blocked: RwLock::new(addresses.into_iter().map(Into::into).collect()),
        }
    }

    pub fn block(&self, address: impl Into<String>) {
        if let Ok(mut b) = self.blocked.write() {
            b.insert(address.into());
        }
    }

    pub fn unblock(&self, address: &str) {
        if let Ok(mut b) = self.blocked.write() {
            b.remove(address);
        }
    }
}

impl BlockList for MemoryBlockList {
    fn is_blocked(&self, address: &str) -> bool {
        self.blocked
            .read()
            .map(|b| b.contains(address))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanshare_core::Keypair;

    fn chat(sender: &str, recipient: &str, content: &str, private: bool) -> ChatMessage {
        ChatMessage {
            sender: sender.into(),
            recipient: recipient.into(),
            content: content.into(),
            timestamp: Utc::now(),
            is_own: false,
            is_private: private,
            message_type: ChatKind::Text,
            message_id: lanshare_core::protocol::generate_message_id(),
            reply_to_id: None,
        }
    }

    #[test]
    fn records_are_sealed_at_rest() {
        let key = Keypair::generate().storage_key();
        let msg = chat("alice", "all", "top secret", false);
        let stored = StoredMessage::seal(&key, &msg).unwrap();
        assert!(!stored
            .ciphertext
            .windows(b"top secret".len())
            .any(|w| w == b"top secret"));
        assert_eq!(stored.open(&key).unwrap(), msg);
        let other = Keypair::generate().storage_key();
        assert!(stored.open(&other).is_err());
    }

    #[test]
    fn load_recent_returns_newest_in_order() {
        let key = Keypair::generate().storage_key();
        let h = MemoryHistory::new();
        for i in 0..5 {
            h.persist(StoredMessage::seal(&key, &chat("a", "all", &i.to_string(), false)).unwrap())
                .unwrap();
        }
        let recent: Vec<String> = h
            .load_recent(2)
            .unwrap()
            .iter()
            .map(|r| r.open(&key).unwrap().content)
            .collect();
        assert_eq!(recent, vec!["3", "4"]);
        assert_eq!(h.load_recent(10).unwrap().len(), 5);
    }

    #[test]
    fn rename_rewrites_sender_and_private_recipient() {
        let key = Keypair::generate().storage_key();
        let h = MemoryHistory::new();
        h.persist(StoredMessage::seal(&key, &chat("bob", "all", "hi", false)).unwrap())
            .unwrap();
        h.persist(StoredMessage::seal(&key, &chat("me", "bob", "psst", true)).unwrap())
            .unwrap();
        h.rename_sender("bob", "robert").unwrap();
        let all = h.load_recent(10).unwrap();
        assert_eq!(all[0].sender, "robert");
        assert_eq!(all[1].recipient, "robert");
    }

    #[test]
    fn closed_history_refuses_writes() {
        let key = Keypair::generate().storage_key();
        let h = MemoryHistory::new();
        h.close();
        assert!(h
            .persist(StoredMessage::seal(&key, &chat("a", "all", "x", false)).unwrap())
            .is_err());
    }

    #[test]
    fn block_and_unblock() {
        let b = MemoryBlockList::new(["10.0.0.9:8888"]);
        assert!(b.is_blocked("10.0.0.9:8888"));
        assert!(!b.is_blocked("10.0.0.9:8889"));
        b.unblock("10.0.0.9:8888");
        assert!(!b.is_blocked("10.0.0.9:8888"));
        b.block("10.0.0.2:8888");
        assert!(b.is_blocked("10.0.0.2:8888"));
    }
}
