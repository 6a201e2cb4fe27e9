//! Events for the UI layer. Delivered on an unbounded channel so the node never waits on a consumer.

use chrono::{DateTime, Utc};
use lanshare_core::protocol::ChatKind;
use lanshare_core::version::Channel;
use lanshare_core::FileTransferStatus;
use serde::Serialize;
use tokio::sync::mpsc;

/// A chat message as delivered to the UI and kept in history.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub sender: String,
    /// `"all"` for public messages, otherwise the recipient's name.
    pub recipient: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub is_own: bool,
    pub is_private: bool,
    pub message_type: ChatKind,
    pub message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
}

/// A peer advertising a newer build.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSource {
    pub ip: String,
    pub name: String,
    pub version: String,
    pub channel: Channel,
    pub web_port: u16,
}

#[derive(Debug, Clone)]
pub enum NodeEvent {
    NewMessage(ChatMessage),
    PeerOnline { id: String, name: String },
    PeerOffline { id: String, name: String },
    PeerRenamed { id: String, old: String, new: String },
    /// An incoming transfer awaits accept or reject.
    FileRequested(FileTransferStatus),
    TransferUpdated(FileTransferStatus),
    UpdateAvailable(UpdateSource),
}

#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<NodeEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<NodeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Fire and forget; a dropped receiver is fine.
    pub fn emit(&self, event: NodeEvent) {
        let _ = self.tx.send(event);
    }
}
