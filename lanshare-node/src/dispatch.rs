//! Dispatch: the single consumer of inbound traffic. All reactions to peer messages
//! (chat delivery, handshake completion, transfer state) happen here, one message at a time.

use std::sync::Arc;

use chrono::Utc;
use lanshare_core::protocol::generate_message_id;
use lanshare_core::{HandshakeInfo, Message, Payload, ProtocolError, BROADCAST_RECIPIENT};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::events::{ChatMessage, NodeEvent};
use crate::node::{supervised, Inbound, Node};

const DECRYPTION_FAILED: &str = "[decryption failed]";
const NO_SHARED_KEY: &str = "[decryption failed: no shared key]";

impl Node {
    pub(crate) async fn run_dispatch(self: Arc<Self>, mut rx: mpsc::Receiver<Inbound>) {
        let mut gc = tokio::time::interval(self.config.timing.gc_interval);
        gc.tick().await;
        loop {
            tokio::select! {
                inbound = rx.recv() => match inbound {
                    Some(inbound) => {
                        let node = self.clone();
                        supervised("dispatch", async move { node.dispatch(inbound).await }).await;
                    }
                    None => break,
                },
                _ = gc.tick() => self.collect_transfers().await,
            }
        }
        debug!("dispatch drained");
    }

    async fn dispatch(self: &Arc<Self>, inbound: Inbound) {
        let Inbound {
            peer_id,
            conn_id,
            message,
        } = inbound;
        let payload = match message.payload() {
            Ok(p) => p,
            Err(e) => {
                warn!(peer = %peer_id, kind = ?message.kind, error = %e, "protocol violation, dropping link");
                self.registry.close_conn(&peer_id, conn_id).await;
                return;
            }
        };
        match payload {
            Payload::Chat => self.handle_chat(&peer_id, message).await,
            Payload::Handshake(_) => debug!(peer = %peer_id, "ignoring repeated handshake"),
            Payload::HandshakeResponse(info) => {
                self.handle_handshake_response(&peer_id, conn_id, info).await
            }
            Payload::FileRequest(req) => self.handle_file_request(&peer_id, req).await,
            Payload::FileResponse(resp) => self.handle_file_response(&peer_id, resp).await,
            Payload::FileChunk(chunk) => self.handle_file_chunk(&peer_id, chunk).await,
            Payload::FileCancel(cancel) => self.handle_file_cancel(&peer_id, cancel).await,
            Payload::UpdateName => self.handle_update_name(&peer_id, &message.content).await,
        }
    }

    async fn handle_handshake_response(&self, peer_id: &str, conn_id: u64, info: HandshakeInfo) {
        let key = self.keypair.session_key(&info.public_key);
        match self
            .registry
            .complete_handshake(peer_id, conn_id, &info, key)
            .await
        {
            Some(name) => {
                info!(peer = %peer_id, name = %name, "peer online (outbound)");
                self.events.emit(NodeEvent::PeerOnline {
                    id: peer_id.to_string(),
                    name,
                });
            }
            None => debug!(peer = %peer_id, "handshake response for a replaced link"),
        }
    }

    async fn handle_chat(&self, peer_id: &str, msg: Message) {
        let Some(peer) = self.registry.handle(peer_id).await else {
            debug!(peer = %peer_id, "chat from unknown peer dropped");
            return;
        };
        if self.blocklist.is_blocked(&peer.address) {
            debug!(peer = %peer_id, address = %peer.address, "chat from blocked peer dropped");
            return;
        }
        let is_private = !msg.is_broadcast();
        if is_private && msg.to != self.id {
            debug!(peer = %peer_id, to = %msg.to, "chat not addressed to us");
            return;
        }
        let content = match msg.open_content(peer.shared_key.as_ref()) {
            Ok(text) => text,
            Err(ProtocolError::MissingKey) => {
                warn!(peer = %peer_id, "encrypted chat before key exchange");
                NO_SHARED_KEY.to_string()
            }
            Err(e) => {
                warn!(
                    peer = %peer_id,
                    key_len = peer.shared_key.map(|k| k.len()).unwrap_or(0),
                    nonce_len = msg.nonce.as_ref().map(Vec::len).unwrap_or(0),
                    ciphertext_len = msg.ciphertext.as_ref().map(Vec::len).unwrap_or(0),
                    error = %e,
                    "chat decryption failed"
                );
                DECRYPTION_FAILED.to_string()
            }
        };
        let recipient = if is_private {
            self.name().await
        } else {
            BROADCAST_RECIPIENT.to_string()
        };
        let chat = ChatMessage {
            sender: peer.name,
            recipient,
            content,
            timestamp: msg.timestamp.unwrap_or_else(Utc::now),
            is_own: false,
            is_private,
            message_type: msg.message_type.unwrap_or_default(),
            message_id: msg.message_id.unwrap_or_else(generate_message_id),
            reply_to_id: msg.reply_to_id,
        };
        self.deliver(chat).await;
    }

    async fn handle_update_name(&self, peer_id: &str, new_name: &str) {
        let new_name = new_name.trim();
        if new_name.is_empty() {
            return;
        }
        let Some(old) = self.registry.rename(peer_id, new_name).await else {
            return;
        };
        info!(peer = %peer_id, %old, new = %new_name, "peer renamed");
        if let Err(e) = self.history.rename_sender(&old, new_name) {
            warn!(error = %e, "history rename failed");
        }
        self.rename_transfer_peer(peer_id, new_name).await;
        self.events.emit(NodeEvent::PeerRenamed {
            id: peer_id.to_string(),
            old,
            new: new_name.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{expect_event, link, TestNode};
    use lanshare_core::MessageKind;
    use std::time::Duration;

    #[tokio::test]
    async fn undecryptable_chat_shows_placeholder() {
        let mut a = TestNode::start("a_1", "alice").await;
        let mut b = TestNode::start("b_1", "bob").await;
        link(&mut a, &mut b).await;

        let peer = a.node.registry.handle("b_1").await.unwrap();
        let mut msg = Message::chat("a_1", BROADCAST_RECIPIENT, "garbled");
        msg.seal_content(&[9u8; 32]).unwrap();
        peer.conn.send(&msg).await.unwrap();

        let ev = expect_event(&mut b.events, |e| matches!(e, NodeEvent::NewMessage(_))).await;
        let NodeEvent::NewMessage(chat) = ev else { unreachable!() };
        assert_eq!(chat.content, DECRYPTION_FAILED);
        assert_eq!(chat.sender, "alice");
    }

    #[tokio::test]
    async fn private_chat_for_someone_else_is_ignored() {
        let mut a = TestNode::start("a_1", "alice").await;
        let mut b = TestNode::start("b_1", "bob").await;
        link(&mut a, &mut b).await;

        let peer = a.node.registry.handle("b_1").await.unwrap();
        peer.conn
            .send(&Message::chat("a_1", "c_1", "not for bob"))
            .await
            .unwrap();
        peer.conn
            .send(&Message::chat("a_1", BROADCAST_RECIPIENT, "for everyone"))
            .await
            .unwrap();
        let ev = expect_event(&mut b.events, |e| matches!(e, NodeEvent::NewMessage(_))).await;
        let NodeEvent::NewMessage(chat) = ev else { unreachable!() };
        assert_eq!(chat.content, "for everyone");
    }

    #[tokio::test]
    async fn malformed_payload_drops_the_link() {
        let mut a = TestNode::start("a_1", "alice").await;
        let mut b = TestNode::start("b_1", "bob").await;
        link(&mut a, &mut b).await;

        let peer = a.node.registry.handle("b_1").await.unwrap();
        let mut bad = Message::chat("a_1", "b_1", "");
        bad.kind = MessageKind::FileRequest;
        bad.data = Some(serde_json::json!({ "unexpected": true }));
        peer.conn.send(&bad).await.unwrap();

        expect_event(&mut b.events, |e| matches!(e, NodeEvent::PeerOffline { id, .. } if id == "a_1")).await;
        expect_event(&mut a.events, |e| matches!(e, NodeEvent::PeerOffline { id, .. } if id == "b_1")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(b.node.peers().await.is_empty());
    }
}
