//! File transfer engine: request, accept/reject, chunked encrypted streaming, cancel, GC.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use lanshare_core::chunk::{split_into_chunks, DEFAULT_CHUNK_SIZE, MAX_FILE_SIZE};
use lanshare_core::transfer::generate_file_id;
use lanshare_core::{
    Direction, FileCancel, FileChunk, FileRequest, FileResponse, FileTransferStatus, Message,
    Payload, TransferStatus,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::connection::PeerConn;
use crate::error::{NodeError, Result};
use crate::events::NodeEvent;
use crate::node::{supervised, Node};

impl Node {
    /// Offer `path` to the active peer named `peer_name`. Returns the new file ID.
    pub async fn send_file(self: &Arc<Self>, path: impl AsRef<Path>, peer_name: &str) -> Result<String> {
        if !self.is_running() {
            return Err(NodeError::NotRunning);
        }
        let path = path.as_ref().to_path_buf();
        let meta = tokio::fs::metadata(&path).await?;
        if !meta.is_file() {
            return Err(NodeError::NotAFile(path));
        }
        if meta.len() > MAX_FILE_SIZE {
            return Err(NodeError::FileTooLarge {
                size: meta.len(),
                limit: MAX_FILE_SIZE,
            });
        }
        let peer = self
            .registry
            .find_by_name(peer_name)
            .await
            .ok_or_else(|| NodeError::PeerNotFound(peer_name.to_string()))?;
        if peer.shared_key.is_none() {
            return Err(NodeError::NoSharedKey(peer_name.to_string()));
        }

        let file_id = generate_file_id();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let status = FileTransferStatus::outgoing(
            file_id.clone(),
            file_name.clone(),
            meta.len(),
            peer.id.clone(),
            peer.name.clone(),
            path,
        );
        self.transfers.write().await.insert(status.clone());
        self.events.emit(NodeEvent::TransferUpdated(status));

        let request = Message::new(
            &self.id,
            &peer.id,
            Payload::FileRequest(FileRequest {
                file_id: file_id.clone(),
                file_name,
                file_size: meta.len(),
            }),
        )?;
        if let Err(e) = peer.conn.send(&request).await {
            self.fail_transfer(&file_id, format!("request not sent: {e}")).await;
            return Err(e);
        }
        info!(file_id = %file_id, peer = %peer.id, size = meta.len(), "file offered");
        Ok(file_id)
    }

    /// Accept or reject a pending incoming transfer.
    pub async fn respond_to_transfer(&self, file_id: &str, accept: bool) -> Result<()> {
        let (peer_id, peer_name, file_name) = {
            let table = self.transfers.read().await;
            let t = table
                .get(file_id)
                .ok_or_else(|| NodeError::UnknownTransfer(file_id.to_string()))?;
            if t.direction != Direction::Receive || t.status != TransferStatus::Pending {
                return Err(NodeError::InvalidTransferState {
                    file_id: file_id.to_string(),
                    status: t.status,
                });
            }
            (t.peer_id.clone(), t.peer_name.clone(), t.file_name.clone())
        };
        let peer = self
            .registry
            .handle(&peer_id)
            .await
            .ok_or(NodeError::PeerNotFound(peer_name))?;

        if !accept {
            if let Some(mut t) = self.transfers.write().await.remove(file_id) {
                t.cancel();
                self.events.emit(NodeEvent::TransferUpdated(t));
            }
            self.send_response(&peer.conn, &peer.id, file_id, false, "rejected")
                .await?;
            info!(file_id = %file_id, peer = %peer_id, "transfer rejected");
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.config.download_dir).await?;
        let dest = unique_path(&self.config.download_dir, &file_name).await;
        tokio::fs::File::create(&dest).await?;
        let started = {
            let mut table = self.transfers.write().await;
            let t = table
                .get_mut(file_id)
                .ok_or_else(|| NodeError::UnknownTransfer(file_id.to_string()))?;
            t.file_path = dest.clone();
            let completed = t.start(Instant::now()).map_err(|_| NodeError::InvalidTransferState {
                file_id: file_id.to_string(),
                status: t.status,
            })?;
            (completed, t.clone())
        };
        let (completed, snapshot) = started;
        self.events.emit(NodeEvent::TransferUpdated(snapshot));

        if let Err(e) = self
            .send_response(&peer.conn, &peer.id, file_id, true, "accepted")
            .await
        {
            self.fail_transfer(file_id, format!("response not sent: {e}")).await;
            return Err(e);
        }
        info!(file_id = %file_id, dest = %dest.display(), completed, "transfer accepted");
        Ok(())
    }

    /// Cancel a transfer locally and tell the peer.
    pub async fn cancel_transfer(&self, file_id: &str) -> Result<()> {
        let snapshot = {
            let mut table = self.transfers.write().await;
            let t = table
                .get_mut(file_id)
                .ok_or_else(|| NodeError::UnknownTransfer(file_id.to_string()))?;
            if !t.cancel() {
                return Err(NodeError::InvalidTransferState {
                    file_id: file_id.to_string(),
                    status: t.status,
                });
            }
            t.clone()
        };
        let peer_id = snapshot.peer_id.clone();
        self.events.emit(NodeEvent::TransferUpdated(snapshot));
        self.send_cancel(&peer_id, file_id, false, "cancelled by peer").await;
        info!(file_id = %file_id, "transfer cancelled");
        Ok(())
    }

    pub async fn transfers(&self) -> Vec<FileTransferStatus> {
        self.transfers.read().await.snapshot()
    }

    pub async fn transfer(&self, file_id: &str) -> Option<FileTransferStatus> {
        self.transfers.read().await.get(file_id).cloned()
    }

    async fn send_response(
        &self,
        conn: &PeerConn,
        peer_id: &str,
        file_id: &str,
        accepted: bool,
        message: &str,
    ) -> Result<()> {
        let msg = Message::new(
            &self.id,
            peer_id,
            Payload::FileResponse(FileResponse {
                file_id: file_id.to_string(),
                accepted,
                message: message.to_string(),
            }),
        )?;
        conn.send(&msg).await
    }

    /// Best effort; the link may already be gone.
    async fn send_cancel(&self, peer_id: &str, file_id: &str, failed: bool, reason: &str) {
        let Some(peer) = self.registry.handle(peer_id).await else {
            return;
        };
        let msg = match Message::new(
            &self.id,
            peer_id,
            Payload::FileCancel(FileCancel {
                file_id: file_id.to_string(),
                failed,
                reason: reason.to_string(),
            }),
        ) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "cannot build cancel");
                return;
            }
        };
        if let Err(e) = peer.conn.send(&msg).await {
            debug!(file_id = %file_id, error = %e, "cancel not delivered");
        }
    }

    /// Apply `f` to a transfer and emit its new state. `None` if the ID is unknown.
    async fn update_transfer<R>(
        &self,
        file_id: &str,
        f: impl FnOnce(&mut FileTransferStatus) -> R,
    ) -> Option<R> {
        let (out, snapshot) = {
            let mut table = self.transfers.write().await;
            let t = table.get_mut(file_id)?;
            let out = f(t);
            (out, t.clone())
        };
        self.events.emit(NodeEvent::TransferUpdated(snapshot));
        Some(out)
    }

    async fn fail_transfer(&self, file_id: &str, reason: String) -> bool {
        warn!(file_id = %file_id, reason = %reason, "transfer failed");
        self.update_transfer(file_id, |t| t.fail(reason))
            .await
            .unwrap_or(false)
    }

    /// Fail, and tell the peer why.
    async fn abort_transfer(&self, peer_id: &str, file_id: &str, reason: String) {
        if self.fail_transfer(file_id, reason.clone()).await {
            self.send_cancel(peer_id, file_id, true, &reason).await;
        }
    }

    pub(crate) async fn handle_file_request(&self, peer_id: &str, req: FileRequest) {
        let Some(peer) = self.registry.handle(peer_id).await else {
            return;
        };
        if self.transfers.read().await.get(&req.file_id).is_some() {
            warn!(file_id = %req.file_id, peer = %peer_id, "duplicate file request ignored");
            return;
        }
        if req.file_size > MAX_FILE_SIZE {
            warn!(file_id = %req.file_id, size = req.file_size, "offered file too large, rejecting");
            if let Err(e) = self
                .send_response(&peer.conn, peer_id, &req.file_id, false, "file too large")
                .await
            {
                debug!(file_id = %req.file_id, error = %e, "rejection not delivered");
            }
            return;
        }
        let status = FileTransferStatus::incoming(
            req.file_id.clone(),
            sanitize_file_name(&req.file_name),
            req.file_size,
            peer_id.to_string(),
            peer.name,
        );
        info!(file_id = %req.file_id, peer = %peer_id, name = %status.file_name, size = req.file_size, "file offered to us");
        self.transfers.write().await.insert(status.clone());
        self.events.emit(NodeEvent::FileRequested(status));
    }

    pub(crate) async fn handle_file_response(self: &Arc<Self>, peer_id: &str, resp: FileResponse) {
        let mut table = self.transfers.write().await;
        let Some(t) = table.get_mut(&resp.file_id) else {
            debug!(file_id = %resp.file_id, "response for unknown transfer");
            return;
        };
        if t.peer_id != peer_id || t.direction != Direction::Send || t.status != TransferStatus::Pending {
            warn!(file_id = %resp.file_id, peer = %peer_id, status = ?t.status, "unexpected file response");
            return;
        }
        if !resp.accepted {
            let removed = table.remove(&resp.file_id);
            drop(table);
            if let Some(mut t) = removed {
                t.cancel();
                info!(file_id = %resp.file_id, reason = %resp.message, "transfer rejected by peer");
                self.events.emit(NodeEvent::TransferUpdated(t));
            }
            return;
        }
        let completed = match t.start(Instant::now()) {
            Ok(c) => c,
            Err(e) => {
                warn!(file_id = %resp.file_id, error = %e, "cannot start transfer");
                return;
            }
        };
        let snapshot = t.clone();
        drop(table);
        self.events.emit(NodeEvent::TransferUpdated(snapshot));
        if completed {
            return;
        }
        let node = self.clone();
        let file_id = resp.file_id;
        tokio::spawn(supervised("file send", async move {
            node.stream_file(file_id).await
        }));
    }

    /// Sender side: read the file in fixed chunks, seal each with the peer's key, send in order.
    async fn stream_file(self: Arc<Self>, file_id: String) {
        let Some(t) = self.transfer(&file_id).await else {
            return;
        };
        let Some(peer) = self.registry.handle(&t.peer_id).await else {
            self.fail_transfer(&file_id, "peer disconnected".to_string()).await;
            return;
        };
        let Some(key) = peer.shared_key else {
            self.abort_transfer(&peer.id, &file_id, "no shared key".to_string()).await;
            return;
        };
        let mut file = match tokio::fs::File::open(&t.file_path).await {
            Ok(f) => f,
            Err(e) => {
                self.abort_transfer(&peer.id, &file_id, format!("open failed: {e}")).await;
                return;
            }
        };

        let ranges = split_into_chunks(t.file_size, DEFAULT_CHUNK_SIZE);
        let total = ranges.len() as u32;
        let mut buf = vec![0u8; DEFAULT_CHUNK_SIZE as usize];
        for range in ranges {
            let status = self.transfer(&file_id).await.map(|t| t.status);
            if status != Some(TransferStatus::Transferring) {
                info!(file_id = %file_id, ?status, "stopping send");
                return;
            }
            let data = &mut buf[..range.len() as usize];
            if let Err(e) = file.read_exact(data).await {
                self.abort_transfer(&peer.id, &file_id, format!("read failed: {e}")).await;
                return;
            }
            let msg = FileChunk::sealed(&file_id, range.seq, total, &key, data)
                .map_err(NodeError::from)
                .and_then(|chunk| {
                    Message::new(&self.id, &peer.id, Payload::FileChunk(chunk)).map_err(NodeError::from)
                });
            let msg = match msg {
                Ok(m) => m,
                Err(e) => {
                    self.abort_transfer(&peer.id, &file_id, format!("chunk not built: {e}")).await;
                    return;
                }
            };
            if let Err(e) = peer.conn.send(&msg).await {
                self.fail_transfer(&file_id, format!("send failed: {e}")).await;
                return;
            }
            let len = range.len();
            match self
                .update_transfer(&file_id, |t| t.record_progress(len, Instant::now()))
                .await
            {
                Some(Ok(true)) => info!(file_id = %file_id, chunks = total, "file sent"),
                Some(Ok(false)) => {}
                // cancelled between the status check and now
                Some(Err(e)) => debug!(file_id = %file_id, error = %e, "progress not recorded"),
                None => return,
            }
        }
    }

    /// Receiver side: decrypt with the sender's key (by the transfer's peer ID) and append.
    pub(crate) async fn handle_file_chunk(&self, peer_id: &str, chunk: FileChunk) {
        let Some(t) = self.transfer(&chunk.file_id).await else {
            debug!(file_id = %chunk.file_id, "chunk for unknown transfer");
            return;
        };
        if t.peer_id != peer_id || t.direction != Direction::Receive {
            warn!(file_id = %chunk.file_id, peer = %peer_id, "chunk from wrong peer");
            return;
        }
        if t.status != TransferStatus::Transferring {
            debug!(file_id = %chunk.file_id, status = ?t.status, "chunk for inactive transfer");
            return;
        }

        let key = self.registry.shared_key(&t.peer_id).await;
        if !chunk.encrypted {
            warn!(file_id = %chunk.file_id, peer = %peer_id, "plaintext chunk received");
        }
        let bytes = match chunk.open(key.as_ref()) {
            Ok(b) => b,
            Err(e) => {
                warn!(
                    file_id = %chunk.file_id,
                    peer = %peer_id,
                    chunk = chunk.chunk_num,
                    key_len = key.map(|k| k.len()).unwrap_or(0),
                    nonce_len = chunk.nonce.as_ref().map(Vec::len).unwrap_or(0),
                    ciphertext_len = chunk.ciphertext.as_ref().map(Vec::len).unwrap_or(0),
                    error = %e,
                    "chunk decryption failed"
                );
                let escalated = self
                    .update_transfer(&chunk.file_id, |t| t.record_decrypt_failure())
                    .await
                    .unwrap_or(false);
                if escalated {
                    self.send_cancel(peer_id, &chunk.file_id, true, "chunks failed to decrypt")
                        .await;
                }
                return;
            }
        };

        // chunks arrive in order on one link; a skipped one means the file is already wrong
        let expected = t.chunks + 1;
        if chunk.chunk_num != expected {
            self.abort_transfer(
                peer_id,
                &chunk.file_id,
                format!("chunk {} out of order, expected {expected}", chunk.chunk_num),
            )
            .await;
            return;
        }
        if t.progress + bytes.len() as u64 > t.file_size {
            self.abort_transfer(
                peer_id,
                &chunk.file_id,
                format!("chunk {} exceeds declared size", chunk.chunk_num),
            )
            .await;
            return;
        }
        if let Err(e) = append(&t.file_path, &bytes).await {
            self.abort_transfer(peer_id, &chunk.file_id, format!("write failed: {e}"))
                .await;
            return;
        }
        let len = bytes.len() as u64;
        match self
            .update_transfer(&chunk.file_id, |t| t.record_progress(len, Instant::now()))
            .await
        {
            Some(Ok(true)) => {
                info!(file_id = %chunk.file_id, path = %t.file_path.display(), "file received")
            }
            Some(Ok(false)) if chunk.chunk_num >= chunk.total_chunks => {
                let got = t.progress + len;
                self.abort_transfer(
                    peer_id,
                    &chunk.file_id,
                    format!("last chunk left file short: {got} of {} bytes", t.file_size),
                )
                .await;
            }
            Some(Ok(false)) | None => {}
            Some(Err(e)) => {
                self.abort_transfer(peer_id, &chunk.file_id, e.to_string()).await;
            }
        }
    }

    pub(crate) async fn handle_file_cancel(&self, peer_id: &str, cancel: FileCancel) {
        let owned = self
            .transfers
            .read()
            .await
            .get(&cancel.file_id)
            .map(|t| t.peer_id == peer_id)
            .unwrap_or(false);
        if !owned {
            debug!(file_id = %cancel.file_id, peer = %peer_id, "cancel for unknown transfer");
            return;
        }
        let changed = self
            .update_transfer(&cancel.file_id, |t| {
                if cancel.failed {
                    t.fail(format!("peer: {}", cancel.reason))
                } else {
                    t.cancel()
                }
            })
            .await
            .unwrap_or(false);
        if changed {
            info!(file_id = %cancel.file_id, failed = cancel.failed, reason = %cancel.reason, "transfer stopped by peer");
        }
    }

    /// Fail every unfinished transfer with a peer whose link just went away.
    pub(crate) async fn fail_peer_transfers(&self, peer_id: &str) {
        let ids: Vec<String> = self
            .transfers
            .read()
            .await
            .snapshot()
            .into_iter()
            .filter(|t| t.peer_id == peer_id && !t.status.is_terminal())
            .map(|t| t.file_id)
            .collect();
        for id in ids {
            self.fail_transfer(&id, "peer disconnected".to_string()).await;
        }
    }

    pub(crate) async fn rename_transfer_peer(&self, peer_id: &str, new_name: &str) {
        let mut table = self.transfers.write().await;
        let ids: Vec<String> = table
            .snapshot()
            .into_iter()
            .filter(|t| t.peer_id == peer_id)
            .map(|t| t.file_id)
            .collect();
        for id in ids {
            if let Some(t) = table.get_mut(&id) {
                t.peer_name = new_name.to_string();
            }
        }
    }

    /// Drop terminal transfers older than the retention window.
    pub(crate) async fn collect_transfers(&self) {
        let retention = chrono::Duration::from_std(self.config.timing.gc_retention)
            .unwrap_or_else(|_| chrono::Duration::minutes(10));
        let removed = self
            .transfers
            .write()
            .await
            .collect_expired(Utc::now(), retention);
        if !removed.is_empty() {
            debug!(count = removed.len(), "expired transfers removed");
        }
    }
}

async fn append(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut f = tokio::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .await?;
    f.write_all(bytes).await?;
    f.flush().await
}

/// Keep only the final path component of a remote-supplied name.
fn sanitize_file_name(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or("")
        .trim();
    if base.is_empty() || base == "." || base == ".." {
        "file".to_string()
    } else {
        base.to_string()
    }
}

/// `dir/name`, or `dir/stem (n).ext` for the first free `n`.
async fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
        return candidate;
    }
    let p = Path::new(name);
    let stem = p
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    let ext = p.extension().map(|e| e.to_string_lossy().into_owned());
    let mut n = 1u32;
    loop {
        let file = match &ext {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        let candidate = dir.join(file);
        if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            return candidate;
        }
        n += 1;
    }
}
