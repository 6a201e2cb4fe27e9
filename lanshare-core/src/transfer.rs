//! File-transfer state: per-file status, progress accounting and the table keyed by file ID.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Decryption failures tolerated per transfer; the next one fails it.
pub const MAX_DECRYPT_FAILURES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Transferring,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Send,
    Receive,
}

/// One transfer, as seen from this node.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTransferStatus {
    pub file_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub progress: u64,
    pub status: TransferStatus,
    pub direction: Direction,
    pub peer_name: String,
    /// Counterpart's node ID; the key for looking up its session key.
    #[serde(skip)]
    pub peer_id: String,
    /// Source file when sending, destination file when receiving.
    #[serde(skip)]
    pub file_path: PathBuf,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Bytes per second over the last sample.
    pub speed: f64,
    /// Seconds remaining; `None` while speed is unknown.
    pub eta: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Chunks sent or received so far.
    pub chunks: u32,
    #[serde(skip)]
    last_sample: Option<Instant>,
    #[serde(skip)]
    decrypt_failures: u32,
}

impl FileTransferStatus {
    fn new(
        file_id: String,
        file_name: String,
        file_size: u64,
        direction: Direction,
        peer_id: String,
        peer_name: String,
        file_path: PathBuf,
    ) -> Self {
        Self {
            file_id,
            file_name,
            file_size,
            progress: 0,
            status: TransferStatus::Pending,
            direction,
            peer_name,
            peer_id,
            file_path,
            start_time: Utc::now(),
            end_time: None,
            speed: 0.0,
            eta: None,
            error: None,
            chunks: 0,
            last_sample: None,
            decrypt_failures: 0,
        }
    }

    pub fn outgoing(
        file_id: String,
        file_name: String,
        file_size: u64,
        peer_id: String,
        peer_name: String,
        source: PathBuf,
    ) -> Self {
        Self::new(file_id, file_name, file_size, Direction::Send, peer_id, peer_name, source)
    }

    /// Receive side; the destination path is chosen on accept.
    pub fn incoming(
        file_id: String,
        file_name: String,
        file_size: u64,
        peer_id: String,
        peer_name: String,
    ) -> Self {
        Self::new(
            file_id,
            file_name,
            file_size,
            Direction::Receive,
            peer_id,
            peer_name,
            PathBuf::new(),
        )
    }

    /// `pending -> transferring`. A zero-byte transfer goes straight to `completed`;
    /// returns whether it did.
    pub fn start(&mut self, now: Instant) -> Result<bool, TransferError> {
        if self.status != TransferStatus::Pending {
            return Err(TransferError::InvalidState(self.status));
        }
        self.status = TransferStatus::Transferring;
        self.last_sample = Some(now);
        if self.file_size == 0 {
            self.finish(TransferStatus::Completed);
            return Ok(true);
        }
        Ok(false)
    }

    /// Account for one chunk of `bytes`. Returns `true` when the transfer just completed.
    /// A chunk that would exceed the declared size is an error and leaves progress unchanged.
    pub fn record_progress(&mut self, bytes: u64, now: Instant) -> Result<bool, TransferError> {
        if self.status != TransferStatus::Transferring {
            return Err(TransferError::InvalidState(self.status));
        }
        let progress = self
            .progress
            .checked_add(bytes)
            .filter(|p| *p <= self.file_size)
            .ok_or(TransferError::Overflow {
                size: self.file_size,
                progress: self.progress,
                bytes,
            })?;
        self.progress = progress;
        self.chunks += 1;

        let elapsed = self
            .last_sample
            .map(|t| now.saturating_duration_since(t).as_secs_f64())
            .unwrap_or(0.0);
        self.speed = if elapsed > 0.0 { bytes as f64 / elapsed } else { 0.0 };
        self.eta = if self.speed > 0.0 {
            Some(((self.file_size - self.progress) as f64 / self.speed).ceil() as u64)
        } else {
            None
        };
        self.last_sample = Some(now);

        if self.progress == self.file_size {
            self.finish(TransferStatus::Completed);
            return Ok(true);
        }
        Ok(false)
    }

    /// Mark failed unless already terminal. Returns whether the status changed.
    pub fn fail(&mut self, reason: impl Into<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.error = Some(reason.into());
        self.finish(TransferStatus::Failed);
        true
    }

    /// Mark cancelled unless already terminal. Returns whether the status changed.
    pub fn cancel(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.finish(TransferStatus::Cancelled);
        true
    }

    /// Count a chunk that could not be decrypted. Returns `true` once the limit is hit
    /// and the transfer has been failed.
    pub fn record_decrypt_failure(&mut self) -> bool {
        self.decrypt_failures += 1;
        if self.decrypt_failures >= MAX_DECRYPT_FAILURES {
            return self.fail(format!(
                "{} chunks failed to decrypt",
                self.decrypt_failures
            ));
        }
        false
    }

    pub fn decrypt_failures(&self) -> u32 {
        self.decrypt_failures
    }

    /// Terminal and ended at least `retention` before `now`.
    pub fn is_expired(&self, now: DateTime<Utc>, retention: chrono::Duration) -> bool {
        match self.end_time {
            Some(end) if self.status.is_terminal() => now - end >= retention,
            _ => false,
        }
    }

    fn finish(&mut self, status: TransferStatus) {
        self.status = status;
        self.end_time = Some(Utc::now());
        self.eta = if status == TransferStatus::Completed { Some(0) } else { None };
    }
}

/// All transfers known to this node, keyed by file ID.
#[derive(Debug, Default)]
pub struct TransferTable {
    entries: HashMap<String, FileTransferStatus>,
}

impl TransferTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, status: FileTransferStatus) {
        self.entries.insert(status.file_id.clone(), status);
    }

    pub fn get(&self, file_id: &str) -> Option<&FileTransferStatus> {
        self.entries.get(file_id)
    }

    pub fn get_mut(&mut self, file_id: &str) -> Option<&mut FileTransferStatus> {
        self.entries.get_mut(file_id)
    }

    pub fn remove(&mut self, file_id: &str) -> Option<FileTransferStatus> {
        self.entries.remove(file_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copies of every entry, oldest first.
    pub fn snapshot(&self) -> Vec<FileTransferStatus> {
        let mut out: Vec<_> = self.entries.values().cloned().collect();
        out.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        out
    }

    /// Remove expired terminal entries; returns their IDs.
    pub fn collect_expired(&mut self, now: DateTime<Utc>, retention: chrono::Duration) -> Vec<String> {
        let expired: Vec<String> = self
            .entries
            .values()
            .filter(|t| t.is_expired(now, retention))
            .map(|t| t.file_id.clone())
            .collect();
        for id in &expired {
            self.entries.remove(id);
        }
        expired
    }
}

/// Random 8-byte file ID, hex encoded.
pub fn generate_file_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("unknown transfer {0}")]
    Unknown(String),
    #[error("transfer is {0:?}")]
    InvalidState(TransferStatus),
    #[error("chunk of {bytes} bytes overflows size {size} at progress {progress}")]
    Overflow { size: u64, progress: u64, bytes: u64 },
}
