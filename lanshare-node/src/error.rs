use std::path::PathBuf;

use lanshare_core::{CryptoError, FrameEncodeError, ProtocolError, TransferStatus};

/// Failures surfaced by the node's public operations.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("peer not found: {0}")]
    PeerNotFound(String),
    #[error("file too large: {size} bytes (limit {limit})")]
    FileTooLarge { size: u64, limit: u64 },
    #[error("not a regular file: {}", .0.display())]
    NotAFile(PathBuf),
    #[error("no shared key with {0} yet")]
    NoSharedKey(String),
    #[error("unknown transfer {0}")]
    UnknownTransfer(String),
    #[error("transfer {file_id} is {status:?}")]
    InvalidTransferState {
        file_id: String,
        status: TransferStatus,
    },
    #[error("node is not running")]
    NotRunning,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame: {0}")]
    Frame(#[from] FrameEncodeError),
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),
}

pub type Result<T> = std::result::Result<T, NodeError>;
