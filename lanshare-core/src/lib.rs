//! LanShare protocol core.
//! No I/O: crypto, wire types, framing and transfer bookkeeping used by the node.

pub mod chunk;
pub mod identity;
pub mod protocol;
pub mod transfer;
pub mod version;
pub mod wire;

pub use identity::{CryptoError, Keypair, PublicKey, SessionKey};
pub use protocol::{
    DiscoveryKind, DiscoveryMessage, FileCancel, FileChunk, FileRequest, FileResponse,
    HandshakeInfo, Message, MessageKind, Payload, ProtocolError, BROADCAST_RECIPIENT,
};
pub use transfer::{Direction, FileTransferStatus, TransferError, TransferStatus, TransferTable};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
