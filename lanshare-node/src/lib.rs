//! LanShare node: discovery, encrypted peer links, chat dispatch and file transfer on a LAN.

pub mod config;
pub mod connection;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod files;
pub mod net;
pub mod node;
pub mod registry;
pub mod store;

#[cfg(test)]
mod test_support;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use config::NodeConfig;
pub use error::NodeError;
pub use events::{ChatMessage, NodeEvent, UpdateSource};
pub use node::Node;
pub use registry::PeerSnapshot;
pub use store::{BlockList, HistoryStore, MemoryBlockList, MemoryHistory};
