//! XOR-metric peer-to-peer overlay
//!
//! Nodes with random 128-bit ids join through entry nodes, discover each
//! other with structured lookups, and exchange messages by greedy multi-hop
//! routing or by deduplicated flooding.
//!
//! # Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use xor_overlay::{NetworkConfig, PeerId, PeerNetwork, State};
//! use std::time::Duration;
//!
//! # async fn run() {
//! let mut config = NetworkConfig::default();
//! config.local_port = 6001;
//! let network = PeerNetwork::with_config(config);
//! network.add_entry_node("localhost", 6000);
//! network.set_message_handler(|source: PeerId, payload: Bytes| {
//!     println!("{}: {} bytes", source.short(), payload.len());
//! });
//!
//! network.connect(false).await;
//! if network.wait_for_state(State::Connected, Duration::from_secs(5)).await {
//!     network.broadcast(b"hello");
//! }
//! network.disconnect().await;
//! # }
//! ```

pub mod net;
pub mod peer;
pub mod util;

// Re-export commonly used types
pub use net::{Connection, ConnectionHandler, NetError, Server};
pub use peer::{
    ConfigError, MessageHandler, NetworkConfig, NetworkError, NetworkStatus, PeerId, PeerInfo,
    PeerNetwork, RoutingTable, State,
};
pub use util::{PacketReader, PacketWriter};
