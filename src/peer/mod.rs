//! Peer overlay protocol
//!
//! Node identities, the XOR routing table, the wire packets and the
//! `PeerNetwork` state machine that ties them to the transport.

pub mod config;
pub mod id;
pub mod network;
pub mod packet;
pub mod routing_table;

pub use config::{ConfigError, EntryNode, NetworkConfig};
pub use id::PeerId;
pub use network::{MessageHandler, NetworkError, NetworkStatus, PeerInfo, PeerNetwork, State};
pub use packet::{Opcode, Packet, PacketError};
pub use routing_table::{LocalPeer, NextHop, Peer, PeerState, RoutingTable};
