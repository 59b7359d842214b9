//! XOR-distance routing table
//!
//! Holds the local peer and every remote peer with a live connection.
//! Answers "closest known peer to X" and maps small integer indices to
//! structured lookup targets (and back).
//!
//! Lookup targets are laid out in shells: shell `b` contains the ids whose
//! XOR offset from the local id has its highest bit at position `b`, and each
//! shell is split into `2^bucket_size_bits` sub-slots. Index 0 is the last
//! sub-slot of the outermost shell; higher indices walk inwards, so callers
//! iterating `0..n` query the far regions of the id space first and the
//! nearby ones last.

use crate::net::{Connection, ConnectionId};
use crate::peer::id::PeerId;
use serde::Serialize;

/// Default number of sub-slot bits per shell
pub const DEFAULT_BUCKET_SIZE_BITS: u32 = 1;

/// Handshake progress of a remote peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeerState {
    Disconnected,
    PreHandshake,
    Connected,
}

/// A known remote node
#[derive(Debug, Clone)]
pub struct Peer {
    /// Zero until the handshake completes
    pub id: PeerId,
    pub address: String,
    pub port: u16,
    pub conn: Connection,
    pub state: PeerState,
}

impl Peer {
    /// A peer for a freshly opened connection, before the handshake
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            id: PeerId::ZERO,
            address: conn.endpoint().address.clone(),
            port: conn.endpoint().port,
            conn,
            state: PeerState::PreHandshake,
        }
    }

    pub fn is_handshaken(&self) -> bool {
        self.state == PeerState::Connected
    }
}

/// This process, as announced to other peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalPeer {
    pub id: PeerId,
    pub address: String,
    pub port: u16,
}

/// Result of a next-hop query
#[derive(Debug, Clone, Copy)]
pub enum NextHop<'a> {
    /// Deliver here
    Local,
    /// Forward to this peer
    Peer(&'a Peer),
}

#[derive(Debug)]
pub struct RoutingTable {
    local: LocalPeer,
    peers: Vec<Peer>,
    bucket_size_bits: u32,
}

impl RoutingTable {
    pub fn new(local: LocalPeer) -> Self {
        Self::with_bucket_size_bits(local, DEFAULT_BUCKET_SIZE_BITS)
    }

    /// `bucket_size_bits` is clamped so a shell never spans the whole id
    pub fn with_bucket_size_bits(local: LocalPeer, bucket_size_bits: u32) -> Self {
        Self {
            local,
            peers: Vec::new(),
            bucket_size_bits: bucket_size_bits.min(PeerId::BITS - 2),
        }
    }

    pub fn local(&self) -> &LocalPeer {
        &self.local
    }

    pub fn local_mut(&mut self) -> &mut LocalPeer {
        &mut self.local
    }

    pub fn bucket_size_bits(&self) -> u32 {
        self.bucket_size_bits
    }

    /// Greedy next hop toward `target`.
    ///
    /// Picks the handshaken peer (other than `except`) closest to `target`;
    /// equidistant candidates resolve to the lowest id. With
    /// `include_local_peer` the local peer wins when it is strictly closer
    /// than every candidate, when there is no candidate, and always when
    /// `target` is the local id.
    pub fn get_next(
        &self,
        target: &PeerId,
        except: Option<&PeerId>,
        include_local_peer: bool,
    ) -> Option<NextHop<'_>> {
        let best = self
            .peers
            .iter()
            .filter(|peer| peer.is_handshaken())
            .filter(|peer| Some(&peer.id) != except)
            .min_by_key(|peer| (peer.id.distance(target), peer.id));

        if include_local_peer {
            let local_distance = self.local.id.distance(target);
            let local_wins = match best {
                None => true,
                Some(peer) => local_distance == 0 || local_distance < peer.id.distance(target),
            };
            if local_wins {
                return Some(NextHop::Local);
            }
        }

        best.map(NextHop::Peer)
    }

    pub fn add(&mut self, peer: Peer) {
        self.peers.push(peer);
    }

    /// Remove every peer with `id`, returning how many were removed
    pub fn remove_by_id(&mut self, id: &PeerId) -> usize {
        let before = self.peers.len();
        self.peers.retain(|peer| &peer.id != id);
        before - self.peers.len()
    }

    /// Remove the peer bound to `conn`
    pub fn remove(&mut self, conn: ConnectionId) -> Option<Peer> {
        let index = self.peers.iter().position(|peer| peer.conn.id() == conn)?;
        Some(self.peers.remove(index))
    }

    pub fn get(&self, id: &PeerId) -> Option<&Peer> {
        self.peers.iter().find(|peer| &peer.id == id)
    }

    pub fn get_by_conn(&self, conn: ConnectionId) -> Option<&Peer> {
        self.peers.iter().find(|peer| peer.conn.id() == conn)
    }

    pub fn get_by_conn_mut(&mut self, conn: ConnectionId) -> Option<&mut Peer> {
        self.peers.iter_mut().find(|peer| peer.conn.id() == conn)
    }

    pub fn has(&self, id: &PeerId) -> bool {
        self.peers.iter().any(|peer| &peer.id == id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter()
    }

    /// Whether some known peer sits in the region of lookup index `index`
    pub fn has_lookup_index(&self, index: usize) -> bool {
        self.peers
            .iter()
            .filter(|peer| peer.is_handshaken())
            .any(|peer| self.lookup_index(&peer.id) == index)
    }

    /// Number of distinct lookup indices
    pub fn lookup_index_count(&self) -> usize {
        PeerId::BITS as usize * self.bucket_size()
    }

    /// Number of leading indices for which `lookup_index(lookup_target(i)) == i`.
    /// The innermost shells are narrower than a full bucket and collapse.
    pub fn invertible_lookup_indices(&self) -> usize {
        (PeerId::BITS - self.bucket_size_bits) as usize * self.bucket_size()
    }

    /// Lookup target for `index`. Indices wrap modulo `lookup_index_count`.
    pub fn lookup_target(&self, index: usize) -> PeerId {
        let bucket_size = self.bucket_size();
        let total = self.lookup_index_count();
        let slot = total - (index % total) - 1;

        let shell = (slot / bucket_size) as u32;
        let sub_slot = slot % bucket_size;
        let base = (bucket_size + sub_slot) as u128;

        let offset = if shell < self.bucket_size_bits {
            base >> (self.bucket_size_bits - shell)
        } else {
            base << (shell - self.bucket_size_bits)
        };

        self.local.id ^ PeerId::from_u128(offset)
    }

    /// Lookup index whose target falls in the same region as `id`
    pub fn lookup_index(&self, id: &PeerId) -> usize {
        let bucket_size = self.bucket_size();
        let mut offset = self.local.id.distance(id);

        let mut shell = 0usize;
        while (offset >> 1) >= bucket_size as u128 {
            offset >>= 1;
            shell += 1;
        }
        let sub_slot = (offset % bucket_size as u128) as usize;
        shell += self.bucket_size_bits as usize;

        let slot = shell * bucket_size + sub_slot;
        self.lookup_index_count() - slot - 1
    }

    fn bucket_size(&self) -> usize {
        1usize << self.bucket_size_bits
    }
}
