//! Overlay protocol engine
//!
//! `PeerNetwork` owns the transport server and the routing table, drives the
//! join/discovery state machine, and routes, floods and delivers packets.
//!
//! ```text
//! DISCONNECTED -> CONNECTING_TO_ENTRY_NODE -> SENDING_LOOKUPS -> LOOKUPS_SEND -> CONNECTED
//! ```
//!
//! Client-only nodes go from `CONNECTING_TO_ENTRY_NODE` straight to
//! `CONNECTED` once the entry node answers the handshake.

use crate::net::{self, Connection, ConnectionHandler, ConnectionId, NetError, Server};
use crate::peer::config::{ConfigError, EntryNode, NetworkConfig};
use crate::peer::id::PeerId;
use crate::peer::packet::{self, Announce, Opcode, Packet, PacketError, RouteHeader};
use crate::peer::routing_table::{LocalPeer, NextHop, Peer, PeerState, RoutingTable};
use crate::util::buffer::{PacketReader, PacketWriter};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Envelopes nested deeper than this are dropped. A lookup reply, the
/// deepest legitimate packet, carries two `ROUTE` headers.
const MAX_ENVELOPE_DEPTH: usize = 8;

/// Errors returned to the application
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("No known peer to route toward {0}")]
    NoRoute(PeerId),
    #[error("Network error: {0}")]
    Net(#[from] NetError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Join progress of the local node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    Disconnected,
    ConnectingToEntryNode,
    SendingLookups,
    LookupsSend,
    Connected,
}

impl State {
    pub fn name(&self) -> &'static str {
        match self {
            State::Disconnected => "DISCONNECTED",
            State::ConnectingToEntryNode => "CONNECTING_TO_ENTRY_NODE",
            State::SendingLookups => "SENDING_LOOKUPS",
            State::LookupsSend => "LOOKUPS_SEND",
            State::Connected => "CONNECTED",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Receiver of application payloads.
///
/// Called on the reader task of the connection the packet arrived on; keep
/// the work short or hand it off.
pub trait MessageHandler: Send + Sync + 'static {
    /// A `MESSAGE` addressed to this node, or flooded to it
    fn on_message(&self, source: PeerId, payload: Bytes);

    /// A `PONG` answering one of our pings
    fn on_pong(&self, _source: PeerId) {}
}

impl<F> MessageHandler for F
where
    F: Fn(PeerId, Bytes) + Send + Sync + 'static,
{
    fn on_message(&self, source: PeerId, payload: Bytes) {
        self(source, payload)
    }
}

/// Snapshot of one routing-table entry
#[derive(Debug, Clone, Serialize)]
pub struct PeerInfo {
    pub id: PeerId,
    pub address: String,
    pub port: u16,
    pub state: PeerState,
    pub outbound: bool,
    pub connected: bool,
}

impl From<&Peer> for PeerInfo {
    fn from(peer: &Peer) -> Self {
        Self {
            id: peer.id,
            address: peer.address.clone(),
            port: peer.port,
            state: peer.state,
            outbound: peer.conn.is_outbound(),
            connected: peer.conn.is_connected(),
        }
    }
}

/// Snapshot of the whole node
#[derive(Debug, Clone, Serialize)]
pub struct NetworkStatus {
    pub local: LocalPeer,
    pub state: State,
    pub listening: bool,
    pub peers: Vec<PeerInfo>,
    pub pending_lookups: usize,
    pub seen_broadcasts: usize,
}

/// Discovery bookkeeping for the current join
#[derive(Default)]
struct Session {
    client_only: bool,
    entry_node: Option<Connection>,
    was_entry_node_looked_up: bool,
    /// Lookup targets still waiting for a reply
    lookup_targets: HashSet<PeerId>,
    /// Sources that already answered a lookup
    lookup_reply_targets: HashSet<PeerId>,
}

enum Hop {
    Local,
    Forward(Connection),
    Unreachable,
}

struct NetworkCore {
    me: Weak<NetworkCore>,
    server: Server,
    /// Lock order: `table` before `connecting`; no other nesting
    table: Mutex<RoutingTable>,
    connecting: Mutex<HashSet<PeerId>>,
    session: Mutex<Session>,
    /// Grows for the lifetime of the network; nonces are never evicted
    seen_broadcasts: Mutex<HashSet<u64>>,
    lookup_task: Mutex<Option<JoinHandle<()>>>,
    handler: RwLock<Option<Arc<dyn MessageHandler>>>,
    config: RwLock<NetworkConfig>,
    state: watch::Sender<State>,
}

/// A node of the overlay
pub struct PeerNetwork {
    core: Arc<NetworkCore>,
}

impl Default for PeerNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerNetwork {
    /// Network with default config and a random id
    pub fn new() -> Self {
        Self::with_config(NetworkConfig::default())
    }

    pub fn with_config(config: NetworkConfig) -> Self {
        let local = LocalPeer {
            id: config
                .local_id
                .filter(|id| !id.is_zero())
                .unwrap_or_else(PeerId::random),
            address: config.local_address.clone(),
            port: config.local_port,
        };
        let table = RoutingTable::with_bucket_size_bits(local, config.bucket_size_bits);
        let (state, _) = watch::channel(State::Disconnected);

        let core = Arc::new_cyclic(|me: &Weak<NetworkCore>| {
            let handler: Weak<dyn ConnectionHandler> = me.clone();
            NetworkCore {
                me: me.clone(),
                server: Server::new(handler),
                table: Mutex::new(table),
                connecting: Mutex::new(HashSet::new()),
                session: Mutex::new(Session::default()),
                seen_broadcasts: Mutex::new(HashSet::new()),
                lookup_task: Mutex::new(None),
                handler: RwLock::new(None),
                config: RwLock::new(config),
                state,
            }
        });

        Self { core }
    }

    /// Set the announced address and first listen port. A missing or zero
    /// id is replaced by a random one.
    pub fn set_local_peer(&self, address: &str, port: u16, max_port_offset: u16, id: Option<PeerId>) {
        let id = id.filter(|id| !id.is_zero()).unwrap_or_else(PeerId::random);
        {
            let mut table = self.core.table.lock();
            let local = table.local_mut();
            local.id = id;
            local.address = address.to_string();
            local.port = port;
        }

        let mut config = self.core.config.write();
        config.local_address = address.to_string();
        config.local_port = port;
        config.max_port_offset = max_port_offset;
        config.local_id = Some(id);
    }

    pub fn add_entry_node(&self, address: &str, port: u16) {
        self.core.config.write().entry_nodes.push(EntryNode {
            address: address.to_string(),
            port,
        });
    }

    /// Apply a bootstrap config file. A `local` line replaces the local
    /// peer; `entry` lines are appended.
    pub fn load_config_file(&self, path: impl AsRef<Path>) -> Result<(), NetworkError> {
        let mut config = self.core.config.read().clone();
        let before = (
            config.local_address.clone(),
            config.local_port,
            config.max_port_offset,
            config.local_id,
        );
        config.apply_file(path)?;
        let after = (
            config.local_address.clone(),
            config.local_port,
            config.max_port_offset,
            config.local_id,
        );

        let entry_nodes = config.entry_nodes.clone();
        if before != after {
            self.set_local_peer(
                &config.local_address,
                config.local_port,
                config.max_port_offset,
                config.local_id,
            );
        }
        self.core.config.write().entry_nodes = entry_nodes;
        Ok(())
    }

    /// Install the receiver of application payloads
    pub fn set_message_handler(&self, handler: impl MessageHandler) {
        *self.core.handler.write() = Some(Arc::new(handler));
    }

    /// Join the overlay: listen (unless `client_only`), then try the entry
    /// nodes in order until one accepts. Returns the state reached when the
    /// bootstrap attempt ends; the join itself completes in the background
    /// (see `wait_for_state`).
    pub async fn connect(&self, client_only: bool) -> State {
        self.core.connect(client_only).await
    }

    /// Open a direct connection to a node outside of discovery
    pub async fn connect_to(&self, address: &str, port: u16) -> Result<(), NetworkError> {
        let prefer_ipv4 = self.core.config.read().prefer_ipv4;
        self.core.server.connect(address, port, prefer_ipv4).await?;
        Ok(())
    }

    /// Close the listener and every connection. No handler callback fires
    /// after this returns.
    pub async fn disconnect(&self) {
        self.core.disconnect().await
    }

    /// Whether some peer has a live connection and a completed handshake
    pub fn is_connected(&self) -> bool {
        self.core
            .table
            .lock()
            .iter()
            .any(|peer| peer.conn.is_connected() && peer.is_handshaken())
    }

    pub fn local_id(&self) -> PeerId {
        self.core.local_id()
    }

    pub fn local_peer(&self) -> LocalPeer {
        self.core.local()
    }

    pub fn state(&self) -> State {
        self.core.state()
    }

    /// Wait until the node reaches `state`; false on timeout
    pub async fn wait_for_state(&self, state: State, timeout: Duration) -> bool {
        let mut rx = self.core.state.subscribe();
        let reached = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|current| *current == state)).await,
            Ok(Ok(_))
        );
        reached
    }

    /// Id of a uniformly chosen handshaken neighbor
    pub fn random_neighbor(&self) -> Option<PeerId> {
        let ids: Vec<PeerId> = self
            .core
            .table
            .lock()
            .iter()
            .filter(|peer| peer.is_handshaken())
            .map(|peer| peer.id)
            .collect();
        ids.choose(&mut rand::thread_rng()).copied()
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.core.table.lock().iter().map(PeerInfo::from).collect()
    }

    pub fn status(&self) -> NetworkStatus {
        let (local, peers) = {
            let table = self.core.table.lock();
            (
                table.local().clone(),
                table.iter().map(PeerInfo::from).collect(),
            )
        };
        let pending_lookups = self.core.session.lock().lookup_targets.len();
        let seen_broadcasts = self.core.seen_broadcasts.lock().len();

        NetworkStatus {
            local,
            state: self.state(),
            listening: self.core.server.is_running(),
            peers,
            pending_lookups,
            seen_broadcasts,
        }
    }

    /// Route `payload` toward `id`. With `exact`, the packet is dropped
    /// unless a node with exactly that id is reached; otherwise it is
    /// delivered to the closest node found.
    pub fn send(&self, id: PeerId, payload: &[u8], exact: bool) -> Result<(), NetworkError> {
        let local_id = self.local_id();
        if id == local_id {
            self.core.deliver(local_id, Bytes::copy_from_slice(payload));
            return Ok(());
        }

        self.core.send_routed(id, exact, |writer| {
            packet::write_opcode(writer, Opcode::Message);
            writer.write_bytes(payload);
        })
    }

    /// Ask `id` for a pong
    pub fn ping(&self, id: PeerId) -> Result<(), NetworkError> {
        self.core.send_routed(id, true, |writer| {
            packet::write_opcode(writer, Opcode::Ping);
        })
    }

    /// Flood `payload` to every node. Returns the number of neighbors the
    /// flood was handed to.
    pub fn broadcast(&self, payload: &[u8]) -> usize {
        self.core.flood(|writer| {
            packet::write_opcode(writer, Opcode::Message);
            writer.write_bytes(payload);
        })
    }

    /// Flood a ping; every node answers with a routed pong
    pub fn broadcast_ping(&self) -> usize {
        self.core.flood(|writer| {
            packet::write_opcode(writer, Opcode::Ping);
        })
    }
}

impl Drop for PeerNetwork {
    fn drop(&mut self) {
        if let Some(task) = self.core.lookup_task.lock().take() {
            task.abort();
        }
        self.core.server.shutdown_now();
    }
}

impl NetworkCore {
    fn state(&self) -> State {
        *self.state.borrow()
    }

    fn set_state(&self, state: State) {
        if self.state.send_replace(state) != state {
            log::debug!("state: {}", state);
        }
    }

    fn local(&self) -> LocalPeer {
        self.table.lock().local().clone()
    }

    fn local_id(&self) -> PeerId {
        self.table.lock().local().id
    }

    fn write(&self, conn: &Connection, packet: Bytes) {
        if let Err(e) = conn.write(packet) {
            log::debug!("write to {} failed: {}", conn, e);
        }
    }

    async fn connect(&self, client_only: bool) -> State {
        let (max_port_offset, entry_nodes, prefer_ipv4) = {
            let config = self.config.read();
            (
                config.max_port_offset,
                config.entry_nodes.clone(),
                config.prefer_ipv4,
            )
        };
        log::info!("local id: {}", self.local_id().short());

        {
            let mut session = self.session.lock();
            session.client_only = client_only;
            session.entry_node = None;
            session.was_entry_node_looked_up = false;
            session.lookup_targets.clear();
        }
        self.connecting.lock().clear();
        self.set_state(State::Disconnected);
        self.server.reset();

        if !client_only {
            let mut port = self.local().port;
            for _ in 0..=max_port_offset {
                self.table.lock().local_mut().port = port;
                match self.server.listen(port, prefer_ipv4, false, true) {
                    Ok(bound) => {
                        self.table.lock().local_mut().port = bound;
                        log::info!("listening on port {}", bound);
                        break;
                    }
                    Err(e) => {
                        log::debug!("listen on port {} failed: {}", port, e);
                        port = port.wrapping_add(1);
                    }
                }
            }
            self.server.run();
        }

        self.set_state(State::ConnectingToEntryNode);
        let local = self.local();
        let local_ip = net::resolve(&local.address, local.port, prefer_ipv4)
            .await
            .ok()
            .map(|addr| addr.ip());

        for node in &entry_nodes {
            if node.address == local.address && node.port == local.port {
                continue;
            }
            let addr = match net::resolve(&node.address, node.port, prefer_ipv4).await {
                Ok(addr) => addr,
                Err(e) => {
                    log::debug!("skipping entry node {} {}: {}", node.address, node.port, e);
                    continue;
                }
            };
            if addr.port() == local.port && Some(addr.ip()) == local_ip {
                continue;
            }

            if self.state() != State::ConnectingToEntryNode {
                break;
            }
            log::debug!("try connecting to {} {}", node.address, node.port);
            if self.connect_to_peer(&addr.ip().to_string(), addr.port()).await {
                break;
            }
            if self.state() != State::ConnectingToEntryNode {
                break;
            }
        }

        self.state()
    }

    async fn connect_to_peer(&self, address: &str, port: u16) -> bool {
        let prefer_ipv4 = self.config.read().prefer_ipv4;
        match self.server.connect(address, port, prefer_ipv4).await {
            Ok(_) => true,
            Err(e) => {
                log::debug!("connect to {} {} failed: {}", address, port, e);
                false
            }
        }
    }

    async fn disconnect(&self) {
        let task = self.lookup_task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }

        self.server.close().await;
        self.connecting.lock().clear();
        self.set_state(State::Disconnected);
    }

    fn disconnect_from_peer(&self, conn: &Connection) {
        let mut writer = PacketWriter::new();
        packet::write_opcode(&mut writer, Opcode::Disconnect);
        self.write(conn, writer.freeze());
        conn.disconnect();
    }

    fn entry_node_id(&self) -> Option<PeerId> {
        let entry = self.session.lock().entry_node.clone()?;
        self.table.lock().get_by_conn(entry.id()).map(|peer| peer.id)
    }

    fn is_entry_node(&self, conn: &Connection) -> bool {
        self.session.lock().entry_node.as_ref() == Some(conn)
    }

    /// Run discovery on its own task, replacing any run still in flight
    fn perform_lookups(&self) {
        let Some(core) = self.me.upgrade() else {
            return;
        };
        let mut task = self.lookup_task.lock();
        if let Some(previous) = task.take() {
            previous.abort();
        }
        *task = Some(tokio::spawn(core.run_lookups()));
    }

    async fn run_lookups(self: Arc<Self>) {
        let (count, delay) = {
            let config = self.config.read();
            (config.lookup_count, config.lookup_delay)
        };
        if count == 0 {
            self.set_state(State::Connected);
            return;
        }

        let local_id = self.local_id();
        for index in 0..count {
            tokio::time::sleep(delay).await;

            let target = self.table.lock().lookup_target(index);
            let entry = self.session.lock().entry_node.clone();
            let Some(entry) = entry else {
                continue;
            };
            let relay = self.entry_node_id().unwrap_or_default();

            let mut writer = PacketWriter::new();
            packet::write_route(&mut writer, local_id, target, false);
            packet::write_lookup(&mut writer, local_id, relay, target);

            self.session.lock().lookup_targets.insert(target);
            if index == count - 1 {
                self.set_state(State::LookupsSend);
            }
            self.write(&entry, writer.freeze());
        }
    }

    /// Unwrap envelopes one level at a time, then handle the innermost packet
    fn process_packet(
        &self,
        conn: &Connection,
        reader: &mut PacketReader,
        mut routing_source: PeerId,
        mut direct: bool,
    ) {
        for depth in 0..=MAX_ENVELOPE_DEPTH {
            let start = reader.position();
            let packet = match Packet::decode(reader) {
                Ok(packet) => packet,
                Err(PacketError::UnknownOpcode(opcode)) => {
                    log::debug!("unknown opcode {} from {}", opcode, conn);
                    return;
                }
                Err(e) => {
                    log::debug!("dropping packet from {}: {}", conn, e);
                    return;
                }
            };
            log::trace!("packet: {} (depth {})", packet.opcode().name(), depth);

            let inner_source = match packet {
                Packet::Route(header) => self.handle_route(conn, reader, start, header),
                Packet::Broadcast { source, nonce } => {
                    self.handle_broadcast(conn, reader, start, source, nonce)
                }
                packet => {
                    self.handle_packet(conn, reader, packet, routing_source, direct);
                    return;
                }
            };

            match inner_source {
                Some(source) => {
                    routing_source = source;
                    direct = false;
                }
                None => return,
            }
        }

        log::debug!(
            "dropping packet from {}: more than {} nested envelopes",
            conn,
            MAX_ENVELOPE_DEPTH
        );
    }

    fn handle_packet(
        &self,
        conn: &Connection,
        reader: &mut PacketReader,
        packet: Packet,
        routing_source: PeerId,
        direct: bool,
    ) {
        match packet {
            Packet::Ping => self.handle_ping(conn, routing_source),
            Packet::Pong => self.handle_pong(routing_source),
            Packet::Handshake(announce) if direct => self.handle_handshake(conn, announce),
            Packet::HandshakeReply(announce) if direct => {
                self.handle_handshake_reply(conn, announce)
            }
            Packet::Handshake(_) | Packet::HandshakeReply(_) => {
                log::debug!("ignoring routed handshake from {}", conn);
            }
            Packet::Lookup {
                source,
                relay,
                target,
            } => self.handle_lookup(conn, source, relay, target),
            Packet::LookupReply {
                source,
                target,
                port,
                address,
            } => self.handle_lookup_reply(source, target, port, address),
            Packet::Message => self.deliver(routing_source, reader.rest()),
            Packet::Route(_) | Packet::Broadcast { .. } => {
                log::debug!("unexpected envelope from {}", conn);
            }
            Packet::Disconnect => {
                if direct {
                    conn.disconnect();
                }
            }
            Packet::None => log::debug!("unknown opcode {} from {}", Opcode::None as u8, conn),
        }
    }

    fn handle_ping(&self, conn: &Connection, routing_source: PeerId) {
        let mut writer = PacketWriter::new();
        packet::write_route(&mut writer, self.local_id(), routing_source, true);
        packet::write_opcode(&mut writer, Opcode::Pong);
        self.write(conn, writer.freeze());
    }

    fn handle_pong(&self, source: PeerId) {
        log::debug!("ping: {}", source.short());
        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            handler.on_pong(source);
        }
    }

    /// Record the announced identity on the peer bound to `conn`
    fn finalize_handshake(&self, conn: &Connection, announce: &Announce) -> bool {
        let mut table = self.table.lock();
        let Some(peer) = table.get_by_conn_mut(conn.id()) else {
            return false;
        };
        peer.id = announce.id;
        peer.port = announce.port;
        peer.address = announce.address.clone();
        peer.state = PeerState::Connected;
        true
    }

    fn handle_handshake(&self, conn: &Connection, announce: Announce) {
        if !self.finalize_handshake(conn, &announce) {
            return;
        }
        log::debug!(
            "handshake {} {} {}",
            announce.id.short(),
            announce.port,
            announce.address
        );

        let mut writer = PacketWriter::new();
        packet::write_handshake_reply(&mut writer, &announce_of(&self.local()));
        self.write(conn, writer.freeze());

        if self.state() == State::ConnectingToEntryNode && self.is_entry_node(conn) {
            self.set_state(State::Connected);
        }
    }

    fn handle_handshake_reply(&self, conn: &Connection, announce: Announce) {
        if !self.finalize_handshake(conn, &announce) {
            return;
        }
        log::debug!(
            "handshake reply {} {} {}",
            announce.id.short(),
            announce.port,
            announce.address
        );

        if self.state() == State::ConnectingToEntryNode && self.is_entry_node(conn) {
            let client_only = self.session.lock().client_only;
            if client_only {
                self.set_state(State::Connected);
            } else {
                self.set_state(State::SendingLookups);
                self.perform_lookups();
            }
        }
    }

    fn handle_lookup(&self, conn: &Connection, source: PeerId, relay: PeerId, target: PeerId) {
        log::trace!(
            "lookup {} {} {}",
            source.short(),
            relay.short(),
            target.short()
        );

        let local = self.local();
        let mut writer = PacketWriter::new();
        if relay != local.id {
            packet::write_route(&mut writer, local.id, relay, true);
        }
        packet::write_route(&mut writer, local.id, source, true);
        packet::write_lookup_reply(&mut writer, local.id, target, local.port, &local.address);
        self.write(conn, writer.freeze());
    }

    fn handle_lookup_reply(&self, source: PeerId, target: PeerId, port: u16, address: String) {
        log::trace!(
            "lookup reply {} {} {} {}",
            source.short(),
            target.short(),
            port,
            address
        );

        let entry_id = self.entry_node_id();
        let first_reply = {
            let mut session = self.session.lock();
            if entry_id == Some(source) {
                session.was_entry_node_looked_up = true;
            }
            session.lookup_reply_targets.insert(source)
        };
        if first_reply && source != self.local_id() {
            self.connect_discovered(source, address, port);
        }

        let finished = {
            let mut session = self.session.lock();
            session.lookup_targets.remove(&target);
            if session.entry_node.is_some()
                && session.lookup_targets.is_empty()
                && self.state() == State::LookupsSend
            {
                if session.was_entry_node_looked_up {
                    Some(None)
                } else {
                    Some(session.entry_node.take())
                }
            } else {
                None
            }
        };

        if let Some(entry) = finished {
            if let Some(entry) = entry {
                log::debug!("entry node {} no longer needed", entry.endpoint());
                self.disconnect_from_peer(&entry);
            }
            self.set_state(State::Connected);
        }
    }

    /// Connect to a peer named by a lookup reply, unless it is known or a
    /// connect to it is already in flight
    fn connect_discovered(&self, id: PeerId, address: String, port: u16) {
        {
            let table = self.table.lock();
            if table.has(&id) || !self.connecting.lock().insert(id) {
                return;
            }
        }
        let Some(core) = self.me.upgrade() else {
            return;
        };

        self.server.spawn(async move {
            core.connect_to_peer(&address, port).await;
            core.connecting.lock().remove(&id);
        });
    }

    fn handle_route(
        &self,
        conn: &Connection,
        reader: &mut PacketReader,
        start: usize,
        header: RouteHeader,
    ) -> Option<PeerId> {
        log::trace!(
            "route {} {} {}",
            header.source.short(),
            header.target.short(),
            header.exact
        );

        let (local_id, hop) = {
            let table = self.table.lock();
            let sender = table.get_by_conn(conn.id()).map(|peer| peer.id);
            let hop = match table.get_next(&header.target, sender.as_ref(), true) {
                Some(NextHop::Local) => Hop::Local,
                Some(NextHop::Peer(peer)) => Hop::Forward(peer.conn.clone()),
                None => Hop::Unreachable,
            };
            (table.local().id, hop)
        };

        match hop {
            Hop::Local if !header.exact || header.target == local_id => Some(header.source),
            Hop::Forward(next) => {
                self.write(&next, reader.slice_from(start));
                None
            }
            Hop::Local | Hop::Unreachable => {
                log::debug!("packet dropped: no route to {}", header.target.short());
                None
            }
        }
    }

    fn handle_broadcast(
        &self,
        conn: &Connection,
        reader: &mut PacketReader,
        start: usize,
        source: PeerId,
        nonce: u64,
    ) -> Option<PeerId> {
        if !self.seen_broadcasts.lock().insert(nonce) {
            log::trace!("broadcast {} already seen", nonce);
            return None;
        }
        if source == self.local_id() {
            return None;
        }

        let envelope = reader.slice_from(start);
        self.send_to_all_peers(&envelope, Some(conn.id()), false);
        Some(source)
    }

    fn deliver(&self, source: PeerId, payload: Bytes) {
        let handler = self.handler.read().clone();
        match handler {
            Some(handler) => handler.on_message(source, payload),
            None => log::debug!("no message handler, dropping message from {}", source.short()),
        }
    }

    fn send_routed(
        &self,
        target: PeerId,
        exact: bool,
        body: impl FnOnce(&mut PacketWriter),
    ) -> Result<(), NetworkError> {
        let (local_id, next) = {
            let table = self.table.lock();
            let next = match table.get_next(&target, None, false) {
                Some(NextHop::Peer(peer)) => Some(peer.conn.clone()),
                _ => None,
            };
            (table.local().id, next)
        };
        let next = next.ok_or(NetworkError::NoRoute(target))?;

        let mut writer = PacketWriter::new();
        packet::write_route(&mut writer, local_id, target, exact);
        body(&mut writer);
        next.write(writer.freeze())?;
        Ok(())
    }

    fn flood(&self, body: impl FnOnce(&mut PacketWriter)) -> usize {
        let nonce: u64 = rand::random();
        self.seen_broadcasts.lock().insert(nonce);

        let mut writer = PacketWriter::new();
        packet::write_broadcast(&mut writer, self.local_id(), nonce);
        body(&mut writer);
        self.send_to_all_peers(&writer.freeze(), None, true)
    }

    /// Write `packet` to every peer but `except`. Floods we start only go
    /// to peers that finished the handshake.
    fn send_to_all_peers(
        &self,
        packet: &Bytes,
        except: Option<ConnectionId>,
        handshaken_only: bool,
    ) -> usize {
        let targets: Vec<Connection> = self
            .table
            .lock()
            .iter()
            .filter(|peer| Some(peer.conn.id()) != except)
            .filter(|peer| !handshaken_only || peer.is_handshaken())
            .map(|peer| peer.conn.clone())
            .collect();

        for conn in &targets {
            self.write(conn, packet.clone());
        }
        targets.len()
    }

    /// Send a lookup toward the region a lost peer occupied
    fn refill_region(&self, lost: &PeerId) {
        let (local_id, target, next) = {
            let table = self.table.lock();
            let target = table.lookup_target(table.lookup_index(lost));
            let next = match table.get_next(&target, Some(lost), false) {
                Some(NextHop::Peer(peer)) => Some(peer.conn.clone()),
                _ => None,
            };
            (table.local().id, target, next)
        };
        let Some(next) = next else {
            return;
        };

        let mut writer = PacketWriter::new();
        packet::write_route(&mut writer, local_id, target, false);
        packet::write_lookup(&mut writer, local_id, local_id, target);

        self.session.lock().lookup_targets.insert(target);
        log::debug!("refilling region of {} via {}", lost.short(), target.short());
        self.write(&next, writer.freeze());
    }
}

impl ConnectionHandler for NetworkCore {
    fn on_connect(&self, conn: &Connection) {
        log::info!(
            "connection {} outbound={}",
            conn.endpoint(),
            conn.is_outbound()
        );
        self.table.lock().add(Peer::from_connection(conn.clone()));

        if conn.is_outbound() {
            let mut writer = PacketWriter::new();
            packet::write_handshake(&mut writer, &announce_of(&self.local()));
            self.write(conn, writer.freeze());
        }

        if self.state() == State::ConnectingToEntryNode {
            self.session.lock().entry_node = Some(conn.clone());
        }
    }

    fn on_disconnect(&self, conn: &Connection) {
        log::info!("disconnect {}", conn.endpoint());
        let removed = self.table.lock().remove(conn.id());
        let Some(peer) = removed else {
            return;
        };

        if !peer.id.is_zero() && self.server.is_running() {
            self.refill_region(&peer.id);
        }
    }

    fn on_read(&self, conn: &Connection, frame: Bytes) {
        let sender = self.table.lock().get_by_conn(conn.id()).map(|peer| peer.id);
        let Some(sender) = sender else {
            return;
        };
        let mut reader = PacketReader::new(frame);
        self.process_packet(conn, &mut reader, sender, true);
    }

    fn on_error(&self, conn: Option<&Connection>, error: &NetError) {
        match conn {
            Some(conn) => log::debug!("{}: {}", conn, error),
            None => log::debug!("{}", error),
        }
    }
}

fn announce_of(local: &LocalPeer) -> Announce {
    Announce {
        id: local.id,
        port: local.port,
        address: local.address.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn network(id: u128) -> PeerNetwork {
        PeerNetwork::with_config(NetworkConfig {
            local_id: Some(PeerId::from_u128(id)),
            local_address: "127.0.0.1".to_string(),
            local_port: 0,
            prefer_ipv4: true,
            ..Default::default()
        })
    }

    /// Add a handshaken peer behind a socketless connection
    fn attach(net: &PeerNetwork, id: u128) -> (Connection, mpsc::UnboundedReceiver<Bytes>) {
        let (conn, rx) = Connection::detached("127.0.0.1", 7000, false);
        let mut peer = Peer::from_connection(conn.clone());
        peer.id = PeerId::from_u128(id);
        peer.state = PeerState::Connected;
        net.core.table.lock().add(peer);
        (conn, rx)
    }

    fn record(net: &PeerNetwork) -> mpsc::UnboundedReceiver<(PeerId, Bytes)> {
        let (tx, rx) = mpsc::unbounded_channel();
        net.set_message_handler(move |source: PeerId, payload: Bytes| {
            let _ = tx.send((source, payload));
        });
        rx
    }

    fn decode(frame: Bytes) -> Vec<Packet> {
        let mut reader = PacketReader::new(frame);
        let mut packets = Vec::new();
        while reader.has_data_left() {
            let packet = Packet::decode(&mut reader).unwrap();
            let done = matches!(packet, Packet::Message);
            packets.push(packet);
            if done {
                break;
            }
        }
        packets
    }

    fn message(source: u128, target: u128, exact: bool, payload: &[u8]) -> Bytes {
        let mut writer = PacketWriter::new();
        packet::write_route(
            &mut writer,
            PeerId::from_u128(source),
            PeerId::from_u128(target),
            exact,
        );
        packet::write_opcode(&mut writer, Opcode::Message);
        writer.write_bytes(payload);
        writer.freeze()
    }

    #[test]
    fn test_broadcast_is_delivered_and_relayed_once() {
        let net = network(1);
        let mut messages = record(&net);
        let (from, mut from_rx) = attach(&net, 2);
        let (_other, mut other_rx) = attach(&net, 3);

        let mut writer = PacketWriter::new();
        packet::write_broadcast(&mut writer, PeerId::from_u128(9), 77);
        packet::write_opcode(&mut writer, Opcode::Message);
        writer.write_bytes(b"hi");
        let frame = writer.freeze();

        net.core.on_read(&from, frame.clone());
        net.core.on_read(&from, frame.clone());

        assert_eq!(
            messages.try_recv().unwrap(),
            (PeerId::from_u128(9), Bytes::from_static(b"hi"))
        );
        assert!(messages.try_recv().is_err());

        assert_eq!(other_rx.try_recv().unwrap(), frame);
        assert!(other_rx.try_recv().is_err());
        assert!(from_rx.try_recv().is_err());
    }

    #[test]
    fn test_own_broadcast_echo_is_ignored() {
        let net = network(1);
        let mut messages = record(&net);
        let (from, _from_rx) = attach(&net, 2);
        let (_other, mut other_rx) = attach(&net, 3);

        let mut writer = PacketWriter::new();
        packet::write_broadcast(&mut writer, PeerId::from_u128(1), 5);
        packet::write_opcode(&mut writer, Opcode::Message);
        net.core.on_read(&from, writer.freeze());

        assert!(messages.try_recv().is_err());
        assert!(other_rx.try_recv().is_err());
    }

    #[test]
    fn test_local_broadcast_reaches_every_neighbor() {
        let net = network(1);
        let (_a, mut a_rx) = attach(&net, 2);
        let (_b, mut b_rx) = attach(&net, 3);

        assert_eq!(net.broadcast(b"all"), 2);
        let frame = a_rx.try_recv().unwrap();
        assert_eq!(b_rx.try_recv().unwrap(), frame);

        let packets = decode(frame);
        assert!(matches!(
            packets[0],
            Packet::Broadcast { source, .. } if source == PeerId::from_u128(1)
        ));
        assert_eq!(packets[1], Packet::Message);
        assert_eq!(net.status().seen_broadcasts, 1);
    }

    #[test]
    fn test_route_delivers_locally_when_closest() {
        let net = network(0b0001);
        let mut messages = record(&net);
        let (from, _rx) = attach(&net, 0b1000);

        // Not exact: the closest node takes it
        net.core.on_read(&from, message(0b1000, 0b0000, false, b"near"));
        assert_eq!(
            messages.try_recv().unwrap(),
            (PeerId::from_u128(0b1000), Bytes::from_static(b"near"))
        );

        // Exact and addressed here
        net.core.on_read(&from, message(0b1000, 0b0001, true, b"mine"));
        assert_eq!(messages.try_recv().unwrap().1, Bytes::from_static(b"mine"));
    }

    #[test]
    fn test_exact_route_to_unknown_id_is_dropped() {
        let net = network(0b0001);
        let mut messages = record(&net);
        let (from, mut from_rx) = attach(&net, 0b1000);

        net.core.on_read(&from, message(0b1000, 0b0000, true, b"lost"));
        assert!(messages.try_recv().is_err());
        assert!(from_rx.try_recv().is_err());
    }

    #[test]
    fn test_route_forwards_unchanged_to_closer_peer() {
        let net = network(0b1000);
        let mut messages = record(&net);
        let (from, mut from_rx) = attach(&net, 0b0001);
        let (_next, mut next_rx) = attach(&net, 0b0110);

        let frame = message(0b0001, 0b0111, true, b"via");
        net.core.on_read(&from, frame.clone());

        assert_eq!(next_rx.try_recv().unwrap(), frame);
        assert!(from_rx.try_recv().is_err());
        assert!(messages.try_recv().is_err());
    }

    #[test]
    fn test_route_never_returns_to_sender() {
        let net = network(0b1000);
        let (from, mut from_rx) = attach(&net, 0b0111);

        // The sender is the exact target, but it is excluded as next hop
        net.core.on_read(&from, message(0b0111, 0b0111, true, b"x"));
        assert!(from_rx.try_recv().is_err());
    }

    #[test]
    fn test_inbound_handshake_is_answered() {
        let net = network(1);
        let (conn, mut rx) = Connection::detached("10.0.0.5", 40000, false);
        net.core.on_connect(&conn);
        assert!(rx.try_recv().is_err());
        assert_eq!(net.peers()[0].state, PeerState::PreHandshake);

        let announce = Announce {
            id: PeerId::from_u128(5),
            port: 7777,
            address: "10.0.0.5".to_string(),
        };
        let mut writer = PacketWriter::new();
        packet::write_handshake(&mut writer, &announce);
        net.core.on_read(&conn, writer.freeze());

        let peers = net.peers();
        let peer = &peers[0];
        assert_eq!(peer.id, PeerId::from_u128(5));
        assert_eq!(peer.port, 7777);
        assert_eq!(peer.state, PeerState::Connected);
        assert!(net.is_connected());

        match &decode(rx.try_recv().unwrap())[0] {
            Packet::HandshakeReply(reply) => {
                assert_eq!(reply.id, PeerId::from_u128(1));
                assert_eq!(reply.address, "127.0.0.1");
            }
            other => panic!("unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_outbound_connection_sends_handshake() {
        let net = network(1);
        let (conn, mut rx) = Connection::detached("10.0.0.5", 6000, true);
        net.core.on_connect(&conn);

        assert!(matches!(
            &decode(rx.try_recv().unwrap())[0],
            Packet::Handshake(announce) if announce.id == PeerId::from_u128(1)
        ));
    }

    #[test]
    fn test_routed_handshake_is_ignored() {
        let net = network(1);
        let (from, _rx) = attach(&net, 2);

        let mut writer = PacketWriter::new();
        packet::write_route(&mut writer, PeerId::from_u128(2), PeerId::from_u128(1), true);
        packet::write_handshake(
            &mut writer,
            &Announce {
                id: PeerId::from_u128(99),
                port: 1,
                address: "evil".to_string(),
            },
        );
        net.core.on_read(&from, writer.freeze());

        assert_eq!(net.peers()[0].id, PeerId::from_u128(2));
    }

    #[test]
    fn test_lookup_reply_is_routed_through_relay() {
        let net = network(1);
        let (from, mut rx) = attach(&net, 6);

        let mut writer = PacketWriter::new();
        packet::write_lookup(
            &mut writer,
            PeerId::from_u128(5),
            PeerId::from_u128(6),
            PeerId::from_u128(7),
        );
        net.core.on_read(&from, writer.freeze());

        let mut reader = PacketReader::new(rx.try_recv().unwrap());
        let local = PeerId::from_u128(1);
        assert_eq!(
            Packet::decode(&mut reader).unwrap(),
            Packet::Route(RouteHeader {
                source: local,
                target: PeerId::from_u128(6),
                exact: true
            })
        );
        assert_eq!(
            Packet::decode(&mut reader).unwrap(),
            Packet::Route(RouteHeader {
                source: local,
                target: PeerId::from_u128(5),
                exact: true
            })
        );
        assert_eq!(
            Packet::decode(&mut reader).unwrap(),
            Packet::LookupReply {
                source: local,
                target: PeerId::from_u128(7),
                port: 0,
                address: "127.0.0.1".to_string()
            }
        );
    }

    #[test]
    fn test_ping_is_answered_with_routed_pong() {
        let net = network(1);
        let (from, mut rx) = attach(&net, 5);

        let mut writer = PacketWriter::new();
        packet::write_route(&mut writer, PeerId::from_u128(5), PeerId::from_u128(1), true);
        packet::write_opcode(&mut writer, Opcode::Ping);
        net.core.on_read(&from, writer.freeze());

        let packets = decode(rx.try_recv().unwrap());
        assert_eq!(
            packets,
            vec![
                Packet::Route(RouteHeader {
                    source: PeerId::from_u128(1),
                    target: PeerId::from_u128(5),
                    exact: true
                }),
                Packet::Pong
            ]
        );
    }

    #[test]
    fn test_pong_reaches_handler() {
        struct Pongs(mpsc::UnboundedSender<PeerId>);
        impl MessageHandler for Pongs {
            fn on_message(&self, _source: PeerId, _payload: Bytes) {}
            fn on_pong(&self, source: PeerId) {
                let _ = self.0.send(source);
            }
        }

        let net = network(1);
        let (tx, mut pongs) = mpsc::unbounded_channel();
        net.set_message_handler(Pongs(tx));
        let (from, _rx) = attach(&net, 5);

        let mut writer = PacketWriter::new();
        packet::write_route(&mut writer, PeerId::from_u128(5), PeerId::from_u128(1), true);
        packet::write_opcode(&mut writer, Opcode::Pong);
        net.core.on_read(&from, writer.freeze());

        assert_eq!(pongs.try_recv().unwrap(), PeerId::from_u128(5));
    }

    #[test]
    fn test_unknown_opcode_and_garbage_are_ignored() {
        let net = network(1);
        let mut messages = record(&net);
        let (from, mut rx) = attach(&net, 2);

        net.core.on_read(&from, Bytes::from_static(&[42, 1, 2, 3]));
        net.core.on_read(&from, Bytes::from_static(&[0]));
        net.core.on_read(&from, Bytes::from_static(&[7, 1]));
        net.core.on_read(&from, Bytes::new());

        assert!(messages.try_recv().is_err());
        assert!(rx.try_recv().is_err());
        assert!(from.is_connected());
    }

    #[test]
    fn test_direct_disconnect_closes_connection() {
        let net = network(1);
        let (from, _rx) = attach(&net, 2);
        net.core.on_read(&from, Bytes::from_static(&[Opcode::Disconnect as u8]));
        assert!(!from.is_connected());
    }

    #[test]
    fn test_send_uses_closest_peer() {
        let net = network(0b1000);
        let (_far, mut far_rx) = attach(&net, 0b0001);
        let (_near, mut near_rx) = attach(&net, 0b0110);

        net.send(PeerId::from_u128(0b0111), b"payload", true).unwrap();
        assert!(far_rx.try_recv().is_err());
        assert_eq!(
            decode(near_rx.try_recv().unwrap()),
            vec![
                Packet::Route(RouteHeader {
                    source: PeerId::from_u128(0b1000),
                    target: PeerId::from_u128(0b0111),
                    exact: true
                }),
                Packet::Message
            ]
        );
    }

    #[test]
    fn test_send_without_peers_has_no_route() {
        let net = network(1);
        assert!(matches!(
            net.send(PeerId::from_u128(2), b"x", true),
            Err(NetworkError::NoRoute(_))
        ));
    }

    #[test]
    fn test_send_to_self_is_delivered_locally() {
        let net = network(1);
        let mut messages = record(&net);
        net.send(PeerId::from_u128(1), b"loop", true).unwrap();
        assert_eq!(
            messages.try_recv().unwrap(),
            (PeerId::from_u128(1), Bytes::from_static(b"loop"))
        );
    }

    #[tokio::test]
    async fn test_disconnect_refills_vacated_region() {
        let net = network(0x8000);
        net.core.server.listen(0, true, false, false).unwrap();
        net.core.server.run();

        let lost_id = PeerId::from_u128(0x8000 ^ (1 << 100));
        let (lost, _lost_rx) = attach(&net, lost_id.as_u128());
        let (_other, mut other_rx) = attach(&net, 0x8001);

        net.core.on_disconnect(&lost);

        let expected = {
            let table = net.core.table.lock();
            table.lookup_target(table.lookup_index(&lost_id))
        };
        let local = PeerId::from_u128(0x8000);
        assert_eq!(
            decode(other_rx.try_recv().unwrap()),
            vec![
                Packet::Route(RouteHeader {
                    source: local,
                    target: expected,
                    exact: false
                }),
                Packet::Lookup {
                    source: local,
                    relay: local,
                    target: expected
                }
            ]
        );
        assert!(other_rx.try_recv().is_err());
        assert_eq!(net.peers().len(), 1);
        assert_eq!(net.status().pending_lookups, 1);

        net.disconnect().await;
    }

    #[test]
    fn test_no_refill_without_listener() {
        let net = network(1);
        let (lost, _lost_rx) = attach(&net, 2);
        let (_other, mut other_rx) = attach(&net, 3);

        net.core.on_disconnect(&lost);
        assert!(other_rx.try_recv().is_err());
        assert_eq!(net.peers().len(), 1);
    }

    fn lookup_reply(source: u128, target: PeerId) -> Bytes {
        let mut writer = PacketWriter::new();
        packet::write_lookup_reply(&mut writer, PeerId::from_u128(source), target, 6000, "127.0.0.1");
        writer.freeze()
    }

    #[tokio::test]
    async fn test_last_lookup_reply_releases_entry_node() {
        let net = network(1);
        let (entry, mut entry_rx) = attach(&net, 2);
        let (_known, _known_rx) = attach(&net, 3);
        let target = PeerId::from_u128(0xabc);
        {
            let mut session = net.core.session.lock();
            session.entry_node = Some(entry.clone());
            session.lookup_targets.insert(target);
        }
        net.core.set_state(State::LookupsSend);

        net.core.on_read(&entry, lookup_reply(3, target));

        assert_eq!(net.state(), State::Connected);
        assert_eq!(
            decode(entry_rx.try_recv().unwrap()),
            vec![Packet::Disconnect]
        );
        assert!(!entry.is_connected());
    }

    #[tokio::test]
    async fn test_join_lookups_are_relayed_by_entry_node() {
        let net = network(1);
        let (entry, mut entry_rx) = attach(&net, 2);
        net.core.session.lock().entry_node = Some(entry.clone());
        {
            let mut config = net.core.config.write();
            config.lookup_count = 2;
            config.lookup_delay = Duration::from_millis(1);
        }

        Arc::clone(&net.core).run_lookups().await;

        for _ in 0..2 {
            let packets = decode(entry_rx.try_recv().unwrap());
            assert!(matches!(
                packets[1],
                Packet::Lookup { source, relay, .. }
                    if source == PeerId::from_u128(1) && relay == PeerId::from_u128(2)
            ));
        }
        assert!(entry_rx.try_recv().is_err());
        assert_eq!(net.state(), State::LookupsSend);
    }

    #[tokio::test]
    async fn test_entry_node_kept_when_it_answered_a_lookup() {
        let net = network(1);
        let (entry, mut entry_rx) = attach(&net, 2);
        let first = PeerId::from_u128(0xabc);
        let second = PeerId::from_u128(0xdef);
        {
            let mut session = net.core.session.lock();
            session.entry_node = Some(entry.clone());
            session.lookup_targets.insert(first);
            session.lookup_targets.insert(second);
        }
        net.core.set_state(State::LookupsSend);

        net.core.on_read(&entry, lookup_reply(2, first));
        assert_eq!(net.state(), State::LookupsSend);

        net.core.on_read(&entry, lookup_reply(2, second));
        assert_eq!(net.state(), State::Connected);
        assert!(entry_rx.try_recv().is_err());
        assert!(entry.is_connected());
    }

    #[test]
    fn test_random_neighbor() {
        let net = network(1);
        assert!(net.random_neighbor().is_none());
        attach(&net, 2);
        assert_eq!(net.random_neighbor(), Some(PeerId::from_u128(2)));
    }

    #[test]
    fn test_status_serializes() {
        let net = network(1);
        attach(&net, 2);
        let json = serde_json::to_value(net.status()).unwrap();
        assert_eq!(json["state"], "DISCONNECTED");
        assert_eq!(json["peers"][0]["state"], "CONNECTED");
        assert_eq!(json["local"]["id"], PeerId::from_u128(1).to_hex());
    }

    #[test]
    fn test_set_local_peer_generates_id() {
        let net = network(1);
        net.set_local_peer("10.1.1.1", 7100, 3, None);
        let local = net.local_peer();
        assert_ne!(local.id, PeerId::from_u128(1));
        assert!(!local.id.is_zero());
        assert_eq!(local.port, 7100);
        assert_eq!(net.core.config.read().max_port_offset, 3);
    }

    fn nested_routes(depth: usize, source: u128, target: u128, payload: &[u8]) -> Bytes {
        let mut writer = PacketWriter::new();
        for _ in 0..depth {
            packet::write_route(
                &mut writer,
                PeerId::from_u128(source),
                PeerId::from_u128(target),
                true,
            );
        }
        packet::write_opcode(&mut writer, Opcode::Message);
        writer.write_bytes(payload);
        writer.freeze()
    }

    #[test]
    fn test_nested_routes_are_unwrapped() {
        let net = network(1);
        let mut messages = record(&net);
        let (from, _rx) = attach(&net, 2);

        net.core.on_read(&from, nested_routes(3, 2, 1, b"inner"));
        assert_eq!(
            messages.try_recv().unwrap(),
            (PeerId::from_u128(2), Bytes::from_static(b"inner"))
        );
    }

    #[test]
    fn test_deeply_nested_routes_are_dropped() {
        let net = network(1);
        let mut messages = record(&net);
        let (from, mut from_rx) = attach(&net, 2);

        net.core.on_read(&from, nested_routes(100_000, 2, 1, b"deep"));
        net.core
            .on_read(&from, nested_routes(MAX_ENVELOPE_DEPTH + 1, 2, 1, b"deep"));
        assert!(messages.try_recv().is_err());
        assert!(from_rx.try_recv().is_err());

        // The connection keeps working afterwards
        net.core.on_read(&from, nested_routes(MAX_ENVELOPE_DEPTH, 2, 1, b"ok"));
        assert_eq!(messages.try_recv().unwrap().1, Bytes::from_static(b"ok"));
    }

    #[test]
    fn test_local_broadcast_skips_peers_before_handshake() {
        let net = network(1);
        let (_ready, mut ready_rx) = attach(&net, 2);
        let (pending, mut pending_rx) = Connection::detached("127.0.0.1", 7001, false);
        net.core.table.lock().add(Peer::from_connection(pending));

        assert_eq!(net.broadcast(b"all"), 1);
        assert!(ready_rx.try_recv().is_ok());
        assert!(pending_rx.try_recv().is_err());

        net.broadcast_ping();
        assert!(ready_rx.try_recv().is_ok());
        assert!(pending_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_discovered_peer_not_dialed_after_disconnect() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let port = listener.local_addr().unwrap().port();

        let net = network(1);
        net.disconnect().await;
        net.core
            .connect_discovered(PeerId::from_u128(5), "127.0.0.1".to_string(), port);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            listener.accept().unwrap_err().kind(),
            std::io::ErrorKind::WouldBlock
        );
        assert!(net.peers().is_empty());
    }
}
