//! Overlay wire packets
//!
//! Every packet starts with a one-byte opcode followed by its fields.
//! `ROUTE` and `BROADCAST` are envelopes: their header is followed by a
//! complete inner packet. `MESSAGE` is followed by the application payload.
//!
//! ```text
//! HANDSHAKE        id:16 port:2 address:str
//! HANDSHAKE_REPLY  id:16 port:2 address:str
//! LOOKUP           source:16 relay:16 target:16
//! LOOKUP_REPLY     source:16 target:16 port:2 address:str
//! ROUTE            source:16 target:16 exact:1  <inner packet>
//! MESSAGE          <payload>
//! BROADCAST        source:16 nonce:8            <inner packet>
//! PING / PONG / DISCONNECT
//! ```

use crate::peer::id::PeerId;
use crate::util::buffer::{CodecError, PacketReader, PacketWriter};
use thiserror::Error;

/// Packet decoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Unknown opcode {0}")]
    UnknownOpcode(u8),
    #[error("Malformed packet: {0}")]
    Codec(#[from] CodecError),
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    None = 0,
    Ping = 1,
    Pong = 2,
    Handshake = 3,
    HandshakeReply = 4,
    Lookup = 5,
    LookupReply = 6,
    Route = 7,
    Message = 8,
    Broadcast = 9,
    Disconnect = 10,
}

impl Opcode {
    pub fn name(&self) -> &'static str {
        match self {
            Opcode::None => "NONE",
            Opcode::Ping => "PING",
            Opcode::Pong => "PONG",
            Opcode::Handshake => "HANDSHAKE",
            Opcode::HandshakeReply => "HANDSHAKE_REPLY",
            Opcode::Lookup => "LOOKUP",
            Opcode::LookupReply => "LOOKUP_REPLY",
            Opcode::Route => "ROUTE",
            Opcode::Message => "MESSAGE",
            Opcode::Broadcast => "BROADCAST",
            Opcode::Disconnect => "DISCONNECT",
        }
    }
}

impl TryFrom<u8> for Opcode {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Opcode::None,
            1 => Opcode::Ping,
            2 => Opcode::Pong,
            3 => Opcode::Handshake,
            4 => Opcode::HandshakeReply,
            5 => Opcode::Lookup,
            6 => Opcode::LookupReply,
            7 => Opcode::Route,
            8 => Opcode::Message,
            9 => Opcode::Broadcast,
            10 => Opcode::Disconnect,
            other => return Err(PacketError::UnknownOpcode(other)),
        })
    }
}

/// Identity a node announces during the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announce {
    pub id: PeerId,
    pub port: u16,
    pub address: String,
}

/// Header of a `ROUTE` envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteHeader {
    pub source: PeerId,
    pub target: PeerId,
    /// Drop instead of delivering when the closest node is not `target`
    pub exact: bool,
}

/// A decoded packet head. For `Route`, `Broadcast` and `Message` the reader
/// is left positioned at the inner packet or payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    None,
    Ping,
    Pong,
    Handshake(Announce),
    HandshakeReply(Announce),
    Lookup {
        source: PeerId,
        relay: PeerId,
        target: PeerId,
    },
    LookupReply {
        source: PeerId,
        target: PeerId,
        port: u16,
        address: String,
    },
    Route(RouteHeader),
    Message,
    Broadcast {
        source: PeerId,
        nonce: u64,
    },
    Disconnect,
}

impl Packet {
    pub fn decode(reader: &mut PacketReader) -> Result<Self, PacketError> {
        let opcode = Opcode::try_from(reader.read_u8()?)?;

        Ok(match opcode {
            Opcode::None => Packet::None,
            Opcode::Ping => Packet::Ping,
            Opcode::Pong => Packet::Pong,
            Opcode::Handshake => Packet::Handshake(read_announce(reader)?),
            Opcode::HandshakeReply => Packet::HandshakeReply(read_announce(reader)?),
            Opcode::Lookup => Packet::Lookup {
                source: read_id(reader)?,
                relay: read_id(reader)?,
                target: read_id(reader)?,
            },
            Opcode::LookupReply => Packet::LookupReply {
                source: read_id(reader)?,
                target: read_id(reader)?,
                port: reader.read_u16()?,
                address: reader.read_str()?,
            },
            Opcode::Route => Packet::Route(RouteHeader {
                source: read_id(reader)?,
                target: read_id(reader)?,
                exact: reader.read_u8()? != 0,
            }),
            Opcode::Message => Packet::Message,
            Opcode::Broadcast => Packet::Broadcast {
                source: read_id(reader)?,
                nonce: reader.read_u64()?,
            },
            Opcode::Disconnect => Packet::Disconnect,
        })
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Packet::None => Opcode::None,
            Packet::Ping => Opcode::Ping,
            Packet::Pong => Opcode::Pong,
            Packet::Handshake(_) => Opcode::Handshake,
            Packet::HandshakeReply(_) => Opcode::HandshakeReply,
            Packet::Lookup { .. } => Opcode::Lookup,
            Packet::LookupReply { .. } => Opcode::LookupReply,
            Packet::Route(_) => Opcode::Route,
            Packet::Message => Opcode::Message,
            Packet::Broadcast { .. } => Opcode::Broadcast,
            Packet::Disconnect => Opcode::Disconnect,
        }
    }
}

pub fn read_id(reader: &mut PacketReader) -> Result<PeerId, CodecError> {
    reader.read_u128().map(PeerId::from_u128)
}

pub fn write_id(writer: &mut PacketWriter, id: PeerId) {
    writer.write_u128(id.as_u128());
}

fn read_announce(reader: &mut PacketReader) -> Result<Announce, CodecError> {
    Ok(Announce {
        id: read_id(reader)?,
        port: reader.read_u16()?,
        address: reader.read_str()?,
    })
}

pub fn write_opcode(writer: &mut PacketWriter, opcode: Opcode) {
    writer.write_u8(opcode as u8);
}

pub fn write_handshake(writer: &mut PacketWriter, announce: &Announce) {
    write_opcode(writer, Opcode::Handshake);
    write_announce(writer, announce);
}

pub fn write_handshake_reply(writer: &mut PacketWriter, announce: &Announce) {
    write_opcode(writer, Opcode::HandshakeReply);
    write_announce(writer, announce);
}

fn write_announce(writer: &mut PacketWriter, announce: &Announce) {
    write_id(writer, announce.id);
    writer.write_u16(announce.port);
    writer.write_str(&announce.address);
}

pub fn write_lookup(writer: &mut PacketWriter, source: PeerId, relay: PeerId, target: PeerId) {
    write_opcode(writer, Opcode::Lookup);
    write_id(writer, source);
    write_id(writer, relay);
    write_id(writer, target);
}

pub fn write_lookup_reply(
    writer: &mut PacketWriter,
    source: PeerId,
    target: PeerId,
    port: u16,
    address: &str,
) {
    write_opcode(writer, Opcode::LookupReply);
    write_id(writer, source);
    write_id(writer, target);
    writer.write_u16(port);
    writer.write_str(address);
}

pub fn write_route(writer: &mut PacketWriter, source: PeerId, target: PeerId, exact: bool) {
    write_opcode(writer, Opcode::Route);
    write_id(writer, source);
    write_id(writer, target);
    writer.write_u8(u8::from(exact));
}

pub fn write_broadcast(writer: &mut PacketWriter, source: PeerId, nonce: u64) {
    write_opcode(writer, Opcode::Broadcast);
    write_id(writer, source);
    writer.write_u64(nonce);
}
