//! Low-level helpers shared by the transport and the peer protocol
//!
//! - `buffer`: byte-cursor packet codec (fixed-size fields, NUL-terminated
//!   strings, variable-length integers)

pub mod buffer;

pub use buffer::{CodecError, PacketReader, PacketWriter};
