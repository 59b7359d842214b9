//! Stream transport
//!
//! Addressable, bidirectional, length-framed byte streams over TCP.
//!
//! # Features
//! - Listener with accept loop
//! - Outbound connects with name resolution
//! - 4-byte length-prefixed framing (16 MiB cap)
//! - Non-blocking writes through a per-connection queue
//! - Event delivery through the `ConnectionHandler` trait

pub mod codec;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod server;

use bytes::Bytes;

pub use codec::{FrameCodec, MAX_FRAME_SIZE};
pub use connection::{Connection, ConnectionId};
pub use endpoint::{resolve, Endpoint};
pub use error::NetError;
pub use server::Server;

/// Receiver of connection events.
///
/// Callbacks run on the task that observed the event: `on_connect` on the
/// accepting or connecting task, `on_read` and `on_disconnect` on the
/// connection's reader task. Frames of one connection are delivered in order;
/// there is no ordering across connections.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn on_connect(&self, conn: &Connection);

    fn on_disconnect(&self, conn: &Connection);

    fn on_read(&self, conn: &Connection, frame: Bytes);

    /// `conn` is `None` for listener and connect failures
    fn on_error(&self, conn: Option<&Connection>, error: &NetError);
}
