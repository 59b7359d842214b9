//! A single framed stream connection
//!
//! A `Connection` is a cheap cloneable handle. Writes are queued on an
//! unbounded channel drained by a dedicated writer task, so callers never
//! block; a reader task delivers every received frame to the
//! `ConnectionHandler` in arrival order.

use crate::net::codec::FrameCodec;
use crate::net::endpoint::Endpoint;
use crate::net::error::NetError;
use crate::net::ConnectionHandler;
use bytes::Bytes;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct ConnectionInner {
    id: ConnectionId,
    endpoint: Endpoint,
    outbound: bool,
    tx: mpsc::UnboundedSender<Bytes>,
    connected: AtomicBool,
    shutdown: CancellationToken,
}

/// Handle to a live (or recently closed) connection
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub(crate) fn new(
        endpoint: Endpoint,
        outbound: bool,
        tx: mpsc::UnboundedSender<Bytes>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                id: ConnectionId::next(),
                endpoint,
                outbound,
                tx,
                connected: AtomicBool::new(true),
                shutdown,
            }),
        }
    }

    /// A connection with no socket behind it; written frames land in the
    /// returned receiver.
    #[cfg(test)]
    pub(crate) fn detached(
        address: &str,
        port: u16,
        outbound: bool,
    ) -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Self::new(
            Endpoint::new(address, port),
            outbound,
            tx,
            CancellationToken::new(),
        );
        (conn, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    /// Whether this side opened the connection
    pub fn is_outbound(&self) -> bool {
        self.inner.outbound
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Queue a frame for sending
    pub fn write(&self, frame: Bytes) -> Result<(), NetError> {
        if !self.is_connected() {
            return Err(NetError::Disconnected);
        }
        self.inner
            .tx
            .send(frame)
            .map_err(|_| NetError::Disconnected)
    }

    /// Close the connection. Frames queued before the call are still flushed.
    pub fn disconnect(&self) {
        self.inner.connected.store(false, Ordering::Release);
        self.inner.shutdown.cancel();
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Connection {}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("endpoint", &self.inner.endpoint)
            .field("outbound", &self.inner.outbound)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.inner.endpoint, self.inner.id)
    }
}

pub(crate) type FrameReader = FramedRead<OwnedReadHalf, FrameCodec>;
pub(crate) type FrameWriter = FramedWrite<OwnedWriteHalf, FrameCodec>;

/// Split a stream into framed halves
pub(crate) fn framed(stream: TcpStream) -> (FrameReader, FrameWriter) {
    let (read_half, write_half) = stream.into_split();
    (
        FramedRead::new(read_half, FrameCodec),
        FramedWrite::new(write_half, FrameCodec),
    )
}

/// Deliver frames to the handler until the stream ends or the connection is
/// closed, then report the disconnect exactly once.
pub(crate) async fn read_loop(
    conn: Connection,
    mut reader: FrameReader,
    handler: Weak<dyn ConnectionHandler>,
) {
    let shutdown = conn.shutdown_token();

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = reader.next() => next,
        };

        let Some(handler) = handler.upgrade() else {
            break;
        };

        match next {
            Some(Ok(frame)) => handler.on_read(&conn, frame.freeze()),
            Some(Err(e)) => {
                handler.on_error(Some(&conn), &e);
                break;
            }
            None => break,
        }
    }

    conn.disconnect();
    if let Some(handler) = handler.upgrade() {
        handler.on_disconnect(&conn);
    }
}

/// Drain the write queue into the socket. On shutdown, frames already queued
/// are flushed before the write half is closed.
pub(crate) async fn write_loop(
    conn: Connection,
    mut writer: FrameWriter,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
) {
    let shutdown = conn.shutdown_token();

    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = writer.send(frame).await {
                        log::debug!("Write to {} failed: {}", conn, e);
                        conn.disconnect();
                        break;
                    }
                }
                None => break,
            },
            _ = shutdown.cancelled() => {
                while let Ok(frame) = rx.try_recv() {
                    if writer.send(frame).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }

    let _ = writer.close().await;
}
