//! TCP server and connection registry
//!
//! Binds the listening socket, runs the accept loop, opens outbound
//! connections and owns the reader/writer tasks of every connection so that
//! `close` can join all of them.

use crate::net::connection::{self, Connection, ConnectionId};
use crate::net::endpoint;
use crate::net::error::NetError;
use crate::net::ConnectionHandler;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Weak};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Backlog passed to `listen(2)`
const LISTEN_BACKLOG: u32 = 1024;

struct ServerInner {
    handler: Weak<dyn ConnectionHandler>,
    listener: Mutex<Option<TcpListener>>,
    connections: Mutex<HashMap<ConnectionId, Connection>>,
    shutdown: Mutex<CancellationToken>,
    tasks: TaskTracker,
    running: AtomicBool,
    local_port: AtomicU16,
}

/// Listening socket plus every connection it accepted or opened
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Create a server that reports connection events to `handler`
    pub fn new(handler: Weak<dyn ConnectionHandler>) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                handler,
                listener: Mutex::new(None),
                connections: Mutex::new(HashMap::new()),
                shutdown: Mutex::new(CancellationToken::new()),
                tasks: TaskTracker::new(),
                running: AtomicBool::new(false),
                local_port: AtomicU16::new(0),
            }),
        }
    }

    /// Bind the listening socket. Returns the bound port, which differs from
    /// `port` only when `port` is 0.
    ///
    /// With `dual_stack` the IPv6 wildcard is tried first and the IPv4
    /// wildcard is used when the host has no IPv6 support.
    pub fn listen(
        &self,
        port: u16,
        prefer_ipv4: bool,
        reuse_address: bool,
        dual_stack: bool,
    ) -> Result<u16, NetError> {
        let v4 = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let v6 = SocketAddr::from((Ipv6Addr::UNSPECIFIED, port));

        let bound = if prefer_ipv4 {
            bind(v4, reuse_address)
        } else {
            match bind(v6, reuse_address) {
                Err(e) if dual_stack && e.kind() != io::ErrorKind::AddrInUse => {
                    log::debug!("IPv6 listen failed ({}), falling back to IPv4", e);
                    bind(v4, reuse_address)
                }
                other => other,
            }
        };

        let listener = bound.map_err(|e| {
            let err = NetError::from(e);
            self.inner.notify_error(None, &err);
            err
        })?;

        let local_port = listener.local_addr().map_err(NetError::from)?.port();
        self.inner.local_port.store(local_port, Ordering::Release);
        *self.inner.listener.lock() = Some(listener);
        Ok(local_port)
    }

    /// Start accepting connections on the bound listener
    pub fn run(&self) {
        let Some(listener) = self.inner.listener.lock().take() else {
            log::warn!("Server has no bound listener, not accepting connections");
            return;
        };
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let shutdown = self.inner.shutdown.lock().clone();
        self.inner.tasks.spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };

                match accepted {
                    Ok((stream, addr)) => {
                        log::debug!("Incoming connection from {}", addr);
                        if let Err(e) = inner.register(stream, addr, false) {
                            log::debug!("Dropped incoming connection from {}: {}", addr, e);
                        }
                    }
                    Err(e) => {
                        log::warn!("Accept error: {}", e);
                        inner.notify_error(None, &NetError::from(e));
                        break;
                    }
                }
            }
            inner.running.store(false, Ordering::Release);
        });
    }

    /// Whether the accept loop is alive
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Port of the bound listener, if any
    pub fn local_port(&self) -> Option<u16> {
        match self.inner.local_port.load(Ordering::Acquire) {
            0 => None,
            port => Some(port),
        }
    }

    /// Open an outbound connection
    pub async fn connect(
        &self,
        address: &str,
        port: u16,
        prefer_ipv4: bool,
    ) -> Result<Connection, NetError> {
        let result = async {
            let addr = endpoint::resolve(address, port, prefer_ipv4).await?;
            let stream = TcpStream::connect(addr).await?;
            Ok::<_, NetError>((stream, addr))
        }
        .await;

        match result {
            Ok((stream, addr)) => self.inner.register(stream, addr, true),
            Err(e) => {
                self.inner.notify_error(None, &e);
                Err(e)
            }
        }
    }

    /// Snapshot of the registered connections
    pub fn connections(&self) -> Vec<Connection> {
        self.inner.connections.lock().values().cloned().collect()
    }

    pub fn has_any_connection(&self) -> bool {
        self.inner
            .connections
            .lock()
            .values()
            .any(Connection::is_connected)
    }

    /// Close the listener and every connection, then wait until all reader
    /// and writer tasks have finished. No handler callback fires after this
    /// returns.
    pub async fn close(&self) {
        self.inner.running.store(false, Ordering::Release);
        let connections: Vec<Connection> = {
            let connections = self.inner.connections.lock();
            self.inner.shutdown.lock().cancel();
            connections.values().cloned().collect()
        };
        for conn in &connections {
            conn.disconnect();
        }
        self.inner.listener.lock().take();

        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.local_port.store(0, Ordering::Release);
    }

    /// Re-arm a closed server so it can listen and connect again
    pub fn reset(&self) {
        let mut shutdown = self.inner.shutdown.lock();
        if shutdown.is_cancelled() {
            *shutdown = CancellationToken::new();
        }
        self.inner.tasks.reopen();
    }

    /// Cancel everything without waiting
    /// Run `task` on the server's tracker. It is dropped when the server
    /// shuts down and never starts if shutdown already happened.
    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let shutdown = self.inner.shutdown.lock().clone();
        self.inner.tasks.spawn(async move {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {}
                _ = task => {}
            }
        });
    }

    pub(crate) fn shutdown_now(&self) {
        self.inner.running.store(false, Ordering::Release);
        self.inner.shutdown.lock().cancel();
        self.inner.listener.lock().take();
    }
}

impl ServerInner {
    fn register(
        self: &Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
        outbound: bool,
    ) -> Result<Connection, NetError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = {
            let mut connections = self.connections.lock();
            let shutdown = self.shutdown.lock();
            if shutdown.is_cancelled() {
                return Err(NetError::Disconnected);
            }
            let conn = Connection::new(addr.into(), outbound, tx, shutdown.child_token());
            connections.insert(conn.id(), conn.clone());
            conn
        };

        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("Failed to set TCP_NODELAY on {}: {}", conn, e);
        }

        if let Some(handler) = self.handler.upgrade() {
            handler.on_connect(&conn);
        }

        let (reader, writer) = connection::framed(stream);
        self.tasks
            .spawn(connection::write_loop(conn.clone(), writer, rx));

        let inner = Arc::clone(self);
        let read_conn = conn.clone();
        let handler = self.handler.clone();
        self.tasks.spawn(async move {
            let id = read_conn.id();
            connection::read_loop(read_conn, reader, handler).await;
            inner.connections.lock().remove(&id);
        });

        Ok(conn)
    }

    fn notify_error(&self, conn: Option<&Connection>, error: &NetError) {
        if let Some(handler) = self.handler.upgrade() {
            handler.on_error(conn, error);
        }
    }
}

fn bind(addr: SocketAddr, reuse_address: bool) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(reuse_address)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}
