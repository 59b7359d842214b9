//! Transport error taxonomy

use std::io;
use thiserror::Error;

/// Errors produced by the transport layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetError {
    #[error("Disconnected")]
    Disconnected,
    #[error("Connection refused")]
    ConnectionRefused,
    #[error("Timed out")]
    TimeOut,
    #[error("Connection reset")]
    Reset,
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("Endpoint in use")]
    EndpointInUse,
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),
    #[error("General error: {0}")]
    General(String),
}

impl From<io::Error> for NetError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => NetError::ConnectionRefused,
            io::ErrorKind::TimedOut => NetError::TimeOut,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => NetError::Reset,
            io::ErrorKind::NotConnected | io::ErrorKind::UnexpectedEof => NetError::Disconnected,
            io::ErrorKind::AddrInUse => NetError::EndpointInUse,
            io::ErrorKind::AddrNotAvailable | io::ErrorKind::InvalidInput => {
                NetError::InvalidEndpoint(err.to_string())
            }
            io::ErrorKind::InvalidData => NetError::InvalidPacket(err.to_string()),
            _ => NetError::General(err.to_string()),
        }
    }
}
