use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] bincode::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[source] bincode::Error),

    #[error("message of {size} bytes exceeds the {max} byte limit", max = crate::protocol::MAX_MESSAGE_SIZE)]
    MessageTooLarge { size: usize },

    #[error("stream error: {0}")]
    Io(#[source] std::io::Error),
}

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificate found in {0}")]
    NoCertificate(PathBuf),

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("TLS configuration error: {0}")]
    Config(#[from] rustls::Error),
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("cannot bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("failed to send response: {0}")]
    Send(#[source] std::io::Error),

    #[error("failed to receive push frame: {0}")]
    Receive(#[source] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid server name {0:?}")]
    InvalidServerName(String),

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] std::io::Error),

    #[error("failed to send push frame: {0}")]
    Send(#[source] std::io::Error),

    #[error("connection closed before a response arrived")]
    ConnectionClosed,

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}
