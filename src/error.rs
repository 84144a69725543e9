//! Error types for the gyro provider client.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Errors raised by the UDP datagram transport.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("local port {port} is already in use")]
    AddressInUse { port: u16 },

    #[error("could not resolve {host}: {reason}")]
    Resolve { host: String, reason: String },

    #[error("no usable address for {0}")]
    NoAddress(String),

    #[error("bind to {addr} failed: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("receive failed: {0}")]
    Receive(#[source] io::Error),
}

impl TransportError {
    /// True when the requested local source port could not be bound.
    pub fn is_address_in_use(&self) -> bool {
        matches!(self, Self::AddressInUse { .. })
    }
}

/// Reasons a handshake attempt is rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("handshake response does not start with the expected control byte")]
    MalformedPreamble,

    #[error("handshake response greeting is malformed")]
    MalformedGreeting,

    #[error("handshake response carries no version digit")]
    MalformedVersion,

    #[error("mismatching version (server {server}, client {client})")]
    VersionMismatch { server: u8, client: u8 },

    #[error("no handshake response after {attempts} attempts")]
    Timeout { attempts: u32 },
}

impl HandshakeError {
    /// User-facing explanation with remediation hints.
    pub fn remediation(&self) -> String {
        match self {
            Self::MalformedPreamble => "The server did not respond correctly. \
                Ensure everything is up-to-date and that the port is correct."
                .to_string(),
            Self::MalformedGreeting | Self::MalformedVersion => {
                "The server did not respond correctly in the header. \
                 Ensure everything is up-to-date and that the port is correct."
                    .to_string()
            }
            Self::VersionMismatch { server, client } => format!(
                "Handshake failed, mismatching version\nServer version: {}\nClient version: {}\n\
                 Please make sure everything is up to date.",
                server, client
            ),
            Self::Timeout { .. } => "Connection timed out. Ensure IP and port are correct, \
                that the server is running and not blocked by a firewall or the router, \
                and that you're connected to the same network (you may need to disable mobile data)."
                .to_string(),
        }
    }
}

/// Inbound datagram could not be decoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("datagram of {actual} bytes has no message type")]
    MissingType { actual: usize },

    #[error("datagram too short for message type {message_type}: need {needed} bytes, got {actual}")]
    TooShort {
        message_type: u32,
        needed: usize,
        actual: usize,
    },
}

/// Failure of a connect attempt.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("session stopped while connecting")]
    Stopped,
}
