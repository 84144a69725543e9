use std::fmt;

/// Remote server address, fixed for the lifetime of a connect attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Protocol state of a gyro provider session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Transport open, handshake in progress
    Connecting,
    Connected,
}

/// The three states shown by the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Loading,
    Connected,
    Unconnected,
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

impl StatusMessage {
    pub fn new(message: impl Into<String>, severity: MessageSeverity) -> Self {
        Self {
            message: message.into(),
            severity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}

/// Notifications raised by a session towards its owner.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Log(StatusMessage),
    StateChanged(ConnectionState),
    /// Server asked to switch magnetometer use on or off
    MagnetometerChangeRequested(bool),
    /// Liveness timeout or fatal receive error
    ConnectionLost,
    /// Local source port to remember for the next connect
    LocalPortBound(u16),
    /// Remembered local port could not be bound and was dropped
    LocalPortCleared,
}

/// Events published to the UI sink.
#[derive(Debug, Clone)]
pub enum AppEvent {
    LogMessage(StatusMessage),
    LogCleared,
    ConnectionStatus(ConnectionStatus),
    MagnetometerToggled(bool),
}
