//! Phone/watch motion tracker client for the owoTrack / SlimeVR UDP protocol.

pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod tracking;

pub use error::{DecodeError, HandshakeError, SessionError, TransportError};
pub use infrastructure::udp::{GyroProviderSession, SessionConfig};
pub use tracking::TrackingService;
