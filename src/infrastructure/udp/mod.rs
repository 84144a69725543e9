//! UDP Gyro Provider Module
//!
//! Streams device motion to an owoTrack / SlimeVR server.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  GyroProviderSession                     │
//! │  (handshake, dispatch, liveness, provide_* API)          │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!              ┌────────┴────────┐
//!              │                 │
//!              ▼                 ▼
//!   ┌───────────────────┐   ┌────────────┐
//!   │ DatagramTransport │   │  Protocol  │
//!   │  (UdpTransport)   │   │            │
//!   │ - open/bind       │   │ - types    │
//!   │ - send            │   │ - encode   │
//!   │ - recv / close    │   │ - decode   │
//!   └───────────────────┘   └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Packet types, outbound encoding, inbound decoding
//! - [`transport`] - Transport traits and the best-effort UDP socket
//! - [`session`] - Protocol state machine

pub mod protocol;
pub mod session;
pub mod transport;

pub use session::{GyroProviderSession, SessionConfig};
