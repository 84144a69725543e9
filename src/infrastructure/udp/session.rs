//! Gyro Provider Session
//!
//! Protocol client on top of a [`DatagramTransport`]: handshake negotiation,
//! inbound dispatch with byte order detection, liveness supervision and
//! the outbound `provide_*` API used by the sensor source.
//!
//! All mutable protocol state lives behind one mutex that is never held
//! across an await point. Outbound packets are numbered and sent while the
//! lock is held, so ids leave the device strictly increasing even with many
//! concurrent callers.

use crate::domain::models::{
    ConnectionState, Endpoint, MessageSeverity, SessionEvent, StatusMessage,
};
use crate::error::{HandshakeError, SessionError, TransportError};
use crate::infrastructure::hardware::DeviceHardware;
use crate::infrastructure::udp::protocol::{
    self, Endianness, InboundMessage, OutboundPacket, HANDSHAKE_ATTEMPTS, PROTOCOL_VERSION,
};
use crate::infrastructure::udp::transport::{
    receive_loop, DatagramTransport, TransportConnector, UdpConnector,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Period of the liveness check
pub const LIVENESS_CHECK_PERIOD: Duration = Duration::from_secs(1);

/// Silence after which the server is considered gone
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default wait for a handshake response before the next attempt
pub const DEFAULT_HANDSHAKE_RETRY_INTERVAL: Duration = Duration::from_millis(400);

/// Connection parameters supplied by the settings collaborator
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub endpoint: Endpoint,
    /// Local source port of the last successful connection
    pub local_port_hint: Option<u16>,
    pub pseudo_mac: [u8; 6],
    pub handshake_retry_interval: Duration,
}

impl SessionConfig {
    pub fn new(endpoint: Endpoint, pseudo_mac: [u8; 6]) -> Self {
        Self {
            endpoint,
            local_port_hint: None,
            pseudo_mac,
            handshake_retry_interval: DEFAULT_HANDSHAKE_RETRY_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum HandshakeStatus {
    Pending,
    Accepted,
    Rejected(HandshakeError),
    Cancelled,
}

struct SessionState {
    connection: ConnectionState,
    endianness: Endianness,
    packet_id: u64,
    last_received_at: Option<Instant>,
    /// Bumped on every connect and stop so stale tasks can tell they are stale
    generation: u64,
    local_port_hint: Option<u16>,
    transport: Option<Arc<dyn DatagramTransport>>,
    tasks: Vec<JoinHandle<()>>,
}

struct SessionShared {
    state: Mutex<SessionState>,
    handshake: watch::Sender<HandshakeStatus>,
    events: mpsc::UnboundedSender<SessionEvent>,
    hardware: Arc<dyn DeviceHardware>,
}

/// UDP gyro provider client. Cheap to share behind an `Arc`.
pub struct GyroProviderSession {
    config: SessionConfig,
    connector: Arc<dyn TransportConnector>,
    shared: Arc<SessionShared>,
}

impl GyroProviderSession {
    pub fn new(
        config: SessionConfig,
        hardware: Arc<dyn DeviceHardware>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self::with_connector(config, Arc::new(UdpConnector), hardware, events)
    }

    /// Session opening its transports through `connector`
    pub fn with_connector(
        config: SessionConfig,
        connector: Arc<dyn TransportConnector>,
        hardware: Arc<dyn DeviceHardware>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let (handshake, _) = watch::channel(HandshakeStatus::Pending);
        let state = SessionState {
            connection: ConnectionState::Disconnected,
            endianness: Endianness::Big,
            packet_id: 0,
            last_received_at: None,
            generation: 0,
            local_port_hint: config.local_port_hint,
            transport: None,
            tasks: Vec::new(),
        };
        Self {
            config,
            connector,
            shared: Arc::new(SessionShared {
                state: Mutex::new(state),
                handshake,
                events,
                hardware,
            }),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.config.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().connection
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Byte order currently assumed for inbound messages
    pub fn endianness(&self) -> Endianness {
        self.shared.lock().endianness
    }

    /// Local port that the next connect will try to bind
    pub fn local_port_hint(&self) -> Option<u16> {
        self.shared.lock().local_port_hint
    }

    /// Open a fresh transport and run the handshake.
    ///
    /// Returns once the server accepted the handshake, rejected it, or all
    /// attempts went unanswered. Failures leave the session disconnected.
    pub async fn connect(&self) -> Result<(), SessionError> {
        let shared = &self.shared;
        let (generation, hint) = shared.begin_connect();
        shared.log("Attempting connection", MessageSeverity::Info);
        info!(
            "Connecting to {} (protocol v{})",
            self.config.endpoint, PROTOCOL_VERSION
        );

        let transport = match self.connector.open(&self.config.endpoint, hint).await {
            Ok(transport) => transport,
            Err(e) => {
                shared.on_open_failed(generation, &e);
                return Err(e.into());
            }
        };

        if let Some(port) = transport.local_port() {
            let _ = shared.events.send(SessionEvent::LocalPortBound(port));
        }
        if !shared.attach_transport(generation, &transport) {
            transport.close();
            return Err(SessionError::Stopped);
        }
        shared.log("Connection ready, attempting handshake", MessageSeverity::Info);

        let mut status = shared.handshake.subscribe();
        for attempt in 0..HANDSHAKE_ATTEMPTS {
            if !shared.is_current(generation) {
                return Err(SessionError::Stopped);
            }
            let slime = protocol::sends_slime_extensions(attempt);
            debug!(
                "Handshake attempt {}/{} (slime extensions: {})",
                attempt + 1,
                HANDSHAKE_ATTEMPTS,
                slime
            );
            transport.send(&protocol::encode_handshake(slime, &self.config.pseudo_mac));

            let settled = match time::timeout(
                self.config.handshake_retry_interval,
                status.wait_for(|s| *s != HandshakeStatus::Pending),
            )
            .await
            {
                Ok(Ok(settled)) => settled.clone(),
                Ok(Err(_)) => HandshakeStatus::Cancelled,
                Err(_) => continue,
            };

            // A newer connect or a stop owns the session now
            if !shared.is_current(generation) {
                return Err(SessionError::Stopped);
            }
            return match settled {
                HandshakeStatus::Accepted => Ok(()),
                HandshakeStatus::Rejected(e) => {
                    shared.stop();
                    Err(e.into())
                }
                HandshakeStatus::Cancelled | HandshakeStatus::Pending => {
                    Err(SessionError::Stopped)
                }
            };
        }

        if !shared.is_current(generation) {
            return Err(SessionError::Stopped);
        }
        // The last attempt may still be answered by a slow server
        if *status.borrow() == HandshakeStatus::Accepted {
            return Ok(());
        }
        let err = HandshakeError::Timeout {
            attempts: HANDSHAKE_ATTEMPTS,
        };
        warn!("{}", err);
        shared.log("Handshake failed", MessageSeverity::Error);
        shared.log(err.remediation(), MessageSeverity::Error);
        shared.stop();
        Err(err.into())
    }

    /// Tear down transport and timers. Safe to call at any time.
    pub fn stop(&self) {
        self.shared.stop();
    }

    pub fn provide_rotation(&self, quaternion: [f32; 4]) {
        self.shared.send_packet(OutboundPacket::Rotation(quaternion));
    }

    pub fn provide_gyro(&self, gyro: [f32; 3]) {
        self.shared.send_packet(OutboundPacket::Gyro(gyro));
    }

    pub fn provide_accel(&self, accel: [f32; 3]) {
        self.shared.send_packet(OutboundPacket::Accel(accel));
    }

    pub fn provide_magnetometer_use(&self, enabled: bool) {
        self.shared
            .send_packet(OutboundPacket::MagnetometerUse(enabled));
    }

    pub fn provide_battery_level(&self, level: f32) {
        self.shared.send_packet(OutboundPacket::BatteryLevel(level));
    }

    pub fn provide_button_pushed(&self) {
        self.shared.send_packet(OutboundPacket::ButtonPushed);
    }
}

impl Drop for GyroProviderSession {
    fn drop(&mut self) {
        self.shared.stop();
    }
}

impl SessionShared {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn log(&self, message: impl Into<String>, severity: MessageSeverity) {
        let _ = self
            .events
            .send(SessionEvent::Log(StatusMessage::new(message, severity)));
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    fn begin_connect(&self) -> (u64, Option<u16>) {
        let (stale_transport, stale_tasks, generation, hint) = {
            let mut state = self.lock();
            state.generation += 1;
            state.connection = ConnectionState::Connecting;
            state.endianness = Endianness::Big;
            state.packet_id = 0;
            state.last_received_at = None;
            (
                state.transport.take(),
                std::mem::take(&mut state.tasks),
                state.generation,
                state.local_port_hint,
            )
        };
        if let Some(transport) = stale_transport {
            transport.close();
        }
        for task in stale_tasks {
            task.abort();
        }
        self.handshake.send_replace(HandshakeStatus::Pending);
        let _ = self
            .events
            .send(SessionEvent::StateChanged(ConnectionState::Connecting));
        (generation, hint)
    }

    fn on_open_failed(&self, generation: u64, err: &TransportError) {
        {
            let mut state = self.lock();
            if state.generation == generation {
                state.connection = ConnectionState::Disconnected;
            }
            if err.is_address_in_use() {
                state.local_port_hint = None;
            }
        }
        error!("Opening UDP socket failed: {}", err);
        self.log(format!("Connection failed: {}", err), MessageSeverity::Error);
        if err.is_address_in_use() {
            let _ = self.events.send(SessionEvent::LocalPortCleared);
            self.log("Please try again", MessageSeverity::Warning);
        }
        let _ = self
            .events
            .send(SessionEvent::StateChanged(ConnectionState::Disconnected));
    }

    /// Install the transport and start its receive loop. False if the
    /// connect attempt was superseded or stopped meanwhile.
    fn attach_transport(
        self: &Arc<Self>,
        generation: u64,
        transport: &Arc<dyn DatagramTransport>,
    ) -> bool {
        let mut state = self.lock();
        if state.generation != generation || state.connection != ConnectionState::Connecting {
            return false;
        }
        if let Some(port) = transport.local_port() {
            state.local_port_hint = Some(port);
        }
        state.transport = Some(Arc::clone(transport));

        let shared = Arc::clone(self);
        let receiver = Arc::clone(transport);
        state.tasks.push(tokio::spawn(async move {
            let result = receive_loop(receiver.as_ref(), |bytes| {
                shared.handle_datagram(generation, bytes);
            })
            .await;
            if let Err(e) = result {
                shared.on_receive_failed(generation, e);
            }
        }));
        true
    }

    fn on_receive_failed(&self, generation: u64, err: TransportError) {
        if self.lock().generation != generation {
            return;
        }
        error!("Receive loop ended: {}", err);
        self.log("Connection with server lost", MessageSeverity::Error);
        if self.stop() {
            let _ = self.events.send(SessionEvent::ConnectionLost);
        }
    }

    /// Process one inbound datagram. Returns the message that was dispatched,
    /// if any.
    fn handle_datagram(
        self: &Arc<Self>,
        generation: u64,
        bytes: &[u8],
    ) -> Option<InboundMessage> {
        let mut state = self.lock();
        if state.generation != generation {
            return None;
        }
        let connection = state.connection;
        match connection {
            ConnectionState::Disconnected => None,
            ConnectionState::Connecting => {
                self.handle_handshake_response(state, bytes);
                None
            }
            ConnectionState::Connected => self.dispatch(state, bytes),
        }
    }

    fn handle_handshake_response(
        self: &Arc<Self>,
        mut state: MutexGuard<'_, SessionState>,
        bytes: &[u8],
    ) {
        match protocol::parse_handshake_response(bytes) {
            Ok(version) => {
                state.connection = ConnectionState::Connected;
                state.last_received_at = Some(Instant::now());
                let liveness = self.spawn_liveness(state.generation);
                state.tasks.push(liveness);
                drop(state);

                info!("Handshake succeeded, server protocol version {}", version);
                self.handshake.send_replace(HandshakeStatus::Accepted);
                self.log("Handshake succeeded", MessageSeverity::Success);
                let _ = self
                    .events
                    .send(SessionEvent::StateChanged(ConnectionState::Connected));
            }
            Err(e) => {
                drop(state);
                warn!("Handshake rejected: {}", e);
                self.log("Handshake failed", MessageSeverity::Error);
                self.log(e.remediation(), MessageSeverity::Error);
                self.handshake.send_replace(HandshakeStatus::Rejected(e));
            }
        }
    }

    fn dispatch(
        &self,
        mut state: MutexGuard<'_, SessionState>,
        bytes: &[u8],
    ) -> Option<InboundMessage> {
        // Anything from the server proves it is alive, even if undecodable
        state.last_received_at = Some(Instant::now());

        // Responses to earlier handshake attempts may trail in
        if protocol::is_handshake_response(bytes) {
            debug!("Ignoring late handshake response");
            return None;
        }

        let mut message = match InboundMessage::decode(bytes, state.endianness) {
            Ok(message) => message,
            Err(e) => {
                debug!("Dropping datagram: {}", e);
                return None;
            }
        };
        if message.suggests_wrong_endianness() {
            state.endianness = state.endianness.flipped();
            debug!(
                "Message type {:?} implausible, now reading {:?}",
                message, state.endianness
            );
            message = match InboundMessage::decode(bytes, state.endianness) {
                Ok(message) => message,
                Err(e) => {
                    debug!("Dropping datagram after byte order flip: {}", e);
                    return None;
                }
            };
        }

        match message {
            InboundMessage::Heartbeat
            | InboundMessage::Handshake
            | InboundMessage::MagnetometerStatus => {}
            InboundMessage::Ping => {
                if let Some(transport) = &state.transport {
                    transport.send(bytes);
                }
            }
            InboundMessage::Vibrate {
                duration,
                frequency,
                amplitude,
            } => {
                drop(state);
                if !self
                    .hardware
                    .vibrate_advanced(frequency, amplitude, duration)
                {
                    self.hardware.vibrate();
                }
            }
            InboundMessage::ChangeMagnetometerStatus(enabled) => {
                drop(state);
                info!("Server requested magnetometer use: {}", enabled);
                let _ = self
                    .events
                    .send(SessionEvent::MagnetometerChangeRequested(enabled));
            }
            InboundMessage::Unknown(message_type) => {
                warn!("Unknown message type {}", message_type);
            }
        }
        Some(message)
    }

    fn spawn_liveness(self: &Arc<Self>, generation: u64) -> JoinHandle<()> {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = time::interval(LIVENESS_CHECK_PERIOD);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                if !shared.check_liveness(generation) {
                    return;
                }
            }
        })
    }

    /// False once this liveness task has nothing left to watch.
    fn check_liveness(&self, generation: u64) -> bool {
        let silence = {
            let state = self.lock();
            if state.generation != generation || state.connection != ConnectionState::Connected {
                return false;
            }
            state
                .last_received_at
                .map(|at| at.elapsed())
                .unwrap_or_default()
        };
        if silence <= HEARTBEAT_TIMEOUT {
            return true;
        }

        warn!("No message from server for {:?}", silence);
        self.log("Connection with server lost", MessageSeverity::Error);
        if self.stop() {
            let _ = self.events.send(SessionEvent::ConnectionLost);
        }
        false
    }

    fn send_packet(&self, packet: OutboundPacket) {
        let mut state = self.lock();
        if state.connection != ConnectionState::Connected {
            return;
        }
        let Some(transport) = state.transport.clone() else {
            return;
        };
        let packet_id = state.packet_id;
        state.packet_id += 1;
        transport.send(&packet.encode(packet_id));
    }

    /// Returns true if this call performed the teardown.
    fn stop(&self) -> bool {
        let (transport, tasks) = {
            let mut state = self.lock();
            if state.connection == ConnectionState::Disconnected && state.transport.is_none() {
                return false;
            }
            state.connection = ConnectionState::Disconnected;
            state.generation += 1;
            (state.transport.take(), std::mem::take(&mut state.tasks))
        };
        if let Some(transport) = transport {
            transport.close();
        }
        for task in tasks {
            task.abort();
        }
        self.handshake.send_if_modified(|status| {
            if *status == HandshakeStatus::Pending {
                *status = HandshakeStatus::Cancelled;
                true
            } else {
                false
            }
        });

        info!("Gyro provider session stopped");
        self.log("Disconnected", MessageSeverity::Info);
        let _ = self
            .events
            .send(SessionEvent::StateChanged(ConnectionState::Disconnected));
        true
    }
}
