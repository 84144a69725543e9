//! Tracking Service
//!
//! Owns the gyro provider session on behalf of the UI: persists the
//! endpoint, runs the connect sequence, keeps the battery timer going and
//! reacts to session events.

use crate::domain::models::{
    AppEvent, ConnectionStatus, Endpoint, MessageSeverity, SessionEvent, StatusMessage,
};
use crate::domain::settings::SettingsService;
use crate::error::SessionError;
use crate::infrastructure::hardware::DeviceHardware;
use crate::infrastructure::udp::{GyroProviderSession, SessionConfig};
use anyhow::Result;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

#[derive(Default)]
struct TrackingState {
    session: Option<Arc<GyroProviderSession>>,
    battery_task: Option<JoinHandle<()>>,
    use_magnetometer: bool,
}

struct TrackingInner {
    settings: Arc<Mutex<SettingsService>>,
    hardware: Arc<dyn DeviceHardware>,
    ui_events: mpsc::UnboundedSender<AppEvent>,
    state: Mutex<TrackingState>,
}

/// Connection orchestration. Clones share the same state.
#[derive(Clone)]
pub struct TrackingService {
    inner: Arc<TrackingInner>,
}

impl TrackingService {
    pub fn new(
        settings: Arc<Mutex<SettingsService>>,
        hardware: Arc<dyn DeviceHardware>,
        ui_events: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(TrackingInner {
                settings,
                hardware,
                ui_events,
                state: Mutex::new(TrackingState::default()),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, TrackingState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: AppEvent) {
        let _ = self.inner.ui_events.send(event);
    }

    fn log(&self, message: &str, severity: MessageSeverity) {
        self.publish(AppEvent::LogMessage(StatusMessage::new(message, severity)));
    }

    /// Live session, for the sensor source to push samples into
    pub fn session(&self) -> Option<Arc<GyroProviderSession>> {
        self.state().session.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.session().is_some_and(|s| s.is_connected())
    }

    pub fn magnetometer_enabled(&self) -> bool {
        self.state().use_magnetometer
    }

    /// Connect to `ip:port` and start streaming support tasks.
    pub async fn start(&self, ip: &str, port: u16, use_magnetometer: bool) -> Result<()> {
        self.stop();

        let (config, battery_interval) = self.session_config(ip, port, use_magnetometer)?;
        self.publish(AppEvent::LogCleared);
        self.publish(AppEvent::ConnectionStatus(ConnectionStatus::Loading));

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let session = Arc::new(GyroProviderSession::new(
            config,
            Arc::clone(&self.inner.hardware),
            event_tx,
        ));
        {
            let mut state = self.state();
            state.session = Some(Arc::clone(&session));
            state.use_magnetometer = use_magnetometer;
        }
        tokio::spawn(
            self.clone()
                .pump_session_events(Arc::downgrade(&session), event_rx),
        );

        if let Err(e) = session.connect().await {
            warn!("Connecting to {} failed: {}", session.endpoint(), e);
            self.log("Connecting failed", MessageSeverity::Error);
            // Cleared before returning so an immediate retry binds a fresh port
            if matches!(&e, SessionError::Transport(t) if t.is_address_in_use()) {
                self.update_settings(|s| s.clear_bind_port());
            }
            self.stop_session(&session);
            return Err(e.into());
        }

        info!("Connection established with {}", session.endpoint());
        self.log("Connection established", MessageSeverity::Success);
        self.publish(AppEvent::ConnectionStatus(ConnectionStatus::Connected));

        session.provide_magnetometer_use(use_magnetometer);
        self.inner.hardware.set_motion_magnetometer(use_magnetometer);

        let battery_task = self.spawn_battery_timer(Arc::clone(&session), battery_interval);
        let mut state = self.state();
        if state
            .session
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, &session))
        {
            state.battery_task = Some(battery_task);
        } else {
            battery_task.abort();
        }
        Ok(())
    }

    fn session_config(
        &self,
        ip: &str,
        port: u16,
        use_magnetometer: bool,
    ) -> Result<(SessionConfig, Duration)> {
        let mut settings = self
            .inner
            .settings
            .lock()
            .map_err(|_| anyhow::anyhow!("Lock error"))?;
        if let Err(e) = settings.remember_endpoint(ip, port, use_magnetometer) {
            warn!("Could not persist endpoint: {}", e);
        }
        let pseudo_mac = settings.pseudo_mac()?;
        let s = settings.get();

        let mut config = SessionConfig::new(Endpoint::new(ip, port), pseudo_mac);
        config.local_port_hint = s.bind_port;
        config.handshake_retry_interval = Duration::from_millis(s.handshake_retry_interval_ms);
        Ok((config, Duration::from_secs(s.battery_interval_secs.max(1))))
    }

    fn spawn_battery_timer(
        &self,
        session: Arc<GyroProviderSession>,
        period: Duration,
    ) -> JoinHandle<()> {
        let hardware = Arc::clone(&self.inner.hardware);
        tokio::spawn(async move {
            let mut interval = time::interval(period);
            loop {
                interval.tick().await;
                if !session.is_connected() {
                    return;
                }
                if let Some(level) = hardware.battery_level() {
                    session.provide_battery_level(level);
                }
            }
        })
    }

    async fn pump_session_events(
        self,
        session: Weak<GyroProviderSession>,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Log(message) => self.publish(AppEvent::LogMessage(message)),
                SessionEvent::StateChanged(state) => debug!("Session state: {:?}", state),
                SessionEvent::MagnetometerChangeRequested(enabled) => {
                    self.toggle_magnetometer_use(enabled)
                }
                SessionEvent::ConnectionLost => {
                    if let Some(session) = session.upgrade() {
                        self.stop_session(&session);
                    }
                }
                SessionEvent::LocalPortBound(port) => {
                    self.update_settings(|s| s.set_bind_port(port));
                }
                SessionEvent::LocalPortCleared => {
                    self.update_settings(|s| s.clear_bind_port());
                }
            }
        }
        debug!("Session event stream closed");
    }

    fn update_settings(&self, update: impl FnOnce(&mut SettingsService) -> Result<()>) {
        let result = self
            .inner
            .settings
            .lock()
            .map_err(|_| anyhow::anyhow!("Lock error"))
            .and_then(|mut settings| update(&mut settings));
        if let Err(e) = result {
            warn!("Could not update settings: {}", e);
        }
    }

    /// Switch the motion source between magnetometer and gyro-only fusion.
    pub fn toggle_magnetometer_use(&self, enabled: bool) {
        {
            let mut state = self.state();
            if state.session.is_none() {
                return;
            }
            state.use_magnetometer = enabled;
        }
        self.inner.hardware.set_motion_magnetometer(enabled);
        self.publish(AppEvent::MagnetometerToggled(enabled));
    }

    pub fn button_pushed(&self) {
        if let Some(session) = self.session() {
            self.log("Button pushed", MessageSeverity::Info);
            session.provide_button_pushed();
        }
    }

    /// Stop whatever session is running. Idempotent.
    pub fn stop(&self) {
        let session = self.state().session.clone();
        if let Some(session) = session {
            self.stop_session(&session);
        }
    }

    /// Stop `session` if it is still the current one.
    fn stop_session(&self, session: &Arc<GyroProviderSession>) {
        let battery_task = {
            let mut state = self.state();
            match &state.session {
                Some(current) if Arc::ptr_eq(current, session) => {}
                _ => return,
            }
            state.session = None;
            state.battery_task.take()
        };
        if let Some(task) = battery_task {
            task.abort();
        }
        session.stop();
        info!("Tracking stopped");
        self.publish(AppEvent::ConnectionStatus(ConnectionStatus::Unconnected));
    }
}
