//! TrackingService end to end against a loopback mock server.

use owotrack_client::domain::models::{AppEvent, ConnectionStatus};
use owotrack_client::domain::settings::SettingsService;
use owotrack_client::infrastructure::hardware::DeviceHardware;
use owotrack_client::TrackingService;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;

#[derive(Default)]
struct FakeHardware {
    magnetometer: AtomicBool,
}

impl DeviceHardware for FakeHardware {
    fn vibrate_advanced(&self, _frequency: f32, _amplitude: f32, _duration: f32) -> bool {
        true
    }

    fn vibrate(&self) {}

    fn battery_level(&self) -> Option<f32> {
        Some(0.5)
    }

    fn set_motion_magnetometer(&self, enabled: bool) {
        self.magnetometer.store(enabled, Ordering::SeqCst);
    }
}

fn temp_settings(name: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("owotrack-tracking-{}-{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&path);
    path.push("settings.json");
    path
}

async fn recv_data(server: &UdpSocket) -> Vec<u8> {
    let mut buf = [0u8; 2048];
    loop {
        let (len, _) = timeout(Duration::from_secs(3), server.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        if buf[..4] != [0, 0, 0, 3] {
            return buf[..len].to_vec();
        }
    }
}

async fn next_status(rx: &mut mpsc::UnboundedReceiver<AppEvent>) -> ConnectionStatus {
    loop {
        let event = timeout(Duration::from_secs(3), rx.recv())
            .await
            .unwrap()
            .unwrap();
        if let AppEvent::ConnectionStatus(status) = event {
            return status;
        }
    }
}

#[tokio::test]
async fn test_start_streams_magnetometer_and_battery_then_stops() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = server.local_addr().unwrap().port();

    let path = temp_settings("start");
    let settings = Arc::new(Mutex::new(SettingsService::with_path(&path)));
    let hardware = Arc::new(FakeHardware::default());
    let (ui_tx, mut ui_rx) = mpsc::unbounded_channel();
    let service = TrackingService::new(
        Arc::clone(&settings),
        Arc::clone(&hardware) as Arc<dyn DeviceHardware>,
        ui_tx,
    );

    let starter = service.clone();
    let start = tokio::spawn(async move { starter.start("127.0.0.1", port, true).await });

    let mut buf = [0u8; 2048];
    let (_, client) = server.recv_from(&mut buf).await.unwrap();
    server.send_to(b"\x03Hey OVR =D 5", client).await.unwrap();
    timeout(Duration::from_secs(5), start)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(next_status(&mut ui_rx).await, ConnectionStatus::Loading);
    assert_eq!(next_status(&mut ui_rx).await, ConnectionStatus::Connected);
    assert!(service.is_connected());
    assert!(hardware.magnetometer.load(Ordering::SeqCst));

    let mag = recv_data(&server).await;
    assert_eq!(&mag[..4], &[0, 0, 0, 61]);
    assert_eq!(&mag[4..12], &0u64.to_be_bytes());
    assert_eq!(mag[12], b'y');

    let battery = recv_data(&server).await;
    assert_eq!(&battery[..4], &[0, 0, 0, 12]);
    assert_eq!(&battery[4..12], &1u64.to_be_bytes());
    assert_eq!(&battery[12..16], &0.5f32.to_be_bytes());

    // Server switches the magnetometer off
    server.send_to(&[0, 0, 0, 62, b'n'], client).await.unwrap();
    let toggled = timeout(Duration::from_secs(3), async {
        loop {
            if let Some(AppEvent::MagnetometerToggled(enabled)) = ui_rx.recv().await {
                return enabled;
            }
        }
    })
    .await
    .unwrap();
    assert!(!toggled);
    assert!(!service.magnetometer_enabled());
    assert!(!hardware.magnetometer.load(Ordering::SeqCst));

    // Bound source port is persisted for the next run
    assert_eq!(
        SettingsService::with_path(&path).get().bind_port,
        Some(client.port())
    );
    let saved = SettingsService::with_path(&path);
    assert_eq!(saved.get().server_port, port);
    assert!(saved.get().pseudo_mac.is_some());

    service.stop();
    service.stop();
    assert!(!service.is_connected());
    assert!(service.session().is_none());
    assert_eq!(next_status(&mut ui_rx).await, ConnectionStatus::Unconnected);
}

#[tokio::test]
async fn test_retry_after_port_in_use_binds_a_fresh_port() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = server.local_addr().unwrap().port();
    let blocker = UdpSocket::bind("0.0.0.0:0").await.unwrap();
    let taken = blocker.local_addr().unwrap().port();

    let path = temp_settings("port-in-use");
    let mut remembered = SettingsService::with_path(&path);
    remembered.set_bind_port(taken).unwrap();
    let settings = Arc::new(Mutex::new(remembered));
    let (ui_tx, _ui_rx) = mpsc::unbounded_channel();
    let service = TrackingService::new(
        Arc::clone(&settings),
        Arc::new(FakeHardware::default()),
        ui_tx,
    );

    let err = service.start("127.0.0.1", port, false).await.unwrap_err();
    assert!(err.to_string().contains("already in use"), "{}", err);
    assert_eq!(settings.lock().unwrap().get().bind_port, None);
    assert_eq!(SettingsService::with_path(&path).get().bind_port, None);

    // "Please try again" works straight away
    let starter = service.clone();
    let start = tokio::spawn(async move { starter.start("127.0.0.1", port, false).await });
    let mut buf = [0u8; 2048];
    let (_, client) = timeout(Duration::from_secs(3), server.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_ne!(client.port(), taken);
    server.send_to(b"\x03Hey OVR =D5", client).await.unwrap();
    timeout(Duration::from_secs(5), start)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(service.is_connected());

    service.stop();
}
