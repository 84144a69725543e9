use clap::Parser;
use owotrack_client::domain::models::{AppEvent, ConnectionStatus, MessageSeverity};
use owotrack_client::domain::settings::SettingsService;
use owotrack_client::infrastructure::hardware::HeadlessHardware;
use owotrack_client::infrastructure::logging;
use owotrack_client::TrackingService;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Stream this device as an owoTrack / SlimeVR tracker
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Server IP or hostname (defaults to the last used one)
    #[arg(long)]
    ip: Option<String>,

    /// Server UDP port (defaults to the last used one)
    #[arg(long)]
    port: Option<u16>,

    /// Do not use the magnetometer for orientation
    #[arg(long)]
    no_magnetometer: bool,

    /// Log level override, e.g. "debug"
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let settings_service = SettingsService::new()?;
    let mut log_settings = settings_service.get().log_settings.clone();
    if let Some(level) = &args.log_level {
        log_settings.level = level.clone();
    }
    let _logging_guard = logging::init_logger(&log_settings)?;
    info!("Starting OwOTrack client");

    let ip = args
        .ip
        .unwrap_or_else(|| settings_service.get().server_ip.clone());
    let port = args.port.unwrap_or(settings_service.get().server_port);
    let use_magnetometer = !args.no_magnetometer && settings_service.get().use_magnetometer;

    let settings = Arc::new(Mutex::new(settings_service));
    let (ui_tx, mut ui_rx) = mpsc::unbounded_channel();
    let service = TrackingService::new(settings, Arc::new(HeadlessHardware), ui_tx);

    let starter = service.clone();
    tokio::spawn(async move {
        if let Err(e) = starter.start(&ip, port, use_magnetometer).await {
            error!("Connection failed: {}", e);
        }
    });

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, disconnecting");
                service.stop();
                break;
            }
            event = ui_rx.recv() => match event {
                Some(AppEvent::LogMessage(msg)) => match msg.severity {
                    MessageSeverity::Error => error!("{}", msg.message),
                    MessageSeverity::Warning => warn!("{}", msg.message),
                    MessageSeverity::Info | MessageSeverity::Success => info!("{}", msg.message),
                },
                Some(AppEvent::LogCleared) => {}
                Some(AppEvent::ConnectionStatus(ConnectionStatus::Unconnected)) => {
                    info!("Tracker disconnected");
                    break;
                }
                Some(AppEvent::ConnectionStatus(status)) => info!("Status: {:?}", status),
                Some(AppEvent::MagnetometerToggled(enabled)) => {
                    info!("Magnetometer {}", if enabled { "enabled" } else { "disabled" })
                }
                None => break,
            }
        }
    }

    // Let the session flush its last log lines
    while let Ok(AppEvent::LogMessage(msg)) = ui_rx.try_recv() {
        info!("{}", msg.message);
    }
    Ok(())
}
