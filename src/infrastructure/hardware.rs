//! Device hardware collaborator
//!
//! The protocol core only needs haptics, battery level and a way to switch
//! the motion source between magnetometer and gyro-only fusion.

use tracing::info;

pub trait DeviceHardware: Send + Sync {
    /// Play a shaped vibration. Returns false when unsupported or failed,
    /// in which case the caller falls back to [`DeviceHardware::vibrate`].
    fn vibrate_advanced(&self, frequency: f32, amplitude: f32, duration: f32) -> bool;

    fn vibrate(&self);

    /// Battery charge in [0, 1], or None when unknown
    fn battery_level(&self) -> Option<f32>;

    /// Restart motion updates with or without the magnetometer
    fn set_motion_magnetometer(&self, enabled: bool);
}

/// Hardware binding for a host without motors or battery.
#[derive(Debug, Default)]
pub struct HeadlessHardware;

impl DeviceHardware for HeadlessHardware {
    fn vibrate_advanced(&self, frequency: f32, amplitude: f32, duration: f32) -> bool {
        info!(
            "Vibration requested: {:.2}s at {:.1}Hz, amplitude {:.2}",
            duration, frequency, amplitude
        );
        false
    }

    fn vibrate(&self) {
        info!("Vibrate");
    }

    fn battery_level(&self) -> Option<f32> {
        None
    }

    fn set_motion_magnetometer(&self, enabled: bool) {
        info!("Magnetometer use set to {}", enabled);
    }
}
