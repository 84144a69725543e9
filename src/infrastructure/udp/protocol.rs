//! Gyro Provider Protocol
//!
//! Wire format shared with the owoTrack driver and the SlimeVR server.
//!
//! ```text
//! Device -> Server
//! [0-3]   : Packet type (i32 big-endian)
//! [4-11]  : Packet id (i64 big-endian, 0 for handshakes)
//! [12-..] : Type specific payload, floats as big-endian IEEE-754
//!
//! Server -> Device
//! [0-3]   : Message type (u32, big- or little-endian depending on server)
//! [4-..]  : Type specific payload
//! ```
//!
//! The handshake response is not type tagged: it is the control byte `0x03`
//! followed by the ASCII text `Hey OVR =D` and a single version digit.

use crate::error::{DecodeError, HandshakeError};

/// Protocol version this client speaks. Must equal the server's exactly.
pub const PROTOCOL_VERSION: u8 = 5;

/// Size of the `[type][packet id]` header on every outbound packet
pub const HEADER_SIZE: usize = 12;

/// Size of the extended ("slime") handshake payload
pub const SLIME_EXTENSION_SIZE: usize = 45;

/// Total handshake attempts (1 initial + 12 retries)
pub const HANDSHAKE_ATTEMPTS: u32 = 13;

/// Attempts that carry the slime extensions. Old owoTrack drivers cannot
/// receive datagrams that large, so later attempts send the bare header.
pub const SLIME_EXTENSION_ATTEMPTS: u32 = 7;

/// Inbound type values at or above this are assumed to be read with the
/// wrong byte order.
pub const ENDIANNESS_FLIP_THRESHOLD: u32 = 2048;

pub const FIRMWARE_NAME: &str = "owoTrack8";
pub const FIRMWARE_BUILD: i32 = 8;

const HANDSHAKE_PREAMBLE: u8 = 3;
const HANDSHAKE_GREETING: &[u8] = b"Hey OVR =D";

/// Packet type identifiers
pub mod packet_type {
    // Device -> Server
    pub const ROTATION: u32 = 1;
    pub const GYRO: u32 = 2;
    pub const HANDSHAKE: u32 = 3;
    pub const ACCEL: u32 = 4;
    pub const PING_PONG: u32 = 10;
    pub const BATTERY_LEVEL: u32 = 12;
    pub const BUTTON_PUSHED: u32 = 60;
    pub const SEND_MAG_STATUS: u32 = 61;
    pub const CHANGE_MAG_STATUS: u32 = 62;

    // Server -> Device
    pub const RECEIVE_HEARTBEAT: u32 = 1;
    pub const RECEIVE_VIBRATE: u32 = 2;
}

/// Byte order assumed when reading inbound messages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Endianness {
    #[default]
    Big,
    Little,
}

impl Endianness {
    pub fn flipped(self) -> Self {
        match self {
            Self::Big => Self::Little,
            Self::Little => Self::Big,
        }
    }

    fn read_u32(self, bytes: [u8; 4]) -> u32 {
        match self {
            Self::Big => u32::from_be_bytes(bytes),
            Self::Little => u32::from_le_bytes(bytes),
        }
    }

    fn read_f32(self, bytes: [u8; 4]) -> f32 {
        f32::from_bits(self.read_u32(bytes))
    }
}

fn word(data: &[u8], offset: usize) -> [u8; 4] {
    [
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ]
}

/// Whether the handshake attempt with this zero-based index carries the
/// slime extensions.
pub fn sends_slime_extensions(attempt: u32) -> bool {
    attempt < SLIME_EXTENSION_ATTEMPTS
}

/// Build a handshake packet.
///
/// # Extended payload (45 bytes)
///
/// ```text
/// [12-15] : Board type (i32, 0)
/// [16-19] : IMU type (i32, 0)
/// [20-23] : MCU type (i32, 0)
/// [24-35] : IMU info (3 x i32, 0)
/// [36-39] : Firmware build (i32, 8)
/// [40]    : Firmware name length
/// [41-49] : Firmware name "owoTrack8"
/// [50-55] : Pseudo MAC address
/// [56]    : 0xFF
/// ```
pub fn encode_handshake(slime_extensions: bool, pseudo_mac: &[u8; 6]) -> Vec<u8> {
    let capacity = HEADER_SIZE + if slime_extensions { SLIME_EXTENSION_SIZE } else { 0 };
    let mut data = Vec::with_capacity(capacity);
    data.extend_from_slice(&(packet_type::HANDSHAKE as i32).to_be_bytes());
    data.extend_from_slice(&0i64.to_be_bytes());

    if !slime_extensions {
        return data;
    }

    let board_type = 0i32;
    let imu_type = 0i32;
    let mcu_type = 0i32;
    let imu_info = [0i32; 3];
    for value in [board_type, imu_type, mcu_type]
        .into_iter()
        .chain(imu_info)
        .chain([FIRMWARE_BUILD])
    {
        data.extend_from_slice(&value.to_be_bytes());
    }
    data.push(FIRMWARE_NAME.len() as u8);
    data.extend_from_slice(FIRMWARE_NAME.as_bytes());
    data.extend_from_slice(pseudo_mac);
    data.push(0xFF);

    debug_assert_eq!(data.len(), capacity);
    data
}

/// True if the datagram looks like a handshake response, well formed or not
/// in its version digit.
pub fn is_handshake_response(data: &[u8]) -> bool {
    data.first() == Some(&HANDSHAKE_PREAMBLE) && data[1..].starts_with(HANDSHAKE_GREETING)
}

/// Validate a handshake response and return the server's protocol version.
///
/// Servers differ on whether a space separates greeting and digit, both
/// forms are accepted. Bytes after the digit are ignored.
pub fn parse_handshake_response(data: &[u8]) -> Result<u8, HandshakeError> {
    let rest = match data.split_first() {
        Some((&HANDSHAKE_PREAMBLE, rest)) => rest,
        _ => return Err(HandshakeError::MalformedPreamble),
    };
    let rest = rest
        .strip_prefix(HANDSHAKE_GREETING)
        .ok_or(HandshakeError::MalformedGreeting)?;
    let rest = rest.strip_prefix(b" ").unwrap_or(rest);

    let version = match rest.first() {
        Some(digit) if digit.is_ascii_digit() => digit - b'0',
        _ => return Err(HandshakeError::MalformedVersion),
    };
    if version != PROTOCOL_VERSION {
        return Err(HandshakeError::VersionMismatch {
            server: version,
            client: PROTOCOL_VERSION,
        });
    }
    Ok(version)
}

/// Data and command packets sent by the device
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutboundPacket {
    /// Quaternion x, y, z, w
    Rotation([f32; 4]),
    Gyro([f32; 3]),
    Accel([f32; 3]),
    /// Charge in [0, 1]
    BatteryLevel(f32),
    ButtonPushed,
    MagnetometerUse(bool),
}

impl OutboundPacket {
    pub fn packet_type(&self) -> u32 {
        match self {
            Self::Rotation(_) => packet_type::ROTATION,
            Self::Gyro(_) => packet_type::GYRO,
            Self::Accel(_) => packet_type::ACCEL,
            Self::BatteryLevel(_) => packet_type::BATTERY_LEVEL,
            Self::ButtonPushed => packet_type::BUTTON_PUSHED,
            Self::MagnetometerUse(_) => packet_type::SEND_MAG_STATUS,
        }
    }

    pub fn encode(&self, packet_id: u64) -> Vec<u8> {
        match self {
            Self::Rotation(quat) => encode_floats(self.packet_type(), packet_id, quat),
            Self::Gyro(values) | Self::Accel(values) => {
                encode_floats(self.packet_type(), packet_id, values)
            }
            Self::BatteryLevel(level) => {
                encode_floats(self.packet_type(), packet_id, &[level.clamp(0.0, 1.0)])
            }
            Self::ButtonPushed => encode_header(self.packet_type(), packet_id, 0),
            Self::MagnetometerUse(enabled) => {
                let mut data = encode_header(self.packet_type(), packet_id, 1);
                data.push(if *enabled { b'y' } else { b'n' });
                data
            }
        }
    }
}

fn encode_header(packet_type: u32, packet_id: u64, payload_len: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(HEADER_SIZE + payload_len);
    data.extend_from_slice(&(packet_type as i32).to_be_bytes());
    data.extend_from_slice(&packet_id.to_be_bytes());
    data
}

fn encode_floats(packet_type: u32, packet_id: u64, values: &[f32]) -> Vec<u8> {
    assert!(!values.is_empty(), "float packet {} without payload", packet_type);
    let mut data = encode_header(packet_type, packet_id, values.len() * 4);
    for value in values {
        data.extend_from_slice(&value.to_bits().to_be_bytes());
    }
    data
}

/// Messages sent by the server
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InboundMessage {
    Heartbeat,
    Vibrate {
        duration: f32,
        frequency: f32,
        amplitude: f32,
    },
    /// Stray handshake, ignored once connected
    Handshake,
    /// Must be echoed back verbatim
    Ping,
    /// Device-to-server type, never consumed
    MagnetometerStatus,
    ChangeMagnetometerStatus(bool),
    Unknown(u32),
}

impl InboundMessage {
    /// Decode an inbound datagram using the given byte order.
    pub fn decode(data: &[u8], endianness: Endianness) -> Result<Self, DecodeError> {
        if data.len() < 4 {
            return Err(DecodeError::MissingType { actual: data.len() });
        }
        let message_type = endianness.read_u32(word(data, 0));
        let require = |needed: usize| {
            if data.len() < needed {
                Err(DecodeError::TooShort {
                    message_type,
                    needed,
                    actual: data.len(),
                })
            } else {
                Ok(())
            }
        };

        let message = match message_type {
            packet_type::RECEIVE_HEARTBEAT => Self::Heartbeat,
            packet_type::RECEIVE_VIBRATE => {
                require(16)?;
                Self::Vibrate {
                    duration: endianness.read_f32(word(data, 4)),
                    frequency: endianness.read_f32(word(data, 8)),
                    amplitude: endianness.read_f32(word(data, 12)),
                }
            }
            packet_type::HANDSHAKE => Self::Handshake,
            packet_type::PING_PONG => Self::Ping,
            packet_type::SEND_MAG_STATUS => Self::MagnetometerStatus,
            packet_type::CHANGE_MAG_STATUS => {
                require(5)?;
                Self::ChangeMagnetometerStatus(data[4] == b'y')
            }
            other => Self::Unknown(other),
        };
        Ok(message)
    }

    /// Unknown type large enough to suggest a byte order mismatch
    pub fn suggests_wrong_endianness(&self) -> bool {
        matches!(self, Self::Unknown(t) if *t >= ENDIANNESS_FLIP_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: [u8; 6] = [0xde, 0xad, 0xbe, 0xef, 0x01, 0x02];

    #[test]
    fn test_handshake_length_by_attempt() {
        for attempt in 0..HANDSHAKE_ATTEMPTS {
            let packet = encode_handshake(sends_slime_extensions(attempt), &MAC);
            let expected = if attempt < 7 { 57 } else { 12 };
            assert_eq!(packet.len(), expected, "attempt {}", attempt);
            assert_eq!(&packet[0..4], &[0, 0, 0, 3]);
            assert_eq!(&packet[4..12], &[0; 8]);
        }
    }

    #[test]
    fn test_handshake_extension_layout() {
        let packet = encode_handshake(true, &MAC);
        assert_eq!(&packet[12..36], &[0; 24]);
        assert_eq!(&packet[36..40], &[0, 0, 0, 8]);
        assert_eq!(packet[40], 9);
        assert_eq!(&packet[41..50], b"owoTrack8");
        assert_eq!(&packet[50..56], &MAC);
        assert_eq!(packet[56], 0xFF);
    }

    #[test]
    fn test_handshake_response_accepted() {
        assert_eq!(parse_handshake_response(b"\x03Hey OVR =D5"), Ok(5));
        assert_eq!(parse_handshake_response(b"\x03Hey OVR =D 5"), Ok(5));
        assert_eq!(parse_handshake_response(b"\x03Hey OVR =D 5\0\0\0"), Ok(5));
    }

    #[test]
    fn test_handshake_response_rejections() {
        assert_eq!(
            parse_handshake_response(b"\x03Hey OVR =D4"),
            Err(HandshakeError::VersionMismatch {
                server: 4,
                client: 5
            })
        );
        assert_eq!(
            parse_handshake_response(b"XHey OVR =D5"),
            Err(HandshakeError::MalformedPreamble)
        );
        assert_eq!(
            parse_handshake_response(b"\x03Wrong text 5"),
            Err(HandshakeError::MalformedGreeting)
        );
        assert_eq!(
            parse_handshake_response(b"\x03Hey OVR =D"),
            Err(HandshakeError::MalformedVersion)
        );
        assert_eq!(
            parse_handshake_response(b""),
            Err(HandshakeError::MalformedPreamble)
        );
    }

    #[test]
    fn test_rotation_layout() {
        let packet = OutboundPacket::Rotation([0.0, 0.5, -1.0, 1.0]).encode(7);
        assert_eq!(packet.len(), 28);
        assert_eq!(&packet[0..4], &[0, 0, 0, 1]);
        assert_eq!(&packet[4..12], &[0, 0, 0, 0, 0, 0, 0, 7]);
        assert_eq!(&packet[16..20], &0.5f32.to_be_bytes());
        assert_eq!(&packet[24..28], &1.0f32.to_be_bytes());
    }

    #[test]
    fn test_command_layouts() {
        let battery = OutboundPacket::BatteryLevel(0.75).encode(1);
        assert_eq!(battery.len(), 16);
        assert_eq!(&battery[0..4], &[0, 0, 0, 12]);
        assert_eq!(&battery[12..16], &0.75f32.to_be_bytes());

        let button = OutboundPacket::ButtonPushed.encode(2);
        assert_eq!(button.len(), 12);
        assert_eq!(&button[0..4], &[0, 0, 0, 60]);

        let mag = OutboundPacket::MagnetometerUse(false).encode(3);
        assert_eq!(mag.len(), 13);
        assert_eq!(&mag[0..4], &[0, 0, 0, 61]);
        assert_eq!(mag[12], b'n');

        let accel = OutboundPacket::Accel([1.0, 2.0, 3.0]).encode(4);
        assert_eq!(accel.len(), 24);
        assert_eq!(&accel[0..4], &[0, 0, 0, 4]);
    }

    #[test]
    fn test_battery_level_is_clamped() {
        let packet = OutboundPacket::BatteryLevel(-1.0).encode(0);
        assert_eq!(&packet[12..16], &0.0f32.to_be_bytes());
    }

    #[test]
    fn test_decode_vibrate_both_byte_orders() {
        let mut big = vec![0, 0, 0, 2];
        for v in [0.5f32, 120.0, 0.8] {
            big.extend_from_slice(&v.to_be_bytes());
        }
        let expected = InboundMessage::Vibrate {
            duration: 0.5,
            frequency: 120.0,
            amplitude: 0.8,
        };
        assert_eq!(InboundMessage::decode(&big, Endianness::Big), Ok(expected));

        let mut little = vec![2, 0, 0, 0];
        for v in [0.5f32, 120.0, 0.8] {
            little.extend_from_slice(&v.to_le_bytes());
        }
        assert_eq!(
            InboundMessage::decode(&little, Endianness::Little),
            Ok(expected)
        );
    }

    #[test]
    fn test_decode_short_datagrams() {
        assert_eq!(
            InboundMessage::decode(&[0, 1], Endianness::Big),
            Err(DecodeError::MissingType { actual: 2 })
        );
        assert!(matches!(
            InboundMessage::decode(&[0, 0, 0, 2, 1, 2], Endianness::Big),
            Err(DecodeError::TooShort { message_type: 2, .. })
        ));
    }

    #[test]
    fn test_decode_magnetometer_change() {
        assert_eq!(
            InboundMessage::decode(&[0, 0, 0, 62, b'y'], Endianness::Big),
            Ok(InboundMessage::ChangeMagnetometerStatus(true))
        );
        assert_eq!(
            InboundMessage::decode(&[0, 0, 0, 62, b'n', 0, 0, 0], Endianness::Big),
            Ok(InboundMessage::ChangeMagnetometerStatus(false))
        );
    }

    #[test]
    fn test_wrong_endianness_hint() {
        let msg = InboundMessage::decode(&[1, 0, 0, 0], Endianness::Big).unwrap();
        assert_eq!(msg, InboundMessage::Unknown(0x0100_0000));
        assert!(msg.suggests_wrong_endianness());
        assert!(!InboundMessage::Unknown(63).suggests_wrong_endianness());
        assert_eq!(
            InboundMessage::decode(&[1, 0, 0, 0], Endianness::Little),
            Ok(InboundMessage::Heartbeat)
        );
    }

    #[test]
    fn test_handshake_echo_detection() {
        assert!(is_handshake_response(b"\x03Hey OVR =D 5"));
        assert!(!is_handshake_response(&[0, 0, 0, 1]));
        assert!(!is_handshake_response(&[3]));
    }
}
