use crate::{
    types::ImuSample,
    units::{to_g_force, to_newtons, to_newtons_legacy, to_rad_per_sec, to_sec},
};
use btleplug::api::bleuuid::{uuid_from_u16, BleUuid};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use uuid::Uuid;

/// Service whose presence marks a device speaking the binary protocol
pub const NEW_PROTOCOL_SERVICE_UUID: Uuid = uuid_from_u16(0xF0F0);

/// Size of a binary IMU frame in bytes
pub const IMU_FRAME_SIZE: usize = 16;

/// Greeting token sent by the device on the legacy read channel
pub const HANDSHAKE_TOKEN: &str = "TC5k";

/// Isometric reading prefix on the legacy read channel
pub const ISOMETRIC_TOKEN: &str = "IS";

const FRAME_START: u8 = b'A';
const FRAME_END: u8 = 0x13;
const LEGACY_CONTROL_CHARS: [char; 2] = ['\u{12}', '\u{13}'];

/// Logical data path on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Legacy text notifications
    Read,
    /// Command channel
    Write,
    /// Binary force readings
    Force,
    /// Raw device timestamp
    Timestamp,
    /// Binary IMU frames
    Imu,
    /// First UUID half
    Uuid1,
    /// Second UUID half
    Uuid2,
    /// First serial-number fragment
    Sn1,
    /// Second serial-number fragment
    Sn2,
    /// Sample interval control
    SampleRate,
    /// Battery percentage
    Battery,
    /// Full serial number
    SerialNumber,
    /// Anything not listed above
    Unknown,
}

impl Channel {
    /// Published identifier for this channel
    #[must_use]
    pub const fn identifier(self) -> &'static str {
        match self {
            Self::Read => "5A01",
            Self::Write => "5A02",
            Self::Force => "F0FE",
            Self::Timestamp => "F0F3",
            Self::Imu => "F0F5",
            Self::Uuid1 => "F0F7",
            Self::Uuid2 => "F0F8",
            Self::Sn1 => "SN1",
            Self::Sn2 => "SN2",
            Self::SampleRate => "F0FA",
            Self::Battery => "2A19",
            Self::SerialNumber => "2A25",
            Self::Unknown => "FFFF",
        }
    }

    /// Resolve a published identifier, case-insensitively
    #[must_use]
    pub fn from_identifier(identifier: &str) -> Self {
        const ALL: [Channel; 12] = [
            Channel::Read,
            Channel::Write,
            Channel::Force,
            Channel::Timestamp,
            Channel::Imu,
            Channel::Uuid1,
            Channel::Uuid2,
            Channel::Sn1,
            Channel::Sn2,
            Channel::SampleRate,
            Channel::Battery,
            Channel::SerialNumber,
        ];

        ALL.into_iter()
            .find(|channel| channel.identifier().eq_ignore_ascii_case(identifier))
            .unwrap_or(Self::Unknown)
    }

    /// Resolve a characteristic UUID; only 16-bit UUIDs on the Bluetooth base are known
    #[must_use]
    pub fn from_uuid(uuid: &Uuid) -> Self {
        uuid.to_ble_u16()
            .map_or(Self::Unknown, |short| Self::from_identifier(&format!("{short:04X}")))
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.identifier())
    }
}

/// Tag of a decoded message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Greeting carrying the firmware version
    Handshake,
    /// Force reading in Newtons
    Isometric,
    /// Raw device timestamp
    Timestamp,
    /// Motion sample
    Imu,
    /// First serial-number fragment
    Sn1,
    /// Second serial-number fragment
    Sn2,
    /// First UUID half
    Uuid1,
    /// Second UUID half
    Uuid2,
    /// Battery percentage
    Battery,
    /// Full serial number
    SerialNumber,
    /// Unrecognised or malformed payload
    Unknown,
}

impl MessageKind {
    /// Stable lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Handshake => "handshake",
            Self::Isometric => "isometric",
            Self::Timestamp => "timestamp",
            Self::Imu => "imu",
            Self::Sn1 => "sn1",
            Self::Sn2 => "sn2",
            Self::Uuid1 => "uuid1",
            Self::Uuid2 => "uuid2",
            Self::Battery => "battery",
            Self::SerialNumber => "serial_number",
            Self::Unknown => "unknown",
        }
    }

    /// Classify the first field of a legacy text message
    #[must_use]
    pub fn classify_legacy(field: &str) -> Self {
        if field.starts_with(HANDSHAKE_TOKEN) {
            return Self::Handshake;
        }
        if field.starts_with(ISOMETRIC_TOKEN) {
            return Self::Isometric;
        }

        let mut chars = field.chars();
        if chars.next().is_none() {
            return Self::Unknown;
        }
        let rest = chars.as_str();

        if rest.starts_with('i') {
            Self::Uuid1
        } else if rest.starts_with('I') {
            Self::Uuid2
        } else if rest.starts_with("SN1") {
            Self::Sn1
        } else if rest.starts_with("SN2") {
            Self::Sn2
        } else {
            Self::Unknown
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload carried by a decoded message
#[derive(Debug, Clone, PartialEq)]
pub enum MessageValue {
    /// Text value
    Text(String),
    /// Integer value
    Integer(u64),
    /// Motion sample
    Imu(ImuSample),
}

/// A decoded device message
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Message tag
    pub kind: MessageKind,
    /// Decoded value, if any
    pub value: Option<MessageValue>,
}

impl Message {
    /// Create a message
    #[must_use]
    pub const fn new(kind: MessageKind, value: Option<MessageValue>) -> Self {
        Self { kind, value }
    }

    /// Unknown message without a value
    #[must_use]
    pub const fn unknown() -> Self {
        Self::new(MessageKind::Unknown, None)
    }

    fn text(kind: MessageKind, text: impl Into<String>) -> Self {
        Self::new(kind, Some(MessageValue::Text(text.into())))
    }

    /// Text value, if the message carries one
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match &self.value {
            Some(MessageValue::Text(text)) => Some(text),
            _ => None,
        }
    }

    /// Integer value, if the message carries one
    #[must_use]
    pub const fn as_integer(&self) -> Option<u64> {
        match self.value {
            Some(MessageValue::Integer(value)) => Some(value),
            _ => None,
        }
    }

    /// Motion sample, if the message carries one
    #[must_use]
    pub const fn as_imu(&self) -> Option<&ImuSample> {
        match &self.value {
            Some(MessageValue::Imu(sample)) => Some(sample),
            _ => None,
        }
    }
}

/// Decode a payload received on `channel`
///
/// Never fails: absent, truncated or malformed payloads decode to
/// [`MessageKind::Unknown`] without a value.
#[must_use]
pub fn decode(channel: Channel, payload: Option<&[u8]>) -> Message {
    let Some(data) = payload else {
        return Message::unknown();
    };

    match channel {
        Channel::Read => decode_legacy(std::str::from_utf8(data).ok()),
        Channel::Force => parse_force(data).map_or_else(Message::unknown, |raw| {
            let newtons = to_newtons(f64::from(raw));
            Message::text(MessageKind::Isometric, newtons.to_string())
        }),
        Channel::Imu => parse_imu(data).map_or_else(Message::unknown, |sample| {
            Message::new(MessageKind::Imu, Some(MessageValue::Imu(sample)))
        }),
        Channel::Battery => parse_battery(data).map_or_else(Message::unknown, |percentage| {
            Message::new(MessageKind::Battery, Some(MessageValue::Integer(percentage)))
        }),
        Channel::SerialNumber => decode_text(MessageKind::SerialNumber, data),
        Channel::Uuid1 => decode_text(MessageKind::Uuid1, data),
        Channel::Uuid2 => decode_text(MessageKind::Uuid2, data),
        Channel::Sn1 => decode_text(MessageKind::Sn1, data),
        Channel::Sn2 => decode_text(MessageKind::Sn2, data),
        Channel::Unknown => decode_text(MessageKind::Unknown, data),
        Channel::Write | Channel::Timestamp | Channel::SampleRate => Message::unknown(),
    }
}

fn decode_text(kind: MessageKind, data: &[u8]) -> Message {
    let value = std::str::from_utf8(data)
        .ok()
        .map(|text| MessageValue::Text(text.to_string()));
    Message::new(kind, value)
}

/// Decode a legacy `;`-delimited text message
///
/// Layout: `<0x12>FIELD0;FIELD1;...<0x13>`. The control characters are
/// stripped before the first field is classified.
#[must_use]
pub fn decode_legacy(message: Option<&str>) -> Message {
    let Some(message) = message else {
        return Message::unknown();
    };

    let cleaned = message.replace(LEGACY_CONTROL_CHARS, "");
    let mut fields = cleaned.split(';');
    let first = fields.next().unwrap_or_default();

    match MessageKind::classify_legacy(first) {
        MessageKind::Handshake => fields
            .next()
            .map_or_else(Message::unknown, |version| {
                Message::text(MessageKind::Handshake, version)
            }),
        MessageKind::Isometric => parse_legacy_isometric(first).map_or_else(Message::unknown, |newtons| {
            Message::text(MessageKind::Isometric, newtons.to_string())
        }),
        kind @ (MessageKind::Uuid1 | MessageKind::Uuid2) => {
            Message::text(kind, first.chars().skip(2).collect::<String>())
        }
        kind @ (MessageKind::Sn1 | MessageKind::Sn2) => {
            Message::text(kind, first.chars().skip(4).collect::<String>())
        }
        _ => Message::unknown(),
    }
}

/// `IS<value>/<...>` to Newtons
///
/// A field without `/` is rejected; an unparsable number reads as zero.
fn parse_legacy_isometric(field: &str) -> Option<f64> {
    let body = field.strip_prefix(ISOMETRIC_TOKEN)?;
    let Some((value, _)) = body.split_once('/') else {
        tracing::warn!("Legacy isometric message without '/': {field:?}");
        return None;
    };
    let raw = value.trim().parse::<f64>().unwrap_or(0.0);
    Some(to_newtons_legacy(raw))
}

/// Little-endian signed 16-bit value from the start of `data`
#[must_use]
pub fn parse_force(data: &[u8]) -> Option<i16> {
    if data.len() < 2 {
        return None;
    }
    let mut buf = data;
    Some(buf.get_i16_le())
}

/// Decode a 16-byte IMU frame
///
/// Layout (little-endian):
/// - Bytes 0-5: acceleration X, Y, Z (i16)
/// - Bytes 6-11: gyro X, Y, Z (i16)
/// - Bytes 12-15: timestamp counter (i32)
#[must_use]
pub fn parse_imu(data: &[u8]) -> Option<ImuSample> {
    if data.len() != IMU_FRAME_SIZE {
        return None;
    }

    let mut buf = data;
    let acceleration_x = to_g_force(i32::from(buf.get_i16_le()));
    let acceleration_y = to_g_force(i32::from(buf.get_i16_le()));
    let acceleration_z = to_g_force(i32::from(buf.get_i16_le()));
    let gyro_x = to_rad_per_sec(i32::from(buf.get_i16_le()));
    let gyro_y = to_rad_per_sec(i32::from(buf.get_i16_le()));
    let gyro_z = to_rad_per_sec(i32::from(buf.get_i16_le()));
    let timestamp = to_sec(buf.get_i32_le());

    Some(ImuSample {
        acceleration_x,
        acceleration_y,
        acceleration_z,
        gyro_x,
        gyro_y,
        gyro_z,
        timestamp,
    })
}

/// Battery payload read as the hexadecimal number formed by its bytes
fn parse_battery(data: &[u8]) -> Option<u64> {
    if data.is_empty() {
        return None;
    }
    data.iter()
        .try_fold(0u64, |acc, &byte| acc.checked_mul(0x100)?.checked_add(u64::from(byte)))
}

/// Text commands understood by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Request the greeting and firmware version
    Handshake,
    /// Start legacy force streaming
    StartIsometric,
    /// Zero the force sensor
    Tare,
    /// Stop streaming
    Stop,
    /// Request the first serial-number fragment
    Sn1,
    /// Request the second serial-number fragment
    Sn2,
    /// Request the first UUID half
    Uuid1,
    /// Request the second UUID half
    Uuid2,
    /// Request the battery level
    Battery,
    /// Request the serial number
    SerialNumber,
}

impl Command {
    /// Wire token
    #[must_use]
    pub const fn token(self) -> &'static str {
        match self {
            Self::Handshake => "TVGTIME",
            Self::StartIsometric => "ISOM!",
            Self::Tare => "TARE!",
            Self::Stop => "STOP!",
            Self::Sn1 => "SN1!",
            Self::Sn2 => "SN2!",
            Self::Uuid1 => "ID1!",
            Self::Uuid2 => "ID2!",
            Self::Battery => "2A19",
            Self::SerialNumber => "2A25",
        }
    }

    /// Framed bytes: `A<token>` followed by `0x13`
    #[must_use]
    pub fn to_frame(self) -> Bytes {
        let token = self.token();
        let mut buf = BytesMut::with_capacity(token.len() + 2);
        buf.put_u8(FRAME_START);
        buf.extend_from_slice(token.as_bytes());
        buf.put_u8(FRAME_END);
        buf.freeze()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(data: &str) -> Vec<u8> {
        (0..data.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&data[i..i + 2], 16).unwrap())
            .collect()
    }

    #[test]
    fn test_channel_identifiers() {
        assert_eq!(Channel::from_identifier("5A01"), Channel::Read);
        assert_eq!(Channel::from_identifier("f0fe"), Channel::Force);
        assert_eq!(Channel::from_identifier("SN2"), Channel::Sn2);
        assert_eq!(Channel::from_identifier("1234"), Channel::Unknown);

        assert_eq!(Channel::from_uuid(&uuid_from_u16(0xF0F5)), Channel::Imu);
        assert_eq!(Channel::from_uuid(&uuid_from_u16(0x2A19)), Channel::Battery);
        assert_eq!(Channel::from_uuid(&Uuid::nil()), Channel::Unknown);
    }

    #[test]
    fn test_legacy_handshake() {
        let message = decode_legacy(Some("\u{12}TC5k;1.00;04;BATOK\u{13}"));
        assert_eq!(message.kind, MessageKind::Handshake);
        assert_eq!(message.as_text(), Some("1.00"));
    }

    #[test]
    fn test_legacy_handshake_on_read_channel() {
        let message = decode(Channel::Read, Some(b"\x12TC5k;1.00;04;BATOK\x13"));
        assert_eq!(message.kind, MessageKind::Handshake);
        assert_eq!(message.as_text(), Some("1.00"));
    }

    #[test]
    fn test_legacy_isometric() {
        let message = decode_legacy(Some("\u{12}IS9/IS\u{13}01;04;BATOK\u{13}"));
        assert_eq!(message.kind, MessageKind::Isometric);

        let newtons: f64 = message.as_text().unwrap().parse().unwrap();
        assert!((newtons - 9.0 * 1.086_252_636_33).abs() < 1e-9);
    }

    #[test]
    fn test_legacy_isometric_unparsable_value_is_zero() {
        let message = decode_legacy(Some("ISabc/IS"));
        assert_eq!(message.kind, MessageKind::Isometric);
        assert_eq!(message.as_text(), Some("0"));
    }

    #[test]
    fn test_legacy_isometric_without_slash_is_rejected() {
        let message = decode_legacy(Some("IS9;01;04"));
        assert_eq!(message, Message::unknown());
    }

    #[test]
    fn test_legacy_identity_fragments() {
        let uuid1 = decode_legacy(Some("\u{12}Ai1234abcd\u{13}"));
        assert_eq!(uuid1.kind, MessageKind::Uuid1);
        assert_eq!(uuid1.as_text(), Some("1234abcd"));

        let uuid2 = decode_legacy(Some("\u{12}AIef56\u{0}\u{0}\u{13}"));
        assert_eq!(uuid2.kind, MessageKind::Uuid2);
        assert_eq!(uuid2.as_text(), Some("ef56\u{0}\u{0}"));

        let sn1 = decode_legacy(Some("ASN1A5-00;x"));
        assert_eq!(sn1.kind, MessageKind::Sn1);
        assert_eq!(sn1.as_text(), Some("A5-00"));

        let sn2 = decode_legacy(Some("ASN21234"));
        assert_eq!(sn2.kind, MessageKind::Sn2);
        assert_eq!(sn2.as_text(), Some("1234"));
    }

    #[test]
    fn test_invalid_legacy_messages() {
        assert_eq!(decode_legacy(None), Message::unknown());
        assert_eq!(decode_legacy(Some("Some invalid message")), Message::unknown());
        assert_eq!(decode_legacy(Some("")), Message::unknown());
        assert_eq!(decode_legacy(Some("TC5k")), Message::unknown());
    }

    #[test]
    fn test_binary_force() {
        let message = decode(Channel::Force, Some(&[0x00, 0xFF]));
        assert_eq!(message.kind, MessageKind::Isometric);

        let newtons: f64 = message.as_text().unwrap().parse().unwrap();
        assert!((newtons - f64::from(-256_i16) * 0.271_563_159_09).abs() < 1e-9);

        assert_eq!(decode(Channel::Force, Some(&[0x01])), Message::unknown());
    }

    #[test]
    fn test_imu_frame_vector() {
        let sample = parse_imu(&hex("FF0FFE1FFF07FF0FFE1FFF0792090907")).unwrap();

        assert!((sample.acceleration_x - 1.0).abs() < 0.01);
        assert!((sample.acceleration_y - 2.0).abs() < 0.01);
        assert!((sample.acceleration_z - 0.5).abs() < 0.01);
        assert!((sample.gyro_x - 4.36).abs() < 0.01);
        assert!((sample.gyro_y - 8.72).abs() < 0.01);
        assert!((sample.gyro_z - 2.18).abs() < 0.01);
        assert!((sample.timestamp - 1800.0).abs() < 0.001);
    }

    #[test]
    fn test_imu_channel() {
        let message = decode(Channel::Imu, Some(&hex("3E00F2FEAB10F6FFDEFFECFFE22A1600")));
        assert_eq!(message.kind, MessageKind::Imu);
        assert!(message.as_imu().is_some());

        assert_eq!(decode(Channel::Imu, Some(&[0u8; 15])), Message::unknown());
        assert_eq!(decode(Channel::Imu, Some(&[0u8; 17])), Message::unknown());
    }

    #[test]
    fn test_battery_channel() {
        let message = decode(Channel::Battery, Some(&[0x5A]));
        assert_eq!(message.kind, MessageKind::Battery);
        assert_eq!(message.as_integer(), Some(90));

        assert_eq!(decode(Channel::Battery, Some(&[0x01, 0x00])).as_integer(), Some(256));
        assert_eq!(decode(Channel::Battery, Some(&[])), Message::unknown());
        assert_eq!(decode(Channel::Battery, Some(&[0xFF; 9])), Message::unknown());
    }

    #[test]
    fn test_text_channels() {
        let serial = decode(Channel::SerialNumber, Some(b"A5-0042"));
        assert_eq!(serial.kind, MessageKind::SerialNumber);
        assert_eq!(serial.as_text(), Some("A5-0042"));

        assert_eq!(decode(Channel::Uuid1, Some(b"abcd")).kind, MessageKind::Uuid1);
        assert_eq!(decode(Channel::Uuid2, Some(b"ef01")).kind, MessageKind::Uuid2);
        assert_eq!(decode(Channel::Sn1, Some(b"A5")).kind, MessageKind::Sn1);
        assert_eq!(decode(Channel::Sn2, Some(b"42")).kind, MessageKind::Sn2);

        let invalid = decode(Channel::SerialNumber, Some(&[0xFF, 0xFE]));
        assert_eq!(invalid.kind, MessageKind::SerialNumber);
        assert!(invalid.value.is_none());
    }

    #[test]
    fn test_absent_payload_is_unknown() {
        for channel in [
            Channel::Read,
            Channel::Force,
            Channel::Imu,
            Channel::Battery,
            Channel::SerialNumber,
            Channel::Uuid1,
            Channel::Unknown,
        ] {
            assert_eq!(decode(channel, None), Message::unknown(), "channel {channel}");
        }
    }

    #[test]
    fn test_unrecognized_channel_is_unknown() {
        let channel = Channel::from_identifier("1234");
        assert_eq!(decode(channel, Some(&[0x00, 0xFF])), Message::unknown());

        let text = decode(channel, Some(b"IS9/IS"));
        assert_eq!(text.kind, MessageKind::Unknown);
        assert_eq!(text.as_text(), Some("IS9/IS"));

        assert_eq!(decode(Channel::Timestamp, Some(&[1, 2, 3, 4])), Message::unknown());
    }

    #[test]
    fn test_command_frame() {
        assert_eq!(&Command::Stop.to_frame()[..], b"ASTOP!\x13");
        assert_eq!(&Command::Handshake.to_frame()[..], b"ATVGTIME\x13");
        assert_eq!(Command::Uuid2.to_frame().len(), Command::Uuid2.token().len() + 2);
    }
}
