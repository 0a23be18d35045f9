use btleplug::api::bleuuid::uuid_from_u16;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Connection/streaming state of a single device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not connected
    #[default]
    Disconnected,
    /// Connection requested, not yet confirmed
    Connecting,
    /// Link established
    Connected,
    /// Force streaming is active
    Isometric,
    /// Link established, streaming stopped
    Stopped,
}

impl ConnectionState {
    /// Every state except `Disconnected` and `Connecting` counts as connected
    #[must_use]
    pub const fn is_connected(self) -> bool {
        !matches!(self, Self::Disconnected | Self::Connecting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Isometric => write!(f, "Isometric"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Aggregate state reported by the session manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManagerConnectionState {
    /// No scan running and no device connected
    Disconnected,
    /// Discovery is running
    Searching,
    /// At least one device is connected
    Connected,
}

/// Power state of the local radio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RadioState {
    /// State not reported yet
    #[default]
    Unknown,
    /// Radio is ready for discovery
    PoweredOn,
    /// Radio is switched off
    PoweredOff,
}

impl From<btleplug::api::CentralState> for RadioState {
    fn from(state: btleplug::api::CentralState) -> Self {
        match state {
            btleplug::api::CentralState::PoweredOn => Self::PoweredOn,
            btleplug::api::CentralState::PoweredOff => Self::PoweredOff,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for RadioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::PoweredOn => write!(f, "Powered On"),
            Self::PoweredOff => write!(f, "Powered Off"),
        }
    }
}

/// What the manager does when a device that wanted to stay connected drops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectPolicy {
    /// Reconnection is left to the caller
    Manual,
    /// Rediscovered devices are reconnected automatically
    #[default]
    Automatic,
}

/// Coarse squeeze edge state reported to observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SqueezeState {
    /// Force is above the pressed threshold
    Squeezed,
    /// Force fell below the depressed threshold
    #[default]
    Depressed,
}

/// Force thresholds used by the double-squeeze detector
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqueezeThreshold {
    /// A reading at or above this counts as pressed
    pub pressed: f64,
    /// A reading at or below this counts as released
    pub depressed: f64,
}

impl Default for SqueezeThreshold {
    fn default() -> Self {
        Self {
            pressed: 20.0,
            depressed: 5.0,
        }
    }
}

/// Service advertised by every Activ5 device, used as the discovery filter
pub const ACTIV5_SERVICE_UUID: Uuid = uuid_from_u16(0x5000);

/// Manager-wide configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerOptions {
    /// Service identifiers used to filter discovery
    pub services: Vec<Uuid>,
    /// Send the handshake automatically after the device greets
    pub auto_handshake: bool,
    /// Discovery timeout in milliseconds
    pub scan_timeout_ms: u64,
    /// Reconnection behaviour after an unexpected disconnect
    pub reconnect_policy: ReconnectPolicy,
    /// Double-squeeze thresholds
    pub squeeze_threshold: SqueezeThreshold,
    /// Evergreen keep-alive period in milliseconds
    pub keep_alive_interval_ms: u64,
    /// Double-squeeze gesture window in milliseconds
    pub squeeze_timeout_ms: u64,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            services: vec![ACTIV5_SERVICE_UUID],
            auto_handshake: true,
            scan_timeout_ms: 30_000,
            reconnect_policy: ReconnectPolicy::Automatic,
            squeeze_threshold: SqueezeThreshold::default(),
            keep_alive_interval_ms: 60_000,
            squeeze_timeout_ms: 5_000,
        }
    }
}

/// Six-axis motion snapshot
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ImuSample {
    /// Acceleration along X in g
    pub acceleration_x: f64,
    /// Acceleration along Y in g
    pub acceleration_y: f64,
    /// Acceleration along Z in g
    pub acceleration_z: f64,
    /// Angular rate around X in rad/s
    pub gyro_x: f64,
    /// Angular rate around Y in rad/s
    pub gyro_y: f64,
    /// Angular rate around Z in rad/s
    pub gyro_z: f64,
    /// Device timestamp in seconds
    pub timestamp: f64,
}

impl ImuSample {
    /// Gyro correction applied by the companion apps
    pub const ROTATION_SCALING: f64 = 1.15;

    /// Copy with the gyro components multiplied by [`Self::ROTATION_SCALING`]
    #[must_use]
    pub fn scaled(&self) -> Self {
        Self {
            gyro_x: self.gyro_x * Self::ROTATION_SCALING,
            gyro_y: self.gyro_y * Self::ROTATION_SCALING,
            gyro_z: self.gyro_z * Self::ROTATION_SCALING,
            ..*self
        }
    }
}

/// Opaque transport handle for a peripheral
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeripheralKey(pub String);

impl fmt::Display for PeripheralKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeripheralKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Read-only snapshot of a device session handed to observers and callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Advertised device name, the registry key
    pub name: String,
    /// Transport handle
    pub peripheral: PeripheralKey,
    /// Last signal strength in dB
    pub rssi: f64,
    /// Device speaks the binary per-channel protocol
    pub uses_new_protocol: bool,
    /// Connection state
    pub state: ConnectionState,
    /// Firmware version reported in the greeting
    pub device_version: Option<String>,
    /// Serial number
    pub serial_number: Option<String>,
    /// First UUID half
    pub uuid1: Option<String>,
    /// Second UUID half
    pub uuid2: Option<String>,
    /// Evergreen keep-alive is enabled
    pub evergreen: bool,
    /// The device should be reconnected after an unexpected drop
    pub should_reconnect: bool,
    /// Initialization has been reported
    pub initialized: bool,
}

impl DeviceInfo {
    /// Derived from [`Self::state`]
    #[must_use]
    pub const fn connected(&self) -> bool {
        self.state.is_connected()
    }

    /// Both UUID halves concatenated, once both are known
    #[must_use]
    pub fn uuid(&self) -> Option<String> {
        compose_uuid(self.uuid1.as_deref(), self.uuid2.as_deref())
    }
}

pub(crate) fn compose_uuid(first: Option<&str>, second: Option<&str>) -> Option<String> {
    match (first, second) {
        (Some(first), Some(second)) => Some(format!("{first}{second}")),
        _ => None,
    }
}
