//! Conversions between raw sensor codes and physical units.
//!
//! The accelerometer and the gyroscope share the same full-scale code
//! (`0x0FFF`): 1 g and 250 dps respectively. The device clock ticks every
//! 30.5 µs and the reported counter is doubled.

use std::f64::consts::PI;

/// Raw code for 1 g of acceleration or 250 dps of rotation
pub const FULL_SCALE_CODE: f64 = 4095.0;

/// Angular rate in degrees per second mapped onto [`FULL_SCALE_CODE`]
pub const GYRO_FULL_SCALE_DPS: f64 = 250.0;

/// Device clock resolution in microseconds
pub const TIMESTAMP_RESOLUTION_US: f64 = 30.5;

/// Newtons per raw force unit on the binary protocol
pub const NEWTONS_PER_UNIT: f64 = 0.271_563_159_09;

/// Newtons per raw force unit on the legacy text protocol
pub const NEWTONS_PER_UNIT_LEGACY: f64 = 1.086_252_636_33;

/// Pound-force per raw force unit on the binary protocol
pub const LBF_PER_UNIT: f64 = 0.061_049_826_989_619_4;

/// Pound-force per raw force unit on the legacy text protocol
pub const LBF_PER_UNIT_LEGACY: f64 = 0.244_199_307_95;

const RAD_PER_CODE: f64 = (GYRO_FULL_SCALE_DPS / FULL_SCALE_CODE) * (PI / 180.0);

/// Raw accelerometer code to g
#[must_use]
pub fn to_g_force(raw: i32) -> f64 {
    f64::from(raw) / FULL_SCALE_CODE
}

/// Raw gyroscope code to radians per second
#[must_use]
pub fn to_rad_per_sec(raw: i32) -> f64 {
    f64::from(raw) * RAD_PER_CODE
}

/// Raw timestamp counter to seconds
#[must_use]
pub fn to_sec(raw: i32) -> f64 {
    f64::from(raw) * TIMESTAMP_RESOLUTION_US / 1_000_000.0 / 2.0
}

/// g to raw accelerometer code, truncating toward zero
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn from_g_force(g: f64) -> i32 {
    (g * FULL_SCALE_CODE) as i32
}

/// Radians per second to raw gyroscope code, truncating toward zero
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn from_rad_per_sec(rad_per_sec: f64) -> i32 {
    (rad_per_sec / RAD_PER_CODE) as i32
}

/// Seconds to raw timestamp counter, truncating toward zero
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn from_sec(seconds: f64) -> i32 {
    (seconds / TIMESTAMP_RESOLUTION_US * 1_000_000.0 * 2.0) as i32
}

/// Binary-protocol force reading to Newtons
#[must_use]
pub fn to_newtons(raw: f64) -> f64 {
    raw * NEWTONS_PER_UNIT
}

/// Legacy-protocol force reading to Newtons
#[must_use]
pub fn to_newtons_legacy(raw: f64) -> f64 {
    raw * NEWTONS_PER_UNIT_LEGACY
}

/// Binary-protocol force reading to pound-force
#[must_use]
pub fn to_lbf(raw: f64) -> f64 {
    raw * LBF_PER_UNIT
}

/// Legacy-protocol force reading to pound-force
#[must_use]
pub fn to_lbf_legacy(raw: f64) -> f64 {
    raw * LBF_PER_UNIT_LEGACY
}
