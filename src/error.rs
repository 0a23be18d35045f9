use thiserror::Error;

/// Errors returned by Activ5 session operations
#[derive(Error, Debug)]
pub enum Activ5Error {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// No session is tracked under the given device name
    #[error("Activ5 device not found: {0}")]
    DeviceNotFound(String),

    /// The device does not expose the channel backing a feature
    #[error("{feature} is not supported by this device")]
    Unsupported {
        /// Feature that was requested
        feature: &'static str,
    },

    /// A value was requested before the device reported it
    #[error("{what} is not yet readable - retry after the pending read completes")]
    NotYetReadable {
        /// Value that is not available yet
        what: &'static str,
    },

    /// The radio is not powered on
    #[error("Bluetooth radio is unavailable")]
    RadioUnavailable,

    /// Transport request could not be issued
    #[error("Transport failure: {0}")]
    Transport(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for Activ5 operations
pub type Result<T> = std::result::Result<T, Activ5Error>;

impl Activ5Error {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_) | Self::Transport(_) | Self::RadioUnavailable | Self::DeviceNotFound(_)
        )
    }

    /// Check if retrying the same call later can succeed
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::NotYetReadable { .. } | Self::RadioUnavailable)
    }

    pub(crate) const fn motion_unsupported() -> Self {
        Self::Unsupported { feature: "motion" }
    }

    pub(crate) const fn battery_unsupported() -> Self {
        Self::Unsupported { feature: "battery" }
    }

    pub(crate) const fn battery_not_readable() -> Self {
        Self::NotYetReadable { what: "battery level" }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let transport_error = Activ5Error::Transport("write rejected".to_string());
        assert!(transport_error.is_connection_error());
        assert!(!transport_error.is_recoverable());

        let battery = Activ5Error::battery_not_readable();
        assert!(!battery.is_connection_error());
        assert!(battery.is_recoverable());

        let motion = Activ5Error::motion_unsupported();
        assert!(!motion.is_connection_error());
        assert!(!motion.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let error = Activ5Error::motion_unsupported();
        assert_eq!(format!("{error}"), "motion is not supported by this device");

        let error = Activ5Error::DeviceNotFound("ACTIV5-AP-0042".to_string());
        assert!(format!("{error}").contains("ACTIV5-AP-0042"));
    }
}
