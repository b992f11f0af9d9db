// src/status.rs
// Connection status codes reported by managers and drivers

use serde::{Deserialize, Serialize};

/// Status codes surfaced through the status callback. Positive values are
/// progress, values >= 100 come from drivers, negative values are errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum StatusCode {
    Idle = 0,
    ConfigureForPairing = 1,
    PairingIdle = 2,
    Pairing = 3,
    ConfigureForConnecting = 4,
    Connecting = 5,
    Connected = 6,
    Disconnected = 7,
    Reconfiguring = 8,
    Reconfigured = 9,

    DriverNotConnected = 100,
    DriverConnected = 101,
    DriverWiredConnected = 102,

    ErrorStatus = -1,
    ErrorPairing = -2,
    ErrorConnecting = -3,
    ErrorReconfiguring = -4,

    ErrorDriverDetection = -100,
    ErrorDriverConnection = -101,
    ErrorDriverLogin = -102,
    ErrorDriverConfiguration = -103,
    ErrorDriverTimeout = -104,
}

impl StatusCode {
    pub fn value(self) -> i32 {
        self as i32
    }

    pub fn is_error(self) -> bool {
        self.value() < 0
    }

    /// Driver considers itself up (wired or wireless).
    pub fn is_driver_connected(self) -> bool {
        matches!(self, StatusCode::DriverConnected | StatusCode::DriverWiredConnected)
    }
}

/// A status update together with the driver instance or peer it refers to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub code: StatusCode,
    pub context: String,
}

impl ConnectionStatus {
    pub fn new(code: StatusCode, context: impl Into<String>) -> Self {
        Self { code, context: context.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_values() {
        assert_eq!(StatusCode::Idle.value(), 0);
        assert_eq!(StatusCode::Connected.value(), 6);
        assert_eq!(StatusCode::DriverConnected.value(), 101);
        assert_eq!(StatusCode::ErrorPairing.value(), -2);
        assert_eq!(StatusCode::ErrorDriverTimeout.value(), -104);
        assert!(StatusCode::ErrorReconfiguring.is_error());
        assert!(!StatusCode::Reconfigured.is_error());
        assert!(StatusCode::DriverWiredConnected.is_driver_connected());
        assert!(!StatusCode::DriverNotConnected.is_driver_connected());
    }
}
