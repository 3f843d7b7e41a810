use std::fmt;

use openssl::error::ErrorStack;

use crate::commons::error::{ErrorKind, SignerIoError};

/// A failure reported by a device driver.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DeviceError {
    DeviceUnavailable(String),
    AuthenticationFailed(String),
    DeviceBusy(String),
    UnsupportedOperation(String),
    KeyNotFound(String),
    InvalidState(String),
    Other(String),
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DeviceError::DeviceUnavailable(e) => write!(f, "Device unavailable: {}", e),
            DeviceError::AuthenticationFailed(e) => write!(f, "Authentication failed: {}", e),
            DeviceError::DeviceBusy(e) => write!(f, "Device busy: {}", e),
            DeviceError::UnsupportedOperation(e) => write!(f, "Unsupported operation: {}", e),
            DeviceError::KeyNotFound(key) => write!(f, "Key '{}' not found on device", key),
            DeviceError::InvalidState(e) => write!(f, "Device in wrong state: {}", e),
            DeviceError::Other(e) => write!(f, "Device error: {}", e),
        }
    }
}

impl DeviceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeviceError::DeviceUnavailable(_) => ErrorKind::DeviceUnavailable,
            DeviceError::AuthenticationFailed(_) => ErrorKind::AuthenticationFailed,
            DeviceError::DeviceBusy(_) => ErrorKind::DeviceBusy,
            DeviceError::UnsupportedOperation(_) => ErrorKind::UnsupportedOperation,
            DeviceError::KeyNotFound(_) => ErrorKind::NotFound,
            DeviceError::InvalidState(_) => ErrorKind::Conflict,
            DeviceError::Other(_) => ErrorKind::InternalError,
        }
    }

    pub fn unsupported(what: impl fmt::Display) -> Self {
        DeviceError::UnsupportedOperation(what.to_string())
    }

    pub fn not_active(token: impl fmt::Display) -> Self {
        DeviceError::AuthenticationFailed(format!("token '{}' is not active", token))
    }
}

impl From<ErrorStack> for DeviceError {
    fn from(e: ErrorStack) -> Self {
        DeviceError::Other(format!("OpenSsl Error: {}", e))
    }
}

impl From<SignerIoError> for DeviceError {
    fn from(e: SignerIoError) -> Self {
        DeviceError::Other(e.to_string())
    }
}
