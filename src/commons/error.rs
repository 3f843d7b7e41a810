//! Defines all signer side errors.

use std::{fmt, io};

use serde::{Deserialize, Serialize};

use crate::device::DeviceError;
use crate::tokens::{CertId, CertRequestId, KeyId, TokenId};

//------------ SignerIoError -------------------------------------------------

/// An IO error with a description of what was attempted.
#[derive(Debug)]
pub struct SignerIoError {
    context: String,
    cause: io::Error,
}

impl SignerIoError {
    pub fn new(context: impl Into<String>, cause: io::Error) -> Self {
        SignerIoError {
            context: context.into(),
            cause,
        }
    }

    pub fn cause(&self) -> &io::Error {
        &self.cause
    }
}

impl fmt::Display for SignerIoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "context: {}, underlying io::Error: {}", self.context, self.cause)
    }
}

//------------ ErrorKind -----------------------------------------------------

/// The kind of failure, as reported to callers.
///
/// Callers pattern-match on this rather than on [`Error`] itself, which
/// carries details that are only meant for humans.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    NotFound,
    AuthenticationFailed,
    DeviceUnavailable,
    DeviceBusy,
    UnsupportedOperation,
    Conflict,
    PersistenceFailure,
    InternalError,
    InvalidRequest,
    ShuttingDown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not-found",
            ErrorKind::AuthenticationFailed => "authentication-failed",
            ErrorKind::DeviceUnavailable => "device-unavailable",
            ErrorKind::DeviceBusy => "device-busy",
            ErrorKind::UnsupportedOperation => "unsupported-operation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::PersistenceFailure => "persistence-failure",
            ErrorKind::InternalError => "internal-error",
            ErrorKind::InvalidRequest => "invalid-request",
            ErrorKind::ShuttingDown => "shutting-down",
        };
        s.fmt(f)
    }
}

//------------ Error ---------------------------------------------------------

#[derive(Debug)]
pub enum Error {
    //-----------------------------------------------------------------
    // Lookups
    //-----------------------------------------------------------------
    TokenUnknown(TokenId),
    KeyUnknown(KeyId),
    CertUnknown(CertId),
    CertRequestUnknown(CertRequestId),
    DeviceKindUnknown(String),

    //-----------------------------------------------------------------
    // Ownership and state invariants
    //-----------------------------------------------------------------
    Conflict(String),

    //-----------------------------------------------------------------
    // Devices
    //-----------------------------------------------------------------
    Device(DeviceError),

    //-----------------------------------------------------------------
    // Persistence
    //-----------------------------------------------------------------
    StoreIo(SignerIoError),
    StoreCorrupt(String),

    //-----------------------------------------------------------------
    // Requests and lifecycle
    //-----------------------------------------------------------------
    InvalidRequest(String),
    ShuttingDown,

    //-----------------------------------------------------------------
    // Everything else
    //-----------------------------------------------------------------
    Internal(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::TokenUnknown(id) => write!(f, "Token '{}' not found", id),
            Error::KeyUnknown(id) => write!(f, "Key '{}' not found", id),
            Error::CertUnknown(id) => write!(f, "Certificate '{}' not found", id),
            Error::CertRequestUnknown(id) => write!(f, "Certificate request '{}' not found", id),
            Error::DeviceKindUnknown(kind) => write!(f, "No driver registered for device kind '{}'", kind),
            Error::Conflict(msg) => msg.fmt(f),
            Error::Device(e) => e.fmt(f),
            Error::StoreIo(e) => write!(f, "Could not persist token configuration: {}", e),
            Error::StoreCorrupt(msg) => write!(f, "Token configuration is corrupt: {}", msg),
            Error::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            Error::ShuttingDown => write!(f, "Signer is shutting down"),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::TokenUnknown(_)
            | Error::KeyUnknown(_)
            | Error::CertUnknown(_)
            | Error::CertRequestUnknown(_) => ErrorKind::NotFound,
            Error::DeviceKindUnknown(_) => ErrorKind::DeviceUnavailable,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Device(e) => e.kind(),
            Error::StoreIo(_) | Error::StoreCorrupt(_) => ErrorKind::PersistenceFailure,
            Error::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Error::ShuttingDown => ErrorKind::ShuttingDown,
            Error::Internal(_) => ErrorKind::InternalError,
        }
    }

    pub fn conflict(msg: impl fmt::Display) -> Self {
        Error::Conflict(msg.to_string())
    }

    pub fn invalid_request(msg: impl fmt::Display) -> Self {
        Error::InvalidRequest(msg.to_string())
    }

    pub fn internal(msg: impl fmt::Display) -> Self {
        Error::Internal(msg.to_string())
    }

    pub fn lock_poisoned(what: &str) -> Self {
        Error::Internal(format!("lock on {} is poisoned", what))
    }

    pub fn to_error_response(&self) -> ErrorResponse {
        ErrorResponse::new(self.kind(), self)
    }
}

impl std::error::Error for Error {}

impl From<DeviceError> for Error {
    fn from(e: DeviceError) -> Self {
        Error::Device(e)
    }
}

impl From<SignerIoError> for Error {
    fn from(e: SignerIoError) -> Self {
        Error::StoreIo(e)
    }
}

//------------ ErrorResponse -------------------------------------------------

/// A structured failure as handed back to the transport.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ErrorResponse {
    kind: ErrorKind,
    msg: String,
}

impl ErrorResponse {
    pub fn new(kind: ErrorKind, msg: impl fmt::Display) -> Self {
        ErrorResponse {
            kind,
            msg: msg.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn msg(&self) -> &str {
        &self.msg
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.msg)
    }
}

impl From<&Error> for ErrorResponse {
    fn from(e: &Error) -> Self {
        e.to_error_response()
    }
}

//------------ Tests ---------------------------------------------------------
