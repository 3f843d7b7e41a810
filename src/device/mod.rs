//! Cryptographic devices: the capability interface the registry uses to
//! act on tokens, and the drivers behind it.
use std::fmt;

use bytes::Bytes;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::tokens::{KeyId, TokenId, TokenStatus};

mod error;
pub use self::error::DeviceError;

pub mod dispatch;
pub use self::dispatch::{provider::DeviceProvider, router::DeviceRouter};

pub mod drivers;

//------------ Pin -----------------------------------------------------------

/// A token PIN. Never logged, serialized or persisted.
#[derive(Clone, Deserialize)]
#[serde(transparent)]
pub struct Pin(SecretString);

impl Pin {
    pub fn new(pin: impl Into<String>) -> Self {
        Pin(SecretString::new(pin.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    pub fn is_empty(&self) -> bool {
        self.0.expose_secret().is_empty()
    }
}

impl From<&str> for Pin {
    fn from(s: &str) -> Self {
        Pin::new(s)
    }
}

impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Pin(***)")
    }
}

//------------ DeviceTokenState ----------------------------------------------

/// The state of a token as seen by its driver.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeviceTokenState {
    Uninitialized,
    Locked,
    Unlocked,

    /// Temporarily not reachable, e.g. removed from its slot.
    Absent,

    /// Permanently gone. The registry forgets the token.
    Gone,
}

impl DeviceTokenState {
    pub fn token_status(self) -> TokenStatus {
        match self {
            DeviceTokenState::Uninitialized => TokenStatus::Uninitialized,
            DeviceTokenState::Locked => TokenStatus::PresentLocked,
            DeviceTokenState::Unlocked => TokenStatus::PresentUnlocked,
            DeviceTokenState::Absent | DeviceTokenState::Gone => TokenStatus::NotPresent,
        }
    }
}

//------------ DeviceToken ---------------------------------------------------

/// A token as reported by a driver.
#[derive(Clone, Debug)]
pub struct DeviceToken {
    pub id: TokenId,
    pub label: String,
    pub state: DeviceTokenState,

    /// The keys on the token, if the driver could list them. Locked
    /// hardware tokens generally cannot be listed.
    pub keys: Option<Vec<DeviceKey>>,
}

//------------ DeviceKey -----------------------------------------------------

/// A key as found on, or generated by, a device.
#[derive(Clone, Debug)]
pub struct DeviceKey {
    pub id: KeyId,
    pub label: Option<String>,

    /// DER encoded certificates stored on the device for this key.
    pub certs: Vec<Bytes>,
}
