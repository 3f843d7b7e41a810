use bytes::Bytes;

use crate::{
    device::{
        drivers::{hsm::HsmDriver, softtoken::SoftTokenDriver},
        DeviceError, DeviceKey, DeviceToken, Pin,
    },
    tokens::{DeviceKind, KeyId, TokenId},
};

#[cfg(test)]
use crate::device::drivers::mock::MockDriver;

//------------ DeviceProvider ------------------------------------------------

/// Dispatches device requests to a particular driver.
///
/// The set of drivers is known at build time, so this is a closed enum
/// rather than a trait object.
#[derive(Debug)]
pub enum DeviceProvider {
    SoftToken(SoftTokenDriver),

    Hsm(HsmDriver),

    #[cfg(test)]
    Mock(MockDriver),
}

impl DeviceProvider {
    pub fn kind(&self) -> DeviceKind {
        match self {
            DeviceProvider::SoftToken(driver) => driver.kind(),
            DeviceProvider::Hsm(driver) => driver.kind(),
            #[cfg(test)]
            DeviceProvider::Mock(driver) => driver.kind(),
        }
    }

    /// Reports the tokens currently known to the driver.
    ///
    /// Side-effect free, so it may be called without holding the registry.
    pub fn list_tokens(&self) -> Result<Vec<DeviceToken>, DeviceError> {
        match self {
            DeviceProvider::SoftToken(driver) => driver.list_tokens(),
            DeviceProvider::Hsm(driver) => driver.list_tokens(),
            #[cfg(test)]
            DeviceProvider::Mock(driver) => driver.list_tokens(),
        }
    }

    pub fn init_token(&self, token_id: &TokenId, pin: &Pin) -> Result<(), DeviceError> {
        match self {
            DeviceProvider::SoftToken(driver) => driver.init_token(token_id, pin),
            DeviceProvider::Hsm(driver) => driver.init_token(token_id, pin),
            #[cfg(test)]
            DeviceProvider::Mock(driver) => driver.init_token(token_id, pin),
        }
    }

    pub fn activate(&self, token_id: &TokenId, pin: &Pin) -> Result<(), DeviceError> {
        match self {
            DeviceProvider::SoftToken(driver) => driver.activate(token_id, pin),
            DeviceProvider::Hsm(driver) => driver.activate(token_id, pin),
            #[cfg(test)]
            DeviceProvider::Mock(driver) => driver.activate(token_id, pin),
        }
    }

    pub fn deactivate(&self, token_id: &TokenId) -> Result<(), DeviceError> {
        match self {
            DeviceProvider::SoftToken(driver) => driver.deactivate(token_id),
            DeviceProvider::Hsm(driver) => driver.deactivate(token_id),
            #[cfg(test)]
            DeviceProvider::Mock(driver) => driver.deactivate(token_id),
        }
    }

    pub fn change_pin(&self, token_id: &TokenId, old_pin: &Pin, new_pin: &Pin) -> Result<(), DeviceError> {
        match self {
            DeviceProvider::SoftToken(driver) => driver.change_pin(token_id, old_pin, new_pin),
            DeviceProvider::Hsm(driver) => driver.change_pin(token_id, old_pin, new_pin),
            #[cfg(test)]
            DeviceProvider::Mock(driver) => driver.change_pin(token_id, old_pin, new_pin),
        }
    }

    pub fn generate_key(&self, token_id: &TokenId, label: Option<&str>) -> Result<DeviceKey, DeviceError> {
        match self {
            DeviceProvider::SoftToken(driver) => driver.generate_key(token_id, label),
            DeviceProvider::Hsm(driver) => driver.generate_key(token_id, label),
            #[cfg(test)]
            DeviceProvider::Mock(driver) => driver.generate_key(token_id, label),
        }
    }

    pub fn delete_key(&self, token_id: &TokenId, key_id: &KeyId) -> Result<(), DeviceError> {
        match self {
            DeviceProvider::SoftToken(driver) => driver.delete_key(token_id, key_id),
            DeviceProvider::Hsm(driver) => driver.delete_key(token_id, key_id),
            #[cfg(test)]
            DeviceProvider::Mock(driver) => driver.delete_key(token_id, key_id),
        }
    }

    pub fn sign(&self, token_id: &TokenId, key_id: &KeyId, data: &[u8]) -> Result<Bytes, DeviceError> {
        match self {
            DeviceProvider::SoftToken(driver) => driver.sign(token_id, key_id, data),
            DeviceProvider::Hsm(driver) => driver.sign(token_id, key_id, data),
            #[cfg(test)]
            DeviceProvider::Mock(driver) => driver.sign(token_id, key_id, data),
        }
    }

    pub fn import_cert(&self, token_id: &TokenId, key_id: &KeyId, der: &[u8]) -> Result<(), DeviceError> {
        match self {
            DeviceProvider::SoftToken(driver) => driver.import_cert(token_id, key_id, der),
            DeviceProvider::Hsm(driver) => driver.import_cert(token_id, key_id, der),
            #[cfg(test)]
            DeviceProvider::Mock(driver) => driver.import_cert(token_id, key_id, der),
        }
    }

    pub fn delete_cert(&self, token_id: &TokenId, key_id: &KeyId, der: &[u8]) -> Result<(), DeviceError> {
        match self {
            DeviceProvider::SoftToken(driver) => driver.delete_cert(token_id, key_id, der),
            DeviceProvider::Hsm(driver) => driver.delete_cert(token_id, key_id, der),
            #[cfg(test)]
            DeviceProvider::Mock(driver) => driver.delete_cert(token_id, key_id, der),
        }
    }
}
