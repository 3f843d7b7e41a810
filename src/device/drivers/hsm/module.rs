use std::fmt;

use crate::device::{DeviceError, Pin};

/// A PKCS#11 slot id.
pub type SlotId = u64;

/// A slot, and the token in it if any.
#[derive(Clone, Debug)]
pub struct SlotInfo {
    pub slot_id: SlotId,
    pub token: Option<ModuleToken>,
}

#[derive(Clone, Debug)]
pub struct ModuleToken {
    pub serial: String,
    pub label: String,
    pub initialized: bool,
}

/// A private key found on a token, with the certificates sharing its id.
#[derive(Clone, Debug)]
pub struct ModuleKey {
    pub id: Vec<u8>,
    pub label: Option<String>,
    pub certs: Vec<Vec<u8>>,
}

/// The narrow set of calls the hardware driver needs from a PKCS#11
/// library.
///
/// Keys and certificates are addressed by their CKA_ID. Everything but
/// listing slots requires a prior successful [`Pkcs11Module::login`] on
/// the slot.
pub trait Pkcs11Module: fmt::Debug + Send + Sync {
    fn list_slots(&self) -> Result<Vec<SlotInfo>, DeviceError>;

    fn login(&self, slot: SlotId, pin: &Pin) -> Result<(), DeviceError>;

    fn logout(&self, slot: SlotId) -> Result<(), DeviceError>;

    fn change_pin(&self, slot: SlotId, old_pin: &Pin, new_pin: &Pin) -> Result<(), DeviceError>;

    fn list_keys(&self, slot: SlotId) -> Result<Vec<ModuleKey>, DeviceError>;

    /// Generates an RSA key pair, both halves carrying the given id.
    fn generate_key_pair(&self, slot: SlotId, id: &[u8], label: Option<&str>) -> Result<(), DeviceError>;

    /// Signs with CKM_SHA256_RSA_PKCS.
    fn sign(&self, slot: SlotId, id: &[u8], data: &[u8]) -> Result<Vec<u8>, DeviceError>;

    /// Destroys the private and public key with this id.
    fn delete_key(&self, slot: SlotId, id: &[u8]) -> Result<(), DeviceError>;

    fn import_cert(&self, slot: SlotId, id: &[u8], der: &[u8]) -> Result<(), DeviceError>;

    fn delete_cert(&self, slot: SlotId, id: &[u8], der: &[u8]) -> Result<(), DeviceError>;
}
