//! Tokens, keys, certificates and certificate requests as held by the
//! registry and written to the snapshot.
use std::{fmt, str::FromStr};

use bytes::Bytes;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::{
    commons::{error::Error, util::ext_serde, SignerEmptyResult},
    constants::{MAX_IDENTIFIER_LEN, SOFT_TOKEN_KIND},
};

//------------ Identifiers ---------------------------------------------------

macro_rules! identifier {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                $name(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

identifier!(
    /// Identifies a token. Stable across restarts.
    TokenId
);

identifier!(
    /// Identifies a key. Unique over all tokens.
    KeyId
);

identifier!(
    /// Identifies a certificate: the hex encoded SHA-256 of its DER.
    CertId
);

identifier!(
    /// Identifies a pending certificate request.
    CertRequestId
);

impl CertId {
    pub fn for_der(der: &[u8]) -> Self {
        CertId(hex::encode(openssl::sha::sha256(der)))
    }
}

impl CertRequestId {
    pub fn random() -> Self {
        CertRequestId(uuid::Uuid::new_v4().to_string())
    }
}

/// Checks that an externally supplied identifier, label or name is usable.
pub fn validate_identifier(what: &str, value: &str) -> SignerEmptyResult {
    if value.is_empty() {
        Err(Error::invalid_request(format!("{} must not be empty", what)))
    } else if value.chars().count() > MAX_IDENTIFIER_LEN {
        Err(Error::invalid_request(format!(
            "{} must not be longer than {} characters",
            what, MAX_IDENTIFIER_LEN
        )))
    } else if value.chars().any(char::is_control) {
        Err(Error::invalid_request(format!("{} must not contain control characters", what)))
    } else {
        Ok(())
    }
}

//------------ DeviceKind ----------------------------------------------------

/// The kind of device a token lives on. Selects the driver.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum DeviceKind {
    SoftKeystore,

    /// A hardware module, by its configured module name.
    HardwareModule(String),
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DeviceKind::SoftKeystore => SOFT_TOKEN_KIND.fmt(f),
            DeviceKind::HardwareModule(name) => name.fmt(f),
        }
    }
}

impl FromStr for DeviceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(Error::invalid_request("device kind must not be empty"))
        } else if s == SOFT_TOKEN_KIND {
            Ok(DeviceKind::SoftKeystore)
        } else {
            Ok(DeviceKind::HardwareModule(s.to_string()))
        }
    }
}

impl Serialize for DeviceKind {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_string().serialize(s)
    }
}

impl<'de> Deserialize<'de> for DeviceKind {
    fn deserialize<D>(d: D) -> Result<DeviceKind, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(d)?;
        DeviceKind::from_str(&string).map_err(de::Error::custom)
    }
}

//------------ TokenStatus ---------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TokenStatus {
    Uninitialized,
    NotPresent,
    PresentLocked,
    PresentUnlocked,
}

impl TokenStatus {
    pub fn is_present(self) -> bool {
        matches!(self, TokenStatus::PresentLocked | TokenStatus::PresentUnlocked)
    }

    pub fn is_active(self) -> bool {
        self == TokenStatus::PresentUnlocked
    }

    /// The status as it may be persisted: the PIN state never is.
    pub fn persistable(self) -> Self {
        match self {
            TokenStatus::PresentUnlocked => TokenStatus::PresentLocked,
            other => other,
        }
    }
}

impl fmt::Display for TokenStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            TokenStatus::Uninitialized => "uninitialized",
            TokenStatus::NotPresent => "not-present",
            TokenStatus::PresentLocked => "present-locked",
            TokenStatus::PresentUnlocked => "present-unlocked",
        };
        s.fmt(f)
    }
}

//------------ KeyUsage ------------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyUsage {
    Signing,
    Authentication,
}

impl fmt::Display for KeyUsage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KeyUsage::Signing => write!(f, "signing"),
            KeyUsage::Authentication => write!(f, "authentication"),
        }
    }
}

//------------ CertOrigin / CertStatus ---------------------------------------

/// Where a certificate lives.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CertOrigin {
    /// Imported into, and owned by, the configuration.
    SavedToConfiguration,

    /// Stored on the device only. Removed through the device driver.
    DeviceResident,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CertStatus {
    Registered,
    Unregistered,
}

//------------ TokenInfo -----------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TokenInfo {
    id: TokenId,
    device_kind: DeviceKind,
    friendly_name: String,
    status: TokenStatus,
    #[serde(default)]
    keys: Vec<KeyInfo>,
}

impl TokenInfo {
    pub fn new(id: TokenId, device_kind: DeviceKind, friendly_name: String, status: TokenStatus) -> Self {
        TokenInfo {
            id,
            device_kind,
            friendly_name,
            status,
            keys: vec![],
        }
    }

    pub fn id(&self) -> &TokenId {
        &self.id
    }

    pub fn device_kind(&self) -> &DeviceKind {
        &self.device_kind
    }

    pub fn friendly_name(&self) -> &str {
        &self.friendly_name
    }

    pub fn status(&self) -> TokenStatus {
        self.status
    }

    pub fn keys(&self) -> &[KeyInfo] {
        &self.keys
    }

    pub fn key(&self, key_id: &KeyId) -> Option<&KeyInfo> {
        self.keys.iter().find(|k| &k.id == key_id)
    }

    pub(super) fn key_mut(&mut self, key_id: &KeyId) -> Option<&mut KeyInfo> {
        self.keys.iter_mut().find(|k| &k.id == key_id)
    }

    pub(super) fn keys_mut(&mut self) -> &mut Vec<KeyInfo> {
        &mut self.keys
    }

    pub(super) fn set_status(&mut self, status: TokenStatus) {
        self.status = status;
    }

    pub(super) fn set_friendly_name(&mut self, name: String) {
        self.friendly_name = name;
    }

    /// A copy fit for the snapshot.
    pub fn persistable(&self) -> Self {
        let mut copy = self.clone();
        copy.status = self.status.persistable();
        copy
    }
}

//------------ KeyInfo -------------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct KeyInfo {
    id: KeyId,
    token_id: TokenId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    usage: Option<KeyUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    friendly_name: Option<String>,
    #[serde(default = "default_available")]
    available: bool,
    #[serde(default)]
    certs: Vec<CertificateInfo>,
    #[serde(default)]
    cert_requests: Vec<CertRequestInfo>,
}

fn default_available() -> bool {
    true
}

impl KeyInfo {
    pub fn new(token_id: TokenId, id: KeyId, label: Option<String>) -> Self {
        KeyInfo {
            id,
            token_id,
            usage: None,
            label,
            friendly_name: None,
            available: true,
            certs: vec![],
            cert_requests: vec![],
        }
    }

    pub fn id(&self) -> &KeyId {
        &self.id
    }

    /// The owning token.
    pub fn token_id(&self) -> &TokenId {
        &self.token_id
    }

    pub fn usage(&self) -> Option<KeyUsage> {
        self.usage
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn friendly_name(&self) -> Option<&str> {
        self.friendly_name.as_deref()
    }

    /// Whether the key material was found on the device when last looked.
    pub fn available(&self) -> bool {
        self.available
    }

    pub fn certs(&self) -> &[CertificateInfo] {
        &self.certs
    }

    pub fn cert(&self, cert_id: &CertId) -> Option<&CertificateInfo> {
        self.certs.iter().find(|c| &c.id == cert_id)
    }

    pub fn cert_requests(&self) -> &[CertRequestInfo] {
        &self.cert_requests
    }

    /// Ids of the certificates owned by the configuration, in order.
    pub fn configuration_cert_ids(&self) -> Vec<CertId> {
        self.certs
            .iter()
            .filter(|c| c.origin == CertOrigin::SavedToConfiguration)
            .map(|c| c.id.clone())
            .collect()
    }

    pub fn cert_request_ids(&self) -> Vec<CertRequestId> {
        self.cert_requests.iter().map(|r| r.id.clone()).collect()
    }

    pub fn with_usage(mut self, usage: KeyUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_cert(mut self, cert: CertificateInfo) -> Self {
        self.certs.push(cert);
        self
    }

    pub fn with_cert_request(mut self, request: CertRequestInfo) -> Self {
        self.cert_requests.push(request);
        self
    }

    pub(super) fn set_usage(&mut self, usage: KeyUsage) {
        self.usage = Some(usage);
    }

    pub(super) fn set_label(&mut self, label: Option<String>) {
        self.label = label;
    }

    pub(super) fn set_friendly_name(&mut self, name: String) {
        self.friendly_name = Some(name);
    }

    pub(super) fn set_available(&mut self, available: bool) {
        self.available = available;
    }

    pub(super) fn certs_mut(&mut self) -> &mut Vec<CertificateInfo> {
        &mut self.certs
    }

    pub(super) fn cert_requests_mut(&mut self) -> &mut Vec<CertRequestInfo> {
        &mut self.cert_requests
    }
}

//------------ CertificateInfo -----------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CertificateInfo {
    id: CertId,
    #[serde(deserialize_with = "ext_serde::de_bytes", serialize_with = "ext_serde::ser_bytes")]
    der: Bytes,
    origin: CertOrigin,
    status: CertStatus,
}

impl CertificateInfo {
    pub fn new(der: Bytes, origin: CertOrigin, status: CertStatus) -> Self {
        CertificateInfo {
            id: CertId::for_der(&der),
            der,
            origin,
            status,
        }
    }

    pub fn id(&self) -> &CertId {
        &self.id
    }

    pub fn der(&self) -> &Bytes {
        &self.der
    }

    pub fn origin(&self) -> CertOrigin {
        self.origin
    }

    pub fn is_saved_to_configuration(&self) -> bool {
        self.origin == CertOrigin::SavedToConfiguration
    }

    pub fn status(&self) -> CertStatus {
        self.status
    }

    pub(super) fn set_status(&mut self, status: CertStatus) {
        self.status = status;
    }

    /// Whether the id still matches the content.
    pub(super) fn is_consistent(&self) -> bool {
        self.id == CertId::for_der(&self.der)
    }
}

//------------ CertRequestInfo -----------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CertRequestInfo {
    id: CertRequestId,
    subject_name: String,
}

impl CertRequestInfo {
    pub fn new(id: CertRequestId, subject_name: String) -> Self {
        CertRequestInfo { id, subject_name }
    }

    pub fn id(&self) -> &CertRequestId {
        &self.id
    }

    pub fn subject_name(&self) -> &str {
        &self.subject_name
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_kind_is_a_plain_string() {
        let soft: DeviceKind = serde_json::from_str("\"softToken\"").unwrap();
        assert_eq!(DeviceKind::SoftKeystore, soft);

        let hsm: DeviceKind = serde_json::from_str("\"luna\"").unwrap();
        assert_eq!(DeviceKind::HardwareModule("luna".to_string()), hsm);
        assert_eq!("\"luna\"", serde_json::to_string(&hsm).unwrap());

        assert!(serde_json::from_str::<DeviceKind>("\"\"").is_err());
    }

    #[test]
    fn cert_id_is_sha256_of_der() {
        let cert = CertificateInfo::new(Bytes::from_static(b"abc"), CertOrigin::DeviceResident, CertStatus::Registered);
        assert_eq!(
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
            cert.id().as_str()
        );
    }

    #[test]
    fn unlocked_status_is_not_persisted() {
        let token = TokenInfo::new(
            TokenId::from("0"),
            DeviceKind::SoftKeystore,
            "soft".to_string(),
            TokenStatus::PresentUnlocked,
        );
        assert_eq!(TokenStatus::PresentLocked, token.persistable().status());
        assert_eq!(TokenStatus::NotPresent, TokenStatus::NotPresent.persistable());
    }

    #[test]
    fn only_configuration_certs_are_selected() {
        let key = KeyInfo::new(TokenId::from("t"), KeyId::from("k"), None)
            .with_cert(CertificateInfo::new(
                Bytes::from_static(b"device"),
                CertOrigin::DeviceResident,
                CertStatus::Registered,
            ))
            .with_cert(CertificateInfo::new(
                Bytes::from_static(b"config"),
                CertOrigin::SavedToConfiguration,
                CertStatus::Registered,
            ));

        assert_eq!(vec![CertId::for_der(b"config")], key.configuration_cert_ids());
    }

    #[test]
    fn identifiers_are_validated() {
        assert!(validate_identifier("key id", "abc-123").is_ok());
        assert!(validate_identifier("key id", "").is_err());
        assert!(validate_identifier("key id", "a\nb").is_err());
        assert!(validate_identifier("key id", &"x".repeat(MAX_IDENTIFIER_LEN)).is_ok());
        assert!(validate_identifier("key id", &"x".repeat(MAX_IDENTIFIER_LEN + 1)).is_err());
    }
}
