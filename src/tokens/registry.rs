//! The in-memory registry of tokens and everything they own.
//!
//! Tokens own their keys, keys own their certificates and certificate
//! requests. Back references are identifiers, and the registry keeps
//! indexes from every child id to its owner so that lookups by id never
//! need to walk the whole tree.
use std::collections::{HashMap, HashSet};

use bytes::Bytes;

use crate::{
    commons::{error::Error, SignerEmptyResult, SignerResult},
    device::{DeviceKey, DeviceToken, DeviceTokenState},
    tokens::{
        CertId, CertOrigin, CertRequestId, CertRequestInfo, CertStatus, CertificateInfo, DeviceKind, KeyId, KeyInfo,
        KeyUsage, TokenId, TokenInfo, TokenStatus,
    },
};

//------------ TokenRegistry -------------------------------------------------

#[derive(Clone, Debug, Default)]
pub struct TokenRegistry {
    tokens: Vec<TokenInfo>,
    keys: HashMap<KeyId, TokenId>,
    certs: HashMap<CertId, KeyId>,
    cert_requests: HashMap<CertRequestId, KeyId>,
}

/// # Building
impl TokenRegistry {
    pub fn empty() -> Self {
        TokenRegistry::default()
    }

    /// Rebuilds a registry from a list of tokens, e.g. a loaded snapshot.
    ///
    /// Fails if the list breaks any of the ownership or uniqueness rules
    /// the registry would otherwise enforce on mutation.
    pub fn from_tokens(tokens: Vec<TokenInfo>) -> SignerResult<Self> {
        let mut registry = TokenRegistry::empty();
        for token in tokens {
            registry
                .add_token(token)
                .map_err(|e| Error::StoreCorrupt(e.to_string()))?;
        }
        Ok(registry)
    }

    pub fn tokens(&self) -> &[TokenInfo] {
        &self.tokens
    }
}

/// # Lookups
impl TokenRegistry {
    pub fn get_token(&self, token_id: &TokenId) -> SignerResult<&TokenInfo> {
        self.tokens
            .iter()
            .find(|t| t.id() == token_id)
            .ok_or_else(|| Error::TokenUnknown(token_id.clone()))
    }

    /// Resolves a key and its owning token.
    pub fn find_token_and_key(&self, key_id: &KeyId) -> SignerResult<(&TokenInfo, &KeyInfo)> {
        let token_id = self.keys.get(key_id).ok_or_else(|| Error::KeyUnknown(key_id.clone()))?;
        let token = self.get_token(token_id)?;
        let key = token
            .key(key_id)
            .ok_or_else(|| Error::internal(format!("key index out of sync for key '{}'", key_id)))?;
        Ok((token, key))
    }

    pub fn find_cert(&self, cert_id: &CertId) -> SignerResult<(&TokenInfo, &KeyInfo, &CertificateInfo)> {
        let key_id = self.certs.get(cert_id).ok_or_else(|| Error::CertUnknown(cert_id.clone()))?;
        let (token, key) = self.find_token_and_key(key_id)?;
        let cert = key
            .cert(cert_id)
            .ok_or_else(|| Error::internal(format!("certificate index out of sync for '{}'", cert_id)))?;
        Ok((token, key, cert))
    }

    /// Returns the id of the key a certificate request belongs to.
    pub fn find_cert_request(&self, request_id: &CertRequestId) -> SignerResult<&KeyId> {
        self.cert_requests
            .get(request_id)
            .ok_or_else(|| Error::CertRequestUnknown(request_id.clone()))
    }

    fn token_mut(&mut self, token_id: &TokenId) -> SignerResult<&mut TokenInfo> {
        self.tokens
            .iter_mut()
            .find(|t| t.id() == token_id)
            .ok_or_else(|| Error::TokenUnknown(token_id.clone()))
    }

    fn key_mut(&mut self, key_id: &KeyId) -> SignerResult<&mut KeyInfo> {
        let token_id = self
            .keys
            .get(key_id)
            .cloned()
            .ok_or_else(|| Error::KeyUnknown(key_id.clone()))?;
        self.token_mut(&token_id)?
            .key_mut(key_id)
            .ok_or_else(|| Error::internal(format!("key index out of sync for key '{}'", key_id)))
    }
}

/// # Tokens
impl TokenRegistry {
    /// Adds a token, including any keys it already carries.
    pub fn add_token(&mut self, token: TokenInfo) -> SignerEmptyResult {
        if self.tokens.iter().any(|t| t.id() == token.id()) {
            return Err(Error::conflict(format!("Token '{}' already exists", token.id())));
        }

        let mut token = token;
        let keys = std::mem::take(token.keys_mut());
        let token_id = token.id().clone();
        self.tokens.push(token);

        for key in keys {
            if let Err(e) = self.add_key(&token_id, key) {
                self.remove_token(&token_id)?;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Removes a token and everything it owns.
    pub fn remove_token(&mut self, token_id: &TokenId) -> SignerResult<TokenInfo> {
        let pos = self
            .tokens
            .iter()
            .position(|t| t.id() == token_id)
            .ok_or_else(|| Error::TokenUnknown(token_id.clone()))?;
        let token = self.tokens.remove(pos);
        for key in token.keys() {
            self.unindex_key(key);
        }
        Ok(token)
    }

    pub fn set_token_status(&mut self, token_id: &TokenId, status: TokenStatus) -> SignerEmptyResult {
        self.token_mut(token_id)?.set_status(status);
        Ok(())
    }

    pub fn set_token_friendly_name(&mut self, token_id: &TokenId, name: String) -> SignerEmptyResult {
        self.token_mut(token_id)?.set_friendly_name(name);
        Ok(())
    }
}

/// # Keys
impl TokenRegistry {
    /// Adds a key, with any certificates and requests it carries, to a token.
    pub fn add_key(&mut self, token_id: &TokenId, key: KeyInfo) -> SignerEmptyResult {
        if key.token_id() != token_id {
            return Err(Error::conflict(format!(
                "Key '{}' belongs to token '{}', not '{}'",
                key.id(),
                key.token_id(),
                token_id
            )));
        }
        if self.keys.contains_key(key.id()) {
            return Err(Error::conflict(format!("Key '{}' already exists", key.id())));
        }
        self.get_token(token_id)?;

        let mut seen_certs = HashSet::new();
        for cert in key.certs() {
            if !cert.is_consistent() {
                return Err(Error::conflict(format!(
                    "Certificate '{}' does not match its content",
                    cert.id()
                )));
            }
            if self.certs.contains_key(cert.id()) || !seen_certs.insert(cert.id()) {
                return Err(Error::conflict(format!("Certificate '{}' already exists", cert.id())));
            }
        }
        let mut seen_requests = HashSet::new();
        for request in key.cert_requests() {
            if self.cert_requests.contains_key(request.id()) || !seen_requests.insert(request.id()) {
                return Err(Error::conflict(format!(
                    "Certificate request '{}' already exists",
                    request.id()
                )));
            }
        }

        self.index_key(&key);
        self.token_mut(token_id)?.keys_mut().push(key);
        Ok(())
    }

    /// Removes a key and everything it owns.
    pub fn remove_key(&mut self, key_id: &KeyId) -> SignerResult<KeyInfo> {
        let token_id = self
            .keys
            .get(key_id)
            .cloned()
            .ok_or_else(|| Error::KeyUnknown(key_id.clone()))?;
        let keys = self.token_mut(&token_id)?.keys_mut();
        let pos = keys
            .iter()
            .position(|k| k.id() == key_id)
            .ok_or_else(|| Error::internal(format!("key index out of sync for key '{}'", key_id)))?;
        let key = keys.remove(pos);
        self.unindex_key(&key);
        Ok(key)
    }

    pub fn set_key_usage(&mut self, key_id: &KeyId, usage: KeyUsage) -> SignerEmptyResult {
        self.key_mut(key_id)?.set_usage(usage);
        Ok(())
    }

    pub fn set_key_friendly_name(&mut self, key_id: &KeyId, name: String) -> SignerEmptyResult {
        self.key_mut(key_id)?.set_friendly_name(name);
        Ok(())
    }

    fn index_key(&mut self, key: &KeyInfo) {
        self.keys.insert(key.id().clone(), key.token_id().clone());
        for cert in key.certs() {
            self.certs.insert(cert.id().clone(), key.id().clone());
        }
        for request in key.cert_requests() {
            self.cert_requests.insert(request.id().clone(), key.id().clone());
        }
    }

    fn unindex_key(&mut self, key: &KeyInfo) {
        self.keys.remove(key.id());
        for cert in key.certs() {
            self.certs.remove(cert.id());
        }
        for request in key.cert_requests() {
            self.cert_requests.remove(request.id());
        }
    }
}

/// # Certificates
impl TokenRegistry {
    pub fn add_cert(&mut self, key_id: &KeyId, cert: CertificateInfo) -> SignerEmptyResult {
        if !cert.is_consistent() {
            return Err(Error::conflict(format!(
                "Certificate '{}' does not match its content",
                cert.id()
            )));
        }
        if let Some(owner) = self.certs.get(cert.id()) {
            return Err(Error::conflict(format!(
                "Certificate '{}' already exists for key '{}'",
                cert.id(),
                owner
            )));
        }
        let cert_id = cert.id().clone();
        self.key_mut(key_id)?.certs_mut().push(cert);
        self.certs.insert(cert_id, key_id.clone());
        Ok(())
    }

    /// Removes a certificate. Fails with NotFound if it is already gone.
    pub fn remove_cert(&mut self, cert_id: &CertId) -> SignerResult<CertificateInfo> {
        let key_id = self
            .certs
            .get(cert_id)
            .cloned()
            .ok_or_else(|| Error::CertUnknown(cert_id.clone()))?;
        let certs = self.key_mut(&key_id)?.certs_mut();
        let pos = certs
            .iter()
            .position(|c| c.id() == cert_id)
            .ok_or_else(|| Error::internal(format!("certificate index out of sync for '{}'", cert_id)))?;
        let cert = certs.remove(pos);
        self.certs.remove(cert_id);
        Ok(cert)
    }

    /// Removes a certificate, after checking it belongs to the given key.
    pub fn remove_cert_of_key(&mut self, key_id: &KeyId, cert_id: &CertId) -> SignerResult<CertificateInfo> {
        self.check_cert_owner(key_id, cert_id)?;
        self.remove_cert(cert_id)
    }

    pub fn update_cert_status(&mut self, cert_id: &CertId, status: CertStatus) -> SignerEmptyResult {
        let key_id = self
            .certs
            .get(cert_id)
            .cloned()
            .ok_or_else(|| Error::CertUnknown(cert_id.clone()))?;
        let cert = self
            .key_mut(&key_id)?
            .certs_mut()
            .iter_mut()
            .find(|c| c.id() == cert_id)
            .ok_or_else(|| Error::internal(format!("certificate index out of sync for '{}'", cert_id)))?;
        cert.set_status(status);
        Ok(())
    }

    fn check_cert_owner(&self, key_id: &KeyId, cert_id: &CertId) -> SignerEmptyResult {
        match self.certs.get(cert_id) {
            None => Err(Error::CertUnknown(cert_id.clone())),
            Some(owner) if owner != key_id => Err(Error::conflict(format!(
                "Certificate '{}' does not belong to key '{}'",
                cert_id, key_id
            ))),
            Some(_) => Ok(()),
        }
    }
}

/// # Certificate requests
impl TokenRegistry {
    pub fn add_cert_request(&mut self, key_id: &KeyId, request: CertRequestInfo) -> SignerEmptyResult {
        if self.cert_requests.contains_key(request.id()) {
            return Err(Error::conflict(format!(
                "Certificate request '{}' already exists",
                request.id()
            )));
        }
        let request_id = request.id().clone();
        self.key_mut(key_id)?.cert_requests_mut().push(request);
        self.cert_requests.insert(request_id, key_id.clone());
        Ok(())
    }

    /// Removes a certificate request. Fails with NotFound if it is already gone.
    pub fn remove_cert_request(&mut self, request_id: &CertRequestId) -> SignerResult<CertRequestInfo> {
        let key_id = self
            .cert_requests
            .get(request_id)
            .cloned()
            .ok_or_else(|| Error::CertRequestUnknown(request_id.clone()))?;
        let requests = self.key_mut(&key_id)?.cert_requests_mut();
        let pos = requests
            .iter()
            .position(|r| r.id() == request_id)
            .ok_or_else(|| Error::internal(format!("request index out of sync for '{}'", request_id)))?;
        let request = requests.remove(pos);
        self.cert_requests.remove(request_id);
        Ok(request)
    }
}

//------------ Device synchronisation ----------------------------------------

/// What changed when a device report was applied.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SyncSummary {
    pub tokens_added: usize,
    pub tokens_removed: usize,
    pub keys_added: usize,
    pub certs_added: usize,
    pub certs_removed: usize,
}

impl SyncSummary {
    pub fn merge(&mut self, other: SyncSummary) {
        self.tokens_added += other.tokens_added;
        self.tokens_removed += other.tokens_removed;
        self.keys_added += other.keys_added;
        self.certs_added += other.certs_added;
        self.certs_removed += other.certs_removed;
    }
}

impl TokenRegistry {
    /// Merges what a driver currently sees into the registry.
    ///
    /// Tokens new to the registry are added. Tokens the driver reports as
    /// gone are removed with everything they own. Tokens of this kind the
    /// driver did not mention at all are marked not present. Where the
    /// driver could list keys, keys new to the registry are added, keys
    /// missing from the device are marked unavailable (but kept, since the
    /// configuration may still own certificates for them), and the
    /// device-resident certificates of each key are replaced by what the
    /// device holds.
    pub fn apply_device_report(&mut self, kind: &DeviceKind, report: Vec<DeviceToken>) -> SyncSummary {
        let mut summary = SyncSummary::default();
        let mut mentioned = HashSet::new();

        for device_token in report {
            mentioned.insert(device_token.id.clone());

            if device_token.state == DeviceTokenState::Gone {
                match self.get_token(&device_token.id) {
                    Ok(existing) if existing.device_kind() != kind => {
                        warn!(
                            "Device '{}' reports token '{}' of device '{}' as gone, ignoring it",
                            kind,
                            device_token.id,
                            existing.device_kind()
                        );
                    }
                    Ok(_) => {
                        if self.remove_token(&device_token.id).is_ok() {
                            info!("Token '{}' is gone, removed it from the registry", device_token.id);
                            summary.tokens_removed += 1;
                        }
                    }
                    Err(_) => {}
                }
                continue;
            }

            let status = device_token.state.token_status();

            match self.get_token(&device_token.id) {
                Ok(existing) if existing.device_kind() != kind => {
                    warn!(
                        "Device '{}' reports token '{}' which belongs to device '{}', ignoring it",
                        kind,
                        device_token.id,
                        existing.device_kind()
                    );
                    continue;
                }
                Ok(_) => {
                    // Exists; the status update below cannot fail.
                }
                Err(_) => {
                    let token = TokenInfo::new(device_token.id.clone(), kind.clone(), device_token.label.clone(), status);
                    if self.add_token(token).is_ok() {
                        debug!("Added token '{}' of device '{}'", device_token.id, kind);
                        summary.tokens_added += 1;
                    }
                }
            }

            let _ = self.set_token_status(&device_token.id, status);

            if let Some(device_keys) = device_token.keys {
                summary.merge(self.merge_device_keys(&device_token.id, device_keys));
            }
        }

        let unmentioned: Vec<TokenId> = self
            .tokens
            .iter()
            .filter(|t| t.device_kind() == kind && !mentioned.contains(t.id()))
            .map(|t| t.id().clone())
            .collect();
        for token_id in unmentioned {
            let _ = self.set_token_status(&token_id, TokenStatus::NotPresent);
        }

        summary
    }

    fn merge_device_keys(&mut self, token_id: &TokenId, device_keys: Vec<DeviceKey>) -> SyncSummary {
        let mut summary = SyncSummary::default();
        let on_device: HashSet<KeyId> = device_keys.iter().map(|k| k.id.clone()).collect();

        for device_key in device_keys {
            match self.keys.get(&device_key.id) {
                Some(owner) if owner != token_id => {
                    warn!(
                        "Key '{}' reported on token '{}' already belongs to token '{}', ignoring it",
                        device_key.id, token_id, owner
                    );
                    continue;
                }
                Some(_) => {}
                None => {
                    let key = KeyInfo::new(token_id.clone(), device_key.id.clone(), device_key.label.clone());
                    if self.add_key(token_id, key).is_ok() {
                        summary.keys_added += 1;
                    }
                }
            }

            let device_key_id = device_key.id.clone();
            if let Ok(key) = self.key_mut(&device_key_id) {
                key.set_available(true);
                if device_key.label.is_some() {
                    key.set_label(device_key.label.clone());
                }
            }

            let (added, removed) = self.replace_device_certs(&device_key_id, device_key.certs);
            summary.certs_added += added;
            summary.certs_removed += removed;
        }

        let missing: Vec<KeyId> = self
            .get_token(token_id)
            .map(|t| {
                t.keys()
                    .iter()
                    .filter(|k| !on_device.contains(k.id()))
                    .map(|k| k.id().clone())
                    .collect()
            })
            .unwrap_or_default();
        for key_id in missing {
            if let Ok(key) = self.key_mut(&key_id) {
                if key.available() {
                    debug!("Key '{}' is no longer found on token '{}'", key_id, token_id);
                }
                key.set_available(false);
            }
        }

        summary
    }

    fn replace_device_certs(&mut self, key_id: &KeyId, certs: Vec<Bytes>) -> (usize, usize) {
        let wanted: HashSet<CertId> = certs.iter().map(|der| CertId::for_der(der)).collect();

        let stale: Vec<CertId> = match self.find_token_and_key(key_id) {
            Ok((_, key)) => key
                .certs()
                .iter()
                .filter(|c| c.origin() == CertOrigin::DeviceResident && !wanted.contains(c.id()))
                .map(|c| c.id().clone())
                .collect(),
            Err(_) => return (0, 0),
        };

        let mut removed = 0;
        for cert_id in stale {
            if self.remove_cert(&cert_id).is_ok() {
                removed += 1;
            }
        }

        let mut added = 0;
        for der in certs {
            let cert_id = CertId::for_der(&der);
            if self.certs.contains_key(&cert_id) {
                continue;
            }
            let cert = CertificateInfo::new(der, CertOrigin::DeviceResident, CertStatus::Registered);
            if self.add_cert(key_id, cert).is_ok() {
                added += 1;
            }
        }

        (added, removed)
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commons::{error::ErrorKind, test};

    fn hsm() -> DeviceKind {
        DeviceKind::HardwareModule("hsm".to_string())
    }

    /// T1 holds K1 with request R1, configuration certificate C1 and a
    /// device-resident certificate.
    fn registry() -> TokenRegistry {
        let mut registry = TokenRegistry::empty();
        registry.add_token(test::token("T1", hsm())).unwrap();
        registry
            .add_key(
                &TokenId::from("T1"),
                test::key("T1", "K1")
                    .with_cert(test::cert(b"C1", CertOrigin::SavedToConfiguration))
                    .with_cert(test::cert(b"D1", CertOrigin::DeviceResident))
                    .with_cert_request(test::cert_request("R1", "CN=one")),
            )
            .unwrap();
        registry
    }

    #[test]
    fn find_token_and_key() {
        let registry = registry();
        let (token, key) = registry.find_token_and_key(&KeyId::from("K1")).unwrap();
        assert_eq!("T1", token.id().as_str());
        assert_eq!("K1", key.id().as_str());
        assert_eq!(token.id(), key.token_id());

        let err = registry.find_token_and_key(&KeyId::from("nope")).unwrap_err();
        assert_eq!(ErrorKind::NotFound, err.kind());
    }

    #[test]
    fn remove_cert_is_not_idempotent() {
        let mut registry = registry();
        let c1 = CertId::for_der(b"C1");

        registry.remove_cert(&c1).unwrap();
        let err = registry.remove_cert(&c1).unwrap_err();
        assert_eq!(ErrorKind::NotFound, err.kind());

        let r1 = CertRequestId::from("R1");
        registry.remove_cert_request(&r1).unwrap();
        let err = registry.remove_cert_request(&r1).unwrap_err();
        assert_eq!(ErrorKind::NotFound, err.kind());
    }

    #[test]
    fn remove_cert_of_other_key_conflicts() {
        let mut registry = registry();
        registry.add_key(&TokenId::from("T1"), test::key("T1", "K2")).unwrap();

        let err = registry
            .remove_cert_of_key(&KeyId::from("K2"), &CertId::for_der(b"C1"))
            .unwrap_err();
        assert_eq!(ErrorKind::Conflict, err.kind());

        // nothing was removed
        assert!(registry.find_cert(&CertId::for_der(b"C1")).is_ok());
    }

    #[test]
    fn duplicates_are_rejected() {
        let mut registry = registry();

        let err = registry.add_key(&TokenId::from("T1"), test::key("T1", "K1")).unwrap_err();
        assert_eq!(ErrorKind::Conflict, err.kind());

        let err = registry
            .add_cert(&KeyId::from("K1"), test::cert(b"C1", CertOrigin::SavedToConfiguration))
            .unwrap_err();
        assert_eq!(ErrorKind::Conflict, err.kind());

        let err = registry
            .add_cert_request(&KeyId::from("K1"), test::cert_request("R1", "CN=again"))
            .unwrap_err();
        assert_eq!(ErrorKind::Conflict, err.kind());

        let err = registry.add_token(test::token("T1", hsm())).unwrap_err();
        assert_eq!(ErrorKind::Conflict, err.kind());
    }

    #[test]
    fn key_must_name_its_token() {
        let mut registry = registry();
        registry.add_token(test::token("T2", hsm())).unwrap();

        let err = registry.add_key(&TokenId::from("T2"), test::key("T1", "K9")).unwrap_err();
        assert_eq!(ErrorKind::Conflict, err.kind());

        let err = registry.add_key(&TokenId::from("T9"), test::key("T9", "K9")).unwrap_err();
        assert_eq!(ErrorKind::NotFound, err.kind());
    }

    #[test]
    fn removing_a_key_drops_its_children() {
        let mut registry = registry();
        let key = registry.remove_key(&KeyId::from("K1")).unwrap();
        assert_eq!(2, key.certs().len());

        assert!(registry.find_cert(&CertId::for_der(b"C1")).is_err());
        assert!(registry.find_cert_request(&CertRequestId::from("R1")).is_err());

        // ids can be reused after removal
        registry
            .add_key(
                &TokenId::from("T1"),
                test::key("T1", "K1").with_cert(test::cert(b"C1", CertOrigin::SavedToConfiguration)),
            )
            .unwrap();
    }

    #[test]
    fn from_tokens_rejects_duplicate_keys() {
        let mut t1 = test::token("T1", hsm());
        t1.keys_mut().push(test::key("T1", "K1"));
        let mut t2 = test::token("T2", hsm());
        t2.keys_mut().push(test::key("T2", "K1"));

        let err = TokenRegistry::from_tokens(vec![t1, t2]).unwrap_err();
        assert_eq!(ErrorKind::PersistenceFailure, err.kind());
    }

    #[test]
    fn update_cert_status_and_usage() {
        let mut registry = registry();
        let c1 = CertId::for_der(b"C1");
        registry.update_cert_status(&c1, CertStatus::Unregistered).unwrap();
        registry.set_key_usage(&KeyId::from("K1"), KeyUsage::Signing).unwrap();

        let (_, key, cert) = registry.find_cert(&c1).unwrap();
        assert_eq!(CertStatus::Unregistered, cert.status());
        assert_eq!(Some(KeyUsage::Signing), key.usage());
    }

    fn device_token(id: &str, state: DeviceTokenState, keys: Option<Vec<DeviceKey>>) -> DeviceToken {
        DeviceToken {
            id: TokenId::from(id),
            label: format!("{}-label", id),
            state,
            keys,
        }
    }

    fn device_key(id: &str, certs: Vec<&'static [u8]>) -> DeviceKey {
        DeviceKey {
            id: KeyId::from(id),
            label: None,
            certs: certs.into_iter().map(Bytes::from_static).collect(),
        }
    }

    #[test]
    fn device_report_adds_tokens_and_keys() {
        let mut registry = TokenRegistry::empty();
        let report = vec![device_token(
            "T1",
            DeviceTokenState::Unlocked,
            Some(vec![device_key("K1", vec![b"D1"])]),
        )];

        let summary = registry.apply_device_report(&hsm(), report);
        assert_eq!(1, summary.tokens_added);
        assert_eq!(1, summary.keys_added);
        assert_eq!(1, summary.certs_added);

        let (token, key) = registry.find_token_and_key(&KeyId::from("K1")).unwrap();
        assert_eq!(TokenStatus::PresentUnlocked, token.status());
        assert_eq!(CertOrigin::DeviceResident, key.certs()[0].origin());
    }

    #[test]
    fn device_report_marks_missing_and_removes_gone() {
        let mut registry = registry();
        registry.add_token(test::token("T2", hsm())).unwrap();
        registry.add_token(test::token("S", DeviceKind::SoftKeystore)).unwrap();

        // T1 is not mentioned, T2 is gone
        let report = vec![device_token("T2", DeviceTokenState::Gone, None)];
        let summary = registry.apply_device_report(&hsm(), report);
        assert_eq!(1, summary.tokens_removed);

        assert!(registry.get_token(&TokenId::from("T2")).is_err());
        assert_eq!(
            TokenStatus::NotPresent,
            registry.get_token(&TokenId::from("T1")).unwrap().status()
        );
        // other device kinds are left alone
        assert_eq!(
            TokenStatus::PresentLocked,
            registry.get_token(&TokenId::from("S")).unwrap().status()
        );
    }

    #[test]
    fn gone_report_from_other_device_is_ignored() {
        let mut registry = registry();
        let other = DeviceKind::HardwareModule("other".to_string());

        let report = vec![device_token("T1", DeviceTokenState::Gone, None)];
        let summary = registry.apply_device_report(&other, report);
        assert_eq!(0, summary.tokens_removed);

        let (token, key) = registry.find_token_and_key(&KeyId::from("K1")).unwrap();
        assert_eq!(&hsm(), token.device_kind());
        assert_eq!(1, key.cert_requests().len());
    }

    #[test]
    fn device_report_replaces_device_certs_only() {
        let mut registry = registry();
        let report = vec![device_token(
            "T1",
            DeviceTokenState::Locked,
            Some(vec![device_key("K1", vec![b"D2"]), device_key("K2", vec![])]),
        )];

        let summary = registry.apply_device_report(&hsm(), report);
        assert_eq!(1, summary.keys_added);
        assert_eq!(1, summary.certs_added);
        assert_eq!(1, summary.certs_removed);

        let (_, key) = registry.find_token_and_key(&KeyId::from("K1")).unwrap();
        let ids: Vec<&CertId> = key.certs().iter().map(|c| c.id()).collect();
        assert_eq!(vec![&CertId::for_der(b"C1"), &CertId::for_der(b"D2")], ids);
        assert_eq!(1, key.cert_requests().len());
    }

    #[test]
    fn device_report_keeps_keys_missing_from_device() {
        let mut registry = registry();
        let report = vec![device_token("T1", DeviceTokenState::Locked, Some(vec![]))];
        registry.apply_device_report(&hsm(), report);

        let (_, key) = registry.find_token_and_key(&KeyId::from("K1")).unwrap();
        assert!(!key.available());
        // the configuration certificate is still there, the device one is not
        assert_eq!(vec![CertId::for_der(b"C1")], key.configuration_cert_ids());
        assert_eq!(1, key.certs().len());
    }
}
