//! The authority over the token registry.
use std::{
    path::Path,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use crate::{
    commons::{error::Error, SignerEmptyResult, SignerResult},
    device::DeviceToken,
    tokens::{
        CertId, CertRequestId, CertRequestInfo, CertStatus, CertificateInfo, DeviceKind, KeyId, KeyInfo, KeyUsage,
        SnapshotStore, SyncSummary, TokenId, TokenInfo, TokenRegistry, TokenStatus,
    },
};

//------------ TokenAndKey ---------------------------------------------------

/// A resolved key, with what callers need to know about its token.
#[derive(Clone, Debug)]
pub struct TokenAndKey {
    pub token_id: TokenId,
    pub device_kind: DeviceKind,
    pub token_status: TokenStatus,
    pub key: KeyInfo,
}

//------------ CertAndKey ----------------------------------------------------

/// A resolved certificate, with its owning key and token.
#[derive(Clone, Debug)]
pub struct CertAndKey {
    pub token_id: TokenId,
    pub device_kind: DeviceKind,
    pub key_id: KeyId,
    pub cert: CertificateInfo,
}

//------------ TokenManager --------------------------------------------------

/// Owns the registry and its snapshot store.
///
/// Readers share a read lock and always see a complete state. Every
/// mutation takes the write lock, applies its change and writes the
/// snapshot before the lock is released. If the snapshot cannot be
/// written, the in-memory state is rolled back to what is on disk and the
/// mutation fails, so memory and disk agree after every acknowledged
/// operation.
#[derive(Debug)]
pub struct TokenManager {
    registry: RwLock<TokenRegistry>,
    store: SnapshotStore,
}

impl TokenManager {
    /// Loads the snapshot from the data dir. Fails if it is unreadable.
    pub fn build(data_dir: &Path) -> SignerResult<Self> {
        let store = SnapshotStore::new(data_dir)?;
        Self::with_store(store)
    }

    pub fn with_store(store: SnapshotStore) -> SignerResult<Self> {
        let registry = store.load()?;
        Ok(TokenManager {
            registry: RwLock::new(registry),
            store,
        })
    }

    /// Runs a read-only operation against a consistent registry.
    pub fn read<F, R>(&self, op: F) -> SignerResult<R>
    where
        F: FnOnce(&TokenRegistry) -> SignerResult<R>,
    {
        let registry = self.read_lock()?;
        op(&*registry)
    }

    /// Runs a mutating operation and persists its result.
    ///
    /// The operation either applies completely and durably, or not at
    /// all: on failure of the operation itself or of the snapshot write,
    /// the registry is restored.
    pub fn update<F, R>(&self, op: F) -> SignerResult<R>
    where
        F: FnOnce(&mut TokenRegistry) -> SignerResult<R>,
    {
        let mut registry = self.write_lock()?;
        let backup = registry.clone();

        let res = match op(&mut *registry) {
            Ok(res) => res,
            Err(e) => {
                *registry = backup;
                return Err(e);
            }
        };

        if let Err(e) = self.store.save(&registry) {
            warn!("Rolling back registry change that could not be persisted");
            *registry = backup;
            return Err(e);
        }

        Ok(res)
    }

    fn read_lock(&self) -> SignerResult<RwLockReadGuard<'_, TokenRegistry>> {
        self.registry.read().map_err(|_| Error::lock_poisoned("token registry"))
    }

    fn write_lock(&self) -> SignerResult<RwLockWriteGuard<'_, TokenRegistry>> {
        self.registry.write().map_err(|_| Error::lock_poisoned("token registry"))
    }
}

/// # Lookups
impl TokenManager {
    pub fn tokens(&self) -> SignerResult<Vec<TokenInfo>> {
        self.read(|r| Ok(r.tokens().to_vec()))
    }

    pub fn token(&self, token_id: &TokenId) -> SignerResult<TokenInfo> {
        self.read(|r| r.get_token(token_id).cloned())
    }

    pub fn find_token_and_key(&self, key_id: &KeyId) -> SignerResult<TokenAndKey> {
        self.read(|r| {
            let (token, key) = r.find_token_and_key(key_id)?;
            Ok(TokenAndKey {
                token_id: token.id().clone(),
                device_kind: token.device_kind().clone(),
                token_status: token.status(),
                key: key.clone(),
            })
        })
    }

    pub fn find_cert(&self, cert_id: &CertId) -> SignerResult<CertAndKey> {
        self.read(|r| {
            let (token, key, cert) = r.find_cert(cert_id)?;
            Ok(CertAndKey {
                token_id: token.id().clone(),
                device_kind: token.device_kind().clone(),
                key_id: key.id().clone(),
                cert: cert.clone(),
            })
        })
    }
}

/// # Mutations
///
/// Each of these is atomic and persisted before it returns.
impl TokenManager {
    pub fn set_token_status(&self, token_id: &TokenId, status: TokenStatus) -> SignerEmptyResult {
        self.update(|r| r.set_token_status(token_id, status))?;
        debug!("Token '{}' is now {}", token_id, status);
        Ok(())
    }

    pub fn set_token_friendly_name(&self, token_id: &TokenId, name: String) -> SignerEmptyResult {
        self.update(|r| r.set_token_friendly_name(token_id, name))
    }

    /// Adds a token unless a token with that id already exists.
    pub fn ensure_token(&self, token: TokenInfo) -> SignerEmptyResult {
        self.update(|r| {
            if r.get_token(token.id()).is_ok() {
                Ok(())
            } else {
                r.add_token(token)
            }
        })
    }

    pub fn add_key(&self, token_id: &TokenId, key: KeyInfo) -> SignerEmptyResult {
        let key_id = key.id().clone();
        self.update(|r| r.add_key(token_id, key))?;
        debug!("Added key '{}' to token '{}'", key_id, token_id);
        Ok(())
    }

    pub fn remove_key(&self, key_id: &KeyId) -> SignerResult<KeyInfo> {
        let key = self.update(|r| r.remove_key(key_id))?;
        debug!("Removed key '{}' from token '{}'", key_id, key.token_id());
        Ok(key)
    }

    pub fn set_key_usage(&self, key_id: &KeyId, usage: KeyUsage) -> SignerEmptyResult {
        self.update(|r| r.set_key_usage(key_id, usage))
    }

    pub fn set_key_friendly_name(&self, key_id: &KeyId, name: String) -> SignerEmptyResult {
        self.update(|r| r.set_key_friendly_name(key_id, name))
    }

    pub fn add_cert(&self, key_id: &KeyId, cert: CertificateInfo) -> SignerEmptyResult {
        let cert_id = cert.id().clone();
        self.update(|r| r.add_cert(key_id, cert))?;
        debug!("Added certificate '{}' to key '{}'", cert_id, key_id);
        Ok(())
    }

    pub fn remove_cert(&self, cert_id: &CertId) -> SignerResult<CertificateInfo> {
        let cert = self.update(|r| r.remove_cert(cert_id))?;
        debug!("Removed certificate '{}'", cert_id);
        Ok(cert)
    }

    /// Removes a certificate, failing with Conflict if it belongs to
    /// another key.
    pub fn remove_cert_of_key(&self, key_id: &KeyId, cert_id: &CertId) -> SignerResult<CertificateInfo> {
        let cert = self.update(|r| r.remove_cert_of_key(key_id, cert_id))?;
        debug!("Removed certificate '{}' of key '{}'", cert_id, key_id);
        Ok(cert)
    }

    pub fn update_cert_status(&self, cert_id: &CertId, status: CertStatus) -> SignerEmptyResult {
        self.update(|r| r.update_cert_status(cert_id, status))
    }

    pub fn add_cert_request(&self, key_id: &KeyId, request: CertRequestInfo) -> SignerEmptyResult {
        self.update(|r| r.add_cert_request(key_id, request))
    }

    pub fn remove_cert_request(&self, request_id: &CertRequestId) -> SignerResult<CertRequestInfo> {
        let request = self.update(|r| r.remove_cert_request(request_id))?;
        debug!("Removed certificate request '{}'", request_id);
        Ok(request)
    }

    pub fn apply_device_report(&self, kind: &DeviceKind, report: Vec<DeviceToken>) -> SignerResult<SyncSummary> {
        self.update(|r| Ok(r.apply_device_report(kind, report)))
    }
}

//------------ Tests ---------------------------------------------------------
