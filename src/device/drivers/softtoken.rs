//! Support for keys held in a local software keystore.
//!
//! Keys are stored one per file, as PKCS#8 PEM encrypted under the token
//! PIN. The PIN itself is only stored as a PBKDF2 hash, and only kept in
//! memory while the token is active.
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use bytes::Bytes;
use openssl::{
    hash::MessageDigest,
    pkey::{PKey, Private},
    rsa::Rsa,
    symm::Cipher,
};
use serde::{Deserialize, Serialize};

use crate::{
    commons::util::{ext_serde, file},
    constants::{
        KEY_SIZE_BITS, SOFT_TOKEN_DEFAULT_NAME, SOFT_TOKEN_DIR, SOFT_TOKEN_ID, SOFT_TOKEN_KEYS_DIR, SOFT_TOKEN_KEY_EXT,
        SOFT_TOKEN_PIN_FILE, SOFT_TOKEN_STAGED_KEY_EXT,
    },
    device::{DeviceError, DeviceKey, DeviceToken, DeviceTokenState, Pin},
    tokens::{DeviceKind, KeyId, TokenId},
};

const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;

//------------ SoftTokenDriver -----------------------------------------------

#[derive(Debug)]
pub struct SoftTokenDriver {
    pin_path: Arc<Path>,
    keys_dir: Arc<Path>,
    iterations: u32,
    active_pin: RwLock<Option<Pin>>,

    /// Held for writing while the PIN changes, and for reading by
    /// everything else touching key files.
    keystore: RwLock<()>,
}

impl SoftTokenDriver {
    pub fn build(data_dir: &Path, iterations: u32) -> Result<Self, DeviceError> {
        let dir = file::sub_dir(data_dir, SOFT_TOKEN_DIR)?;
        let keys_dir = file::sub_dir(&dir, SOFT_TOKEN_KEYS_DIR)?;
        let pin_path = file::file_path(&dir, SOFT_TOKEN_PIN_FILE);

        info!("Using software keystore in {}", dir.to_string_lossy());

        let driver = SoftTokenDriver {
            pin_path: pin_path.into(),
            keys_dir: keys_dir.into(),
            iterations,
            active_pin: RwLock::new(None),
            keystore: RwLock::new(()),
        };
        driver.finish_pin_change()?;
        Ok(driver)
    }

    pub fn token_id() -> TokenId {
        TokenId::from(SOFT_TOKEN_ID)
    }
}

/// # Capabilities
impl SoftTokenDriver {
    pub fn kind(&self) -> DeviceKind {
        DeviceKind::SoftKeystore
    }

    pub fn list_tokens(&self) -> Result<Vec<DeviceToken>, DeviceError> {
        let _keystore = self.keystore_read()?;
        let state = if !self.is_initialized() {
            DeviceTokenState::Uninitialized
        } else if self.is_active()? {
            DeviceTokenState::Unlocked
        } else {
            DeviceTokenState::Locked
        };

        let keys = if state == DeviceTokenState::Uninitialized {
            None
        } else {
            Some(self.list_keys()?)
        };

        Ok(vec![DeviceToken {
            id: Self::token_id(),
            label: SOFT_TOKEN_DEFAULT_NAME.to_string(),
            state,
            keys,
        }])
    }

    /// Sets the first PIN. The token is active afterwards.
    pub fn init_token(&self, token_id: &TokenId, pin: &Pin) -> Result<(), DeviceError> {
        self.check_token(token_id)?;
        let _keystore = self.keystore_write()?;
        if self.is_initialized() {
            return Err(DeviceError::InvalidState("software token is already initialized".to_string()));
        }

        let verifier = PinVerifier::create(pin, self.iterations)?;
        file::save_json(&verifier, &self.pin_path)?;
        self.set_active_pin(Some(pin.clone()))?;

        info!("Initialized software token");
        Ok(())
    }

    pub fn activate(&self, token_id: &TokenId, pin: &Pin) -> Result<(), DeviceError> {
        self.check_token(token_id)?;
        let _keystore = self.keystore_read()?;
        self.verify_pin(pin)?;
        self.set_active_pin(Some(pin.clone()))
    }

    pub fn deactivate(&self, token_id: &TokenId) -> Result<(), DeviceError> {
        self.check_token(token_id)?;
        self.set_active_pin(None)
    }

    /// Changes the PIN and re-encrypts every key under the new PIN.
    ///
    /// All keys are decrypted, and staged next to their files encrypted
    /// under the new PIN, before anything is replaced. A wrong old PIN or
    /// a failed write up to this point changes nothing. Saving the new PIN
    /// verifier commits the change, after which the staged keys are moved
    /// into place. Whatever is left of that after a crash is finished when
    /// the driver is built again.
    pub fn change_pin(&self, token_id: &TokenId, old_pin: &Pin, new_pin: &Pin) -> Result<(), DeviceError> {
        self.check_token(token_id)?;
        let _keystore = self.keystore_write()?;
        self.finish_pin_change()?;
        self.verify_pin(old_pin)?;

        let mut keys = vec![];
        for key_id in self.key_ids()? {
            let key_file = self.load_key_file(&key_id)?;
            let pkey = key_file.decrypt(old_pin)?;
            keys.push((key_id, key_file.label, pkey));
        }

        let verifier = PinVerifier::create(new_pin, self.iterations)?;
        let pin_salt = verifier.salt_hex();
        if let Err(e) = self.stage_keys(keys, new_pin, &pin_salt) {
            warn!("Could not re-encrypt software keys, PIN left unchanged: {}", e);
            self.discard_staged_keys();
            return Err(e);
        }

        let saved = file::save_json(&verifier, &self.pin_path);

        // A failed save may still have replaced the file.
        let committed = self.saved_pin_salt()?.as_deref() == Some(pin_salt.as_str());
        if committed && self.is_active()? {
            self.set_active_pin(Some(new_pin.clone()))?;
        }
        self.finish_pin_change()?;
        saved?;

        info!("Changed software token PIN");
        Ok(())
    }

    pub fn generate_key(&self, token_id: &TokenId, label: Option<&str>) -> Result<DeviceKey, DeviceError> {
        self.check_token(token_id)?;
        let _keystore = self.keystore_read()?;
        let pin = self.active_pin()?;

        let rsa = Rsa::generate(KEY_SIZE_BITS)?;
        let pkey = PKey::from_rsa(rsa)?;
        let key_id = Self::key_id_for(&pkey)?;

        let key_file = KeyFile::encrypt(label.map(str::to_string), &pkey, &pin)?;
        file::save_json(&key_file, &self.key_path(&key_id))?;

        debug!("Generated software key '{}'", key_id);
        Ok(DeviceKey {
            id: key_id,
            label: key_file.label,
            certs: vec![],
        })
    }

    pub fn delete_key(&self, token_id: &TokenId, key_id: &KeyId) -> Result<(), DeviceError> {
        self.check_token(token_id)?;
        let _keystore = self.keystore_read()?;
        self.active_pin()?;

        let path = self.key_path(key_id);
        if !Self::is_key_id(key_id) || !path.exists() {
            return Err(DeviceError::KeyNotFound(key_id.to_string()));
        }
        file::delete_file(&path)?;

        debug!("Deleted software key '{}'", key_id);
        Ok(())
    }

    /// Signs the data with SHA-256 and RSA PKCS#1 v1.5.
    pub fn sign(&self, token_id: &TokenId, key_id: &KeyId, data: &[u8]) -> Result<Bytes, DeviceError> {
        self.check_token(token_id)?;
        let _keystore = self.keystore_read()?;
        let pin = self.active_pin()?;

        let pkey = self.load_key_file(key_id)?.decrypt(&pin)?;
        let mut signer = openssl::sign::Signer::new(MessageDigest::sha256(), &pkey)?;
        signer.update(data)?;
        Ok(Bytes::from(signer.sign_to_vec()?))
    }

    pub fn import_cert(&self, _token_id: &TokenId, _key_id: &KeyId, _der: &[u8]) -> Result<(), DeviceError> {
        Err(DeviceError::unsupported("the software token does not store certificates"))
    }

    pub fn delete_cert(&self, _token_id: &TokenId, _key_id: &KeyId, _der: &[u8]) -> Result<(), DeviceError> {
        Err(DeviceError::unsupported("the software token does not store certificates"))
    }
}

/// # Internals
impl SoftTokenDriver {
    fn check_token(&self, token_id: &TokenId) -> Result<(), DeviceError> {
        if token_id.as_str() == SOFT_TOKEN_ID {
            Ok(())
        } else {
            Err(DeviceError::DeviceUnavailable(format!("no software token '{}'", token_id)))
        }
    }

    fn keystore_read(&self) -> Result<RwLockReadGuard<'_, ()>, DeviceError> {
        self.keystore
            .read()
            .map_err(|_| DeviceError::Other("software keystore lock poisoned".to_string()))
    }

    fn keystore_write(&self) -> Result<RwLockWriteGuard<'_, ()>, DeviceError> {
        self.keystore
            .write()
            .map_err(|_| DeviceError::Other("software keystore lock poisoned".to_string()))
    }

    fn is_initialized(&self) -> bool {
        self.pin_path.exists()
    }

    fn is_active(&self) -> Result<bool, DeviceError> {
        Ok(self.read_active_pin()?.is_some())
    }

    fn active_pin(&self) -> Result<Pin, DeviceError> {
        self.read_active_pin()?
            .ok_or_else(|| DeviceError::not_active(SOFT_TOKEN_ID))
    }

    fn read_active_pin(&self) -> Result<Option<Pin>, DeviceError> {
        self.active_pin
            .read()
            .map(|pin| pin.clone())
            .map_err(|_| DeviceError::Other("software token PIN lock poisoned".to_string()))
    }

    fn set_active_pin(&self, pin: Option<Pin>) -> Result<(), DeviceError> {
        let mut active = self
            .active_pin
            .write()
            .map_err(|_| DeviceError::Other("software token PIN lock poisoned".to_string()))?;
        *active = pin;
        Ok(())
    }

    fn verify_pin(&self, pin: &Pin) -> Result<(), DeviceError> {
        let verifier: PinVerifier = file::load_json(&self.pin_path)?
            .ok_or_else(|| DeviceError::InvalidState("software token is not initialized".to_string()))?;
        if verifier.verify(pin)? {
            Ok(())
        } else {
            warn!("Wrong PIN given for software token");
            Err(DeviceError::AuthenticationFailed("PIN incorrect".to_string()))
        }
    }

    /// Key ids are the hex encoded SHA-1 of the public key info.
    fn key_id_for(pkey: &PKey<Private>) -> Result<KeyId, DeviceError> {
        let der = pkey.public_key_to_der()?;
        Ok(KeyId::from(hex::encode(openssl::sha::sha1(&der))))
    }

    fn is_key_id(key_id: &KeyId) -> bool {
        let s = key_id.as_str();
        !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit())
    }

    fn key_path(&self, key_id: &KeyId) -> PathBuf {
        file::file_path(&self.keys_dir, &format!("{}.{}", key_id, SOFT_TOKEN_KEY_EXT))
    }

    fn staged_key_path(&self, key_id: &KeyId) -> PathBuf {
        file::file_path(&self.keys_dir, &format!("{}.{}", key_id, SOFT_TOKEN_STAGED_KEY_EXT))
    }

    fn key_ids(&self) -> Result<Vec<KeyId>, DeviceError> {
        self.ids_with_ext(SOFT_TOKEN_KEY_EXT)
    }

    fn staged_key_ids(&self) -> Result<Vec<KeyId>, DeviceError> {
        self.ids_with_ext(SOFT_TOKEN_STAGED_KEY_EXT)
    }

    fn ids_with_ext(&self, ext: &str) -> Result<Vec<KeyId>, DeviceError> {
        let suffix = format!(".{}", ext);
        let entries = fs::read_dir(&self.keys_dir).map_err(|e| {
            DeviceError::Other(format!(
                "cannot list software keys in {}: {}",
                self.keys_dir.to_string_lossy(),
                e
            ))
        })?;

        let mut ids = vec![];
        for entry in entries.flatten() {
            let name = entry.file_name();
            if let Some(id) = name.to_str().and_then(|n| n.strip_suffix(&suffix)) {
                let key_id = KeyId::from(id);
                if Self::is_key_id(&key_id) {
                    ids.push(key_id);
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn list_keys(&self) -> Result<Vec<DeviceKey>, DeviceError> {
        let mut keys = vec![];
        for id in self.key_ids()? {
            let key_file = self.load_key_file(&id)?;
            keys.push(DeviceKey {
                id,
                label: key_file.label,
                certs: vec![],
            });
        }
        Ok(keys)
    }

    /// Hex encoded salt of the saved PIN verifier, which tells apart
    /// verifiers for the same PIN.
    fn saved_pin_salt(&self) -> Result<Option<String>, DeviceError> {
        let verifier: Option<PinVerifier> = file::load_json(&self.pin_path)?;
        Ok(verifier.map(|v| v.salt_hex()))
    }

    fn stage_keys(
        &self,
        keys: Vec<(KeyId, Option<String>, PKey<Private>)>,
        pin: &Pin,
        pin_salt: &str,
    ) -> Result<(), DeviceError> {
        for (key_id, label, pkey) in keys {
            let staged = StagedKeyFile {
                pin_salt: pin_salt.to_string(),
                key: KeyFile::encrypt(label, &pkey, pin)?,
            };
            file::save_json(&staged, &self.staged_key_path(&key_id))?;
        }
        Ok(())
    }

    fn discard_staged_keys(&self) {
        let ids = match self.staged_key_ids() {
            Ok(ids) => ids,
            Err(e) => {
                warn!("Could not list staged software keys: {}", e);
                return;
            }
        };
        for key_id in ids {
            if let Err(e) = file::delete_file(&self.staged_key_path(&key_id)) {
                warn!("Could not remove staged software key '{}': {}", key_id, e);
            }
        }
    }

    /// Moves staged keys into place when the PIN they were staged for is
    /// the saved one, and drops them otherwise.
    fn finish_pin_change(&self) -> Result<(), DeviceError> {
        let staged_ids = self.staged_key_ids()?;
        if staged_ids.is_empty() {
            return Ok(());
        }

        let saved_salt = self.saved_pin_salt()?;
        for key_id in staged_ids {
            let path = self.staged_key_path(&key_id);
            match file::load_json::<StagedKeyFile>(&path)? {
                None => continue,
                Some(staged) if Some(&staged.pin_salt) == saved_salt.as_ref() => {
                    file::save_json(&staged.key, &self.key_path(&key_id))?;
                    info!("Moved software key '{}' re-encrypted under the new PIN into place", key_id);
                }
                Some(_) => {
                    info!("Dropped software key '{}' staged for a PIN that was never saved", key_id);
                }
            }
            file::delete_file(&path)?;
        }
        Ok(())
    }

    fn load_key_file(&self, key_id: &KeyId) -> Result<KeyFile, DeviceError> {
        if !Self::is_key_id(key_id) {
            return Err(DeviceError::KeyNotFound(key_id.to_string()));
        }
        file::load_json(&self.key_path(key_id))?.ok_or_else(|| DeviceError::KeyNotFound(key_id.to_string()))
    }
}

//------------ PinVerifier ---------------------------------------------------

/// A salted PBKDF2-HMAC-SHA256 hash of the PIN.
#[derive(Debug, Deserialize, Serialize)]
struct PinVerifier {
    #[serde(deserialize_with = "ext_serde::de_bytes", serialize_with = "ext_serde::ser_bytes")]
    salt: Bytes,
    iterations: u32,
    #[serde(deserialize_with = "ext_serde::de_bytes", serialize_with = "ext_serde::ser_bytes")]
    hash: Bytes,
}

impl PinVerifier {
    fn create(pin: &Pin, iterations: u32) -> Result<Self, DeviceError> {
        let mut salt = [0; SALT_LEN];
        openssl::rand::rand_bytes(&mut salt)?;
        let hash = Self::derive(pin, &salt, iterations)?;
        Ok(PinVerifier {
            salt: Bytes::copy_from_slice(&salt),
            iterations,
            hash: Bytes::copy_from_slice(&hash),
        })
    }

    fn salt_hex(&self) -> String {
        hex::encode(&self.salt)
    }

    fn verify(&self, pin: &Pin) -> Result<bool, DeviceError> {
        let hash = Self::derive(pin, &self.salt, self.iterations)?;
        Ok(self.hash.len() == hash.len() && openssl::memcmp::eq(&hash, &self.hash))
    }

    fn derive(pin: &Pin, salt: &[u8], iterations: u32) -> Result<[u8; HASH_LEN], DeviceError> {
        let mut hash = [0; HASH_LEN];
        openssl::pkcs5::pbkdf2_hmac(
            pin.expose().as_bytes(),
            salt,
            iterations as usize,
            MessageDigest::sha256(),
            &mut hash,
        )?;
        Ok(hash)
    }
}

//------------ KeyFile -------------------------------------------------------

#[derive(Debug, Deserialize, Serialize)]
struct KeyFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    label: Option<String>,
    pem: String,
}

impl KeyFile {
    fn encrypt(label: Option<String>, pkey: &PKey<Private>, pin: &Pin) -> Result<Self, DeviceError> {
        let pem = pkey.private_key_to_pem_pkcs8_passphrase(Cipher::aes_256_cbc(), pin.expose().as_bytes())?;
        let pem = String::from_utf8(pem).map_err(|e| DeviceError::Other(format!("invalid PEM: {}", e)))?;
        Ok(KeyFile { label, pem })
    }

    fn decrypt(&self, pin: &Pin) -> Result<PKey<Private>, DeviceError> {
        PKey::private_key_from_pem_passphrase(self.pem.as_bytes(), pin.expose().as_bytes())
            .map_err(|_| DeviceError::AuthenticationFailed("cannot decrypt key with the active PIN".to_string()))
    }
}

//------------ StagedKeyFile -------------------------------------------------

/// A key file encrypted under a new PIN, waiting for that PIN to be saved.
#[derive(Debug, Deserialize, Serialize)]
struct StagedKeyFile {
    /// Salt of the PIN verifier this key was staged for.
    pin_salt: String,
    key: KeyFile,
}

//------------ Tests ---------------------------------------------------------
