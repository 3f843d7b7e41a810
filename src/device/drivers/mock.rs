//! An in-memory driver for testing registry and handler behaviour,
//! including device failures.
use std::sync::{Arc, RwLock};

use bytes::Bytes;

use crate::{
    device::{DeviceError, DeviceKey, DeviceToken, DeviceTokenState, Pin},
    tokens::{DeviceKind, KeyId, TokenId},
};

#[derive(Clone, Copy, Debug)]
pub enum FnIdx {
    ListTokens,
    InitToken,
    Activate,
    Deactivate,
    ChangePin,
    GenerateKey,
    DeleteKey,
    Sign,
    ImportCert,
    DeleteCert,
    Count,
}

#[derive(Debug)]
pub struct MockDriverCallCounts {
    call_counts: RwLock<Vec<u32>>,
}

impl MockDriverCallCounts {
    pub fn new() -> Self {
        let mut call_counts = Vec::with_capacity(FnIdx::Count as usize);
        call_counts.resize(FnIdx::Count as usize, 0);

        Self {
            call_counts: RwLock::new(call_counts),
        }
    }

    pub fn get(&self, fn_idx: FnIdx) -> u32 {
        self.call_counts.read().unwrap()[fn_idx as usize]
    }

    pub fn inc(&self, fn_idx: FnIdx) {
        self.call_counts.write().unwrap()[fn_idx as usize] += 1;
    }
}

pub type ErrorCb = fn(&MockDriverCallCounts) -> Result<(), DeviceError>;

#[derive(Debug)]
struct MockToken {
    id: TokenId,
    pin: String,
    state: DeviceTokenState,
    keys: Vec<DeviceKey>,
}

pub struct MockDriver {
    kind: DeviceKind,
    fn_call_counts: Arc<MockDriverCallCounts>,
    tokens: RwLock<Vec<MockToken>>,
    error_cbs: Vec<Option<ErrorCb>>,
}

impl std::fmt::Debug for MockDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockDriver").field("kind", &self.kind).finish()
    }
}

// test interface
impl MockDriver {
    pub fn new(kind: DeviceKind, fn_call_counts: Arc<MockDriverCallCounts>) -> Self {
        let mut error_cbs = Vec::with_capacity(FnIdx::Count as usize);
        error_cbs.resize(FnIdx::Count as usize, None);
        MockDriver {
            kind,
            fn_call_counts,
            tokens: RwLock::new(vec![]),
            error_cbs,
        }
    }

    /// Adds a locked token which accepts the given PIN.
    pub fn with_token(self, token_id: &str, pin: &str) -> Self {
        self.tokens.write().unwrap().push(MockToken {
            id: TokenId::from(token_id),
            pin: pin.to_string(),
            state: DeviceTokenState::Locked,
            keys: vec![],
        });
        self
    }

    /// Makes a call fail whenever the callback says so.
    pub fn with_error_cb(mut self, fn_idx: FnIdx, cb: ErrorCb) -> Self {
        self.error_cbs[fn_idx as usize] = Some(cb);
        self
    }

    /// Changes the state of a token as if it happened on the device.
    pub fn set_state(&self, token_id: &str, state: DeviceTokenState) {
        let mut tokens = self.tokens.write().unwrap();
        for token in tokens.iter_mut().filter(|t| t.id.as_str() == token_id) {
            token.state = state;
        }
    }

    /// Whether the device still holds this key.
    pub fn has_key(&self, key_id: &KeyId) -> bool {
        self.tokens
            .read()
            .unwrap()
            .iter()
            .any(|t| t.keys.iter().any(|k| &k.id == key_id))
    }

    fn call(&self, fn_idx: FnIdx) -> Result<(), DeviceError> {
        self.fn_call_counts.inc(fn_idx);
        match &self.error_cbs[fn_idx as usize] {
            Some(cb) => (cb)(&self.fn_call_counts),
            None => Ok(()),
        }
    }

    fn with_token_mut<T, F>(&self, token_id: &TokenId, op: F) -> Result<T, DeviceError>
    where
        F: FnOnce(&mut MockToken) -> Result<T, DeviceError>,
    {
        let mut tokens = self.tokens.write().unwrap();
        let token = tokens
            .iter_mut()
            .find(|t| &t.id == token_id)
            .ok_or_else(|| DeviceError::DeviceUnavailable(format!("no token '{}'", token_id)))?;
        op(token)
    }

    fn with_active_token<T, F>(&self, token_id: &TokenId, op: F) -> Result<T, DeviceError>
    where
        F: FnOnce(&mut MockToken) -> Result<T, DeviceError>,
    {
        self.with_token_mut(token_id, |token| match token.state {
            DeviceTokenState::Unlocked => op(token),
            DeviceTokenState::Absent | DeviceTokenState::Gone => {
                Err(DeviceError::DeviceUnavailable(format!("token '{}' not present", token.id)))
            }
            _ => Err(DeviceError::not_active(&token.id)),
        })
    }
}

// interface expected by DeviceProvider
impl MockDriver {
    pub fn kind(&self) -> DeviceKind {
        self.kind.clone()
    }

    pub fn list_tokens(&self) -> Result<Vec<DeviceToken>, DeviceError> {
        self.call(FnIdx::ListTokens)?;
        let tokens = self.tokens.read().unwrap();
        Ok(tokens
            .iter()
            .map(|t| DeviceToken {
                id: t.id.clone(),
                label: format!("mock {}", t.id),
                state: t.state,
                keys: Some(t.keys.clone()),
            })
            .collect())
    }

    pub fn init_token(&self, token_id: &TokenId, pin: &Pin) -> Result<(), DeviceError> {
        self.call(FnIdx::InitToken)?;
        self.with_token_mut(token_id, |token| {
            if token.state != DeviceTokenState::Uninitialized {
                return Err(DeviceError::InvalidState("already initialized".to_string()));
            }
            token.pin = pin.expose().to_string();
            token.state = DeviceTokenState::Unlocked;
            Ok(())
        })
    }

    pub fn activate(&self, token_id: &TokenId, pin: &Pin) -> Result<(), DeviceError> {
        self.call(FnIdx::Activate)?;
        self.with_token_mut(token_id, |token| {
            if token.pin != pin.expose() {
                return Err(DeviceError::AuthenticationFailed("PIN incorrect".to_string()));
            }
            token.state = DeviceTokenState::Unlocked;
            Ok(())
        })
    }

    pub fn deactivate(&self, token_id: &TokenId) -> Result<(), DeviceError> {
        self.call(FnIdx::Deactivate)?;
        self.with_token_mut(token_id, |token| {
            if token.state == DeviceTokenState::Unlocked {
                token.state = DeviceTokenState::Locked;
            }
            Ok(())
        })
    }

    pub fn change_pin(&self, token_id: &TokenId, old_pin: &Pin, new_pin: &Pin) -> Result<(), DeviceError> {
        self.call(FnIdx::ChangePin)?;
        self.with_token_mut(token_id, |token| {
            if token.pin != old_pin.expose() {
                return Err(DeviceError::AuthenticationFailed("PIN incorrect".to_string()));
            }
            token.pin = new_pin.expose().to_string();
            Ok(())
        })
    }

    pub fn generate_key(&self, token_id: &TokenId, label: Option<&str>) -> Result<DeviceKey, DeviceError> {
        self.call(FnIdx::GenerateKey)?;
        let n = self.fn_call_counts.get(FnIdx::GenerateKey);
        self.with_active_token(token_id, |token| {
            let key = DeviceKey {
                id: KeyId::from(format!("{}-key-{}", token.id, n)),
                label: label.map(str::to_string),
                certs: vec![],
            };
            token.keys.push(key.clone());
            Ok(key)
        })
    }

    pub fn delete_key(&self, token_id: &TokenId, key_id: &KeyId) -> Result<(), DeviceError> {
        self.call(FnIdx::DeleteKey)?;
        self.with_active_token(token_id, |token| {
            let before = token.keys.len();
            token.keys.retain(|k| &k.id != key_id);
            if token.keys.len() == before {
                Err(DeviceError::KeyNotFound(key_id.to_string()))
            } else {
                Ok(())
            }
        })
    }

    pub fn sign(&self, token_id: &TokenId, key_id: &KeyId, data: &[u8]) -> Result<Bytes, DeviceError> {
        self.call(FnIdx::Sign)?;
        self.with_active_token(token_id, |token| {
            if !token.keys.iter().any(|k| &k.id == key_id) {
                return Err(DeviceError::KeyNotFound(key_id.to_string()));
            }
            let mut signature = key_id.as_str().as_bytes().to_vec();
            signature.extend_from_slice(data);
            Ok(Bytes::from(signature))
        })
    }

    pub fn import_cert(&self, token_id: &TokenId, key_id: &KeyId, der: &[u8]) -> Result<(), DeviceError> {
        self.call(FnIdx::ImportCert)?;
        self.with_active_token(token_id, |token| {
            let key = token
                .keys
                .iter_mut()
                .find(|k| &k.id == key_id)
                .ok_or_else(|| DeviceError::KeyNotFound(key_id.to_string()))?;
            key.certs.push(Bytes::copy_from_slice(der));
            Ok(())
        })
    }

    pub fn delete_cert(&self, token_id: &TokenId, key_id: &KeyId, der: &[u8]) -> Result<(), DeviceError> {
        self.call(FnIdx::DeleteCert)?;
        self.with_active_token(token_id, |token| {
            let key = token
                .keys
                .iter_mut()
                .find(|k| &k.id == key_id)
                .ok_or_else(|| DeviceError::KeyNotFound(key_id.to_string()))?;
            key.certs.retain(|c| c.as_ref() != der);
            Ok(())
        })
    }
}
