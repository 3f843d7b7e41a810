//! Tokens on hardware security modules, reached through a PKCS#11
//! library.
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use bytes::Bytes;

use crate::{
    constants::HSM_KEY_ID_LEN,
    device::{
        drivers::hsm::{Pkcs11Module, SlotId},
        DeviceError, DeviceKey, DeviceToken, DeviceTokenState, Pin,
    },
    tokens::{DeviceKind, KeyId, TokenId},
};

//------------ HsmDriver -----------------------------------------------------

/// Driver for all tokens behind one configured PKCS#11 module.
///
/// Token ids are `<module name>-<token serial>`. Key ids are the hex
/// encoded CKA_ID of the key.
#[derive(Debug)]
pub struct HsmDriver {
    name: String,
    module: Arc<dyn Pkcs11Module>,
    state: RwLock<HsmState>,
}

#[derive(Debug, Default)]
struct HsmState {
    /// Where each token was last seen.
    slots: HashMap<TokenId, SlotId>,

    /// Tokens logged in through this driver.
    active: HashSet<TokenId>,
}

impl HsmDriver {
    pub fn new(name: &str, module: Arc<dyn Pkcs11Module>) -> Self {
        HsmDriver {
            name: name.to_string(),
            module,
            state: RwLock::new(HsmState::default()),
        }
    }

    fn token_id_for(&self, serial: &str) -> TokenId {
        TokenId::from(format!("{}-{}", self.name, serial.trim()))
    }
}

/// # Capabilities
impl HsmDriver {
    pub fn kind(&self) -> DeviceKind {
        DeviceKind::HardwareModule(self.name.clone())
    }

    /// Lists the tokens of the module. The keys of logged in tokens are
    /// read without holding the driver state, so signing on the module
    /// continues during a refresh.
    pub fn list_tokens(&self) -> Result<Vec<DeviceToken>, DeviceError> {
        let slots = self.module.list_slots()?;

        let mut tokens = vec![];
        let mut to_list = vec![];
        {
            let mut state = self.state_mut()?;
            let mut seen = HashSet::new();
            for slot in &slots {
                let Some(module_token) = &slot.token else {
                    continue;
                };
                let id = self.token_id_for(&module_token.serial);
                seen.insert(id.clone());
                state.slots.insert(id.clone(), slot.slot_id);

                let state_now = if !module_token.initialized {
                    state.active.remove(&id);
                    DeviceTokenState::Uninitialized
                } else if state.active.contains(&id) {
                    to_list.push((tokens.len(), slot.slot_id));
                    DeviceTokenState::Unlocked
                } else {
                    DeviceTokenState::Locked
                };

                tokens.push(DeviceToken {
                    id,
                    label: module_token.label.trim().to_string(),
                    state: state_now,
                    keys: None,
                });
            }

            // Tokens seen before but not now: removed from a slot which
            // still exists means absent, the slot itself vanishing means
            // gone.
            let slot_ids: HashSet<SlotId> = slots.iter().map(|s| s.slot_id).collect();
            let missing: Vec<(TokenId, SlotId)> = state
                .slots
                .iter()
                .filter(|(id, _)| !seen.contains(*id))
                .map(|(id, slot)| (id.clone(), *slot))
                .collect();
            for (id, slot_id) in missing {
                state.active.remove(&id);
                let token_state = if slot_ids.contains(&slot_id) {
                    DeviceTokenState::Absent
                } else {
                    state.slots.remove(&id);
                    DeviceTokenState::Gone
                };
                tokens.push(DeviceToken {
                    id,
                    label: String::new(),
                    state: token_state,
                    keys: None,
                });
            }
        }

        for (idx, slot_id) in to_list {
            let token = &mut tokens[idx];
            match self.module.list_keys(slot_id) {
                Ok(keys) => token.keys = Some(keys.into_iter().map(Self::device_key).collect()),
                Err(DeviceError::AuthenticationFailed(e)) => {
                    // logged out behind our back
                    debug!("Token '{}' no longer logged in: {}", token.id, e);
                    self.state_mut()?.active.remove(&token.id);
                    token.state = DeviceTokenState::Locked;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(tokens)
    }

    pub fn init_token(&self, _token_id: &TokenId, _pin: &Pin) -> Result<(), DeviceError> {
        Err(DeviceError::unsupported(
            "hardware tokens must be initialized with the vendor tools",
        ))
    }

    pub fn activate(&self, token_id: &TokenId, pin: &Pin) -> Result<(), DeviceError> {
        let slot = self.slot_for(token_id)?;
        self.module.login(slot, pin)?;
        self.state_mut()?.active.insert(token_id.clone());
        info!("Logged in to token '{}'", token_id);
        Ok(())
    }

    pub fn deactivate(&self, token_id: &TokenId) -> Result<(), DeviceError> {
        let slot = self.slot_for(token_id)?;
        let was_active = self.state_mut()?.active.remove(token_id);
        if was_active {
            self.module.logout(slot)?;
            info!("Logged out of token '{}'", token_id);
        }
        Ok(())
    }

    pub fn change_pin(&self, token_id: &TokenId, old_pin: &Pin, new_pin: &Pin) -> Result<(), DeviceError> {
        let slot = self.active_slot_for(token_id)?;
        self.module.change_pin(slot, old_pin, new_pin)
    }

    pub fn generate_key(&self, token_id: &TokenId, label: Option<&str>) -> Result<DeviceKey, DeviceError> {
        let slot = self.active_slot_for(token_id)?;

        let mut id = [0; HSM_KEY_ID_LEN];
        openssl::rand::rand_bytes(&mut id)?;
        self.module.generate_key_pair(slot, &id, label)?;

        let key_id = KeyId::from(hex::encode(id));
        debug!("Generated key '{}' on token '{}'", key_id, token_id);
        Ok(DeviceKey {
            id: key_id,
            label: label.map(str::to_string),
            certs: vec![],
        })
    }

    pub fn delete_key(&self, token_id: &TokenId, key_id: &KeyId) -> Result<(), DeviceError> {
        let slot = self.active_slot_for(token_id)?;
        self.module.delete_key(slot, &Self::cka_id(key_id)?)
    }

    pub fn sign(&self, token_id: &TokenId, key_id: &KeyId, data: &[u8]) -> Result<Bytes, DeviceError> {
        let slot = self.active_slot_for(token_id)?;
        self.module.sign(slot, &Self::cka_id(key_id)?, data).map(Bytes::from)
    }

    pub fn import_cert(&self, token_id: &TokenId, key_id: &KeyId, der: &[u8]) -> Result<(), DeviceError> {
        let slot = self.active_slot_for(token_id)?;
        self.module.import_cert(slot, &Self::cka_id(key_id)?, der)
    }

    pub fn delete_cert(&self, token_id: &TokenId, key_id: &KeyId, der: &[u8]) -> Result<(), DeviceError> {
        let slot = self.active_slot_for(token_id)?;
        self.module.delete_cert(slot, &Self::cka_id(key_id)?, der)
    }
}

/// # Internals
impl HsmDriver {
    fn state(&self) -> Result<RwLockReadGuard<'_, HsmState>, DeviceError> {
        self.state.read().map_err(|_| self.poisoned())
    }

    fn state_mut(&self) -> Result<RwLockWriteGuard<'_, HsmState>, DeviceError> {
        self.state.write().map_err(|_| self.poisoned())
    }

    fn poisoned(&self) -> DeviceError {
        DeviceError::Other(format!("state lock of module '{}' poisoned", self.name))
    }

    fn slot_for(&self, token_id: &TokenId) -> Result<SlotId, DeviceError> {
        if let Some(slot) = self.state()?.slots.get(token_id) {
            return Ok(*slot);
        }
        // not seen yet, look again
        self.list_tokens()?;
        self.state()?
            .slots
            .get(token_id)
            .copied()
            .ok_or_else(|| DeviceError::DeviceUnavailable(format!("token '{}' not found in module '{}'", token_id, self.name)))
    }

    fn active_slot_for(&self, token_id: &TokenId) -> Result<SlotId, DeviceError> {
        let slot = self.slot_for(token_id)?;
        if self.state()?.active.contains(token_id) {
            Ok(slot)
        } else {
            Err(DeviceError::not_active(token_id))
        }
    }

    fn cka_id(key_id: &KeyId) -> Result<Vec<u8>, DeviceError> {
        hex::decode(key_id.as_str()).map_err(|_| DeviceError::KeyNotFound(key_id.to_string()))
    }

    fn device_key(key: super::ModuleKey) -> DeviceKey {
        DeviceKey {
            id: KeyId::from(hex::encode(&key.id)),
            label: key.label,
            certs: key.certs.into_iter().map(Bytes::from).collect(),
        }
    }
}

//------------ Tests ---------------------------------------------------------
