//! A [`Pkcs11Module`] backed by a PKCS#11 library loaded with `cryptoki`.
use std::{
    collections::HashMap,
    path::Path,
    sync::{Mutex, MutexGuard},
};

use cryptoki::{
    context::{CInitializeArgs, Pkcs11},
    error::{Error as Pkcs11Error, RvError},
    mechanism::Mechanism,
    object::{Attribute, AttributeType, CertificateType, KeyType, ObjectClass, ObjectHandle},
    session::{Session, UserType},
    slot::Slot,
    types::AuthPin,
};

use crate::{
    constants::KEY_SIZE_BITS,
    device::{
        drivers::hsm::{ModuleKey, ModuleToken, Pkcs11Module, SlotId, SlotInfo},
        DeviceError, Pin,
    },
};

//------------ CryptokiModule ------------------------------------------------

/// A loaded and initialized PKCS#11 library.
///
/// One logged in session is kept per slot. PKCS#11 shares the login state
/// between all sessions of an application, so a single session per slot
/// is enough and calls on it are serialized.
pub struct CryptokiModule {
    lib_name: String,
    ctx: Pkcs11,
    slots: Mutex<HashMap<SlotId, Slot>>,
    sessions: Mutex<HashMap<SlotId, Session>>,
}

impl std::fmt::Debug for CryptokiModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptokiModule").field("lib_name", &self.lib_name).finish()
    }
}

impl CryptokiModule {
    pub fn load(lib_path: &Path) -> Result<Self, DeviceError> {
        let lib_name = lib_path.to_string_lossy().to_string();

        let ctx = Pkcs11::new(lib_path).map_err(|e| {
            error!("Failed to load PKCS#11 library '{}': {}", lib_name, e);
            DeviceError::DeviceUnavailable(format!("cannot load PKCS#11 library '{}': {}", lib_name, e))
        })?;
        ctx.initialize(CInitializeArgs::OsThreads).map_err(|e| {
            error!("Failed to initialize PKCS#11 library '{}': {}", lib_name, e);
            map_err(e)
        })?;

        info!("Loaded PKCS#11 library '{}'", lib_name);
        Ok(CryptokiModule {
            lib_name,
            ctx,
            slots: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
        })
    }

    fn slot(&self, slot_id: SlotId) -> Result<Slot, DeviceError> {
        lock(&self.slots)?
            .get(&slot_id)
            .copied()
            .ok_or_else(|| DeviceError::DeviceUnavailable(format!("unknown slot {}", slot_id)))
    }

    /// Runs an operation on the logged in session of a slot.
    fn with_session<T, F>(&self, slot_id: SlotId, op: F) -> Result<T, DeviceError>
    where
        F: FnOnce(&Session) -> Result<T, Pkcs11Error>,
    {
        let sessions = lock(&self.sessions)?;
        let session = sessions
            .get(&slot_id)
            .ok_or_else(|| DeviceError::AuthenticationFailed(format!("not logged in to slot {}", slot_id)))?;
        op(session).map_err(map_err)
    }

    fn find(session: &Session, class: ObjectClass, id: &[u8]) -> Result<Vec<ObjectHandle>, Pkcs11Error> {
        session.find_objects(&[Attribute::Class(class), Attribute::Id(id.to_vec())])
    }

    fn private_key(session: &Session, id: &[u8]) -> Result<ObjectHandle, DeviceError> {
        Self::find(session, ObjectClass::PRIVATE_KEY, id)
            .map_err(map_err)?
            .into_iter()
            .next()
            .ok_or_else(|| DeviceError::KeyNotFound(hex::encode(id)))
    }
}

impl Pkcs11Module for CryptokiModule {
    fn list_slots(&self) -> Result<Vec<SlotInfo>, DeviceError> {
        let all = self.ctx.get_all_slots().map_err(map_err)?;
        let with_token = self.ctx.get_slots_with_token().map_err(map_err)?;

        let mut known = lock(&self.slots)?;
        known.clear();

        let mut res = vec![];
        for slot in all {
            let slot_id = slot.id();
            known.insert(slot_id, slot);

            let token = if with_token.contains(&slot) {
                let info = self.ctx.get_token_info(slot).map_err(map_err)?;
                Some(ModuleToken {
                    serial: info.serial_number().to_string(),
                    label: info.label().to_string(),
                    initialized: info.token_initialized(),
                })
            } else {
                None
            };
            res.push(SlotInfo { slot_id, token });
        }
        Ok(res)
    }

    fn login(&self, slot_id: SlotId, pin: &Pin) -> Result<(), DeviceError> {
        let slot = self.slot(slot_id)?;
        let session = self.ctx.open_rw_session(slot).map_err(map_err)?;
        let auth_pin = AuthPin::new(pin.expose().to_string().into());
        match session.login(UserType::User, Some(&auth_pin)) {
            Ok(()) | Err(Pkcs11Error::Pkcs11(RvError::UserAlreadyLoggedIn, _)) => {}
            Err(e) => return Err(map_err(e)),
        }
        lock(&self.sessions)?.insert(slot_id, session);
        Ok(())
    }

    fn logout(&self, slot_id: SlotId) -> Result<(), DeviceError> {
        if let Some(session) = lock(&self.sessions)?.remove(&slot_id) {
            session.logout().map_err(map_err)?;
        }
        Ok(())
    }

    fn change_pin(&self, slot_id: SlotId, old_pin: &Pin, new_pin: &Pin) -> Result<(), DeviceError> {
        let old_pin = AuthPin::new(old_pin.expose().to_string().into());
        let new_pin = AuthPin::new(new_pin.expose().to_string().into());
        self.with_session(slot_id, |session| session.set_pin(&old_pin, &new_pin))
    }

    fn list_keys(&self, slot_id: SlotId) -> Result<Vec<ModuleKey>, DeviceError> {
        self.with_session(slot_id, |session| {
            let mut keys = vec![];
            for handle in session.find_objects(&[Attribute::Class(ObjectClass::PRIVATE_KEY)])? {
                let mut id = vec![];
                let mut label = None;
                for attr in session.get_attributes(handle, &[AttributeType::Id, AttributeType::Label])? {
                    match attr {
                        Attribute::Id(value) => id = value,
                        Attribute::Label(value) => label = Some(String::from_utf8_lossy(&value).to_string()),
                        _ => {}
                    }
                }
                if id.is_empty() {
                    continue;
                }

                let mut certs = vec![];
                for cert in Self::find(session, ObjectClass::CERTIFICATE, &id)? {
                    for attr in session.get_attributes(cert, &[AttributeType::Value])? {
                        if let Attribute::Value(der) = attr {
                            certs.push(der);
                        }
                    }
                }

                keys.push(ModuleKey { id, label, certs });
            }
            Ok(keys)
        })
    }

    fn generate_key_pair(&self, slot_id: SlotId, id: &[u8], label: Option<&str>) -> Result<(), DeviceError> {
        let label = label.unwrap_or_default().as_bytes().to_vec();
        let pub_template = vec![
            Attribute::Class(ObjectClass::PUBLIC_KEY),
            Attribute::KeyType(KeyType::RSA),
            Attribute::Token(true),
            Attribute::Verify(true),
            Attribute::ModulusBits((KEY_SIZE_BITS as u64).into()),
            Attribute::PublicExponent(vec![0x01, 0x00, 0x01]),
            Attribute::Id(id.to_vec()),
            Attribute::Label(label.clone()),
        ];
        let priv_template = vec![
            Attribute::Class(ObjectClass::PRIVATE_KEY),
            Attribute::KeyType(KeyType::RSA),
            Attribute::Token(true),
            Attribute::Private(true),
            Attribute::Sensitive(true),
            Attribute::Extractable(false),
            Attribute::Sign(true),
            Attribute::Id(id.to_vec()),
            Attribute::Label(label),
        ];
        self.with_session(slot_id, |session| {
            session
                .generate_key_pair(&Mechanism::RsaPkcsKeyPairGen, &pub_template, &priv_template)
                .map(|_| ())
        })
    }

    fn sign(&self, slot_id: SlotId, id: &[u8], data: &[u8]) -> Result<Vec<u8>, DeviceError> {
        let sessions = lock(&self.sessions)?;
        let session = sessions
            .get(&slot_id)
            .ok_or_else(|| DeviceError::AuthenticationFailed(format!("not logged in to slot {}", slot_id)))?;
        let key = Self::private_key(session, id)?;
        session.sign(&Mechanism::Sha256RsaPkcs, key, data).map_err(map_err)
    }

    fn delete_key(&self, slot_id: SlotId, id: &[u8]) -> Result<(), DeviceError> {
        let sessions = lock(&self.sessions)?;
        let session = sessions
            .get(&slot_id)
            .ok_or_else(|| DeviceError::AuthenticationFailed(format!("not logged in to slot {}", slot_id)))?;
        let private = Self::private_key(session, id)?;
        session.destroy_object(private).map_err(map_err)?;
        for public in Self::find(session, ObjectClass::PUBLIC_KEY, id).map_err(map_err)? {
            session.destroy_object(public).map_err(map_err)?;
        }
        Ok(())
    }

    fn import_cert(&self, slot_id: SlotId, id: &[u8], der: &[u8]) -> Result<(), DeviceError> {
        let template = vec![
            Attribute::Class(ObjectClass::CERTIFICATE),
            Attribute::CertificateType(CertificateType::X_509),
            Attribute::Token(true),
            Attribute::Id(id.to_vec()),
            Attribute::Value(der.to_vec()),
        ];
        self.with_session(slot_id, |session| session.create_object(&template).map(|_| ()))
    }

    fn delete_cert(&self, slot_id: SlotId, id: &[u8], der: &[u8]) -> Result<(), DeviceError> {
        self.with_session(slot_id, |session| {
            for handle in Self::find(session, ObjectClass::CERTIFICATE, id)? {
                for attr in session.get_attributes(handle, &[AttributeType::Value])? {
                    if matches!(&attr, Attribute::Value(value) if value.as_slice() == der) {
                        session.destroy_object(handle)?;
                    }
                }
            }
            Ok(())
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, DeviceError> {
    mutex
        .lock()
        .map_err(|_| DeviceError::Other("PKCS#11 module lock poisoned".to_string()))
}

/// Maps PKCS#11 return values onto the device error kinds.
fn map_err(err: Pkcs11Error) -> DeviceError {
    match &err {
        Pkcs11Error::Pkcs11(rv, _) => match rv {
            RvError::PinIncorrect
            | RvError::PinInvalid
            | RvError::PinLenRange
            | RvError::PinExpired
            | RvError::PinLocked
            | RvError::UserNotLoggedIn
            | RvError::UserPinNotInitialized => DeviceError::AuthenticationFailed(err.to_string()),
            RvError::DeviceRemoved
            | RvError::TokenNotPresent
            | RvError::TokenNotRecognized
            | RvError::SlotIdInvalid
            | RvError::DeviceError
            | RvError::SessionClosed
            | RvError::SessionHandleInvalid => DeviceError::DeviceUnavailable(err.to_string()),
            RvError::OperationActive
            | RvError::SessionCount
            | RvError::UserAnotherAlreadyLoggedIn
            | RvError::UserTooManyTypes => DeviceError::DeviceBusy(err.to_string()),
            RvError::FunctionNotSupported | RvError::MechanismInvalid | RvError::KeySizeRange => {
                DeviceError::UnsupportedOperation(err.to_string())
            }
            RvError::ObjectHandleInvalid | RvError::KeyHandleInvalid => DeviceError::KeyNotFound(err.to_string()),
            _ => DeviceError::Other(err.to_string()),
        },
        _ => DeviceError::Other(err.to_string()),
    }
}
