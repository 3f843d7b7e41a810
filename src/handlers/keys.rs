//! Handlers acting on keys.
use crate::{
    commons::SignerResult,
    device::DeviceError,
    handlers::{Response, SignerContext},
    tokens::{KeyId, KeyInfo, KeyUsage, TokenId},
};

impl SignerContext {
    pub(super) fn generate_key(&self, token_id: &TokenId, label: Option<&str>) -> SignerResult<Response> {
        let token = self.tokens.token(token_id)?;
        if !token.status().is_active() {
            return Err(DeviceError::not_active(token_id).into());
        }

        let device_key = self.device(token.device_kind())?.generate_key(token_id, label)?;
        let key = KeyInfo::new(token_id.clone(), device_key.id, device_key.label);

        if let Err(e) = self.tokens.add_key(token_id, key.clone()) {
            // The key exists on the device, a later refresh will pick it up.
            error!(
                "Generated key '{}' on token '{}' but could not register it: {}",
                key.id(),
                token_id,
                e
            );
            return Err(e);
        }

        info!("Generated key '{}' on token '{}'", key.id(), token_id);
        Ok(Response::KeyGenerated { key })
    }

    /// Deletes a key from the device, or its configuration from the
    /// registry.
    ///
    /// From the device: the key material is erased first, and only if the
    /// device confirms is the key dropped from the registry. A key the last
    /// refresh no longer found on its token counts as confirmed when the
    /// device says it does not know the key. The answer carries nothing.
    ///
    /// From the configuration: every certificate saved to the
    /// configuration and every certificate request of the key is removed.
    /// The key itself and its device-resident certificates stay. Each
    /// removal is committed on its own; the first failure stops the
    /// handler and leaves earlier removals in place.
    pub(super) fn delete_key(&self, key_id: &KeyId, delete_from_device: bool) -> SignerResult<Response> {
        let found = self.tokens.find_token_and_key(key_id)?;

        if delete_from_device {
            let device = self.device(&found.device_kind)?;
            match device.delete_key(&found.token_id, key_id) {
                Ok(()) => {}
                Err(DeviceError::KeyNotFound(_)) if !found.key.available() => {
                    debug!(
                        "Key '{}' was already gone from token '{}', dropping it from the registry",
                        key_id, found.token_id
                    );
                }
                Err(e) => {
                    warn!("Could not delete key '{}' from token '{}': {}", key_id, found.token_id, e);
                    return Err(e.into());
                }
            }
            self.tokens.remove_key(key_id)?;

            info!("Deleted key '{}' from token '{}'", key_id, found.token_id);
            Ok(Response::Nothing)
        } else {
            for cert_id in found.key.configuration_cert_ids() {
                self.tokens.remove_cert_of_key(key_id, &cert_id)?;
            }
            for request_id in found.key.cert_request_ids() {
                self.tokens.remove_cert_request(&request_id)?;
            }

            info!("Deleted configuration of key '{}'", key_id);
            Ok(Response::Success)
        }
    }

    pub(super) fn set_key_friendly_name(&self, key_id: &KeyId, name: String) -> SignerResult<Response> {
        self.tokens.set_key_friendly_name(key_id, name)?;
        Ok(Response::Success)
    }

    pub(super) fn set_key_usage(&self, key_id: &KeyId, usage: KeyUsage) -> SignerResult<Response> {
        self.tokens.set_key_usage(key_id, usage)?;
        Ok(Response::Success)
    }

    /// Signs outside of any registry lock. The registry is only read to
    /// find the token.
    pub(super) fn sign(&self, key_id: &KeyId, data: &[u8]) -> SignerResult<Response> {
        let found = self.tokens.find_token_and_key(key_id)?;
        if !found.key.available() {
            return Err(DeviceError::KeyNotFound(format!("key '{}' is not available on its token", key_id)).into());
        }
        if !found.token_status.is_active() {
            return Err(DeviceError::not_active(&found.token_id).into());
        }

        let signature = self.device(&found.device_kind)?.sign(&found.token_id, key_id, data)?;
        trace!("Signed {} bytes with key '{}'", data.len(), key_id);
        Ok(Response::Signature { signature })
    }
}
