//! Handlers acting on tokens as a whole.
use crate::{
    commons::{error::Error, SignerResult},
    constants::SOFT_TOKEN_DEFAULT_NAME,
    device::{drivers::softtoken::SoftTokenDriver, DeviceError, DeviceProvider, Pin},
    handlers::{Response, SignerContext},
    tokens::{DeviceKind, SyncSummary, TokenId, TokenInfo, TokenStatus},
};

impl SignerContext {
    pub(super) fn init_software_token(&self, pin: &Pin) -> SignerResult<Response> {
        let kind = DeviceKind::SoftKeystore;
        let token_id = SoftTokenDriver::token_id();
        let device = self.device(&kind)?;

        if let Ok(token) = self.tokens.token(&token_id) {
            if token.status() != TokenStatus::Uninitialized {
                return Err(Error::conflict("The software token is already initialized"));
            }
        }

        device.init_token(&token_id, pin)?;

        self.tokens.ensure_token(TokenInfo::new(
            token_id.clone(),
            kind,
            SOFT_TOKEN_DEFAULT_NAME.to_string(),
            TokenStatus::Uninitialized,
        ))?;
        self.tokens.set_token_status(&token_id, TokenStatus::PresentUnlocked)?;

        info!("Software token '{}' initialized", token_id);
        Ok(Response::Success)
    }

    pub(super) fn activate_token(&self, token_id: &TokenId, activate: bool, pin: Option<&Pin>) -> SignerResult<Response> {
        let token = self.tokens.token(token_id)?;
        match token.status() {
            TokenStatus::Uninitialized => {
                return Err(Error::conflict(format!("Token '{}' is not initialized", token_id)));
            }
            TokenStatus::NotPresent => {
                return Err(DeviceError::DeviceUnavailable(format!("token '{}' is not present", token_id)).into());
            }
            _ => {}
        }

        let device = self.device(token.device_kind())?;

        if activate {
            let pin = pin.ok_or_else(|| Error::invalid_request("a pin is required to activate a token"))?;
            device.activate(token_id, pin).map_err(|e| {
                warn!("Could not activate token '{}': {}", token_id, e);
                e
            })?;
            self.tokens.set_token_status(token_id, TokenStatus::PresentUnlocked)?;
            info!("Token '{}' activated", token_id);
        } else {
            device.deactivate(token_id)?;
            self.tokens.set_token_status(token_id, TokenStatus::PresentLocked)?;
            info!("Token '{}' deactivated", token_id);
        }

        Ok(Response::Success)
    }

    pub(super) fn update_software_token_pin(
        &self,
        token_id: &TokenId,
        old_pin: &Pin,
        new_pin: &Pin,
    ) -> SignerResult<Response> {
        let token = self.tokens.token(token_id)?;
        if token.device_kind() != &DeviceKind::SoftKeystore {
            return Err(DeviceError::unsupported(format!("token '{}' is not a software token", token_id)).into());
        }
        if token.status() == TokenStatus::Uninitialized {
            return Err(Error::conflict(format!("Token '{}' is not initialized", token_id)));
        }

        self.device(token.device_kind())?
            .change_pin(token_id, old_pin, new_pin)
            .map_err(|e| {
                warn!("Could not change pin of token '{}': {}", token_id, e);
                e
            })?;

        info!("Pin of token '{}' changed", token_id);
        Ok(Response::Success)
    }

    pub(super) fn set_token_friendly_name(&self, token_id: &TokenId, name: String) -> SignerResult<Response> {
        self.tokens.set_token_friendly_name(token_id, name)?;
        Ok(Response::Success)
    }

    pub(super) fn refresh_tokens(&self) -> SignerResult<Response> {
        self.sync_devices()?;
        let tokens = self.tokens.tokens()?;
        Ok(Response::Tokens { tokens })
    }

    /// Polls every driver and applies what it reports to the registry.
    ///
    /// A failing driver does not keep the others from being synced. The
    /// first failure is returned after all drivers were polled.
    pub fn sync_devices(&self) -> SignerResult<SyncSummary> {
        let mut summary = SyncSummary::default();
        let mut first_err = None;

        for device in self.devices.providers() {
            match self.sync_device(&device) {
                Ok(device_summary) => summary.merge(device_summary),
                Err(e) => {
                    warn!("Could not sync tokens of device '{}': {}", device.kind(), e);
                    first_err.get_or_insert(e);
                }
            }
        }

        debug!(
            "Synced devices: {} tokens added, {} removed, {} keys added, {} certificates added, {} removed",
            summary.tokens_added, summary.tokens_removed, summary.keys_added, summary.certs_added, summary.certs_removed
        );

        match first_err {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    fn sync_device(&self, device: &DeviceProvider) -> SignerResult<SyncSummary> {
        let report = device.list_tokens()?;
        self.tokens.apply_device_report(&device.kind(), report)
    }
}
