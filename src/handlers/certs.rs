//! Handlers for certificates and certificate requests.
use bytes::Bytes;

use crate::{
    commons::{error::Error, SignerResult},
    handlers::{Response, SignerContext},
    tokens::{
        CertId, CertOrigin, CertRequestId, CertRequestInfo, CertStatus, CertificateInfo, KeyId, KeyUsage,
    },
};

impl SignerContext {
    /// Records a certificate request for a key, and fixes the key's usage.
    ///
    /// A key serves one purpose: asking for a certificate with another
    /// usage than the key already has is a conflict.
    pub(super) fn generate_cert_request(
        &self,
        key_id: &KeyId,
        subject_name: String,
        usage: KeyUsage,
    ) -> SignerResult<Response> {
        let found = self.tokens.find_token_and_key(key_id)?;
        if let Some(current) = found.key.usage() {
            if current != usage {
                return Err(Error::conflict(format!(
                    "Key '{}' is used for {}, cannot request a certificate for {}",
                    key_id, current, usage
                )));
            }
        }

        let request = CertRequestInfo::new(CertRequestId::random(), subject_name);
        self.tokens.update(|r| {
            r.set_key_usage(key_id, usage)?;
            r.add_cert_request(key_id, request.clone())
        })?;

        info!("Created certificate request '{}' for key '{}'", request.id(), key_id);
        Ok(Response::CertRequest {
            key_id: key_id.clone(),
            request,
        })
    }

    pub(super) fn delete_cert_request(&self, request_id: &CertRequestId) -> SignerResult<Response> {
        self.tokens.remove_cert_request(request_id)?;
        Ok(Response::Success)
    }

    /// Adds a certificate to a key.
    ///
    /// When `on_device` is set the certificate is first stored on the
    /// token and registered as device-resident. If it answers a request,
    /// the request is removed in the same registry update.
    pub(super) fn import_cert(
        &self,
        key_id: &KeyId,
        der: Bytes,
        status: CertStatus,
        request_id: Option<&CertRequestId>,
        on_device: bool,
    ) -> SignerResult<Response> {
        let found = self.tokens.find_token_and_key(key_id)?;

        let cert_id = CertId::for_der(&der);
        if let Ok(existing) = self.tokens.find_cert(&cert_id) {
            return Err(Error::conflict(format!(
                "Certificate '{}' already exists for key '{}'",
                cert_id, existing.key_id
            )));
        }

        if let Some(request_id) = request_id {
            self.tokens.read(|r| check_request_owner(r.find_cert_request(request_id)?, key_id, request_id))?;
        }

        let origin = if on_device {
            self.device(&found.device_kind)?.import_cert(&found.token_id, key_id, &der)?;
            CertOrigin::DeviceResident
        } else {
            CertOrigin::SavedToConfiguration
        };

        let cert = CertificateInfo::new(der, origin, status);
        self.tokens.update(|r| {
            r.add_cert(key_id, cert)?;
            if let Some(request_id) = request_id {
                check_request_owner(r.find_cert_request(request_id)?, key_id, request_id)?;
                r.remove_cert_request(request_id)?;
            }
            Ok(())
        })?;

        info!("Imported certificate '{}' for key '{}'", cert_id, key_id);
        Ok(Response::CertImported { cert_id })
    }

    /// Deletes a certificate.
    ///
    /// Certificates saved to the configuration are removed from the
    /// registry only. Device-resident certificates are removed from the
    /// device first, and from the registry only when that succeeded.
    pub(super) fn delete_cert(&self, cert_id: &CertId) -> SignerResult<Response> {
        let found = self.tokens.find_cert(cert_id)?;

        if !found.cert.is_saved_to_configuration() {
            let device = self.device(&found.device_kind)?;
            device
                .delete_cert(&found.token_id, &found.key_id, found.cert.der())
                .map_err(|e| {
                    warn!("Could not delete certificate '{}' from token '{}': {}", cert_id, found.token_id, e);
                    e
                })?;
        }

        self.tokens.remove_cert_of_key(&found.key_id, cert_id)?;
        info!("Deleted certificate '{}' of key '{}'", cert_id, found.key_id);
        Ok(Response::Success)
    }

    pub(super) fn set_cert_status(&self, cert_id: &CertId, status: CertStatus) -> SignerResult<Response> {
        self.tokens.update_cert_status(cert_id, status)?;
        Ok(Response::Success)
    }
}

fn check_request_owner(owner: &KeyId, key_id: &KeyId, request_id: &CertRequestId) -> SignerResult<()> {
    if owner == key_id {
        Ok(())
    } else {
        Err(Error::conflict(format!(
            "Certificate request '{}' does not belong to key '{}'",
            request_id, key_id
        )))
    }
}
