//! Typed requests and their handlers.
//!
//! Every request kind has one handler. Handlers resolve identifiers
//! against the registry at the time they run, call the device driver
//! where the request concerns key material, and apply their changes
//! through [`TokenManager`]. They never call each other.
use std::{fmt, sync::Arc};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    commons::{error::Error, util::ext_serde, SignerEmptyResult, SignerResult},
    device::{DeviceProvider, DeviceRouter, Pin},
    tokens::{
        validate_identifier, CertId, CertRequestId, CertRequestInfo, CertStatus, DeviceKind, KeyId, KeyInfo,
        KeyUsage, TokenId, TokenInfo, TokenManager,
    },
};

mod certs;
mod keys;
mod query;
mod tokens;

//------------ Request -------------------------------------------------------

/// A request as delivered by the transport.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Request {
    ListTokens,
    GetTokenInfo {
        token_id: TokenId,
    },
    GetKeyInfo {
        key_id: KeyId,
    },
    InitSoftwareToken {
        pin: Pin,
    },
    ActivateToken {
        token_id: TokenId,
        activate: bool,
        #[serde(default)]
        pin: Option<Pin>,
    },
    UpdateSoftwareTokenPin {
        token_id: TokenId,
        old_pin: Pin,
        new_pin: Pin,
    },
    SetTokenFriendlyName {
        token_id: TokenId,
        name: String,
    },
    GenerateKey {
        token_id: TokenId,
        #[serde(default)]
        label: Option<String>,
    },
    DeleteKey {
        key_id: KeyId,
        #[serde(default)]
        delete_from_device: bool,
    },
    SetKeyFriendlyName {
        key_id: KeyId,
        name: String,
    },
    SetKeyUsage {
        key_id: KeyId,
        usage: KeyUsage,
    },
    GenerateCertRequest {
        key_id: KeyId,
        subject_name: String,
        usage: KeyUsage,
    },
    DeleteCertRequest {
        request_id: CertRequestId,
    },
    ImportCert {
        key_id: KeyId,
        #[serde(deserialize_with = "ext_serde::de_bytes")]
        cert: Bytes,
        #[serde(default = "default_cert_status")]
        status: CertStatus,
        #[serde(default)]
        request_id: Option<CertRequestId>,
        #[serde(default)]
        on_device: bool,
    },
    DeleteCert {
        cert_id: CertId,
    },
    SetCertStatus {
        cert_id: CertId,
        status: CertStatus,
    },
    Sign {
        key_id: KeyId,
        #[serde(deserialize_with = "ext_serde::de_bytes")]
        data: Bytes,
    },
    RefreshTokens,
}

fn default_cert_status() -> CertStatus {
    CertStatus::Registered
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::ListTokens => "list-tokens",
            Request::GetTokenInfo { .. } => "get-token-info",
            Request::GetKeyInfo { .. } => "get-key-info",
            Request::InitSoftwareToken { .. } => "init-software-token",
            Request::ActivateToken { .. } => "activate-token",
            Request::UpdateSoftwareTokenPin { .. } => "update-software-token-pin",
            Request::SetTokenFriendlyName { .. } => "set-token-friendly-name",
            Request::GenerateKey { .. } => "generate-key",
            Request::DeleteKey { .. } => "delete-key",
            Request::SetKeyFriendlyName { .. } => "set-key-friendly-name",
            Request::SetKeyUsage { .. } => "set-key-usage",
            Request::GenerateCertRequest { .. } => "generate-cert-request",
            Request::DeleteCertRequest { .. } => "delete-cert-request",
            Request::ImportCert { .. } => "import-cert",
            Request::DeleteCert { .. } => "delete-cert",
            Request::SetCertStatus { .. } => "set-cert-status",
            Request::Sign { .. } => "sign",
            Request::RefreshTokens => "refresh-tokens",
        }
    }

    /// Whether the request changes the registry or a device.
    ///
    /// Signing uses the device but changes nothing, so it does not need
    /// to wait for other writers.
    pub fn is_mutating(&self) -> bool {
        !matches!(
            self,
            Request::ListTokens | Request::GetTokenInfo { .. } | Request::GetKeyInfo { .. } | Request::Sign { .. }
        )
    }

    /// Checks that all identifiers and values are well formed.
    pub fn validate(&self) -> SignerEmptyResult {
        match self {
            Request::ListTokens | Request::RefreshTokens => Ok(()),
            Request::GetTokenInfo { token_id } => validate_identifier("token id", token_id.as_str()),
            Request::GetKeyInfo { key_id } => validate_identifier("key id", key_id.as_str()),
            Request::InitSoftwareToken { pin } => validate_pin("pin", pin),
            Request::ActivateToken {
                token_id,
                activate,
                pin,
            } => {
                validate_identifier("token id", token_id.as_str())?;
                match (activate, pin) {
                    (true, Some(pin)) => validate_pin("pin", pin),
                    (true, None) => Err(Error::invalid_request("a pin is required to activate a token")),
                    (false, _) => Ok(()),
                }
            }
            Request::UpdateSoftwareTokenPin {
                token_id,
                old_pin,
                new_pin,
            } => {
                validate_identifier("token id", token_id.as_str())?;
                validate_pin("old pin", old_pin)?;
                validate_pin("new pin", new_pin)
            }
            Request::SetTokenFriendlyName { token_id, name } => {
                validate_identifier("token id", token_id.as_str())?;
                validate_identifier("friendly name", name)
            }
            Request::GenerateKey { token_id, label } => {
                validate_identifier("token id", token_id.as_str())?;
                match label {
                    Some(label) => validate_identifier("key label", label),
                    None => Ok(()),
                }
            }
            Request::DeleteKey { key_id, .. } | Request::SetKeyUsage { key_id, .. } | Request::Sign { key_id, .. } => {
                validate_identifier("key id", key_id.as_str())
            }
            Request::SetKeyFriendlyName { key_id, name } => {
                validate_identifier("key id", key_id.as_str())?;
                validate_identifier("friendly name", name)
            }
            Request::GenerateCertRequest {
                key_id, subject_name, ..
            } => {
                validate_identifier("key id", key_id.as_str())?;
                validate_identifier("subject name", subject_name)
            }
            Request::DeleteCertRequest { request_id } => validate_identifier("request id", request_id.as_str()),
            Request::ImportCert {
                key_id,
                cert,
                request_id,
                ..
            } => {
                validate_identifier("key id", key_id.as_str())?;
                if cert.is_empty() {
                    return Err(Error::invalid_request("certificate must not be empty"));
                }
                match request_id {
                    Some(request_id) => validate_identifier("request id", request_id.as_str()),
                    None => Ok(()),
                }
            }
            Request::DeleteCert { cert_id } | Request::SetCertStatus { cert_id, .. } => {
                validate_identifier("certificate id", cert_id.as_str())
            }
        }
    }
}

fn validate_pin(what: &str, pin: &Pin) -> SignerEmptyResult {
    if pin.is_empty() {
        Err(Error::invalid_request(format!("{} must not be empty", what)))
    } else {
        Ok(())
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.name().fmt(f)
    }
}

//------------ Response ------------------------------------------------------

/// The typed result of a successful request.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "kebab-case")]
pub enum Response {
    /// An empty acknowledgement.
    Nothing,

    /// A success acknowledgement without further payload.
    Success,

    Tokens {
        tokens: Vec<TokenInfo>,
    },
    Token {
        token: TokenInfo,
    },
    Key {
        token_id: TokenId,
        key: KeyInfo,
    },
    KeyGenerated {
        key: KeyInfo,
    },
    CertRequest {
        key_id: KeyId,
        request: CertRequestInfo,
    },
    CertImported {
        cert_id: CertId,
    },
    Signature {
        #[serde(serialize_with = "ext_serde::ser_bytes")]
        signature: Bytes,
    },
}

//------------ SignerContext -------------------------------------------------

/// Everything a handler needs: the registry authority and the drivers.
///
/// Passed to handlers explicitly. There is no global state, so every
/// test can run against its own registry.
#[derive(Clone, Debug)]
pub struct SignerContext {
    tokens: Arc<TokenManager>,
    devices: Arc<DeviceRouter>,
}

impl SignerContext {
    pub fn new(tokens: Arc<TokenManager>, devices: Arc<DeviceRouter>) -> Self {
        SignerContext { tokens, devices }
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    pub fn devices(&self) -> &DeviceRouter {
        &self.devices
    }

    /// Runs the handler for a request.
    ///
    /// Callers are expected to have validated the request, and to
    /// serialize mutating requests.
    pub fn handle(&self, request: Request) -> SignerResult<Response> {
        match request {
            Request::ListTokens => self.list_tokens(),
            Request::GetTokenInfo { token_id } => self.get_token_info(&token_id),
            Request::GetKeyInfo { key_id } => self.get_key_info(&key_id),
            Request::InitSoftwareToken { pin } => self.init_software_token(&pin),
            Request::ActivateToken {
                token_id,
                activate,
                pin,
            } => self.activate_token(&token_id, activate, pin.as_ref()),
            Request::UpdateSoftwareTokenPin {
                token_id,
                old_pin,
                new_pin,
            } => self.update_software_token_pin(&token_id, &old_pin, &new_pin),
            Request::SetTokenFriendlyName { token_id, name } => self.set_token_friendly_name(&token_id, name),
            Request::GenerateKey { token_id, label } => self.generate_key(&token_id, label.as_deref()),
            Request::DeleteKey {
                key_id,
                delete_from_device,
            } => self.delete_key(&key_id, delete_from_device),
            Request::SetKeyFriendlyName { key_id, name } => self.set_key_friendly_name(&key_id, name),
            Request::SetKeyUsage { key_id, usage } => self.set_key_usage(&key_id, usage),
            Request::GenerateCertRequest {
                key_id,
                subject_name,
                usage,
            } => self.generate_cert_request(&key_id, subject_name, usage),
            Request::DeleteCertRequest { request_id } => self.delete_cert_request(&request_id),
            Request::ImportCert {
                key_id,
                cert,
                status,
                request_id,
                on_device,
            } => self.import_cert(&key_id, cert, status, request_id.as_ref(), on_device),
            Request::DeleteCert { cert_id } => self.delete_cert(&cert_id),
            Request::SetCertStatus { cert_id, status } => self.set_cert_status(&cert_id, status),
            Request::Sign { key_id, data } => self.sign(&key_id, &data),
            Request::RefreshTokens => self.refresh_tokens(),
        }
    }

    fn device(&self, kind: &DeviceKind) -> SignerResult<Arc<DeviceProvider>> {
        self.devices.get(kind)
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use std::path::Path;

    use super::*;

    use crate::{
        commons::{error::ErrorKind, test},
        device::drivers::mock::{MockDriver, MockDriverCallCounts},
    };

    pub fn mock_kind() -> DeviceKind {
        DeviceKind::HardwareModule("mock".to_string())
    }

    pub fn context(dir: &Path, driver: MockDriver) -> SignerContext {
        let tokens = Arc::new(TokenManager::build(dir).unwrap());
        let devices = Arc::new(DeviceRouter::build(vec![DeviceProvider::Mock(driver)]).unwrap());
        SignerContext::new(tokens, devices)
    }

    pub fn mock_driver(counts: &Arc<MockDriverCallCounts>) -> MockDriver {
        MockDriver::new(mock_kind(), counts.clone()).with_token("t1", "1234")
    }

    #[test]
    fn parse_requests() {
        let json = r#"{ "kind": "delete-key", "key_id": "k1", "delete_from_device": true }"#;
        let request: Request = serde_json::from_str(json).unwrap();
        assert!(matches!(
            &request,
            Request::DeleteKey { key_id, delete_from_device: true } if key_id.as_str() == "k1"
        ));
        assert!(request.is_mutating());

        let json = r#"{ "kind": "sign", "key_id": "k1", "data": "AQID" }"#;
        let request: Request = serde_json::from_str(json).unwrap();
        assert!(matches!(&request, Request::Sign { data, .. } if data.as_ref() == [1, 2, 3]));
        assert!(!request.is_mutating());

        let json = r#"{ "kind": "import-cert", "key_id": "k1", "cert": "AQID" }"#;
        let request: Request = serde_json::from_str(json).unwrap();
        assert!(matches!(
            request,
            Request::ImportCert {
                status: CertStatus::Registered,
                request_id: None,
                on_device: false,
                ..
            }
        ));

        let json = r#"{ "kind": "drop-everything" }"#;
        assert!(serde_json::from_str::<Request>(json).is_err());
    }

    #[test]
    fn validate_requests() {
        let bad_id = Request::GetKeyInfo { key_id: KeyId::from("") };
        assert_eq!(bad_id.validate().unwrap_err().kind(), ErrorKind::InvalidRequest);

        let control = Request::GetTokenInfo {
            token_id: TokenId::from("t\n1"),
        };
        assert_eq!(control.validate().unwrap_err().kind(), ErrorKind::InvalidRequest);

        let no_pin = Request::ActivateToken {
            token_id: TokenId::from("t1"),
            activate: true,
            pin: None,
        };
        assert_eq!(no_pin.validate().unwrap_err().kind(), ErrorKind::InvalidRequest);

        let logout = Request::ActivateToken {
            token_id: TokenId::from("t1"),
            activate: false,
            pin: None,
        };
        assert!(logout.validate().is_ok());

        let empty_pin = Request::InitSoftwareToken { pin: Pin::from("") };
        assert_eq!(empty_pin.validate().unwrap_err().kind(), ErrorKind::InvalidRequest);

        let no_subject = Request::GenerateCertRequest {
            key_id: KeyId::from("k1"),
            subject_name: String::new(),
            usage: KeyUsage::Signing,
        };
        assert_eq!(no_subject.validate().unwrap_err().kind(), ErrorKind::InvalidRequest);
    }

    #[test]
    fn responses_serialize_with_result_tag() {
        let json = serde_json::to_string(&Response::Nothing).unwrap();
        assert_eq!(json, r#"{"result":"nothing"}"#);

        let signature = Response::Signature {
            signature: Bytes::from_static(&[1, 2, 3]),
        };
        let json = serde_json::to_string(&signature).unwrap();
        assert_eq!(json, r#"{"result":"signature","signature":"AQID"}"#);
    }

    #[test]
    fn unknown_key_is_not_found_and_changes_nothing() {
        test::test_under_tmp(|d| {
            let counts = Arc::new(MockDriverCallCounts::new());
            let ctx = context(&d, mock_driver(&counts));
            ctx.tokens().ensure_token(test::token("t1", mock_kind())).unwrap();
            let before = std::fs::read(d.join("tokens.json")).unwrap();

            for request in [
                Request::DeleteKey {
                    key_id: KeyId::from("nope"),
                    delete_from_device: false,
                },
                Request::DeleteKey {
                    key_id: KeyId::from("nope"),
                    delete_from_device: true,
                },
                Request::GetKeyInfo {
                    key_id: KeyId::from("nope"),
                },
            ] {
                assert_eq!(ctx.handle(request).unwrap_err().kind(), ErrorKind::NotFound);
            }

            assert_eq!(std::fs::read(d.join("tokens.json")).unwrap(), before);
            assert_eq!(counts.get(crate::device::drivers::mock::FnIdx::DeleteKey), 0);
        })
    }
}
