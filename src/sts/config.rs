//! WS-Trust client configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// WS-Trust 1.3 namespace.
pub const WST_NS: &str = "http://docs.oasis-open.org/ws-sx/ws-trust/200512";

/// Namespace of the STS service and endpoint QNames.
pub const STS_SERVICE_NS: &str = "http://docs.oasis-open.org/ws-sx/ws-trust/200512/";

/// Local name of the STS service QName.
pub const SECURITY_TOKEN_SERVICE: &str = "SecurityTokenService";

/// WS-Addressing 1.0 namespace.
pub const WSA_NS: &str = "http://www.w3.org/2005/08/addressing";

/// Claims dialect of the identity metasystem.
pub const IDENTITY_NS: &str = "http://schemas.xmlsoap.org/ws/2005/05/identity";

/// SAML 2.0 token type (WSS SAML token profile 1.1).
pub const WSS_SAML2_TOKEN_TYPE: &str =
    "http://docs.oasis-open.org/wss/oasis-wss-saml-token-profile-1.1#SAMLV2.0";

/// STS client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StsConfig {
    /// STS WSDL location. A missing or zero port is resolved from the
    /// first inbound request's local port.
    pub wsdl_location: String,

    /// Local name of the STS endpoint (port) QName.
    #[serde(default = "default_wsdl_endpoint")]
    pub wsdl_endpoint: String,

    /// Explicit SOAP address. Defaults to the WSDL location without its query.
    #[serde(default)]
    pub endpoint_address: Option<String>,

    /// Requested token type URI. Defaults to SAML 2.0.
    #[serde(default)]
    pub token_type: Option<String>,

    /// Requested key confirmation.
    #[serde(default)]
    pub key_type: KeyType,

    /// Attach realm claims to requests.
    #[serde(default = "default_true")]
    pub claims_required: bool,

    /// Realm -> claim URIs table.
    #[serde(default)]
    pub realm_claims: Option<HashMap<String, Vec<String>>>,

    /// Timeout for one STS round trip when the caller gives no deadline.
    #[serde(default = "default_timeout")]
    pub request_timeout_secs: u64,

    /// WS-Addressing namespace for SOAP headers.
    #[serde(default = "default_addressing_namespace")]
    pub addressing_namespace: String,
}

fn default_wsdl_endpoint() -> String {
    "Transport_Port".to_string()
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    10
}

fn default_addressing_namespace() -> String {
    WSA_NS.to_string()
}

impl Default for StsConfig {
    fn default() -> Self {
        Self {
            wsdl_location: String::new(),
            wsdl_endpoint: default_wsdl_endpoint(),
            endpoint_address: None,
            token_type: None,
            key_type: KeyType::default(),
            claims_required: true,
            realm_claims: None,
            request_timeout_secs: default_timeout(),
            addressing_namespace: default_addressing_namespace(),
        }
    }
}

impl StsConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        let url = url::Url::parse(&self.wsdl_location)
            .map_err(|e| format!("Invalid wsdl_location '{}': {}", self.wsdl_location, e))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(format!("Unsupported wsdl_location scheme: {}", url.scheme()));
        }
        if url.host_str().is_none() {
            return Err("wsdl_location must have a host".to_string());
        }

        if let Some(ref address) = self.endpoint_address {
            url::Url::parse(address)
                .map_err(|e| format!("Invalid endpoint_address '{}': {}", address, e))?;
        }

        if self.wsdl_endpoint.trim().is_empty() {
            return Err("wsdl_endpoint must not be empty".to_string());
        }

        if self.claims_required && self.realm_claims.is_none() {
            return Err("claims_required is set but no realm_claims table is configured".to_string());
        }

        if self.request_timeout_secs == 0 {
            return Err("request_timeout_secs must be greater than zero".to_string());
        }

        Ok(())
    }

    /// Token type to request.
    pub fn effective_token_type(&self) -> &str {
        self.token_type.as_deref().unwrap_or(WSS_SAML2_TOKEN_TYPE)
    }
}

/// Key confirmation requested from the STS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyType {
    /// Holder needs no proof of possession.
    Bearer,
    /// Holder proves possession of the client certificate's key.
    #[default]
    PublicKey,
    /// Holder proves possession of an STS-issued symmetric key.
    SymmetricKey,
}

impl KeyType {
    /// WS-Trust URI for this key type.
    pub fn as_uri(&self) -> &'static str {
        match self {
            KeyType::Bearer => "http://docs.oasis-open.org/ws-sx/ws-trust/200512/Bearer",
            KeyType::PublicKey => "http://docs.oasis-open.org/ws-sx/ws-trust/200512/PublicKey",
            KeyType::SymmetricKey => {
                "http://docs.oasis-open.org/ws-sx/ws-trust/200512/SymmetricKey"
            }
        }
    }

    /// Parse from URI string.
    pub fn from_uri(uri: &str) -> Option<Self> {
        match uri {
            "http://docs.oasis-open.org/ws-sx/ws-trust/200512/Bearer" => Some(KeyType::Bearer),
            "http://docs.oasis-open.org/ws-sx/ws-trust/200512/PublicKey" => {
                Some(KeyType::PublicKey)
            }
            "http://docs.oasis-open.org/ws-sx/ws-trust/200512/SymmetricKey" => {
                Some(KeyType::SymmetricKey)
            }
            _ => None,
        }
    }
}
