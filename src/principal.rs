//! Authenticated principals handed to the bridge by the transport layer.

use base64::{engine::general_purpose::STANDARD, Engine};
use x509_parser::prelude::*;

use crate::error::{BridgeError, Result};

/// Identity asserted by the upstream IdP.
///
/// Owned by the authentication layer; the bridge only borrows it.
#[derive(Debug, Clone)]
pub struct FederatedPrincipal {
    /// Subject name (NameID of the assertion).
    pub name: String,
    /// The original security token (SAML assertion XML), if the session kept it.
    pub login_token: Option<String>,
    /// Client certificate chain presented on the authenticating connection, leaf first.
    pub certificate_chain: Vec<ClientCertificate>,
}

impl FederatedPrincipal {
    pub fn new(name: impl Into<String>, login_token: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            login_token: Some(login_token.into()),
            certificate_chain: Vec::new(),
        }
    }

    pub fn with_certificate(mut self, cert: ClientCertificate) -> Self {
        self.certificate_chain.push(cert);
        self
    }

    /// Leaf certificate of the chain.
    pub fn leaf_certificate(&self) -> Option<&ClientCertificate> {
        self.certificate_chain.first()
    }
}

/// Principal materialized by an authentication interceptor.
#[derive(Debug, Clone)]
pub enum Principal {
    /// Authenticated through a federation protocol; carries the assertion.
    Federated(FederatedPrincipal),
    /// Authenticated by other means (basic auth, API key, ...).
    Other { name: String, method: String },
}

impl Principal {
    pub fn name(&self) -> &str {
        match self {
            Principal::Federated(p) => &p.name,
            Principal::Other { name, .. } => name,
        }
    }

    pub fn as_federated(&self) -> Option<&FederatedPrincipal> {
        match self {
            Principal::Federated(p) => Some(p),
            Principal::Other { .. } => None,
        }
    }
}

impl From<FederatedPrincipal> for Principal {
    fn from(p: FederatedPrincipal) -> Self {
        Principal::Federated(p)
    }
}

/// Parsed certificate details, for logging and audit.
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    /// Subject Common Name.
    pub subject_cn: Option<String>,
    /// Full Subject Distinguished Name.
    pub subject_dn: String,
    /// Issuer Distinguished Name.
    pub issuer_dn: String,
    /// Certificate serial number (hex).
    pub serial: String,
    /// Not valid before (Unix timestamp).
    pub not_before: i64,
    /// Not valid after (Unix timestamp).
    pub not_after: i64,
}

/// An X.509 client certificate in DER form.
#[derive(Debug, Clone)]
pub struct ClientCertificate {
    der: Vec<u8>,
    info: CertificateInfo,
}

impl ClientCertificate {
    /// Parse a certificate from DER bytes.
    pub fn from_der(der: Vec<u8>) -> Result<Self> {
        let info = parse_certificate(&der)?;
        Ok(Self { der, info })
    }

    /// Parse a certificate from PEM or from bare base64 DER (as forwarded by proxies).
    pub fn parse(data: &str) -> Result<Self> {
        let der = decode_cert_data(data)?;
        Self::from_der(der)
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn info(&self) -> &CertificateInfo {
        &self.info
    }

    /// Base64 DER, as carried in `ds:X509Certificate`.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.der)
    }
}

fn decode_cert_data(data: &str) -> Result<Vec<u8>> {
    let data = data.trim();

    if data.contains("-----BEGIN CERTIFICATE-----") {
        let start_marker = "-----BEGIN CERTIFICATE-----";
        let end_marker = "-----END CERTIFICATE-----";

        let start = data
            .find(start_marker)
            .ok_or_else(|| BridgeError::Configuration("Invalid PEM: missing BEGIN marker".into()))?;
        let end = data
            .find(end_marker)
            .ok_or_else(|| BridgeError::Configuration("Invalid PEM: missing END marker".into()))?;

        let base64_content: String = data[start + start_marker.len()..end]
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();

        STANDARD.decode(&base64_content).map_err(|e| {
            BridgeError::Configuration(format!("Failed to decode PEM base64 content: {}", e))
        })
    } else {
        let compact: String = data.chars().filter(|c| !c.is_whitespace()).collect();
        STANDARD.decode(compact.as_bytes()).map_err(|e| {
            BridgeError::Configuration(format!("Failed to base64 decode certificate: {}", e))
        })
    }
}

fn parse_certificate(der_bytes: &[u8]) -> Result<CertificateInfo> {
    let (_, cert) = X509Certificate::from_der(der_bytes).map_err(|e| {
        BridgeError::Configuration(format!("Failed to parse X.509 certificate: {:?}", e))
    })?;

    let subject_cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(String::from);

    let serial = cert
        .serial
        .to_bytes_be()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":");

    Ok(CertificateInfo {
        subject_cn,
        subject_dn: cert.subject().to_string(),
        issuer_dn: cert.issuer().to_string(),
        serial,
        not_before: cert.validity().not_before.timestamp(),
        not_after: cert.validity().not_after.timestamp(),
    })
}
