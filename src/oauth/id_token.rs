//! OpenID Connect ID Tokens minted from federated principals.

use chrono::{DateTime, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::QName as XmlName;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use super::signer::SignerProvider;
use super::types::{expiry_after, Client};
use crate::error::{BridgeError, Result};
use crate::principal::Principal;

/// ID Token claim set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdTokenClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// Issuer of the SAML assertion the token was derived from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saml_issuer: Option<String>,
}

/// Converts a SAML assertion into ID Token claims.
pub trait SamlTokenConverter: Send + Sync {
    fn convert_to_id_token(
        &self,
        assertion: &str,
        subject: &str,
        client_id: &str,
    ) -> Result<IdTokenClaims>;
}

/// Claims derived locally from the assertion, without calling out.
pub struct LocalSamlTokenConverter {
    issuer: String,
    ttl_secs: u64,
}

impl LocalSamlTokenConverter {
    pub fn new(issuer: impl Into<String>, ttl_secs: u64) -> Self {
        Self {
            issuer: issuer.into(),
            ttl_secs,
        }
    }
}

impl SamlTokenConverter for LocalSamlTokenConverter {
    fn convert_to_id_token(
        &self,
        assertion: &str,
        subject: &str,
        client_id: &str,
    ) -> Result<IdTokenClaims> {
        let facts = AssertionFacts::parse(assertion)?;
        let issued_at = Utc::now();
        let now = issued_at.timestamp();

        let mut exp = expiry_after(issued_at, self.ttl_secs)?.timestamp();
        if let Some(not_on_or_after) = facts.not_on_or_after {
            if not_on_or_after <= now {
                return Err(BridgeError::UnsupportedPrincipal(
                    "assertion is no longer valid".to_string(),
                ));
            }
            exp = exp.min(not_on_or_after);
        }

        Ok(IdTokenClaims {
            iss: self.issuer.clone(),
            sub: subject.to_string(),
            aud: client_id.to_string(),
            iat: now,
            exp,
            auth_time: facts.authn_instant,
            nonce: None,
            saml_issuer: facts.issuer,
        })
    }
}

/// What the converter reads from an assertion.
#[derive(Debug, Default, PartialEq, Eq)]
struct AssertionFacts {
    issuer: Option<String>,
    not_on_or_after: Option<i64>,
    authn_instant: Option<i64>,
}

impl AssertionFacts {
    fn parse(assertion: &str) -> Result<Self> {
        let malformed = |e: &dyn std::fmt::Display| {
            BridgeError::UnsupportedPrincipal(format!("Malformed SAML assertion: {}", e))
        };

        let mut reader = Reader::from_str(assertion);
        let mut facts = AssertionFacts::default();
        let mut saw_assertion = false;

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    match e.local_name().as_ref() {
                        b"Assertion" => saw_assertion = true,
                        b"Issuer" if facts.issuer.is_none() => {
                            let name = e.name().as_ref().to_vec();
                            let text = reader
                                .read_text(XmlName(&name))
                                .map_err(|err| malformed(&err))?;
                            facts.issuer = Some(text.trim().to_string());
                            continue;
                        }
                        _ => {}
                    }
                    facts.read_attributes(&e)?;
                }
                Ok(Event::Empty(e)) => facts.read_attributes(&e)?,
                Ok(Event::Eof) => break,
                Err(e) => return Err(malformed(&e)),
                _ => {}
            }
        }

        if !saw_assertion {
            return Err(BridgeError::UnsupportedPrincipal(
                "login token is not a SAML assertion".to_string(),
            ));
        }
        Ok(facts)
    }

    fn read_attributes(&mut self, e: &BytesStart<'_>) -> Result<()> {
        match e.local_name().as_ref() {
            b"Conditions" if self.not_on_or_after.is_none() => {
                self.not_on_or_after = timestamp_attribute(e, "NotOnOrAfter")?;
            }
            b"AuthnStatement" if self.authn_instant.is_none() => {
                self.authn_instant = timestamp_attribute(e, "AuthnInstant")?;
            }
            _ => {}
        }
        Ok(())
    }
}

fn timestamp_attribute(e: &BytesStart<'_>, name: &str) -> Result<Option<i64>> {
    let invalid = |detail: String| {
        BridgeError::UnsupportedPrincipal(format!("Invalid {} in SAML assertion: {}", name, detail))
    };

    let attr = match e.try_get_attribute(name).map_err(|err| invalid(err.to_string()))? {
        Some(attr) => attr,
        None => return Ok(None),
    };
    let value = attr.unescape_value().map_err(|err| invalid(err.to_string()))?;
    let instant = DateTime::parse_from_rfc3339(value.trim())
        .map_err(|err| invalid(err.to_string()))?;
    Ok(Some(instant.with_timezone(&Utc).timestamp()))
}

/// Produces the signed ID Token attached to an authorization grant.
pub struct IdTokenMinter {
    converter: Arc<dyn SamlTokenConverter>,
    signers: Arc<dyn SignerProvider>,
}

impl IdTokenMinter {
    pub fn new(converter: Arc<dyn SamlTokenConverter>, signers: Arc<dyn SignerProvider>) -> Self {
        Self { converter, signers }
    }

    /// Mint a signed ID Token for `client`.
    ///
    /// Only federated principals carrying their login assertion are accepted.
    pub fn mint(&self, principal: &Principal, client: &Client, nonce: Option<&str>) -> Result<String> {
        let federated = principal.as_federated().ok_or_else(|| {
            BridgeError::UnsupportedPrincipal(format!(
                "'{}' was not authenticated through federation",
                principal.name()
            ))
        })?;

        let assertion = federated.login_token.as_deref().ok_or_else(|| {
            BridgeError::UnsupportedPrincipal(format!(
                "'{}' carries no login assertion",
                federated.name
            ))
        })?;

        let mut claims =
            self.converter
                .convert_to_id_token(assertion, &federated.name, &client.client_id)?;
        claims.nonce = nonce.map(str::to_string);

        let signer = self.signers.signer_for(client)?;
        let token = signer.sign(&claims)?;

        debug!(
            sub = %claims.sub,
            client_id = %client.client_id,
            signer = ?signer.kind(),
            exp = claims.exp,
            "Minted ID Token"
        );

        Ok(token)
    }
}
