//! Realm-scoped claims for WS-Trust requests.

use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::Writer;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::config::{IDENTITY_NS, WST_NS};
use super::xml_error;
use crate::error::{BridgeError, Result};

/// Source of the realm -> claim URIs table.
pub trait ClaimsLookup: Send + Sync {
    /// Claim URIs configured for a realm, in configured order.
    fn claims_for_realm(&self, realm: &str) -> Option<Vec<String>>;
}

impl ClaimsLookup for HashMap<String, Vec<String>> {
    fn claims_for_realm(&self, realm: &str) -> Option<Vec<String>> {
        self.get(realm).cloned()
    }
}

/// Resolves claims for a relying-party realm and renders the `wst:Claims` element.
#[derive(Clone)]
pub struct ClaimsResolver {
    table: Option<Arc<dyn ClaimsLookup>>,
}

impl ClaimsResolver {
    pub fn new(table: Arc<dyn ClaimsLookup>) -> Self {
        Self { table: Some(table) }
    }

    /// Resolver without a table; every lookup fails.
    pub fn unconfigured() -> Self {
        Self { table: None }
    }

    pub fn from_map(map: HashMap<String, Vec<String>>) -> Self {
        Self::new(Arc::new(map))
    }

    /// Claim URIs for `realm`, empty when the realm has none.
    pub fn resolve_claims(&self, realm: &str) -> Result<Vec<String>> {
        let table = self.table.as_ref().ok_or_else(|| {
            BridgeError::Configuration("No realm to claims table configured".to_string())
        })?;

        let claims = table.claims_for_realm(realm).unwrap_or_default();
        if !claims.is_empty() {
            debug!(realm = %realm, claims = ?claims, "Resolved claims for realm");
        }
        Ok(claims)
    }

    /// `wst:Claims` element for `realm`, or `None` when the realm has no claims.
    pub fn claims_element(&self, realm: &str) -> Result<Option<String>> {
        let claims = self.resolve_claims(realm)?;
        if claims.is_empty() {
            return Ok(None);
        }
        render_claims(&claims).map(Some)
    }
}

impl std::fmt::Debug for ClaimsResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimsResolver")
            .field("configured", &self.table.is_some())
            .finish()
    }
}

/// Render a dialect-tagged claims container, one `ic:ClaimType` per URI.
pub fn render_claims(claims: &[String]) -> Result<String> {
    let mut writer = Writer::new(Vec::new());

    let mut root = BytesStart::new("wst:Claims");
    root.push_attribute(("xmlns:wst", WST_NS));
    root.push_attribute(("xmlns:ic", IDENTITY_NS));
    root.push_attribute(("Dialect", IDENTITY_NS));
    writer.write_event(Event::Start(root)).map_err(xml_error)?;

    for uri in claims {
        let mut claim = BytesStart::new("ic:ClaimType");
        claim.push_attribute(("Uri", uri.as_str()));
        writer.write_event(Event::Empty(claim)).map_err(xml_error)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("wst:Claims")))
        .map_err(xml_error)?;

    String::from_utf8(writer.into_inner()).map_err(xml_error)
}
