//! WS-Trust `RequestSecurityToken` construction.

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::io::Write;

use super::config::{KeyType, WST_NS};
use super::xml_error;
use crate::error::Result;
use crate::principal::ClientCertificate;

/// SOAP 1.1 envelope namespace.
pub const SOAP11_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";

/// WS-Policy namespace (for `AppliesTo`).
pub const WSP_NS: &str = "http://www.w3.org/ns/ws-policy";

/// XML Signature namespace (for `KeyInfo`).
pub const DS_NS: &str = "http://www.w3.org/2000/09/xmldsig#";

/// WS-Addressing action of an Issue request.
pub const RST_ISSUE_ACTION: &str = "http://docs.oasis-open.org/ws-sx/ws-trust/200512/RST/Issue";

/// WS-Trust Issue request type.
pub const ISSUE_REQUEST_TYPE: &str = "http://docs.oasis-open.org/ws-sx/ws-trust/200512/Issue";

/// Key size requested for symmetric proof keys.
pub const SYMMETRIC_KEY_SIZE: u32 = 256;

/// Qualified XML name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QName {
    pub namespace: String,
    pub local: String,
}

impl QName {
    pub fn new(namespace: impl Into<String>, local: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            local: local.into(),
        }
    }
}

impl std::fmt::Display for QName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{{}}}{}", self.namespace, self.local)
    }
}

/// A pending STS exchange. Built per request, never persisted.
#[derive(Debug, Clone)]
pub struct TokenRequest {
    /// Target relying-party realm.
    pub applies_to: String,
    /// STS service QName.
    pub service_name: QName,
    /// STS endpoint QName.
    pub endpoint_name: QName,
    /// SOAP address the request is posted to.
    pub address: String,
    /// Requested token type URI.
    pub token_type: String,
    /// Key confirmation actually requested.
    pub key_type: KeyType,
    /// Rendered `wst:Claims` element.
    pub claims: Option<String>,
    /// Dialect of `claims`.
    pub claims_dialect: Option<String>,
    /// Token the new one is issued on behalf of (assertion XML).
    pub on_behalf_of: String,
    /// Certificate bound as proof key (public-key confirmation only).
    pub use_key: Option<ClientCertificate>,
    /// WS-Addressing namespace for headers.
    pub addressing_namespace: String,
    /// Request context attribute, echoed back by the STS.
    pub context: String,
}

impl TokenRequest {
    /// Serialize as a SOAP 1.1 envelope.
    pub fn to_soap_envelope(&self) -> Result<String> {
        let mut w = Writer::new(Vec::new());

        let mut envelope = BytesStart::new("soap:Envelope");
        envelope.push_attribute(("xmlns:soap", SOAP11_NS));
        envelope.push_attribute(("xmlns:wsa", self.addressing_namespace.as_str()));
        envelope.push_attribute(("xmlns:wst", WST_NS));
        start(&mut w, envelope)?;

        start(&mut w, BytesStart::new("soap:Header"))?;
        text_element(&mut w, "wsa:Action", RST_ISSUE_ACTION)?;
        text_element(&mut w, "wsa:MessageID", &format!("urn:uuid:{}", uuid::Uuid::new_v4()))?;
        text_element(&mut w, "wsa:To", &self.address)?;
        end(&mut w, "soap:Header")?;

        start(&mut w, BytesStart::new("soap:Body"))?;
        let mut rst = BytesStart::new("wst:RequestSecurityToken");
        rst.push_attribute(("Context", self.context.as_str()));
        start(&mut w, rst)?;

        text_element(&mut w, "wst:RequestType", ISSUE_REQUEST_TYPE)?;

        let mut applies_to = BytesStart::new("wsp:AppliesTo");
        applies_to.push_attribute(("xmlns:wsp", WSP_NS));
        start(&mut w, applies_to)?;
        start(&mut w, BytesStart::new("wsa:EndpointReference"))?;
        text_element(&mut w, "wsa:Address", &self.applies_to)?;
        end(&mut w, "wsa:EndpointReference")?;
        end(&mut w, "wsp:AppliesTo")?;

        text_element(&mut w, "wst:TokenType", &self.token_type)?;
        text_element(&mut w, "wst:KeyType", self.key_type.as_uri())?;

        match self.key_type {
            KeyType::PublicKey => {
                if let Some(ref cert) = self.use_key {
                    start(&mut w, BytesStart::new("wst:UseKey"))?;
                    let mut key_info = BytesStart::new("ds:KeyInfo");
                    key_info.push_attribute(("xmlns:ds", DS_NS));
                    start(&mut w, key_info)?;
                    start(&mut w, BytesStart::new("ds:X509Data"))?;
                    text_element(&mut w, "ds:X509Certificate", &cert.to_base64())?;
                    end(&mut w, "ds:X509Data")?;
                    end(&mut w, "ds:KeyInfo")?;
                    end(&mut w, "wst:UseKey")?;
                }
            }
            KeyType::SymmetricKey => {
                text_element(&mut w, "wst:KeySize", &SYMMETRIC_KEY_SIZE.to_string())?;
            }
            KeyType::Bearer => {}
        }

        if let Some(ref claims) = self.claims {
            raw(&mut w, claims)?;
        }

        start(&mut w, BytesStart::new("wst:OnBehalfOf"))?;
        raw(&mut w, strip_xml_declaration(&self.on_behalf_of))?;
        end(&mut w, "wst:OnBehalfOf")?;

        end(&mut w, "wst:RequestSecurityToken")?;
        end(&mut w, "soap:Body")?;
        end(&mut w, "soap:Envelope")?;

        String::from_utf8(w.into_inner()).map_err(xml_error)
    }
}

/// An embedded document must not carry its own XML declaration.
fn strip_xml_declaration(xml: &str) -> &str {
    let trimmed = xml.trim_start();
    if trimmed.starts_with("<?xml") {
        if let Some(end) = trimmed.find("?>") {
            return trimmed[end + 2..].trim_start();
        }
    }
    trimmed
}

fn start<W: Write>(w: &mut Writer<W>, elem: BytesStart<'_>) -> Result<()> {
    w.write_event(Event::Start(elem)).map_err(xml_error)
}

fn end<W: Write>(w: &mut Writer<W>, name: &str) -> Result<()> {
    w.write_event(Event::End(BytesEnd::new(name))).map_err(xml_error)
}

fn raw<W: Write>(w: &mut Writer<W>, xml: &str) -> Result<()> {
    w.write_event(Event::Text(BytesText::from_escaped(xml)))
        .map_err(xml_error)
}

fn text_element<W: Write>(w: &mut Writer<W>, name: &str, text: &str) -> Result<()> {
    start(w, BytesStart::new(name))?;
    w.write_event(Event::Text(BytesText::new(text)))
        .map_err(xml_error)?;
    end(w, name)
}
