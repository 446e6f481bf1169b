//! SOAP transport to the STS and response parsing.

use async_trait::async_trait;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::QName as XmlName;
use quick_xml::Reader;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::debug;

use super::request::RST_ISSUE_ACTION;
use crate::error::{BridgeError, Result};

/// Delivers a serialized RST to the STS and returns the raw SOAP response.
#[async_trait]
pub trait StsTransport: Send + Sync {
    /// POST `envelope` to `address`. Network failures, non-success statuses and
    /// SOAP faults map to [`BridgeError::Exchange`].
    async fn send(&self, address: &str, envelope: String) -> Result<String>;
}

/// SOAP 1.1 over HTTP(S).
pub struct HttpStsTransport {
    http_client: reqwest::Client,
}

impl HttpStsTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BridgeError::Configuration(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { http_client })
    }
}

#[async_trait]
impl StsTransport for HttpStsTransport {
    async fn send(&self, address: &str, envelope: String) -> Result<String> {
        debug!(address = %address, bytes = envelope.len(), "Posting RequestSecurityToken");

        let response = self
            .http_client
            .post(address)
            .header(reqwest::header::CONTENT_TYPE, "text/xml; charset=UTF-8")
            .header("SOAPAction", format!("\"{}\"", RST_ISSUE_ACTION))
            .body(envelope)
            .send()
            .await
            .map_err(|e| BridgeError::Exchange(format!("STS request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| BridgeError::Exchange(format!("Failed to read STS response: {}", e)))?;

        if !status.is_success() {
            return Err(match find_fault(&body) {
                Some(reason) => {
                    BridgeError::Exchange(format!("STS fault (HTTP {}): {}", status, reason))
                }
                None => BridgeError::Exchange(format!("STS returned HTTP {}", status)),
            });
        }

        Ok(body)
    }
}

/// Serialized `RequestSecurityTokenResponseCollection` (or a bare
/// `RequestSecurityTokenResponse`) from a SOAP response.
///
/// Namespace declarations the element relies on but inherits from the SOAP
/// envelope are copied onto its start tag, so the result stands alone.
pub fn extract_token_response(xml: &str) -> Result<String> {
    let mut reader = Reader::from_str(xml);
    // Declarations made by each open ancestor, outermost first.
    let mut scopes: Vec<Vec<(String, String)>> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"Fault" => {
                    let reason = read_fault_reason(&mut reader)
                        .unwrap_or_else(|| "unspecified SOAP fault".to_string());
                    return Err(BridgeError::Exchange(format!("STS fault: {}", reason)));
                }
                name if is_token_response(name) => {
                    let qname = e.name().as_ref().to_vec();
                    let inner = reader.read_text(XmlName(&qname)).map_err(malformed)?;
                    let start_tag = with_inherited_namespaces(&e, &scopes, &inner)?;
                    return Ok(format!(
                        "<{}>{}</{}>",
                        start_tag,
                        inner,
                        String::from_utf8_lossy(&qname)
                    ));
                }
                _ => scopes.push(namespace_declarations(&e)?),
            },
            Ok(Event::Empty(e)) if is_token_response(e.local_name().as_ref()) => {
                let start_tag = with_inherited_namespaces(&e, &scopes, "")?;
                return Ok(format!("<{}/>", start_tag));
            }
            Ok(Event::End(_)) => {
                scopes.pop();
            }
            Ok(Event::Eof) => {
                return Err(BridgeError::Exchange(
                    "STS response carries no RequestSecurityTokenResponse".to_string(),
                ))
            }
            Err(e) => return Err(malformed(e)),
            _ => {}
        }
    }
}

fn is_token_response(local_name: &[u8]) -> bool {
    matches!(
        local_name,
        b"RequestSecurityTokenResponseCollection" | b"RequestSecurityTokenResponse"
    )
}

fn malformed<E: std::fmt::Display>(err: E) -> BridgeError {
    BridgeError::Exchange(format!("Malformed STS response: {}", err))
}

/// `xmlns` / `xmlns:p` attributes of an element as (prefix, raw URI) pairs.
/// The default namespace has the empty prefix.
fn namespace_declarations(e: &BytesStart<'_>) -> Result<Vec<(String, String)>> {
    let mut declarations = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(malformed)?;
        let key = attr.key.as_ref();
        let prefix = if key == b"xmlns" {
            String::new()
        } else if let Some(prefix) = key.strip_prefix(b"xmlns:") {
            String::from_utf8_lossy(prefix).into_owned()
        } else {
            continue;
        };
        declarations.push((prefix, String::from_utf8_lossy(&attr.value).into_owned()));
    }
    Ok(declarations)
}

fn prefix_of(name: &[u8]) -> Option<&[u8]> {
    name.iter().position(|b| *b == b':').map(|i| &name[..i])
}

// Element names use the default namespace when unprefixed; attribute names do not.
fn collect_prefixes(e: &BytesStart<'_>, used: &mut BTreeSet<String>) -> Result<()> {
    let name = e.name();
    let element_prefix = prefix_of(name.as_ref()).unwrap_or_default();
    used.insert(String::from_utf8_lossy(element_prefix).into_owned());

    for attr in e.attributes() {
        let attr = attr.map_err(malformed)?;
        let key = attr.key.as_ref();
        if key == b"xmlns" {
            continue;
        }
        if let Some(prefix) = prefix_of(key) {
            used.insert(String::from_utf8_lossy(prefix).into_owned());
        }
    }
    Ok(())
}

/// Start tag of `e` plus the ancestor declarations its subtree needs.
fn with_inherited_namespaces(
    e: &BytesStart<'_>,
    scopes: &[Vec<(String, String)>],
    inner: &str,
) -> Result<String> {
    let mut used = BTreeSet::new();
    collect_prefixes(e, &mut used)?;

    let mut inner_reader = Reader::from_str(inner);
    loop {
        match inner_reader.read_event() {
            Ok(Event::Start(child)) | Ok(Event::Empty(child)) => {
                collect_prefixes(&child, &mut used)?
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(malformed(err)),
            _ => {}
        }
    }

    let own = namespace_declarations(e)?;
    let mut start_tag = String::from_utf8_lossy(e).trim_end().to_string();

    for prefix in used {
        if prefix == "xml" || prefix == "xmlns" || own.iter().any(|(p, _)| *p == prefix) {
            continue;
        }
        let inherited = scopes
            .iter()
            .rev()
            .flat_map(|scope| scope.iter())
            .find(|(p, _)| *p == prefix);
        if let Some((_, uri)) = inherited {
            let uri = uri.replace('"', "&quot;");
            if prefix.is_empty() {
                start_tag.push_str(&format!(" xmlns=\"{}\"", uri));
            } else {
                start_tag.push_str(&format!(" xmlns:{}=\"{}\"", prefix, uri));
            }
        }
    }

    Ok(start_tag)
}

/// Reason text of a SOAP 1.1 or 1.2 fault, if the document is one.
pub fn find_fault(xml: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"Fault" => {
                return Some(
                    read_fault_reason(&mut reader)
                        .unwrap_or_else(|| "unspecified SOAP fault".to_string()),
                );
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

// Reads up to the end of the current Fault element.
fn read_fault_reason(reader: &mut Reader<&[u8]>) -> Option<String> {
    let mut in_reason = false;
    let mut depth = 1usize;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                depth += 1;
                in_reason = matches!(e.local_name().as_ref(), b"faultstring" | b"Text");
            }
            Ok(Event::Text(t)) if in_reason => {
                let text = t.unescape().ok()?.trim().to_string();
                if !text.is_empty() {
                    return Some(text);
                }
            }
            Ok(Event::End(_)) => {
                in_reason = false;
                depth -= 1;
                if depth == 0 {
                    return None;
                }
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}
