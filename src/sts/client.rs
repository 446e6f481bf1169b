//! STS exchange client.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use super::claims::ClaimsResolver;
use super::config::{KeyType, StsConfig, IDENTITY_NS, SECURITY_TOKEN_SERVICE, STS_SERVICE_NS};
use super::request::{QName, TokenRequest};
use super::transport::{extract_token_response, HttpStsTransport, StsTransport};
use crate::error::{BridgeError, Result};
use crate::principal::{ClientCertificate, FederatedPrincipal};

/// Per-request data taken from the inbound connection.
#[derive(Debug, Clone, Default)]
pub struct ExchangeContext {
    /// Local port of the socket the inbound request arrived on.
    pub local_port: Option<u16>,
    /// Client certificate presented on the inbound request.
    pub client_certificate: Option<ClientCertificate>,
    /// Upper bound for the STS round trip.
    pub deadline: Option<Duration>,
}

impl ExchangeContext {
    pub fn with_local_port(mut self, port: u16) -> Self {
        self.local_port = Some(port);
        self
    }

    pub fn with_certificate(mut self, cert: ClientCertificate) -> Self {
        self.client_certificate = Some(cert);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

#[derive(Debug, Clone)]
struct WsdlLocation {
    url: Url,
    port_resolved: bool,
}

/// Issues WS-Trust `RequestSecurityToken` calls against one configured STS.
pub struct StsExchangeClient {
    config: StsConfig,
    claims: ClaimsResolver,
    transport: Arc<dyn StsTransport>,
    /// Only mutated once, when a missing port is filled in.
    wsdl: RwLock<WsdlLocation>,
}

impl StsExchangeClient {
    pub fn new(
        config: StsConfig,
        claims: ClaimsResolver,
        transport: Arc<dyn StsTransport>,
    ) -> Result<Self> {
        let url = Url::parse(&config.wsdl_location).map_err(|e| {
            BridgeError::Configuration(format!("Invalid Url '{}': {}", config.wsdl_location, e))
        })?;
        if url.cannot_be_a_base() || url.host_str().is_none() {
            return Err(BridgeError::Configuration(format!(
                "Invalid Url '{}': no host",
                config.wsdl_location
            )));
        }

        // `Url` normalizes away an explicit default port, so read the raw authority.
        let port_resolved = explicit_port(&config.wsdl_location).is_some_and(|port| port > 0);
        if !port_resolved {
            info!(
                wsdl_location = %config.wsdl_location,
                "Port is 0 for wsdl_location, evaluated when processing first request"
            );
        }

        Ok(Self {
            config,
            claims,
            transport,
            wsdl: RwLock::new(WsdlLocation { url, port_resolved }),
        })
    }

    /// Client with the HTTP transport and the configured claims table.
    pub fn from_config(config: StsConfig) -> Result<Self> {
        let claims = match config.realm_claims.clone() {
            Some(table) => ClaimsResolver::from_map(table),
            None => ClaimsResolver::unconfigured(),
        };
        let transport = HttpStsTransport::new(Duration::from_secs(config.request_timeout_secs))?;
        Self::new(config, claims, Arc::new(transport))
    }

    pub fn config(&self) -> &StsConfig {
        &self.config
    }

    /// Exchange the principal's assertion for a token scoped to `realm`.
    ///
    /// Returns the serialized token response, XML-escaped for embedding.
    pub async fn exchange(
        &self,
        principal: &FederatedPrincipal,
        realm: &str,
        ctx: &ExchangeContext,
    ) -> Result<String> {
        // Resolve the STS location, filling in the port on first use
        let wsdl = self.effective_wsdl_location(ctx.local_port)?;
        let address = self.endpoint_address(&wsdl);

        // Request-level certificate wins over the principal's chain
        let cert = ctx
            .client_certificate
            .as_ref()
            .or_else(|| principal.leaf_certificate());
        let (key_type, use_key) = self.select_key_type(cert);

        let claims = if self.config.claims_required {
            self.claims.claims_element(realm)?
        } else {
            None
        };

        // The IdP assertion is sent on behalf of the user
        let on_behalf_of = principal.login_token.clone().ok_or_else(|| {
            BridgeError::MissingIdentity(format!(
                "No security token available for principal '{}'",
                principal.name
            ))
        })?;

        let request = TokenRequest {
            applies_to: realm.to_string(),
            service_name: QName::new(STS_SERVICE_NS, SECURITY_TOKEN_SERVICE),
            endpoint_name: QName::new(STS_SERVICE_NS, self.config.wsdl_endpoint.as_str()),
            address,
            token_type: self.config.effective_token_type().to_string(),
            key_type,
            claims_dialect: claims.as_ref().map(|_| IDENTITY_NS.to_string()),
            claims,
            on_behalf_of,
            use_key,
            addressing_namespace: self.config.addressing_namespace.clone(),
            context: uuid::Uuid::new_v4().to_string(),
        };

        debug!(
            realm = %realm,
            endpoint = %request.endpoint_name,
            address = %request.address,
            key_type = ?request.key_type,
            token_type = %request.token_type,
            "Requesting security token"
        );

        // Send under the caller's deadline, or the configured timeout
        let envelope = request.to_soap_envelope()?;
        let deadline = ctx
            .deadline
            .unwrap_or_else(|| Duration::from_secs(self.config.request_timeout_secs));

        let response = tokio::time::timeout(deadline, self.transport.send(&request.address, envelope))
            .await
            .map_err(|_| {
                warn!(realm = %realm, deadline = ?deadline, "STS request timed out");
                BridgeError::Exchange(format!("STS request timed out after {:?}", deadline))
            })?
            .inspect_err(|e| warn!(realm = %realm, error = %e, "STS request failed"))?;

        let rp_token = extract_token_response(&response)?;

        info!(realm = %realm, subject = %principal.name, "Token [RP_TOKEN] produced successfully");
        Ok(quick_xml::escape::escape(rp_token.as_str()).into_owned())
    }

    /// Key confirmation for this request, downgrading public-key to bearer
    /// when no certificate is available.
    pub fn select_key_type(
        &self,
        cert: Option<&ClientCertificate>,
    ) -> (KeyType, Option<ClientCertificate>) {
        match (self.config.key_type, cert) {
            (KeyType::PublicKey, Some(cert)) => {
                debug!(subject_dn = %cert.info().subject_dn, "Using client certificate as confirmation key");
                (KeyType::PublicKey, Some(cert.clone()))
            }
            (KeyType::PublicKey, None) => {
                info!("Can't send a PublicKey KeyType as no client certs are available, using Bearer");
                (KeyType::Bearer, None)
            }
            (other, _) => (other, None),
        }
    }

    /// WSDL location with its port resolved. The first call that finds the
    /// port unset fills it in from `local_port`; later calls reuse that value.
    pub fn effective_wsdl_location(&self, local_port: Option<u16>) -> Result<Url> {
        {
            let wsdl = self.wsdl.read().unwrap_or_else(PoisonError::into_inner);
            if wsdl.port_resolved {
                return Ok(wsdl.url.clone());
            }
        }

        let mut wsdl = self.wsdl.write().unwrap_or_else(PoisonError::into_inner);
        if wsdl.port_resolved {
            return Ok(wsdl.url.clone());
        }

        let port = local_port.ok_or_else(|| {
            BridgeError::Configuration(
                "STS port is not configured and the request has no local port".to_string(),
            )
        })?;

        let mut updated = wsdl.url.clone();
        updated.set_port(Some(port)).map_err(|_| {
            BridgeError::Configuration(format!("Cannot set port on '{}'", wsdl.url))
        })?;

        info!(url = %updated, "STS WSDL URL updated");
        wsdl.url = updated;
        wsdl.port_resolved = true;
        Ok(wsdl.url.clone())
    }

    fn endpoint_address(&self, wsdl: &Url) -> String {
        if let Some(ref address) = self.config.endpoint_address {
            return address.clone();
        }
        let mut address = wsdl.clone();
        address.set_query(None);
        address.set_fragment(None);
        address.to_string()
    }
}

/// Port written in the authority of `location`, if any.
fn explicit_port(location: &str) -> Option<u16> {
    let rest = location.split_once("://").map_or(location, |(_, rest)| rest);
    let authority = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, hp)| hp);
    let port = match host_port.rsplit_once(']') {
        Some((_, after_ipv6)) => after_ipv6.strip_prefix(':')?,
        None => host_port.rsplit_once(':')?.1,
    };
    port.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::principal::tests::TEST_CERT_PEM;
    use crate::sts::transport::tests::RSTR_RESPONSE;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    const REALM: &str = "urn:org:apache:cxf:fediz:fedizhelloworld";
    const ASSERTION: &str =
        r#"<saml2:Assertion xmlns:saml2="urn:oasis:names:tc:SAML:2.0:assertion" ID="_idp"/>"#;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl StsTransport for RecordingTransport {
        async fn send(&self, address: &str, envelope: String) -> Result<String> {
            self.sent.lock().unwrap().push((address.to_string(), envelope));
            Ok(RSTR_RESPONSE.to_string())
        }
    }

    struct SlowTransport;

    #[async_trait]
    impl StsTransport for SlowTransport {
        async fn send(&self, _address: &str, _envelope: String) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(RSTR_RESPONSE.to_string())
        }
    }

    struct RejectingTransport;

    #[async_trait]
    impl StsTransport for RejectingTransport {
        async fn send(&self, _address: &str, _envelope: String) -> Result<String> {
            Err(BridgeError::Exchange("STS fault: Unknown realm".to_string()))
        }
    }

    fn config(wsdl_location: &str) -> StsConfig {
        let mut realm_claims = HashMap::new();
        realm_claims.insert(
            REALM.to_string(),
            vec!["http://schemas.xmlsoap.org/ws/2005/05/identity/claims/emailaddress".to_string()],
        );
        StsConfig {
            wsdl_location: wsdl_location.to_string(),
            realm_claims: Some(realm_claims),
            ..Default::default()
        }
    }

    fn client_with(config: StsConfig) -> (StsExchangeClient, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let claims = ClaimsResolver::from_map(config.realm_claims.clone().unwrap_or_default());
        let client = StsExchangeClient::new(config, claims, transport.clone()).unwrap();
        (client, transport)
    }

    fn principal() -> FederatedPrincipal {
        FederatedPrincipal::new("alice", ASSERTION)
    }

    #[tokio::test]
    async fn test_port_resolved_once_from_first_request() {
        let (client, transport) = client_with(config("https://sts.example:0/services/STS"));
        let ctx = ExchangeContext::default().with_local_port(8443);

        client.exchange(&principal(), REALM, &ctx).await.unwrap();
        assert_eq!(
            client.effective_wsdl_location(None).unwrap().as_str(),
            "https://sts.example:8443/services/STS"
        );

        // A different local port on a later request does not move the STS.
        let ctx = ExchangeContext::default().with_local_port(9443);
        client.exchange(&principal(), REALM, &ctx).await.unwrap();

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, "https://sts.example:8443/services/STS");
        assert_eq!(sent[1].0, "https://sts.example:8443/services/STS");
    }

    #[test]
    fn test_explicit_port_kept() {
        let (client, _) = client_with(config("https://sts.example:9443/services/STS?wsdl"));
        let url = client.effective_wsdl_location(Some(8443)).unwrap();
        assert_eq!(url.port(), Some(9443));
        assert_eq!(client.endpoint_address(&url), "https://sts.example:9443/services/STS");
    }

    #[test]
    fn test_explicit_default_port_kept() {
        let (client, _) = client_with(config("https://sts.example:443/services/STS"));
        let url = client.effective_wsdl_location(Some(8443)).unwrap();
        assert_eq!(url.port_or_known_default(), Some(443));
        assert_eq!(url.as_str(), "https://sts.example/services/STS");

        let (client, _) = client_with(config("http://sts.example:80/services/STS"));
        let url = client.effective_wsdl_location(Some(8080)).unwrap();
        assert_eq!(url.port_or_known_default(), Some(80));
    }

    #[test]
    fn test_missing_port_is_resolved() {
        let (client, _) = client_with(config("https://sts.example/services/STS"));
        let url = client.effective_wsdl_location(Some(8443)).unwrap();
        assert_eq!(url.port(), Some(8443));
    }

    #[test]
    fn test_explicit_port_parsing() {
        assert_eq!(explicit_port("https://sts.example:443/STS"), Some(443));
        assert_eq!(explicit_port("https://sts.example/STS:99"), None);
        assert_eq!(explicit_port("https://user:pw@sts.example:9443?wsdl"), Some(9443));
        assert_eq!(explicit_port("https://[::1]:8443/STS"), Some(8443));
        assert_eq!(explicit_port("https://[::1]/STS"), None);
        assert_eq!(explicit_port("https://sts.example:0/STS"), Some(0));
    }

    #[test]
    fn test_unresolvable_port_is_configuration_error() {
        let (client, _) = client_with(config("https://sts.example:0/services/STS"));
        let err = client.effective_wsdl_location(None).unwrap_err();
        assert!(matches!(err, BridgeError::Configuration(_)));
    }

    #[test]
    fn test_concurrent_port_resolution_applies_once() {
        let (client, _) = client_with(config("https://sts.example:0/services/STS"));
        let urls: Vec<Url> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8u16)
                .map(|i| {
                    let client = &client;
                    s.spawn(move || client.effective_wsdl_location(Some(8000 + i)).unwrap())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(urls.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_malformed_wsdl_location() {
        let transport = Arc::new(RecordingTransport::default());
        let result = StsExchangeClient::new(
            config("not a url"),
            ClaimsResolver::unconfigured(),
            transport,
        );
        assert!(matches!(result, Err(BridgeError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_missing_certificate_downgrades_to_bearer() {
        let (client, transport) = client_with(config("https://sts.example:8443/services/STS"));
        assert_eq!(client.config().key_type, KeyType::PublicKey);

        let result = client
            .exchange(&principal(), REALM, &ExchangeContext::default())
            .await;
        assert!(result.is_ok());

        let sent = transport.sent.lock().unwrap();
        assert!(sent[0].1.contains(KeyType::Bearer.as_uri()));
        assert!(!sent[0].1.contains("UseKey"));
    }

    #[tokio::test]
    async fn test_certificate_selects_public_key() {
        let (client, transport) = client_with(config("https://sts.example:8443/services/STS"));
        let cert = ClientCertificate::parse(TEST_CERT_PEM).unwrap();
        let ctx = ExchangeContext::default().with_certificate(cert.clone());

        client.exchange(&principal(), REALM, &ctx).await.unwrap();

        let sent = transport.sent.lock().unwrap();
        assert!(sent[0].1.contains(KeyType::PublicKey.as_uri()));
        assert!(sent[0].1.contains(&cert.to_base64()));
    }

    #[tokio::test]
    async fn test_principal_certificate_used_when_request_has_none() {
        let (client, transport) = client_with(config("https://sts.example:8443/services/STS"));
        let cert = ClientCertificate::parse(TEST_CERT_PEM).unwrap();
        let principal = principal().with_certificate(cert);

        client
            .exchange(&principal, REALM, &ExchangeContext::default())
            .await
            .unwrap();

        let sent = transport.sent.lock().unwrap();
        assert!(sent[0].1.contains(KeyType::PublicKey.as_uri()));
    }

    #[tokio::test]
    async fn test_claims_attached_only_for_realms_with_claims() {
        let (client, transport) = client_with(config("https://sts.example:8443/services/STS"));

        client
            .exchange(&principal(), REALM, &ExchangeContext::default())
            .await
            .unwrap();
        client
            .exchange(&principal(), "urn:no-claims", &ExchangeContext::default())
            .await
            .unwrap();

        let sent = transport.sent.lock().unwrap();
        assert!(sent[0].1.contains("<wst:Claims"));
        assert!(sent[0].1.contains("claims/emailaddress"));
        assert!(!sent[1].1.contains("<wst:Claims"));
    }

    #[tokio::test]
    async fn test_claims_not_attached_when_not_required() {
        let mut cfg = config("https://sts.example:8443/services/STS");
        cfg.claims_required = false;
        let (client, transport) = client_with(cfg);

        client
            .exchange(&principal(), REALM, &ExchangeContext::default())
            .await
            .unwrap();
        assert!(!transport.sent.lock().unwrap()[0].1.contains("<wst:Claims"));
    }

    #[tokio::test]
    async fn test_missing_claims_table_fails_request() {
        let transport = Arc::new(RecordingTransport::default());
        let client = StsExchangeClient::new(
            config("https://sts.example:8443/services/STS"),
            ClaimsResolver::unconfigured(),
            transport.clone(),
        )
        .unwrap();

        let err = client
            .exchange(&principal(), REALM, &ExchangeContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Configuration(_)));
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_login_token() {
        let (client, transport) = client_with(config("https://sts.example:8443/services/STS"));
        let mut principal = principal();
        principal.login_token = None;

        let err = client
            .exchange(&principal, REALM, &ExchangeContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::MissingIdentity(_)));
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_token_type_defaults_and_overrides() {
        let (client, transport) = client_with(config("https://sts.example:8443/services/STS"));
        client
            .exchange(&principal(), REALM, &ExchangeContext::default())
            .await
            .unwrap();

        let mut cfg = config("https://sts.example:8443/services/STS");
        cfg.token_type = Some("urn:ietf:params:oauth:token-type:jwt".to_string());
        let (jwt_client, jwt_transport) = client_with(cfg);
        jwt_client
            .exchange(&principal(), REALM, &ExchangeContext::default())
            .await
            .unwrap();

        assert!(transport.sent.lock().unwrap()[0]
            .1
            .contains("oasis-wss-saml-token-profile-1.1#SAMLV2.0"));
        assert!(jwt_transport.sent.lock().unwrap()[0]
            .1
            .contains("<wst:TokenType>urn:ietf:params:oauth:token-type:jwt</wst:TokenType>"));
    }

    #[tokio::test]
    async fn test_response_is_xml_escaped() {
        let (client, _) = client_with(config("https://sts.example:8443/services/STS"));
        let token = client
            .exchange(&principal(), REALM, &ExchangeContext::default())
            .await
            .unwrap();

        assert!(token.starts_with("&lt;RequestSecurityTokenResponseCollection"));
        assert!(token.contains("&quot;_rp&quot;"));
        assert!(!token.contains('<'));
    }

    #[tokio::test]
    async fn test_deadline_exceeded_is_exchange_error() {
        let client = StsExchangeClient::new(
            config("https://sts.example:8443/services/STS"),
            ClaimsResolver::from_map(HashMap::new()),
            Arc::new(SlowTransport),
        )
        .unwrap();
        let ctx = ExchangeContext::default().with_deadline(Duration::from_millis(50));

        let err = client.exchange(&principal(), REALM, &ctx).await.unwrap_err();
        assert!(matches!(err, BridgeError::Exchange(_)));

        // Sub-millisecond deadlines are reported as given
        let ctx = ExchangeContext::default().with_deadline(Duration::from_micros(500));
        let err = client.exchange(&principal(), REALM, &ctx).await.unwrap_err();
        assert_eq!(
            err,
            BridgeError::Exchange("STS request timed out after 500µs".to_string())
        );
    }

    #[tokio::test]
    async fn test_sts_rejection_propagates() {
        let client = StsExchangeClient::new(
            config("https://sts.example:8443/services/STS"),
            ClaimsResolver::from_map(HashMap::new()),
            Arc::new(RejectingTransport),
        )
        .unwrap();

        let err = client
            .exchange(&principal(), REALM, &ExchangeContext::default())
            .await
            .unwrap_err();
        assert_eq!(err, BridgeError::Exchange("STS fault: Unknown realm".to_string()));
    }
}
