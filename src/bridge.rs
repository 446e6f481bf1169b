//! Entry points used by the request-handling layer.

use std::sync::Arc;
use tracing::info;

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::oauth::{
    spawn_cleanup_task, AuthorizationRequest, GrantLifecycle, TokenKind, TokenResponse, TokenStore,
};
use crate::principal::Principal;
use crate::sts::{ExchangeContext, StsExchangeClient};

/// Bridges a federated principal to a relying-party token (WS-Trust) or to
/// an OAuth2 grant with an ID Token.
pub struct TokenBridge {
    sts: StsExchangeClient,
    grants: GrantLifecycle,
}

impl TokenBridge {
    pub fn new(sts: StsExchangeClient, grants: GrantLifecycle) -> Self {
        Self { sts, grants }
    }

    /// Build both engines from configuration: the HTTP STS client, the
    /// process signing key and the configured clients.
    pub fn from_config(config: &BridgeConfig) -> Result<Self> {
        config.validate().map_err(BridgeError::Configuration)?;

        let sts = StsExchangeClient::from_config(config.sts.clone())?;
        let grants = GrantLifecycle::from_config(&config.oauth, Arc::new(TokenStore::new()))?;

        info!(
            wsdl_location = %config.sts.wsdl_location,
            key_type = ?config.sts.key_type,
            clients = grants.store().client_count(),
            sign_with_client_secret = config.oauth.sign_id_token_with_client_secret,
            "Token bridge ready"
        );

        Ok(Self::new(sts, grants))
    }

    pub fn sts(&self) -> &StsExchangeClient {
        &self.sts
    }

    pub fn grants(&self) -> &GrantLifecycle {
        &self.grants
    }

    /// Exchange the principal's assertion at the STS for a token scoped to
    /// `realm`. Returns the XML-escaped token response.
    pub async fn submit_exchange(
        &self,
        realm: &str,
        principal: &Principal,
        ctx: &ExchangeContext,
    ) -> Result<String> {
        let federated = principal.as_federated().ok_or_else(|| {
            BridgeError::MissingIdentity(format!(
                "'{}' has no federated security token",
                principal.name()
            ))
        })?;
        self.sts.exchange(federated, realm, ctx).await
    }

    /// Issue an authorization code for `client_id` with the requested scopes.
    pub fn issue_authorization_grant(
        &self,
        principal: &Principal,
        client_id: &str,
        scopes: &[String],
    ) -> Result<String> {
        let request = AuthorizationRequest {
            client_id: client_id.to_string(),
            scopes: scopes.to_vec(),
            ..Default::default()
        };
        self.authorize(principal, &request)
    }

    /// Issue an authorization code for a full request (nonce, redirect URI).
    pub fn authorize(&self, principal: &Principal, request: &AuthorizationRequest) -> Result<String> {
        Ok(self.grants.issue_grant(principal, request)?.code)
    }

    /// Redeem an authorization code. The ID Token is the one minted when the
    /// code was issued.
    pub fn redeem_code(&self, code: &str) -> Result<TokenResponse> {
        self.grants.redeem_grant(code)
    }

    pub fn refresh_access_token(&self, refresh_token: &str) -> Result<TokenResponse> {
        self.grants.refresh(refresh_token)
    }

    /// Returns whether anything was revoked.
    pub fn revoke_token(&self, token_key: &str, kind: TokenKind) -> bool {
        self.grants.revoke(token_key, kind)
    }

    /// Start periodic eviction of expired grants and tokens.
    pub fn spawn_cleanup(&self, interval_secs: u64) -> tokio::task::JoinHandle<()> {
        spawn_cleanup_task(Arc::clone(self.grants.store()), interval_secs)
    }
}
