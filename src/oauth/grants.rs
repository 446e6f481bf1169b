//! Authorization code flow: grant issuance, redemption, refresh and revocation.
//!
//! ```text
//! Requested -> GrantIssued -> AccessTokenIssued [+ RefreshTokenIssued] -> Revoked
//!                   \-> Expired
//! ```

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};

use super::config::OAuthConfig;
use super::id_token::{IdTokenMinter, LocalSamlTokenConverter};
use super::permissions::PermissionSet;
use super::signer::ConfiguredSignerProvider;
use super::store::TokenStore;
use super::types::{
    expiry_after, generate_token_key, key_prefix, AccessToken, AuthorizationCodeGrant, Client, Permission,
    RefreshToken, TokenKind, TokenResponse, UserSubject, ID_TOKEN_PROPERTY, REFRESH_TOKEN_SCOPE,
};
use crate::error::{BridgeError, Result};
use crate::principal::Principal;

/// An end user's authorization request, as accepted by the authorization endpoint.
#[derive(Debug, Clone, Default)]
pub struct AuthorizationRequest {
    pub client_id: String,
    pub scopes: Vec<String>,
    pub redirect_uri: Option<String>,
    pub nonce: Option<String>,
}

impl AuthorizationRequest {
    pub fn new(client_id: impl Into<String>, scopes: &[&str]) -> Self {
        Self {
            client_id: client_id.into(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn with_nonce(mut self, nonce: impl Into<String>) -> Self {
        self.nonce = Some(nonce.into());
        self
    }

    pub fn with_redirect_uri(mut self, redirect_uri: impl Into<String>) -> Self {
        self.redirect_uri = Some(redirect_uri.into());
        self
    }
}

/// Token lifetimes applied by the lifecycle.
#[derive(Debug, Clone, Copy)]
pub struct GrantLifetimes {
    pub code_ttl_secs: u64,
    pub access_token_ttl_secs: u64,
    pub refresh_token_ttl_secs: Option<u64>,
}

impl From<&OAuthConfig> for GrantLifetimes {
    fn from(config: &OAuthConfig) -> Self {
        Self {
            code_ttl_secs: config.code_ttl_secs,
            access_token_ttl_secs: config.access_token_ttl_secs,
            refresh_token_ttl_secs: config.refresh_token_ttl_secs,
        }
    }
}

/// Whether the granted scopes allow refresh tokens.
pub fn is_refresh_token_supported(scopes: &[String]) -> bool {
    scopes.iter().any(|s| s == REFRESH_TOKEN_SCOPE)
}

pub struct GrantLifecycle {
    store: Arc<TokenStore>,
    permissions: PermissionSet,
    minter: IdTokenMinter,
    lifetimes: GrantLifetimes,
    sign_with_client_secret: bool,
}

impl GrantLifecycle {
    pub fn new(
        store: Arc<TokenStore>,
        permissions: PermissionSet,
        minter: IdTokenMinter,
        lifetimes: GrantLifetimes,
        sign_with_client_secret: bool,
    ) -> Self {
        Self {
            store,
            permissions,
            minter,
            lifetimes,
            sign_with_client_secret,
        }
    }

    /// Build the lifecycle from configuration and register the configured clients.
    pub fn from_config(config: &OAuthConfig, store: Arc<TokenStore>) -> Result<Self> {
        let minter = IdTokenMinter::new(
            Arc::new(LocalSamlTokenConverter::new(
                config.issuer.clone(),
                config.id_token_ttl_secs,
            )),
            Arc::new(ConfiguredSignerProvider::from_config(config)?),
        );

        let lifecycle = Self::new(
            store,
            PermissionSet::from_scopes(&config.scopes),
            minter,
            GrantLifetimes::from(config),
            config.sign_id_token_with_client_secret,
        );

        for client in &config.clients {
            lifecycle.register_client(Client::from(client.clone()))?;
        }

        Ok(lifecycle)
    }

    pub fn store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    /// Register a client. Confidential clients need a secret when ID Tokens
    /// are signed with client secrets.
    pub fn register_client(&self, client: Client) -> Result<()> {
        if self.sign_with_client_secret
            && client.confidential
            && client.client_secret.as_deref().map_or(true, str::is_empty)
        {
            return Err(BridgeError::Configuration(format!(
                "Confidential client '{}' needs a client secret to sign ID Tokens",
                client.client_id
            )));
        }
        self.store.register_client(client);
        Ok(())
    }

    pub fn convert_scopes_to_permissions(
        &self,
        client: &Client,
        scopes: &[String],
    ) -> Result<Vec<Permission>> {
        self.permissions.convert_scopes_to_permissions(client, scopes)
    }

    /// Issue an authorization code for `principal`.
    ///
    /// The ID Token is minted and attached before the grant is stored, so no
    /// caller ever sees a grant without it.
    pub fn issue_grant(
        &self,
        principal: &Principal,
        request: &AuthorizationRequest,
    ) -> Result<AuthorizationCodeGrant> {
        let client = self
            .store
            .get_client(&request.client_id)
            .ok_or_else(|| BridgeError::UnknownClient(request.client_id.clone()))?;

        if let Some(ref redirect_uri) = request.redirect_uri {
            if !client.redirect_uris.is_empty() && !client.redirect_uris.contains(redirect_uri) {
                return Err(BridgeError::InvalidGrant(format!(
                    "redirect_uri '{}' is not registered for client '{}'",
                    redirect_uri, client.client_id
                )));
            }
        }

        // Scopes are checked before anything is minted
        let permissions = self.convert_scopes_to_permissions(&client, &request.scopes)?;
        let approved_scopes: Vec<String> =
            permissions.into_iter().map(|p| p.permission).collect();

        let issued_at = Utc::now();
        let expires_at = expiry_after(issued_at, self.lifetimes.code_ttl_secs)?;

        // Attach the ID Token before the grant becomes visible in the store
        let id_token = self
            .minter
            .mint(principal, &client, request.nonce.as_deref())?;

        let mut subject = UserSubject::new(principal.name());
        subject
            .properties
            .insert(ID_TOKEN_PROPERTY.to_string(), id_token);

        let grant = AuthorizationCodeGrant {
            code: generate_token_key(),
            client_id: client.client_id.clone(),
            subject,
            approved_scopes,
            redirect_uri: request.redirect_uri.clone(),
            nonce: request.nonce.clone(),
            issued_at,
            expires_at,
        };

        self.store.save_grant(grant.clone());

        info!(
            client_id = %grant.client_id,
            subject = %grant.subject.login,
            scopes = ?grant.approved_scopes,
            code = %key_prefix(&grant.code),
            "Authorization grant issued"
        );

        Ok(grant)
    }

    /// Exchange a code for tokens. The code is consumed whether or not it
    /// turns out to be expired.
    pub fn redeem_grant(&self, code: &str) -> Result<TokenResponse> {
        let grant = self.store.consume_grant(code).ok_or_else(|| {
            BridgeError::InvalidGrant("authorization code is unknown or already used".to_string())
        })?;

        if grant.is_expired() {
            return Err(BridgeError::InvalidGrant(
                "authorization code has expired".to_string(),
            ));
        }

        if self.store.get_client(&grant.client_id).is_none() {
            return Err(BridgeError::UnknownClient(grant.client_id));
        }

        let response = self.issue_tokens(&grant.client_id, grant.subject, grant.approved_scopes)?;

        info!(
            client_id = %response.access_token.client_id,
            token = %key_prefix(&response.access_token.token_key),
            refresh = response.refresh_token.is_some(),
            "Authorization code redeemed"
        );

        Ok(response)
    }

    /// Exchange a refresh token for a new access token and refresh token.
    ///
    /// The presented refresh token is single use; access tokens issued under
    /// it are revoked.
    pub fn refresh(&self, refresh_key: &str) -> Result<TokenResponse> {
        let current = self.store.get_refresh_token(refresh_key).ok_or_else(|| {
            BridgeError::InvalidGrant("refresh token is unknown, revoked or expired".to_string())
        })?;

        if !is_refresh_token_supported(&current.scopes) {
            return Err(BridgeError::RefreshNotSupported);
        }

        // Take it out of the store; a concurrent refresh of the same key loses here
        let current = self
            .store
            .take_refresh_token(&current.client_id, refresh_key)
            .ok_or_else(|| BridgeError::InvalidGrant("refresh token already used".to_string()))?;

        for access_key in &current.access_tokens {
            self.store.revoke_access_token(access_key);
        }

        // Same subject, so the original ID Token carries over
        let response = self.issue_tokens(&current.client_id, current.subject, current.scopes)?;

        info!(
            client_id = %response.access_token.client_id,
            old = %key_prefix(refresh_key),
            token = %key_prefix(&response.access_token.token_key),
            "Access token refreshed"
        );

        Ok(response)
    }

    /// Remove a token. Returns whether anything was removed; revoking twice
    /// is not an error. Revoking a refresh token also revokes its access tokens.
    pub fn revoke(&self, token_key: &str, kind: TokenKind) -> bool {
        let revoked = match kind {
            TokenKind::AccessToken => self.store.revoke_access_token(token_key),
            TokenKind::RefreshToken => self
                .store
                .get_refresh_token(token_key)
                .and_then(|token| self.store.revoke_refresh_token(&token.client_id, token_key))
                .is_some(),
        };

        debug!(token = %key_prefix(token_key), kind = ?kind, revoked, "Token revocation");
        revoked
    }

    fn issue_tokens(
        &self,
        client_id: &str,
        subject: UserSubject,
        scopes: Vec<String>,
    ) -> Result<TokenResponse> {
        let mut access =
            AccessToken::new(client_id, subject, scopes, self.lifetimes.access_token_ttl_secs)?;

        let refresh = if is_refresh_token_supported(&access.scopes) {
            let refresh = RefreshToken::new(&access, self.lifetimes.refresh_token_ttl_secs)?;
            access.refresh_token_key = Some(refresh.token_key.clone());
            Some(refresh)
        } else {
            None
        };

        if let Some(ref refresh) = refresh {
            self.store.save_refresh_token(&access, refresh.clone());
        }
        self.store.save_access_token(access.clone());

        Ok(TokenResponse {
            id_token: access.id_token().map(str::to_string),
            access_token: access,
            refresh_token: refresh,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::id_token::tests::TEST_ASSERTION;
    use crate::oauth::signer::tests::es256_config;
    use crate::principal::FederatedPrincipal;
    use chrono::Duration;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn lifecycle() -> GrantLifecycle {
        let mut config = es256_config();
        let mut scopes = HashMap::new();
        scopes.insert("profile".to_string(), "Read your profile".to_string());
        scopes.insert(REFRESH_TOKEN_SCOPE.to_string(), "Offline access".to_string());
        config.scopes = scopes;
        config.sign_id_token_with_client_secret = true;

        let lifecycle = GrantLifecycle::from_config(&config, Arc::new(TokenStore::new())).unwrap();
        lifecycle.register_client(Client::public("spa")).unwrap();
        let mut web = Client::confidential("web", "shared-secret");
        web.redirect_uris = vec!["https://web.example.org/cb".to_string()];
        lifecycle.register_client(web).unwrap();
        lifecycle
    }

    fn alice() -> Principal {
        Principal::from(FederatedPrincipal::new("alice", TEST_ASSERTION))
    }

    #[test]
    fn test_issue_grant_attaches_id_token() {
        let lifecycle = lifecycle();
        let request = AuthorizationRequest::new("spa", &["openid", "profile"]).with_nonce("abc");
        let grant = lifecycle.issue_grant(&alice(), &request).unwrap();

        assert_eq!(grant.client_id, "spa");
        assert_eq!(grant.subject.login, "alice");
        assert_eq!(grant.approved_scopes, vec!["openid", "profile"]);
        assert_eq!(grant.nonce.as_deref(), Some("abc"));
        assert!(grant.subject.id_token().is_some());
        assert_eq!(lifecycle.store().grant_count(), 1);
    }

    #[test]
    fn test_issue_grant_rejections_store_nothing() {
        let lifecycle = lifecycle();

        let err = lifecycle
            .issue_grant(&alice(), &AuthorizationRequest::new("spa", &["openid", "email"]))
            .unwrap_err();
        assert_eq!(err, BridgeError::UnknownScope("email".to_string()));

        let err = lifecycle
            .issue_grant(&alice(), &AuthorizationRequest::new("spa", &["profile"]))
            .unwrap_err();
        assert!(matches!(err, BridgeError::MissingDefaultScope(_)));

        let err = lifecycle
            .issue_grant(&alice(), &AuthorizationRequest::new("nobody", &["openid"]))
            .unwrap_err();
        assert_eq!(err, BridgeError::UnknownClient("nobody".to_string()));

        let other = Principal::Other {
            name: "bob".to_string(),
            method: "basic".to_string(),
        };
        let err = lifecycle
            .issue_grant(&other, &AuthorizationRequest::new("spa", &["openid"]))
            .unwrap_err();
        assert!(matches!(err, BridgeError::UnsupportedPrincipal(_)));

        let request = AuthorizationRequest::new("web", &["openid"])
            .with_redirect_uri("https://evil.example.org/cb");
        let err = lifecycle.issue_grant(&alice(), &request).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidGrant(_)));

        assert_eq!(lifecycle.store().grant_count(), 0);
    }

    #[test]
    fn test_redeem_carries_id_token_unchanged() {
        let lifecycle = lifecycle();
        let grant = lifecycle
            .issue_grant(&alice(), &AuthorizationRequest::new("web", &["openid"]))
            .unwrap();
        let minted = grant.subject.id_token().unwrap().to_string();

        let response = lifecycle.redeem_grant(&grant.code).unwrap();
        assert_eq!(response.id_token.as_deref(), Some(minted.as_str()));
        assert_eq!(response.access_token.id_token(), Some(minted.as_str()));
        assert_eq!(response.access_token.token_type, "Bearer");
        assert!(response.refresh_token.is_none());
        assert!(lifecycle
            .store()
            .get_access_token(&response.access_token.token_key)
            .is_some());
    }

    #[test]
    fn test_code_is_single_use() {
        let lifecycle = lifecycle();
        let grant = lifecycle
            .issue_grant(&alice(), &AuthorizationRequest::new("spa", &["openid"]))
            .unwrap();

        assert!(lifecycle.redeem_grant(&grant.code).is_ok());
        let err = lifecycle.redeem_grant(&grant.code).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidGrant(_)));
    }

    #[test]
    fn test_concurrent_redemption_has_one_winner() {
        let lifecycle = lifecycle();
        let grant = lifecycle
            .issue_grant(&alice(), &AuthorizationRequest::new("spa", &["openid"]))
            .unwrap();

        let winners = AtomicUsize::new(0);
        let invalid = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for _ in 0..12 {
                s.spawn(|| match lifecycle.redeem_grant(&grant.code) {
                    Ok(_) => {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(BridgeError::InvalidGrant(_)) => {
                        invalid.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(other) => panic!("unexpected error: {:?}", other),
                });
            }
        });

        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert_eq!(invalid.load(Ordering::SeqCst), 11);
        assert_eq!(lifecycle.store().access_token_count(), 1);
    }

    #[test]
    fn test_expired_code_is_invalid() {
        let lifecycle = lifecycle();
        let mut grant = lifecycle
            .issue_grant(&alice(), &AuthorizationRequest::new("spa", &["openid"]))
            .unwrap();
        grant.expires_at = Utc::now() - Duration::seconds(1);
        lifecycle.store().save_grant(grant.clone());

        let err = lifecycle.redeem_grant(&grant.code).unwrap_err();
        assert_eq!(
            err,
            BridgeError::InvalidGrant("authorization code has expired".to_string())
        );
    }

    #[test]
    fn test_refresh_rotates_tokens() {
        let lifecycle = lifecycle();
        let grant = lifecycle
            .issue_grant(
                &alice(),
                &AuthorizationRequest::new("spa", &["openid", REFRESH_TOKEN_SCOPE]),
            )
            .unwrap();
        let first = lifecycle.redeem_grant(&grant.code).unwrap();
        let refresh_key = first.refresh_token.as_ref().unwrap().token_key.clone();
        assert_eq!(
            first.access_token.refresh_token_key.as_deref(),
            Some(refresh_key.as_str())
        );

        let second = lifecycle.refresh(&refresh_key).unwrap();
        assert_ne!(second.access_token.token_key, first.access_token.token_key);
        assert_eq!(second.id_token, first.id_token);
        let next_refresh = second.refresh_token.as_ref().unwrap();
        assert_ne!(next_refresh.token_key, refresh_key);

        let store = lifecycle.store();
        assert!(store.get_access_token(&first.access_token.token_key).is_none());
        assert!(store.get_access_token(&second.access_token.token_key).is_some());

        let err = lifecycle.refresh(&refresh_key).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidGrant(_)));
    }

    #[test]
    fn test_refresh_not_supported_without_scope() {
        let lifecycle = lifecycle();
        let access = AccessToken::new(
            "spa",
            UserSubject::new("alice"),
            vec!["openid".to_string()],
            60,
        )
        .unwrap();
        let refresh = RefreshToken::new(&access, None).unwrap();
        let key = refresh.token_key.clone();
        lifecycle.store().save_refresh_token(&access, refresh);

        assert_eq!(lifecycle.refresh(&key).unwrap_err(), BridgeError::RefreshNotSupported);
        assert!(lifecycle.store().get_refresh_token(&key).is_some());
    }

    #[test]
    fn test_revoke_is_idempotent() {
        let lifecycle = lifecycle();
        let grant = lifecycle
            .issue_grant(
                &alice(),
                &AuthorizationRequest::new("spa", &["openid", REFRESH_TOKEN_SCOPE]),
            )
            .unwrap();
        let tokens = lifecycle.redeem_grant(&grant.code).unwrap();
        let access_key = tokens.access_token.token_key.clone();
        let refresh_key = tokens.refresh_token.unwrap().token_key;

        assert!(lifecycle.revoke(&refresh_key, TokenKind::RefreshToken));
        assert!(!lifecycle.revoke(&refresh_key, TokenKind::RefreshToken));
        // cascaded
        assert!(!lifecycle.revoke(&access_key, TokenKind::AccessToken));
        assert!(lifecycle.store().get_access_token(&access_key).is_none());
    }

    #[test]
    fn test_unrepresentable_lifetimes_are_errors() {
        let mut config = es256_config();
        config.code_ttl_secs = u64::MAX;
        let lifecycle = GrantLifecycle::from_config(&config, Arc::new(TokenStore::new())).unwrap();
        lifecycle.register_client(Client::public("spa")).unwrap();

        let err = lifecycle
            .issue_grant(&alice(), &AuthorizationRequest::new("spa", &["openid"]))
            .unwrap_err();
        assert!(matches!(err, BridgeError::Configuration(_)));
        assert_eq!(lifecycle.store().grant_count(), 0);

        let mut config = es256_config();
        config.access_token_ttl_secs = i64::MAX as u64;
        let lifecycle = GrantLifecycle::from_config(&config, Arc::new(TokenStore::new())).unwrap();
        lifecycle.register_client(Client::public("spa")).unwrap();
        let grant = lifecycle
            .issue_grant(&alice(), &AuthorizationRequest::new("spa", &["openid"]))
            .unwrap();

        let err = lifecycle.redeem_grant(&grant.code).unwrap_err();
        assert!(matches!(err, BridgeError::Configuration(_)));
        assert_eq!(lifecycle.store().access_token_count(), 0);
    }

    #[test]
    fn test_register_confidential_client_without_secret() {
        let lifecycle = lifecycle();
        let err = lifecycle
            .register_client(Client::confidential("web2", ""))
            .unwrap_err();
        assert!(matches!(err, BridgeError::Configuration(_)));
        assert!(lifecycle.store().get_client("web2").is_none());

        assert!(lifecycle.register_client(Client::public("cli")).is_ok());
    }
}
