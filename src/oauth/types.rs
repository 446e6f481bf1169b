//! OAuth2 entities held by the token store.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::config::ClientConfig;
use crate::error::{BridgeError, Result};

/// The mandatory OpenID Connect scope.
pub const OPENID_SCOPE: &str = "openid";

/// Scope that makes a grant eligible for refresh tokens.
pub const REFRESH_TOKEN_SCOPE: &str = "refreshToken";

/// Subject property carrying the signed ID Token.
pub const ID_TOKEN_PROPERTY: &str = "id_token";

/// Token type of issued access tokens.
pub const BEARER_TOKEN_TYPE: &str = "Bearer";

/// Generate an opaque key for codes and tokens (16 random bytes, hex-encoded).
pub fn generate_token_key() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

/// `issued_at` plus `ttl_secs`, or a configuration error when the lifetime
/// does not fit a timestamp.
pub fn expiry_after(issued_at: DateTime<Utc>, ttl_secs: u64) -> Result<DateTime<Utc>> {
    i64::try_from(ttl_secs)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|ttl| issued_at.checked_add_signed(ttl))
        .ok_or_else(|| {
            BridgeError::Configuration(format!("Token lifetime of {}s is out of range", ttl_secs))
        })
}

/// Loggable prefix of a token key.
pub fn key_prefix(key: &str) -> &str {
    key.get(..8).unwrap_or(key)
}

/// Registered OAuth2 client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub client_id: String,
    /// Confidential clients can keep a secret; public clients cannot.
    pub confidential: bool,
    pub client_secret: Option<String>,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
}

impl Client {
    pub fn confidential(client_id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            confidential: true,
            client_secret: Some(secret.into()),
            redirect_uris: vec![],
        }
    }

    pub fn public(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            confidential: false,
            client_secret: None,
            redirect_uris: vec![],
        }
    }
}

impl From<ClientConfig> for Client {
    fn from(config: ClientConfig) -> Self {
        Self {
            client_id: config.client_id,
            confidential: config.confidential,
            client_secret: config.client_secret,
            redirect_uris: config.redirect_uris,
        }
    }
}

/// Permission a scope grants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    /// Scope name.
    pub permission: String,
    pub description: String,
    /// Granted whether or not the user is asked.
    pub default: bool,
}

/// End user a grant was issued to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSubject {
    pub login: String,
    pub properties: HashMap<String, String>,
}

impl UserSubject {
    pub fn new(login: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            properties: HashMap::new(),
        }
    }

    pub fn id_token(&self) -> Option<&str> {
        self.properties.get(ID_TOKEN_PROPERTY).map(String::as_str)
    }
}

/// Authorization code grant. Consumed exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationCodeGrant {
    pub code: String,
    pub client_id: String,
    pub subject: UserSubject,
    pub approved_scopes: Vec<String>,
    pub redirect_uri: Option<String>,
    pub nonce: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AuthorizationCodeGrant {
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

/// Access token issued from a grant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessToken {
    pub token_key: String,
    pub token_type: String,
    pub client_id: String,
    pub subject: UserSubject,
    pub scopes: Vec<String>,
    /// Refresh token issued alongside, if any.
    pub refresh_token_key: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn new(
        client_id: &str,
        subject: UserSubject,
        scopes: Vec<String>,
        ttl_secs: u64,
    ) -> Result<Self> {
        let issued_at = Utc::now();
        Ok(Self {
            token_key: generate_token_key(),
            token_type: BEARER_TOKEN_TYPE.to_string(),
            client_id: client_id.to_string(),
            subject,
            scopes,
            refresh_token_key: None,
            issued_at,
            expires_at: expiry_after(issued_at, ttl_secs)?,
        })
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Seconds until expiry, zero once expired.
    pub fn expires_in(&self) -> u64 {
        (self.expires_at - Utc::now()).num_seconds().max(0) as u64
    }

    /// The ID Token minted when the grant was issued.
    pub fn id_token(&self) -> Option<&str> {
        self.subject.id_token()
    }
}

/// Refresh token paired with one or more access tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshToken {
    pub token_key: String,
    pub client_id: String,
    pub subject: UserSubject,
    pub scopes: Vec<String>,
    /// Access tokens issued under this refresh token.
    pub access_tokens: Vec<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl RefreshToken {
    pub fn new(access: &AccessToken, ttl_secs: Option<u64>) -> Result<Self> {
        let issued_at = Utc::now();
        Ok(Self {
            token_key: generate_token_key(),
            client_id: access.client_id.clone(),
            subject: access.subject.clone(),
            scopes: access.scopes.clone(),
            access_tokens: vec![access.token_key.clone()],
            issued_at,
            expires_at: ttl_secs.map(|ttl| expiry_after(issued_at, ttl)).transpose()?,
        })
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| Utc::now() > exp)
    }
}

/// Which key space a revocation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    AccessToken,
    RefreshToken,
}

/// Tokens handed back when a code or refresh token is redeemed.
#[derive(Debug, Clone)]
pub struct TokenResponse {
    pub access_token: AccessToken,
    pub refresh_token: Option<RefreshToken>,
    pub id_token: Option<String>,
}
