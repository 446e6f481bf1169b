//! OAuth2 / OpenID Connect provider configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Longest lifetime accepted for any code or token (ten years).
pub const MAX_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Grant and ID Token configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OAuthConfig {
    /// Issuer claim for ID Tokens.
    #[serde(default = "default_issuer")]
    pub issuer: String,

    /// Declared scopes: scope -> description. `openid` is always declared.
    #[serde(default)]
    pub scopes: HashMap<String, String>,

    /// Sign ID Tokens for confidential clients with their client secret (HS256).
    /// Ignored for public clients.
    #[serde(default)]
    pub sign_id_token_with_client_secret: bool,

    /// Path to the process signing key (PEM).
    #[serde(default)]
    pub signing_key_path: Option<PathBuf>,

    /// Inline process signing key (PEM).
    #[serde(default)]
    pub signing_key_inline: Option<String>,

    /// Process signing algorithm (RS256, RS384, RS512, ES256, ES384).
    #[serde(default = "default_algorithm")]
    pub signing_algorithm: String,

    /// `kid` header for tokens signed with the process key.
    #[serde(default)]
    pub signing_key_id: Option<String>,

    /// ID Token lifetime in seconds.
    #[serde(default = "default_id_token_ttl")]
    pub id_token_ttl_secs: u64,

    /// Authorization code lifetime in seconds.
    #[serde(default = "default_code_ttl")]
    pub code_ttl_secs: u64,

    /// Access token lifetime in seconds.
    #[serde(default = "default_access_token_ttl")]
    pub access_token_ttl_secs: u64,

    /// Refresh token lifetime in seconds (unset = no expiry).
    #[serde(default)]
    pub refresh_token_ttl_secs: Option<u64>,

    /// Clients registered at startup.
    #[serde(default)]
    pub clients: Vec<ClientConfig>,
}

/// A client registered from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    pub client_id: String,
    #[serde(default)]
    pub confidential: bool,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
}

fn default_issuer() -> String {
    "https://localhost/oidc".to_string()
}

fn default_algorithm() -> String {
    "RS256".to_string()
}

fn default_id_token_ttl() -> u64 {
    3600
}

fn default_code_ttl() -> u64 {
    600
}

fn default_access_token_ttl() -> u64 {
    3600
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            issuer: default_issuer(),
            scopes: HashMap::new(),
            sign_id_token_with_client_secret: false,
            signing_key_path: None,
            signing_key_inline: None,
            signing_algorithm: default_algorithm(),
            signing_key_id: None,
            id_token_ttl_secs: default_id_token_ttl(),
            code_ttl_secs: default_code_ttl(),
            access_token_ttl_secs: default_access_token_ttl(),
            refresh_token_ttl_secs: None,
            clients: vec![],
        }
    }
}

impl OAuthConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.signing_key_path.is_none() && self.signing_key_inline.is_none() {
            return Err("ID Tokens require signing_key_path or signing_key_inline".to_string());
        }

        if let Some(ref path) = self.signing_key_path {
            if !path.exists() {
                return Err(format!("Signing key file does not exist: {:?}", path));
            }
        }

        let valid_algs = ["RS256", "RS384", "RS512", "ES256", "ES384"];
        if !valid_algs.contains(&self.signing_algorithm.as_str()) {
            return Err(format!(
                "Invalid signing algorithm: {}. Valid: {:?}",
                self.signing_algorithm, valid_algs
            ));
        }

        if self.issuer.trim().is_empty() {
            return Err("issuer must not be empty".to_string());
        }

        if self.code_ttl_secs == 0 || self.access_token_ttl_secs == 0 || self.id_token_ttl_secs == 0 {
            return Err("token lifetimes must be greater than zero".to_string());
        }

        let lifetimes = [
            ("code_ttl_secs", Some(self.code_ttl_secs)),
            ("access_token_ttl_secs", Some(self.access_token_ttl_secs)),
            ("id_token_ttl_secs", Some(self.id_token_ttl_secs)),
            ("refresh_token_ttl_secs", self.refresh_token_ttl_secs),
        ];
        for (name, ttl) in lifetimes {
            if ttl.is_some_and(|ttl| ttl > MAX_TTL_SECS) {
                return Err(format!("{} must not exceed {} seconds", name, MAX_TTL_SECS));
            }
        }

        for client in &self.clients {
            if client.client_id.trim().is_empty() {
                return Err("client_id must not be empty".to_string());
            }
            if self.sign_id_token_with_client_secret
                && client.confidential
                && client.client_secret.as_deref().map_or(true, str::is_empty)
            {
                return Err(format!(
                    "Confidential client '{}' needs a client_secret when sign_id_token_with_client_secret is enabled",
                    client.client_id
                ));
            }
        }

        Ok(())
    }
}
