//! OAuth2 authorization code flow with OpenID Connect ID Tokens.
//!
//! Federated principals are granted codes carrying a signed ID Token. Codes
//! redeem once for access tokens, optionally paired with refresh tokens.

pub mod cleanup;
pub mod config;
pub mod grants;
pub mod id_token;
pub mod permissions;
pub mod signer;
pub mod store;
pub mod types;

pub use cleanup::{spawn_cleanup_task, DEFAULT_CLEANUP_INTERVAL_SECS};
pub use config::{ClientConfig, OAuthConfig};
pub use grants::{is_refresh_token_supported, AuthorizationRequest, GrantLifecycle, GrantLifetimes};
pub use id_token::{IdTokenClaims, IdTokenMinter, LocalSamlTokenConverter, SamlTokenConverter};
pub use permissions::PermissionSet;
pub use signer::{ConfiguredSignerProvider, Signer, SignerKind, SignerProvider};
pub use store::TokenStore;
pub use types::{
    AccessToken, AuthorizationCodeGrant, Client, Permission, RefreshToken, TokenKind,
    TokenResponse, UserSubject,
};
