//! Federated token bridge.
//!
//! Takes a principal authenticated by a SAML identity provider and issues
//! narrower tokens from its assertion:
//! - a relying-party token, exchanged at a WS-Trust STS on the user's behalf
//! - an OAuth2 authorization code whose grant carries a signed OpenID Connect
//!   ID Token

pub mod bridge;
pub mod config;
pub mod error;
pub mod oauth;
pub mod principal;
pub mod sts;

pub use bridge::TokenBridge;
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use principal::{ClientCertificate, FederatedPrincipal, Principal};
