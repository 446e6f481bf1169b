//! WS-Trust exchange of a federated assertion for a relying-party token.
//!
//! The IdP holds the user's original SAML assertion and asks the STS to issue
//! a token for the target realm on the user's behalf:
//! - realm claims are attached from a configured table
//! - public-key confirmation binds the client certificate, falling back to bearer
//! - the STS port may be discovered from the first inbound request

pub mod claims;
pub mod client;
pub mod config;
pub mod request;
pub mod transport;

pub use claims::{render_claims, ClaimsLookup, ClaimsResolver};
pub use client::{ExchangeContext, StsExchangeClient};
pub use config::{KeyType, StsConfig};
pub use request::{QName, TokenRequest};
pub use transport::{extract_token_response, HttpStsTransport, StsTransport};

use crate::error::BridgeError;

pub(crate) fn xml_error<E: std::fmt::Display>(err: E) -> BridgeError {
    BridgeError::Configuration(format!("Failed to write XML: {}", err))
}
