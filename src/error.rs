//! Error types shared by the exchange and grant engines.

use thiserror::Error;

/// Result type for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors surfaced to callers of the bridge.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// Malformed endpoint URL or missing required configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// No on-behalf-of token available for the principal.
    #[error("Missing identity: {0}")]
    MissingIdentity(String),

    /// STS rejected the request, was unreachable, or timed out.
    #[error("Token exchange failed: {0}")]
    Exchange(String),

    /// Principal is not a recognized federated type.
    #[error("Unsupported principal: {0}")]
    UnsupportedPrincipal(String),

    /// Requested scope is not declared in the permission table.
    #[error("Unexpected scope: {0}")]
    UnknownScope(String),

    /// The mandatory default scope was not requested.
    #[error("Default scope is missing: {0}")]
    MissingDefaultScope(String),

    /// Code or refresh token is unknown, consumed, expired or not owned by the caller.
    #[error("Invalid grant: {0}")]
    InvalidGrant(String),

    /// The granted scopes do not allow refreshing.
    #[error("Refresh tokens are not supported for the granted scopes")]
    RefreshNotSupported,

    /// Client id is not registered.
    #[error("Unknown client: {0}")]
    UnknownClient(String),

    /// The JWS library rejected the signing key or claims.
    #[error("Signing failed: {0}")]
    Signing(String),
}

impl BridgeError {
    /// True when the caller sent an invalid request, false when the trust
    /// fabric (STS, keys, configuration) is at fault.
    pub fn is_request_error(&self) -> bool {
        matches!(
            self,
            BridgeError::MissingIdentity(_)
                | BridgeError::UnsupportedPrincipal(_)
                | BridgeError::UnknownScope(_)
                | BridgeError::MissingDefaultScope(_)
                | BridgeError::InvalidGrant(_)
                | BridgeError::RefreshNotSupported
                | BridgeError::UnknownClient(_)
        )
    }

    /// OAuth 2.0 error code (RFC 6749 section 5.2) for this error.
    pub fn oauth_error_code(&self) -> &'static str {
        match self {
            BridgeError::UnknownScope(_) | BridgeError::MissingDefaultScope(_) => "invalid_scope",
            BridgeError::InvalidGrant(_) => "invalid_grant",
            BridgeError::UnknownClient(_) => "invalid_client",
            BridgeError::RefreshNotSupported => "unsupported_grant_type",
            BridgeError::MissingIdentity(_) | BridgeError::UnsupportedPrincipal(_) => {
                "access_denied"
            }
            BridgeError::Exchange(_) => "temporarily_unavailable",
            BridgeError::Configuration(_) | BridgeError::Signing(_) => "server_error",
        }
    }
}

impl From<jsonwebtoken::errors::Error> for BridgeError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        BridgeError::Signing(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_errors_are_distinguished_from_fabric_errors() {
        assert!(BridgeError::UnknownScope("profile".into()).is_request_error());
        assert!(BridgeError::InvalidGrant("code".into()).is_request_error());
        assert!(!BridgeError::Exchange("timeout".into()).is_request_error());
        assert!(!BridgeError::Configuration("bad url".into()).is_request_error());
    }

    #[test]
    fn test_oauth_error_codes() {
        assert_eq!(
            BridgeError::MissingDefaultScope("openid".into()).oauth_error_code(),
            "invalid_scope"
        );
        assert_eq!(BridgeError::RefreshNotSupported.oauth_error_code(), "unsupported_grant_type");
        assert_eq!(BridgeError::Signing("bad key".into()).oauth_error_code(), "server_error");
    }
}
