//! Scope to permission resolution.

use std::collections::HashMap;
use tracing::debug;

use super::types::{Client, Permission, OPENID_SCOPE};
use crate::error::{BridgeError, Result};

const OPENID_DESCRIPTION: &str = "Access the claims about the authentication";

/// Read-only table of declared scopes. `openid` is always declared and is the
/// only default permission.
#[derive(Debug, Clone)]
pub struct PermissionSet {
    permissions: HashMap<String, Permission>,
}

impl Default for PermissionSet {
    fn default() -> Self {
        Self::from_scopes(&HashMap::new())
    }
}

impl PermissionSet {
    /// Build the table from `scope -> description` pairs.
    pub fn from_scopes(scopes: &HashMap<String, String>) -> Self {
        let mut permissions: HashMap<String, Permission> = scopes
            .iter()
            .filter(|(scope, _)| scope.as_str() != OPENID_SCOPE)
            .map(|(scope, description)| {
                (
                    scope.clone(),
                    Permission {
                        permission: scope.clone(),
                        description: description.clone(),
                        default: false,
                    },
                )
            })
            .collect();

        permissions.insert(
            OPENID_SCOPE.to_string(),
            Permission {
                permission: OPENID_SCOPE.to_string(),
                description: OPENID_DESCRIPTION.to_string(),
                default: true,
            },
        );

        Self { permissions }
    }

    pub fn get(&self, scope: &str) -> Option<&Permission> {
        self.permissions.get(scope)
    }

    pub fn len(&self) -> usize {
        self.permissions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.permissions.is_empty()
    }

    /// Resolve requested scopes to permissions.
    ///
    /// Fails with [`BridgeError::UnknownScope`] on the first undeclared scope and
    /// with [`BridgeError::MissingDefaultScope`] when `openid` was not requested.
    /// Duplicate scopes resolve once.
    pub fn convert_scopes_to_permissions(
        &self,
        client: &Client,
        scopes: &[String],
    ) -> Result<Vec<Permission>> {
        let mut resolved: Vec<Permission> = Vec::with_capacity(scopes.len());

        for scope in scopes {
            let permission = self
                .permissions
                .get(scope)
                .ok_or_else(|| BridgeError::UnknownScope(scope.clone()))?;
            if !resolved.iter().any(|p| p.permission == permission.permission) {
                resolved.push(permission.clone());
            }
        }

        if !resolved.iter().any(|p| p.default) {
            return Err(BridgeError::MissingDefaultScope(OPENID_SCOPE.to_string()));
        }

        debug!(
            client_id = %client.client_id,
            scopes = ?resolved.iter().map(|p| p.permission.as_str()).collect::<Vec<_>>(),
            "Resolved requested scopes"
        );

        Ok(resolved)
    }
}
