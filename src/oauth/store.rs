//! In-memory OAuth token store.
//!
//! Four independent key spaces, each behind its own lock:
//! - registered clients
//! - authorization code grants (consumed exactly once)
//! - access tokens
//! - refresh tokens
//!
//! Every operation touches one key atomically. Lock poisoning is recovered,
//! since a panicking writer cannot leave a half-written map entry behind.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use super::types::{key_prefix, AccessToken, AuthorizationCodeGrant, Client, RefreshToken};

/// Concurrent keyed storage for clients, grants and tokens.
#[derive(Default)]
pub struct TokenStore {
    clients: RwLock<HashMap<String, Client>>,
    code_grants: RwLock<HashMap<String, AuthorizationCodeGrant>>,
    access_tokens: RwLock<HashMap<String, AccessToken>>,
    refresh_tokens: RwLock<HashMap<String, RefreshToken>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a client.
    pub fn register_client(&self, client: Client) {
        debug!(client_id = %client.client_id, confidential = client.confidential, "Client registered");
        write(&self.clients).insert(client.client_id.clone(), client);
    }

    pub fn get_client(&self, client_id: &str) -> Option<Client> {
        read(&self.clients).get(client_id).cloned()
    }

    pub fn remove_client(&self, client_id: &str) -> Option<Client> {
        write(&self.clients).remove(client_id)
    }

    /// Insert a grant by code. An existing grant with the same code is replaced.
    pub fn save_grant(&self, grant: AuthorizationCodeGrant) {
        write(&self.code_grants).insert(grant.code.clone(), grant);
    }

    /// Remove and return the grant. At most one caller ever receives it.
    pub fn consume_grant(&self, code: &str) -> Option<AuthorizationCodeGrant> {
        write(&self.code_grants).remove(code)
    }

    pub fn save_access_token(&self, token: AccessToken) {
        write(&self.access_tokens).insert(token.token_key.clone(), token);
    }

    /// Look up a live access token. Expired tokens are not returned.
    pub fn get_access_token(&self, key: &str) -> Option<AccessToken> {
        read(&self.access_tokens)
            .get(key)
            .filter(|token| !token.is_expired())
            .cloned()
    }

    /// Remove an access token. Returns whether anything was removed.
    pub fn revoke_access_token(&self, key: &str) -> bool {
        let removed = write(&self.access_tokens).remove(key).is_some();
        if removed {
            debug!(token = %key_prefix(key), "Access token revoked");
        }
        removed
    }

    /// Store `refresh` as the refresh token paired with `access`.
    pub fn save_refresh_token(&self, access: &AccessToken, mut refresh: RefreshToken) {
        if !refresh.access_tokens.contains(&access.token_key) {
            refresh.access_tokens.push(access.token_key.clone());
        }
        write(&self.refresh_tokens).insert(refresh.token_key.clone(), refresh);
    }

    /// Look up a live refresh token.
    pub fn get_refresh_token(&self, key: &str) -> Option<RefreshToken> {
        read(&self.refresh_tokens)
            .get(key)
            .filter(|token| !token.is_expired())
            .cloned()
    }

    /// Atomically remove a refresh token owned by `client_id`.
    ///
    /// Tokens belonging to another client are left in place and reported as
    /// not found.
    pub fn take_refresh_token(&self, client_id: &str, key: &str) -> Option<RefreshToken> {
        let mut tokens = write(&self.refresh_tokens);
        match tokens.get(key) {
            Some(token) if token.client_id == client_id => tokens.remove(key),
            _ => None,
        }
    }

    /// Remove a refresh token owned by `client_id` along with the access
    /// tokens issued under it.
    pub fn revoke_refresh_token(&self, client_id: &str, key: &str) -> Option<RefreshToken> {
        let refresh = self.take_refresh_token(client_id, key)?;

        let mut access_tokens = write(&self.access_tokens);
        for access_key in &refresh.access_tokens {
            access_tokens.remove(access_key);
        }
        drop(access_tokens);

        debug!(
            token = %key_prefix(key),
            client_id = %client_id,
            access_tokens = refresh.access_tokens.len(),
            "Refresh token revoked"
        );
        Some(refresh)
    }

    /// Drop expired grants and tokens. Returns the number of entries removed.
    pub fn evict_expired(&self) -> usize {
        let mut evicted = 0;

        {
            let mut grants = write(&self.code_grants);
            let before = grants.len();
            grants.retain(|_, grant| !grant.is_expired());
            evicted += before - grants.len();
        }
        {
            let mut tokens = write(&self.access_tokens);
            let before = tokens.len();
            tokens.retain(|_, token| !token.is_expired());
            evicted += before - tokens.len();
        }
        {
            let mut tokens = write(&self.refresh_tokens);
            let before = tokens.len();
            tokens.retain(|_, token| !token.is_expired());
            evicted += before - tokens.len();
        }

        if evicted > 0 {
            debug!(evicted, "Evicted expired grants and tokens");
        }
        evicted
    }

    pub fn client_count(&self) -> usize {
        read(&self.clients).len()
    }

    pub fn grant_count(&self) -> usize {
        read(&self.code_grants).len()
    }

    pub fn access_token_count(&self) -> usize {
        read(&self.access_tokens).len()
    }

    pub fn refresh_token_count(&self) -> usize {
        read(&self.refresh_tokens).len()
    }
}
