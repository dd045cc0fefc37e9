// Credential store abstraction and the token storage adapter built on it

use dashmap::DashMap;
use std::sync::Arc;

use super::types::{CredentialPair, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY};
use crate::error::StoreError;

/// Key-value persistence for credentials
pub trait CredentialStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn clear(&self) -> Result<(), StoreError>;
}

/// Process-local store, lost on exit
#[derive(Default, Clone)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with a credential pair
    pub fn with_pair(access_token: &str, refresh_token: &str) -> Self {
        let store = Self::new();
        store
            .entries
            .insert(ACCESS_TOKEN_KEY.to_string(), access_token.to_string());
        store
            .entries
            .insert(REFRESH_TOKEN_KEY.to_string(), refresh_token.to_string());
        store
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CredentialStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.entries.clear();
        Ok(())
    }
}

/// Typed view of a `CredentialStore`: exactly two logical keys
#[derive(Clone)]
pub struct TokenStorage {
    store: Arc<dyn CredentialStore>,
}

impl TokenStorage {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    /// Current access token; empty values count as missing
    pub fn access_token(&self) -> Result<Option<String>, StoreError> {
        Ok(self.store.get(ACCESS_TOKEN_KEY)?.filter(|t| !t.is_empty()))
    }

    /// Current refresh token; empty values count as missing
    pub fn refresh_token(&self) -> Result<Option<String>, StoreError> {
        Ok(self.store.get(REFRESH_TOKEN_KEY)?.filter(|t| !t.is_empty()))
    }

    /// Replace both tokens (login)
    pub fn save(&self, pair: &CredentialPair) -> Result<(), StoreError> {
        self.store.set(ACCESS_TOKEN_KEY, &pair.access_token)?;
        self.store.set(REFRESH_TOKEN_KEY, &pair.refresh_token)
    }

    /// Store a refreshed access token, and the rotated refresh token if any
    pub fn update(&self, access_token: &str, refresh_token: Option<&str>) -> Result<(), StoreError> {
        self.store.set(ACCESS_TOKEN_KEY, access_token)?;
        if let Some(refresh_token) = refresh_token {
            self.store.set(REFRESH_TOKEN_KEY, refresh_token)?;
        }
        Ok(())
    }

    /// Drop every stored credential (logout, irrecoverable refresh failure)
    pub fn clear(&self) -> Result<(), StoreError> {
        self.store.clear()
    }
}
