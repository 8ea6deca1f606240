//! Data encryption key resolution.
//!
//! The engine asks a [`KeyResolver`] for key material by dek id. Two
//! resolvers ship with the crate:
//!
//! - [`StaticKeyResolver`]: a fixed in-memory map, for tests and embedded use.
//! - [`CachingKeyResolver`]: fetches wrapped key properties from a
//!   [`KeyPropertiesSource`], unwraps them with a [`KeyUnwrapper`], and caches
//!   the result in a [`TtlCache`] with proactive refresh.
//!
//! # Security invariants
//!
//! - Unwrapped key bytes are held in [`RootKey`], which is zeroed on drop and
//!   redacted in `Debug` output.
//! - Raw keys are never written to a distributed cache; only wrapped
//!   properties are.

pub mod cache;
pub mod caching;

pub use cache::{CacheError, DistributedCache, EntryState, TtlCache};
pub use caching::CachingKeyResolver;

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use common::EncryptionError;

use crate::crypto::{EncryptionType, RootKey};

/// Errors produced while resolving a key.
#[derive(Debug, Error)]
pub enum KeyResolutionError {
    /// No key exists for the id.
    #[error("no key found for {dek_id}")]
    NotFound { dek_id: String },

    /// The resolver returned a wrapped key and nothing can unwrap it.
    #[error("key {dek_id} is wrapped and no unwrapper is configured")]
    StillWrapped { dek_id: String },

    /// The backing store or key-wrap provider failed.
    #[error("key {dek_id} unavailable: {reason}")]
    Unavailable { dek_id: String, reason: String },

    /// Resolution was cancelled.
    #[error("key resolution cancelled")]
    Cancelled,
}

impl From<KeyResolutionError> for EncryptionError {
    fn from(err: KeyResolutionError) -> Self {
        match err {
            KeyResolutionError::Cancelled => EncryptionError::Cancelled,
            KeyResolutionError::NotFound { ref dek_id }
            | KeyResolutionError::StillWrapped { ref dek_id }
            | KeyResolutionError::Unavailable { ref dek_id, .. } => EncryptionError::KeyResolution {
                dek_id: dek_id.clone(),
                reason: err.to_string(),
            },
        }
    }
}

/// Key material as returned by a resolver.
#[derive(Debug, Clone)]
pub enum KeyMaterial {
    /// Ready-to-use root key bytes.
    Unwrapped(RootKey),
    /// An opaque handle the caller must unwrap elsewhere.
    Wrapped { handle: String },
}

/// A resolved key and how it is used.
#[derive(Debug, Clone)]
pub struct ResolvedKey {
    pub encryption_type: EncryptionType,
    pub material: KeyMaterial,
}

impl ResolvedKey {
    pub fn unwrapped(encryption_type: EncryptionType, key: RootKey) -> Self {
        Self {
            encryption_type,
            material: KeyMaterial::Unwrapped(key),
        }
    }

    /// The root key, or [`KeyResolutionError::StillWrapped`].
    pub fn root_key(&self, dek_id: &str) -> Result<&RootKey, KeyResolutionError> {
        match &self.material {
            KeyMaterial::Unwrapped(key) => Ok(key),
            KeyMaterial::Wrapped { .. } => Err(KeyResolutionError::StillWrapped {
                dek_id: dek_id.to_owned(),
            }),
        }
    }
}

/// Resolves a dek id to key material.
///
/// Implementations own their retry policy; the engine never retries.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeyResolver: Send + Sync {
    async fn resolve(
        &self,
        dek_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ResolvedKey, KeyResolutionError>;
}

/// In-memory resolver over a fixed set of keys.
#[derive(Debug, Clone, Default)]
pub struct StaticKeyResolver {
    keys: Arc<RwLock<HashMap<String, ResolvedKey>>>,
}

impl StaticKeyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a key.
    pub fn insert(&self, dek_id: impl Into<String>, encryption_type: EncryptionType, key: RootKey) {
        self.keys
            .write()
            .insert(dek_id.into(), ResolvedKey::unwrapped(encryption_type, key));
    }

    pub fn with_key(self, dek_id: impl Into<String>, encryption_type: EncryptionType, key: RootKey) -> Self {
        self.insert(dek_id, encryption_type, key);
        self
    }

    pub fn remove(&self, dek_id: &str) -> bool {
        self.keys.write().remove(dek_id).is_some()
    }
}

#[async_trait]
impl KeyResolver for StaticKeyResolver {
    async fn resolve(
        &self,
        dek_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ResolvedKey, KeyResolutionError> {
        if cancel.is_cancelled() {
            return Err(KeyResolutionError::Cancelled);
        }
        self.keys
            .read()
            .get(dek_id)
            .cloned()
            .ok_or_else(|| KeyResolutionError::NotFound {
                dek_id: dek_id.to_owned(),
            })
    }
}

/// Wrapped key metadata, as stored by the key service. Safe to cache anywhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyProperties {
    pub dek_id: String,
    pub encryption_type: EncryptionType,
    /// Base64 of the wrapped key bytes.
    pub wrapped_key: String,
    /// Name of the key-encryption key that wrapped it.
    pub key_wrap_name: String,
}

/// A cache entry: properties plus, in process memory only, the unwrapped key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedKey {
    pub properties: KeyProperties,
    #[serde(skip)]
    pub raw_key: Option<RootKey>,
}

/// Fetches wrapped key properties from the key service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeyPropertiesSource: Send + Sync {
    async fn fetch(
        &self,
        dek_id: &str,
        cancel: &CancellationToken,
    ) -> Result<KeyProperties, KeyResolutionError>;
}

/// Unwraps key properties into root key bytes through a key-wrap provider.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeyUnwrapper: Send + Sync {
    async fn unwrap_key(
        &self,
        properties: &KeyProperties,
        cancel: &CancellationToken,
    ) -> Result<RootKey, KeyResolutionError>;
}
