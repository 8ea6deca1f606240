//! [`CachingKeyResolver`]: fetch, unwrap and cache data encryption keys.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use common::EncryptionError;

use super::{
    CachedKey, DistributedCache, KeyPropertiesSource, KeyResolutionError, KeyResolver, KeyUnwrapper,
    ResolvedKey, TtlCache,
};
use crate::config::EngineConfig;

/// Resolves keys through a [`KeyPropertiesSource`] and a [`KeyUnwrapper`],
/// caching the unwrapped result.
///
/// Entries restored from a distributed cache carry only wrapped properties;
/// they are unwrapped on first use and then cached in memory.
#[derive(Clone)]
pub struct CachingKeyResolver {
    source: Arc<dyn KeyPropertiesSource>,
    unwrapper: Arc<dyn KeyUnwrapper>,
    cache: TtlCache<CachedKey>,
}

impl std::fmt::Debug for CachingKeyResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachingKeyResolver")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl CachingKeyResolver {
    pub fn new(
        source: Arc<dyn KeyPropertiesSource>,
        unwrapper: Arc<dyn KeyUnwrapper>,
        cache: TtlCache<CachedKey>,
    ) -> Self {
        Self {
            source,
            unwrapper,
            cache,
        }
    }

    /// Build the cache from the engine's TTL, refresh and prefix settings.
    ///
    /// # Errors
    ///
    /// [`EncryptionError::Configuration`] if the refresh threshold is not below the TTL.
    pub fn from_config(
        source: Arc<dyn KeyPropertiesSource>,
        unwrapper: Arc<dyn KeyUnwrapper>,
        config: &EngineConfig,
        distributed: Option<Arc<dyn DistributedCache>>,
    ) -> Result<Self, EncryptionError> {
        let cache = TtlCache::new(
            config.key_cache_ttl(),
            config.key_cache_refresh_threshold(),
            config.distributed_cache_prefix.clone(),
            distributed,
        )
        .map_err(|e| EncryptionError::Configuration(e.to_string()))?;
        Ok(Self::new(source, unwrapper, cache))
    }

    pub fn cache(&self) -> &TtlCache<CachedKey> {
        &self.cache
    }
}

#[async_trait]
impl KeyResolver for CachingKeyResolver {
    #[instrument(skip(self, cancel))]
    async fn resolve(
        &self,
        dek_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ResolvedKey, KeyResolutionError> {
        let source = Arc::clone(&self.source);
        let unwrapper = Arc::clone(&self.unwrapper);
        let id = dek_id.to_owned();
        let entry = self
            .cache
            .get_or_fetch(dek_id, cancel, move |token| async move {
                let properties = source.fetch(&id, &token).await?;
                if properties.dek_id != id {
                    return Err(KeyResolutionError::Unavailable {
                        dek_id: id,
                        reason: format!("key service returned properties for {}", properties.dek_id),
                    });
                }
                let raw_key = unwrapper.unwrap_key(&properties, &token).await?;
                Ok(CachedKey {
                    properties,
                    raw_key: Some(raw_key),
                })
            })
            .await?;

        let key = match &entry.raw_key {
            Some(key) => key.clone(),
            None => {
                let key = self.unwrapper.unwrap_key(&entry.properties, cancel).await?;
                self.cache.insert_local(
                    dek_id,
                    CachedKey {
                        properties: entry.properties.clone(),
                        raw_key: Some(key.clone()),
                    },
                );
                debug!("unwrapped key restored from distributed cache");
                key
            }
        };
        Ok(ResolvedKey::unwrapped(entry.properties.encryption_type, key))
    }
}
