//! Configuration loading and validation for the encryption engine.
//!
//! Values are read from `DOCENC_*` environment variables. Every field has a
//! default, so an empty environment yields a usable configuration.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use common::EncryptionError;

/// Which transform strategy processes documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsonProcessing {
    /// Parse the whole document into a tree, rewrite, serialize.
    Materializing,
    /// Single pass over tokens; memory bounded by the largest encrypted value.
    #[default]
    Streaming,
}

/// Validated engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Default transform strategy when an operation does not choose one.
    #[serde(default)]
    pub json_processing: JsonProcessing,

    /// Initial size of the streaming read buffer, in bytes.
    #[serde(default = "default_initial_buffer_size")]
    pub initial_buffer_size: usize,

    /// Streaming output is written to the sink once this many bytes are buffered.
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: usize,

    /// Version byte written at the start of every cipher envelope.
    #[serde(default = "default_cipher_version")]
    pub cipher_version: u8,

    /// How long (seconds) resolved key properties stay cached.
    #[serde(default = "default_key_cache_ttl")]
    pub key_cache_ttl_secs: u64,

    /// Remaining TTL (seconds) below which a cached entry is refreshed in the
    /// background. Must be less than `key_cache_ttl_secs`.
    #[serde(default = "default_key_cache_refresh")]
    pub key_cache_refresh_secs: u64,

    /// Key prefix used for entries in a distributed cache.
    #[serde(default = "default_distributed_cache_prefix")]
    pub distributed_cache_prefix: String,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_initial_buffer_size() -> usize {
    16 * 1024
}
fn default_flush_threshold() -> usize {
    64 * 1024
}
fn default_cipher_version() -> u8 {
    crate::crypto::DEFAULT_CIPHER_VERSION
}
fn default_key_cache_ttl() -> u64 {
    3600
}
fn default_key_cache_refresh() -> u64 {
    300
}
fn default_distributed_cache_prefix() -> String {
    "dek".into()
}
fn default_log_level() -> String {
    "info".into()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            json_processing: JsonProcessing::default(),
            initial_buffer_size: default_initial_buffer_size(),
            flush_threshold: default_flush_threshold(),
            cipher_version: default_cipher_version(),
            key_cache_ttl_secs: default_key_cache_ttl(),
            key_cache_refresh_secs: default_key_cache_refresh(),
            distributed_cache_prefix: default_distributed_cache_prefix(),
            log_level: default_log_level(),
        }
    }
}

impl EngineConfig {
    /// Load and validate configuration from `DOCENC_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be parsed or a value is invalid.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::with_prefix("DOCENC"))
            .build()
            .context("failed to build configuration from environment")?;

        let c: EngineConfig = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.validate().context("invalid engine configuration")?;
        Ok(c)
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    ///
    /// # Errors
    ///
    /// Returns [`EncryptionError::Configuration`] naming the offending setting.
    pub fn validate(&self) -> Result<(), EncryptionError> {
        if self.initial_buffer_size == 0 {
            return Err(EncryptionError::configuration(
                "DOCENC_INITIAL_BUFFER_SIZE must be > 0",
            ));
        }
        if self.flush_threshold == 0 {
            return Err(EncryptionError::configuration(
                "DOCENC_FLUSH_THRESHOLD must be > 0",
            ));
        }
        if self.cipher_version == 0 {
            return Err(EncryptionError::configuration(
                "DOCENC_CIPHER_VERSION must be non-zero",
            ));
        }
        if self.key_cache_ttl_secs == 0 {
            return Err(EncryptionError::configuration(
                "DOCENC_KEY_CACHE_TTL_SECS must be > 0",
            ));
        }
        if self.key_cache_refresh_secs >= self.key_cache_ttl_secs {
            return Err(EncryptionError::configuration(
                "DOCENC_KEY_CACHE_REFRESH_SECS must be less than DOCENC_KEY_CACHE_TTL_SECS",
            ));
        }
        if self.distributed_cache_prefix.trim().is_empty() {
            return Err(EncryptionError::configuration(
                "DOCENC_DISTRIBUTED_CACHE_PREFIX must not be empty",
            ));
        }
        Ok(())
    }

    pub fn key_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.key_cache_ttl_secs)
    }

    pub fn key_cache_refresh_threshold(&self) -> Duration {
        Duration::from_secs(self.key_cache_refresh_secs)
    }
}
