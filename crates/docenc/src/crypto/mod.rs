//! AES-256-CBC + HMAC-SHA256 field encryption primitives.
//!
//! This module is intentionally free of JSON and I/O dependencies. It provides
//! the envelope encrypt/decrypt operations used by the transform layer.

pub mod cipher;

pub use cipher::{AeadCipher, CipherError, RootKey, DEFAULT_CIPHER_VERSION, KEY_LEN};

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Whether IVs are random per call or derived from the plaintext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionType {
    Randomized,
    /// Same plaintext + key always yields the same envelope.
    Deterministic,
}

impl EncryptionType {
    pub fn label(&self) -> &'static str {
        match self {
            EncryptionType::Randomized => "randomized",
            EncryptionType::Deterministic => "deterministic",
        }
    }
}

/// Cipher algorithm identifiers written into the trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherAlgorithm {
    /// Per-path envelopes.
    AeadAes256CbcHmacSha256,
    /// Legacy single-blob format. Decryptable by every strategy, writable only
    /// by the materializing strategy.
    LegacyAes256CbcHmacSha256,
}

impl CipherAlgorithm {
    pub fn id(&self) -> &'static str {
        match self {
            CipherAlgorithm::AeadAes256CbcHmacSha256 => "AEAD_AES_256_CBC_HMAC_SHA256",
            CipherAlgorithm::LegacyAes256CbcHmacSha256 => "AEAes256CbcHmacSha256Randomized",
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, CipherAlgorithm::LegacyAes256CbcHmacSha256)
    }
}

impl fmt::Display for CipherAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for CipherAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            CipherAlgorithm::AeadAes256CbcHmacSha256,
            CipherAlgorithm::LegacyAes256CbcHmacSha256,
        ]
        .into_iter()
        .find(|a| a.id() == s)
        .ok_or_else(|| format!("unsupported cipher algorithm: {s}"))
    }
}
