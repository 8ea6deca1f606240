//! `docenc`: client-side field-level encryption for JSON documents.
//!
//! Configured top-level properties are replaced by authenticated ciphertext
//! and a `_ei` trailer is appended describing how to reverse the operation.
//!
//! Layering, leaf first:
//! 1. [`pool`]: striped, zero-on-release byte buffers.
//! 2. [`crypto`]: AES-256-CBC + HMAC-SHA256 envelopes.
//! 3. [`json`]: pull tokenizer and compact token writer over async I/O.
//! 4. [`transform`]: materializing and streaming strategies behind one trait.
//! 5. [`feed`]: splits a multi-document response into documents.
//! 6. [`keys`]: key resolution with a TTL cache and distributed backing.
//!
//! [`DocumentEncryptor`] ties them together.

pub mod config;
pub mod crypto;
pub mod encryptor;
pub mod feed;
pub mod json;
pub mod keys;
pub mod options;
pub mod pool;
pub mod telemetry;
pub mod transform;

pub use common::{protocol::CompressionAlgorithm, EncryptionError, ErrorKind};
pub use config::{EngineConfig, JsonProcessing};
pub use crypto::{CipherAlgorithm, EncryptionType, RootKey};
pub use encryptor::DocumentEncryptor;
pub use feed::FeedSplitter;
pub use keys::{CachingKeyResolver, KeyResolver, StaticKeyResolver};
pub use options::{CompressionOptions, DecryptionOptions, EncryptionOptions};
pub use pool::BufferPool;
pub use transform::{DecryptionContext, EncryptOutcome};
