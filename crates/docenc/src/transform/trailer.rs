//! Trailer construction and per-field sealing shared by both strategies.
//!
//! A sealed field is `base64(envelope(lz4?(serialized value)))`. Every
//! intermediate stage lives in a pooled buffer; stages that hold plaintext are
//! rented as sensitive and cleared on release.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::debug;

use common::{
    protocol::{
        CompressionAlgorithm, EncryptionProperties, FORMAT_VERSION_LEGACY,
        FORMAT_VERSION_PER_PATH, FORMAT_VERSION_PER_PATH_COMPRESSED,
    },
    EncryptionError,
};

use crate::{
    crypto::{AeadCipher, CipherAlgorithm},
    options::{CompressionOptions, EncryptionPlan},
    pool::{BufferPool, PooledBuffer},
};

/// Largest pre-compression length accepted from a trailer (256 MiB).
const MAX_DECOMPRESSED_LEN: usize = 256 * 1024 * 1024;

/// How encrypted values are laid out in a document, selected by the trailer's
/// format version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherFormat {
    /// All encrypted values moved into one blob in `encryptedData`.
    Legacy,
    /// Each encrypted value replaced in place by its own envelope.
    PerPath,
}

impl CipherFormat {
    /// # Errors
    ///
    /// [`EncryptionError::Format`] for an unknown version.
    pub fn from_version(version: i32) -> Result<Self, EncryptionError> {
        match version {
            FORMAT_VERSION_LEGACY => Ok(CipherFormat::Legacy),
            FORMAT_VERSION_PER_PATH | FORMAT_VERSION_PER_PATH_COMPRESSED => Ok(CipherFormat::PerPath),
            other => Err(EncryptionError::Format(format!(
                "unsupported encryption format version {other}"
            ))),
        }
    }

    /// Check that `algorithm` can have produced a document in this format.
    pub fn check_algorithm(&self, algorithm: CipherAlgorithm) -> Result<(), EncryptionError> {
        match (self, algorithm.is_legacy()) {
            (CipherFormat::Legacy, true) | (CipherFormat::PerPath, false) => Ok(()),
            _ => Err(EncryptionError::Format(format!(
                "algorithm {algorithm} does not match the trailer's format version"
            ))),
        }
    }
}

/// Parse the trailer's algorithm and format and check they agree.
pub(crate) fn inspect(props: &EncryptionProperties) -> Result<(CipherFormat, CipherAlgorithm), EncryptionError> {
    let format = CipherFormat::from_version(props.format_version)?;
    let algorithm: CipherAlgorithm = props.algorithm.parse().map_err(EncryptionError::Format)?;
    format.check_algorithm(algorithm)?;
    if props.dek_id.is_empty() {
        return Err(EncryptionError::format("encryption trailer has an empty dekId"));
    }
    Ok((format, algorithm))
}

/// Accumulates what was encrypted, in encounter order.
#[derive(Debug)]
pub struct TrailerBuilder {
    dek_id: String,
    algorithm: CipherAlgorithm,
    compression: CompressionAlgorithm,
    encrypted_paths: Vec<String>,
    compressed: BTreeMap<String, i32>,
    legacy_blob: Option<String>,
}

impl TrailerBuilder {
    pub fn new(plan: &EncryptionPlan) -> Self {
        Self {
            dek_id: plan.dek_id.clone(),
            algorithm: plan.algorithm,
            compression: plan.compression.algorithm,
            encrypted_paths: Vec::with_capacity(plan.paths.len()),
            compressed: BTreeMap::new(),
            legacy_blob: None,
        }
    }

    /// Record that `path` was encrypted, and its pre-compression length if compressed.
    ///
    /// # Errors
    ///
    /// [`EncryptionError::Format`] if `path` was already recorded, or if the
    /// pre-compression length does not fit the trailer.
    pub fn record(&mut self, path: &str, compressed_from: Option<usize>) -> Result<(), EncryptionError> {
        if self.encrypted_paths.iter().any(|p| p == path) {
            return Err(EncryptionError::Format(format!(
                "property {path} occurs more than once in the document"
            )));
        }
        if let Some(len) = compressed_from {
            let len = i32::try_from(len).map_err(|_| {
                EncryptionError::Format(format!("value at {path} is too large to compress"))
            })?;
            self.compressed.insert(path.to_owned(), len);
        }
        self.encrypted_paths.push(path.to_owned());
        Ok(())
    }

    pub fn set_legacy_blob(&mut self, blob: String) {
        self.legacy_blob = Some(blob);
    }

    pub fn encrypted_paths(&self) -> &[String] {
        &self.encrypted_paths
    }

    /// The trailer, or `None` if nothing was encrypted.
    pub fn build(self) -> Option<EncryptionProperties> {
        if self.encrypted_paths.is_empty() {
            return None;
        }
        let compressed = self.compression != CompressionAlgorithm::None;
        let format_version = if self.algorithm.is_legacy() {
            FORMAT_VERSION_LEGACY
        } else if compressed {
            FORMAT_VERSION_PER_PATH_COMPRESSED
        } else {
            FORMAT_VERSION_PER_PATH
        };
        Some(EncryptionProperties {
            format_version,
            algorithm: self.algorithm.id().to_owned(),
            dek_id: self.dek_id,
            encrypted_paths: self.encrypted_paths,
            compression_algorithm: compressed.then_some(self.compression),
            compressed_encrypted_paths: (!self.compressed.is_empty()).then_some(self.compressed),
            encrypted_data: self.legacy_blob.unwrap_or_default(),
        })
    }
}

/// A sealed field value.
pub struct Sealed {
    /// Base64 text, safe to emit inside a JSON string without escaping.
    pub text: PooledBuffer,
    /// Serialized length before compression, if the value was compressed.
    pub compressed_from: Option<usize>,
}

/// Seals and opens individual field values with one cipher.
pub struct FieldCodec<'a> {
    cipher: &'a AeadCipher,
    pool: &'a BufferPool,
    compression: CompressionOptions,
}

impl<'a> FieldCodec<'a> {
    pub fn new(cipher: &'a AeadCipher, pool: &'a BufferPool, compression: CompressionOptions) -> Self {
        Self {
            cipher,
            pool,
            compression,
        }
    }

    /// Compress (when configured and large enough), encrypt and base64-encode
    /// the serialized value at `path`.
    pub fn seal(&self, path: &str, plaintext: &[u8]) -> Result<Sealed, EncryptionError> {
        let compressed = self.compress(path, plaintext)?;
        let payload = compressed.as_deref().unwrap_or(plaintext);
        let compressed_from = compressed.as_ref().map(|_| plaintext.len());

        let mut envelope = self.pool.rent_non_sensitive(AeadCipher::sizeof_ciphertext(payload.len()));
        let written = self
            .cipher
            .encrypt_into(payload, envelope.spare_mut(), 0)
            .map_err(|e| e.at_path(path, self.cipher.algorithm().id()))?;
        envelope.advance(written);
        drop(compressed);

        Ok(Sealed {
            text: encode(self.pool, &envelope)?,
            compressed_from,
        })
    }

    /// Reverse [`FieldCodec::seal`]. The result holds the serialized value.
    ///
    /// # Errors
    ///
    /// [`EncryptionError::Authentication`] if the envelope does not verify,
    /// [`EncryptionError::Format`] for bad base64 or a bad compressed length.
    pub fn open(
        &self,
        path: &str,
        encoded: &[u8],
        compressed_len: Option<i32>,
    ) -> Result<PooledBuffer, EncryptionError> {
        let envelope = decode(self.pool, path, encoded)?;
        let mut plaintext = self.pool.rent(AeadCipher::sizeof_plaintext(envelope.len()));
        let written = self
            .cipher
            .decrypt_into(&envelope, plaintext.spare_mut(), 0)
            .map_err(|e| e.at_path(path, self.cipher.algorithm().id()))?;
        plaintext.advance(written);

        match compressed_len {
            None => Ok(plaintext),
            Some(len) => self.decompress(path, &plaintext, len),
        }
    }

    fn compress(&self, path: &str, plaintext: &[u8]) -> Result<Option<PooledBuffer>, EncryptionError> {
        if self.compression.algorithm == CompressionAlgorithm::None
            || plaintext.len() < self.compression.min_size
        {
            return Ok(None);
        }
        let mut out = self
            .pool
            .rent(lz4_flex::block::get_maximum_output_size(plaintext.len()));
        let written = lz4_flex::block::compress_into(plaintext, out.spare_mut())
            .map_err(|e| EncryptionError::Format(format!("cannot compress value at {path}: {e}")))?;
        out.advance(written);
        debug!(path, from = plaintext.len(), to = written, "value compressed");
        Ok(Some(out))
    }

    fn decompress(&self, path: &str, compressed: &[u8], len: i32) -> Result<PooledBuffer, EncryptionError> {
        let len = usize::try_from(len)
            .ok()
            .filter(|l| *l <= MAX_DECOMPRESSED_LEN)
            .ok_or_else(|| {
                EncryptionError::Format(format!("invalid compressed length {len} for {path}"))
            })?;
        let mut out = self.pool.rent(len);
        let written = lz4_flex::block::decompress_into(compressed, &mut out.spare_mut()[..len])
            .map_err(|e| EncryptionError::Format(format!("cannot decompress value at {path}: {e}")))?;
        if written != len {
            return Err(EncryptionError::Format(format!(
                "decompressed {written} bytes at {path}, trailer recorded {len}"
            )));
        }
        out.advance(written);
        Ok(out)
    }
}

/// Base64-encode into a non-sensitive pooled buffer.
pub(crate) fn encode(pool: &BufferPool, bytes: &[u8]) -> Result<PooledBuffer, EncryptionError> {
    let needed = base64::encoded_len(bytes.len(), true)
        .ok_or_else(|| EncryptionError::format("ciphertext too large to encode"))?;
    let mut text = pool.rent_non_sensitive(needed);
    let written = STANDARD
        .encode_slice(bytes, text.spare_mut())
        .map_err(|e| EncryptionError::Format(format!("cannot encode ciphertext: {e}")))?;
    text.advance(written);
    Ok(text)
}

/// Base64-decode into a non-sensitive pooled buffer.
pub(crate) fn decode(pool: &BufferPool, path: &str, text: &[u8]) -> Result<PooledBuffer, EncryptionError> {
    let mut out = pool.rent_non_sensitive(base64::decoded_len_estimate(text.len()));
    let written = STANDARD
        .decode_slice(text, out.spare_mut())
        .map_err(|e| EncryptionError::Format(format!("ciphertext at {path} is not valid base64: {e}")))?;
    out.advance(written);
    Ok(out)
}
