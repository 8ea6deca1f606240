//! Wire types embedded in encrypted documents and exchanged with the database.
//!
//! An encrypted document carries one extra top-level property, [`TRAILER_PROPERTY`],
//! whose value is an [`EncryptionProperties`] object.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Name of the top-level property holding the encryption trailer.
pub const TRAILER_PROPERTY: &str = "_ei";

/// Name of the array property holding documents in a multi-document feed.
pub const FEED_DOCUMENTS_PROPERTY: &str = "Documents";

/// Name of the document-count property in a multi-document feed.
pub const FEED_COUNT_PROPERTY: &str = "_count";

/// Legacy format: all encrypted values live in one blob in `encryptedData`.
pub const FORMAT_VERSION_LEGACY: i32 = 2;

/// Per-path format: each encrypted value is replaced in place by its ciphertext.
pub const FORMAT_VERSION_PER_PATH: i32 = 3;

/// Per-path format where some values were compressed before encryption.
pub const FORMAT_VERSION_PER_PATH_COMPRESSED: i32 = 4;

// ---------------------------------------------------------------------------
// Compression
// ---------------------------------------------------------------------------

/// Compression applied to a serialized value before encryption.
///
/// Serialized as its integer wire code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum CompressionAlgorithm {
    #[default]
    None,
    Lz4,
}

impl From<CompressionAlgorithm> for i32 {
    fn from(value: CompressionAlgorithm) -> Self {
        match value {
            CompressionAlgorithm::None => 0,
            CompressionAlgorithm::Lz4 => 1,
        }
    }
}

impl TryFrom<i32> for CompressionAlgorithm {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CompressionAlgorithm::None),
            1 => Ok(CompressionAlgorithm::Lz4),
            other => Err(format!("unknown compression algorithm code {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Trailer
// ---------------------------------------------------------------------------

/// The `_ei` trailer appended to every document with at least one encrypted path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionProperties {
    /// One of the `FORMAT_VERSION_*` constants.
    pub format_version: i32,
    /// Cipher algorithm identifier.
    pub algorithm: String,
    /// Identifier of the data encryption key.
    pub dek_id: String,
    /// Paths actually encrypted, in encounter order.
    pub encrypted_paths: Vec<String>,
    /// Present only when compression was configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_algorithm: Option<CompressionAlgorithm>,
    /// Path → pre-compression byte length, for compressed paths only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressed_encrypted_paths: Option<BTreeMap<String, i32>>,
    /// Base64 blob for the legacy format; empty otherwise.
    #[serde(default)]
    pub encrypted_data: String,
}

impl EncryptionProperties {
    /// Returns the pre-compression length of `path`, if it was compressed.
    pub fn compressed_length(&self, path: &str) -> Option<i32> {
        self.compressed_encrypted_paths
            .as_ref()
            .and_then(|m| m.get(path).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn trailer_wire_shape() {
        let props = EncryptionProperties {
            format_version: FORMAT_VERSION_PER_PATH,
            algorithm: "AEAD_AES_256_CBC_HMAC_SHA256".into(),
            dek_id: "dek-1".into(),
            encrypted_paths: vec!["/ssn".into(), "/card".into()],
            compression_algorithm: None,
            compressed_encrypted_paths: None,
            encrypted_data: String::new(),
        };
        let value = serde_json::to_value(&props).unwrap();
        assert_eq!(
            value,
            json!({
                "formatVersion": 3,
                "algorithm": "AEAD_AES_256_CBC_HMAC_SHA256",
                "dekId": "dek-1",
                "encryptedPaths": ["/ssn", "/card"],
                "encryptedData": ""
            })
        );
    }

    #[test]
    fn compressed_paths_parse() {
        let props: EncryptionProperties = serde_json::from_value(json!({
            "formatVersion": 4,
            "algorithm": "AEAD_AES_256_CBC_HMAC_SHA256",
            "dekId": "dek-1",
            "encryptedPaths": ["/blob"],
            "compressionAlgorithm": 1,
            "compressedEncryptedPaths": {"/blob": 4096}
        }))
        .unwrap();
        assert_eq!(props.compression_algorithm, Some(CompressionAlgorithm::Lz4));
        assert_eq!(props.compressed_length("/blob"), Some(4096));
        assert_eq!(props.compressed_length("/other"), None);
        assert!(props.encrypted_data.is_empty());
    }

    #[test]
    fn unknown_compression_code_rejected() {
        let res: Result<EncryptionProperties, _> = serde_json::from_value(json!({
            "formatVersion": 4,
            "algorithm": "a",
            "dekId": "d",
            "encryptedPaths": [],
            "compressionAlgorithm": 9
        }));
        assert!(res.is_err());
    }
}
