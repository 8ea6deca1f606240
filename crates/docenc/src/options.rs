//! Per-operation encryption options and their validation into an [`EncryptionPlan`].

use std::collections::HashSet;

use common::{
    protocol::{CompressionAlgorithm, TRAILER_PROPERTY},
    EncryptionError,
};

use crate::{config::JsonProcessing, crypto::CipherAlgorithm};

/// Optional compression of serialized values before encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionOptions {
    pub algorithm: CompressionAlgorithm,
    /// Values whose serialized form is shorter than this are left uncompressed.
    pub min_size: usize,
}

impl Default for CompressionOptions {
    fn default() -> Self {
        Self {
            algorithm: CompressionAlgorithm::None,
            min_size: 128,
        }
    }
}

/// What to encrypt and how.
#[derive(Debug, Clone)]
pub struct EncryptionOptions {
    pub dek_id: String,
    pub algorithm: CipherAlgorithm,
    /// Top-level JSON pointers such as `/ssn`.
    pub paths_to_encrypt: Vec<String>,
    pub compression: CompressionOptions,
    /// Explicit strategy. `None` uses the engine default.
    pub json_processing: Option<JsonProcessing>,
}

impl EncryptionOptions {
    pub fn new<I, S>(dek_id: impl Into<String>, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            dek_id: dek_id.into(),
            algorithm: CipherAlgorithm::AeadAes256CbcHmacSha256,
            paths_to_encrypt: paths.into_iter().map(Into::into).collect(),
            compression: CompressionOptions::default(),
            json_processing: None,
        }
    }

    pub fn with_algorithm(mut self, algorithm: CipherAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_compression(mut self, algorithm: CompressionAlgorithm, min_size: usize) -> Self {
        self.compression = CompressionOptions { algorithm, min_size };
        self
    }

    pub fn with_json_processing(mut self, processing: JsonProcessing) -> Self {
        self.json_processing = Some(processing);
        self
    }
}

/// Options for decryption.
#[derive(Debug, Clone, Default)]
pub struct DecryptionOptions {
    /// Explicit strategy. `None` uses the engine default.
    pub json_processing: Option<JsonProcessing>,
}

/// A configured top-level field pointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    /// The pointer as configured, e.g. `/a~1b`. Written to the trailer.
    pub pointer: String,
    /// The decoded property name, e.g. `a/b`.
    pub name: String,
}

impl FieldPath {
    /// Parse a top-level JSON pointer.
    ///
    /// # Errors
    ///
    /// [`EncryptionError::Configuration`] for empty, nested, or badly escaped pointers.
    pub fn parse(pointer: &str) -> Result<Self, EncryptionError> {
        let Some(raw) = pointer.strip_prefix('/') else {
            return Err(EncryptionError::configuration(format!(
                "path {pointer:?} must start with '/'"
            )));
        };
        if raw.is_empty() {
            return Err(EncryptionError::configuration("path must name a property"));
        }
        if raw.contains('/') {
            return Err(EncryptionError::configuration(format!(
                "path {pointer:?} is nested; only top-level properties can be encrypted"
            )));
        }
        Ok(Self {
            pointer: pointer.to_owned(),
            name: unescape_pointer_token(raw)
                .ok_or_else(|| EncryptionError::configuration(format!("path {pointer:?} has an invalid '~' escape")))?,
        })
    }
}

fn unescape_pointer_token(raw: &str) -> Option<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '~' {
            match chars.next() {
                Some('0') => out.push('~'),
                Some('1') => out.push('/'),
                _ => return None,
            }
        } else {
            out.push(c);
        }
    }
    Some(out)
}

/// Validated, ready-to-run encryption request.
#[derive(Debug, Clone)]
pub struct EncryptionPlan {
    pub dek_id: String,
    pub algorithm: CipherAlgorithm,
    pub paths: Vec<FieldPath>,
    pub compression: CompressionOptions,
}

impl EncryptionPlan {
    /// Validate `options` and pick the strategy. Performs no I/O.
    ///
    /// # Errors
    ///
    /// [`EncryptionError::Configuration`] for duplicate or malformed paths, an
    /// empty dek id, or legacy output with an explicit streaming request.
    pub fn build(
        options: &EncryptionOptions,
        default_processing: JsonProcessing,
    ) -> Result<(Self, JsonProcessing), EncryptionError> {
        if options.dek_id.trim().is_empty() {
            return Err(EncryptionError::configuration("dek id must not be empty"));
        }

        let mut seen = HashSet::new();
        let mut paths = Vec::with_capacity(options.paths_to_encrypt.len());
        for pointer in &options.paths_to_encrypt {
            let path = FieldPath::parse(pointer)?;
            if path.name == TRAILER_PROPERTY {
                return Err(EncryptionError::configuration(format!(
                    "path {pointer:?} is reserved for encryption metadata"
                )));
            }
            if !seen.insert(path.name.clone()) {
                return Err(EncryptionError::configuration(format!(
                    "duplicate path {pointer:?} in paths to encrypt"
                )));
            }
            paths.push(path);
        }

        let processing = match (options.algorithm.is_legacy(), options.json_processing) {
            (true, Some(JsonProcessing::Streaming)) => {
                return Err(EncryptionError::configuration(format!(
                    "algorithm {} is not supported by the streaming processor",
                    options.algorithm
                )))
            }
            (true, _) => JsonProcessing::Materializing,
            (false, explicit) => explicit.unwrap_or(default_processing),
        };

        let compression = if options.algorithm.is_legacy() {
            CompressionOptions::default()
        } else {
            options.compression
        };

        Ok((
            Self {
                dek_id: options.dek_id.clone(),
                algorithm: options.algorithm,
                paths,
                compression,
            },
            processing,
        ))
    }

    /// The configured path for a top-level property name, if any.
    pub fn path_for(&self, name: &str) -> Option<&FieldPath> {
        self.paths.iter().find(|p| p.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ErrorKind;

    #[test]
    fn parses_top_level_pointers() {
        let p = FieldPath::parse("/ssn").unwrap();
        assert_eq!(p.name, "ssn");
        let p = FieldPath::parse("/a~1b~0c").unwrap();
        assert_eq!(p.name, "a/b~c");
        assert_eq!(p.pointer, "/a~1b~0c");
    }

    #[test]
    fn rejects_bad_pointers() {
        for bad in ["ssn", "/", "/a/b", "/a~2"] {
            assert_eq!(
                FieldPath::parse(bad).unwrap_err().kind(),
                ErrorKind::Configuration,
                "{bad}"
            );
        }
    }

    #[test]
    fn duplicate_paths_are_configuration_errors() {
        let opts = EncryptionOptions::new("dek", ["/a", "/a"]);
        let err = EncryptionPlan::build(&opts, JsonProcessing::Streaming).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn trailer_path_is_reserved() {
        let opts = EncryptionOptions::new("dek", ["/_ei"]);
        assert!(EncryptionPlan::build(&opts, JsonProcessing::Streaming).is_err());
    }

    #[test]
    fn legacy_with_explicit_streaming_is_rejected() {
        let opts = EncryptionOptions::new("dek", ["/a"])
            .with_algorithm(CipherAlgorithm::LegacyAes256CbcHmacSha256)
            .with_json_processing(JsonProcessing::Streaming);
        let err = EncryptionPlan::build(&opts, JsonProcessing::Streaming).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn legacy_without_explicit_strategy_materializes() {
        let opts = EncryptionOptions::new("dek", ["/a"])
            .with_algorithm(CipherAlgorithm::LegacyAes256CbcHmacSha256)
            .with_compression(CompressionAlgorithm::Lz4, 1);
        let (plan, processing) = EncryptionPlan::build(&opts, JsonProcessing::Streaming).unwrap();
        assert_eq!(processing, JsonProcessing::Materializing);
        assert_eq!(plan.compression.algorithm, CompressionAlgorithm::None);
    }

    #[test]
    fn explicit_strategy_overrides_default() {
        let opts = EncryptionOptions::new("dek", ["/a"]).with_json_processing(JsonProcessing::Materializing);
        let (_, processing) = EncryptionPlan::build(&opts, JsonProcessing::Streaming).unwrap();
        assert_eq!(processing, JsonProcessing::Materializing);
        let opts = EncryptionOptions::new("dek", ["/a"]);
        let (plan, processing) = EncryptionPlan::build(&opts, JsonProcessing::Streaming).unwrap();
        assert_eq!(processing, JsonProcessing::Streaming);
        assert_eq!(plan.path_for("a").unwrap().pointer, "/a");
        assert!(plan.path_for("b").is_none());
    }
}
