//! Error taxonomy shared by every layer of the document encryption engine.

use thiserror::Error;

/// Coarse classification of an [`EncryptionError`].
///
/// Callers branch on this rather than on individual variants:
/// - [`ErrorKind::Configuration`] → fix the input and retry
/// - [`ErrorKind::Format`] / [`ErrorKind::Authentication`] → the document is unusable
/// - [`ErrorKind::KeyResolution`] → retry policy belongs to the key resolver
/// - [`ErrorKind::Cancelled`] → not a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Format,
    Authentication,
    KeyResolution,
    Cancelled,
    Io,
}

/// Top-level error returned by encrypt/decrypt operations.
///
/// Messages name the offending path and algorithm where relevant. They never
/// include plaintext, ciphertext, or key bytes.
#[derive(Debug, Error)]
pub enum EncryptionError {
    /// Invalid options: duplicate or malformed paths, unsupported
    /// algorithm/strategy combination. Raised before any I/O.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The input document, envelope or trailer is malformed.
    #[error("format error: {0}")]
    Format(String),

    /// An envelope failed tag verification (tampered data or wrong key).
    #[error("authentication failed for path {path} (algorithm {algorithm})")]
    Authentication { path: String, algorithm: String },

    /// The key resolver returned no key or failed.
    #[error("key resolution failed for {dek_id}: {reason}")]
    KeyResolution { dek_id: String, reason: String },

    /// The operation was cancelled between reads.
    #[error("operation cancelled")]
    Cancelled,

    /// The underlying transport failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl EncryptionError {
    /// Returns the [`ErrorKind`] of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EncryptionError::Configuration(_) => ErrorKind::Configuration,
            EncryptionError::Format(_) => ErrorKind::Format,
            EncryptionError::Authentication { .. } => ErrorKind::Authentication,
            EncryptionError::KeyResolution { .. } => ErrorKind::KeyResolution,
            EncryptionError::Cancelled => ErrorKind::Cancelled,
            EncryptionError::Io(_) => ErrorKind::Io,
        }
    }

    /// Returns `true` if the document can never be processed as given.
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Format | ErrorKind::Authentication)
    }

    /// Shorthand for a [`EncryptionError::Format`] error.
    pub fn format(msg: impl Into<String>) -> Self {
        EncryptionError::Format(msg.into())
    }

    /// Shorthand for a [`EncryptionError::Configuration`] error.
    pub fn configuration(msg: impl Into<String>) -> Self {
        EncryptionError::Configuration(msg.into())
    }
}

/// Convenience alias used across the workspace.
pub type Result<T, E = EncryptionError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds() {
        assert_eq!(
            EncryptionError::configuration("x").kind(),
            ErrorKind::Configuration
        );
        assert_eq!(EncryptionError::format("x").kind(), ErrorKind::Format);
        assert_eq!(EncryptionError::Cancelled.kind(), ErrorKind::Cancelled);
        let auth = EncryptionError::Authentication {
            path: "/ssn".into(),
            algorithm: "AEAD_AES_256_CBC_HMAC_SHA256".into(),
        };
        assert_eq!(auth.kind(), ErrorKind::Authentication);
        assert!(auth.is_terminal());
        assert!(!EncryptionError::Cancelled.is_terminal());
    }

    #[test]
    fn display_includes_path_and_algorithm() {
        let e = EncryptionError::Authentication {
            path: "/ssn".into(),
            algorithm: "AEAD_AES_256_CBC_HMAC_SHA256".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("/ssn"));
        assert!(msg.contains("AEAD_AES_256_CBC_HMAC_SHA256"));
    }

    #[test]
    fn io_converts() {
        let e: EncryptionError = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert_eq!(e.kind(), ErrorKind::Io);
    }
}
