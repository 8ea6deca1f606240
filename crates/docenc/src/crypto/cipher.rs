//! AES-256-CBC + HMAC-SHA256 authenticated encryption of individual field values.
//!
//! **Composition:** encrypt-then-MAC. The tag covers the version byte, the IV
//! and the ciphertext, and is verified in constant time before a single
//! ciphertext byte is decrypted.
//!
//! # Envelope layout
//!
//! ```text
//! [version: 1][iv: 16][aes-256-cbc(pkcs7(plaintext)): 16*n][hmac-sha256: 32]
//! ```

use aes::Aes256;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::{CipherAlgorithm, EncryptionType};
use common::EncryptionError;

/// Byte length of the root key and of each derived key (256 bits).
pub const KEY_LEN: usize = 32;

/// Byte length of the CBC initialisation vector.
pub const IV_LEN: usize = 16;

/// AES block length.
pub const BLOCK_LEN: usize = 16;

/// Byte length of the HMAC-SHA256 tag.
pub const TAG_LEN: usize = 32;

/// Byte length of the version prefix.
pub const VERSION_LEN: usize = 1;

/// Version byte written by default.
pub const DEFAULT_CIPHER_VERSION: u8 = 1;

/// Smallest well-formed envelope: version, IV, one block, tag.
const MIN_ENVELOPE_LEN: usize = VERSION_LEN + IV_LEN + BLOCK_LEN + TAG_LEN;

type HmacSha256 = Hmac<Sha256>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Errors produced by the cipher layer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    /// Key material is not [`KEY_LEN`] bytes.
    #[error("invalid key length: expected {KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),

    /// The envelope cannot be split into its fixed-size fields.
    #[error("malformed cipher envelope: {0}")]
    MalformedEnvelope(String),

    /// The envelope was written by a different cipher version.
    #[error("cipher version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u8, found: u8 },

    /// Tag verification failed: tampered data or wrong key.
    #[error("authentication tag mismatch")]
    AuthenticationFailed,

    /// Caller-supplied output region is too small.
    #[error("output buffer too small: need {needed} bytes, have {available}")]
    OutputTooSmall { needed: usize, available: usize },
}

impl CipherError {
    /// Attach the path and algorithm the failure belongs to.
    pub fn at_path(self, path: &str, algorithm: &str) -> EncryptionError {
        match self {
            CipherError::AuthenticationFailed => EncryptionError::Authentication {
                path: path.to_owned(),
                algorithm: algorithm.to_owned(),
            },
            CipherError::InvalidKeyLength(_) => {
                EncryptionError::Configuration(format!("{self} (algorithm {algorithm})"))
            }
            other => EncryptionError::Format(format!("{other} (path {path}, algorithm {algorithm})")),
        }
    }
}

/// A 256-bit root key. Zeroed on drop and never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct RootKey([u8; KEY_LEN]);

impl RootKey {
    /// Copy key material out of `bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::InvalidKeyLength`] if `bytes` is not [`KEY_LEN`] long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CipherError> {
        let key: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CipherError::InvalidKeyLength(bytes.len()))?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl From<[u8; KEY_LEN]> for RootKey {
    fn from(value: [u8; KEY_LEN]) -> Self {
        Self(value)
    }
}

impl std::fmt::Debug for RootKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RootKey([REDACTED])")
    }
}

/// MAC, encryption and IV keys derived from one root key.
#[derive(Zeroize, ZeroizeOnDrop)]
struct DerivedKeySet {
    mac_key: [u8; KEY_LEN],
    enc_key: [u8; KEY_LEN],
    iv_key: [u8; KEY_LEN],
}

impl DerivedKeySet {
    fn derive(
        root: &RootKey,
        algorithm: CipherAlgorithm,
        encryption_type: EncryptionType,
    ) -> Result<Self, CipherError> {
        Ok(Self {
            mac_key: derive_key(root, "MAC", algorithm, encryption_type)?,
            enc_key: derive_key(root, "encryption", algorithm, encryption_type)?,
            iv_key: derive_key(root, "IV", algorithm, encryption_type)?,
        })
    }
}

/// HMAC-SHA256(root, label) where the label binds purpose, algorithm and encryption type.
fn derive_key(
    root: &RootKey,
    purpose: &str,
    algorithm: CipherAlgorithm,
    encryption_type: EncryptionType,
) -> Result<[u8; KEY_LEN], CipherError> {
    let label = format!(
        "docenc field {purpose} key with encryption algorithm:{} and encryption type:{} and key length:256",
        algorithm.id(),
        encryption_type.label(),
    );
    let mut mac = keyed_mac(root.as_bytes())?;
    mac.update(label.as_bytes());
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&mac.finalize().into_bytes());
    Ok(key)
}

fn keyed_mac(key: &[u8; KEY_LEN]) -> Result<HmacSha256, CipherError> {
    <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| CipherError::InvalidKeyLength(key.len()))
}

/// Authenticated cipher bound to one root key.
///
/// Derived keys are computed once in [`AeadCipher::new`], are read-only
/// afterwards, and are zeroed when the cipher is dropped. A cipher can be shared
/// across concurrent operations.
pub struct AeadCipher {
    keys: DerivedKeySet,
    algorithm: CipherAlgorithm,
    encryption_type: EncryptionType,
    version: u8,
}

impl std::fmt::Debug for AeadCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AeadCipher")
            .field("algorithm", &self.algorithm)
            .field("encryption_type", &self.encryption_type)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl AeadCipher {
    /// Derive the key set for `root` and build a cipher writing `version` envelopes.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::InvalidKeyLength`] if key derivation rejects the root key.
    pub fn new(
        root: &RootKey,
        algorithm: CipherAlgorithm,
        encryption_type: EncryptionType,
        version: u8,
    ) -> Result<Self, CipherError> {
        Ok(Self {
            keys: DerivedKeySet::derive(root, algorithm, encryption_type)?,
            algorithm,
            encryption_type,
            version,
        })
    }

    pub fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }

    pub fn encryption_type(&self) -> EncryptionType {
        self.encryption_type
    }

    /// Exact envelope size for a plaintext of `plaintext_len` bytes.
    pub fn sizeof_ciphertext(plaintext_len: usize) -> usize {
        let padded = (plaintext_len / BLOCK_LEN + 1) * BLOCK_LEN;
        VERSION_LEN + IV_LEN + padded + TAG_LEN
    }

    /// Upper bound on the plaintext recovered from a `ciphertext_len` envelope.
    ///
    /// Padding is only known after decryption, so this is the padded body length.
    pub fn sizeof_plaintext(ciphertext_len: usize) -> usize {
        ciphertext_len.saturating_sub(VERSION_LEN + IV_LEN + TAG_LEN)
    }

    /// Encrypt `plaintext` into a freshly allocated envelope.
    ///
    /// # Errors
    ///
    /// Only fails on internal sizing errors, which cannot happen for a buffer
    /// sized with [`AeadCipher::sizeof_ciphertext`].
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let mut out = vec![0u8; Self::sizeof_ciphertext(plaintext.len())];
        let written = self.encrypt_into(plaintext, &mut out, 0)?;
        out.truncate(written);
        Ok(out)
    }

    /// Encrypt `plaintext` into `out[offset..]`, returning the bytes written.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::OutputTooSmall`] if the region cannot hold
    /// [`AeadCipher::sizeof_ciphertext`] bytes.
    pub fn encrypt_into(
        &self,
        plaintext: &[u8],
        out: &mut [u8],
        offset: usize,
    ) -> Result<usize, CipherError> {
        let needed = Self::sizeof_ciphertext(plaintext.len());
        let available = out.len().saturating_sub(offset);
        if available < needed {
            return Err(CipherError::OutputTooSmall { needed, available });
        }
        let envelope = &mut out[offset..offset + needed];

        let iv = self.generate_iv(plaintext)?;
        envelope[0] = self.version;
        envelope[VERSION_LEN..VERSION_LEN + IV_LEN].copy_from_slice(&iv);

        let body_start = VERSION_LEN + IV_LEN;
        let body_end = needed - TAG_LEN;
        let body_len = Aes256CbcEnc::new_from_slices(&self.keys.enc_key, &iv)
            .map_err(|_| CipherError::InvalidKeyLength(self.keys.enc_key.len()))?
            .encrypt_padded_b2b_mut::<Pkcs7>(plaintext, &mut envelope[body_start..body_end])
            .map_err(|_| CipherError::OutputTooSmall {
                needed,
                available,
            })?
            .len();
        debug_assert_eq!(body_start + body_len, body_end);

        let mut mac = keyed_mac(&self.keys.mac_key)?;
        mac.update(&envelope[..body_end]);
        envelope[body_end..].copy_from_slice(&mac.finalize().into_bytes());
        Ok(needed)
    }

    /// Verify and decrypt an envelope into a freshly allocated buffer.
    ///
    /// # Errors
    ///
    /// [`CipherError::MalformedEnvelope`] if the envelope cannot be split,
    /// [`CipherError::VersionMismatch`] if the version byte differs,
    /// [`CipherError::AuthenticationFailed`] if the tag does not verify.
    pub fn decrypt(&self, envelope: &[u8]) -> Result<Vec<u8>, CipherError> {
        let mut out = vec![0u8; Self::sizeof_plaintext(envelope.len())];
        let written = self.decrypt_into(envelope, &mut out, 0)?;
        out.truncate(written);
        Ok(out)
    }

    /// Verify and decrypt an envelope into `out[offset..]`, returning the plaintext length.
    ///
    /// The region must hold [`AeadCipher::sizeof_plaintext`] bytes; only the
    /// returned prefix is meaningful.
    ///
    /// The version byte is checked before the tag, so an altered version
    /// surfaces as [`CipherError::VersionMismatch`] (a format error at the
    /// document level) rather than as an authentication failure.
    pub fn decrypt_into(
        &self,
        envelope: &[u8],
        out: &mut [u8],
        offset: usize,
    ) -> Result<usize, CipherError> {
        if envelope.len() < MIN_ENVELOPE_LEN {
            return Err(CipherError::MalformedEnvelope(format!(
                "{} bytes is shorter than the {MIN_ENVELOPE_LEN}-byte minimum",
                envelope.len()
            )));
        }
        let body_start = VERSION_LEN + IV_LEN;
        let body_end = envelope.len() - TAG_LEN;
        if (body_end - body_start) % BLOCK_LEN != 0 {
            return Err(CipherError::MalformedEnvelope(
                "ciphertext is not a whole number of blocks".into(),
            ));
        }
        if envelope[0] != self.version {
            return Err(CipherError::VersionMismatch {
                expected: self.version,
                found: envelope[0],
            });
        }

        let mut mac = keyed_mac(&self.keys.mac_key)?;
        mac.update(&envelope[..body_end]);
        mac.verify_slice(&envelope[body_end..])
            .map_err(|_| CipherError::AuthenticationFailed)?;

        let needed = body_end - body_start;
        let available = out.len().saturating_sub(offset);
        if available < needed {
            return Err(CipherError::OutputTooSmall { needed, available });
        }

        let iv = &envelope[VERSION_LEN..body_start];
        let plaintext_len = Aes256CbcDec::new_from_slices(&self.keys.enc_key, iv)
            .map_err(|_| CipherError::InvalidKeyLength(self.keys.enc_key.len()))?
            .decrypt_padded_b2b_mut::<Pkcs7>(
                &envelope[body_start..body_end],
                &mut out[offset..offset + needed],
            )
            // The tag verified, so bad padding means the writer was broken, not tampering.
            .map_err(|_| CipherError::MalformedEnvelope("invalid block padding".into()))?
            .len();
        Ok(plaintext_len)
    }

    fn generate_iv(&self, plaintext: &[u8]) -> Result<[u8; IV_LEN], CipherError> {
        let mut iv = [0u8; IV_LEN];
        match self.encryption_type {
            EncryptionType::Randomized => OsRng.fill_bytes(&mut iv),
            EncryptionType::Deterministic => {
                let mut mac = keyed_mac(&self.keys.iv_key)?;
                mac.update(plaintext);
                iv.copy_from_slice(&mac.finalize().into_bytes()[..IV_LEN]);
            }
        }
        Ok(iv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_root() -> RootKey {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        RootKey::from(key)
    }

    fn cipher(root: &RootKey, ty: EncryptionType) -> AeadCipher {
        AeadCipher::new(
            root,
            CipherAlgorithm::AeadAes256CbcHmacSha256,
            ty,
            DEFAULT_CIPHER_VERSION,
        )
        .unwrap()
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let c = cipher(&random_root(), EncryptionType::Randomized);
        let envelope = c.encrypt(b"123-45-6789").unwrap();
        assert_eq!(c.decrypt(&envelope).unwrap(), b"123-45-6789");
    }

    #[test]
    fn empty_plaintext_round_trips() {
        let c = cipher(&random_root(), EncryptionType::Randomized);
        let envelope = c.encrypt(b"").unwrap();
        assert_eq!(envelope.len(), MIN_ENVELOPE_LEN);
        assert!(c.decrypt(&envelope).unwrap().is_empty());
    }

    #[test]
    fn sizing_is_exact_for_ciphertext() {
        let c = cipher(&random_root(), EncryptionType::Randomized);
        for len in [0usize, 1, 15, 16, 17, 31, 32, 1000] {
            let pt = vec![0xA5u8; len];
            let envelope = c.encrypt(&pt).unwrap();
            assert_eq!(envelope.len(), AeadCipher::sizeof_ciphertext(len));
            assert!(AeadCipher::sizeof_plaintext(envelope.len()) >= len);
        }
    }

    #[test]
    fn deterministic_mode_is_repeatable() {
        let root = random_root();
        let c = cipher(&root, EncryptionType::Deterministic);
        assert_eq!(c.encrypt(b"same").unwrap(), c.encrypt(b"same").unwrap());
        assert_ne!(c.encrypt(b"same").unwrap(), c.encrypt(b"other").unwrap());
        // A second instance derives the same keys.
        let c2 = cipher(&root, EncryptionType::Deterministic);
        assert_eq!(c.encrypt(b"same").unwrap(), c2.encrypt(b"same").unwrap());
    }

    #[test]
    fn randomized_mode_varies_iv() {
        let c = cipher(&random_root(), EncryptionType::Randomized);
        assert_ne!(c.encrypt(b"same").unwrap(), c.encrypt(b"same").unwrap());
    }

    #[test]
    fn encryption_type_separates_keys() {
        let root = random_root();
        let det = cipher(&root, EncryptionType::Deterministic);
        let rnd = cipher(&root, EncryptionType::Randomized);
        let envelope = det.encrypt(b"value").unwrap();
        assert_eq!(rnd.decrypt(&envelope), Err(CipherError::AuthenticationFailed));
    }

    #[test]
    fn any_flipped_body_or_tag_byte_fails_authentication() {
        let c = cipher(&random_root(), EncryptionType::Randomized);
        let envelope = c.encrypt(b"tamper me please").unwrap();
        for i in VERSION_LEN..envelope.len() {
            let mut tampered = envelope.clone();
            tampered[i] ^= 0x01;
            assert_eq!(
                c.decrypt(&tampered),
                Err(CipherError::AuthenticationFailed),
                "byte {i}"
            );
        }
    }

    #[test]
    fn flipped_version_byte_is_a_version_mismatch() {
        let c = cipher(&random_root(), EncryptionType::Randomized);
        let mut envelope = c.encrypt(b"tamper me please").unwrap();
        envelope[0] ^= 0x01;
        assert_eq!(
            c.decrypt(&envelope),
            Err(CipherError::VersionMismatch {
                expected: DEFAULT_CIPHER_VERSION,
                found: DEFAULT_CIPHER_VERSION ^ 0x01,
            })
        );
        let err = c.decrypt(&envelope).unwrap_err().at_path("/a", "AEAD_AES_256_CBC_HMAC_SHA256");
        assert_eq!(err.kind(), common::ErrorKind::Format);
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let envelope = cipher(&random_root(), EncryptionType::Randomized)
            .encrypt(b"secret")
            .unwrap();
        let other = cipher(&random_root(), EncryptionType::Randomized);
        assert_eq!(other.decrypt(&envelope), Err(CipherError::AuthenticationFailed));
    }

    #[test]
    fn truncated_envelope_is_a_format_error() {
        let c = cipher(&random_root(), EncryptionType::Randomized);
        let envelope = c.encrypt(b"x").unwrap();
        assert!(matches!(
            c.decrypt(&envelope[..20]),
            Err(CipherError::MalformedEnvelope(_))
        ));
        assert!(matches!(
            c.decrypt(&envelope[..envelope.len() - 1]),
            Err(CipherError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn version_byte_is_checked() {
        let root = random_root();
        let v1 = cipher(&root, EncryptionType::Randomized);
        let v2 = AeadCipher::new(
            &root,
            CipherAlgorithm::AeadAes256CbcHmacSha256,
            EncryptionType::Randomized,
            2,
        )
        .unwrap();
        let envelope = v2.encrypt(b"x").unwrap();
        assert_eq!(envelope[0], 2);
        assert_eq!(
            v1.decrypt(&envelope),
            Err(CipherError::VersionMismatch { expected: 1, found: 2 })
        );
    }

    #[test]
    fn into_variants_honour_offset() {
        let c = cipher(&random_root(), EncryptionType::Randomized);
        let pt = b"offset plaintext";
        let mut out = vec![0u8; 8 + AeadCipher::sizeof_ciphertext(pt.len())];
        let n = c.encrypt_into(pt, &mut out, 8).unwrap();
        assert_eq!(n, out.len() - 8);
        assert!(out[..8].iter().all(|&b| b == 0));

        let mut plain = vec![0u8; 4 + AeadCipher::sizeof_plaintext(n)];
        let m = c.decrypt_into(&out[8..], &mut plain, 4).unwrap();
        assert_eq!(&plain[4..4 + m], pt);
    }

    #[test]
    fn into_variants_reject_small_output() {
        let c = cipher(&random_root(), EncryptionType::Randomized);
        let mut out = vec![0u8; 10];
        assert!(matches!(
            c.encrypt_into(b"abc", &mut out, 0),
            Err(CipherError::OutputTooSmall { .. })
        ));
    }

    #[test]
    fn invalid_root_key_length_rejected() {
        assert_eq!(
            RootKey::from_slice(&[0u8; 16]).unwrap_err(),
            CipherError::InvalidKeyLength(16)
        );
    }

    #[test]
    fn root_key_redacted_in_debug() {
        let key = RootKey::from([0x42u8; KEY_LEN]);
        assert!(format!("{key:?}").contains("REDACTED"));
    }

    #[test]
    fn authentication_error_maps_with_context() {
        let e = CipherError::AuthenticationFailed.at_path("/ssn", "AEAD_AES_256_CBC_HMAC_SHA256");
        assert_eq!(e.kind(), common::ErrorKind::Authentication);
        let e = CipherError::MalformedEnvelope("short".into()).at_path("/ssn", "x");
        assert_eq!(e.kind(), common::ErrorKind::Format);
    }
}
