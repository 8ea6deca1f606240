//! Legacy single-blob format.
//!
//! Encrypted properties are removed from the document, collected into one
//! object `{name: value, ...}`, and that object is sealed as a single envelope
//! stored in the trailer's `encryptedData`. Decrypt puts the properties back
//! at the end of the root object, in blob order.

use serde_json::{Map, Value};

use common::{protocol::EncryptionProperties, EncryptionError};

use super::trailer::{decode, encode};
use crate::{crypto::AeadCipher, options::FieldPath, pool::BufferPool};

/// Diagnostic path reported for failures inside the blob.
const BLOB_PATH: &str = "/_ei/encryptedData";

/// Seal `fields` into the base64 blob written to `encryptedData`.
pub(crate) fn seal_blob(
    cipher: &AeadCipher,
    pool: &BufferPool,
    fields: &Map<String, Value>,
) -> Result<String, EncryptionError> {
    let mut plaintext = pool.rent(256);
    serde_json::to_writer(&mut plaintext, fields)
        .map_err(|e| EncryptionError::Format(format!("cannot serialize legacy blob: {e}")))?;

    let mut envelope = pool.rent_non_sensitive(AeadCipher::sizeof_ciphertext(plaintext.len()));
    let written = cipher
        .encrypt_into(&plaintext, envelope.spare_mut(), 0)
        .map_err(|e| e.at_path(BLOB_PATH, cipher.algorithm().id()))?;
    envelope.advance(written);
    drop(plaintext);

    let text = encode(pool, &envelope)?;
    String::from_utf8(text.to_vec())
        .map_err(|_| EncryptionError::format("base64 output is not ASCII"))
}

/// Open the blob of a legacy trailer and return its properties in order.
///
/// Every blob property must be listed in `encryptedPaths`.
pub(crate) fn open_blob(
    cipher: &AeadCipher,
    pool: &BufferPool,
    props: &EncryptionProperties,
) -> Result<Map<String, Value>, EncryptionError> {
    if props.encrypted_data.is_empty() {
        return Err(EncryptionError::format(
            "legacy trailer has no encryptedData",
        ));
    }
    let envelope = decode(pool, BLOB_PATH, props.encrypted_data.as_bytes())?;
    let mut plaintext = pool.rent(AeadCipher::sizeof_plaintext(envelope.len()));
    let written = cipher
        .decrypt_into(&envelope, plaintext.spare_mut(), 0)
        .map_err(|e| e.at_path(BLOB_PATH, cipher.algorithm().id()))?;
    plaintext.advance(written);

    let fields: Map<String, Value> = serde_json::from_slice(&plaintext)
        .map_err(|e| EncryptionError::Format(format!("legacy blob is not a JSON object: {e}")))?;
    for name in fields.keys() {
        let listed = props
            .encrypted_paths
            .iter()
            .any(|p| FieldPath::parse(p).is_ok_and(|f| f.name == *name));
        if !listed {
            return Err(EncryptionError::Format(format!(
                "legacy blob property {name:?} is not listed in encryptedPaths"
            )));
        }
    }
    Ok(fields)
}
