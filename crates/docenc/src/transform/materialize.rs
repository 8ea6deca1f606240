//! Tree-based strategy: parse the whole document, rewrite, serialize.
//!
//! Simple and the only writer of the legacy single-blob format. Memory use is
//! proportional to document size.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use common::{
    protocol::{EncryptionProperties, TRAILER_PROPERTY},
    EncryptionError,
};

use super::{
    legacy, read_all,
    trailer::{self, FieldCodec, TrailerBuilder},
    trailer_paths, CipherFormat, DecryptionContext, DocumentInput, DocumentOutput,
    DocumentTransformer, EncryptOutcome, SeekableInput, TransformContext,
};
use crate::{
    config::JsonProcessing,
    options::EncryptionPlan,
    pool::{BufferPool, PooledBuffer},
};

/// Strategy A. See the module docs.
#[derive(Debug, Default, Clone, Copy)]
pub struct MaterializingTransformer;

fn parse_root(bytes: &[u8]) -> Result<Map<String, Value>, EncryptionError> {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(EncryptionError::format("document root must be a JSON object")),
        Err(e) => Err(EncryptionError::Format(format!("invalid JSON document: {e}"))),
    }
}

async fn write_root(
    ctx: &TransformContext<'_>,
    root: &Map<String, Value>,
    output: &mut DocumentOutput<'_>,
) -> Result<(), EncryptionError> {
    if ctx.cancel.is_cancelled() {
        return Err(EncryptionError::Cancelled);
    }
    let mut out = ctx.pool.rent(ctx.initial_buffer_size);
    serde_json::to_writer(&mut out, root)
        .map_err(|e| EncryptionError::Format(format!("cannot serialize document: {e}")))?;
    output.write_all(&out).await?;
    output.flush().await?;
    Ok(())
}

/// Serialize `value` into a sensitive pooled buffer.
fn serialize_value(pool: &BufferPool, value: &Value) -> Result<PooledBuffer, EncryptionError> {
    let mut buf = pool.rent(64);
    serde_json::to_writer(&mut buf, value)
        .map_err(|e| EncryptionError::Format(format!("cannot serialize value: {e}")))?;
    Ok(buf)
}

#[async_trait]
impl DocumentTransformer for MaterializingTransformer {
    fn strategy(&self) -> JsonProcessing {
        JsonProcessing::Materializing
    }

    async fn encrypt(
        &self,
        ctx: &TransformContext<'_>,
        plan: &EncryptionPlan,
        input: &mut DocumentInput<'_>,
        output: &mut DocumentOutput<'_>,
    ) -> Result<EncryptOutcome, EncryptionError> {
        let data = read_all(input, ctx.pool, ctx.initial_buffer_size, ctx.cancel).await?;
        let mut root = parse_root(&data)?;
        drop(data);

        if root.contains_key(TRAILER_PROPERTY) {
            return Err(EncryptionError::Format(format!(
                "document already carries {TRAILER_PROPERTY}; refusing to encrypt twice"
            )));
        }

        let mut outcome = EncryptOutcome::default();
        let mut builder = TrailerBuilder::new(plan);

        // Document order, so the trailer matches the streaming strategy.
        let matched: Vec<(String, String)> = root
            .iter()
            .filter_map(|(name, value)| {
                let path = plan.path_for(name)?;
                if value.is_null() {
                    outcome.null_paths.push(path.pointer.clone());
                    None
                } else {
                    Some((name.clone(), path.pointer.clone()))
                }
            })
            .collect();

        if !matched.is_empty() {
            let cipher = ctx
                .ciphers
                .cipher_for(&plan.dek_id, plan.algorithm, ctx.cancel)
                .await?;
            if plan.algorithm.is_legacy() {
                let mut fields = Map::new();
                for (name, pointer) in &matched {
                    if let Some(value) = root.shift_remove(name) {
                        fields.insert(name.clone(), value);
                        builder.record(pointer, None)?;
                    }
                }
                builder.set_legacy_blob(legacy::seal_blob(&cipher, ctx.pool, &fields)?);
            } else {
                let codec = FieldCodec::new(&cipher, ctx.pool, plan.compression);
                for (name, pointer) in &matched {
                    let Some(value) = root.get_mut(name) else {
                        continue;
                    };
                    let plaintext = serialize_value(ctx.pool, value)?;
                    let sealed = codec.seal(pointer, &plaintext)?;
                    drop(plaintext);
                    let text = std::str::from_utf8(&sealed.text)
                        .map_err(|_| EncryptionError::format("base64 output is not ASCII"))?;
                    *value = Value::String(text.to_owned());
                    builder.record(pointer, sealed.compressed_from)?;
                }
            }
        }

        outcome.encrypted_paths = builder.encrypted_paths().to_vec();
        outcome.finish(plan);
        if let Some(props) = builder.build() {
            outcome.format_version = Some(props.format_version);
            let trailer = serde_json::to_value(&props)
                .map_err(|e| EncryptionError::Format(format!("cannot serialize trailer: {e}")))?;
            root.insert(TRAILER_PROPERTY.to_owned(), trailer);
        }

        write_root(ctx, &root, output).await?;
        debug!(
            encrypted = outcome.encrypted_paths.len(),
            skipped = outcome.skipped_paths.len(),
            "document encrypted (materializing)"
        );
        Ok(outcome)
    }

    async fn decrypt(
        &self,
        ctx: &TransformContext<'_>,
        input: &mut dyn SeekableInput,
        output: &mut DocumentOutput<'_>,
    ) -> Result<Option<DecryptionContext>, EncryptionError> {
        let data = read_all(input, ctx.pool, ctx.initial_buffer_size, ctx.cancel).await?;
        let mut root = parse_root(&data)?;

        let Some(raw) = root.shift_remove(TRAILER_PROPERTY) else {
            output.write_all(&data).await?;
            output.flush().await?;
            return Ok(None);
        };
        drop(data);

        let props: EncryptionProperties = serde_json::from_value(raw)
            .map_err(|e| EncryptionError::Format(format!("invalid encryption trailer: {e}")))?;
        let (format, algorithm) = trailer::inspect(&props)?;
        let paths = trailer_paths(&props)?;
        let cipher = ctx
            .ciphers
            .cipher_for(&props.dek_id, algorithm, ctx.cancel)
            .await?;

        let mut decrypted_paths = Vec::with_capacity(paths.len());
        match format {
            CipherFormat::Legacy => {
                for (name, value) in legacy::open_blob(&cipher, ctx.pool, &props)? {
                    root.insert(name, value);
                }
                decrypted_paths.extend(paths.into_iter().map(|p| p.pointer));
            }
            CipherFormat::PerPath => {
                let codec = FieldCodec::new(&cipher, ctx.pool, Default::default());
                for path in paths {
                    let Some(value) = root.get_mut(&path.name) else {
                        continue;
                    };
                    let Value::String(text) = value else {
                        return Err(EncryptionError::Format(format!(
                            "encrypted value at {} is not a string",
                            path.pointer
                        )));
                    };
                    let plaintext =
                        codec.open(&path.pointer, text.as_bytes(), props.compressed_length(&path.pointer))?;
                    *value = serde_json::from_slice(&plaintext).map_err(|e| {
                        EncryptionError::Format(format!(
                            "decrypted value at {} is not valid JSON: {e}",
                            path.pointer
                        ))
                    })?;
                    decrypted_paths.push(path.pointer);
                }
            }
        }

        write_root(ctx, &root, output).await?;
        debug!(decrypted = decrypted_paths.len(), "document decrypted (materializing)");
        Ok(Some(DecryptionContext {
            dek_id: props.dek_id,
            algorithm: props.algorithm,
            format_version: props.format_version,
            decrypted_paths,
        }))
    }
}
