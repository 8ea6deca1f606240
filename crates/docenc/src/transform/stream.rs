//! Token-streaming strategy.
//!
//! Encrypt is a single forward pass: tokens are copied to the output unless
//! they open a configured top-level property, in which case only that value is
//! buffered, sealed, and emitted as a string. The trailer is written just
//! before the root object closes.
//!
//! Decrypt makes two passes because the trailer follows the values it
//! describes: the first pass only looks for `_ei`, the second rewrites.
//!
//! # Memory invariants
//!
//! - Peak memory is bounded by the largest single encrypted value plus the
//!   read buffer and `flush_threshold`, never by document size. Values that
//!   pass through are flushed while they are copied.
//! - A configured property may appear once; a repeat is a format error.
//! - The read buffer grows geometrically only when one token spans it.

use std::{collections::HashSet, io::SeekFrom};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use common::{
    protocol::{EncryptionProperties, TRAILER_PROPERTY},
    EncryptionError,
};

use super::{
    cipher_once, copy_through, legacy,
    trailer::{self, FieldCodec, TrailerBuilder},
    trailer_paths, CipherFormat, DecryptionContext, DocumentInput, DocumentOutput,
    DocumentTransformer, EncryptOutcome, SeekableInput, TransformContext,
};
use crate::{
    config::JsonProcessing,
    json::{copy_value, copy_value_flushing, JsonReader, Token, TokenKind, TokenWriter},
    options::{CompressionOptions, EncryptionPlan},
};

/// Strategy B. See the module docs.
#[derive(Debug, Default, Clone, Copy)]
pub struct StreamingTransformer;

fn new_reader<R: AsyncRead + Unpin>(ctx: &TransformContext<'_>, input: R) -> JsonReader<R> {
    JsonReader::new(input, ctx.pool, ctx.initial_buffer_size, ctx.cancel.clone())
}

fn new_writer(ctx: &TransformContext<'_>) -> TokenWriter {
    TokenWriter::new(ctx.pool.rent(ctx.initial_buffer_size.min(ctx.flush_threshold)))
}

async fn open_root<R: AsyncRead + Unpin>(reader: &mut JsonReader<R>) -> Result<Token, EncryptionError> {
    let first = reader.require_token().await?;
    if first.kind != TokenKind::StartObject {
        return Err(EncryptionError::format("document root must be a JSON object"));
    }
    Ok(first)
}

async fn flush_if_full(
    ctx: &TransformContext<'_>,
    writer: &mut TokenWriter,
    output: &mut DocumentOutput<'_>,
) -> Result<(), EncryptionError> {
    if writer.len() >= ctx.flush_threshold {
        writer.flush_to(output).await?;
    }
    Ok(())
}

/// First decrypt pass: find and parse the trailer, skipping everything else.
async fn find_trailer<R: AsyncRead + Unpin>(
    ctx: &TransformContext<'_>,
    input: R,
) -> Result<Option<EncryptionProperties>, EncryptionError> {
    let mut reader = new_reader(ctx, input);
    open_root(&mut reader).await?;
    let mut found = None;
    loop {
        let name = reader.require_token().await?;
        if name.kind == TokenKind::EndObject {
            break;
        }
        let is_trailer = reader.str(&name)? == TRAILER_PROPERTY;
        let first = reader.require_token().await?;
        if !is_trailer {
            reader.skip_value(first).await?;
            continue;
        }
        if found.is_some() {
            return Err(EncryptionError::Format(format!(
                "document carries more than one {TRAILER_PROPERTY} property"
            )));
        }
        let mut raw = TokenWriter::new(ctx.pool.rent_non_sensitive(256));
        copy_value(&mut reader, first, &mut raw).await?;
        let props: EncryptionProperties = serde_json::from_slice(raw.buffered())
            .map_err(|e| EncryptionError::Format(format!("invalid encryption trailer: {e}")))?;
        found = Some(props);
    }
    // Rejects trailing data after the root object.
    reader.next_token().await?;
    Ok(found)
}

/// Re-tokenize a decrypted value and copy it into `writer` in place of the ciphertext.
async fn splice_value(
    ctx: &TransformContext<'_>,
    path: &str,
    plaintext: &[u8],
    writer: &mut TokenWriter,
) -> Result<(), EncryptionError> {
    let mut value = JsonReader::new(plaintext, ctx.pool, plaintext.len().max(1), ctx.cancel.clone());
    let spliced = async {
        let first = value.require_token().await?;
        copy_value(&mut value, first, writer).await?;
        value.next_token().await.map(|_| ())
    }
    .await;
    spliced.map_err(|e| match e {
        EncryptionError::Format(msg) => {
            EncryptionError::Format(format!("decrypted value at {path} is not valid JSON: {msg}"))
        }
        other => other,
    })
}

#[async_trait]
impl DocumentTransformer for StreamingTransformer {
    fn strategy(&self) -> JsonProcessing {
        JsonProcessing::Streaming
    }

    async fn encrypt(
        &self,
        ctx: &TransformContext<'_>,
        plan: &EncryptionPlan,
        input: &mut DocumentInput<'_>,
        output: &mut DocumentOutput<'_>,
    ) -> Result<EncryptOutcome, EncryptionError> {
        if plan.algorithm.is_legacy() {
            return Err(EncryptionError::Configuration(format!(
                "algorithm {} is not supported by the streaming processor",
                plan.algorithm
            )));
        }

        let mut reader = new_reader(ctx, &mut *input);
        let mut writer = new_writer(ctx);
        let root = open_root(&mut reader).await?;
        writer.write_token(root.kind, reader.bytes(&root));

        let mut outcome = EncryptOutcome::default();
        let mut builder = TrailerBuilder::new(plan);
        let mut slot = None;
        let mut seen = HashSet::new();

        loop {
            let name = reader.require_token().await?;
            if name.kind == TokenKind::EndObject {
                break;
            }
            let matched = {
                let text = reader.str(&name)?;
                if text == TRAILER_PROPERTY {
                    return Err(EncryptionError::Format(format!(
                        "document already carries {TRAILER_PROPERTY}; refusing to encrypt twice"
                    )));
                }
                plan.path_for(&text).map(|p| p.pointer.clone())
            };
            if let Some(pointer) = &matched {
                if !seen.insert(pointer.clone()) {
                    return Err(EncryptionError::Format(format!(
                        "property {pointer} occurs more than once in the document"
                    )));
                }
            }
            writer.write_token(TokenKind::PropertyName, reader.bytes(&name));

            let first = reader.require_token().await?;
            match matched {
                None => {
                    copy_value_flushing(&mut reader, first, &mut writer, &mut *output, ctx.flush_threshold)
                        .await?
                }
                Some(pointer) if first.kind == TokenKind::Null => {
                    writer.write_token(first.kind, reader.bytes(&first));
                    outcome.null_paths.push(pointer);
                }
                Some(pointer) => {
                    let mut value = TokenWriter::new(ctx.pool.rent(ctx.initial_buffer_size));
                    copy_value(&mut reader, first, &mut value).await?;
                    let plaintext = value.into_inner();
                    let cipher = cipher_once(&mut slot, ctx, &plan.dek_id, plan.algorithm).await?;
                    let sealed = FieldCodec::new(&cipher, ctx.pool, plan.compression).seal(&pointer, &plaintext)?;
                    drop(plaintext);
                    writer.write_plain_string(&sealed.text);
                    builder.record(&pointer, sealed.compressed_from)?;
                }
            }
            flush_if_full(ctx, &mut writer, output).await?;
        }
        // Rejects trailing data after the root object.
        reader.next_token().await?;

        outcome.encrypted_paths = builder.encrypted_paths().to_vec();
        outcome.finish(plan);
        if let Some(props) = builder.build() {
            outcome.format_version = Some(props.format_version);
            writer.write_property_name(TRAILER_PROPERTY)?;
            writer.write_serialized(&props)?;
        }
        writer.write_token(TokenKind::EndObject, b"}");
        writer.flush_to(output).await?;
        output.flush().await?;

        debug!(
            encrypted = outcome.encrypted_paths.len(),
            skipped = outcome.skipped_paths.len(),
            read_buffer = reader.buffer_capacity(),
            "document encrypted (streaming)"
        );
        Ok(outcome)
    }

    async fn decrypt(
        &self,
        ctx: &TransformContext<'_>,
        input: &mut dyn SeekableInput,
        output: &mut DocumentOutput<'_>,
    ) -> Result<Option<DecryptionContext>, EncryptionError> {
        let start = input.stream_position().await?;
        let found = find_trailer(ctx, &mut *input).await?;
        input.seek(SeekFrom::Start(start)).await?;

        let Some(props) = found else {
            copy_through(input, output, ctx.pool, ctx.initial_buffer_size, ctx.cancel).await?;
            return Ok(None);
        };

        let (format, algorithm) = trailer::inspect(&props)?;
        let paths = trailer_paths(&props)?;
        let cipher = ctx
            .ciphers
            .cipher_for(&props.dek_id, algorithm, ctx.cancel)
            .await?;
        let legacy_fields = match format {
            CipherFormat::Legacy => Some(legacy::open_blob(&cipher, ctx.pool, &props)?),
            CipherFormat::PerPath => None,
        };
        let codec = FieldCodec::new(&cipher, ctx.pool, CompressionOptions::default());

        let mut reader = new_reader(ctx, &mut *input);
        let mut writer = new_writer(ctx);
        let root = open_root(&mut reader).await?;
        writer.write_token(root.kind, reader.bytes(&root));

        let mut decrypted = Vec::with_capacity(paths.len());
        loop {
            let name = reader.require_token().await?;
            if name.kind == TokenKind::EndObject {
                break;
            }
            let (is_trailer, target) = {
                let text = reader.str(&name)?;
                let target = match format {
                    CipherFormat::PerPath => paths.iter().find(|p| p.name == text),
                    CipherFormat::Legacy => None,
                };
                (text == TRAILER_PROPERTY, target)
            };
            if is_trailer {
                let first = reader.require_token().await?;
                reader.skip_value(first).await?;
                continue;
            }
            writer.write_token(TokenKind::PropertyName, reader.bytes(&name));

            let first = reader.require_token().await?;
            match target {
                None => {
                    copy_value_flushing(&mut reader, first, &mut writer, &mut *output, ctx.flush_threshold)
                        .await?
                }
                Some(path) => {
                    if first.kind != TokenKind::String {
                        return Err(EncryptionError::Format(format!(
                            "encrypted value at {} is not a string",
                            path.pointer
                        )));
                    }
                    let plaintext = {
                        let text = reader.str(&first)?;
                        codec.open(&path.pointer, text.as_bytes(), props.compressed_length(&path.pointer))?
                    };
                    splice_value(ctx, &path.pointer, &plaintext, &mut writer).await?;
                    decrypted.push(path.pointer.as_str());
                }
            }
            flush_if_full(ctx, &mut writer, output).await?;
        }
        reader.next_token().await?;

        if let Some(fields) = &legacy_fields {
            for (name, value) in fields {
                writer.write_property_name(name)?;
                writer.write_serialized(value)?;
            }
        }
        writer.write_token(TokenKind::EndObject, b"}");
        writer.flush_to(output).await?;
        output.flush().await?;

        let decrypted_paths: Vec<String> = match format {
            CipherFormat::Legacy => paths.iter().map(|p| p.pointer.clone()).collect(),
            // Trailer order, matching the materializing strategy.
            CipherFormat::PerPath => paths
                .iter()
                .filter(|p| decrypted.contains(&p.pointer.as_str()))
                .map(|p| p.pointer.clone())
                .collect(),
        };
        debug!(decrypted = decrypted_paths.len(), "document decrypted (streaming)");
        Ok(Some(DecryptionContext {
            dek_id: props.dek_id,
            algorithm: props.algorithm,
            format_version: props.format_version,
            decrypted_paths,
        }))
    }
}
