//! Path-selective document transformation.
//!
//! Two interchangeable strategies implement [`DocumentTransformer`]:
//!
//! - [`MaterializingTransformer`] parses the document into a tree.
//! - [`StreamingTransformer`] rewrites the token stream in one pass.
//!
//! Both share the trailer building and per-field sealing in [`trailer`], so the
//! metadata they produce is identical for the same input.
//!
//! # Module invariants
//!
//! - Every intermediate byte buffer comes from the [`BufferPool`] and is
//!   released on every exit path, including cancellation.
//! - The trailer is written if and only if at least one path was encrypted.

pub mod legacy;
pub mod materialize;
pub mod stream;
pub mod trailer;

pub use materialize::MaterializingTransformer;
pub use stream::StreamingTransformer;
pub use trailer::CipherFormat;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use common::{protocol::EncryptionProperties, EncryptionError};

use crate::{
    config::JsonProcessing,
    crypto::{AeadCipher, CipherAlgorithm},
    options::{EncryptionPlan, FieldPath},
    pool::{BufferPool, PooledBuffer},
};

/// Input a decrypt can rewind: the trailer may come after the values it describes.
pub trait SeekableInput: AsyncRead + AsyncSeek + Unpin + Send {}

impl<T: AsyncRead + AsyncSeek + Unpin + Send + ?Sized> SeekableInput for T {}

/// Byte source for encryption.
pub type DocumentInput<'a> = dyn AsyncRead + Unpin + Send + 'a;

/// Byte sink for either direction.
pub type DocumentOutput<'a> = dyn AsyncWrite + Unpin + Send + 'a;

/// Supplies a cipher for a data encryption key.
///
/// Decrypt learns the dek id from the trailer, so transformers resolve keys
/// through this seam rather than receiving a cipher up front.
#[async_trait]
pub trait CipherSource: Send + Sync {
    async fn cipher_for(
        &self,
        dek_id: &str,
        algorithm: CipherAlgorithm,
        cancel: &CancellationToken,
    ) -> Result<Arc<AeadCipher>, EncryptionError>;
}

/// Shared resources for one transform operation.
pub struct TransformContext<'a> {
    pub pool: &'a BufferPool,
    pub ciphers: &'a dyn CipherSource,
    pub cancel: &'a CancellationToken,
    pub initial_buffer_size: usize,
    pub flush_threshold: usize,
}

/// What an encrypt did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncryptOutcome {
    /// Paths replaced by ciphertext, in document order.
    pub encrypted_paths: Vec<String>,
    /// Configured paths absent from the document.
    pub skipped_paths: Vec<String>,
    /// Configured paths present with a `null` value, left as is.
    pub null_paths: Vec<String>,
    /// Trailer format version, if a trailer was written.
    pub format_version: Option<i32>,
}

impl EncryptOutcome {
    /// Fill `skipped_paths` with configured paths that were never encountered.
    pub(crate) fn finish(&mut self, plan: &EncryptionPlan) {
        self.skipped_paths = plan
            .paths
            .iter()
            .filter(|p| !self.encrypted_paths.contains(&p.pointer) && !self.null_paths.contains(&p.pointer))
            .map(|p| p.pointer.clone())
            .collect();
    }
}

/// What a decrypt recovered. Absent when the document had no trailer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptionContext {
    pub dek_id: String,
    pub algorithm: String,
    pub format_version: i32,
    pub decrypted_paths: Vec<String>,
}

/// One strategy for rewriting documents.
#[async_trait]
pub trait DocumentTransformer: Send + Sync {
    fn strategy(&self) -> JsonProcessing;

    /// Encrypt the planned paths of the document read from `input`.
    async fn encrypt(
        &self,
        ctx: &TransformContext<'_>,
        plan: &EncryptionPlan,
        input: &mut DocumentInput<'_>,
        output: &mut DocumentOutput<'_>,
    ) -> Result<EncryptOutcome, EncryptionError>;

    /// Reverse a previous encrypt. Documents without a trailer are copied unchanged.
    async fn decrypt(
        &self,
        ctx: &TransformContext<'_>,
        input: &mut dyn SeekableInput,
        output: &mut DocumentOutput<'_>,
    ) -> Result<Option<DecryptionContext>, EncryptionError>;
}

static MATERIALIZING: MaterializingTransformer = MaterializingTransformer;
static STREAMING: StreamingTransformer = StreamingTransformer;

/// The transformer implementing `strategy`.
pub fn transformer_for(strategy: JsonProcessing) -> &'static dyn DocumentTransformer {
    match strategy {
        JsonProcessing::Materializing => &MATERIALIZING,
        JsonProcessing::Streaming => &STREAMING,
    }
}

/// Read all of `input` into a pooled buffer, checking for cancellation between reads.
pub(crate) async fn read_all<R>(
    input: &mut R,
    pool: &BufferPool,
    chunk: usize,
    cancel: &CancellationToken,
) -> Result<PooledBuffer, EncryptionError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = pool.rent(chunk);
    loop {
        if cancel.is_cancelled() {
            return Err(EncryptionError::Cancelled);
        }
        buf.reserve(chunk.max(1));
        let spare = buf.spare_mut();
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EncryptionError::Cancelled),
            read = input.read(spare) => read?,
        };
        if n == 0 {
            return Ok(buf);
        }
        buf.advance(n);
    }
}

/// Resolve the cipher on first use and reuse it afterwards.
pub(crate) async fn cipher_once(
    slot: &mut Option<Arc<AeadCipher>>,
    ctx: &TransformContext<'_>,
    dek_id: &str,
    algorithm: CipherAlgorithm,
) -> Result<Arc<AeadCipher>, EncryptionError> {
    if let Some(cipher) = slot {
        return Ok(Arc::clone(cipher));
    }
    let cipher = ctx.ciphers.cipher_for(dek_id, algorithm, ctx.cancel).await?;
    *slot = Some(Arc::clone(&cipher));
    Ok(cipher)
}

/// The trailer's encrypted paths as parsed field paths.
pub(crate) fn trailer_paths(props: &EncryptionProperties) -> Result<Vec<FieldPath>, EncryptionError> {
    props
        .encrypted_paths
        .iter()
        .map(|p| {
            FieldPath::parse(p).map_err(|_| {
                EncryptionError::Format(format!("encryption trailer lists invalid path {p:?}"))
            })
        })
        .collect()
}

/// Copy `input` to `output` unchanged, checking for cancellation between reads.
pub(crate) async fn copy_through<R>(
    input: &mut R,
    output: &mut DocumentOutput<'_>,
    pool: &BufferPool,
    chunk: usize,
    cancel: &CancellationToken,
) -> Result<(), EncryptionError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = pool.rent(chunk.max(1));
    loop {
        if cancel.is_cancelled() {
            return Err(EncryptionError::Cancelled);
        }
        buf.clear();
        let spare = buf.spare_mut();
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EncryptionError::Cancelled),
            read = input.read(spare) => read?,
        };
        if n == 0 {
            output.flush().await?;
            return Ok(());
        }
        buf.advance(n);
        output.write_all(&buf).await?;
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::crypto::{EncryptionType, RootKey, DEFAULT_CIPHER_VERSION};

    /// Serves every dek id from one root key.
    pub(crate) struct FixedCiphers(pub RootKey);

    #[async_trait]
    impl CipherSource for FixedCiphers {
        async fn cipher_for(
            &self,
            _dek_id: &str,
            algorithm: CipherAlgorithm,
            _cancel: &CancellationToken,
        ) -> Result<Arc<AeadCipher>, EncryptionError> {
            AeadCipher::new(&self.0, algorithm, EncryptionType::Randomized, DEFAULT_CIPHER_VERSION)
                .map(Arc::new)
                .map_err(|e| e.at_path("", algorithm.id()))
        }
    }

    pub(crate) fn context<'a>(
        pool: &'a BufferPool,
        ciphers: &'a FixedCiphers,
        cancel: &'a CancellationToken,
        initial_buffer_size: usize,
    ) -> TransformContext<'a> {
        TransformContext {
            pool,
            ciphers,
            cancel,
            initial_buffer_size,
            flush_threshold: 64,
        }
    }

    pub(crate) async fn encrypt(
        strategy: JsonProcessing,
        ctx: &TransformContext<'_>,
        plan: &EncryptionPlan,
        doc: &[u8],
    ) -> Result<(Vec<u8>, EncryptOutcome), EncryptionError> {
        let mut input = doc;
        let mut output = Vec::new();
        let outcome = transformer_for(strategy)
            .encrypt(ctx, plan, &mut input, &mut output)
            .await?;
        Ok((output, outcome))
    }

    pub(crate) async fn decrypt(
        strategy: JsonProcessing,
        ctx: &TransformContext<'_>,
        doc: &[u8],
    ) -> Result<(Vec<u8>, Option<DecryptionContext>), EncryptionError> {
        let mut input = std::io::Cursor::new(doc.to_vec());
        let mut output = Vec::new();
        let context = transformer_for(strategy)
            .decrypt(ctx, &mut input, &mut output)
            .await?;
        Ok((output, context))
    }
}
