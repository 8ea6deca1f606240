//! [`DocumentEncryptor`]: the engine entry point.
//!
//! Wires a [`KeyResolver`], the shared [`BufferPool`] and an [`EngineConfig`]
//! to the transform strategies. Options are validated before any byte is read.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use common::{
    protocol::{FEED_COUNT_PROPERTY, FEED_DOCUMENTS_PROPERTY},
    EncryptionError,
};

use crate::{
    config::EngineConfig,
    crypto::{AeadCipher, CipherAlgorithm},
    feed::FeedSplitter,
    keys::KeyResolver,
    options::{DecryptionOptions, EncryptionOptions, EncryptionPlan},
    pool::BufferPool,
    transform::{transformer_for, CipherSource, DecryptionContext, EncryptOutcome, TransformContext},
};

/// Encrypts and decrypts configured top-level fields of JSON documents.
///
/// Cheap to share behind an `Arc`; every operation owns its own buffers.
pub struct DocumentEncryptor {
    resolver: Arc<dyn KeyResolver>,
    pool: BufferPool,
    config: EngineConfig,
}

impl std::fmt::Debug for DocumentEncryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentEncryptor")
            .field("pool", &self.pool)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DocumentEncryptor {
    /// Build an engine on the process-wide buffer pool.
    ///
    /// # Errors
    ///
    /// [`EncryptionError::Configuration`] if `config` fails validation.
    pub fn new(resolver: Arc<dyn KeyResolver>, config: EngineConfig) -> Result<Self, EncryptionError> {
        Self::with_pool(resolver, config, BufferPool::shared())
    }

    /// Build an engine on a dedicated pool.
    ///
    /// # Errors
    ///
    /// [`EncryptionError::Configuration`] if `config` fails validation.
    pub fn with_pool(
        resolver: Arc<dyn KeyResolver>,
        config: EngineConfig,
        pool: BufferPool,
    ) -> Result<Self, EncryptionError> {
        config.validate()?;
        Ok(Self {
            resolver,
            pool,
            config,
        })
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn context<'a>(&'a self, cancel: &'a CancellationToken) -> TransformContext<'a> {
        TransformContext {
            pool: &self.pool,
            ciphers: self,
            cancel,
            initial_buffer_size: self.config.initial_buffer_size,
            flush_threshold: self.config.flush_threshold,
        }
    }

    /// Encrypt the configured paths of the document in `input`, writing the
    /// result with its trailer to `output`.
    ///
    /// # Errors
    ///
    /// [`EncryptionError::Configuration`] for invalid options, raised before
    /// `input` is read. [`EncryptionError::Format`] for malformed input or a
    /// document that is already encrypted.
    #[instrument(skip_all, fields(dek_id = %options.dek_id, algorithm = %options.algorithm))]
    pub async fn encrypt<R, W>(
        &self,
        input: &mut R,
        output: &mut W,
        options: &EncryptionOptions,
        cancel: &CancellationToken,
    ) -> Result<EncryptOutcome, EncryptionError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let (plan, processing) = EncryptionPlan::build(options, self.config.json_processing)?;
        let transformer = transformer_for(processing);
        let outcome = transformer
            .encrypt(&self.context(cancel), &plan, input, output)
            .await?;
        debug!(
            strategy = ?processing,
            encrypted = outcome.encrypted_paths.len(),
            skipped = outcome.skipped_paths.len(),
            nulls = outcome.null_paths.len(),
            format_version = outcome.format_version,
            "document encrypted"
        );
        Ok(outcome)
    }

    /// Reverse [`encrypt`](Self::encrypt). A document without a trailer is
    /// copied unchanged and `None` is returned.
    ///
    /// # Errors
    ///
    /// [`EncryptionError::Authentication`] if any value fails verification.
    /// [`EncryptionError::Format`] for malformed input or trailer.
    #[instrument(skip_all)]
    pub async fn decrypt<R, W>(
        &self,
        input: &mut R,
        output: &mut W,
        options: &DecryptionOptions,
        cancel: &CancellationToken,
    ) -> Result<Option<DecryptionContext>, EncryptionError>
    where
        R: AsyncRead + AsyncSeek + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let processing = options.json_processing.unwrap_or(self.config.json_processing);
        let context = transformer_for(processing)
            .decrypt(&self.context(cancel), input, output)
            .await?;
        match &context {
            Some(c) => debug!(
                strategy = ?processing,
                dek_id = %c.dek_id,
                format_version = c.format_version,
                decrypted = c.decrypted_paths.len(),
                "document decrypted"
            ),
            None => debug!(strategy = ?processing, "no encryption trailer; passed through"),
        }
        Ok(context)
    }

    /// [`encrypt`](Self::encrypt) over in-memory bytes.
    pub async fn encrypt_bytes(
        &self,
        document: &[u8],
        options: &EncryptionOptions,
        cancel: &CancellationToken,
    ) -> Result<(Vec<u8>, EncryptOutcome), EncryptionError> {
        let mut input = document;
        let mut output = Vec::with_capacity(document.len());
        let outcome = self.encrypt(&mut input, &mut output, options, cancel).await?;
        Ok((output, outcome))
    }

    /// [`decrypt`](Self::decrypt) over in-memory bytes.
    pub async fn decrypt_bytes(
        &self,
        document: &[u8],
        options: &DecryptionOptions,
        cancel: &CancellationToken,
    ) -> Result<(Vec<u8>, Option<DecryptionContext>), EncryptionError> {
        let mut input = std::io::Cursor::new(document);
        let mut output = Vec::with_capacity(document.len());
        let context = self.decrypt(&mut input, &mut output, options, cancel).await?;
        Ok((output, context))
    }

    /// Decrypt every document of a feed.
    ///
    /// Writes `{"Documents":[...],"_count":N}` with the decrypted documents in
    /// input order. Other feed properties are dropped. Returns one decryption
    /// context per document.
    ///
    /// # Errors
    ///
    /// Fails on the first document that fails; output written so far is
    /// incomplete and must be discarded.
    #[instrument(skip_all)]
    pub async fn decrypt_feed<R, W>(
        &self,
        input: R,
        output: &mut W,
        options: &DecryptionOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<Option<DecryptionContext>>, EncryptionError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let processing = options.json_processing.unwrap_or(self.config.json_processing);
        let transformer = transformer_for(processing);
        let ctx = self.context(cancel);
        let mut splitter = FeedSplitter::new(
            input,
            &self.pool,
            self.config.initial_buffer_size,
            cancel.clone(),
        );

        output
            .write_all(format!("{{\"{FEED_DOCUMENTS_PROPERTY}\":[").as_bytes())
            .await?;
        let mut contexts = Vec::new();
        while let Some(document) = splitter.next_document().await? {
            if !contexts.is_empty() {
                output.write_all(b",").await?;
            }
            let mut cursor = std::io::Cursor::new(&document[..]);
            contexts.push(transformer.decrypt(&ctx, &mut cursor, &mut *output).await?);
        }
        output
            .write_all(format!("],\"{FEED_COUNT_PROPERTY}\":{}}}", contexts.len()).as_bytes())
            .await?;
        output.flush().await?;

        info!(
            documents = contexts.len(),
            encrypted = contexts.iter().filter(|c| c.is_some()).count(),
            "feed decrypted"
        );
        Ok(contexts)
    }
}

#[async_trait]
impl CipherSource for DocumentEncryptor {
    async fn cipher_for(
        &self,
        dek_id: &str,
        algorithm: CipherAlgorithm,
        cancel: &CancellationToken,
    ) -> Result<Arc<AeadCipher>, EncryptionError> {
        let resolved = self.resolver.resolve(dek_id, cancel).await?;
        let root = resolved.root_key(dek_id)?;
        let cipher = AeadCipher::new(
            root,
            algorithm,
            resolved.encryption_type,
            self.config.cipher_version,
        )
        .map_err(|e| e.at_path("", algorithm.id()))?;
        debug!(
            dek_id,
            algorithm = %algorithm,
            encryption_type = resolved.encryption_type.label(),
            "cipher ready"
        );
        Ok(Arc::new(cipher))
    }
}
