//! Splits a multi-document feed into one buffer per document.
//!
//! A feed is a root object with a [`FEED_DOCUMENTS_PROPERTY`] array; sibling
//! properties such as `_count` are skipped. Documents are yielded lazily, in
//! order, each as a compact, independently parseable byte buffer.

use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use common::{protocol::FEED_DOCUMENTS_PROPERTY, EncryptionError};

use crate::{
    json::{copy_value, JsonReader, TokenKind, TokenWriter},
    pool::{BufferPool, PooledBuffer},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    InDocuments,
    Done,
}

/// Lazy, forward-only iterator over the documents of a feed.
pub struct FeedSplitter<R> {
    reader: JsonReader<R>,
    pool: BufferPool,
    state: State,
    yielded: usize,
}

impl<R: AsyncRead + Unpin> FeedSplitter<R> {
    pub fn new(input: R, pool: &BufferPool, initial_buffer_size: usize, cancel: CancellationToken) -> Self {
        Self {
            reader: JsonReader::new(input, pool, initial_buffer_size, cancel),
            pool: pool.clone(),
            state: State::Start,
            yielded: 0,
        }
    }

    /// Documents yielded so far.
    pub fn yielded(&self) -> usize {
        self.yielded
    }

    /// The next document, or `None` once the array is exhausted.
    ///
    /// # Errors
    ///
    /// [`EncryptionError::Format`] if the root is not an object, the
    /// `Documents` property is missing or not an array, or an element is not
    /// an object. [`EncryptionError::Cancelled`] if cancelled between reads.
    pub async fn next_document(&mut self) -> Result<Option<PooledBuffer>, EncryptionError> {
        if self.state == State::Start {
            self.seek_documents().await?;
        }
        if self.state == State::Done {
            return Ok(None);
        }

        let first = self.reader.require_token().await?;
        match first.kind {
            TokenKind::EndArray => {
                self.finish().await?;
                Ok(None)
            }
            TokenKind::StartObject => {
                let mut writer = TokenWriter::new(self.pool.rent(256));
                copy_value(&mut self.reader, first, &mut writer).await?;
                self.yielded += 1;
                trace!(index = self.yielded - 1, len = writer.len(), "feed document split");
                Ok(Some(writer.into_inner()))
            }
            _ => Err(EncryptionError::Format(format!(
                "element {} of {FEED_DOCUMENTS_PROPERTY} is not a JSON object",
                self.yielded
            ))),
        }
    }

    async fn seek_documents(&mut self) -> Result<(), EncryptionError> {
        let root = self.reader.require_token().await?;
        match root.kind {
            TokenKind::StartObject => {}
            TokenKind::StartArray => {
                return Err(EncryptionError::Format(format!(
                    "feed root is a bare array; expected an enclosing object with a {FEED_DOCUMENTS_PROPERTY:?} array"
                )))
            }
            _ => {
                return Err(EncryptionError::Format(format!(
                    "feed root must be an enclosing object with a {FEED_DOCUMENTS_PROPERTY:?} array"
                )))
            }
        }
        loop {
            let name = self.reader.require_token().await?;
            if name.kind == TokenKind::EndObject {
                return Err(EncryptionError::Format(format!(
                    "feed has no {FEED_DOCUMENTS_PROPERTY:?} array"
                )));
            }
            let is_documents = self.reader.str(&name)? == FEED_DOCUMENTS_PROPERTY;
            let value = self.reader.require_token().await?;
            if !is_documents {
                self.reader.skip_value(value).await?;
                continue;
            }
            if value.kind != TokenKind::StartArray {
                return Err(EncryptionError::Format(format!(
                    "feed property {FEED_DOCUMENTS_PROPERTY:?} is not an array"
                )));
            }
            self.state = State::InDocuments;
            return Ok(());
        }
    }

    /// Skip the root's remaining siblings and check nothing follows it.
    async fn finish(&mut self) -> Result<(), EncryptionError> {
        loop {
            let name = self.reader.require_token().await?;
            if name.kind == TokenKind::EndObject {
                break;
            }
            let value = self.reader.require_token().await?;
            self.reader.skip_value(value).await?;
        }
        self.reader.next_token().await?;
        self.state = State::Done;
        Ok(())
    }
}
