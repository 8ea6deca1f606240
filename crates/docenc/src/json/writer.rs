//! Compact token writer backed by a pooled buffer.

use tokio::io::{AsyncWrite, AsyncWriteExt};

use common::EncryptionError;

use super::reader::TokenKind;
use crate::pool::PooledBuffer;

/// Writes JSON tokens without whitespace, inserting `,` and `:` as needed.
///
/// The caller is responsible for emitting a well-formed token sequence; the
/// writer only tracks whether the next value needs a leading comma.
pub struct TokenWriter {
    out: PooledBuffer,
    need_comma: bool,
    after_name: bool,
}

impl TokenWriter {
    pub fn new(out: PooledBuffer) -> Self {
        Self {
            out,
            need_comma: false,
            after_name: false,
        }
    }

    /// Bytes written and not yet flushed.
    pub fn buffered(&self) -> &[u8] {
        &self.out
    }

    pub fn len(&self) -> usize {
        self.out.len()
    }

    pub fn is_empty(&self) -> bool {
        self.out.is_empty()
    }

    /// Emit one token given its raw bytes as read.
    pub fn write_token(&mut self, kind: TokenKind, raw: &[u8]) {
        match kind {
            TokenKind::StartObject | TokenKind::StartArray => {
                self.before_value();
                self.out.extend_from_slice(raw);
                self.need_comma = false;
            }
            TokenKind::EndObject | TokenKind::EndArray => {
                self.out.extend_from_slice(raw);
                self.need_comma = true;
            }
            TokenKind::PropertyName => {
                if self.need_comma {
                    self.out.push(b',');
                }
                self.out.extend_from_slice(raw);
                self.out.push(b':');
                self.after_name = true;
            }
            _ => self.write_raw_value(raw),
        }
    }

    /// Emit a property name, escaping it.
    pub fn write_property_name(&mut self, name: &str) -> Result<(), EncryptionError> {
        if self.need_comma {
            self.out.push(b',');
        }
        serde_json::to_writer(&mut self.out, name)
            .map_err(|e| EncryptionError::Format(format!("cannot write property name: {e}")))?;
        self.out.push(b':');
        self.after_name = true;
        Ok(())
    }

    /// Emit a complete, already valid JSON value verbatim.
    pub fn write_raw_value(&mut self, raw: &[u8]) {
        self.before_value();
        self.out.extend_from_slice(raw);
        self.need_comma = true;
    }

    /// Emit a string value whose bytes need no escaping (base64 text).
    pub fn write_plain_string(&mut self, text: &[u8]) {
        self.before_value();
        self.out.push(b'"');
        self.out.extend_from_slice(text);
        self.out.push(b'"');
        self.need_comma = true;
    }

    /// Emit any serializable value.
    pub fn write_serialized<T: serde::Serialize>(&mut self, value: &T) -> Result<(), EncryptionError> {
        self.before_value();
        serde_json::to_writer(&mut self.out, value)
            .map_err(|e| EncryptionError::Format(format!("cannot serialize value: {e}")))?;
        self.need_comma = true;
        Ok(())
    }

    fn before_value(&mut self) {
        if self.after_name {
            self.after_name = false;
        } else if self.need_comma {
            self.out.push(b',');
        }
    }

    /// Write everything buffered to `sink` and reset the buffer.
    pub async fn flush_to<W>(&mut self, sink: &mut W) -> Result<(), EncryptionError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        if !self.out.is_empty() {
            sink.write_all(&self.out).await?;
            self.out.clear();
        }
        Ok(())
    }

    /// Hand back the underlying buffer.
    pub fn into_inner(self) -> PooledBuffer {
        self.out
    }
}
