//! Streaming JSON primitives: a pull tokenizer and a compact token writer.
//!
//! Only what the transform engine and the feed splitter need. Values are
//! copied token by token, never materialized as a tree.

pub mod reader;
pub mod writer;

pub use reader::{decode_string, JsonReader, Token, TokenKind};
pub use writer::TokenWriter;

use tokio::io::{AsyncRead, AsyncWrite};

use common::EncryptionError;

/// Copy the value that `first` starts from `reader` into `writer`.
pub async fn copy_value<R>(
    reader: &mut JsonReader<R>,
    first: Token,
    writer: &mut TokenWriter,
) -> Result<(), EncryptionError>
where
    R: AsyncRead + Unpin,
{
    writer.write_token(first.kind, reader.bytes(&first));
    if !first.kind.is_container_start() {
        return Ok(());
    }
    let target = reader.depth() - 1;
    loop {
        let token = reader.require_token().await?;
        writer.write_token(token.kind, reader.bytes(&token));
        if token.kind.is_container_end() && reader.depth() == target {
            return Ok(());
        }
    }
}

/// Like [`copy_value`], but hands `writer` to `sink` whenever it holds at
/// least `threshold` bytes, so a large value never sits in memory whole.
pub async fn copy_value_flushing<R, W>(
    reader: &mut JsonReader<R>,
    first: Token,
    writer: &mut TokenWriter,
    sink: &mut W,
    threshold: usize,
) -> Result<(), EncryptionError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_token(first.kind, reader.bytes(&first));
    if !first.kind.is_container_start() {
        return Ok(());
    }
    let target = reader.depth() - 1;
    loop {
        if writer.len() >= threshold {
            writer.flush_to(sink).await?;
        }
        let token = reader.require_token().await?;
        writer.write_token(token.kind, reader.bytes(&token));
        if token.kind.is_container_end() && reader.depth() == target {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferPool;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn copy_value_compacts_whitespace() {
        let pool = BufferPool::new(1);
        let doc = b"{ \"v\" : [ 1 , { \"n\" : \"\\u00e9\" } ] , \"w\": 2 }";
        let mut reader = JsonReader::new(&doc[..], &pool, 3, CancellationToken::new());
        reader.next_token().await.unwrap();
        reader.next_token().await.unwrap();
        let first = reader.next_token().await.unwrap().unwrap();
        let mut writer = TokenWriter::new(pool.rent(8));
        copy_value(&mut reader, first, &mut writer).await.unwrap();
        assert_eq!(writer.buffered(), br#"[1,{"n":"\u00e9"}]"#);
        let next = reader.next_token().await.unwrap().unwrap();
        assert_eq!(reader.str(&next).unwrap(), "w");
    }
    #[tokio::test]
    async fn flushing_copy_keeps_writer_under_threshold() {
        let pool = BufferPool::new(1);
        let items: Vec<String> = (0..2_000).map(|i| i.to_string()).collect();
        let doc = format!("[{}]", items.join(","));
        let mut reader = JsonReader::new(doc.as_bytes(), &pool, 64, CancellationToken::new());
        let first = reader.next_token().await.unwrap().unwrap();
        let mut writer = TokenWriter::new(pool.rent(16));
        let mut sink = Vec::new();
        copy_value_flushing(&mut reader, first, &mut writer, &mut sink, 32)
            .await
            .unwrap();
        assert!(!sink.is_empty());
        assert!(writer.len() < 64);
        writer.flush_to(&mut sink).await.unwrap();
        assert_eq!(sink, doc.as_bytes());
    }
}
