//! Forward-only JSON tokenizer over an async byte source.
//!
//! The reader holds at most one partially read token plus whatever the last
//! read returned. When a token straddles the end of the buffer, already
//! consumed bytes are compacted away; when the unconsumed tail fills the whole
//! buffer it doubles through the pool. Tokens are only surfaced once complete,
//! so multi-byte UTF-8 sequences are never split.

use std::borrow::Cow;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use common::EncryptionError;

use crate::pool::{BufferPool, PooledBuffer};

/// Kinds of token surfaced by [`JsonReader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    StartObject,
    EndObject,
    StartArray,
    EndArray,
    PropertyName,
    String,
    Number,
    True,
    False,
    Null,
}

impl TokenKind {
    pub fn is_container_start(&self) -> bool {
        matches!(self, TokenKind::StartObject | TokenKind::StartArray)
    }

    pub fn is_container_end(&self) -> bool {
        matches!(self, TokenKind::EndObject | TokenKind::EndArray)
    }
}

/// A complete token. Its bytes stay valid until the next call to
/// [`JsonReader::next_token`].
#[derive(Debug, Clone, Copy)]
pub struct Token {
    pub kind: TokenKind,
    start: usize,
    end: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Frame {
    Object,
    Array,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    Value,
    ValueOrEndArray,
    Name,
    NameOrEndObject,
    Colon,
    CommaOrEnd,
    Done,
}

/// Outcome of scanning the token at the front of the buffer. `Incomplete`
/// carries the offset the next scan resumes from once more input arrives.
enum Scan {
    Complete(usize),
    Incomplete(usize),
    Invalid(&'static str),
}

/// Pull tokenizer. See the module docs for the buffering model.
pub struct JsonReader<R> {
    input: R,
    buf: PooledBuffer,
    pos: usize,
    eof: bool,
    stack: Vec<Frame>,
    expect: Expect,
    consumed: u64,
    cancel: CancellationToken,
}

impl<R: AsyncRead + Unpin> JsonReader<R> {
    pub fn new(input: R, pool: &BufferPool, initial_size: usize, cancel: CancellationToken) -> Self {
        Self {
            input,
            buf: pool.rent(initial_size.max(1)),
            pos: 0,
            eof: false,
            stack: Vec::new(),
            expect: Expect::Value,
            consumed: 0,
            cancel,
        }
    }

    /// Nesting depth after the last token: 1 inside the root object.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Current physical size of the read buffer.
    pub fn buffer_capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// Raw bytes of `token`, including quotes for strings and property names.
    pub fn bytes(&self, token: &Token) -> &[u8] {
        &self.buf[token.start..token.end]
    }

    /// Decoded text of a string or property-name token.
    pub fn str(&self, token: &Token) -> Result<Cow<'_, str>, EncryptionError> {
        decode_string(self.bytes(token))
    }

    /// Next token, or `None` after the root value is complete.
    ///
    /// # Errors
    ///
    /// [`EncryptionError::Format`] on malformed or truncated input,
    /// [`EncryptionError::Cancelled`] if the token fires between reads.
    pub async fn next_token(&mut self) -> Result<Option<Token>, EncryptionError> {
        loop {
            let Some(b) = self.peek_non_whitespace().await? else {
                return if self.expect == Expect::Done {
                    Ok(None)
                } else {
                    Err(self.error("unexpected end of JSON input"))
                };
            };
            match self.expect {
                Expect::Done => return Err(self.error("unexpected data after the root value")),
                Expect::Colon => {
                    if b != b':' {
                        return Err(self.error("expected ':' after property name"));
                    }
                    self.pos += 1;
                    self.expect = Expect::Value;
                }
                Expect::CommaOrEnd => match (b, self.stack.last()) {
                    (b',', Some(Frame::Object)) => {
                        self.pos += 1;
                        self.expect = Expect::Name;
                    }
                    (b',', Some(Frame::Array)) => {
                        self.pos += 1;
                        self.expect = Expect::Value;
                    }
                    (b'}', Some(Frame::Object)) => return Ok(Some(self.close(TokenKind::EndObject))),
                    (b']', Some(Frame::Array)) => return Ok(Some(self.close(TokenKind::EndArray))),
                    _ => return Err(self.error("expected ',' or closing bracket")),
                },
                Expect::Name | Expect::NameOrEndObject => {
                    if b == b'}' && self.expect == Expect::NameOrEndObject {
                        return Ok(Some(self.close(TokenKind::EndObject)));
                    }
                    if b != b'"' {
                        return Err(self.error("expected property name"));
                    }
                    let len = self.scan(scan_string).await?;
                    let token = self.take(TokenKind::PropertyName, len);
                    self.expect = Expect::Colon;
                    return Ok(Some(token));
                }
                Expect::Value | Expect::ValueOrEndArray => {
                    if b == b']' && self.expect == Expect::ValueOrEndArray {
                        return Ok(Some(self.close(TokenKind::EndArray)));
                    }
                    return self.read_value(b).await.map(Some);
                }
            }
        }
    }

    /// Advance past the rest of the value that `first` opened.
    pub async fn skip_value(&mut self, first: Token) -> Result<(), EncryptionError> {
        if !first.kind.is_container_start() {
            return Ok(());
        }
        let target = self.depth() - 1;
        loop {
            let token = self.require_token().await?;
            if token.kind.is_container_end() && self.depth() == target {
                return Ok(());
            }
        }
    }

    /// Like [`JsonReader::next_token`] but treats end of input as a format error.
    pub async fn require_token(&mut self) -> Result<Token, EncryptionError> {
        self.next_token()
            .await?
            .ok_or_else(|| self.error("unexpected end of JSON input"))
    }

    async fn read_value(&mut self, b: u8) -> Result<Token, EncryptionError> {
        let token = match b {
            b'{' => {
                let token = self.take(TokenKind::StartObject, 1);
                self.stack.push(Frame::Object);
                self.expect = Expect::NameOrEndObject;
                return Ok(token);
            }
            b'[' => {
                let token = self.take(TokenKind::StartArray, 1);
                self.stack.push(Frame::Array);
                self.expect = Expect::ValueOrEndArray;
                return Ok(token);
            }
            b'"' => {
                let len = self.scan(scan_string).await?;
                self.take(TokenKind::String, len)
            }
            b't' => {
                let len = self.scan(|s, _, _| scan_literal(s, b"true")).await?;
                self.take(TokenKind::True, len)
            }
            b'f' => {
                let len = self.scan(|s, _, _| scan_literal(s, b"false")).await?;
                self.take(TokenKind::False, len)
            }
            b'n' => {
                let len = self.scan(|s, _, _| scan_literal(s, b"null")).await?;
                self.take(TokenKind::Null, len)
            }
            b'-' | b'0'..=b'9' => {
                let len = self.scan(scan_number).await?;
                self.take(TokenKind::Number, len)
            }
            _ => return Err(self.error("unexpected character")),
        };
        self.after_value();
        Ok(token)
    }

    fn close(&mut self, kind: TokenKind) -> Token {
        let token = self.take(kind, 1);
        self.stack.pop();
        self.after_value();
        token
    }

    fn after_value(&mut self) {
        self.expect = if self.stack.is_empty() {
            Expect::Done
        } else {
            Expect::CommaOrEnd
        };
    }

    fn take(&mut self, kind: TokenKind, len: usize) -> Token {
        let token = Token {
            kind,
            start: self.pos,
            end: self.pos + len,
        };
        self.pos += len;
        token
    }

    /// Scan one token, reading more input until `f` completes it. The resume
    /// offset is relative to the token start, which `fill` keeps stable by
    /// compacting the buffer, so each byte is examined once.
    async fn scan<F>(&mut self, f: F) -> Result<usize, EncryptionError>
    where
        F: Fn(&[u8], bool, usize) -> Scan,
    {
        let mut from = 0;
        loop {
            match f(&self.buf[self.pos..], self.eof, from) {
                Scan::Complete(n) => return Ok(n),
                Scan::Invalid(msg) => return Err(self.error(msg)),
                Scan::Incomplete(_) if self.eof => {
                    return Err(self.error("unexpected end of JSON input"))
                }
                Scan::Incomplete(resume) => {
                    from = resume;
                    self.fill().await?;
                }
            }
        }
    }

    async fn peek_non_whitespace(&mut self) -> Result<Option<u8>, EncryptionError> {
        loop {
            while self.pos < self.buf.len() {
                let b = self.buf[self.pos];
                if matches!(b, b' ' | b'\t' | b'\n' | b'\r') {
                    self.pos += 1;
                } else {
                    return Ok(Some(b));
                }
            }
            if !self.fill().await? {
                return Ok(None);
            }
        }
    }

    /// Read more input. Returns `false` at end of input.
    async fn fill(&mut self) -> Result<bool, EncryptionError> {
        if self.eof {
            return Ok(false);
        }
        if self.cancel.is_cancelled() {
            return Err(EncryptionError::Cancelled);
        }
        if self.pos > 0 {
            self.consumed += self.pos as u64;
            self.buf.consume_front(self.pos);
            self.pos = 0;
        }
        if self.buf.len() == self.buf.capacity() {
            let target = self.buf.capacity() * 2;
            self.buf.grow(target);
            trace!(capacity = self.buf.capacity(), "json read buffer grown");
        }

        let cancel = &self.cancel;
        let input = &mut self.input;
        let spare = self.buf.spare_mut();
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EncryptionError::Cancelled),
            read = input.read(spare) => read?,
        };
        if n == 0 {
            self.eof = true;
            return Ok(false);
        }
        self.buf.advance(n);
        Ok(true)
    }

    fn error(&self, msg: &str) -> EncryptionError {
        let offset = self.consumed + self.pos as u64;
        EncryptionError::Format(format!("invalid JSON at byte {offset}: {msg}"))
    }
}

/// Decode a quoted JSON string token, borrowing when it has no escapes.
pub fn decode_string(raw: &[u8]) -> Result<Cow<'_, str>, EncryptionError> {
    if raw.len() < 2 || raw[0] != b'"' || raw[raw.len() - 1] != b'"' {
        return Err(EncryptionError::format("expected a JSON string"));
    }
    let inner = &raw[1..raw.len() - 1];
    if !inner.contains(&b'\\') {
        return std::str::from_utf8(inner)
            .map(Cow::Borrowed)
            .map_err(|_| EncryptionError::format("string is not valid UTF-8"));
    }
    serde_json::from_slice::<String>(raw)
        .map(Cow::Owned)
        .map_err(|e| EncryptionError::Format(format!("invalid JSON string: {e}")))
}

/// `from` is where a previous incomplete scan stopped; it never points
/// inside an escape sequence.
fn scan_string(s: &[u8], _eof: bool, from: usize) -> Scan {
    let mut i = from.max(1);
    while i < s.len() {
        match s[i] {
            b'"' => {
                return match std::str::from_utf8(&s[1..i]) {
                    Ok(_) => Scan::Complete(i + 1),
                    Err(_) => Scan::Invalid("string is not valid UTF-8"),
                };
            }
            b'\\' => {
                let Some(&esc) = s.get(i + 1) else {
                    return Scan::Incomplete(i);
                };
                match esc {
                    b'"' | b'\\' | b'/' | b'b' | b'f' | b'n' | b'r' | b't' => i += 2,
                    b'u' => {
                        let Some(hex) = s.get(i + 2..i + 6) else {
                            return Scan::Incomplete(i);
                        };
                        if !hex.iter().all(u8::is_ascii_hexdigit) {
                            return Scan::Invalid("invalid \\u escape");
                        }
                        i += 6;
                    }
                    _ => return Scan::Invalid("invalid escape sequence"),
                }
            }
            0x00..=0x1F => return Scan::Invalid("control character in string"),
            _ => i += 1,
        }
    }
    Scan::Incomplete(i)
}

fn scan_literal(s: &[u8], word: &'static [u8]) -> Scan {
    let n = s.len().min(word.len());
    if s[..n] != word[..n] {
        return Scan::Invalid("invalid literal");
    }
    if n < word.len() {
        Scan::Incomplete(0)
    } else {
        Scan::Complete(word.len())
    }
}

/// A number ends at the first byte outside its alphabet, or at end of input.
fn scan_number(s: &[u8], eof: bool, from: usize) -> Scan {
    let len = s[from..]
        .iter()
        .position(|b| !matches!(b, b'0'..=b'9' | b'-' | b'+' | b'.' | b'e' | b'E'))
        .map_or(s.len(), |n| from + n);
    if len == s.len() && !eof {
        return Scan::Incomplete(len);
    }
    if valid_number(&s[..len]) {
        Scan::Complete(len)
    } else {
        Scan::Invalid("invalid number")
    }
}

/// `-?(0|[1-9][0-9]*)(\.[0-9]+)?([eE][+-]?[0-9]+)?`
fn valid_number(s: &[u8]) -> bool {
    fn digits(s: &[u8], i: &mut usize) -> usize {
        let start = *i;
        while *i < s.len() && s[*i].is_ascii_digit() {
            *i += 1;
        }
        *i - start
    }

    let mut i = 0;
    if s.get(i) == Some(&b'-') {
        i += 1;
    }
    match s.get(i) {
        Some(b'0') => i += 1,
        Some(b'1'..=b'9') => {
            digits(s, &mut i);
        }
        _ => return false,
    }
    if s.get(i) == Some(&b'.') {
        i += 1;
        if digits(s, &mut i) == 0 {
            return false;
        }
    }
    if matches!(s.get(i), Some(b'e' | b'E')) {
        i += 1;
        if matches!(s.get(i), Some(b'+' | b'-')) {
            i += 1;
        }
        if digits(s, &mut i) == 0 {
            return false;
        }
    }
    i == s.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn tokens(input: &[u8], initial: usize) -> Result<Vec<(TokenKind, Vec<u8>)>, EncryptionError> {
        let pool = BufferPool::new(1);
        let mut reader = JsonReader::new(input, &pool, initial, CancellationToken::new());
        let mut out = Vec::new();
        while let Some(t) = reader.next_token().await? {
            out.push((t.kind, reader.bytes(&t).to_vec()));
        }
        Ok(out)
    }

    #[tokio::test]
    async fn tokenizes_nested_document() {
        let doc = br#" {"a": [1, -2.5e3, true, false, null], "b": {"c": "d\"e"}} "#;
        let toks = tokens(doc, 4).await.unwrap();
        let kinds: Vec<_> = toks.iter().map(|(k, _)| *k).collect();
        use TokenKind::*;
        assert_eq!(
            kinds,
            vec![
                StartObject, PropertyName, StartArray, Number, Number, True, False, Null, EndArray,
                PropertyName, StartObject, PropertyName, String, EndObject, EndObject
            ]
        );
        assert_eq!(toks[4].1, b"-2.5e3");
        assert_eq!(toks[12].1, br#""d\"e""#);
    }

    #[tokio::test]
    async fn tiny_buffer_grows_for_long_strings() {
        let long = "é".repeat(10_000);
        let doc = format!(r#"{{"k":"{long}"}}"#);
        let pool = BufferPool::new(1);
        let mut reader = JsonReader::new(doc.as_bytes(), &pool, 1, CancellationToken::new());
        reader.next_token().await.unwrap();
        reader.next_token().await.unwrap();
        let value = reader.next_token().await.unwrap().unwrap();
        assert_eq!(reader.str(&value).unwrap(), long);
        assert!(reader.buffer_capacity() >= long.len());
    }

    /// Yields at most `chunk` bytes per read.
    struct Chunked<'a> {
        data: &'a [u8],
        chunk: usize,
    }

    impl AsyncRead for Chunked<'_> {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            let data = self.data;
            let n = self.chunk.min(data.len()).min(buf.remaining());
            buf.put_slice(&data[..n]);
            self.data = &data[n..];
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn long_string_read_in_small_chunks() {
        // Escapes of every width land on 1 KiB boundaries somewhere in the run.
        let body = "abcdefg\\u00e9\\\"xy\\n".repeat(60_000);
        let doc = format!(r#"{{"k":"{body}","n":-12345678901234567890.5e-3}}"#);
        let pool = BufferPool::new(1);
        let input = Chunked {
            data: doc.as_bytes(),
            chunk: 1024,
        };
        let mut reader = JsonReader::new(input, &pool, 1024, CancellationToken::new());
        reader.next_token().await.unwrap();
        reader.next_token().await.unwrap();
        let value = reader.next_token().await.unwrap().unwrap();
        let expected: String = serde_json::from_str(&format!("\"{body}\"")).unwrap();
        assert_eq!(reader.str(&value).unwrap(), expected);
        reader.next_token().await.unwrap();
        let number = reader.next_token().await.unwrap().unwrap();
        assert_eq!(reader.bytes(&number), b"-12345678901234567890.5e-3");
    }

    #[test]
    fn string_scan_resumes_before_split_escape() {
        let Scan::Incomplete(at) = scan_string(br#""abc\u00"#, false, 0) else {
            panic!("expected incomplete scan");
        };
        assert_eq!(at, 4);
        assert!(matches!(scan_string(br#""abc\u00e9""#, false, at), Scan::Complete(11)));
        assert!(matches!(scan_number(b"123", false, 0), Scan::Incomplete(3)));
        assert!(matches!(scan_number(b"1234,", false, 3), Scan::Complete(4)));
    }

    #[tokio::test]
    async fn root_scalars_and_numbers_at_eof() {
        assert_eq!(tokens(b"42", 1).await.unwrap()[0].1, b"42");
        assert_eq!(tokens(b"\"x\"", 1).await.unwrap()[0].0, TokenKind::String);
    }

    #[tokio::test]
    async fn rejects_malformed_input() {
        for bad in [
            &b"{\"a\" 1}"[..],
            b"{\"a\":1,}",
            b"[1 2]",
            b"{\"a\":01}",
            b"{\"a\":tru}",
            b"{\"a\":\"\\x\"}",
            b"{\"a\":1}}",
            b"{\"a\":",
            b"",
        ] {
            let err = tokens(bad, 2).await.unwrap_err();
            assert_eq!(err.kind(), common::ErrorKind::Format, "{:?}", String::from_utf8_lossy(bad));
        }
    }

    #[tokio::test]
    async fn skip_value_consumes_subtree() {
        let pool = BufferPool::new(1);
        let doc = br#"{"skip":{"x":[1,{"y":2}]},"keep":3}"#;
        let mut reader = JsonReader::new(&doc[..], &pool, 8, CancellationToken::new());
        reader.next_token().await.unwrap();
        reader.next_token().await.unwrap();
        let first = reader.next_token().await.unwrap().unwrap();
        reader.skip_value(first).await.unwrap();
        let name = reader.next_token().await.unwrap().unwrap();
        assert_eq!(reader.str(&name).unwrap(), "keep");
    }

    #[tokio::test]
    async fn cancelled_token_stops_reading() {
        let pool = BufferPool::new(1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut reader = JsonReader::new(&b"{}"[..], &pool, 8, cancel);
        let err = reader.next_token().await.unwrap_err();
        assert_eq!(err.kind(), common::ErrorKind::Cancelled);
        drop(reader);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn number_grammar() {
        for ok in ["0", "-0", "12", "1.5", "1e9", "1E+2", "-3.25e-7"] {
            assert!(valid_number(ok.as_bytes()), "{ok}");
        }
        for bad in ["-", "01", "1.", ".5", "1e", "1e+", "--1", "1.2.3"] {
            assert!(!valid_number(bad.as_bytes()), "{bad}");
        }
    }

    #[test]
    fn decode_string_handles_escapes() {
        assert_eq!(decode_string(br#""plain""#).unwrap(), "plain");
        assert_eq!(decode_string(br#""a\u00e9\n""#).unwrap(), "aé\n");
        assert!(decode_string(b"nope").is_err());
    }
}
