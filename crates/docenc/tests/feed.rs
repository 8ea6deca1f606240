//! Multi-document feeds: splitting and per-document decryption.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use docenc::{
    BufferPool, DecryptionOptions, DocumentEncryptor, EncryptionOptions, EncryptionType, EngineConfig, ErrorKind,
    FeedSplitter, JsonProcessing, RootKey, StaticKeyResolver,
};

fn engine(processing: JsonProcessing) -> DocumentEncryptor {
    let resolver = StaticKeyResolver::new().with_key("dek-1", EncryptionType::Randomized, RootKey::from([9u8; 32]));
    let config = EngineConfig {
        json_processing: processing,
        initial_buffer_size: 16,
        ..EngineConfig::default()
    };
    DocumentEncryptor::with_pool(Arc::new(resolver), config, BufferPool::new(1)).unwrap()
}

async fn decrypt_feed(engine: &DocumentEncryptor, feed: &[u8]) -> Result<(Value, usize), docenc::EncryptionError> {
    let mut output = Vec::new();
    let contexts = engine
        .decrypt_feed(feed, &mut output, &DecryptionOptions::default(), &CancellationToken::new())
        .await?;
    let encrypted = contexts.iter().filter(|c| c.is_some()).count();
    Ok((serde_json::from_slice(&output).unwrap(), encrypted))
}

#[tokio::test]
async fn splitter_yields_each_document_in_order() {
    let pool = BufferPool::new(1);
    let input = br#"{"Documents":[{"id":"a"},{"id":"b"}],"_count":2}"#;
    let mut splitter = FeedSplitter::new(&input[..], &pool, 16, CancellationToken::new());
    let mut ids = Vec::new();
    while let Some(doc) = splitter.next_document().await.unwrap() {
        let value: Value = serde_json::from_slice(&doc).unwrap();
        ids.push(value["id"].as_str().unwrap().to_owned());
    }
    assert_eq!(ids, ["a", "b"]);
    assert_eq!(splitter.yielded(), 2);
    drop(splitter);
    assert_eq!(pool.outstanding(), 0);
}

#[tokio::test]
async fn feed_documents_are_decrypted_independently() {
    for strategy in [JsonProcessing::Streaming, JsonProcessing::Materializing] {
        let engine = engine(strategy);
        let cancel = CancellationToken::new();
        let originals = [
            json!({"id": "a", "ssn": "111", "n": 1}),
            json!({"id": "b", "ssn": {"nested": [true, null]}}),
            json!({"id": "c", "plain": "untouched"}),
        ];
        let mut documents = Vec::new();
        for doc in &originals {
            let (encrypted, _) = engine
                .encrypt_bytes(
                    &serde_json::to_vec(doc).unwrap(),
                    &EncryptionOptions::new("dek-1", ["/ssn"]),
                    &cancel,
                )
                .await
                .unwrap();
            documents.push(serde_json::from_slice::<Value>(&encrypted).unwrap());
        }
        let feed = json!({
            "_rid": "r1",
            "Diagnostics": [{"id": "ignored"}],
            "Documents": documents,
            "_count": 3
        });

        let (out, encrypted) = decrypt_feed(&engine, &serde_json::to_vec(&feed).unwrap())
            .await
            .unwrap();
        assert_eq!(out["Documents"], json!(originals), "{strategy:?}");
        assert_eq!(out["_count"], 3);
        assert!(out.get("_rid").is_none());
        assert_eq!(encrypted, 2);
        assert_eq!(engine.pool().outstanding(), 0);
    }
}

#[tokio::test]
async fn empty_feed_yields_empty_documents() {
    let (out, encrypted) = decrypt_feed(&engine(JsonProcessing::Streaming), br#"{"Documents":[],"_count":0}"#)
        .await
        .unwrap();
    assert_eq!(out, json!({"Documents": [], "_count": 0}));
    assert_eq!(encrypted, 0);
}

#[tokio::test]
async fn bare_array_feed_is_rejected() {
    let err = decrypt_feed(&engine(JsonProcessing::Streaming), br#"[{"id":"doc1"}]"#)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Format);
    assert!(err.to_string().contains("enclosing object"));
}

#[tokio::test]
async fn tampered_feed_document_fails_the_feed() {
    let engine = engine(JsonProcessing::Streaming);
    let (encrypted, _) = engine
        .encrypt_bytes(
            br#"{"id":"a","ssn":"111"}"#,
            &EncryptionOptions::new("dek-1", ["/ssn"]),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    let mut doc: Value = serde_json::from_slice(&encrypted).unwrap();
    let mut ciphertext = doc["ssn"].as_str().unwrap().to_owned();
    // Swap one base64 digit for another inside the ciphertext.
    let mid = ciphertext.len() / 2;
    let replacement = if &ciphertext[mid..mid + 1] == "A" { "B" } else { "A" };
    ciphertext.replace_range(mid..mid + 1, replacement);
    doc["ssn"] = Value::String(ciphertext);
    let feed = serde_json::to_vec(&json!({"Documents": [doc]})).unwrap();

    let err = decrypt_feed(&engine, &feed).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authentication, "{err}");
    assert_eq!(engine.pool().outstanding(), 0);
}
