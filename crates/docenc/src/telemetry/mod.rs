//! Structured logging setup for hosts embedding the engine.
//!
//! # Telemetry invariants
//!
//! - **No plaintext, ciphertext or key material** appears in any span field
//!   or log line. Spans carry dek ids, paths and sizes only.
//! - Log level is configurable via `DOCENC_LOG_LEVEL` (default: `info`) and
//!   overridden by `RUST_LOG` when set.

pub mod init;

pub use init::{init_tracing, LogFormat};
