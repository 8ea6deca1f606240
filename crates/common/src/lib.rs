//! Shared wire types and the error taxonomy for the `docenc` document encryption engine.

pub mod error;
pub mod protocol;

pub use error::{EncryptionError, ErrorKind};
