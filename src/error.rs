//! # Error Types
//!
//! Defines a structured error hierarchy for the backup engine using `thiserror`.
//! The taxonomy mirrors how errors are handled: transient storage failures
//! surface as repository I/O problems and roll back the entry's transaction,
//! filesystem races during scan and backup delete the affected entry and
//! continue, and corruption is its own variant so restore and GC can
//! log-and-skip the object in question.
//!
//! Contract violations (cycles in the entry tree, re-parenting a non-root,
//! an entry left `new` after a scan, a child-set mismatch on push) are *not*
//! errors — they indicate bugs and are asserted fatally at the point of
//! detection.

use thiserror::Error;

/// Top-level error type encompassing all failure modes in the backup system.
#[derive(Error, Debug)]
pub enum Error {
    #[error("cache error: {0}")]
    Cache(#[from] rusqlite::Error),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("corrupted repository: {0}")]
    Corrupt(#[from] CorruptedRepository),

    #[error("encryption error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("malformed object payload: {0}")]
    Codec(#[from] CodecError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("new entries present; run a scan before backing up")]
    ScanRequired,

    #[error("an encryption key is required to read this repository")]
    KeyRequired,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A downloaded object failed its integrity checks: the payload hash does not
/// match the requested id, decryption failed, or the framing cannot be undone.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct CorruptedRepository(pub String);

/// Storage adapter errors.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Cryptographic operation errors.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("encryption failed")]
    Encrypt,

    #[error("decryption failed (corrupted data or wrong key)")]
    Decrypt,

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("object id must be {expected} bytes, got {actual}")]
    BadIdLength { expected: usize, actual: usize },
}

/// Object payload encoding and decoding errors.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("failed to encode payload: {0}")]
    Encode(String),

    #[error("failed to decode payload: {0}")]
    Decode(String),

    #[error("payload truncated")]
    Truncated,

    #[error("unknown object type {0:?}")]
    UnknownType(String),

    #[error("expected a {expected} object, found {found}")]
    UnexpectedType {
        expected: &'static str,
        found: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
