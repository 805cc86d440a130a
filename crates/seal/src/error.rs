//! Error types for SEAL operations.
//!
//! Only *fatal* conditions become an [`enum@Error`]: I/O failures, key
//! loading problems, signing-service transport errors, and protocol
//! violations such as a placeholder changing size. Per-record soft
//! failures (malformed records, signature mismatches, revocations) are
//! carried in the field store's `@error` slot and fold into the verdict
//! mask instead of aborting the batch.

use thiserror::Error;

/// Fatal error type for SEAL operations.
///
/// All public functions in this crate return [`crate::Result<T>`], which
/// uses this error type. Anything that maps to exit code 0x80 lands here.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Private or public key could not be loaded or used.
    #[error("Key error: {0}")]
    Key(String),

    /// Signing-service or source-fetch transport failure.
    #[error("Network error: {0}")]
    Network(String),

    /// An internal contract was violated, e.g. the finalized signature
    /// does not match the placeholder size.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// The container is corrupted or cannot hold a record.
    #[error("Format error: {0}")]
    Format(String),

    /// Invalid configuration or command-line parameters.
    #[error("Configuration error: {0}")]
    Config(String),
}
