//! SEAL: Sealing Evidence and Attribution Links.
//!
//! This crate embeds and verifies cryptographic signatures inside media
//! and document files. A signer produces a textual `<seal ... s="..."/>`
//! record and inserts it into an existing container; the signed byte
//! range covers the file including the area around the record itself.
//! A verifier locates records, reconstructs the digest, fetches the
//! public key (DNS TXT, local override file, or inline), and confirms
//! the signature.
//!
//! # Overview
//!
//! - [`store::FieldStore`] - the ordered, string-addressable parameter
//!   carrier shared by every pipeline stage
//! - [`parse`] - scan byte windows for SEAL records
//! - [`record`] - emit canonical records with placeholder signatures
//! - [`digest`] - evaluate `b=` byte-range expressions and hash files
//! - [`keys::KeyResolver`] - DNS TXT retrieval, caching, inline keys
//! - [`sign`] - local and remote signing, key generation
//! - [`verify`] - signature verification and verdict classification
//! - [`formats`] - container dispatch and the per-format walkers

pub mod digest;
pub mod encode;
pub mod error;
pub mod formats;
pub mod keys;
pub mod parse;
pub mod record;
pub mod sign;
pub mod srcref;
pub mod store;
pub mod verify;
pub mod writer;

pub use error::Error;
pub use store::{FieldKind, FieldStore};

pub type Result<T> = std::result::Result<T, Error>;

/// Crate version reported by `sealtool -V`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

use keys::KeyResolver;
use sign::Signer;

/// What the current run is doing with each file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Default: verify every record found.
    Verify,
    /// Sign with a local private key (`-s`).
    SignLocal,
    /// Sign through a remote signing service (`-S`).
    SignRemote,
}

impl Mode {
    pub fn is_signing(self) -> bool {
        !matches!(self, Mode::Verify)
    }
}

/// Per-run state threaded through the walkers.
///
/// The DNS cache and the loaded signing key live here so that nothing in
/// the pipeline depends on process-global state; one `Context` spans one
/// batch of files.
pub struct Context {
    pub mode: Mode,
    pub resolver: KeyResolver,
    pub signer: Option<Signer>,
    /// OR of verdict bits across every file processed so far.
    pub verdicts: u8,
}

impl Context {
    pub fn new(mode: Mode) -> Self {
        Context {
            mode,
            resolver: KeyResolver::new(),
            signer: None,
            verdicts: 0,
        }
    }
}
