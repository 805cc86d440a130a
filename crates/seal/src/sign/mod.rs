//! Signing: local private-key and remote signing-service backends.
//!
//! Both backends answer the same two questions:
//!
//! 1. **Dry run** - how many bytes will the encoded signature occupy?
//!    The record builder reserves exactly that much placeholder space
//!    (`@sigsize`), and the final signature must fit it byte-for-byte.
//! 2. **Sign** - given `@digest1` (and the double digest), produce the
//!    encoded, date-prefixed, space-padded signature in `@signatureenc`.

pub mod keygen;
pub mod local;
pub mod remote;

pub use local::LocalSigner;
pub use remote::RemoteSigner;

use crate::store::FieldStore;
use crate::Result;

/// The signing backend selected for this run.
pub enum Signer {
    Local(LocalSigner),
    Remote(RemoteSigner),
}

impl Signer {
    /// Populate `@sigsize` without a digest.
    pub fn dry_run(&self, args: &mut FieldStore) -> Result<()> {
        match self {
            Signer::Local(s) => s.dry_run(args),
            Signer::Remote(s) => s.invoke(args),
        }
    }

    /// Produce `@signatureenc` from `@digest1`.
    pub fn sign(&self, args: &mut FieldStore) -> Result<()> {
        match self {
            Signer::Local(s) => s.sign(args),
            Signer::Remote(s) => s.invoke(args),
        }
    }
}

/// Encoded size of `n` signature bytes under the `sf=` encoding, not
/// counting any date prefix. The substring matching mirrors the wire
/// descriptor (`{date[N]:}{hex|HEX|base64|bin}`).
pub(crate) fn encoded_len(sf: &str, n: usize) -> Option<usize> {
    if sf.contains("base64") {
        Some(n.div_ceil(3) * 4)
    } else if sf.contains("bin") {
        Some(n)
    } else if sf.contains("hex") || sf.contains("HEX") {
        Some(n * 2)
    } else {
        None
    }
}

/// Byte length of the `YYYYMMDDhhmmss[.F...]` date prefix for an
/// `sf=date[N]...` descriptor, excluding the `:` separator. Zero when
/// the descriptor carries no date. The single digit after `date` sets
/// the subsecond precision; the length table lives here so the signer
/// and the placeholder sizing can never drift apart.
pub(crate) fn date_len(sf: &str) -> usize {
    if !sf.starts_with("date") {
        return 0;
    }
    let mut len = 14;
    if let Some(d) = sf.as_bytes().get(4).filter(|b| b.is_ascii_digit()) {
        let fract = (d - b'0') as usize;
        if fract > 0 {
            len += 1 + fract;
        }
    }
    len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_sizes() {
        assert_eq!(encoded_len("hex", 256), Some(512));
        assert_eq!(encoded_len("HEX", 256), Some(512));
        assert_eq!(encoded_len("base64", 256), Some(344));
        assert_eq!(encoded_len("bin", 256), Some(256));
        assert_eq!(encoded_len("date3:hex", 32), Some(64));
        assert_eq!(encoded_len("rot13", 32), None);
    }

    #[test]
    fn date_prefix_lengths() {
        assert_eq!(date_len("hex"), 0);
        assert_eq!(date_len("date:hex"), 14);
        assert_eq!(date_len("date0:hex"), 14);
        assert_eq!(date_len("date3:hex"), 18);
        assert_eq!(date_len("date6:base64"), 21);
    }
}
