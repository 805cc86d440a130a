//! Output assembly: splice a block into the file image, finalize the
//! signature in place, and write the result.
//!
//! The original tool memory-mapped the output and patched it; here the
//! whole file rides as a `Vec<u8>` and the placeholder region is
//! overwritten after the digest and signature are computed. Container
//! fix-ups that live inside the digested range (RIFF sizes, TIFF IFD
//! pointers, MPF offsets) must be applied to the buffer *before*
//! [`finalize`]; only bytes excluded from every digest segment (the PNG
//! CRC) may be patched afterwards.

use std::path::Path;

use crate::store::FieldStore;
use crate::{digest, Context, Error, Result};

/// Copy `src` with `block` inserted at `offset`. Inserting past the end
/// zero-fills the gap.
pub fn splice(src: &[u8], offset: usize, block: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len() + block.len());
    if offset > src.len() {
        out.extend_from_slice(src);
        out.resize(offset, 0);
        out.extend_from_slice(block);
    } else {
        out.extend_from_slice(&src[..offset]);
        out.extend_from_slice(block);
        out.extend_from_slice(&src[offset..]);
    }
    out
}

/// Promote block-relative `@s` offsets to file-absolute.
pub fn promote_offsets(args: &mut FieldStore, insert_offset: usize) {
    args.inc_index("@s", 0, insert_offset);
    args.inc_index("@s", 1, insert_offset);
}

/// Refuse to sign a file whose last signature already covers the end of
/// file; anything added now would invalidate it.
pub fn ensure_not_finalized(args: &FieldStore) -> Result<()> {
    if args.text("@sflags1").contains('f') {
        return Err(Error::Protocol(
            "File is finalized; cannot sign".into(),
        ));
    }
    Ok(())
}

/// Digest the assembled output, produce the signature, and patch it over
/// the placeholder. `@s` must already be file-absolute.
///
/// Enforces the placeholder invariant: the encoded signature must be
/// byte-identical in size to the reserved region.
pub fn finalize(
    ctx: &mut Context,
    args: &mut FieldStore,
    out: &mut [u8],
    preface: Option<&[u8]>,
) -> Result<()> {
    digest::compute(args, out, preface);
    if args.contains("@error") {
        return Err(Error::Protocol(args.text("@error")));
    }

    let signer = ctx
        .signer
        .as_ref()
        .ok_or_else(|| Error::Protocol("signing requested without a signer".into()))?;
    signer.sign(args)?;

    let s0 = args.get_index("@s", 0);
    let s1 = args.get_index("@s", 1);
    let sig = args.bytes("@signatureenc");
    if sig.is_empty() || s0 + sig.len() != s1 || s1 > out.len() {
        return Err(Error::Protocol(
            "record size changed while writing".into(),
        ));
    }
    out[s0..s1].copy_from_slice(sig);

    // Rotate: the fresh signature becomes the "previous" one and the
    // ordinal counts it.
    args.set_index("@p", 0, s0);
    args.set_index("@p", 1, s1);
    args.inc_index("@s", 2, 1);
    Ok(())
}

/// Write the finished image to `@FilenameOut`.
pub fn write_output(args: &FieldStore, out: &[u8]) -> Result<()> {
    let fname = args.text("@FilenameOut");
    if fname.is_empty() {
        return Err(Error::Protocol("no output filename".into()));
    }
    std::fs::write(&fname, out)?;
    println!(
        " Signature record #{} added: {}",
        args.get_index("@s", 2),
        fname
    );
    Ok(())
}

/// Expand an output-filename template against an input path.
/// `%b` basename (no extension), `%d` directory (no trailing `/`),
/// `%e` extension including the dot, `%%` a percent sign.
pub fn make_filename(template: &str, input: &Path) -> Result<String> {
    let dir = input
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| ".".to_string());
    let base = input
        .file_stem()
        .map(|b| b.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = input
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let mut out = String::new();
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('b') => out.push_str(&base),
            Some('d') => out.push_str(&dir),
            Some('e') => out.push_str(&ext),
            Some('%') => out.push('%'),
            other => {
                return Err(Error::Config(format!(
                    "output filename contains illegal template character: %{}",
                    other.map(String::from).unwrap_or_default()
                )));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splice_inserts_in_the_middle() {
        assert_eq!(splice(b"HELLO", 2, b"--"), b"HE--LLO");
        assert_eq!(splice(b"HELLO", 0, b"--"), b"--HELLO");
        assert_eq!(splice(b"HELLO", 5, b"--"), b"HELLO--");
    }

    #[test]
    fn splice_past_eof_zero_fills() {
        assert_eq!(splice(b"AB", 4, b"X"), b"AB\0\0X");
    }

    #[test]
    fn filename_template_expansion() {
        let p = Path::new("/data/photos/cat.png");
        assert_eq!(make_filename("./%b-seal%e", p).unwrap(), "./cat-seal.png");
        assert_eq!(
            make_filename("%d/%b-signed%e", p).unwrap(),
            "/data/photos/cat-signed.png"
        );
        assert_eq!(make_filename("100%%", p).unwrap(), "100%");
        assert!(make_filename("%x", p).is_err());
    }

    #[test]
    fn finalized_file_refuses_signing() {
        let mut args = FieldStore::new();
        args.set_text("@sflags1", "Sf");
        assert!(ensure_not_finalized(&args).is_err());
        args.set_text("@sflags1", "S");
        assert!(ensure_not_finalized(&args).is_ok());
    }
}
