//! Source-reference binding: `src=`, `srca=`, `srcd=`, and the
//! signing-side `srcf=`.
//!
//! A record may bind an external source by carrying the digest of a URL
//! (`src`) or, at signing time, of a local file (`srcf`). `srca` names
//! the digest algorithm and encoding as `<algo>:<encoding>`. The check
//! is advisory: a mismatch prints a warning and never invalidates the
//! signature. Local paths are private — `srcf` computes `srcd` and is
//! dropped before the record is emitted; URLs are public and stay.

use std::io::Read;
use std::time::Duration;

use tracing::debug;

use crate::digest::HashAlg;
use crate::store::FieldStore;
use crate::{encode, Error, Result};

/// Parsed `srca=` descriptor, e.g. `sha256:base64` (the default).
struct SrcEncoding {
    alg: HashAlg,
    /// `hex`, `HEX`, `base64`, or `bin`.
    enc: String,
}

fn parse_srca(args: &FieldStore) -> Option<SrcEncoding> {
    let srca = args.text("srca");
    let srca = if srca.is_empty() { "sha256:base64".to_string() } else { srca };
    let (alg_name, enc) = match srca.split_once(':') {
        Some((a, e)) => (a.to_string(), e.to_string()),
        None => (srca, "base64".to_string()),
    };
    HashAlg::from_name(&alg_name).map(|alg| SrcEncoding { alg, enc })
}

fn encode_digest(desc: &SrcEncoding, digest: &[u8]) -> String {
    match desc.enc.as_str() {
        "hex" => encode::hex_encode(digest, false),
        "HEX" => encode::hex_encode(digest, true),
        "bin" => String::from_utf8_lossy(digest).into_owned(),
        _ => encode::base64_encode(digest),
    }
}

/// Hash a local file in 4 KiB chunks.
fn digest_file(path: &str, alg: HashAlg) -> Result<Vec<u8>> {
    let mut f = std::fs::File::open(path)?;
    let mut hasher = alg.hasher();
    let mut buf = [0u8; 4096];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

/// Stream a URL through the digest. Honors `cert-insecure` and
/// `cacert`; 60 s total timeout.
fn digest_url(args: &FieldStore, url: &str, alg: HashAlg) -> Result<Vec<u8>> {
    let mut builder = reqwest::blocking::Client::builder()
        .connect_timeout(Duration::from_secs(20))
        .timeout(Duration::from_secs(60));
    if args.is_set("cert-insecure") {
        builder = builder.danger_accept_invalid_certs(true);
    }
    if args.is_set("cacert") {
        let pem = std::fs::read(args.text("cacert"))?;
        let cert = reqwest::Certificate::from_pem(&pem)
            .map_err(|e| Error::Config(format!("bad cacert: {e}")))?;
        builder = builder.add_root_certificate(cert);
    }
    let client = builder
        .build()
        .map_err(|e| Error::Network(format!("cannot build HTTP client: {e}")))?;
    let mut resp = client
        .get(url)
        .send()
        .map_err(|e| Error::Network(format!("source fetch failed: {e}")))?
        .error_for_status()
        .map_err(|e| Error::Network(format!("source fetch rejected: {e}")))?;
    let mut hasher = alg.hasher();
    let mut buf = [0u8; 4096];
    loop {
        let n = resp
            .read(&mut buf)
            .map_err(|e| Error::Network(format!("source read failed: {e}")))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

/// Signing side: when `srcf` is set, compute `srcd` from the local file
/// and drop `srcf`; when only `src` is set and no `srcd` was supplied,
/// fetch and digest the URL.
pub fn prepare_for_signing(args: &mut FieldStore) -> Result<()> {
    let Some(desc) = parse_srca(args) else {
        return Err(Error::Config(format!(
            "unsupported source digest descriptor (srca={})",
            args.text("srca")
        )));
    };
    if args.is_set("srcf") {
        let digest = digest_file(&args.text("srcf"), desc.alg)?;
        let encoded = encode_digest(&desc, &digest);
        args.set_text("srcd", &encoded);
        args.delete("srcf");
        if !args.is_set("srca") {
            args.set_text("srca", "sha256:base64");
        }
    } else if args.is_set("src") && !args.is_set("srcd") {
        let url = args.text("src");
        if url.starts_with("http://") || url.starts_with("https://") {
            let digest = digest_url(args, &url, desc.alg)?;
            let encoded = encode_digest(&desc, &digest);
            args.set_text("srcd", &encoded);
            if !args.is_set("srca") {
                args.set_text("srca", "sha256:base64");
            }
        }
    }
    Ok(())
}

/// Verification side: recompute the source digest and compare with
/// `srcd`. Mismatch warns only.
pub fn verify_source(rec: &mut FieldStore) {
    if !rec.is_set("srcd") {
        return;
    }
    let Some(desc) = parse_srca(rec) else {
        println!("WARNING: unsupported source digest descriptor (srca={}).", rec.text("srca"));
        return;
    };
    let src = rec.text("src");
    let computed = if src.starts_with("http://") || src.starts_with("https://") {
        digest_url(rec, &src, desc.alg)
    } else if !src.is_empty() {
        digest_file(&src, desc.alg)
    } else {
        return;
    };
    let computed = match computed {
        Ok(d) => d,
        Err(e) => {
            debug!(error = %e, "source digest could not be computed");
            println!("WARNING: source ({src}) could not be read; srcd not checked.");
            return;
        }
    };
    let encoded = encode_digest(&desc, &computed);
    let want = rec.text("srcd");
    if encoded.trim_end_matches('=') != want.trim_end_matches('=') {
        println!("WARNING: source digest (srcd) does not match the source ({src}).");
        rec.append_text("@warnings", "source digest (srcd) mismatch\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn srcf_computes_srcd_and_is_dropped() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"the source bytes").unwrap();
        let path = f.path().to_string_lossy().into_owned();

        let mut args = FieldStore::new();
        args.set_text("srcf", &path);
        prepare_for_signing(&mut args).unwrap();

        assert!(!args.contains("srcf"));
        let want = encode::base64_encode(&HashAlg::Sha256.digest(b"the source bytes"));
        assert_eq!(args.text("srcd"), want);
    }

    #[test]
    fn mismatch_only_warns() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"actual content").unwrap();

        let mut rec = FieldStore::new();
        rec.set_text("src", &f.path().to_string_lossy());
        rec.set_text("srca", "sha256:hex");
        rec.set_text("srcd", "00000000");
        verify_source(&mut rec);
        assert!(rec.text("@warnings").contains("srcd"));
        assert!(!rec.contains("@error"));
    }

    #[test]
    fn hex_srca_encodes_hex() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"abc").unwrap();
        let mut args = FieldStore::new();
        args.set_text("srca", "sha256:hex");
        args.set_text("srcf", &f.path().to_string_lossy());
        prepare_for_signing(&mut args).unwrap();
        assert_eq!(
            args.text("srcd"),
            encode::hex_encode(&HashAlg::Sha256.digest(b"abc"), false)
        );
    }
}
