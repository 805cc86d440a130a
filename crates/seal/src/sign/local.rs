//! Local signing with a PEM private key.
//!
//! Keys load from PKCS#8 (clear or PBES2-encrypted), PKCS#1 (RSA), or
//! SEC1 (EC) PEM. RSA signs PKCS#1 v1.5 over the nominated digest; EC
//! keys produce DER-encoded ECDSA signatures. DER signatures are
//! variable length, so the dry run reserves the curve maximum and the
//! finished signature is right-padded with spaces to the placeholder
//! size.

use std::path::Path;

use chrono::{Timelike, Utc};
use pkcs8::DecodePrivateKey;
use secrecy::{ExposeSecret, SecretString};
use signature::hazmat::PrehashSigner;

use crate::digest::HashAlg;
use crate::sign::{date_len, encoded_len};
use crate::store::{FieldKind, FieldStore};
use crate::{digest, encode, Error, Result};

/// A loaded private key.
pub enum SigningKey {
    Rsa(rsa::RsaPrivateKey),
    P256(p256::ecdsa::SigningKey),
    P384(p384::ecdsa::SigningKey),
}

impl SigningKey {
    /// Maximum size in bytes of a raw signature from this key. Exact
    /// for RSA; the DER ceiling for ECDSA.
    pub fn max_signature_len(&self) -> usize {
        match self {
            SigningKey::Rsa(k) => rsa::traits::PublicKeyParts::size(k),
            // SEQUENCE hdr + 2 * (INTEGER hdr + field + possible pad)
            SigningKey::P256(_) => 2 + 2 * (2 + 33),
            SigningKey::P384(_) => 2 + 2 * (2 + 49),
        }
    }

    fn sign_digest(&self, alg: HashAlg, digest: &[u8]) -> Result<Vec<u8>> {
        match self {
            SigningKey::Rsa(key) => {
                let padding = match alg {
                    HashAlg::Sha224 => rsa::Pkcs1v15Sign::new::<sha2::Sha224>(),
                    HashAlg::Sha256 => rsa::Pkcs1v15Sign::new::<sha2::Sha256>(),
                    HashAlg::Sha384 => rsa::Pkcs1v15Sign::new::<sha2::Sha384>(),
                    HashAlg::Sha512 => rsa::Pkcs1v15Sign::new::<sha2::Sha512>(),
                };
                key.sign(padding, digest)
                    .map_err(|e| Error::Key(format!("RSA signing failed: {e}")))
            }
            SigningKey::P256(key) => {
                let sig: p256::ecdsa::Signature = key
                    .sign_prehash(digest)
                    .map_err(|e| Error::Key(format!("ECDSA signing failed: {e}")))?;
                Ok(sig.to_der().as_bytes().to_vec())
            }
            SigningKey::P384(key) => {
                let sig: p384::ecdsa::Signature = key
                    .sign_prehash(digest)
                    .map_err(|e| Error::Key(format!("ECDSA signing failed: {e}")))?;
                Ok(sig.to_der().as_bytes().to_vec())
            }
        }
    }

    /// DER SubjectPublicKeyInfo of the matching public key, for inline
    /// (`pk=`) signing and DNS fragment generation.
    pub fn public_key_der(&self) -> Result<Vec<u8>> {
        use pkcs8::EncodePublicKey;
        let der = match self {
            SigningKey::Rsa(k) => rsa::RsaPublicKey::from(k)
                .to_public_key_der()
                .map_err(|e| Error::Key(format!("cannot encode public key: {e}")))?,
            SigningKey::P256(k) => k
                .verifying_key()
                .to_public_key_der()
                .map_err(|e| Error::Key(format!("cannot encode public key: {e}")))?,
            SigningKey::P384(k) => k
                .verifying_key()
                .to_public_key_der()
                .map_err(|e| Error::Key(format!("cannot encode public key: {e}")))?,
        };
        Ok(der.as_bytes().to_vec())
    }
}

/// Does this PEM need a password before it will load?
pub fn pem_is_encrypted(pem: &str) -> bool {
    pem.contains("BEGIN ENCRYPTED PRIVATE KEY") || pem.contains("Proc-Type: 4,ENCRYPTED")
}

/// Load a private key for `ka` from a PEM file. `password` is consulted
/// only for encrypted PKCS#8; the CLI prompts and retries on
/// [`Error::Key`] mentioning a password.
pub fn load_key(path: impl AsRef<Path>, ka: &str, password: Option<&SecretString>) -> Result<SigningKey> {
    let pem = std::fs::read_to_string(path.as_ref())?;
    if pem_is_encrypted(&pem) {
        let pwd = password.ok_or_else(|| Error::Key("private key requires a password".into()))?;
        let pwd = pwd.expose_secret().as_bytes();
        if ka == "rsa" {
            return rsa::RsaPrivateKey::from_pkcs8_encrypted_pem(&pem, pwd)
                .map(SigningKey::Rsa)
                .map_err(|_| Error::Key("wrong password or unreadable private key".into()));
        }
        if let Ok(k) = p256::ecdsa::SigningKey::from_pkcs8_encrypted_pem(&pem, pwd) {
            return Ok(SigningKey::P256(k));
        }
        return p384::ecdsa::SigningKey::from_pkcs8_encrypted_pem(&pem, pwd)
            .map(SigningKey::P384)
            .map_err(|_| Error::Key("wrong password or unreadable private key".into()));
    }

    if ka == "rsa" {
        use rsa::pkcs1::DecodeRsaPrivateKey;
        if let Ok(k) = rsa::RsaPrivateKey::from_pkcs8_pem(&pem) {
            return Ok(SigningKey::Rsa(k));
        }
        return rsa::RsaPrivateKey::from_pkcs1_pem(&pem)
            .map(SigningKey::Rsa)
            .map_err(|e| Error::Key(format!("cannot load RSA key: {e}")));
    }
    // Everything else currently supported is EC.
    if let Ok(k) = p256::ecdsa::SigningKey::from_pkcs8_pem(&pem) {
        return Ok(SigningKey::P256(k));
    }
    if let Ok(k) = p256::SecretKey::from_sec1_pem(&pem) {
        return Ok(SigningKey::P256(k.into()));
    }
    if let Ok(k) = p384::ecdsa::SigningKey::from_pkcs8_pem(&pem) {
        return Ok(SigningKey::P384(k));
    }
    p384::SecretKey::from_sec1_pem(&pem)
        .map(|k| SigningKey::P384(k.into()))
        .map_err(|e| Error::Key(format!("cannot load EC key: {e}")))
}

/// The local signing backend: a loaded key plus the two entry points.
pub struct LocalSigner {
    key: SigningKey,
}

impl LocalSigner {
    pub fn new(key: SigningKey) -> Self {
        LocalSigner { key }
    }

    pub fn key(&self) -> &SigningKey {
        &self.key
    }

    pub fn into_key(self) -> SigningKey {
        self.key
    }

    /// Compute `@sigsize`: the byte count the encoded signature (with
    /// any date prefix) will occupy in the record.
    pub fn dry_run(&self, args: &mut FieldStore) -> Result<()> {
        let sf = args.text("sf");
        let raw = self.key.max_signature_len();
        let mut enclen = encoded_len(&sf, raw)
            .ok_or_else(|| Error::Config(format!("Unknown signature format ({sf})")))?;
        let dlen = date_len(&sf);
        if dlen > 0 {
            enclen += dlen + 1; // "date:"
        }
        args.set_u32_index("@sigsize", 0, enclen as u32);
        Ok(())
    }

    /// Sign `@digest1`/`@digest2`, encode, date-prefix, and pad into
    /// `@signatureenc`.
    pub fn sign(&self, args: &mut FieldStore) -> Result<()> {
        let sf = args.text("sf");

        // The date string feeds the double digest, so stamp it first.
        let datestr = if sf.starts_with("date") {
            let d = make_sigdate(&sf);
            args.set_text("@sigdate", &d);
            d
        } else {
            args.delete("@sigdate");
            String::new()
        };

        digest::double_digest(args);
        if let Some(err) = args.get("@error") {
            let msg = String::from_utf8_lossy(&err.bytes).into_owned();
            return Err(Error::Protocol(msg));
        }

        let da = args.text("da");
        let alg = HashAlg::from_name(&da)
            .ok_or_else(|| Error::Config(format!("Unsupported digest algorithm (da={da})")))?;
        let digest_bytes = if args.is_set("@digest2") {
            args.bytes("@digest2").to_vec()
        } else {
            args.bytes("@digest1").to_vec()
        };
        if digest_bytes.is_empty() {
            return Err(Error::Protocol("no digest to sign".into()));
        }

        let raw = self.key.sign_digest(alg, &digest_bytes)?;
        args.set("@sigbin", raw.clone(), FieldKind::Binary);

        let encoded: Vec<u8> = if sf.contains("base64") {
            encode::base64_encode(&raw).into_bytes()
        } else if sf.contains("hex") {
            encode::hex_encode(&raw, false).into_bytes()
        } else if sf.contains("HEX") {
            encode::hex_encode(&raw, true).into_bytes()
        } else if sf.contains("bin") {
            raw
        } else {
            return Err(Error::Config(format!("Unknown signature format ({sf})")));
        };

        let mut sig = Vec::new();
        if !datestr.is_empty() {
            sig.extend_from_slice(datestr.as_bytes());
            sig.push(b':');
        }
        sig.extend_from_slice(&encoded);

        // Pad to the reserved size; the placeholder invariant demands
        // byte-identical length.
        let want = args.get_u32_index("@sigsize", 0) as usize;
        if sig.len() > want {
            return Err(Error::Protocol(
                "signature larger than its placeholder".into(),
            ));
        }
        sig.resize(want, b' ');
        args.set("@signatureenc", sig, FieldKind::Text);
        Ok(())
    }
}

/// UTC timestamp `YYYYMMDDhhmmss[.F{1..}]` with the subsecond precision
/// requested by `sf=date[N]...`. Precision past 6 digits zero-pads.
fn make_sigdate(sf: &str) -> String {
    let now = Utc::now();
    let mut out = now.format("%Y%m%d%H%M%S").to_string();
    let fract = sf
        .as_bytes()
        .get(4)
        .filter(|b| b.is_ascii_digit())
        .map(|b| (b - b'0') as usize)
        .unwrap_or(0);
    if fract > 0 {
        let micros = format!("{:06}", now.nanosecond() / 1000);
        out.push('.');
        if fract <= 6 {
            out.push_str(&micros[..fract]);
        } else {
            out.push_str(&micros);
            for _ in 6..fract {
                out.push('0');
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn ec_signer() -> LocalSigner {
        LocalSigner::new(SigningKey::P256(p256::ecdsa::SigningKey::random(&mut OsRng)))
    }

    fn signing_args(sf: &str) -> FieldStore {
        let mut args = FieldStore::new();
        args.set_text("da", "sha256");
        args.set_text("sf", sf);
        args.set_text("b", "F~f");
        args
    }

    #[test]
    fn dry_run_reserves_hex_ceiling() {
        let signer = ec_signer();
        let mut args = signing_args("hex");
        signer.dry_run(&mut args).unwrap();
        assert_eq!(args.get_u32_index("@sigsize", 0), 72 * 2);
    }

    #[test]
    fn dry_run_includes_date_prefix() {
        let signer = ec_signer();
        let mut args = signing_args("date3:hex");
        signer.dry_run(&mut args).unwrap();
        assert_eq!(args.get_u32_index("@sigsize", 0) as usize, 72 * 2 + 18 + 1);
    }

    #[test]
    fn signature_fills_placeholder_exactly() {
        let signer = ec_signer();
        let mut args = signing_args("hex");
        signer.dry_run(&mut args).unwrap();
        args.set("@digest1", HashAlg::Sha256.digest(b"payload"), FieldKind::Binary);
        signer.sign(&mut args).unwrap();
        let want = args.get_u32_index("@sigsize", 0) as usize;
        assert_eq!(args.len_of("@signatureenc"), want);
    }

    #[test]
    fn dated_signature_carries_sigdate() {
        let signer = ec_signer();
        let mut args = signing_args("date2:base64");
        signer.dry_run(&mut args).unwrap();
        args.set("@digest1", HashAlg::Sha256.digest(b"payload"), FieldKind::Binary);
        signer.sign(&mut args).unwrap();
        let date = args.text("@sigdate");
        assert_eq!(date.len(), 17); // 14 + '.' + 2
        let enc = args.text("@signatureenc");
        assert!(enc.starts_with(&format!("{date}:")));
    }

    #[test]
    fn sigdate_shape() {
        let d = make_sigdate("date:hex");
        assert_eq!(d.len(), 14);
        assert!(d.chars().all(|c| c.is_ascii_digit()));
        let d6 = make_sigdate("date6:hex");
        assert_eq!(d6.len(), 21);
        assert_eq!(&d6[14..15], ".");
    }

    #[test]
    fn signed_digest_verifies_with_public_key() {
        use crate::keys::PublicKey;
        let signer = ec_signer();
        let mut args = signing_args("hex");
        signer.dry_run(&mut args).unwrap();
        let d = HashAlg::Sha256.digest(b"the digest input");
        args.set("@digest1", d.clone(), FieldKind::Binary);
        signer.sign(&mut args).unwrap();

        let der = signer.key().public_key_der().unwrap();
        let public = PublicKey::from_der("ec", &der).unwrap();
        let enc = args.text("@signatureenc");
        let sigbin = encode::hex_decode(enc.trim_end().as_bytes()).unwrap();
        assert!(public.verify_digest(HashAlg::Sha256, &d, &sigbin));
        // corrupting the digest fails
        assert!(!public.verify_digest(HashAlg::Sha256, b"other digest....", &sigbin));
    }
}
