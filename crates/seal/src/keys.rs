//! Key resolution: DNS TXT retrieval, caching, local overrides, and
//! inline record keys.
//!
//! Public keys are distributed as DNS TXT records of the form
//! `seal=1 ka=rsa kv=1 p=<base64 DER> [uid=...] [r=date]`. The resolver
//! keeps a per-run cache keyed by lowercase domain; each cached entry is
//! the TXT text parsed into a field store with `p`/`pkd` pre-decoded
//! into `@p-bin`/`@pkd-bin`. A synthetic `@default` domain holds one
//! static record loaded from a local file when the operator supplied
//! one. Negative lookups are cached as an empty list so a repeat query
//! short-circuits.
//!
//! The cache does not check revocation or parameter fit; revocation is
//! date-sensitive and parameter requirements vary by caller, so the
//! caller filters.

use std::collections::HashMap;
use std::path::Path;

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::Resolver;
use pkcs8::DecodePublicKey;
use signature::hazmat::PrehashVerifier;
use tracing::debug;

use crate::digest::HashAlg;
use crate::store::{FieldKind, FieldStore};
use crate::{encode, parse, Error, Result};

/// Is this a `ka=` value the crate can use?
pub fn known_key_algorithm(ka: &str) -> bool {
    matches!(
        ka,
        "rsa" | "ec" | "P-256" | "prime256v1" | "secp256r1" | "P-384" | "secp384r1"
    )
}

/// A verifying key decoded from SubjectPublicKeyInfo DER.
pub enum PublicKey {
    Rsa(rsa::RsaPublicKey),
    P256(p256::ecdsa::VerifyingKey),
    P384(p384::ecdsa::VerifyingKey),
}

impl PublicKey {
    /// Decode DER, guided by the record's `ka=`.
    pub fn from_der(ka: &str, der: &[u8]) -> Result<Self> {
        if ka == "rsa" {
            return rsa::RsaPublicKey::from_public_key_der(der)
                .map(PublicKey::Rsa)
                .map_err(|e| Error::Key(format!("bad RSA public key: {e}")));
        }
        if let Ok(k) = p256::ecdsa::VerifyingKey::from_public_key_der(der) {
            return Ok(PublicKey::P256(k));
        }
        if let Ok(k) = p384::ecdsa::VerifyingKey::from_public_key_der(der) {
            return Ok(PublicKey::P384(k));
        }
        Err(Error::Key(format!("bad public key for ka={ka}")))
    }

    /// Verify `sig` over a precomputed digest. RSA uses PKCS#1 v1.5 with
    /// the digest algorithm's prefix; EC expects a DER-encoded ECDSA
    /// signature.
    pub fn verify_digest(&self, alg: HashAlg, digest: &[u8], sig: &[u8]) -> bool {
        match self {
            PublicKey::Rsa(key) => {
                let padding = match alg {
                    HashAlg::Sha224 => rsa::Pkcs1v15Sign::new::<sha2::Sha224>(),
                    HashAlg::Sha256 => rsa::Pkcs1v15Sign::new::<sha2::Sha256>(),
                    HashAlg::Sha384 => rsa::Pkcs1v15Sign::new::<sha2::Sha384>(),
                    HashAlg::Sha512 => rsa::Pkcs1v15Sign::new::<sha2::Sha512>(),
                };
                key.verify(padding, digest, sig).is_ok()
            }
            PublicKey::P256(key) => match p256::ecdsa::Signature::from_der(sig) {
                Ok(s) => key.verify_prehash(digest, &s).is_ok(),
                Err(_) => false,
            },
            PublicKey::P384(key) => match p384::ecdsa::Signature::from_der(sig) {
                Ok(s) => key.verify_prehash(digest, &s).is_ok(),
                Err(_) => false,
            },
        }
    }
}

/// Per-run DNS TXT cache plus the `@default` local override.
#[derive(Default)]
pub struct KeyResolver {
    cache: HashMap<String, Vec<FieldStore>>,
    resolver: Option<Resolver>,
    /// When set, uncached domains are never queried over the network.
    pub no_net: bool,
}

impl KeyResolver {
    pub fn new() -> Self {
        KeyResolver::default()
    }

    /// Load a static TXT record from a file into the `@default` domain.
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let data = std::fs::read(path.as_ref())?;
        if data.len() < 10 || data.len() > 4096 {
            return Err(Error::Key(format!(
                "DNS file {} is not a TXT record",
                path.as_ref().display()
            )));
        }
        let text = String::from_utf8_lossy(&data).trim_end().to_string();
        self.load_default(&text)
    }

    /// Load a static TXT value (the file content form of `p=...` line).
    pub fn load_default(&mut self, txt: &str) -> Result<()> {
        match parse_txt(txt) {
            Some(rec) => {
                self.cache.entry("@default".into()).or_default().push(rec);
                Ok(())
            }
            None => Err(Error::Key("DNS file does not hold a SEAL record".into())),
        }
    }

    /// Preload a TXT record for a specific domain (tests, offline use).
    pub fn preload(&mut self, domain: &str, txt: &str) -> Result<()> {
        match parse_txt(txt) {
            Some(rec) => {
                self.cache.entry(domain.to_ascii_lowercase()).or_default().push(rec);
                Ok(())
            }
            None => Err(Error::Key("not a SEAL TXT record".into())),
        }
    }

    /// Make sure the domain has been looked up, querying the network at
    /// most once per run.
    fn populate(&mut self, domain: &str) {
        let key = domain.to_ascii_lowercase();
        if key.is_empty() || self.cache.contains_key(&key) {
            return;
        }
        if self.no_net {
            return;
        }
        let mut found = Vec::new();
        for txt in self.query_txt(domain) {
            if let Some(rec) = parse_txt(&txt) {
                found.push(rec);
            }
        }
        debug!(domain = %key, records = found.len(), "DNS TXT lookup");
        // An empty list is the negative-cache marker.
        self.cache.insert(key, found);
    }

    fn query_txt(&mut self, domain: &str) -> Vec<String> {
        if self.resolver.is_none() {
            let r = Resolver::from_system_conf()
                .or_else(|_| Resolver::new(ResolverConfig::default(), ResolverOpts::default()));
            match r {
                Ok(r) => self.resolver = Some(r),
                Err(e) => {
                    debug!(error = %e, "cannot initialize DNS resolver");
                    return Vec::new();
                }
            }
        }
        let resolver = self.resolver.as_ref().expect("set above");
        match resolver.txt_lookup(domain) {
            Ok(lookup) => lookup
                .iter()
                .map(|txt| {
                    // RFC-1035 character-strings concatenate in order.
                    let bytes: Vec<u8> = txt
                        .txt_data()
                        .iter()
                        .flat_map(|chunk| chunk.iter().copied())
                        .collect();
                    String::from_utf8_lossy(&bytes).into_owned()
                })
                .collect(),
            Err(e) => {
                debug!(domain, error = %e, "TXT lookup failed");
                Vec::new()
            }
        }
    }

    /// Return the n-th TXT record satisfying the request's `seal`, `ka`,
    /// `kv`, and `uid`. Falls back to `@default` records when the domain
    /// itself has no match.
    pub fn resolve(&mut self, args: &FieldStore, nth: usize) -> Option<&FieldStore> {
        let domain = args.text("d").to_ascii_lowercase();
        self.populate(&domain);

        let matches = |rec: &&FieldStore| txt_matches(args, rec);
        let from_domain = self
            .cache
            .get(&domain)
            .map(|list| list.iter().filter(matches).count())
            .unwrap_or(0);
        if from_domain > 0 {
            return self
                .cache
                .get(&domain)
                .and_then(|list| list.iter().filter(matches).nth(nth));
        }
        self.cache
            .get("@default")
            .and_then(|list| list.iter().filter(matches).nth(nth))
    }

    /// How many TXT records would satisfy the request.
    pub fn count(&mut self, args: &FieldStore) -> usize {
        let domain = args.text("d").to_ascii_lowercase();
        self.populate(&domain);
        let matches = |rec: &&FieldStore| txt_matches(args, rec);
        let n = self
            .cache
            .get(&domain)
            .map(|list| list.iter().filter(matches).count())
            .unwrap_or(0);
        if n > 0 {
            return n;
        }
        self.cache
            .get("@default")
            .map(|list| list.iter().filter(matches).count())
            .unwrap_or(0)
    }
}

/// Parse one TXT value into a cached record. Wraps the text in
/// `<seal ... />` and runs the record parser; rejects values that do not
/// begin with `seal=<digit>` or that name an unusable key algorithm.
fn parse_txt(txt: &str) -> Option<FieldStore> {
    let trimmed = txt.trim();
    if !trimmed.starts_with("seal=") || !trimmed[5..].starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }
    let wrapped = format!("<seal {trimmed} />");
    let mut rec = parse::parse(wrapped.as_bytes(), 0, None)?;

    if rec.is_set("ka") && !known_key_algorithm(&rec.text("ka")) {
        return None;
    }
    if !rec.contains("kv") {
        rec.set_text("kv", "1");
    }
    if !rec.contains("uid") {
        rec.set_text("uid", "");
    }
    if rec.contains("p") {
        if let Some(bin) = encode::base64_decode(rec.bytes("p")) {
            rec.set("@p-bin", bin, FieldKind::Binary);
        }
    }
    if rec.contains("pkd") {
        if let Some(bin) = encode::base64_decode(rec.bytes("pkd")) {
            rec.set("@pkd-bin", bin, FieldKind::Binary);
        }
    }
    Some(rec)
}

/// Does the cached TXT record fit the request?
fn txt_matches(args: &FieldStore, rec: &FieldStore) -> bool {
    let want = |key: &str, default: &str| {
        let v = args.text(key);
        if v.is_empty() { default.to_string() } else { v }
    };
    let have = |key: &str, default: &str| {
        let v = rec.text(key);
        if v.is_empty() { default.to_string() } else { v }
    };
    if want("seal", "1") != have("seal", "1") {
        return false;
    }
    if want("ka", "") != have("ka", "") {
        return false;
    }
    if want("kv", "1") != have("kv", "1") {
        return false;
    }
    if want("uid", "") != have("uid", "") {
        return false;
    }
    true
}

/// Inline-key authentication: when a record carries `pk`, check
/// `H_pka(base64decode(pk)) == pkd`. A mismatch poisons the record via
/// `@error`; on success the caller may use `pk` as the public key, but
/// the verdict stays "not authenticated" because nothing binds the key
/// to the claimed domain.
pub fn inline_authenticate(args: &mut FieldStore) {
    let pk = args.text("pk");
    let pkd = args.text("pkd");
    let pka = args.text("pka");
    if pk.is_empty() || pkd.is_empty() || pka.is_empty() {
        return;
    }
    let alg = match HashAlg::from_name(&pka) {
        Some(a) => a,
        None => {
            args.set_text("@error", "Unsupported public key digest algorithm (pka)");
            return;
        }
    };
    let pk_bin = match encode::base64_decode(pk.as_bytes()) {
        Some(b) if !b.is_empty() => b,
        _ => {
            args.set_text("@error", "Failed to base64 decode public key (pk)");
            return;
        }
    };
    let calc = encode::base64_encode(&alg.digest(&pk_bin));
    // The recorded pkd may omit base64 padding.
    if calc.trim_end_matches('=') != pkd.trim_end_matches('=') {
        args.set_text("@error", "public key digest (pkd) mismatch");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(d: &str, ka: &str, kv: &str, uid: &str) -> FieldStore {
        let mut args = FieldStore::new();
        args.set_text("seal", "1");
        args.set_text("d", d);
        args.set_text("ka", ka);
        args.set_text("kv", kv);
        args.set_text("uid", uid);
        args
    }

    #[test]
    fn preloaded_record_resolves_with_filters() {
        let mut resolver = KeyResolver::new();
        resolver.no_net = true;
        resolver
            .preload("example.com", "seal=1 ka=rsa kv=2 p=QUJD")
            .unwrap();

        let hit = request("example.com", "rsa", "2", "");
        assert!(resolver.resolve(&hit, 0).is_some());
        assert_eq!(resolver.count(&hit), 1);

        let wrong_kv = request("example.com", "rsa", "1", "");
        assert!(resolver.resolve(&wrong_kv, 0).is_none());

        let wrong_ka = request("example.com", "ec", "2", "");
        assert!(resolver.resolve(&wrong_ka, 0).is_none());
    }

    #[test]
    fn kv_defaults_to_one_on_both_sides() {
        let mut resolver = KeyResolver::new();
        resolver.no_net = true;
        resolver.preload("example.com", "seal=1 ka=rsa p=QUJD").unwrap();
        let req = request("example.com", "rsa", "1", "");
        assert!(resolver.resolve(&req, 0).is_some());
    }

    #[test]
    fn default_domain_backstops_missing_domains() {
        let mut resolver = KeyResolver::new();
        resolver.no_net = true;
        resolver.load_default("seal=1 ka=rsa p=QUJD").unwrap();
        let req = request("anything.example", "rsa", "1", "");
        assert!(resolver.resolve(&req, 0).is_some());
    }

    #[test]
    fn no_net_uncached_is_absent() {
        let mut resolver = KeyResolver::new();
        resolver.no_net = true;
        let req = request("nonexistent.example", "rsa", "1", "");
        assert!(resolver.resolve(&req, 0).is_none());
        assert_eq!(resolver.count(&req), 0);
    }

    #[test]
    fn txt_without_seal_prefix_is_rejected() {
        assert!(parse_txt("v=spf1 include:example.com").is_none());
        assert!(parse_txt("seal=x ka=rsa p=QUJD").is_none());
        assert!(parse_txt("seal=1 ka=unknownalg p=QUJD").is_none());
    }

    #[test]
    fn p_decodes_at_insert_time() {
        let rec = parse_txt("seal=1 ka=rsa p=QUJD").unwrap();
        assert_eq!(rec.bytes("@p-bin"), b"ABC");
    }

    #[test]
    fn inline_pkd_mismatch_sets_error() {
        let mut args = FieldStore::new();
        args.set_text("pk", &encode::base64_encode(b"some-der"));
        args.set_text("pka", "sha256");
        args.set_text("pkd", "bm90LXRoZS1kaWdlc3Q=");
        inline_authenticate(&mut args);
        assert!(args.text("@error").contains("pkd"));
    }

    #[test]
    fn inline_pkd_match_passes() {
        let der = b"some-der-bytes";
        let mut args = FieldStore::new();
        args.set_text("pk", &encode::base64_encode(der));
        args.set_text("pka", "sha256");
        args.set_text("pkd", &encode::base64_encode(&HashAlg::Sha256.digest(der)));
        inline_authenticate(&mut args);
        assert!(!args.contains("@error"));
    }
}
