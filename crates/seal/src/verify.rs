//! Signature verification and verdict classification.
//!
//! Per record: decode the signature components, evaluate the byte
//! range, apply the double digest, then try every DNS TXT candidate in
//! order — checking revocation before the cryptographic verify. The
//! outcome folds into a verdict bitmask that ORs across the whole batch
//! into the process exit code.

use tracing::debug;

use crate::digest::{self, HashAlg};
use crate::keys::{self, PublicKey};
use crate::store::{FieldKind, FieldStore};
use crate::{encode, Context};

/// Verdict bits. `VALID` is the absence of all of them.
pub mod verdict {
    pub const VALID: u8 = 0x00;
    /// Signature mismatch (or malformed record).
    pub const INVALID: u8 = 0x01;
    /// Record present but `s=` absent.
    pub const UNSIGNED: u8 = 0x02;
    /// No matching TXT record and no inline key.
    pub const UNRESOLVED: u8 = 0x04;
    /// Inline key verified but nothing binds it to the domain.
    pub const UNAUTHENTICATED: u8 = 0x08;
    /// The key or this signature's date is revoked.
    pub const REVOKED: u8 = 0x10;
}

/// Route a warning to both the human report and `@warnings` (the latter
/// so tests and callers can observe them).
fn warn_user(rec: &mut FieldStore, msg: &str) {
    println!("WARNING: {msg}");
    rec.append_text("@warnings", msg);
    rec.append_text("@warnings", "\n");
}

/// Verify one parsed record against the file bytes. Returns the verdict
/// bits for this record and ORs them into the context.
pub fn verify_record(
    ctx: &mut Context,
    rec: &mut FieldStore,
    file: &[u8],
    preface: Option<&[u8]>,
) -> u8 {
    let v = classify(ctx, rec, file, preface);
    ctx.verdicts |= v;
    report(rec, v);
    // Advisory: bind the external source reference, warning only.
    if rec.is_set("srcd") {
        crate::srcref::verify_source(rec);
    }
    v
}

fn classify(
    ctx: &mut Context,
    rec: &mut FieldStore,
    file: &[u8],
    preface: Option<&[u8]>,
) -> u8 {
    let signum = rec.get_index("@s", 2);

    // Every emitted record includes s=; every verified record must.
    if !rec.is_set("s") {
        rec.set_text("@error", "no signature found");
        return verdict::UNSIGNED;
    }

    if !rec.is_set("b") {
        rec.set_text("b", "F~S,s~f");
    }

    // Prepend/insertion coverage warnings. A verify that passes under a
    // range that skips the start of file proves nothing about content
    // prepended before the covered region.
    let b = rec.text("b");
    if signum <= 1 {
        if !b.contains('F') {
            warn_user(
                rec,
                &format!(
                    "SEAL record #{signum} does not cover the start of file. Vulnerable to prepending attacks."
                ),
            );
        }
    } else if !b.contains('F') && !b.contains('P') {
        warn_user(
            rec,
            &format!(
                "SEAL record #{signum} does not cover the previous signature. Vulnerable to insertion attacks."
            ),
        );
    }

    if decode_parts(rec).is_err() {
        return verdict::INVALID;
    }

    digest::compute(rec, file, preface);
    digest::double_digest(rec);
    if rec.contains("@error") {
        return verdict::INVALID;
    }
    let da = rec.text("da");
    let alg = match HashAlg::from_name(&da) {
        Some(a) => a,
        None => return verdict::INVALID,
    };
    let digest_bytes = if rec.is_set("@digest2") {
        rec.bytes("@digest2").to_vec()
    } else {
        rec.bytes("@digest1").to_vec()
    };
    let sigbin = rec.bytes("@sigbin").to_vec();

    // Walk the DNS candidates.
    let count = ctx.resolver.count(rec);
    if count == 0 {
        return inline_fallback(rec, alg, &digest_bytes, &sigbin);
    }

    let mut revoked_seen = false;
    for nth in 0..count {
        let txt = match ctx.resolver.resolve(rec, nth) {
            Some(t) => t.clone(),
            None => break,
        };
        match candidate_revocation(&txt, &rec.text("@sigdate")) {
            Revocation::KeyDead => {
                revoked_seen = true;
                continue;
            }
            Revocation::DateRevoked => {
                // The key still exists; confirm the signature actually
                // belongs to it before calling it revoked.
                if verify_with(&txt, alg, &digest_bytes, &sigbin) {
                    revoked_seen = true;
                    continue;
                }
                continue;
            }
            Revocation::Live => {}
        }
        if verify_with(&txt, alg, &digest_bytes, &sigbin) {
            return verdict::VALID;
        }
    }
    if revoked_seen {
        rec.set_text("@error", "public key revoked");
        verdict::REVOKED
    } else {
        rec.set_text("@error", "signature mismatch");
        verdict::INVALID
    }
}

/// No DNS binding: fall back to a key carried inline in the record.
fn inline_fallback(rec: &mut FieldStore, alg: HashAlg, digest: &[u8], sigbin: &[u8]) -> u8 {
    if !rec.is_set("pk") {
        rec.set_text("@error", "no DNS entry found");
        return verdict::UNRESOLVED;
    }
    keys::inline_authenticate(rec);
    if rec.contains("@error") {
        return verdict::INVALID;
    }
    let der = match encode::base64_decode(rec.bytes("pk")) {
        Some(d) => d,
        None => {
            rec.set_text("@error", "public key failed to base64 decode");
            return verdict::INVALID;
        }
    };
    let key = match PublicKey::from_der(&rec.text("ka"), &der) {
        Ok(k) => k,
        Err(e) => {
            rec.set_text("@error", &e.to_string());
            return verdict::INVALID;
        }
    };
    if key.verify_digest(alg, digest, sigbin) {
        // The signature checks out but nothing ties the key to the
        // claimed domain.
        verdict::UNAUTHENTICATED
    } else {
        rec.set_text("@error", "signature mismatch");
        verdict::INVALID
    }
}

fn verify_with(txt: &FieldStore, alg: HashAlg, digest: &[u8], sigbin: &[u8]) -> bool {
    let der = txt.bytes("@p-bin");
    if der.is_empty() {
        return false;
    }
    match PublicKey::from_der(&txt.text("ka"), der) {
        Ok(key) => key.verify_digest(alg, digest, sigbin),
        Err(e) => {
            debug!(error = %e, "cached TXT record holds an unusable key");
            false
        }
    }
}

enum Revocation {
    Live,
    /// `p=` absent, empty, or literal `revoke`: nothing signed under
    /// this key can ever validate.
    KeyDead,
    /// `r=` names a no-longer-trusted-after moment at or before this
    /// signature's date.
    DateRevoked,
}

/// `p` empty, absent, or `revoke` kills the key outright. An
/// `r=` date revokes signatures without a date, and any whose date
/// compares `>= r` digit-by-digit over the common prefix.
fn candidate_revocation(txt: &FieldStore, sigdate: &str) -> Revocation {
    let p = txt.text("p");
    if p.is_empty() || p.eq_ignore_ascii_case("revoke") {
        return Revocation::KeyDead;
    }
    if !txt.is_set("r") {
        return Revocation::Live;
    }
    if sigdate.is_empty() {
        return Revocation::DateRevoked;
    }
    // Digit-wise compare across the common prefix; non-digits in r are
    // skipped so ISO-8601 punctuation is tolerated.
    let r_digits: Vec<u8> = txt
        .text("r")
        .bytes()
        .filter(|b| b.is_ascii_digit())
        .collect();
    let s_bytes = sigdate.as_bytes();
    let mut si = 0;
    for &rd in &r_digits {
        if si >= s_bytes.len() {
            // Signature date ran out first: r is longer, sig is older.
            return Revocation::Live;
        }
        let sd = s_bytes[si];
        if !sd.is_ascii_digit() {
            return Revocation::DateRevoked;
        }
        if rd < sd {
            return Revocation::DateRevoked;
        }
        if rd > sd {
            return Revocation::Live;
        }
        si += 1;
    }
    // Equal through the end of r: revoked at exactly r.
    Revocation::DateRevoked
}

/// Split the `s=` value into `@sigdate` and the decoded `@sigbin`.
fn decode_parts(rec: &mut FieldStore) -> Result<(), ()> {
    let sf = rec.text("sf");
    let sig_full = rec.text("s");
    // Trailing spaces are placeholder padding, not signature.
    let sig = sig_full.trim_end_matches(' ');

    rec.delete("@sigdate");
    let mut datelen = 0;
    if sf.starts_with("date") {
        datelen = crate::sign::date_len(&sf);
        let bytes = sig.as_bytes();
        if sig.len() <= datelen + 2
            || bytes.get(datelen) != Some(&b':')
            || (datelen > 14 && bytes.get(14) != Some(&b'.'))
        {
            rec.set_text("@error", "signature date does not match the specified format");
            return Err(());
        }
        rec.set_text("@sigdate", &sig[..datelen]);
        datelen += 1; // step over ':'
    }

    let payload = &sig.as_bytes()[datelen..];
    let bin = if sf.contains("hex") || sf.contains("HEX") {
        match encode::hex_decode(payload) {
            Some(b) if !b.is_empty() => b,
            _ => {
                rec.set_text("@error", "hex signature failed to decode");
                return Err(());
            }
        }
    } else if sf.contains("base64") {
        match encode::base64_decode(payload) {
            Some(b) if !b.is_empty() => b,
            _ => {
                rec.set_text("@error", "base64 signature failed to decode");
                return Err(());
            }
        }
    } else if sf.contains("bin") {
        payload.to_vec()
    } else {
        rec.set_text("@error", "unsupported signature encoding");
        return Err(());
    };
    rec.set("@sigbin", bin, FieldKind::Binary);
    Ok(())
}

/// Human-readable per-record report, mirroring the original tool's
/// output shape.
fn report(rec: &FieldStore, v: u8) {
    let signum = rec.get_index("@s", 2);
    match v {
        verdict::VALID => println!("SEAL record #{signum} is valid."),
        verdict::UNAUTHENTICATED => println!(
            "SEAL record #{signum} is signed with an inline key; signature verifies but is not authenticated."
        ),
        _ => {
            let msg = rec.text("@error");
            println!("SEAL record #{signum} is invalid: {msg}.");
            return;
        }
    }

    let date = rec.text("@sigdate");
    if date.len() >= 14 {
        println!(
            " Signed {}-{}-{} at {}:{}:{}{} GMT",
            &date[0..4],
            &date[4..6],
            &date[6..8],
            &date[8..10],
            &date[10..12],
            &date[12..14],
            &date[14..]
        );
    }
    let mut by = format!(" Signed by {}", rec.text("d"));
    let id = rec.text("id");
    if !id.is_empty() {
        by.push_str(&format!(" for {id}"));
    }
    println!("{by}");
    for (key, label) in [("copyright", "Copyright"), ("info", "Comment")] {
        let v = rec.text(key);
        if !v.is_empty() {
            println!(" {label}: {v}");
        }
    }
}

/// Scan a window for every record and verify each in file order. The
/// n-th record sees `@p` holding the (n-1)-th record's `@s`; `@sflags`
/// carries forward so walkers can pick append-aware ranges later.
pub fn verify_window(
    ctx: &mut Context,
    args: &mut FieldStore,
    start: usize,
    end: usize,
    file: &[u8],
    preface: Option<&[u8]>,
) {
    let mut at = start;
    while at < end {
        let mut rec = match crate::parse::parse(&file[at..end], at, Some(args)) {
            Some(r) => r,
            None => return,
        };
        verify_record(ctx, &mut rec, file, preface);

        let rec_end = rec.get_index("@RecEnd", 0).max(1);
        at += rec_end;

        // Retain cross-record state on the caller's store.
        for key in ["@p", "@s", "@sflags", "@sflags0", "@sflags1", "@warnings"] {
            if rec.contains(key) {
                args.copy_from(key, &rec, key);
            }
        }
    }
}

/// After all records: a file whose last signature does not reach the
/// end of file can have data appended without detection.
pub fn check_final(args: &mut FieldStore) -> bool {
    if args.get_index("@s", 2) == 0 {
        return false;
    }
    if !args.text("@sflags1").contains('f') {
        warn_user(
            args,
            "SEAL records do not finalize the file. Data may be appended.",
        );
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txt_with(fields: &[(&str, &str)]) -> FieldStore {
        let mut t = FieldStore::new();
        for (k, v) in fields {
            t.set_text(k, v);
        }
        t
    }

    #[test]
    fn revocation_date_rules() {
        // r=20240601 is the no-longer-trusted-after moment
        let txt = txt_with(&[("p", "QUJD"), ("r", "20240601")]);
        assert!(matches!(
            candidate_revocation(&txt, "20240501120000"),
            Revocation::Live
        ));
        assert!(matches!(
            candidate_revocation(&txt, "20240701120000"),
            Revocation::DateRevoked
        ));
        // exactly at the boundary moment: revoked
        assert!(matches!(
            candidate_revocation(&txt, "20240601000000"),
            Revocation::DateRevoked
        ));
        // no date on the signature at all: revoked
        assert!(matches!(
            candidate_revocation(&txt, ""),
            Revocation::DateRevoked
        ));
    }

    #[test]
    fn iso8601_punctuation_in_r_is_tolerated() {
        let txt = txt_with(&[("p", "QUJD"), ("r", "2024-06-01T00:00:00")]);
        assert!(matches!(
            candidate_revocation(&txt, "20240501120000"),
            Revocation::Live
        ));
        assert!(matches!(
            candidate_revocation(&txt, "20240701120000"),
            Revocation::DateRevoked
        ));
    }

    #[test]
    fn empty_or_revoke_key_is_dead() {
        let t = txt_with(&[("p", "")]);
        assert!(matches!(candidate_revocation(&t, "2024"), Revocation::KeyDead));
        let t = txt_with(&[("p", "revoke")]);
        assert!(matches!(candidate_revocation(&t, "2024"), Revocation::KeyDead));
        let t = txt_with(&[]);
        assert!(matches!(candidate_revocation(&t, "2024"), Revocation::KeyDead));
    }

    #[test]
    fn decode_parts_strips_date_and_padding() {
        let mut rec = FieldStore::new();
        rec.set_text("sf", "date:hex");
        rec.set_text("s", "20240101000000:cafef00d   ");
        assert!(decode_parts(&mut rec).is_ok());
        assert_eq!(rec.text("@sigdate"), "20240101000000");
        assert_eq!(rec.bytes("@sigbin"), &[0xca, 0xfe, 0xf0, 0x0d]);
    }

    #[test]
    fn decode_parts_rejects_wrong_date_shape() {
        let mut rec = FieldStore::new();
        rec.set_text("sf", "date3:hex");
        rec.set_text("s", "20240101000000:cafe"); // missing .FFF
        assert!(decode_parts(&mut rec).is_err());
    }

    #[test]
    fn decode_parts_unknown_encoding() {
        let mut rec = FieldStore::new();
        rec.set_text("sf", "rot13");
        rec.set_text("s", "whatever");
        assert!(decode_parts(&mut rec).is_err());
        assert!(rec.text("@error").contains("unsupported"));
    }

    #[test]
    fn missing_signature_is_unsigned() {
        let mut ctx = Context::new(crate::Mode::Verify);
        ctx.resolver.no_net = true;
        let mut rec = FieldStore::new();
        rec.set_text("seal", "1");
        rec.set_index("@s", 2, 1);
        let v = verify_record(&mut ctx, &mut rec, b"data", None);
        assert_eq!(v, verdict::UNSIGNED);
    }

    #[test]
    fn unresolved_without_dns_or_inline_key() {
        let mut ctx = Context::new(crate::Mode::Verify);
        ctx.resolver.no_net = true;
        let file = b"<seal seal=\"1\" b=\"F~S,s~f\" da=\"sha256\" sf=\"hex\" ka=\"rsa\" d=\"missing.example\" s=\"cafe\"/>".to_vec();
        let mut args = FieldStore::new();
        verify_window(&mut ctx, &mut args, 0, file.len(), &file, None);
        assert_eq!(ctx.verdicts & verdict::UNRESOLVED, verdict::UNRESOLVED);
    }

    #[test]
    fn prepend_warning_for_uncovered_start() {
        let mut ctx = Context::new(crate::Mode::Verify);
        ctx.resolver.no_net = true;
        let file = b"<seal seal=\"1\" b=\"S~f\" da=\"sha256\" sf=\"hex\" ka=\"rsa\" d=\"missing.example\" s=\"cafe\"/>".to_vec();
        let mut args = FieldStore::new();
        verify_window(&mut ctx, &mut args, 0, file.len(), &file, None);
        assert!(args.text("@warnings").contains("does not cover the start of file"));
    }
}
