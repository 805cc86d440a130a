//! Byte-range digest engine.
//!
//! Evaluates the `b=` expression against a file and feeds the selected
//! ranges through the nominated hash. A segment is `lhs~rhs` where each
//! side is a signed sum of integer literals and anchors:
//!
//! | anchor | meaning |
//! |---|---|
//! | `F` | 0 (start of file) |
//! | `f` | file length |
//! | `S` | start of the current signature (`@s[0]`) |
//! | `s` | one past the end of the current signature (`@s[1]`) |
//! | `P` | start of the previous signature (`@p[0]`) |
//! | `p` | one past the end of the previous signature (`@p[1]`) |
//!
//! Results land in `@digest1` (raw bytes) with the evaluated ranges in
//! `@digestrange`. The anchors seen on the left and right side of each
//! segment accumulate in `@sflags0`/`@sflags1`; `@sflags` is their
//! concatenation. Soft failures land in `@error`.

use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};

use crate::store::{FieldKind, FieldStore};

/// Digest algorithms accepted for `da=` and `pka=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlg {
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlg {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "" | "sha256" => Some(HashAlg::Sha256),
            "sha224" => Some(HashAlg::Sha224),
            "sha384" => Some(HashAlg::Sha384),
            "sha512" => Some(HashAlg::Sha512),
            _ => None,
        }
    }

    /// Digest size in bytes.
    pub fn size(self) -> usize {
        match self {
            HashAlg::Sha224 => 28,
            HashAlg::Sha256 => 32,
            HashAlg::Sha384 => 48,
            HashAlg::Sha512 => 64,
        }
    }

    pub fn hasher(self) -> Hasher {
        match self {
            HashAlg::Sha224 => Hasher::S224(Sha224::new()),
            HashAlg::Sha256 => Hasher::S256(Sha256::new()),
            HashAlg::Sha384 => Hasher::S384(Sha384::new()),
            HashAlg::Sha512 => Hasher::S512(Sha512::new()),
        }
    }

    /// One-shot convenience.
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        let mut h = self.hasher();
        h.update(data);
        h.finalize()
    }
}

/// Incremental hash over whichever algorithm the record nominated.
pub enum Hasher {
    S224(Sha224),
    S256(Sha256),
    S384(Sha384),
    S512(Sha512),
}

impl Hasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::S224(h) => h.update(data),
            Hasher::S256(h) => h.update(data),
            Hasher::S384(h) => h.update(data),
            Hasher::S512(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Vec<u8> {
        match self {
            Hasher::S224(h) => h.finalize().to_vec(),
            Hasher::S256(h) => h.finalize().to_vec(),
            Hasher::S384(h) => h.finalize().to_vec(),
            Hasher::S512(h) => h.finalize().to_vec(),
        }
    }
}

/// Range-expression state machine states. States 0-2 read the left
/// offset, 3-5 the right; `~` switches sides and `,` closes a segment.
const VALID: [&[u8]; 6] = [
    b"+-pPsSfF0123456789~",
    b"+-~",
    b"pPsSfF0123456789",
    b"+-pPsSfF0123456789,",
    b"+-,",
    b"pPsSfF0123456789",
];

/// Evaluate `b=` against `file` and store the digest in `@digest1`.
///
/// When a `preface` is supplied (sidecar verification), its full content
/// is hashed once, immediately before the first segment whose evaluation
/// touched an `F` or `P` anchor. This binds the source media into the
/// digest without it appearing in the signed text.
pub fn compute(args: &mut FieldStore, file: &[u8], preface: Option<&[u8]>) {
    args.delete("@error");
    args.delete("@digestrange");
    args.delete("@digest1");
    args.delete("@digest2");
    args.delete("@sflags0");
    args.delete("@sflags1");

    let s = [args.get_index("@s", 0) as i128, args.get_index("@s", 1) as i128];
    let p = [args.get_index("@p", 0) as i128, args.get_index("@p", 1) as i128];
    let flen = file.len() as i128;

    let da = args.text("da");
    let alg = match HashAlg::from_name(&da) {
        Some(a) => a,
        None => {
            args.set_text("@error", &format!("Unknown digest algorithm (da={da})"));
            return;
        }
    };
    let mut hasher = alg.hasher();

    let b = args.text("b");
    let expr = b.as_bytes();
    let mut state = 0usize;
    let mut acc: i128 = 0;
    let mut sign: i128 = 1;
    let mut sum: [i128; 2] = [0, 0];
    let mut preface_due = false;
    let mut preface_done = false;

    let mut flags0 = String::new();
    let mut flags1 = String::new();

    macro_rules! fail {
        ($msg:expr) => {{
            args.set_text("@error", &$msg);
            return;
        }};
    }

    let mut i = 0;
    while i < expr.len() {
        let c = expr[i];
        if !VALID[state].contains(&c) {
            fail!(format!("Invalid range in b='{b}'"));
        }
        match c {
            b'+' | b'-' => {
                let side = if state < 3 { 0 } else { 1 };
                sum[side] += acc * sign;
                state = if state < 3 { 2 } else { 5 };
                sign = if c == b'+' { 1 } else { -1 };
                acc = 0;
            }
            b'S' | b's' | b'P' | b'p' | b'F' | b'f' => {
                let value = match c {
                    b'S' => s[0],
                    b's' => s[1],
                    b'P' => p[0],
                    b'p' => p[1],
                    b'F' => 0,
                    _ => flen,
                };
                if c == b'F' || c == b'P' {
                    preface_due = true;
                }
                let side = if state < 3 { 0 } else { 1 };
                sum[side] += value * sign;
                if side == 0 {
                    flags0.push(c as char);
                    state = 1;
                } else {
                    flags1.push(c as char);
                    state = 4;
                }
                acc = 0;
            }
            b'0'..=b'9' => {
                acc = acc * 10 + (c - b'0') as i128;
                state = if state < 3 { 0 } else { 3 };
            }
            b'~' => {
                sum[0] += acc * sign;
                acc = 0;
                sign = 1;
                state = 3;
            }
            b',' => {
                // No right-hand value means end of file.
                if state == 3 && acc == 0 {
                    sum[1] = flen;
                } else {
                    sum[1] += acc * sign;
                }
                // Comma-closed segments must evaluate within the file
                // even when they are empty.
                if let Err(msg) = check_range_strict(&b, sum, flen) {
                    fail!(msg);
                }
                hash_segment(
                    args,
                    &mut hasher,
                    file,
                    preface,
                    sum,
                    &mut preface_due,
                    &mut preface_done,
                );
                state = 0;
                acc = 0;
                sum = [0, 0];
                sign = 1;
            }
            _ => unreachable!("filtered by VALID"),
        }
        i += 1;
    }

    // Trailing segment without a closing comma.
    if state == 3 {
        if acc == 0 {
            sum[1] = flen;
        } else {
            sum[1] += acc * sign;
        }
        state = 4;
    }
    match state {
        0 => {}
        4 => {
            if let Err(msg) = check_range(&b, sum, flen) {
                fail!(msg);
            }
            hash_segment(
                args,
                &mut hasher,
                file,
                preface,
                sum,
                &mut preface_due,
                &mut preface_done,
            );
        }
        5 => {
            sum[1] += acc * sign;
            if let Err(msg) = check_range(&b, sum, flen) {
                fail!(msg);
            }
        }
        _ => fail!(format!("Invalid range in b='{b}' at end of string")),
    }

    args.set("@digest1", hasher.finalize(), FieldKind::Binary);
    args.set_text("@sflags0", &flags0);
    args.set_text("@sflags1", &flags1);
    let joined = format!("{flags0}{flags1}");
    args.set_text("@sflags", &joined);
}

/// Trailing segments tolerate an empty range wherever it lands.
fn check_range(b: &str, sum: [i128; 2], flen: i128) -> Result<(), String> {
    if sum[0] == sum[1] {
        return Ok(());
    }
    check_range_strict(b, sum, flen)
}

fn check_range_strict(b: &str, sum: [i128; 2], flen: i128) -> Result<(), String> {
    let mut msg = format!("Invalid range in b='{b}'");
    let mut bad = false;
    if sum[0] < 0 || sum[0] > flen {
        msg.push_str("; underflow");
        bad = true;
    }
    if sum[1] < 0 || sum[1] > flen {
        msg.push_str("; overflow");
        bad = true;
    }
    if sum[1] < sum[0] {
        msg.push_str("; range begins after it ends");
        bad = true;
    }
    if bad {
        Err(msg)
    } else {
        Ok(())
    }
}

fn hash_segment(
    args: &mut FieldStore,
    hasher: &mut Hasher,
    file: &[u8],
    preface: Option<&[u8]>,
    sum: [i128; 2],
    preface_due: &mut bool,
    preface_done: &mut bool,
) {
    if sum[1] <= sum[0] {
        return;
    }
    if *preface_due && !*preface_done {
        if let Some(pre) = preface {
            hasher.update(pre);
        }
        *preface_done = true;
        *preface_due = false;
    }
    let (lo, hi) = (sum[0] as usize, sum[1] as usize);
    args.push_index("@digestrange", lo);
    args.push_index("@digestrange", hi);
    hasher.update(&file[lo..hi]);
}

/// Bind `@sigdate` and `id` into the digest:
/// `@digest2 = H([sigdate:][id:]digest1)`.
///
/// Runs only when at least one of the two is non-empty; the signer and
/// verifier both call this after the primary digest.
pub fn double_digest(args: &mut FieldStore) {
    let sigdate = args.text("@sigdate");
    let id = args.text("id");
    if sigdate.is_empty() && id.is_empty() {
        return;
    }
    if !args.is_set("@digest1") {
        if !args.contains("@error") {
            args.set_text("@error", "Digest not computed");
        }
        return;
    }
    let da = args.text("da");
    let alg = match HashAlg::from_name(&da) {
        Some(a) => a,
        None => {
            args.set_text("@error", &format!("Unknown digest algorithm (da={da})"));
            return;
        }
    };
    let mut h = alg.hasher();
    if !sigdate.is_empty() {
        h.update(sigdate.as_bytes());
        h.update(b":");
    }
    if !id.is_empty() {
        h.update(id.as_bytes());
        h.update(b":");
    }
    h.update(args.bytes("@digest1"));
    args.set("@digest2", h.finalize(), FieldKind::Binary);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_with(b: &str, s: (usize, usize), p: (usize, usize)) -> FieldStore {
        let mut args = FieldStore::new();
        args.set_text("da", "sha256");
        args.set_text("b", b);
        args.set_index("@s", 0, s.0);
        args.set_index("@s", 1, s.1);
        args.set_index("@p", 0, p.0);
        args.set_index("@p", 1, p.1);
        args
    }

    #[test]
    fn anchor_arithmetic_and_flags() {
        // b="F~S,s+5-2~f", S=100, s=200, |F|=1000
        let file = vec![0u8; 1000];
        let mut args = args_with("F~S,s+5-2~f", (100, 200), (0, 0));
        compute(&mut args, &file, None);
        assert!(!args.contains("@error"), "{}", args.text("@error"));
        assert_eq!(args.indexes("@digestrange"), vec![0, 100, 203, 1000]);
        assert_eq!(args.text("@sflags0"), "Fs");
        assert_eq!(args.text("@sflags1"), "Sf");
        assert_eq!(args.text("@sflags"), "FsSf");
    }

    #[test]
    fn empty_ranges_hash_nothing() {
        let file = b"0123456789".to_vec();
        let mut args = args_with("F~F,f~f", (0, 0), (0, 0));
        compute(&mut args, &file, None);
        assert!(!args.contains("@error"));
        assert_eq!(args.bytes("@digest1"), HashAlg::Sha256.digest(b"").as_slice());
    }

    #[test]
    fn empty_comma_segment_must_stay_in_bounds() {
        let file = vec![0u8; 10];
        // An empty range is fine in general, but a comma-closed segment
        // evaluated past the end of file is still an error.
        let mut args = args_with("99~99,F~f", (0, 0), (0, 0));
        compute(&mut args, &file, None);
        assert!(args.text("@error").contains("underflow"));

        // The same empty out-of-bounds range as the trailing segment is
        // tolerated.
        let mut args = args_with("F~f,99~99", (0, 0), (0, 0));
        compute(&mut args, &file, None);
        assert!(!args.contains("@error"));
        assert_eq!(args.indexes("@digestrange"), vec![0, 10]);
    }

    #[test]
    fn whole_file_once() {
        let file = b"hello, seal".to_vec();
        let mut args = args_with("F~f", (0, 0), (0, 0));
        compute(&mut args, &file, None);
        assert_eq!(args.bytes("@digest1"), HashAlg::Sha256.digest(&file).as_slice());
        assert_eq!(args.indexes("@digestrange"), vec![0, file.len()]);
    }

    #[test]
    fn zero_length_signature_equals_whole_file() {
        let file = b"some file content".to_vec();
        let mut whole = args_with("F~f", (0, 0), (0, 0));
        compute(&mut whole, &file, None);
        let mut split = args_with("F~S,s~f", (5, 5), (0, 0));
        compute(&mut split, &file, None);
        assert_eq!(whole.bytes("@digest1"), split.bytes("@digest1"));
    }

    #[test]
    fn signature_at_eof_validates() {
        let file = vec![7u8; 64];
        let mut args = args_with("F~S,s~f", (32, 64), (0, 0));
        compute(&mut args, &file, None);
        assert!(!args.contains("@error"));
        assert_eq!(args.indexes("@digestrange"), vec![0, 32]);
    }

    #[test]
    fn out_of_range_is_an_error() {
        let file = vec![0u8; 10];
        let mut args = args_with("F~20", (0, 0), (0, 0));
        compute(&mut args, &file, None);
        assert!(args.text("@error").contains("overflow"));

        let mut args = args_with("5~2", (0, 0), (0, 0));
        compute(&mut args, &file, None);
        assert!(args.text("@error").contains("range begins after it ends"));

        let mut args = args_with("F-9~f", (0, 0), (0, 0));
        compute(&mut args, &file, None);
        assert!(args.text("@error").contains("underflow"));
    }

    #[test]
    fn unknown_algorithm_is_an_error() {
        let file = vec![0u8; 4];
        let mut args = args_with("F~f", (0, 0), (0, 0));
        args.set_text("da", "md5");
        compute(&mut args, &file, None);
        assert!(args.text("@error").contains("Unknown digest algorithm"));
    }

    #[test]
    fn default_rhs_is_end_of_file() {
        let file = vec![3u8; 100];
        let mut args = args_with("10~", (0, 0), (0, 0));
        compute(&mut args, &file, None);
        assert_eq!(args.indexes("@digestrange"), vec![10, 100]);
    }

    #[test]
    fn preface_is_hashed_before_file_start() {
        let media = b"source media bytes".to_vec();
        let sidecar = b"sidecar text".to_vec();
        let mut args = args_with("F~f", (0, 0), (0, 0));
        compute(&mut args, &sidecar, Some(&media));

        let mut h = HashAlg::Sha256.hasher();
        h.update(&media);
        h.update(&sidecar);
        assert_eq!(args.bytes("@digest1"), h.finalize().as_slice());
    }

    #[test]
    fn double_digest_binds_date_and_id() {
        // digest2 = H("date:id:" || digest1)
        let file = b"file-bytes".to_vec();
        let mut args = args_with("F~f", (0, 0), (0, 0));
        args.set_text("id", "alice");
        args.set_text("@sigdate", "20240101000000");
        compute(&mut args, &file, None);
        double_digest(&mut args);

        let d1 = HashAlg::Sha256.digest(&file);
        let mut h = HashAlg::Sha256.hasher();
        h.update(b"20240101000000:alice:");
        h.update(&d1);
        assert_eq!(args.bytes("@digest2"), h.finalize().as_slice());
    }

    #[test]
    fn double_digest_skipped_without_date_or_id() {
        let file = b"x".to_vec();
        let mut args = args_with("F~f", (0, 0), (0, 0));
        compute(&mut args, &file, None);
        double_digest(&mut args);
        assert!(!args.contains("@digest2"));
    }
}
