//! Canonical record emission.
//!
//! Builds the `<seal .../>` text for signing into `@record`. The
//! signature value is either the finished `@signatureenc` or, before the
//! digest exists, a placeholder padded to exactly `@sigsize` bytes; the
//! final signature must be byte-identical in size. `@S[0]`/`@S[1]` hold
//! the placeholder's offsets relative to the record; walkers promote
//! them to absolute file offsets in `@s` once the insertion point is
//! known.

use crate::encode;
use crate::store::{FieldKind, FieldStore};

/// Emission order for every attribute ahead of `d=` and `s=`.
const FIELDS: &[&str] = &[
    "seal", "kv", "ka", "da", "sf", "comment", "copyright", "info", "src", "srca", "srcd",
    "id", "b",
];

/// Cyclic filler for the signature placeholder. Anything ASCII works;
/// the bytes are overwritten in place once the signature is computed.
const PLACEHOLDER_FILL: &str = "abcdefghij";

/// Emit the canonical record into `@record` and set `@S`.
pub fn build(args: &mut FieldStore) {
    args.set_text("@record", "<seal");

    for &field in FIELDS {
        if !args.is_set(field) {
            continue;
        }
        let encoded = encode::str_encode(args.bytes(field));
        args.append_text("@record", " ");
        args.append_text("@record", field);
        args.append_text("@record", "=\"");
        args.append("@record", &encoded);
        args.append_text("@record", "\"");
    }

    args.append_text("@record", " d=\"");
    let domain = args.text("d");
    args.append_text("@record", &domain);
    args.append_text("@record", "\"");

    // Inline public key rides in the record itself.
    if args.is_set("pk") {
        let pk = encode::str_encode(args.bytes("pk"));
        args.append_text("@record", " pk=\"");
        args.append("@record", &pk);
        args.append_text("@record", "\"");
    }

    args.append_text("@record", " s=\"");
    args.set_index("@S", 0, args.len_of("@record"));
    // Walkers promote these record-relative offsets to file-absolute
    // once the insertion point is known; @s[2] (the ordinal) survives.
    args.set_index("@s", 0, args.len_of("@record"));

    if args.is_set("@signatureenc") {
        let sig = args.bytes("@signatureenc").to_vec();
        args.append("@record", &sig);
    } else {
        let size = args.get_u32_index("@sigsize", 0) as usize;
        args.append_pad("@record", size, PLACEHOLDER_FILL);
    }

    args.set_index("@S", 1, args.len_of("@record"));
    args.set_index("@s", 1, args.len_of("@record"));
    args.append_text("@record", "\"/>");
    args.set_kind("@record", FieldKind::Text);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse;

    fn base_args() -> FieldStore {
        let mut args = FieldStore::new();
        args.set_text("seal", "1");
        args.set_text("kv", "1");
        args.set_text("ka", "rsa");
        args.set_text("da", "sha256");
        args.set_text("sf", "hex");
        args.set_text("b", "F~S,s~f");
        args.set_text("d", "example.com");
        args
    }

    #[test]
    fn placeholder_matches_sigsize() {
        let mut args = base_args();
        args.set_u32_index("@sigsize", 0, 512);
        build(&mut args);
        let s0 = args.get_index("@S", 0);
        let s1 = args.get_index("@S", 1);
        assert_eq!(s1 - s0, 512);
        let rec = args.bytes("@record");
        assert!(rec.starts_with(b"<seal seal=\"1\" kv=\"1\" ka=\"rsa\""));
        assert!(rec.ends_with(b"\"/>"));
    }

    #[test]
    fn finished_signature_is_embedded_verbatim() {
        let mut args = base_args();
        args.set_text("@signatureenc", "cafef00d");
        build(&mut args);
        let rec = args.bytes("@record").to_vec();
        let s0 = args.get_index("@S", 0);
        assert_eq!(&rec[s0..s0 + 8], b"cafef00d");
    }

    #[test]
    fn round_trip_preserves_attributes() {
        let mut args = base_args();
        args.set_text("info", "it's \"quoted\"");
        args.set_text("id", "alice");
        args.set_u32_index("@sigsize", 0, 16);
        build(&mut args);
        let rec = args.bytes("@record").to_vec();
        let parsed = parse::parse(&rec, 0, None).expect("round trip");
        for key in ["seal", "kv", "ka", "da", "sf", "b", "d", "id", "info"] {
            assert_eq!(parsed.text(key), args.text(key), "attribute {key}");
        }
    }

    #[test]
    fn empty_fields_are_skipped() {
        let mut args = base_args();
        args.set_text("comment", "");
        args.set_u32_index("@sigsize", 0, 8);
        build(&mut args);
        let rec = args.text("@record");
        assert!(!rec.contains("comment"));
    }

    #[test]
    fn inline_key_lands_between_domain_and_signature() {
        let mut args = base_args();
        args.set_text("pk", "AAAA");
        args.set_u32_index("@sigsize", 0, 8);
        build(&mut args);
        let rec = args.text("@record");
        let d = rec.find(" d=").unwrap();
        let pk = rec.find(" pk=").unwrap();
        let s = rec.find(" s=").unwrap();
        assert!(d < pk && pk < s);
    }
}
