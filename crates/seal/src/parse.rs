//! SEAL record parser.
//!
//! Scans a byte window for a record in one of three skins:
//!
//! - `<seal KEY="VAL" .../>` (plain)
//! - `<?seal KEY="VAL" ...?>` (XML processing instruction)
//! - `&lt;seal KEY="VAL" ... /&gt;` (entity-escaped, XMP-style)
//!
//! This is not an XML parser; it is a small tokenizer that finds the
//! start token, reads `KEY=VAL` pairs, and stops at the matching end
//! token. For the `s=` attribute it records the *encoded* value's byte
//! offsets so the signature can later be located (and, when signing,
//! overwritten) inside the file.

use tracing::warn;

use crate::encode;
use crate::store::FieldStore;

#[derive(Clone, Copy, PartialEq)]
enum Skin {
    Plain,
    Entity,
    Instruction,
}

/// Scan `window` for the first SEAL record.
///
/// `base` is the absolute offset of `window` within its source file;
/// the returned store's `@s[0]`/`@s[1]` are absolute. `@s[2]` is the
/// ordinal (previous count + 1) and `@p` receives the previous record's
/// `@s`, both taken from `prev`. `@RecEnd` is set to one past the end
/// of the record, relative to the window, enabling iterative scans.
pub fn parse(window: &[u8], base: usize, prev: Option<&FieldStore>) -> Option<FieldStore> {
    if window.len() < 10 {
        return None;
    }
    let mut from = 0;
    while from + 10 <= window.len() {
        let (start, skin, body) = match find_start(window, from) {
            Some(hit) => hit,
            None => return None,
        };
        if let Some((mut rec, end)) = parse_attributes(window, body, skin, base, prev) {
            rec.set_index("@RecEnd", 0, end);
            return Some(rec);
        }
        from = start + 1;
    }
    None
}

fn find_start(window: &[u8], from: usize) -> Option<(usize, Skin, usize)> {
    for i in from..window.len() {
        let rest = &window[i..];
        if rest.starts_with(b"<seal ") {
            return Some((i, Skin::Plain, i + 6));
        }
        if rest.starts_with(b"&lt;seal ") {
            return Some((i, Skin::Entity, i + 9));
        }
        if rest.len() >= 7 && rest[..7].eq_ignore_ascii_case(b"<?seal ") {
            return Some((i, Skin::Instruction, i + 7));
        }
    }
    None
}

/// Tokenize `KEY=VAL` pairs starting at `i`. Returns the populated store
/// and the window-relative end offset, or `None` if the candidate does
/// not parse as a record.
fn parse_attributes(
    window: &[u8],
    mut i: usize,
    skin: Skin,
    base: usize,
    prev: Option<&FieldStore>,
) -> Option<(FieldStore, usize)> {
    let mut rec = FieldStore::new();
    let len = window.len();

    loop {
        // ----- looking for an attribute name -----
        while i < len && window[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= len {
            return None;
        }
        let rest = &window[i..];
        match skin {
            Skin::Plain => {
                if rest.starts_with(b">") {
                    return Some((rec, finish_plain(window, i)));
                }
                if rest.starts_with(b"/>") || rest.starts_with(b"</") {
                    return Some((rec, finish_plain(window, i)));
                }
                if window[i] == b'<' {
                    return None;
                }
            }
            Skin::Instruction => {
                if rest.starts_with(b"?>") {
                    return Some((rec, i + 2));
                }
                if window[i] == b'<' || window[i] == b'>' {
                    return None;
                }
            }
            Skin::Entity => {
                if rest.starts_with(b"&gt;") {
                    return Some((rec, i + 4));
                }
                if rest.starts_with(b"/&gt;") {
                    return Some((rec, i + 5));
                }
                if rest.starts_with(b"&lt;/") {
                    return Some((rec, i + 5));
                }
                if rest.starts_with(b"&lt;") {
                    return None;
                }
            }
        }
        if !window[i].is_ascii_alphabetic() {
            return None;
        }
        let name_start = i;
        while i < len && window[i].is_ascii_alphanumeric() {
            i += 1;
        }
        if i >= len || window[i] != b'=' {
            return None;
        }
        let name = String::from_utf8_lossy(&window[name_start..i]).into_owned();
        i += 1;

        // ----- attribute value, possibly quoted -----
        let mut quote: u8 = 0; // 0 unquoted, 1 = &quot;, else the quote byte
        if i < len && (window[i] == b'"' || window[i] == b'\'') {
            quote = window[i];
            i += 1;
        } else if skin != Skin::Plain && window[i..].starts_with(b"&quot;") {
            quote = 1;
            i += 6;
        }
        let vs = i;
        let mut ve = None;
        while i < len {
            if window[i] == b'\\' {
                i += 2;
                continue;
            }
            match quote {
                0 => {
                    if window[i] == b' ' || window[i] == b'<' || window[i] == b'>' {
                        ve = Some(i);
                        break;
                    }
                }
                1 => {
                    if window[i..].starts_with(b"&quot;") {
                        ve = Some(i);
                        i += 6;
                        break;
                    }
                }
                q => {
                    if window[i] == q {
                        ve = Some(i);
                        i += 1;
                        break;
                    }
                }
            }
            i += 1;
        }
        let ve = ve?;

        if rec.contains(&name) {
            warn!(attribute = %name, "attribute redefined inside one record");
        }

        if name == "s" {
            rec.set_index("@s", 0, base + vs);
            rec.set_index("@s", 1, base + ve);
            let ordinal = prev.map(|p| p.get_index("@s", 2)).unwrap_or(0) + 1;
            rec.set_index("@s", 2, ordinal);
            if let Some(p) = prev {
                // previous record's signature position anchors P/p
                rec.copy_from("@p", p, "@s");
            }
        }

        let raw = &window[vs..ve];
        let decoded = if quote == 1 {
            encode::xml_decode(raw)
        } else {
            encode::str_decode(raw)
        };
        rec.set(&name, decoded, crate::store::FieldKind::Text);

        // ----- make sure the value ends properly -----
        if i >= len {
            return None;
        }
        if window[i].is_ascii_whitespace() {
            i += 1;
            continue;
        }
        match skin {
            _ if matches!(window[i], b'<' | b'>' | b'/') => {
                return Some((rec, finish_plain(window, i)));
            }
            Skin::Instruction if window[i..].starts_with(b"?>") => {
                return Some((rec, i + 2));
            }
            Skin::Entity
                if window[i..].starts_with(b"&lt;") || window[i..].starts_with(b"&gt;") =>
            {
                while i + 4 <= len && !window[i..].starts_with(b"&gt;") {
                    i += 1;
                }
                if window[i..].starts_with(b"&gt;") {
                    i += 4;
                }
                return Some((rec, i));
            }
            _ => return None,
        }
    }
}

/// Consume through the closing `>` of a plain or instruction record.
fn finish_plain(window: &[u8], mut i: usize) -> usize {
    while i < window.len() && window[i] != b'>' {
        i += 1;
    }
    if i < window.len() {
        i += 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_record() {
        let text = b"junk <seal seal=\"1\" d=\"example.com\" s=\"abcd1234\"/> trailer";
        let rec = parse(text, 0, None).expect("record");
        assert_eq!(rec.text("seal"), "1");
        assert_eq!(rec.text("d"), "example.com");
        assert_eq!(rec.text("s"), "abcd1234");
        let s0 = rec.get_index("@s", 0);
        let s1 = rec.get_index("@s", 1);
        assert_eq!(&text[s0..s1], b"abcd1234");
        assert_eq!(rec.get_index("@s", 2), 1);
        // @RecEnd lands one past the closing '>'
        let end = rec.get_index("@RecEnd", 0);
        assert_eq!(&text[end - 2..end], b"/>");
    }

    #[test]
    fn instruction_record() {
        let text = b"<?xml version=\"1.0\"?>\n<?seal seal=\"1\" d=\"x.org\" s=\"00ff\"?>\n<svg/>";
        let rec = parse(text, 0, None).expect("record");
        assert_eq!(rec.text("d"), "x.org");
        let s0 = rec.get_index("@s", 0);
        assert_eq!(&text[s0..s0 + 4], b"00ff");
    }

    #[test]
    fn entity_record() {
        let text = b"<x:seal>&lt;seal seal=&quot;1&quot; d=&quot;e.com&quot; s=&quot;beef&quot;/&gt;</x:seal>";
        let rec = parse(text, 0, None).expect("record");
        assert_eq!(rec.text("seal"), "1");
        assert_eq!(rec.text("d"), "e.com");
        assert_eq!(rec.text("s"), "beef");
    }

    #[test]
    fn offsets_are_window_relative_plus_base() {
        let text = b"<seal seal=\"1\" d=\"a.b\" s=\"cafe\"/>";
        let rec = parse(text, 5000, None).expect("record");
        let s0 = rec.get_index("@s", 0);
        assert_eq!(&text[s0 - 5000..s0 - 5000 + 4], b"cafe");
    }

    #[test]
    fn ordinal_and_previous_rotate() {
        let text = b"<seal seal=\"1\" d=\"a.b\" s=\"1111\"/> <seal seal=\"1\" d=\"a.b\" s=\"2222\"/>";
        let first = parse(text, 0, None).expect("first");
        let end = first.get_index("@RecEnd", 0);
        let second = parse(&text[end..], end, Some(&first)).expect("second");
        assert_eq!(second.get_index("@s", 2), 2);
        assert_eq!(second.get_index("@p", 0), first.get_index("@s", 0));
        assert_eq!(second.get_index("@p", 1), first.get_index("@s", 1));
    }

    #[test]
    fn backslash_quoting_in_value() {
        let text = br#"<seal seal="1" info="say \"hi\"" d="a.b" s="00"/>"#;
        let rec = parse(text, 0, None).expect("record");
        assert_eq!(rec.text("info"), "say \"hi\"");
    }

    #[test]
    fn no_record_in_noise() {
        assert!(parse(b"this is not a seal record at all", 0, None).is_none());
        assert!(parse(b"<sealant seal=1>", 0, None).is_none());
    }

    #[test]
    fn later_duplicate_overrides() {
        let text = b"<seal seal=\"1\" d=\"one\" d=\"two\" s=\"00\"/>";
        let rec = parse(text, 0, None).expect("record");
        assert_eq!(rec.text("d"), "two");
    }
}
