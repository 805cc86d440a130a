//! Text, XML, SVG, and HTML handling.
//!
//! Plain text gets a `<seal .../>` record at end of file. XML-like text
//! gets an `<?seal ...?>` processing instruction inserted before the
//! root element (first signature only — later signatures append). The
//! file's newline convention (CR, LF, CRLF) is preserved around the
//! inserted record.

use crate::formats::{self, Walker};
use crate::store::FieldStore;
use crate::writer;
use crate::{verify, Context, Result};

pub struct Text;

impl Walker for Text {
    fn name(&self) -> &'static str {
        "Text"
    }

    fn matches(&self, data: &[u8]) -> bool {
        is_utf8(data)
    }

    fn process(&self, ctx: &mut Context, args: &mut FieldStore, data: &[u8]) -> Result<()> {
        process_with_preface(ctx, args, data, None)
    }
}

/// The sidecar driver routes through here with the source media as the
/// digest preface.
pub fn process_with_preface(
    ctx: &mut Context,
    args: &mut FieldStore,
    data: &[u8],
    preface: Option<&[u8]>,
) -> Result<()> {
    verify::verify_window(ctx, args, 0, data.len(), data, preface);
    if ctx.mode.is_signing() {
        sign(ctx, args, data, preface)?;
    }
    Ok(())
}

/// UTF-8 sniff over the first kilobyte. Accepts ASCII controls that
/// render as whitespace and well-formed 2-4 byte sequences.
pub(crate) fn is_utf8(data: &[u8]) -> bool {
    if data.len() < 8 {
        return false;
    }
    let mut i = 0;
    while i + 5 < data.len() && i < 1000 {
        let b = data[i];
        if b.is_ascii_whitespace() || b.is_ascii_graphic() || b == b' ' {
            i += 1;
        } else if (0x7f..0xa0).contains(&b) {
            // U+007F-U+009F: discouraged but valid
            i += 1;
        } else if (0xc2..=0xdf).contains(&b) && is_cont(data[i + 1]) {
            i += 2;
        } else if (0xe0..=0xef).contains(&b) && is_cont(data[i + 1]) && is_cont(data[i + 2]) {
            i += 3;
        } else if (0xf0..=0xf4).contains(&b)
            && is_cont(data[i + 1])
            && is_cont(data[i + 2])
            && is_cont(data[i + 3])
        {
            i += 4;
        } else {
            return false;
        }
    }
    true
}

fn is_cont(b: u8) -> bool {
    (0x80..=0xbf).contains(&b)
}

/// Find the offset of the XML root element, if the buffer looks like
/// XML: prologue items (`<?...?>`, `<!...>`) may precede it; the root
/// starts with `<` followed by an alpha, `_`, or `:`.
fn find_xml_root(data: &[u8]) -> Option<usize> {
    let mut i = 0;
    while i < data.len() && data[i].is_ascii_whitespace() {
        i += 1;
    }
    if i >= data.len() || data[i] != b'<' {
        return None;
    }
    while i < data.len() {
        while i < data.len() && data[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= data.len() || data[i] != b'<' {
            return None;
        }
        let next = *data.get(i + 1)?;
        if next == b'?' || next == b'!' {
            // prologue: skip through the closing '>'
            while i < data.len() && data[i] != b'>' {
                i += 1;
            }
            i += 1;
            continue;
        }
        if next.is_ascii_alphabetic() || next == b'_' || next == b':' {
            return Some(i);
        }
        return None;
    }
    None
}

/// First newline convention in the file: `b'\r'` for CRLF, `b'\n'` for
/// LF, otherwise the first whitespace byte seen (0 when none).
fn newline_style(data: &[u8]) -> u8 {
    let mut style = 0u8;
    for (i, &b) in data.iter().enumerate() {
        if style == 0 && b.is_ascii_whitespace() {
            style = b;
        }
        if b == b'\n' {
            return if i > 0 && data[i - 1] == b'\r' { b'\r' } else { b'\n' };
        }
    }
    style
}

fn push_newline(block: &mut Vec<u8>, style: u8) {
    match style {
        b'\r' => block.extend_from_slice(b"\r\n"),
        b'\n' => block.push(b'\n'),
        0 => {}
        other => block.push(other),
    }
}

fn sign(
    ctx: &mut Context,
    args: &mut FieldStore,
    data: &[u8],
    preface: Option<&[u8]>,
) -> Result<()> {
    let root = find_xml_root(data);
    let is_xml = root.is_some();
    // XML inserts before the root, but only for the first signature;
    // appended signatures always land at EOF.
    let mut insert_at = match root {
        Some(at) if args.get_index("@s", 2) == 0 => at,
        _ => data.len(),
    };
    if formats::has_option(args, "append") {
        insert_at = data.len();
    }
    let style = newline_style(data);

    formats::standard_range(args);
    let record = formats::prepare_record(args)?;

    let mut block = Vec::new();
    if !is_xml {
        push_newline(&mut block, style);
    }
    if is_xml {
        // reshape <seal .../> into <?seal ...?>
        args.inc_index("@s", 0, block.len() + 1);
        args.inc_index("@s", 1, block.len() + 1);
        block.extend_from_slice(b"<?");
        block.extend_from_slice(&record[1..record.len() - 2]);
        block.extend_from_slice(b"?>");
    } else {
        args.inc_index("@s", 0, block.len());
        args.inc_index("@s", 1, block.len());
        block.extend_from_slice(&record);
    }
    push_newline(&mut block, style);

    let mut out = writer::splice(data, insert_at, &block);
    writer::promote_offsets(args, insert_at);
    writer::finalize(ctx, args, &mut out, preface)?;
    writer::write_output(args, &out)
}
