//! PDF walker.
//!
//! Signed PDFs carry the record in a comment line `%%<seal .../>`
//! inserted immediately before the final `%%EOF`. Scanning covers the
//! whole body: records can only appear in comments or streams the
//! record grammar will not mistake for anything else.

use crate::formats::{self, Walker};
use crate::store::FieldStore;
use crate::writer;
use crate::{verify, Context, Error, Result};

pub struct Pdf;

impl Walker for Pdf {
    fn name(&self) -> &'static str {
        "PDF"
    }

    fn matches(&self, data: &[u8]) -> bool {
        if data.len() < 20 || !data.starts_with(b"%PDF") {
            return false;
        }
        final_eof(data).is_some()
    }

    fn process(&self, ctx: &mut Context, args: &mut FieldStore, data: &[u8]) -> Result<()> {
        verify::verify_window(ctx, args, 0, data.len(), data, None);
        if ctx.mode.is_signing() {
            let eof = final_eof(data)
                .ok_or_else(|| Error::Format("Truncated or invalid PDF".into()))?;
            sign(ctx, args, data, eof)?;
        }
        Ok(())
    }
}

/// Offset of the final `%%EOF` marker (start of the line), ignoring
/// trailing whitespace.
fn final_eof(data: &[u8]) -> Option<usize> {
    let mut end = data.len();
    while end > 20 && data[end - 1].is_ascii_whitespace() {
        end -= 1;
    }
    if end < 5 || &data[end - 5..end] != b"%%EOF" {
        return None;
    }
    // a newline must precede the marker
    if !matches!(data.get(end - 6), Some(b'\r') | Some(b'\n')) {
        return None;
    }
    Some(end - 5)
}

fn sign(ctx: &mut Context, args: &mut FieldStore, data: &[u8], eof_at: usize) -> Result<()> {
    formats::standard_range(args);
    let record = formats::prepare_record(args)?;

    let mut block = b"%%".to_vec();
    args.inc_index("@s", 0, block.len());
    args.inc_index("@s", 1, block.len());
    block.extend_from_slice(&record);
    block.extend_from_slice(b"\r\n");

    let mut out = writer::splice(data, eof_at, &block);
    writer::promote_offsets(args, eof_at);
    writer::finalize(ctx, args, &mut out, None)?;
    writer::write_output(args, &out)
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn tiny_pdf() -> Vec<u8> {
        b"%PDF-1.4\n1 0 obj\n<< /Type /Catalog >>\nendobj\ntrailer\n<< /Root 1 0 R >>\n%%EOF\n"
            .to_vec()
    }

    #[test]
    fn magic_and_eof_detection() {
        let pdf = tiny_pdf();
        assert!(Pdf.matches(&pdf));
        let at = final_eof(&pdf).unwrap();
        assert_eq!(&pdf[at..at + 5], b"%%EOF");
        assert!(!Pdf.matches(b"%PDF-1.4\nno end marker here........"));
    }
}
