//! PNG walker.
//!
//! PNG is a chunk stream: `len(4) | fourcc(4) | data | crc(4)`. Records
//! may live in any casing of `seal`, `text`, or `itxt` chunks; new
//! signatures go into a `seAl` chunk (casing selectable through `-O`)
//! inserted immediately before `IEND`. The chunk CRC is computed after
//! the final signature lands, so the digest range skips the 4 CRC bytes
//! that trail the record (`s+7~f`: 3 for the closing `"/>` plus the
//! CRC).

use tracing::warn;

use crate::formats::{self, Walker};
use crate::store::FieldStore;
use crate::writer;
use crate::{verify, Context, Error, Result};

const MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";

pub struct Png;

impl Walker for Png {
    fn name(&self) -> &'static str {
        "PNG"
    }

    fn matches(&self, data: &[u8]) -> bool {
        data.len() >= 20 && data.starts_with(MAGIC)
    }

    fn process(&self, ctx: &mut Context, args: &mut FieldStore, data: &[u8]) -> Result<()> {
        let mut offset = 8usize;
        let mut iend = None;
        while offset + 12 <= data.len() {
            let size = u32::from_be_bytes(data[offset..offset + 4].try_into().expect("sized")) as usize;
            let fourcc = &data[offset + 4..offset + 8];
            if offset + 12 + size > data.len() {
                warn!("PNG chunk overruns the file; stopping the walk");
                break;
            }
            if fourcc == b"IEND" {
                iend = Some(offset);
                break;
            }
            // Signatures cannot hide in compressed zTXt; scan only the
            // plain-text capable chunks.
            if fourcc.eq_ignore_ascii_case(b"text")
                || fourcc.eq_ignore_ascii_case(b"itxt")
                || fourcc.eq_ignore_ascii_case(b"seal")
            {
                verify::verify_window(ctx, args, offset + 8, offset + 8 + size, data, None);
            }
            offset += size + 12;
        }

        if ctx.mode.is_signing() {
            let iend = iend.ok_or_else(|| Error::Format("PNG is corrupted; no IEND".into()))?;
            sign(ctx, args, data, iend)?;
        }
        Ok(())
    }
}

/// `-O` may carry an alternate chunk casing (`SEAL`, `teXt`, ...); PNG
/// requires the third letter uppercase. `text`-family chunks start with
/// a `seal\0` keyword.
fn chunk_name(args: &FieldStore) -> (Vec<u8>, bool) {
    let options = args.text("options");
    let bytes = options.as_bytes();
    for i in 0..bytes.len().saturating_sub(3) {
        let candidate = &bytes[i..i + 4];
        if !candidate[2].is_ascii_uppercase() {
            continue;
        }
        if candidate.eq_ignore_ascii_case(b"seal") {
            return (candidate.to_vec(), false);
        }
        if candidate.eq_ignore_ascii_case(b"text") {
            return (candidate.to_vec(), true);
        }
    }
    (b"seAl".to_vec(), false)
}

fn sign(ctx: &mut Context, args: &mut FieldStore, data: &[u8], iend: usize) -> Result<()> {
    let (name, is_text_chunk) = chunk_name(args);

    let mut b = formats::range_start(args, "F");
    b.push_str("~S,s~s+3");
    if !formats::has_option(args, "append") {
        b.push_str(",s+7~f"); // skip the post-hoc CRC
    }
    args.set_text("b", &b);

    let record = formats::prepare_record(args)?;

    // len | name | [keyword] | record | crc
    let keyword: &[u8] = if is_text_chunk { b"seal\0" } else { b"" };
    let datalen = keyword.len() + record.len();
    let mut block = Vec::with_capacity(datalen + 12);
    block.extend_from_slice(&(datalen as u32).to_be_bytes());
    block.extend_from_slice(&name);
    block.extend_from_slice(keyword);
    block.extend_from_slice(&record);
    block.extend_from_slice(&[0u8; 4]); // CRC patched post-signature

    let header = 8 + keyword.len();
    args.inc_index("@s", 0, header);
    args.inc_index("@s", 1, header);

    let mut out = writer::splice(data, iend, &block);
    writer::promote_offsets(args, iend);
    writer::finalize(ctx, args, &mut out, None)?;

    // CRC covers fourcc + data, not the length or itself.
    let crc_at = iend + block.len() - 4;
    let crc = crc32fast::hash(&out[iend + 4..crc_at]);
    out[crc_at..crc_at + 4].copy_from_slice(&crc.to_be_bytes());

    writer::write_output(args, &out)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal well-formed PNG: header, IHDR, IEND.
    pub(crate) fn tiny_png() -> Vec<u8> {
        let mut png = MAGIC.to_vec();
        let ihdr_data: &[u8] = &[0, 0, 0, 1, 0, 0, 0, 1, 8, 0, 0, 0, 0];
        png.extend_from_slice(&(ihdr_data.len() as u32).to_be_bytes());
        png.extend_from_slice(b"IHDR");
        png.extend_from_slice(ihdr_data);
        let mut crc_input = b"IHDR".to_vec();
        crc_input.extend_from_slice(ihdr_data);
        png.extend_from_slice(&crc32fast::hash(&crc_input).to_be_bytes());
        png.extend_from_slice(&0u32.to_be_bytes());
        png.extend_from_slice(b"IEND");
        png.extend_from_slice(&crc32fast::hash(b"IEND").to_be_bytes());
        png
    }

    #[test]
    fn magic_detection() {
        assert!(Png.matches(&tiny_png()));
        assert!(!Png.matches(b"\x89PNJ\r\n\x1a\nxxxxxxxxxxxxxxxx"));
    }

    #[test]
    fn chunk_name_from_options() {
        let mut args = FieldStore::new();
        assert_eq!(chunk_name(&args), (b"seAl".to_vec(), false));
        args.set_text("options", "append,SEAL");
        assert_eq!(chunk_name(&args), (b"SEAL".to_vec(), false));
        args.set_text("options", "teXt");
        assert_eq!(chunk_name(&args), (b"teXt".to_vec(), true));
        // third letter must be uppercase for a valid PNG chunk
        args.set_text("options", "seal");
        assert_eq!(chunk_name(&args), (b"seAl".to_vec(), false));
    }
}
