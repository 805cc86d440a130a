//! RIFF walker (WAV, AVI, WebP).
//!
//! RIFF chunks are `fourcc(4) | le32 size | data`, even-padded. Records
//! may sit in a `SEAL` chunk, an `XMP ` chunk, or the INFO text chunks.
//! A new signature is appended as a `SEAL` chunk at end of file and the
//! outer RIFF length is patched, which is why the digest range skips
//! the length field: `b = F~F+4,F+8~S,s~f`.

use crate::formats::{self, Walker};
use crate::store::FieldStore;
use crate::writer;
use crate::{verify, Context, Result};

pub struct Riff;

impl Walker for Riff {
    fn name(&self) -> &'static str {
        "RIFF"
    }

    fn matches(&self, data: &[u8]) -> bool {
        if data.len() < 16 || !data.starts_with(b"RIFF") {
            return false;
        }
        let size = u32::from_le_bytes(data[4..8].try_into().expect("sized")) as usize;
        size + 8 == data.len()
    }

    fn process(&self, ctx: &mut Context, args: &mut FieldStore, data: &[u8]) -> Result<()> {
        walk(ctx, args, data, 0, data.len(), 0);
        if ctx.mode.is_signing() {
            sign(ctx, args, data)?;
        }
        Ok(())
    }
}

/// Text-capable chunk: `SEAL`, `XMP `, or one of the INFO fields (all
/// `I***` uppercase).
fn scannable(fourcc: &[u8]) -> bool {
    fourcc == b"SEAL"
        || fourcc == b"XMP "
        || (fourcc[0] == b'I' && fourcc.iter().all(|b| b.is_ascii_uppercase()))
}

fn walk(
    ctx: &mut Context,
    args: &mut FieldStore,
    data: &[u8],
    mut pos: usize,
    end: usize,
    depth: usize,
) {
    while pos + 8 < end {
        let fourcc = &data[pos..pos + 4];
        let size = u32::from_le_bytes(data[pos + 4..pos + 8].try_into().expect("sized")) as usize;
        if pos + 8 + size > end {
            break;
        }
        if depth < 1 && fourcc == b"RIFF" && size > 4 {
            walk(ctx, args, data, pos + 12, pos + 12 + size - 4, depth + 1);
        } else if depth < 2 && fourcc == b"LIST" && size > 4 {
            // only INFO lists hold text chunks
            if &data[pos + 8..pos + 12] == b"INFO" {
                walk(ctx, args, data, pos + 12, pos + 12 + size - 4, depth + 1);
            }
        } else if scannable(fourcc) {
            verify::verify_window(ctx, args, pos + 8, pos + 8 + size, data, None);
        }
        let mut step = size;
        if step % 2 == 1 {
            step += 1;
        }
        pos += 8 + step;
    }
}

fn sign(ctx: &mut Context, args: &mut FieldStore, data: &[u8]) -> Result<()> {
    // Skip the outer RIFF length: it changes with every append.
    let mut b = if args.text("@sflags").contains('F') {
        "P".to_string()
    } else {
        "F~F+4,F+8".to_string()
    };
    b.push_str("~S");
    if formats::has_option(args, "append") {
        b.push_str(",s~s+3");
    } else {
        b.push_str(",s~f");
    }
    args.set_text("b", &b);

    let record = formats::prepare_record(args)?;

    let mut block = Vec::with_capacity(record.len() + 9);
    block.extend_from_slice(b"SEAL");
    block.extend_from_slice(&(record.len() as u32).to_le_bytes());
    args.inc_index("@s", 0, 8);
    args.inc_index("@s", 1, 8);
    block.extend_from_slice(&record);
    if block.len() % 2 == 1 {
        block.push(0);
    }

    let insert_at = data.len();
    let mut out = writer::splice(data, insert_at, &block);
    writer::promote_offsets(args, insert_at);

    // Outer RIFF size grows by the whole appended chunk.
    let old = u32::from_le_bytes(out[4..8].try_into().expect("sized"));
    out[4..8].copy_from_slice(&(old + block.len() as u32).to_le_bytes());

    writer::finalize(ctx, args, &mut out, None)?;
    writer::write_output(args, &out)
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn tiny_wav() -> Vec<u8> {
        let mut w = b"RIFF".to_vec();
        w.extend_from_slice(&0u32.to_le_bytes()); // size patched below
        w.extend_from_slice(b"WAVE");
        w.extend_from_slice(b"data");
        w.extend_from_slice(&4u32.to_le_bytes());
        w.extend_from_slice(&[1, 2, 3, 4]);
        let size = (w.len() - 8) as u32;
        w[4..8].copy_from_slice(&size.to_le_bytes());
        w
    }

    #[test]
    fn magic_requires_consistent_size() {
        assert!(Riff.matches(&tiny_wav()));
        let mut bad = tiny_wav();
        bad[4] ^= 0xff;
        assert!(!Riff.matches(&bad));
    }

    #[test]
    fn info_chunks_are_scannable() {
        assert!(scannable(b"SEAL"));
        assert!(scannable(b"XMP "));
        assert!(scannable(b"ICMT"));
        assert!(scannable(b"ICOP"));
        assert!(!scannable(b"data"));
        assert!(!scannable(b"fmt "));
    }
}
