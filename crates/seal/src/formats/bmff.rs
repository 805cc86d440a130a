//! BMFF walker (HEIF, HEIC, AVIF, MP4).
//!
//! The file is a sequence of atoms: `be32 length | fourcc | data`,
//! where the length includes the 8-byte header; a length of 1 switches
//! to a 64-bit length after the fourcc, and 0 means "to end of file".
//! Only top-level atoms are walked — nested atoms have no knowable
//! scope without decoding the whole codec structure. A new signature is
//! appended as a top-level `SEAL` atom at end of file.

use crate::formats::{self, Walker};
use crate::store::FieldStore;
use crate::writer;
use crate::{verify, Context, Result};

pub struct Bmff;

impl Walker for Bmff {
    fn name(&self) -> &'static str {
        "BMFF"
    }

    fn matches(&self, data: &[u8]) -> bool {
        data.len() >= 16 && &data[4..8] == b"ftyp"
    }

    fn process(&self, ctx: &mut Context, args: &mut FieldStore, data: &[u8]) -> Result<()> {
        let mut pos = 0usize;
        while pos + 8 <= data.len() {
            let size32 =
                u32::from_be_bytes(data[pos..pos + 4].try_into().expect("sized")) as usize;
            let fourcc = &data[pos + 4..pos + 8];
            let (size, header) = if size32 == 1 {
                if pos + 16 > data.len() {
                    break;
                }
                let size64 =
                    u64::from_be_bytes(data[pos + 8..pos + 16].try_into().expect("sized"));
                (size64 as usize, 16)
            } else if size32 == 0 {
                (data.len() - pos, 8)
            } else {
                (size32, 8)
            };
            if size < header || pos + size > data.len() {
                break;
            }
            if fourcc.eq_ignore_ascii_case(b"seal") {
                verify::verify_window(ctx, args, pos + header, pos + size, data, None);
            }
            pos += size;
        }

        if ctx.mode.is_signing() {
            sign(ctx, args, data)?;
        }
        Ok(())
    }
}

fn sign(ctx: &mut Context, args: &mut FieldStore, data: &[u8]) -> Result<()> {
    formats::standard_range(args);
    let record = formats::prepare_record(args)?;

    let mut block = Vec::with_capacity(record.len() + 8);
    block.extend_from_slice(&((record.len() + 8) as u32).to_be_bytes());
    block.extend_from_slice(b"SEAL");
    args.inc_index("@s", 0, 8);
    args.inc_index("@s", 1, 8);
    block.extend_from_slice(&record);

    let insert_at = data.len();
    let mut out = writer::splice(data, insert_at, &block);
    writer::promote_offsets(args, insert_at);
    writer::finalize(ctx, args, &mut out, None)?;
    writer::write_output(args, &out)
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn tiny_mp4() -> Vec<u8> {
        let mut m = Vec::new();
        m.extend_from_slice(&16u32.to_be_bytes());
        m.extend_from_slice(b"ftyp");
        m.extend_from_slice(b"isom");
        m.extend_from_slice(&0u32.to_be_bytes());
        m.extend_from_slice(&16u32.to_be_bytes());
        m.extend_from_slice(b"mdat");
        m.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        m
    }

    #[test]
    fn magic_detection() {
        assert!(Bmff.matches(&tiny_mp4()));
        assert!(!Bmff.matches(b"\0\0\0\x10mdat............"));
    }
}
