//! GIF walker.
//!
//! Records live in `21 FF` Application Extension blocks. A new
//! signature is inserted before the first image descriptor (`2C`) or
//! the trailer (`3B`) as `21 FF FF "SEAL1.0" record "\n"` followed by a
//! 127-byte zero slope: GIF sub-blocks carry a one-byte length, and the
//! zero run guarantees a terminating length lands after the record no
//! matter where the signature text ends. GIF has no true appending.

use crate::formats::{self, Walker};
use crate::store::FieldStore;
use crate::writer;
use crate::{Context, Error, Result};

pub struct Gif;

impl Walker for Gif {
    fn name(&self) -> &'static str {
        "GIF"
    }

    fn matches(&self, data: &[u8]) -> bool {
        data.len() >= 16 && (data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a"))
    }

    fn process(&self, ctx: &mut Context, args: &mut FieldStore, data: &[u8]) -> Result<()> {
        let insert_at = walk(ctx, args, data, true);
        if ctx.mode.is_signing() {
            let insert_at =
                insert_at.ok_or_else(|| Error::Format("GIF has no insertion point".into()))?;
            sign(ctx, args, data, insert_at)?;
        }
        Ok(())
    }
}

/// Walk the block stream: scan `21 FF` application extensions, skip
/// image data, and report where a new record could be inserted.
fn walk(ctx: &mut Context, args: &mut FieldStore, data: &[u8], verify: bool) -> Option<usize> {
    let mut offset = 10usize;
    let mut insert_at = None;
    if data.len() < 14 {
        return None;
    }
    // global color table, when flagged
    if data[10] & 0x80 != 0 {
        let ctsize = 3 * (1usize << ((data[10] & 0x07) + 1));
        offset = 13 + ctsize;
    }

    while offset < data.len() {
        let tag = data[offset];
        offset += 1;
        if offset >= data.len() {
            break;
        }
        match tag {
            0x00 => {}
            0x3b => {
                // trailer
                if insert_at.is_none() {
                    insert_at = Some(offset - 1);
                }
                break;
            }
            0x2c => {
                // image descriptor
                if insert_at.is_none() {
                    insert_at = Some(offset - 1);
                }
                offset += 8;
                if offset >= data.len() {
                    break;
                }
                if data[offset] & 0x80 != 0 {
                    let ctsize = 3 * (1usize << ((data[offset] & 0x07) + 1));
                    offset += ctsize + 1;
                } else {
                    offset += 1;
                }
                if offset >= data.len() {
                    break;
                }
                offset = skip_subblocks(data, offset + 1)?; // +1 for LZW code size
            }
            0x21 => {
                // extension: sub-blocks follow the subtype byte
                let subtype = data[offset];
                offset += 1;
                let start = offset;
                offset = skip_subblocks(data, offset)?;
                if verify && subtype == 0xff {
                    crate::verify::verify_window(ctx, args, start, offset, data, None);
                }
            }
            _ => {}
        }
        if offset >= data.len() {
            break;
        }
    }
    insert_at
}

/// Advance past a chain of length-prefixed sub-blocks (terminated by a
/// zero length).
fn skip_subblocks(data: &[u8], mut offset: usize) -> Option<usize> {
    loop {
        if offset >= data.len() {
            return Some(offset);
        }
        let len = data[offset] as usize;
        offset += 1;
        if len == 0 {
            return Some(offset);
        }
        offset += len;
    }
}

fn sign(ctx: &mut Context, args: &mut FieldStore, data: &[u8], insert_at: usize) -> Result<()> {
    formats::standard_range(args);
    let record = formats::prepare_record(args)?;

    let mut block = vec![0x21u8, 0xff, 0xff]; // app extension, max first length
    block.extend_from_slice(b"SEAL1.0");

    args.inc_index("@s", 0, block.len());
    args.inc_index("@s", 1, block.len());

    block.extend_from_slice(&record);
    block.push(b'\n');
    // zero slope: whatever byte the length counter lands on, a zero run
    // terminates the sub-block chain
    block.extend_from_slice(&[0u8; 127]);

    let mut out = writer::splice(data, insert_at, &block);
    writer::promote_offsets(args, insert_at);
    writer::finalize(ctx, args, &mut out, None)?;
    writer::write_output(args, &out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Context, Mode};

    pub(crate) fn tiny_gif() -> Vec<u8> {
        let mut g = b"GIF89a".to_vec();
        g.extend_from_slice(&[1, 0, 1, 0]); // 1x1
        g.push(0x00); // no GCT
        g.extend_from_slice(&[0, 0]); // bg color, aspect
        // image descriptor
        g.push(0x2c);
        g.extend_from_slice(&[0, 0, 0, 0, 1, 0, 1, 0]);
        g.push(0x00); // no LCT
        g.push(0x02); // LZW min code size
        g.extend_from_slice(&[1, 0x44]); // one data sub-block
        g.push(0x00); // terminator
        g.push(0x3b); // trailer
        g
    }

    #[test]
    fn magic_detection() {
        assert!(Gif.matches(&tiny_gif()));
        assert!(!Gif.matches(b"GIF00a.........."));
    }

    #[test]
    fn insertion_lands_before_first_image() {
        let g = tiny_gif();
        let mut ctx = Context::new(Mode::Verify);
        ctx.resolver.no_net = true;
        let mut args = FieldStore::new();
        let at = walk(&mut ctx, &mut args, &g, false).unwrap();
        assert_eq!(g[at], 0x2c);
    }
}
