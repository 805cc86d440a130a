//! Matroska/WebM walker.
//!
//! EBML encodes ids and sizes as variable-length integers: the position
//! of the first set bit in the leading byte gives the width, the
//! remaining bits start the value. A SEAL record rides in a custom
//! element whose id decodes to `0x5345414C` ("SEAL", wire bytes
//! `08 53 45 41 4C`). New elements are inserted right after the EBML
//! header — players ignore unknown elements there — or at end of file
//! when appending.

use crate::formats::{self, Walker};
use crate::store::FieldStore;
use crate::writer;
use crate::{verify, Context, Result};

const EBML_HEADER_ID: u64 = 0x0a45_dfa3;
const SEAL_ID: u64 = 0x5345_414c;

pub struct Matroska;

impl Walker for Matroska {
    fn name(&self) -> &'static str {
        "Matroska"
    }

    fn matches(&self, data: &[u8]) -> bool {
        data.len() >= 16 && data.starts_with(b"\x1a\x45\xdf\xa3")
    }

    fn process(&self, ctx: &mut Context, args: &mut FieldStore, data: &[u8]) -> Result<()> {
        let mut insert_at = None;
        let mut pos = 0usize;
        while pos < data.len() {
            let Some((id, after_id)) = read_vint(data, pos) else { break };
            let Some((len, after_len)) = read_vint(data, after_id) else { break };
            let len = len as usize;
            if after_len + len > data.len() {
                break;
            }
            if id == EBML_HEADER_ID {
                insert_at = Some(after_len + len);
            } else if id == SEAL_ID {
                verify::verify_window(ctx, args, after_len, after_len + len, data, None);
                insert_at = Some(after_len + len);
            }
            pos = after_len + len;
        }

        if ctx.mode.is_signing() {
            sign(ctx, args, data, insert_at.unwrap_or(data.len()))?;
        }
        Ok(())
    }
}

/// Decode one EBML variable-length integer. Returns the value and the
/// offset just past it.
fn read_vint(data: &[u8], at: usize) -> Option<(u64, usize)> {
    let first = *data.get(at)?;
    if first == 0 {
        return None;
    }
    let width = first.leading_zeros() as usize + 1;
    if at + width > data.len() {
        return None;
    }
    let mask = if width >= 8 { 0 } else { 0xffu8 >> width };
    let mut value = (first & mask) as u64;
    for i in 1..width {
        value = (value << 8) | data[at + i] as u64;
    }
    Some((value, at + width))
}

/// Encode a value the way the reader above decodes it.
fn write_vint(value: u64) -> Vec<u8> {
    let mut width = 1usize;
    let mut max: u64 = 0x7f;
    while width < 8 && value >= max {
        max = (max << 7) | 0xff;
        width += 1;
    }
    let mut out = vec![0u8; width];
    let mut v = value;
    for i in (1..width).rev() {
        out[i] = (v & 0xff) as u8;
        v >>= 8;
    }
    let mask = if width >= 8 { 0 } else { 0xffu8 >> width };
    out[0] = (1u8 << (8 - width)) | (v as u8 & mask);
    out
}

fn sign(ctx: &mut Context, args: &mut FieldStore, data: &[u8], header_end: usize) -> Result<()> {
    let appending = args.text("@sflags").contains('F') || formats::has_option(args, "append");
    let insert_at = if appending { data.len() } else { header_end };

    formats::standard_range(args);
    let record = formats::prepare_record(args)?;

    let mut block = write_vint(SEAL_ID);
    block.extend_from_slice(&write_vint(record.len() as u64));
    args.inc_index("@s", 0, block.len());
    args.inc_index("@s", 1, block.len());
    block.extend_from_slice(&record);

    let mut out = writer::splice(data, insert_at, &block);
    writer::promote_offsets(args, insert_at);
    writer::finalize(ctx, args, &mut out, None)?;
    writer::write_output(args, &out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vint_round_trip() {
        for v in [0u64, 1, 126, 127, 128, 0x1fff, 0x0a45_dfa3, SEAL_ID] {
            let enc = write_vint(v);
            let (dec, used) = read_vint(&enc, 0).unwrap();
            assert_eq!(dec, v, "value {v:#x}");
            assert_eq!(used, enc.len());
        }
    }

    #[test]
    fn seal_id_wire_shape() {
        // 0x5345414C encodes as 08 53 45 41 4C
        assert_eq!(write_vint(SEAL_ID), vec![0x08, 0x53, 0x45, 0x41, 0x4c]);
    }

    #[test]
    fn header_id_decodes() {
        let (id, used) = read_vint(b"\x1a\x45\xdf\xa3", 0).unwrap();
        assert_eq!(id, EBML_HEADER_ID);
        assert_eq!(used, 4);
    }
}
