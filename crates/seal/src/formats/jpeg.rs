//! JPEG walker.
//!
//! JPEG is a tag stream: `FFxx [len(2) data]`. Records may live in APP
//! blocks that carry plain metadata; blocks known to hold nested media
//! (Exif thumbnails, ICC profiles, Photoshop resources, ...) are
//! skipped outright — nested containers are never recursed into. A new
//! signature becomes an APP8 block `FF E8 len "SEAL\0" record` inserted
//! immediately before the start-of-stream (`FFDA`); APP9 when the
//! previous block was already APP8.
//!
//! MPF complication: an APP2 MPF block indexes images stored after the
//! end-of-image tag with offsets relative to its own TIFF header.
//! Inserting a block shifts that trailing data, so the offsets are
//! rewritten — but only on the first signing; once a signature covers
//! them the table is frozen and later signings only warn.

use tracing::warn;

use crate::formats::{self, Walker};
use crate::store::FieldStore;
use crate::writer;
use crate::{verify, Context, Error, Result};

/// APP payload prefixes that flag nested-media or binary blocks with no
/// comment structure; none of these can legally hold a record.
const SKIP_LABELS: &[&[u8]] = &[
    b"JP\0",
    b"JPN\0",
    b"HPQ-",
    b"DP2\0",
    b"PIC\0",
    b"AROT\0",
    b"JFIF\0",
    b"JFXX\0",
    b"HPSC\0",
    b"H3X0\0",
    b"FPXR\0",
    b"MOTO\0",
    b"XMTH\0",
    b"Adobe\0",
    b"Ducky\0",
    b"SCRNAIL",
    b"MMIMETA",
    b"Ocad$Rev",
    b"Qualcomm",
    b"ssuniqueid",
    b"HPQ-Capture",
    b"ICC_PROFILE\0",
    b"Photoshop 3.0\0",
    b"GenaPhotoStamperd",
];

pub struct Jpeg;

impl Walker for Jpeg {
    fn name(&self) -> &'static str {
        "JPEG"
    }

    fn matches(&self, data: &[u8]) -> bool {
        if data.len() < 20 {
            return false;
        }
        // ffd8 followed by another tag, whose length lands on a tag.
        let u32v = u32::from_be_bytes(data[0..4].try_into().expect("sized"));
        if u32v & 0xffff_ffc0 != 0xffd8_ffc0 {
            return false;
        }
        let len = ((data[4] as usize) << 8 | data[5] as usize) + 4;
        if len + 4 >= data.len() {
            return false;
        }
        let tag = (data[len] as u16) << 8 | data[len + 1] as u16;
        if tag & 0xffc0 != 0xffc0 {
            return false;
        }
        let next = ((data[len + 2] as usize) << 8 | data[len + 3] as usize) + 4;
        next < data.len()
    }

    fn process(&self, ctx: &mut Context, args: &mut FieldStore, data: &[u8]) -> Result<()> {
        let mut offset = 2usize;
        let mut prev_type: u16 = 0xffd8;
        let mut ffda = None;
        let mut mpf: Option<usize> = None;

        while offset + 4 < data.len() {
            let tag = (data[offset] as u16) << 8 | data[offset + 1] as u16;
            if tag & 0xffc0 != 0xffc0 {
                // Specs say skip non-tag bytes between blocks.
                offset += 1;
                continue;
            }
            if tag == 0xffda {
                ffda = Some(offset);
                break;
            }
            if tag == 0xffd9 {
                break;
            }
            let size = (data[offset + 2] as usize) << 8 | data[offset + 3] as usize;
            if size < 2 || offset + size > data.len() {
                warn!("JPEG block table is corrupted; stopping the walk");
                break;
            }

            if tag & 0xfff0 == 0xffe0 {
                let payload = &data[offset + 4..offset + 2 + size];
                if tag == prev_type {
                    // continuation of the previous APP block
                } else if payload.starts_with(b"MPF\0") {
                    if mpf.is_none() {
                        mpf = Some(offset + 4); // "MPF\0" start
                    }
                } else if payload.starts_with(b"Exif\0\0") {
                    // Exif spans multiple blocks and nests thumbnails;
                    // never recurse.
                } else if SKIP_LABELS.iter().any(|l| payload.starts_with(l)) {
                    // known nested-capable block
                } else {
                    verify::verify_window(ctx, args, offset + 4, offset + 2 + size, data, None);
                }
            }
            offset += size + 2;
            prev_type = tag;
        }

        if ctx.mode.is_signing() {
            let ffda =
                ffda.ok_or_else(|| Error::Format("JPEG is truncated; cannot sign".into()))?;
            let tag: u16 = if prev_type == 0xffe8 { 0xffe9 } else { 0xffe8 };
            sign(ctx, args, data, ffda, tag, mpf)?;
        }
        Ok(())
    }
}

fn sign(
    ctx: &mut Context,
    args: &mut FieldStore,
    data: &[u8],
    ffda: usize,
    tag: u16,
    mpf: Option<usize>,
) -> Result<()> {
    formats::standard_range(args);
    let record = formats::prepare_record(args)?;

    // FF Ex | len | "SEAL\0" | record; len counts itself and the label.
    let size = record.len() + 2 + 5;
    if size > 0xfffe {
        return Err(Error::Format("SEAL record is too large for JPEG".into()));
    }
    let mut block = Vec::with_capacity(size + 2);
    block.push(0xff);
    block.push((tag & 0xff) as u8);
    block.extend_from_slice(&(size as u16).to_be_bytes());
    block.extend_from_slice(b"SEAL\0");
    block.extend_from_slice(&record);

    args.inc_index("@s", 0, 2 + 2 + 5);
    args.inc_index("@s", 1, 2 + 2 + 5);

    let had_signatures = args.get_index("@s", 2) > 0;
    let mut out = writer::splice(data, ffda, &block);
    writer::promote_offsets(args, ffda);

    if let Some(mpf_at) = mpf {
        if had_signatures {
            println!(
                "WARNING: MPF offsets are covered by an existing signature and cannot be updated."
            );
        } else {
            fix_mpf_offsets(&mut out, mpf_at, ffda, block.len());
        }
    }

    writer::finalize(ctx, args, &mut out, None)?;
    writer::write_output(args, &out)
}

/// Shift MPF MP-entry image offsets that point at or past the insertion
/// point. Offsets are relative to the MPF TIFF header; zero means "this
/// file" and stays zero.
fn fix_mpf_offsets(out: &mut [u8], mpf_at: usize, insert_at: usize, delta: usize) {
    let base = mpf_at + 4; // TIFF header after "MPF\0"
    if base + 8 > out.len() {
        return;
    }
    let le = match &out[base..base + 2] {
        b"II" => true,
        b"MM" => false,
        _ => return,
    };
    let rd32 = |buf: &[u8], at: usize| -> u32 {
        let raw: [u8; 4] = buf[at..at + 4].try_into().expect("sized");
        if le { u32::from_le_bytes(raw) } else { u32::from_be_bytes(raw) }
    };
    let rd16 = |buf: &[u8], at: usize| -> u16 {
        let raw: [u8; 2] = buf[at..at + 2].try_into().expect("sized");
        if le { u16::from_le_bytes(raw) } else { u16::from_be_bytes(raw) }
    };

    let ifd = base + rd32(out, base + 4) as usize;
    if ifd + 2 > out.len() {
        return;
    }
    let entries = rd16(out, ifd) as usize;
    for e in 0..entries {
        let at = ifd + 2 + e * 12;
        if at + 12 > out.len() {
            return;
        }
        if rd16(out, at) != 0xb002 {
            continue; // MP Entry tag
        }
        let count = rd32(out, at + 4) as usize;
        let value_at = base + rd32(out, at + 8) as usize;
        let n = count / 16;
        for i in 0..n {
            let off_at = value_at + i * 16 + 8;
            if off_at + 4 > out.len() {
                return;
            }
            let image_off = rd32(out, off_at);
            if image_off != 0 && base + image_off as usize >= insert_at {
                let fixed = image_off + delta as u32;
                let bytes = if le { fixed.to_le_bytes() } else { fixed.to_be_bytes() };
                out[off_at..off_at + 4].copy_from_slice(&bytes);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn tiny_jpeg() -> Vec<u8> {
        let mut j = vec![0xff, 0xd8];
        // APP0 JFIF
        j.extend_from_slice(&[0xff, 0xe0, 0x00, 0x10]);
        j.extend_from_slice(b"JFIF\0");
        j.extend_from_slice(&[1, 1, 0, 0, 1, 0, 1, 0, 0]);
        // SOS with a little entropy data and EOI
        j.extend_from_slice(&[0xff, 0xda, 0x00, 0x08, 1, 1, 0, 0, 0x3f, 0]);
        j.extend_from_slice(&[0x12, 0x34, 0x56]);
        j.extend_from_slice(&[0xff, 0xd9]);
        j
    }

    #[test]
    fn magic_detection() {
        assert!(Jpeg.matches(&tiny_jpeg()));
        assert!(!Jpeg.matches(b"\xff\xd9\xff\xe0 not a jpeg header...."));
    }

    #[test]
    fn mpf_offsets_shift_on_insert() {
        // Hand-built little-endian MPF with one MP entry whose image
        // offset (100) points past the insertion point.
        let mut buf = vec![0u8; 120];
        let mpf_at = 10;
        buf[mpf_at..mpf_at + 4].copy_from_slice(b"MPF\0");
        let base = mpf_at + 4;
        buf[base..base + 4].copy_from_slice(b"II\x2a\x00");
        buf[base + 4..base + 8].copy_from_slice(&8u32.to_le_bytes());
        let ifd = base + 8;
        buf[ifd..ifd + 2].copy_from_slice(&1u16.to_le_bytes());
        let entry = ifd + 2;
        buf[entry..entry + 2].copy_from_slice(&0xb002u16.to_le_bytes());
        buf[entry + 2..entry + 4].copy_from_slice(&7u16.to_le_bytes());
        buf[entry + 4..entry + 8].copy_from_slice(&16u32.to_le_bytes());
        let value_rel = (entry + 12 - base) as u32;
        buf[entry + 8..entry + 12].copy_from_slice(&value_rel.to_le_bytes());
        let value_at = entry + 12;
        buf[value_at + 8..value_at + 12].copy_from_slice(&100u32.to_le_bytes());

        fix_mpf_offsets(&mut buf, mpf_at, 50, 7);
        let fixed = u32::from_le_bytes(buf[value_at + 8..value_at + 12].try_into().unwrap());
        assert_eq!(fixed, 107);
    }
}
