//! TIFF/DNG walker.
//!
//! A TIFF is a chain of IFDs; each entry is 12 bytes and each IFD ends
//! with a pointer to the next. SEAL data lives in a private tag 0xCEA1
//! of type ASCII. Signing appends the record data followed by a
//! one-entry IFD at end of file and repoints the chain's last next-IFD
//! slot at it. That pointer sits inside the digested range and is
//! patched before the digest runs.

use crate::formats::{self, Walker};
use crate::store::FieldStore;
use crate::writer;
use crate::{verify, Context, Error, Result};

const SEAL_TAG: u16 = 0xcea1;
const TYPE_ASCII: u16 = 2;

pub struct Tiff;

#[derive(Clone, Copy)]
struct Endian(bool); // true = little

impl Endian {
    fn u16(self, d: &[u8], at: usize) -> u16 {
        let raw: [u8; 2] = d[at..at + 2].try_into().expect("sized");
        if self.0 { u16::from_le_bytes(raw) } else { u16::from_be_bytes(raw) }
    }
    fn u32(self, d: &[u8], at: usize) -> u32 {
        let raw: [u8; 4] = d[at..at + 4].try_into().expect("sized");
        if self.0 { u32::from_le_bytes(raw) } else { u32::from_be_bytes(raw) }
    }
    fn put_u16(self, d: &mut [u8], at: usize, v: u16) {
        let b = if self.0 { v.to_le_bytes() } else { v.to_be_bytes() };
        d[at..at + 2].copy_from_slice(&b);
    }
    fn put_u32(self, d: &mut [u8], at: usize, v: u32) {
        let b = if self.0 { v.to_le_bytes() } else { v.to_be_bytes() };
        d[at..at + 4].copy_from_slice(&b);
    }
}

fn endian_of(data: &[u8]) -> Option<Endian> {
    if data.len() < 16 {
        return None;
    }
    let e = match &data[0..2] {
        b"II" => Endian(true),
        b"MM" => Endian(false),
        _ => return None,
    };
    // 42 is plain TIFF (includes DNG)
    if e.u16(data, 2) != 0x002a {
        return None;
    }
    Some(e)
}

pub struct IfdChain {
    /// File offset of the last IFD's next-IFD pointer slot.
    pub last_link_at: usize,
}

/// Walk the IFD chain, scanning 0xCEA1 entries, and report where the
/// chain terminates.
fn walk(
    ctx: &mut Context,
    args: &mut FieldStore,
    data: &[u8],
    e: Endian,
) -> Option<IfdChain> {
    let mut ifd_at = e.u32(data, 4) as usize;
    let mut last_link_at = 4usize; // header's first-IFD pointer
    let mut hops = 0;
    while ifd_at != 0 && hops < 64 {
        if ifd_at + 2 > data.len() {
            return None;
        }
        let entries = e.u16(data, ifd_at) as usize;
        let link_at = ifd_at + 2 + entries * 12;
        if link_at + 4 > data.len() {
            return None;
        }
        for i in 0..entries {
            let at = ifd_at + 2 + i * 12;
            if e.u16(data, at) != SEAL_TAG {
                continue;
            }
            let count = e.u32(data, at + 4) as usize;
            let value_at = if count <= 4 {
                at + 8
            } else {
                e.u32(data, at + 8) as usize
            };
            if value_at + count <= data.len() {
                verify::verify_window(ctx, args, value_at, value_at + count, data, None);
            }
        }
        last_link_at = link_at;
        ifd_at = e.u32(data, link_at) as usize;
        hops += 1;
    }
    Some(IfdChain { last_link_at })
}

impl Walker for Tiff {
    fn name(&self) -> &'static str {
        "TIFF"
    }

    fn matches(&self, data: &[u8]) -> bool {
        endian_of(data).is_some()
    }

    fn process(&self, ctx: &mut Context, args: &mut FieldStore, data: &[u8]) -> Result<()> {
        let e = endian_of(data)
            .ok_or_else(|| Error::Format("not a TIFF".into()))?;
        let chain = walk(ctx, args, data, e)
            .ok_or_else(|| Error::Format("TIFF IFD chain is corrupted".into()))?;
        if ctx.mode.is_signing() {
            sign(ctx, args, data, e, chain)?;
        }
        Ok(())
    }
}

fn sign(
    ctx: &mut Context,
    args: &mut FieldStore,
    data: &[u8],
    e: Endian,
    chain: IfdChain,
) -> Result<()> {
    formats::standard_range(args);
    let record = formats::prepare_record(args)?;

    // record data first (word-aligned), then the one-entry IFD
    let pad = record.len() % 2;
    let data_at = data.len();
    let ifd_at = data_at + record.len() + pad;

    let mut block = record.clone();
    block.resize(record.len() + pad, 0);
    let mut ifd = vec![0u8; 18];
    e.put_u16(&mut ifd, 0, 1); // one entry
    e.put_u16(&mut ifd, 2, SEAL_TAG);
    e.put_u16(&mut ifd, 4, TYPE_ASCII);
    e.put_u32(&mut ifd, 6, record.len() as u32);
    e.put_u32(&mut ifd, 10, data_at as u32);
    e.put_u32(&mut ifd, 14, 0); // end of chain
    block.extend_from_slice(&ifd);

    let mut out = writer::splice(data, data_at, &block);
    writer::promote_offsets(args, data_at);

    // Hook the new IFD into the chain before the digest runs.
    e.put_u32(&mut out, chain.last_link_at, ifd_at as u32);

    writer::finalize(ctx, args, &mut out, None)?;
    writer::write_output(args, &out)
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn tiny_tiff() -> Vec<u8> {
        let mut t = b"II\x2a\x00".to_vec();
        t.extend_from_slice(&8u32.to_le_bytes()); // first IFD at 8
        // IFD: 1 entry (ImageWidth = 1)
        t.extend_from_slice(&1u16.to_le_bytes());
        t.extend_from_slice(&0x0100u16.to_le_bytes());
        t.extend_from_slice(&3u16.to_le_bytes()); // SHORT
        t.extend_from_slice(&1u32.to_le_bytes());
        t.extend_from_slice(&1u32.to_le_bytes());
        t.extend_from_slice(&0u32.to_le_bytes()); // next IFD: none
        t
    }

    #[test]
    fn magic_detection() {
        assert!(Tiff.matches(&tiny_tiff()));
        assert!(!Tiff.matches(b"MM\x00\x2b0000000000000000")); // BigTIFF: no
        assert!(!Tiff.matches(b"XX\x2a\x000000000000000000"));
    }

    #[test]
    fn chain_walk_finds_last_link() {
        let t = tiny_tiff();
        let e = endian_of(&t).unwrap();
        let mut ctx = crate::Context::new(crate::Mode::Verify);
        ctx.resolver.no_net = true;
        let mut args = FieldStore::new();
        let chain = walk(&mut ctx, &mut args, &t, e).unwrap();
        // header(8) + count(2) + 1 entry(12)
        assert_eq!(chain.last_link_at, 22);
    }
}
