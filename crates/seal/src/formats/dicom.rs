//! DICOM walker.
//!
//! A DICOM file is a 128-byte preamble, the `DICM` magic, and a stream
//! of data elements `group(2) elem(2) VR(2) len`. Records live in the
//! private group 0xCEA1; signing appends elements at end of file. The
//! first signature also writes the private-group reservation
//! `(CEA1,0010) LO "SEAL"`. The data element `(CEA1,1001)` picks its VR
//! by record size: ST below 1024 bytes, LT below 10240, UT beyond.
//! Implicit-VR sequences are not walked.

use crate::formats::{self, Walker};
use crate::store::FieldStore;
use crate::writer;
use crate::{verify, Context, Result};

const GROUP: u16 = 0xcea1;

pub struct Dicom;

impl Walker for Dicom {
    fn name(&self) -> &'static str {
        "DICOM"
    }

    fn matches(&self, data: &[u8]) -> bool {
        data.len() >= 0x84 && &data[0x80..0x84] == b"DICM"
    }

    fn process(&self, ctx: &mut Context, args: &mut FieldStore, data: &[u8]) -> Result<()> {
        let mut pos = 0x84usize;
        while pos + 8 <= data.len() {
            let group = u16::from_le_bytes(data[pos..pos + 2].try_into().expect("sized"));
            let vr = &data[pos + 4..pos + 6];
            let (len, header) = if matches!(vr, b"OB" | b"OW" | b"OF" | b"SQ" | b"UT" | b"UN") {
                if pos + 12 > data.len() {
                    break;
                }
                let l =
                    u32::from_le_bytes(data[pos + 8..pos + 12].try_into().expect("sized")) as usize;
                (l, 12)
            } else if vr.iter().all(|b| b.is_ascii_uppercase()) {
                let l =
                    u16::from_le_bytes(data[pos + 6..pos + 8].try_into().expect("sized")) as usize;
                (l, 8)
            } else {
                // implicit VR or garbage: stop walking
                break;
            };
            if len == 0xffff_ffff || pos + header + len > data.len() {
                break;
            }
            if group == GROUP {
                verify::verify_window(ctx, args, pos + header, pos + header + len, data, None);
            }
            pos += header + len;
        }

        if ctx.mode.is_signing() {
            sign(ctx, args, data)?;
        }
        Ok(())
    }
}

fn element_short(group: u16, elem: u16, vr: &[u8; 2], payload: &[u8]) -> Vec<u8> {
    let mut e = Vec::with_capacity(8 + payload.len());
    e.extend_from_slice(&group.to_le_bytes());
    e.extend_from_slice(&elem.to_le_bytes());
    e.extend_from_slice(vr);
    e.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    e.extend_from_slice(payload);
    e
}

fn sign(ctx: &mut Context, args: &mut FieldStore, data: &[u8]) -> Result<()> {
    formats::standard_range(args);
    let record = formats::prepare_record(args)?;

    let mut block = Vec::new();
    if args.get_index("@s", 2) == 0 {
        // reserve the private group on first signing
        block.extend_from_slice(&element_short(GROUP, 0x0010, b"LO", b"SEAL"));
    }

    // values must be even-length; pad with a space
    let mut payload = record;
    let pad = payload.len() % 2;
    let header;
    if payload.len() + pad < 1024 {
        header = block.len() + 8;
        payload.resize(payload.len() + pad, b' ');
        block.extend_from_slice(&element_short(GROUP, 0x1001, b"ST", &payload));
    } else if payload.len() + pad < 10240 {
        header = block.len() + 8;
        payload.resize(payload.len() + pad, b' ');
        block.extend_from_slice(&element_short(GROUP, 0x1001, b"LT", &payload));
    } else {
        header = block.len() + 12;
        payload.resize(payload.len() + pad, b' ');
        block.extend_from_slice(&GROUP.to_le_bytes());
        block.extend_from_slice(&0x1001u16.to_le_bytes());
        block.extend_from_slice(b"UT\0\0");
        block.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        block.extend_from_slice(&payload);
    }

    args.inc_index("@s", 0, header);
    args.inc_index("@s", 1, header);

    let insert_at = data.len();
    let mut out = writer::splice(data, insert_at, &block);
    writer::promote_offsets(args, insert_at);
    writer::finalize(ctx, args, &mut out, None)?;
    writer::write_output(args, &out)
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn tiny_dicom() -> Vec<u8> {
        let mut d = vec![0u8; 128];
        d.extend_from_slice(b"DICM");
        // (0008,0016) UI, short form
        d.extend_from_slice(&0x0008u16.to_le_bytes());
        d.extend_from_slice(&0x0016u16.to_le_bytes());
        d.extend_from_slice(b"UI");
        d.extend_from_slice(&4u16.to_le_bytes());
        d.extend_from_slice(b"1.2\0");
        d
    }

    #[test]
    fn magic_detection() {
        assert!(Dicom.matches(&tiny_dicom()));
        assert!(!Dicom.matches(&vec![0u8; 200]));
    }

    #[test]
    fn short_element_shape() {
        let e = element_short(GROUP, 0x0010, b"LO", b"SEAL");
        assert_eq!(&e[0..2], &0xcea1u16.to_le_bytes());
        assert_eq!(&e[4..6], b"LO");
        assert_eq!(e.len(), 12);
    }
}
