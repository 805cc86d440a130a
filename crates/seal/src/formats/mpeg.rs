//! MPEG / MP3 walker.
//!
//! Frame streams have no comment container, so records are scanned
//! anywhere in the byte stream and a new record is appended at end of
//! file, which is sync-byte aligned by construction (nothing follows
//! the last frame).

use crate::formats::{self, Walker};
use crate::store::FieldStore;
use crate::writer;
use crate::{verify, Context, Result};

pub struct Mpeg;

impl Walker for Mpeg {
    fn name(&self) -> &'static str {
        "MPEG"
    }

    fn matches(&self, data: &[u8]) -> bool {
        if data.len() < 40 {
            return false;
        }
        let mut offset = 0usize;
        let mut missed = 0;
        while offset + 40 < data.len() && missed < 1024 {
            let u = u32::from_be_bytes(data[offset..offset + 4].try_into().expect("sized"));
            if u & 0xffff_ff00 == 0x4944_3300 {
                // ID3 tag: 7-bit size words
                if offset + 10 >= data.len() {
                    return false;
                }
                let mut size = 0usize;
                for i in 6..10 {
                    if data[offset + i] >= 0x80 {
                        return false;
                    }
                    size = (size << 7) | data[offset + i] as usize;
                }
                offset += size * 4;
                missed = 0;
                continue;
            }
            if (0x0000_01b7..=0x0000_01ef).contains(&u) {
                return true; // MPEG system/video start code
            }
            if u & 0xffe0_0000 == 0xffe0_0000 && mp3_header_valid(u) {
                return true;
            }
            offset += 1;
            missed += 1;
        }
        false
    }

    fn process(&self, ctx: &mut Context, args: &mut FieldStore, data: &[u8]) -> Result<()> {
        verify::verify_window(ctx, args, 0, data.len(), data, None);
        if ctx.mode.is_signing() {
            sign(ctx, args, data)?;
        }
        Ok(())
    }
}

/// Reject sync patterns with reserved version/layer/bitrate/frequency
/// fields; plain 0xFFE sync alone matches too much noise.
fn mp3_header_valid(u: u32) -> bool {
    !(u & 0x0018_0000 == 0x0008_0000   // reserved version
        || u & 0x0006_0000 == 0        // reserved layer
        || u & 0x0000_f000 == 0        // free bitrate
        || u & 0x0000_f000 == 0x0000_f000 // bad bitrate
        || u & 0x0000_0c00 == 0x0000_0c00 // reserved sampling rate
        || u & 0x0000_0003 == 0x0000_0002 // reserved emphasis
        || u & 0x0006_0000 != 0x0002_0000) // layer 3
}

fn sign(ctx: &mut Context, args: &mut FieldStore, data: &[u8]) -> Result<()> {
    formats::standard_range(args);
    let record = formats::prepare_record(args)?;

    let insert_at = data.len();
    let mut out = writer::splice(data, insert_at, &record);
    writer::promote_offsets(args, insert_at);
    writer::finalize(ctx, args, &mut out, None)?;
    writer::write_output(args, &out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mp3_sync_detection() {
        // 0xFFFB9000: MPEG1 layer3, 128kbps, 44.1kHz
        let mut d = vec![0xff, 0xfb, 0x90, 0x00];
        d.resize(64, 0);
        assert!(Mpeg.matches(&d));
    }

    #[test]
    fn noise_is_rejected() {
        let d = vec![0x55u8; 64];
        assert!(!Mpeg.matches(&d));
    }
}
