//! Container dispatch and the per-format walkers.
//!
//! [`identify`] probes magic bytes in a fixed order and hands the file
//! to the first walker that claims it. Every walker implements the same
//! three conceptual operations: scan byte windows that may hold SEAL
//! records (verifying each), pick a legal insertion offset for a new
//! record, and compose the insertion block with the matching `b=`
//! range.

pub mod aac;
pub mod bmff;
pub mod dicom;
pub mod gif;
pub mod jpeg;
pub mod matroska;
pub mod mpeg;
pub mod pdf;
pub mod png;
pub mod ppm;
pub mod riff;
pub mod sidecar;
pub mod text;
pub mod tiff;

use std::path::Path;

use crate::store::FieldStore;
use crate::verify;
use crate::writer;
use crate::{Context, Mode, Result};

/// Per-format capability: identification plus the verify/sign walk.
pub trait Walker: Sync {
    fn name(&self) -> &'static str;
    fn matches(&self, data: &[u8]) -> bool;
    fn process(&self, ctx: &mut Context, args: &mut FieldStore, data: &[u8]) -> Result<()>;
}

/// Probe order is part of the contract; the first hit wins. Text's
/// UTF-8 sniff is the last resort.
pub fn walkers() -> &'static [&'static dyn Walker] {
    static WALKERS: &[&dyn Walker] = &[
        &png::Png,
        &jpeg::Jpeg,
        &gif::Gif,
        &riff::Riff,
        &matroska::Matroska,
        &bmff::Bmff,
        &pdf::Pdf,
        &tiff::Tiff,
        &ppm::Ppm,
        &dicom::Dicom,
        &mpeg::Mpeg,
        &aac::Aac,
        &text::Text,
    ];
    WALKERS
}

pub fn identify(data: &[u8]) -> Option<&'static dyn Walker> {
    walkers().iter().copied().find(|w| w.matches(data))
}

/// Process one file end to end: identify, walk, and account for the
/// "no signature at all" verdict.
pub fn process_file(ctx: &mut Context, args: &mut FieldStore, path: &Path) -> Result<()> {
    let data = std::fs::read(path)?;

    let walker = match identify(&data) {
        Some(w) => w,
        None => {
            println!(" ERROR: Unknown file format '{}'. Skipping.", path.display());
            ctx.verdicts |= verify::verdict::UNSIGNED;
            return Ok(());
        }
    };

    if ctx.mode.is_signing() {
        let template = args.text("outfile");
        let outname = writer::make_filename(&template, path)?;
        args.set_text("@FilenameOut", &outname);
    }

    walker.process(ctx, args, &data)?;

    if args.get_index("@s", 2) == 0 {
        println!(" No SEAL signatures found.");
        ctx.verdicts |= verify::verdict::UNSIGNED;
    } else if ctx.mode == Mode::Verify {
        verify::check_final(args);
    }
    Ok(())
}

/// Did `-O` carry this flag?
pub(crate) fn has_option(args: &FieldStore, name: &str) -> bool {
    args.text("options").contains(name)
}

/// Range start anchor: when a prior signature already covered the start
/// of file, overlap it (`P`) to foil insertion between signatures;
/// otherwise cover from the given start (normally `F`).
pub(crate) fn range_start(args: &FieldStore, whole_file_start: &str) -> String {
    if args.text("@sflags").contains('F') {
        "P".to_string()
    } else {
        whole_file_start.to_string()
    }
}

/// Rotate the last verified signature's position into `@p` and emit the
/// placeholder record. Returns the record bytes; `@s[0]`/`@s[1]` are
/// record-relative afterwards.
pub(crate) fn prepare_record(args: &mut FieldStore) -> Result<Vec<u8>> {
    writer::ensure_not_finalized(args)?;
    args.copy("@p", "@s");
    crate::record::build(args);
    Ok(args.bytes("@record").to_vec())
}

/// The common range shape: `<start>~S` plus `,s~f` when the signature
/// finalizes the file, or `,s~s+3` (the literal `"/>`) when appending.
pub(crate) fn standard_range(args: &mut FieldStore) {
    let mut b = range_start(args, "F");
    b.push_str("~S");
    if has_option(args, "append") {
        b.push_str(",s~s+3");
    } else {
        b.push_str(",s~f");
    }
    args.set_text("b", &b);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identify_order_first_hit_wins() {
        let png = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR....................".to_vec();
        assert_eq!(identify(&png).map(|w| w.name()), Some("PNG"));
        // Plain ASCII falls through everything to Text.
        let texty = b"hello world, this is just some plain text...".to_vec();
        assert_eq!(identify(&texty).map(|w| w.name()), Some("Text"));
    }

    #[test]
    fn range_start_overlaps_previous_signature() {
        let mut args = FieldStore::new();
        assert_eq!(range_start(&args, "F"), "F");
        args.set_text("@sflags", "FsSf");
        assert_eq!(range_start(&args, "F"), "P");
    }

    #[test]
    fn standard_range_shapes() {
        let mut args = FieldStore::new();
        standard_range(&mut args);
        assert_eq!(args.text("b"), "F~S,s~f");
        args.set_text("options", "append");
        standard_range(&mut args);
        assert_eq!(args.text("b"), "F~S,s~s+3");
        args.set_text("@sflags", "F");
        standard_range(&mut args);
        assert_eq!(args.text("b"), "P~S,s~s+3");
    }
}
