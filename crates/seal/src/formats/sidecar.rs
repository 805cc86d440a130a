//! Sidecar driver: signatures for media that must not be modified.
//!
//! A `.seal` sidecar is processed as Text, except that every digest
//! hashes the *source media* first (the preface). The sidecar file name
//! comes from a template expanded against the media path, so one
//! configured pattern covers a whole batch.

use std::path::Path;

use crate::formats::text;
use crate::store::FieldStore;
use crate::writer;
use crate::{verify, Context, Result};

/// Verify or sign the sidecar belonging to `media_path`. The `sidecar`
/// field holds the filename template (e.g. `%d/%b%e.seal`).
pub fn process(ctx: &mut Context, args: &mut FieldStore, media_path: &Path) -> Result<()> {
    let template = args.text("sidecar");
    if template.is_empty() {
        println!(" No SEAL sidecar configured.");
        return Ok(());
    }
    let sidecar_path = writer::make_filename(&template, media_path)?;
    let media = std::fs::read(media_path)?;

    let sidecar_data = match std::fs::read(&sidecar_path) {
        Ok(d) => d,
        Err(_) if ctx.mode.is_signing() => Vec::new(), // fresh sidecar
        Err(_) => {
            println!(" No SEAL sidecar found ({sidecar_path}).");
            ctx.verdicts |= verify::verdict::UNSIGNED;
            return Ok(());
        }
    };

    if ctx.mode.is_signing() {
        // The signature lands in the sidecar itself.
        args.set_text("@FilenameOut", &sidecar_path);
    }
    text::process_with_preface(ctx, args, &sidecar_data, Some(&media))?;

    if args.get_index("@s", 2) == 0 {
        println!(" No SEAL signatures found.");
        ctx.verdicts |= verify::verdict::UNSIGNED;
    }
    Ok(())
}
