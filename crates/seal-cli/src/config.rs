//! Configuration file handling.
//!
//! The config file is line-oriented `key = value` with `#` comments and
//! blank lines; recognised keys are exactly the CLI long-option names.
//! Default location: `$XDG_CONFIG_HOME/seal/config`, falling back to
//! `$HOME/.config/seal/config`.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _, Result};

/// Every key the config file may carry.
pub const KNOWN_KEYS: &[&str] = &[
    "domain",
    "keyfile",
    "keyalg",
    "digestalg",
    "kv",
    "uid",
    "sf",
    "outfile",
    "options",
    "dnsfile",
    "apiurl",
    "apikey",
    "id",
    "info",
    "comment",
    "copyright",
    "src",
    "srca",
    "srcd",
    "srcf",
    "cacert",
    "cert-insecure",
    "keybits",
    "sidecar",
    "no-net",
];

pub fn default_path() -> PathBuf {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")));
    base.unwrap_or_else(|| PathBuf::from(".")).join("seal").join("config")
}

/// Read a config file into a key/value map. A missing file at the
/// default path is fine; unknown keys are fatal.
pub fn read(path: &Path, must_exist: bool) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(_) if !must_exist => return Ok(out),
        Err(e) => {
            return Err(e).with_context(|| format!("cannot read config file {}", path.display()))
        }
    };
    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            bail!(
                "configuration file bad format: line {} in '{}'",
                lineno + 1,
                path.display()
            );
        };
        let key = key.trim();
        let value = value.trim();
        if !KNOWN_KEYS.contains(&key) {
            bail!(
                "unknown field '{}': line {} in '{}'",
                key,
                lineno + 1,
                path.display()
            );
        }
        out.insert(key.to_string(), value.to_string());
    }
    Ok(out)
}

/// Emit the effective settings as a config file (`-W`). `-` writes to
/// stdout.
pub fn write(path: &str, get: impl Fn(&str) -> String) -> Result<()> {
    let mut buf = String::new();
    let mut section = |title: &str, keys: &[&str]| {
        buf.push_str(&format!("# {title}\n"));
        for key in keys {
            let v = get(key);
            if v.is_empty() {
                buf.push_str(&format!("#{key}=\n"));
            } else {
                buf.push_str(&format!("{key}={v}\n"));
            }
        }
        buf.push('\n');
    };
    section("Common options", &["domain", "digestalg", "keyalg", "kv", "sf"]);
    section("Informational options", &["info", "comment", "copyright"]);
    section("Local signing options (for use with -s and -m)", &["keyfile"]);
    section(
        "Remote signing options (for use with -S and -M)",
        &["apiurl", "apikey", "id", "outfile"],
    );
    section("Generating signature options (for use with -g)", &["dnsfile", "uid"]);

    if path == "-" {
        print!("{buf}");
        return Ok(());
    }
    if let Some(dir) = Path::new(path).parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let mut f = std::fs::File::create(path)?;
    f.write_all(buf.as_bytes())?;
    eprintln!("Configuration file created: {path}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn parses_keys_comments_and_blanks() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "# a comment").unwrap();
        writeln!(f).unwrap();
        writeln!(f, "domain = example.com").unwrap();
        writeln!(f, "sf=date3:hex").unwrap();
        let map = read(f.path(), true).unwrap();
        assert_eq!(map.get("domain").unwrap(), "example.com");
        assert_eq!(map.get("sf").unwrap(), "date3:hex");
    }

    #[test]
    fn unknown_key_is_fatal() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "frobnicate = yes").unwrap();
        assert!(read(f.path(), true).is_err());
    }

    #[test]
    fn missing_default_config_is_fine() {
        let map = read(Path::new("/nonexistent/seal/config"), false).unwrap();
        assert!(map.is_empty());
    }
}
