//! sealtool: sign and verify SEAL records in media and document files.
//!
//! Modes: `-g` generate a key pair, `-s` sign with a local key, `-S`
//! sign through a remote service, `-m`/`-M` sign a pre-computed digest,
//! default is verify. Exit codes OR across the batch: 0x01 invalid
//! signature, 0x02 missing signature, 0x04 not validated, 0x08 not
//! authenticated, 0x10 revoked, 0x80 fatal error.

mod config;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _, Result};
use clap::Parser;
use secrecy::SecretString;
use tracing_subscriber::EnvFilter;

use seal::formats::{self, sidecar};
use seal::sign::{keygen, local, remote::RemoteSigner, LocalSigner, Signer};
use seal::store::{FieldKind, FieldStore};
use seal::{encode, record, srcref, Context, Mode};

#[derive(Parser)]
#[command(name = "sealtool", version = seal::VERSION)]
#[command(about = "Embed and verify SEAL signatures in media files")]
struct Cli {
    /// Generate a key pair (writes keyfile and dnsfile)
    #[arg(short = 'g', long = "generate")]
    generate: bool,

    /// Sign with a local private key
    #[arg(short = 's', long = "sign")]
    sign_local: bool,

    /// Sign through a remote signing service
    #[arg(short = 'S', long = "Sign")]
    sign_remote: bool,

    /// Sign a pre-computed hex digest with the local key ('' for a stub record)
    #[arg(short = 'm', long = "manual")]
    manual_local: Option<String>,

    /// Sign a pre-computed hex digest with the remote service
    #[arg(short = 'M', long = "Manual")]
    manual_remote: Option<String>,

    /// DNS domain that publishes the public key
    #[arg(short = 'd', long)]
    domain: Option<String>,

    /// Private key file (PEM)
    #[arg(short = 'k', long)]
    keyfile: Option<String>,

    /// Key algorithm: rsa, ec, P-256, P-384
    #[arg(short = 'K', long = "keyalg", alias = "ka")]
    keyalg: Option<String>,

    /// Digest algorithm: sha224, sha256, sha384, sha512
    #[arg(short = 'A', long = "digestalg", alias = "da")]
    digestalg: Option<String>,

    /// Key version selector
    #[arg(long)]
    kv: Option<String>,

    /// Key selector within a domain
    #[arg(long)]
    uid: Option<String>,

    /// Signature format, e.g. hex, HEX, base64, date3:hex
    #[arg(long)]
    sf: Option<String>,

    /// Output filename template: %b basename, %d dirname, %e extension, %% percent
    #[arg(short = 'o', long)]
    outfile: Option<String>,

    /// Comma-separated signing options (append, inline, seAl, teXt, ...)
    #[arg(short = 'O', long)]
    options: Option<String>,

    /// File with a DNS TXT value, used instead of live DNS
    #[arg(short = 'D', long)]
    dnsfile: Option<String>,

    /// Remote signing service URL
    #[arg(short = 'u', long)]
    apiurl: Option<String>,

    /// Remote signing service API key
    #[arg(short = 'a', long)]
    apikey: Option<String>,

    /// User-specific identifier bound into the double digest
    #[arg(short = 'i', long)]
    id: Option<String>,

    /// Generic comment text
    #[arg(short = 'c', long)]
    comment: Option<String>,

    /// Copyright text
    #[arg(short = 'C', long)]
    copyright: Option<String>,

    /// Informational comment text
    #[arg(long)]
    info: Option<String>,

    /// URL of the source media
    #[arg(long)]
    src: Option<String>,

    /// Source digest descriptor, e.g. sha256:base64
    #[arg(long)]
    srca: Option<String>,

    /// Source digest value
    #[arg(long)]
    srcd: Option<String>,

    /// Local file to digest into srcd (path is never emitted)
    #[arg(long)]
    srcf: Option<String>,

    /// Trusted root certificates for TLS
    #[arg(long)]
    cacert: Option<String>,

    /// Do not validate the server's TLS certificate
    #[arg(long = "cert-insecure")]
    cert_insecure: bool,

    /// Configuration file (default: $XDG_CONFIG_HOME/seal/config)
    #[arg(long)]
    config: Option<String>,

    /// RSA key size for -g
    #[arg(long)]
    keybits: Option<String>,

    /// Never touch the network for DNS lookups
    #[arg(long = "no-net")]
    no_net: bool,

    /// Sidecar filename template; the file arguments become source media
    #[arg(long)]
    sidecar: Option<String>,

    /// Key password on the command line (insecure convenience)
    #[arg(long = "genpass")]
    genpass: Option<String>,

    /// Write the effective settings as a config file and exit
    #[arg(short = 'W', long = "write-config")]
    write_config: bool,

    /// Verbose diagnostics (repeat for more)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Files to sign or verify
    files: Vec<PathBuf>,
}

fn main() {
    let cli = Cli::parse();
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(code) => std::process::exit(code as i32),
        Err(e) => {
            eprintln!(" ERROR: {e:#}. Aborting.");
            std::process::exit(0x80);
        }
    }
}

/// Fold CLI flags, the config file, and defaults into the clean
/// argument store (CLI wins, then config, then defaults).
fn build_args(cli: &Cli, cfg: &BTreeMap<String, String>) -> FieldStore {
    let mut args = FieldStore::new();
    args.set_text("seal", "1");
    args.set_text("b", "F~S,s~f");

    let pick = |cli_v: &Option<String>, key: &str, dflt: &str| -> String {
        cli_v
            .clone()
            .or_else(|| cfg.get(key).cloned())
            .unwrap_or_else(|| dflt.to_string())
    };

    args.set_text("da", &pick(&cli.digestalg, "digestalg", "sha256"));
    args.set_text("ka", &pick(&cli.keyalg, "keyalg", "rsa"));
    args.set_text("kv", &pick(&cli.kv, "kv", "1"));
    args.set_text("sf", &pick(&cli.sf, "sf", "HEX"));
    args.set_text("d", &pick(&cli.domain, "domain", "localhost.localdomain"));
    args.set_text("keyfile", &pick(&cli.keyfile, "keyfile", "./seal-private.pem"));
    args.set_text("outfile", &pick(&cli.outfile, "outfile", "./%b-seal%e"));
    args.set_text("keybits", &pick(&cli.keybits, "keybits", "2048"));
    for (cli_v, key) in [
        (&cli.options, "options"),
        (&cli.dnsfile, "dnsfile"),
        (&cli.apiurl, "apiurl"),
        (&cli.apikey, "apikey"),
        (&cli.id, "id"),
        (&cli.uid, "uid"),
        (&cli.info, "info"),
        (&cli.comment, "comment"),
        (&cli.copyright, "copyright"),
        (&cli.src, "src"),
        (&cli.srca, "srca"),
        (&cli.srcd, "srcd"),
        (&cli.srcf, "srcf"),
        (&cli.cacert, "cacert"),
        (&cli.sidecar, "sidecar"),
    ] {
        let v = pick(cli_v, key, "");
        if !v.is_empty() {
            args.set_text(key, &v);
        }
    }
    if cli.cert_insecure || cfg.get("cert-insecure").is_some_and(|v| v == "1") {
        args.set_text("cert-insecure", "1");
    }
    if cli.no_net || cfg.get("no-net").is_some_and(|v| v == "1") {
        args.set_text("no-net", "1");
    }
    // record attribute aliases
    for key in ["id", "info", "comment", "copyright"] {
        if !args.contains(key) {
            args.set_text(key, "");
        }
    }
    args
}

/// No mixed quotes, printable characters only, and numeric where the
/// wire demands a number.
fn validate_args(args: &FieldStore) -> Result<()> {
    for (key, value) in args.iter() {
        if value.kind != FieldKind::Text {
            continue;
        }
        let mut quote = 0u8;
        for &b in &value.bytes {
            if b == b'"' || b == b'\'' {
                if quote == 0 {
                    quote = b;
                } else if quote != b {
                    bail!("invalid parameter: '{key}' value contains mixed quotes");
                }
            } else if !(b == b' ' || b.is_ascii_graphic()) {
                bail!("invalid parameter: '{key}' value contains an invalid character");
            }
        }
    }
    for key in ["seal", "keybits", "kv"] {
        let v = args.text(key);
        if !v.is_empty() && !v.bytes().all(|b| b.is_ascii_digit()) {
            bail!("invalid parameter: '{key}' value is not numeric");
        }
    }
    Ok(())
}

fn prompt_password(confirm: bool) -> Result<Option<SecretString>> {
    let mut p = dialoguer::Password::new()
        .with_prompt("Enter password (blank for no password)")
        .allow_empty_password(true);
    if confirm {
        p = p.with_confirmation("Confirm password", "Passwords do not match");
    }
    let pwd = p.interact().context("cannot read password")?;
    if pwd.is_empty() {
        Ok(None)
    } else {
        Ok(Some(SecretString::new(pwd)))
    }
}

fn load_local_signer(args: &FieldStore, genpass: &Option<String>) -> Result<LocalSigner> {
    let keyfile = args.text("keyfile");
    let ka = args.text("ka");
    let pem = std::fs::read_to_string(&keyfile)
        .with_context(|| format!("unable to open private key file ({keyfile})"))?;
    let password = if local::pem_is_encrypted(&pem) {
        match genpass {
            Some(p) => Some(SecretString::new(p.clone())),
            None => prompt_password(false)?,
        }
    } else {
        None
    };
    let key = local::load_key(Path::new(&keyfile), &ka, password.as_ref())
        .with_context(|| format!("unable to load private key file ({keyfile})"))?;
    Ok(LocalSigner::new(key))
}

/// `-O inline`: carry the public key in the record itself.
fn set_inline_key(args: &mut FieldStore, signer: &LocalSigner) -> Result<()> {
    if !args.text("options").contains("inline") || args.is_set("pk") {
        return Ok(());
    }
    let der = signer.key().public_key_der()?;
    args.set_text("pk", &encode::base64_encode(&der));
    let da = args.text("da");
    let alg = seal::digest::HashAlg::from_name(&da)
        .ok_or_else(|| anyhow::anyhow!("unsupported digest algorithm (da={da})"))?;
    args.set_text("pka", &da);
    args.set_text("pkd", &encode::base64_encode(&alg.digest(&der)));
    Ok(())
}

fn run(cli: Cli) -> Result<u8> {
    let (cfg_path, cfg_required) = match &cli.config {
        Some(p) => (PathBuf::from(p), true),
        None => (config::default_path(), false),
    };
    let cfg = config::read(&cfg_path, cfg_required)?;
    let mut args = build_args(&cli, &cfg);
    validate_args(&args)?;

    if cli.write_config {
        let target = cli.config.clone().unwrap_or_else(|| "-".to_string());
        let by_key = |key: &str| -> String {
            match key {
                "domain" => args.text("d"),
                "digestalg" => args.text("da"),
                "keyalg" => args.text("ka"),
                other => args.text(other),
            }
        };
        config::write(&target, by_key)?;
        return Ok(0);
    }

    let mode_flags = [
        cli.generate,
        cli.sign_local,
        cli.sign_remote,
        cli.manual_local.is_some(),
        cli.manual_remote.is_some(),
    ];
    if mode_flags.iter().filter(|&&f| f).count() > 1 {
        bail!("only one of -g, -s, -S, -m, or -M is permitted");
    }

    if cli.generate {
        let dnsfile = if args.is_set("dnsfile") {
            args.text("dnsfile")
        } else {
            "./seal-public.dns".to_string()
        };
        let password = match &cli.genpass {
            Some(p) if !p.is_empty() => Some(SecretString::new(p.clone())),
            Some(_) => None,
            None => prompt_password(true)?,
        };
        let keyfile = args.text("keyfile");
        keygen::generate(&keygen::KeygenParams {
            ka: &args.text("ka"),
            bits: args.text("keybits").parse().unwrap_or(2048),
            kv: &args.text("kv"),
            uid: &args.text("uid"),
            keyfile: Path::new(&keyfile),
            dnsfile: Path::new(&dnsfile),
            password: password.as_ref(),
        })?;
        println!("Private key written to: {keyfile}");
        println!("Public DNS TXT value written to: {dnsfile}");
        return Ok(0);
    }

    let mode = if cli.sign_local || cli.manual_local.is_some() {
        Mode::SignLocal
    } else if cli.sign_remote || cli.manual_remote.is_some() {
        Mode::SignRemote
    } else {
        Mode::Verify
    };

    let mut ctx = Context::new(mode);
    ctx.resolver.no_net = args.is_set("no-net");
    if args.is_set("dnsfile") {
        ctx.resolver.load_file(args.text("dnsfile"))?;
    }

    if mode.is_signing() {
        let signer = match mode {
            Mode::SignLocal => {
                let s = load_local_signer(&args, &cli.genpass)?;
                set_inline_key(&mut args, &s)?;
                Signer::Local(s)
            }
            Mode::SignRemote => {
                let mut r = RemoteSigner::new(
                    &args.text("apiurl"),
                    &args.text("apikey"),
                    args.is_set("cert-insecure"),
                    args.get("cacert").map(|_| PathBuf::from(args.text("cacert"))),
                )?;
                r.verbose = cli.verbose > 0;
                Signer::Remote(r)
            }
            Mode::Verify => unreachable!(),
        };
        // The signature size never changes between files; size the
        // placeholder once.
        signer.dry_run(&mut args)?;
        if args.get_u32_index("@sigsize", 0) == 0 {
            bail!("unable to determine the signature size");
        }
        ctx.signer = Some(signer);

        if args.is_set("src") || args.is_set("srcf") || args.is_set("srcd") {
            srcref::prepare_for_signing(&mut args)?;
        }
    }

    // Manual mode: no files, just a record for the given digest.
    if let Some(digest_hex) = cli.manual_local.or(cli.manual_remote) {
        if !digest_hex.is_empty() {
            let bin = encode::hex_decode(digest_hex.as_bytes())
                .ok_or_else(|| anyhow::anyhow!("digest is not valid hex"))?;
            args.set("@digest1", bin, FieldKind::Binary);
            ctx.signer
                .as_ref()
                .expect("signing mode")
                .sign(&mut args)?;
        }
        record::build(&mut args);
        println!("{}", args.text("@record"));
        return Ok(ctx.verdicts);
    }

    if cli.files.is_empty() {
        bail!("no input files");
    }

    // Process each file against a pristine copy of the arguments.
    let clean = args.clone();
    let mut first = true;
    for file in &cli.files {
        if !first {
            println!();
        }
        first = false;
        println!("[{}]", file.display());

        let mut file_args = clean.clone();
        let result = if file_args.is_set("sidecar") {
            sidecar::process(&mut ctx, &mut file_args, file)
        } else {
            formats::process_file(&mut ctx, &mut file_args, file)
        };
        if let Err(e) = result {
            match e {
                seal::Error::Format(msg) => {
                    // A broken container skips the file, not the batch.
                    println!(" ERROR: {msg}. Skipping.");
                    ctx.verdicts |= seal::verify::verdict::UNSIGNED;
                }
                fatal => return Err(fatal.into()),
            }
        }
    }

    Ok(ctx.verdicts)
}
