//! Key-pair generation (`sealtool -g`).
//!
//! Writes the private key as PKCS#8 PEM (password-encrypted when a
//! password is given) and the public half as a single TXT-ready line:
//! `seal=1 ka=… [kv=…] [uid=…] p=<base64 DER>` for pasting into DNS.

use std::io::Write;
use std::path::Path;

use pkcs8::{EncodePrivateKey, EncodePublicKey};
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretString};

use crate::{encode, Error, Result};

pub struct KeygenParams<'a> {
    pub ka: &'a str,
    pub bits: usize,
    pub kv: &'a str,
    pub uid: &'a str,
    pub keyfile: &'a Path,
    pub dnsfile: &'a Path,
    pub password: Option<&'a SecretString>,
}

/// Generate a key pair and write both halves.
///
/// Returns the normalized `ka` value written into the DNS line (named
/// curves collapse to `ec`).
pub fn generate(params: &KeygenParams) -> Result<String> {
    let (private_pem, public_der, ka_out) = match params.ka {
        "rsa" => {
            if params.bits < 2048 {
                return Err(Error::Config(format!(
                    "RSA keys below 2048 bits are not accepted (keybits={})",
                    params.bits
                )));
            }
            let key = rsa::RsaPrivateKey::new(&mut OsRng, params.bits)
                .map_err(|e| Error::Key(format!("RSA key generation failed: {e}")))?;
            let pem = encode_private(&key, params.password)?;
            let der = key
                .to_public_key()
                .to_public_key_der()
                .map_err(|e| Error::Key(format!("cannot encode public key: {e}")))?;
            (pem, der.as_bytes().to_vec(), "rsa")
        }
        "ec" | "P-256" | "prime256v1" | "secp256r1" => {
            let key = p256::SecretKey::random(&mut OsRng);
            let pem = encode_private(&key, params.password)?;
            let der = key
                .public_key()
                .to_public_key_der()
                .map_err(|e| Error::Key(format!("cannot encode public key: {e}")))?;
            (pem, der.as_bytes().to_vec(), "ec")
        }
        "P-384" | "secp384r1" => {
            let key = p384::SecretKey::random(&mut OsRng);
            let pem = encode_private(&key, params.password)?;
            let der = key
                .public_key()
                .to_public_key_der()
                .map_err(|e| Error::Key(format!("cannot encode public key: {e}")))?;
            (pem, der.as_bytes().to_vec(), "ec")
        }
        other => {
            return Err(Error::Config(format!("Unsupported key algorithm (ka={other})")));
        }
    };

    std::fs::write(params.keyfile, private_pem.as_bytes())?;

    let mut line = format!("seal=1 ka={ka_out}");
    if params.kv != "1" && !params.kv.is_empty() {
        push_dns_value(&mut line, "kv", params.kv)?;
    }
    if !params.uid.is_empty() {
        push_dns_value(&mut line, "uid", params.uid)?;
    }
    line.push_str(&format!(" p={}", encode::base64_encode(&public_der)));

    let mut f = std::fs::File::create(params.dnsfile)?;
    writeln!(f, "{line}")?;
    Ok(ka_out.to_string())
}

/// DNS TXT values cannot carry quotes or whitespace; refuse early
/// rather than emit a fragment that will not parse back.
fn push_dns_value(line: &mut String, label: &str, value: &str) -> Result<()> {
    if value.contains(['"', '\'', ' ']) {
        return Err(Error::Config(format!(
            "invalid parameter: '{label}' value cannot contain quotes or spaces"
        )));
    }
    line.push_str(&format!(" {label}={value}"));
    Ok(())
}

fn encode_private<K: EncodePrivateKey>(
    key: &K,
    password: Option<&SecretString>,
) -> Result<String> {
    match password {
        Some(pwd) if !pwd.expose_secret().is_empty() => key
            .to_pkcs8_encrypted_pem(&mut OsRng, pwd.expose_secret().as_bytes(), Default::default())
            .map(|z| z.to_string())
            .map_err(|e| Error::Key(format!("cannot encrypt private key: {e}"))),
        _ => key
            .to_pkcs8_pem(Default::default())
            .map(|z| z.to_string())
            .map_err(|e| Error::Key(format!("cannot encode private key: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sign::local;

    #[test]
    fn ec_keypair_round_trips_through_files() {
        let dir = tempfile::tempdir().unwrap();
        let keyfile = dir.path().join("seal-private.pem");
        let dnsfile = dir.path().join("seal-public.dns");
        let ka = generate(&KeygenParams {
            ka: "ec",
            bits: 0,
            kv: "1",
            uid: "",
            keyfile: &keyfile,
            dnsfile: &dnsfile,
            password: None,
        })
        .unwrap();
        assert_eq!(ka, "ec");

        let line = std::fs::read_to_string(&dnsfile).unwrap();
        assert!(line.starts_with("seal=1 ka=ec p="));

        let key = local::load_key(&keyfile, "ec", None).unwrap();
        assert!(matches!(key, local::SigningKey::P256(_)));
    }

    #[test]
    fn uid_with_spaces_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = generate(&KeygenParams {
            ka: "ec",
            bits: 0,
            kv: "1",
            uid: "has space",
            keyfile: &dir.path().join("k.pem"),
            dnsfile: &dir.path().join("k.dns"),
            password: None,
        });
        assert!(err.is_err());
    }

    #[test]
    fn small_rsa_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = generate(&KeygenParams {
            ka: "rsa",
            bits: 1024,
            kv: "1",
            uid: "",
            keyfile: &dir.path().join("k.pem"),
            dnsfile: &dir.path().join("k.dns"),
            password: None,
        });
        assert!(err.is_err());
    }
}
