//! Remote signing through an HTTP signing service.
//!
//! The service receives a form-encoded POST:
//! `seal=1&id=…&apikey=…&kv=…&ka=…&da=…&sf=…[&verbose=1][&digest=HEX]`
//! and answers JSON `{ "sigsize": n, "signature": "...",
//! "double-digest": "hex" }`. A request without `digest` is the dry run.
//! Transport failures are fatal (exit-code class 0x80).

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::store::{FieldKind, FieldStore};
use crate::{encode, Error, Result};

#[derive(Debug, Deserialize)]
struct SignReply {
    sigsize: Option<serde_json::Value>,
    signature: Option<String>,
    #[serde(rename = "double-digest")]
    double_digest: Option<String>,
}

pub struct RemoteSigner {
    client: reqwest::blocking::Client,
    url: String,
    apikey: String,
    /// Ask the service to echo the double digest.
    pub verbose: bool,
}

impl RemoteSigner {
    pub fn new(
        url: &str,
        apikey: &str,
        cert_insecure: bool,
        cacert: Option<PathBuf>,
    ) -> Result<Self> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(Error::Config(format!(
                "apiurl does not begin with http:// or https:// ({url})"
            )));
        }
        let mut builder = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(20))
            .timeout(Duration::from_secs(10));
        if cert_insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(path) = cacert {
            let pem = std::fs::read(&path)?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| Error::Config(format!("bad cacert {}: {e}", path.display())))?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder
            .build()
            .map_err(|e| Error::Network(format!("cannot build HTTP client: {e}")))?;
        Ok(RemoteSigner {
            client,
            url: url.to_string(),
            apikey: apikey.to_string(),
            verbose: false,
        })
    }

    /// One service round trip. Serves as both the dry run (no
    /// `@digest1`) and the real signing call.
    pub fn invoke(&self, args: &mut FieldStore) -> Result<()> {
        args.delete("@signatureenc");

        let mut form: Vec<(&str, String)> = vec![("seal", "1".into())];
        for (field, key) in [("id", "id"), ("kv", "kv"), ("ka", "ka"), ("da", "da"), ("sf", "sf")] {
            let v = args.text(key);
            if !v.is_empty() {
                form.push((field, v));
            }
        }
        if !self.apikey.is_empty() {
            form.push(("apikey", self.apikey.clone()));
        }
        if self.verbose {
            form.push(("verbose", "1".into()));
        }
        if args.is_set("@digest1") {
            form.push(("digest", encode::hex_encode(args.bytes("@digest1"), false)));
        }

        let reply: SignReply = self
            .client
            .post(&self.url)
            .form(&form)
            .send()
            .map_err(|e| Error::Network(format!("signing service request failed: {e}")))?
            .error_for_status()
            .map_err(|e| Error::Network(format!("signing service rejected request: {e}")))?
            .json()
            .map_err(|e| Error::Network(format!("signing service reply is not JSON: {e}")))?;

        if let Some(dd) = reply.double_digest {
            if let Some(bin) = encode::hex_decode(dd.as_bytes()) {
                args.set("@digest2", bin, FieldKind::Binary);
            }
        }
        if let Some(size) = reply.sigsize {
            let n = match size {
                serde_json::Value::Number(n) => n.as_u64().unwrap_or(0) as u32,
                serde_json::Value::String(s) => s.trim().parse().unwrap_or(0),
                _ => 0,
            };
            args.set_u32_index("@sigsize", 0, n);
        }
        if let Some(sig) = reply.signature {
            args.set("@signatureenc", sig.into_bytes(), FieldKind::Text);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_http_urls() {
        assert!(RemoteSigner::new("ftp://sign.example", "", false, None).is_err());
        assert!(RemoteSigner::new("sign.example", "k", false, None).is_err());
    }

    #[test]
    fn accepts_http_and_https() {
        assert!(RemoteSigner::new("http://sign.example/api", "k", false, None).is_ok());
        assert!(RemoteSigner::new("https://sign.example/api", "k", true, None).is_ok());
    }
}
