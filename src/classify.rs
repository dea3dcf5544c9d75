use crate::config::{expand_path, Config};
use crate::headers::RoutingContext;
use anyhow::{anyhow, Context, Result};
use reqwest::{Certificate, Client, Identity};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

/// Decoded rspamd `checkv2` result. Fields the rescan does not use are
/// tolerated, anything unknown is ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct Verdict {
    pub score: f64,
    #[serde(rename = "required_score")]
    pub required: f64,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub symbols: BTreeMap<String, Symbol>,
    #[serde(default)]
    pub milter: MilterInstructions,
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub thresholds: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Symbol {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub metric_score: Option<f64>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MilterInstructions {
    #[serde(default)]
    pub add_headers: BTreeMap<String, AddHeader>,
    #[serde(default)]
    pub remove_headers: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "RawAddHeader")]
pub struct AddHeader {
    pub value: String,
    pub order: i64,
}

// rspamd sends either {"value": ..., "order": ...} or a bare string
#[derive(Deserialize)]
#[serde(untagged)]
enum RawAddHeader {
    Entry {
        value: String,
        #[serde(default)]
        order: i64,
    },
    Text(String),
}

impl From<RawAddHeader> for AddHeader {
    fn from(raw: RawAddHeader) -> Self {
        match raw {
            RawAddHeader::Entry { value, order } => AddHeader { value, order },
            RawAddHeader::Text(value) => AddHeader { value, order: 0 },
        }
    }
}

impl Verdict {
    /// `(name, score)` pairs in ascending name order.
    pub fn sorted_symbols(&self) -> Vec<(&str, f64)> {
        let mut symbols: Vec<(&str, f64)> = self
            .symbols
            .iter()
            .map(|(key, symbol)| {
                let name = if symbol.name.is_empty() {
                    key.as_str()
                } else {
                    symbol.name.as_str()
                };
                (name, symbol.score)
            })
            .collect();
        symbols.sort_by(|a, b| a.0.cmp(b.0));
        symbols
    }

    /// Value the service wants for `name`, matched case-insensitively.
    pub fn added_value(&self, name: &str) -> Option<&str> {
        self.milter
            .add_headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, header)| header.value.as_str())
    }

    pub fn requests_removal(&self, name: &str) -> bool {
        self.milter
            .remove_headers
            .keys()
            .any(|key| key.eq_ignore_ascii_case(name))
    }
}

/// Remote content classification.
#[allow(async_fn_in_trait)]
pub trait Classifier {
    async fn classify(&self, message: &[u8], context: &RoutingContext) -> Result<Verdict>;
}

/// Build an HTTP client carrying the configured client credentials.
pub fn build_http_client(config: &Config) -> Result<Client> {
    let mut builder = Client::builder()
        .timeout(Duration::from_secs(config.timeout_seconds))
        .user_agent(concat!("rspamd-rescan/", env!("CARGO_PKG_VERSION")));

    if let (Some(cert), Some(key)) = (&config.client_cert, &config.client_key) {
        let cert_path = expand_path(cert)?;
        let key_path = expand_path(key)?;
        let cert_pem = std::fs::read(&cert_path)
            .with_context(|| format!("error loading client certificate {}", cert_path.display()))?;
        let key_pem = std::fs::read(&key_path)
            .with_context(|| format!("error loading client key {}", key_path.display()))?;
        let identity = Identity::from_pkcs8_pem(&cert_pem, &key_pem)
            .context("error loading client certificate pair")?;
        builder = builder.identity(identity);
    }

    if let Some(ca) = &config.ca_cert {
        let ca_path = expand_path(ca)?;
        let ca_pem = std::fs::read(&ca_path).with_context(|| {
            format!("error loading certificate authority file {}", ca_path.display())
        })?;
        builder = builder.add_root_certificate(Certificate::from_pem(&ca_pem)?);
    }

    Ok(builder.build()?)
}

/// `path` appended to the path of `base`, keeping any prefix it carries.
pub(crate) fn endpoint(base: &Url, path: &str) -> Url {
    let mut url = base.clone();
    url.set_path(&format!(
        "{}/{}",
        base.path().trim_end_matches('/'),
        path.trim_start_matches('/')
    ));
    url
}

pub struct RspamdClient {
    client: Client,
    url: Url,
    hostname: String,
    settings: String,
}

impl RspamdClient {
    pub fn new(config: &Config) -> Result<Self> {
        let client = build_http_client(config)?;
        Self::with_client(client, config)
    }

    pub fn with_client(client: Client, config: &Config) -> Result<Self> {
        let base = Url::parse(&config.rspamd_url)
            .with_context(|| format!("invalid rspamd url: {}", config.rspamd_url))?;
        let url = endpoint(&base, &config.checkv2_path);
        let settings = serde_json::json!({ "symbols_disabled": config.disabled_symbols });
        Ok(Self {
            client,
            url,
            hostname: config.local_hostname(),
            settings: settings.to_string(),
        })
    }
}

impl Classifier for RspamdClient {
    async fn classify(&self, message: &[u8], context: &RoutingContext) -> Result<Verdict> {
        log::debug!("--> POST {}", self.url);
        let response = self
            .client
            .post(self.url.clone())
            .header("Settings", &self.settings)
            .header("IP", context.sender_ip.to_string())
            .header("From", &context.from)
            .header("Rcpt", &context.rcpt)
            .header("Deliver-To", &context.delivered_to)
            .header("Hostname", &self.hostname)
            .body(message.to_vec())
            .send()
            .await
            .context("classification request failed")?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("classification service returned status {status}"));
        }
        let verdict: Verdict = response
            .json()
            .await
            .context("failed decoding classification response")?;

        log::debug!(
            "<-- score={:.3} required={:.3} symbols={}",
            verdict.score,
            verdict.required,
            verdict.symbols.len()
        );
        for name in verdict.milter.remove_headers.keys() {
            log::debug!("remove: {name}");
        }
        for (name, header) in &verdict.milter.add_headers {
            log::debug!("add: {name}: {}", header.value);
        }
        Ok(verdict)
    }
}
