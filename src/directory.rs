use crate::classify::{build_http_client, endpoint};
use crate::config::Config;
use crate::headers::parse_address;
use anyhow::{anyhow, Context, Result};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use url::Url;

/// Address book membership and spam class lookups for an account.
#[allow(async_fn_in_trait)]
pub trait Directory {
    /// Names of the books owned by `account` that list `from`.
    async fn books_containing(&mut self, account: &str, from: &str) -> Result<Vec<String>>;
    /// Class label `account` assigns to `score`.
    async fn class_for(&mut self, account: &str, score: f64) -> Result<String>;
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct ApiResponse {
    user: String,
    request: String,
    message: String,
    success: bool,
}

#[derive(Debug, Deserialize)]
struct BooksResponse {
    #[serde(flatten)]
    status: ApiResponse,
    #[serde(rename = "Books", default)]
    books: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ClassResponse {
    #[serde(flatten)]
    status: ApiResponse,
    #[serde(rename = "Class", default)]
    class: String,
}

/// Client for the filterctl address book / class service.
pub struct FilterctlClient {
    client: Client,
    url: Url,
}

impl FilterctlClient {
    pub fn new(config: &Config) -> Result<Self> {
        let client = build_http_client(config)?;
        let url = Url::parse(&config.filterctl_url)
            .with_context(|| format!("invalid filterctl url: {}", config.filterctl_url))?;
        Ok(Self { client, url })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = endpoint(&self.url, path);
        log::debug!("--> GET {url}");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("request failed")?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("API returned status {status}"));
        }
        let body = response
            .bytes()
            .await
            .context("failure reading response body")?;
        log::debug!("<-- {}", String::from_utf8_lossy(&body));
        serde_json::from_slice(&body).context("failed decoding JSON response")
    }
}

fn check(status: &ApiResponse) -> Result<()> {
    if status.success {
        Ok(())
    } else {
        Err(anyhow!(
            "{} request for {} failed: {}",
            status.request,
            status.user,
            status.message
        ))
    }
}

impl Directory for FilterctlClient {
    async fn books_containing(&mut self, account: &str, from: &str) -> Result<Vec<String>> {
        let account = parse_address(account)?;
        let from = parse_address(from)?;
        let response: BooksResponse = self
            .get(&format!("/filterctl/scan/{account}/{from}/"))
            .await?;
        check(&response.status)?;
        log::debug!("Books for {account} containing {from}: {:?}", response.books);
        Ok(response.books)
    }

    async fn class_for(&mut self, account: &str, score: f64) -> Result<String> {
        let account = parse_address(account)?;
        let response: ClassResponse = self
            .get(&format!("/filterctl/class/{account}/{score:.4}/"))
            .await?;
        check(&response.status)?;
        log::debug!("Class for {account} at {score:.4}: {}", response.class);
        Ok(response.class)
    }
}
