//! Blocking HTTP access for slice maps, reason documents, tracker calls,
//! patches and image downloads.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::{AUTHORIZATION, HeaderValue};
use tracing::{debug, instrument};

/// Timeout for small text documents. Downloads are unbounded.
const TEXT_TIMEOUT: Duration = Duration::from_secs(60);

pub trait Fetch {
    /// GET a document as text. Non-success statuses are errors.
    fn get_text(&self, url: &str) -> Result<String>;

    /// GET a document into `dest`, replacing it atomically. Returns bytes written.
    fn download(&self, url: &str, dest: &Path) -> Result<u64>;
}

#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    auth: Option<HeaderValue>,
}

impl HttpClient {
    pub fn new(user_agent: &str, token: Option<&str>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(None)
            .build()
            .context("build http client")?;
        let auth = token
            .map(|token| {
                let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                    .context("token is not a valid header value")?;
                value.set_sensitive(true);
                anyhow::Ok(value)
            })
            .transpose()?;
        Ok(Self { client, auth })
    }

    fn get(&self, url: &str) -> RequestBuilder {
        let request = self.client.get(url);
        match &self.auth {
            Some(value) => request.header(AUTHORIZATION, value.clone()),
            None => request,
        }
    }
}

impl Fetch for HttpClient {
    #[instrument(skip(self))]
    fn get_text(&self, url: &str) -> Result<String> {
        let response = self
            .get(url)
            .timeout(TEXT_TIMEOUT)
            .send()
            .with_context(|| format!("GET {url}"))?
            .error_for_status()
            .with_context(|| format!("GET {url}"))?;
        let text = response
            .text()
            .with_context(|| format!("read body of {url}"))?;
        debug!(bytes = text.len(), "fetched document");
        Ok(text)
    }

    #[instrument(skip(self), fields(dest = %dest.display()))]
    fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        let mut response = self
            .get(url)
            .send()
            .with_context(|| format!("GET {url}"))?
            .error_for_status()
            .with_context(|| format!("GET {url}"))?;

        let parent = match dest.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)
            .with_context(|| format!("create temp file in {}", parent.display()))?;
        let written = response
            .copy_to(&mut tmp)
            .with_context(|| format!("download {url}"))?;
        tmp.flush().context("flush download")?;
        tmp.persist(dest)
            .with_context(|| format!("replace {}", dest.display()))?;
        debug!(bytes = written, "downloaded");
        Ok(written)
    }
}
