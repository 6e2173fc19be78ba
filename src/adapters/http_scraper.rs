use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use readability_js::{Readability, ReadabilityError, ReadabilityOptions};
use sha2::Digest as _;
use url::Url;

use super::{AdapterError, ScrapedPage, Scraper};
use crate::config::ScraperConfig;

/// Fetches `http(s)://` and `file://` pages, extracts the main article with
/// readability, and converts it to Markdown.
#[derive(Debug, Clone)]
pub struct HttpScraper {
    client: reqwest::Client,
    snapshot_dir: Option<PathBuf>,
}

impl HttpScraper {
    /// `snapshot_dir` receives a raw HTML copy of every page fetched.
    pub fn new(config: &ScraperConfig, snapshot_dir: Option<PathBuf>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .user_agent(config.user_agent.clone())
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            snapshot_dir: snapshot_dir.filter(|_| config.snapshots),
        })
    }

    async fn fetch_html(&self, url: &Url) -> Result<String, AdapterError> {
        match url.scheme() {
            "http" | "https" => {
                let response = self.client.get(url.clone()).send().await.map_err(|err| {
                    if err.is_timeout() {
                        AdapterError::Timeout
                    } else {
                        AdapterError::Transient(format!("GET {url}: {err}"))
                    }
                })?;
                let status = response.status();
                if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                    return Err(AdapterError::Transient(format!("GET {url}: {status}")));
                }
                if !status.is_success() {
                    return Err(AdapterError::Fatal(format!("GET {url}: {status}")));
                }
                response
                    .text()
                    .await
                    .map_err(|err| AdapterError::Transient(format!("read body of {url}: {err}")))
            }
            "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|()| AdapterError::Fatal(format!("not a local file url: {url}")))?;
                tokio::fs::read_to_string(&path).await.map_err(|err| {
                    AdapterError::Fatal(format!("read {}: {err}", path.display()))
                })
            }
            scheme => Err(AdapterError::Fatal(format!(
                "unsupported url scheme `{scheme}`: {url}"
            ))),
        }
    }
}

#[async_trait]
impl Scraper for HttpScraper {
    async fn scrape(&self, url: &Url) -> Result<ScrapedPage, AdapterError> {
        let html = self.fetch_html(url).await?;
        let retrieved_at = chrono::Utc::now();

        let snapshot_ref = match &self.snapshot_dir {
            Some(dir) => match write_snapshot(dir, url, &html).await {
                Ok(path) => Some(path.to_string_lossy().into_owned()),
                Err(err) => {
                    tracing::warn!(
                        %url,
                        err = %format!("{err:#}"),
                        "failed to write html snapshot"
                    );
                    None
                }
            },
            None => None,
        };

        let html_len = html.len();
        let page_url = url.to_string();
        let extracted = tokio::task::spawn_blocking(move || extract(&html, &page_url))
            .await
            .map_err(|err| AdapterError::Fatal(format!("join extraction task: {err}")))??;

        let content = extracted.body_md.trim().to_owned();
        if content.is_empty() {
            return Err(AdapterError::BadOutput(format!(
                "no readable content extracted from {url}"
            )));
        }
        let title = match extracted.title.trim() {
            "" => url.to_string(),
            title => title.to_owned(),
        };

        let metadata = BTreeMap::from([
            ("source_url".to_owned(), url.to_string()),
            ("retrieved_at".to_owned(), retrieved_at.to_rfc3339()),
            ("html_bytes".to_owned(), html_len.to_string()),
            ("extraction".to_owned(), extracted.method.to_owned()),
        ]);

        tracing::info!(%url, chars = content.len(), method = extracted.method, "scraped page");
        Ok(ScrapedPage {
            content,
            title,
            metadata,
            snapshot_ref,
        })
    }
}

#[derive(Debug)]
struct Extracted {
    title: String,
    body_md: String,
    method: &'static str,
}

fn extract(html: &str, url: &str) -> Result<Extracted, AdapterError> {
    let readability = Readability::new()
        .map_err(|err| AdapterError::Fatal(format!("initialize readability-js: {err}")))?;
    match extract_with_readability(&readability, html, url) {
        Ok(extracted) => Ok(extracted),
        Err(err) => {
            tracing::debug!(url, ?err, "readability extraction failed; converting whole page");
            Ok(Extracted {
                title: String::new(),
                body_md: html2md::parse_html(html),
                method: "full_page",
            })
        }
    }
}

fn extract_with_readability(
    readability: &Readability,
    html: &str,
    url: &str,
) -> Result<Extracted, ReadabilityError> {
    match readability.parse_with_url(html, url) {
        Ok(article) => Ok(Extracted {
            title: article.title,
            body_md: html2md::parse_html(&article.content),
            method: "readability",
        }),
        Err(ReadabilityError::ReadabilityCheckFailed) => {
            let options = ReadabilityOptions::new()
                .char_threshold(0)
                .nb_top_candidates(10)
                .link_density_modifier(2.0);
            let article = readability.parse_with_options(html, Some(url), Some(options))?;
            Ok(Extracted {
                title: article.title,
                body_md: html2md::parse_html(&article.content),
                method: "readability_relaxed",
            })
        }
        Err(err) => Err(err),
    }
}

/// `<dir>/html/<host>[_<port>]/<path segments>/<content digest>.html`.
/// Local files land under `local/`.
pub fn snapshot_path(dir: &Path, url: &Url, html: &str) -> anyhow::Result<PathBuf> {
    let host_segment = match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}_{port}"),
        (Some(host), None) => host.to_owned(),
        (None, _) => "local".to_owned(),
    };

    let mut path = dir.join("html").join(host_segment);
    for segment in url.path().split('/') {
        if segment.is_empty() || segment == "." {
            continue;
        }
        if segment == ".." {
            anyhow::bail!("url path must not contain '..': {url}");
        }
        path = path.join(segment);
    }

    let digest = hex::encode(sha2::Sha256::digest(html.as_bytes()));
    Ok(path.join(format!("{}.html", &digest[..16])))
}

async fn write_snapshot(dir: &Path, url: &Url, html: &str) -> anyhow::Result<PathBuf> {
    let path = snapshot_path(dir, url, html)?;
    if tokio::fs::try_exists(&path).await.unwrap_or(false) {
        return Ok(path);
    }
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("snapshot path must have parent: {}", path.display()))?;
    tokio::fs::create_dir_all(parent)
        .await
        .with_context(|| format!("create snapshot dir: {}", parent.display()))?;
    tokio::fs::write(&path, html)
        .await
        .with_context(|| format!("write snapshot: {}", path.display()))?;
    Ok(path)
}
