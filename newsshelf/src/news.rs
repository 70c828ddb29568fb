use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::http::{build_client, send_with_retry, RetryPolicy};

const PROVIDER: &str = "news";
const SHOW_FIELDS: &str = "body,bodyText,headline,trailText,thumbnail";

/// Article as received from the news provider, before any analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct RawArticle {
    /// Provider-assigned identifier, unique per article
    pub external_id: String,
    pub title: String,
    pub trail_text: Option<String>,
    pub body: String,
    pub url: String,
    pub section: Option<String>,
    /// Lead image, when the provider has one
    pub image_url: Option<String>,
    pub source: String,
    pub published_at: Option<DateTime<Utc>>,
}

/// Which slice of the provider's result list to read.
#[derive(Debug, Clone)]
pub struct PageWindow {
    pub first_page: u32,
    pub page_size: u32,
    pub max_pages: u32,
    pub from_date: Option<DateTime<Utc>>,
}

impl Default for PageWindow {
    fn default() -> Self {
        Self {
            first_page: 1,
            page_size: 20,
            max_pages: 1,
            from_date: None,
        }
    }
}

#[async_trait::async_trait]
pub trait NewsSource: Send + Sync {
    /// Fetch articles matching any of `filter_terms` within the page window.
    async fn fetch_candidates(&self, filter_terms: &[String], window: &PageWindow) -> Result<Vec<RawArticle>>;
}

/// Client for the Guardian content API search endpoint.
pub struct GuardianClient {
    search_url: String,
    api_key: String,
    section: Option<String>,
    retry: RetryPolicy,
    client: reqwest::Client,
}

impl GuardianClient {
    pub fn new(api_url: &str, api_key: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let base = url::Url::parse(api_url).with_context(|| format!("invalid news api_url: {}", api_url))?;
        let search_url = format!("{}/search", base.as_str().trim_end_matches('/'));
        Ok(Self {
            search_url,
            api_key: api_key.into(),
            section: None,
            retry: RetryPolicy::default(),
            client: build_client(timeout).context("failed to build reqwest client")?,
        })
    }

    pub fn from_config(cfg: &common::NewsConfig, retry: RetryPolicy) -> anyhow::Result<Self> {
        let api_url = cfg.api_url.as_deref().unwrap_or("https://content.guardianapis.com");
        let api_key = common::api_key_from_env("news", cfg.api_key_env.as_deref())?;
        let timeout = Duration::from_secs(cfg.timeout_seconds.unwrap_or(30));
        Ok(Self::new(api_url, api_key, timeout)?
            .with_section(cfg.section.clone())
            .with_retry(retry))
    }

    pub fn with_section(mut self, section: Option<String>) -> Self {
        self.section = section.filter(|s| !s.trim().is_empty());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn fetch_page(&self, query: &str, page: u32, window: &PageWindow) -> Result<SearchResponse> {
        let mut params: Vec<(&str, String)> = vec![
            ("q", query.to_string()),
            ("page", page.to_string()),
            ("page-size", window.page_size.to_string()),
            ("order-by", "newest".to_string()),
            ("show-fields", SHOW_FIELDS.to_string()),
            ("api-key", self.api_key.clone()),
        ];
        if let Some(from) = window.from_date {
            params.push(("from-date", from.format("%Y-%m-%d").to_string()));
        }
        if let Some(section) = &self.section {
            params.push(("section", section.clone()));
        }

        let response = send_with_retry(&self.retry, "news API", || self.client.get(&self.search_url).query(&params))
            .await
            .map_err(|failure| PipelineError::upstream(PROVIDER, failure.to_string()))?;

        let envelope: SearchEnvelope = response.json().await.map_err(|e| {
            if e.is_timeout() {
                PipelineError::upstream(PROVIDER, "news API response timed out")
            } else {
                PipelineError::malformed("news API", e.to_string())
            }
        })?;

        if envelope.response.status.as_deref().map_or(false, |s| s != "ok") {
            return Err(PipelineError::upstream(
                PROVIDER,
                format!("news API status '{}'", envelope.response.status.unwrap_or_default()),
            ));
        }

        Ok(envelope.response)
    }
}

#[async_trait::async_trait]
impl NewsSource for GuardianClient {
    async fn fetch_candidates(&self, filter_terms: &[String], window: &PageWindow) -> Result<Vec<RawArticle>> {
        let query = build_query(filter_terms)?;
        let mut articles = Vec::new();
        let last_page = window.first_page.saturating_add(window.max_pages.max(1) - 1);

        for page in window.first_page.max(1)..=last_page {
            let response = match self.fetch_page(&query, page, window).await {
                Ok(r) => r,
                Err(e) if articles.is_empty() => return Err(e),
                Err(e) => {
                    warn!(page, error = %e, "news: later page failed, keeping articles already fetched");
                    break;
                }
            };

            let received = response.results.len();
            debug!(page, received, total_pages = ?response.pages, "news: page fetched");
            articles.extend(response.results.into_iter().filter_map(into_raw_article));

            let exhausted = response.pages.map_or(false, |pages| page >= pages);
            if exhausted || received < window.page_size as usize {
                break;
            }
        }

        info!(count = articles.len(), query = %query, "news: fetched candidate articles");
        Ok(articles)
    }
}

/// Build the provider query: multi-word terms are quoted, terms joined with OR.
pub fn build_query(filter_terms: &[String]) -> Result<String> {
    let terms: Vec<String> = filter_terms
        .iter()
        .map(|t| t.trim().trim_matches('"').trim())
        .filter(|t| !t.is_empty())
        .map(|t| {
            if t.contains(char::is_whitespace) {
                format!("\"{}\"", t)
            } else {
                t.to_string()
            }
        })
        .collect();

    if terms.is_empty() {
        return Err(PipelineError::InvalidInput("filter term list is empty".into()));
    }
    Ok(terms.join(" OR "))
}

fn into_raw_article(result: SearchResult) -> Option<RawArticle> {
    let fields = result.fields.unwrap_or_default();
    let body = fields
        .body_text
        .filter(|t| !t.trim().is_empty())
        .or_else(|| fields.body.as_deref().and_then(html_to_text))
        .or_else(|| fields.trail_text.clone())
        .unwrap_or_default();

    if result.web_url.is_empty() {
        debug!(id = %result.id, "news: skipping result without URL");
        return None;
    }

    Some(RawArticle {
        external_id: result.id,
        title: fields.headline.unwrap_or(result.web_title),
        trail_text: fields.trail_text,
        body,
        url: result.web_url,
        section: result.section_name,
        image_url: fields.thumbnail.filter(|u| !u.trim().is_empty()),
        source: "The Guardian".to_string(),
        published_at: result.web_publication_date,
    })
}

fn html_to_text(html: &str) -> Option<String> {
    match html2text::from_read(html.as_bytes(), 100) {
        Ok(text) if !text.trim().is_empty() => Some(text),
        Ok(_) => None,
        Err(e) => {
            warn!("news: failed to convert article HTML to text: {}", e);
            None
        }
    }
}

// Guardian API response structures
#[derive(Debug, Deserialize)]
struct SearchEnvelope {
    response: SearchResponse,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    status: Option<String>,
    pages: Option<u32>,
    #[serde(default)]
    results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResult {
    id: String,
    web_title: String,
    #[serde(default)]
    web_url: String,
    section_name: Option<String>,
    web_publication_date: Option<DateTime<Utc>>,
    fields: Option<ResultFields>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultFields {
    headline: Option<String>,
    trail_text: Option<String>,
    body: Option<String>,
    body_text: Option<String>,
    thumbnail: Option<String>,
}
