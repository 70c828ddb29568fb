use anyhow::Context;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{PipelineError, Result};
use crate::http::{build_client, send_with_retry, RetryPolicy};

const PROVIDER: &str = "book catalog";
const MAX_DESCRIPTION_CHARS: usize = 500;

/// Titles containing any of these are programming or reference books, never topical reading.
pub const DEFAULT_EXCLUDED_TITLE_TERMS: &[&str] = &[
    "sql", "programming", "database", "oracle", "software", "computer", "coding",
    "textbook", "manual", "handbook", "guide to", "tutorial", "workbook",
    "certification", "exam prep", "dictionary", "encyclopedia",
];

pub const DEFAULT_SUBJECT_FILTERS: &[&str] = &[
    "Social Science", "Political Science", "History", "Law", "Education",
    "Philosophy", "Sociology", "Psychology", "Social Justice", "Medical", "Art",
];

pub const DEFAULT_MIN_PUBLISHED_YEAR: i32 = 1990;

/// Book record returned by the catalog, already filtered and ISBN-normalized.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateBook {
    /// ISBN-13
    pub isbn: String,
    pub catalog_id: Option<String>,
    pub title: String,
    pub authors: Vec<String>,
    pub description: String,
    pub info_url: Option<String>,
    pub cover_url: Option<String>,
    pub published_date: Option<String>,
    pub categories: Vec<String>,
}

#[async_trait::async_trait]
pub trait BookCatalog: Send + Sync {
    /// Search the catalog for one keyword. Order is the provider's relevance order.
    async fn search(&self, keyword: &str) -> Result<Vec<CandidateBook>>;
}

/// Which catalog entries are kept as candidates.
#[derive(Debug, Clone)]
pub struct CandidateFilter {
    pub excluded_title_terms: Vec<String>,
    /// Empty list disables the category check
    pub subject_filters: Vec<String>,
    pub min_published_year: Option<i32>,
}

impl Default for CandidateFilter {
    fn default() -> Self {
        Self {
            excluded_title_terms: DEFAULT_EXCLUDED_TITLE_TERMS.iter().map(|s| s.to_string()).collect(),
            subject_filters: DEFAULT_SUBJECT_FILTERS.iter().map(|s| s.to_string()).collect(),
            min_published_year: Some(DEFAULT_MIN_PUBLISHED_YEAR),
        }
    }
}

impl CandidateFilter {
    pub fn from_config(cfg: &common::BooksConfig) -> Self {
        let default = Self::default();
        Self {
            excluded_title_terms: cfg
                .excluded_title_terms
                .clone()
                .map(|terms| terms.into_iter().map(|t| t.to_lowercase()).collect())
                .unwrap_or(default.excluded_title_terms),
            subject_filters: cfg.subject_filters.clone().unwrap_or(default.subject_filters),
            min_published_year: cfg.min_published_year.or(default.min_published_year),
        }
    }

    /// Reason the volume is rejected, or `None` if it passes.
    fn rejection(&self, info: &VolumeInfo) -> Option<String> {
        let title = info.title.to_lowercase();
        if let Some(term) = self.excluded_title_terms.iter().find(|t| title.contains(t.as_str())) {
            return Some(format!("title contains excluded term '{}'", term));
        }

        if !self.subject_filters.is_empty() {
            let matches_subject = info.categories.iter().any(|category| {
                let category = category.to_lowercase();
                self.subject_filters
                    .iter()
                    .any(|subject| category.contains(&subject.to_lowercase()))
            });
            if !matches_subject {
                return Some(format!("categories {:?} match no subject filter", info.categories));
            }
        }

        if let (Some(min_year), Some(year)) = (self.min_published_year, published_year(info.published_date.as_deref())) {
            if year < min_year {
                return Some(format!("published {} before {}", year, min_year));
            }
        }

        None
    }
}

/// Client for the Google Books volumes endpoint.
pub struct GoogleBooksClient {
    volumes_url: String,
    api_key: Option<String>,
    max_results: u32,
    query_suffix: Option<String>,
    filter: CandidateFilter,
    retry: RetryPolicy,
    client: reqwest::Client,
}

impl GoogleBooksClient {
    pub fn new(volumes_url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            volumes_url: volumes_url.into(),
            api_key,
            max_results: 20,
            query_suffix: None,
            filter: CandidateFilter::default(),
            retry: RetryPolicy::default(),
            client: build_client(timeout).context("failed to build reqwest client")?,
        })
    }

    pub fn from_config(cfg: &common::BooksConfig, retry: RetryPolicy) -> anyhow::Result<Self> {
        let url = cfg
            .api_url
            .clone()
            .unwrap_or_else(|| "https://www.googleapis.com/books/v1/volumes".to_string());
        // The volumes endpoint works without a key at a lower quota.
        let api_key = match cfg.api_key_env.as_deref() {
            Some(_) => Some(common::api_key_from_env("books", cfg.api_key_env.as_deref())?),
            None => None,
        };
        let timeout = Duration::from_secs(cfg.timeout_seconds.unwrap_or(30));
        Ok(Self::new(url, api_key, timeout)?
            .with_max_results(cfg.max_results.unwrap_or(20))
            .with_query_suffix(cfg.query_suffix.clone())
            .with_filter(CandidateFilter::from_config(cfg))
            .with_retry(retry))
    }

    pub fn with_max_results(mut self, max_results: u32) -> Self {
        // the volumes API caps maxResults at 40
        self.max_results = max_results.clamp(1, 40);
        self
    }

    pub fn with_query_suffix(mut self, suffix: Option<String>) -> Self {
        self.query_suffix = suffix.filter(|s| !s.trim().is_empty());
        self
    }

    pub fn with_filter(mut self, filter: CandidateFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn query_for(&self, keyword: &str) -> String {
        let term = keyword.trim().trim_matches('"').replace(" AND ", " ");
        match &self.query_suffix {
            Some(suffix) => format!("\"{}\" {}", term, suffix.trim()),
            None => format!("\"{}\"", term),
        }
    }
}

#[async_trait::async_trait]
impl BookCatalog for GoogleBooksClient {
    async fn search(&self, keyword: &str) -> Result<Vec<CandidateBook>> {
        if keyword.trim().is_empty() {
            return Err(PipelineError::InvalidInput("book search keyword is empty".into()));
        }

        let query = self.query_for(keyword);
        let mut params: Vec<(&str, String)> = vec![
            ("q", query.clone()),
            ("maxResults", self.max_results.to_string()),
            ("printType", "books".to_string()),
            ("langRestrict", "en".to_string()),
            ("orderBy", "relevance".to_string()),
        ];
        if let Some(key) = &self.api_key {
            params.push(("key", key.clone()));
        }

        let response = send_with_retry(&self.retry, "book catalog", || self.client.get(&self.volumes_url).query(&params))
            .await
            .map_err(|failure| PipelineError::upstream(PROVIDER, failure.to_string()))?;

        let volumes: VolumesResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                PipelineError::upstream(PROVIDER, "book catalog response timed out")
            } else {
                PipelineError::malformed("book catalog", e.to_string())
            }
        })?;

        let candidates = select_candidates(volumes.items, &self.filter);
        info!(keyword, query = %query, total_items = volumes.total_items, kept = candidates.len(), "books: catalog search complete");
        Ok(candidates)
    }
}

/// Apply the candidate filter and ISBN normalization, keeping provider order and the
/// first occurrence of each ISBN.
fn select_candidates(items: Vec<Volume>, filter: &CandidateFilter) -> Vec<CandidateBook> {
    let mut seen = HashSet::new();
    let mut books = Vec::new();

    for volume in items {
        let info = volume.volume_info;
        if let Some(reason) = filter.rejection(&info) {
            debug!(title = %info.title, %reason, "books: skipping volume");
            continue;
        }

        let Some(isbn) = best_isbn(&info.industry_identifiers) else {
            debug!(title = %info.title, "books: skipping volume without a valid ISBN");
            continue;
        };

        if !seen.insert(isbn.clone()) {
            continue;
        }

        books.push(CandidateBook {
            isbn,
            catalog_id: volume.id,
            authors: if info.authors.is_empty() {
                vec!["Unknown Author".to_string()]
            } else {
                info.authors
            },
            description: truncate_description(info.description.as_deref().unwrap_or("No description available")),
            info_url: info.info_link,
            cover_url: info.image_links.and_then(|l| l.thumbnail),
            published_date: info.published_date,
            categories: info.categories,
            title: info.title,
        });
    }

    books
}

fn truncate_description(description: &str) -> String {
    match description.char_indices().nth(MAX_DESCRIPTION_CHARS - 3) {
        Some((idx, _)) if description.chars().count() > MAX_DESCRIPTION_CHARS => {
            format!("{}...", &description[..idx])
        }
        _ => description.to_string(),
    }
}

fn published_year(date: Option<&str>) -> Option<i32> {
    date.and_then(|d| d.get(..4)).and_then(|y| y.parse().ok())
}

/// Prefer a valid ISBN-13; otherwise convert a valid ISBN-10.
fn best_isbn(identifiers: &[IndustryIdentifier]) -> Option<String> {
    let isbn13 = identifiers
        .iter()
        .filter(|i| i.kind == "ISBN_13")
        .find_map(|i| normalize_isbn13(&i.identifier));
    isbn13.or_else(|| {
        identifiers
            .iter()
            .filter(|i| i.kind == "ISBN_10")
            .find_map(|i| isbn10_to_isbn13(&i.identifier))
    })
}

fn strip_separators(raw: &str) -> String {
    raw.chars().filter(|c| !matches!(c, '-' | ' ')).collect()
}

/// Validate an ISBN-13 (digits and check digit).
pub fn normalize_isbn13(raw: &str) -> Option<String> {
    let isbn = strip_separators(raw);
    if isbn.len() != 13 || !isbn.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let expected = isbn13_check_digit(&isbn[..12])?;
    (isbn.as_bytes()[12] == expected).then_some(isbn)
}

/// Convert a valid ISBN-10 into its ISBN-13 form with a recomputed check digit.
pub fn isbn10_to_isbn13(raw: &str) -> Option<String> {
    let isbn = strip_separators(raw).to_ascii_uppercase();
    if isbn.len() != 10 {
        return None;
    }
    let (body, check) = isbn.split_at(9);
    if !body.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let sum: u32 = body
        .chars()
        .enumerate()
        .map(|(i, c)| (10 - i as u32) * c.to_digit(10).unwrap_or(0))
        .sum();
    let check_value = match check {
        "X" => 10,
        d => d.parse::<u32>().ok().filter(|v| *v < 10)?,
    };
    if (sum + check_value) % 11 != 0 {
        return None;
    }

    let prefixed = format!("978{}", body);
    let digit = isbn13_check_digit(&prefixed)? as char;
    Some(format!("{}{}", prefixed, digit))
}

fn isbn13_check_digit(first12: &str) -> Option<u8> {
    let mut sum = 0u32;
    for (i, c) in first12.chars().enumerate() {
        let d = c.to_digit(10)?;
        sum += if i % 2 == 0 { d } else { d * 3 };
    }
    Some(b'0' + ((10 - sum % 10) % 10) as u8)
}

// Google Books response structures
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VolumesResponse {
    #[serde(default)]
    total_items: u64,
    #[serde(default)]
    items: Vec<Volume>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Volume {
    id: Option<String>,
    volume_info: VolumeInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VolumeInfo {
    #[serde(default)]
    title: String,
    #[serde(default)]
    authors: Vec<String>,
    description: Option<String>,
    published_date: Option<String>,
    #[serde(default)]
    categories: Vec<String>,
    #[serde(default)]
    industry_identifiers: Vec<IndustryIdentifier>,
    info_link: Option<String>,
    image_links: Option<ImageLinks>,
}

#[derive(Debug, Deserialize)]
struct IndustryIdentifier {
    #[serde(rename = "type")]
    kind: String,
    identifier: String,
}

#[derive(Debug, Deserialize)]
struct ImageLinks {
    thumbnail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume(title: &str, categories: &[&str], date: &str, ids: &[(&str, &str)]) -> Volume {
        Volume {
            id: Some(format!("id-{}", title)),
            volume_info: VolumeInfo {
                title: title.to_string(),
                authors: vec!["Richard Rothstein".into()],
                description: Some("desc".into()),
                published_date: Some(date.to_string()),
                categories: categories.iter().map(|s| s.to_string()).collect(),
                industry_identifiers: ids
                    .iter()
                    .map(|(k, v)| IndustryIdentifier {
                        kind: k.to_string(),
                        identifier: v.to_string(),
                    })
                    .collect(),
                info_link: None,
                image_links: None,
            },
        }
    }

    #[test]
    fn isbn10_converts_with_recomputed_check_digit() {
        // The Color of Law: ISBN-10 1631492853 / ISBN-13 9781631492853
        assert_eq!(isbn10_to_isbn13("1-63149-285-3").as_deref(), Some("9781631492853"));
        assert_eq!(isbn10_to_isbn13("080442957X").as_deref(), Some("9780804429573"));
        assert!(isbn10_to_isbn13("1631492854").is_none());
        assert!(isbn10_to_isbn13("12345").is_none());
    }

    #[test]
    fn isbn13_validation() {
        assert_eq!(normalize_isbn13("978-1-63149-285-3").as_deref(), Some("9781631492853"));
        assert!(normalize_isbn13("9781631492854").is_none());
        assert!(normalize_isbn13("97816314928X3").is_none());
    }

    #[test]
    fn filter_drops_reference_old_and_offtopic_volumes() {
        let filter = CandidateFilter::default();
        let items = vec![
            volume("The Color of Law", &["History"], "2017-05-02", &[("ISBN_13", "9781631492853")]),
            volume("SQL Handbook", &["Social Science"], "2015", &[("ISBN_13", "9780804429573")]),
            volume("Old Classic", &["History"], "1965", &[("ISBN_10", "080442957X")]),
            volume("Gardening", &["Gardening"], "2010", &[("ISBN_10", "080442957X")]),
            volume("No Isbn", &["Law"], "2010", &[("OTHER", "UOM:39015")]),
            volume("Duplicate", &["Law"], "2019", &[("ISBN_10", "1631492853")]),
        ];

        let books = select_candidates(items, &filter);
        assert_eq!(books.len(), 1);
        assert_eq!(books[0].title, "The Color of Law");
        assert_eq!(books[0].isbn, "9781631492853");
    }

    #[test]
    fn empty_subject_filter_accepts_any_category() {
        let filter = CandidateFilter {
            subject_filters: vec![],
            ..CandidateFilter::default()
        };
        let items = vec![volume("Gardening", &[], "2010", &[("ISBN_10", "080442957X")])];
        assert_eq!(select_candidates(items, &filter).len(), 1);
    }

    #[test]
    fn long_descriptions_are_truncated() {
        let long = "é".repeat(600);
        let truncated = truncate_description(&long);
        assert_eq!(truncated.chars().count(), 500);
        assert!(truncated.ends_with("..."));
        assert_eq!(truncate_description("short"), "short");
    }
}
