/*!
common/src/lib.rs

Shared configuration types and DB helper functions for Newsshelf.

This file provides:
- Config data structures (deserialized from TOML)
- An async loader merging a default and an override TOML file
- Helpers to initialize and migrate an SQLite database
*/

use anyhow::{Context, Result};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;

/// Database configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the sqlite database file (e.g. "data/newsshelf.db")
    pub path: String,
    pub max_connections: Option<u32>,
}

/// Scheduler (processing run times) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// List of wall-clock times in "HH:MM" 24h format (UTC) when a batch should run
    pub times: Vec<String>,
    /// Run one batch immediately when the worker starts
    pub run_on_start: Option<bool>,
}

impl SchedulerConfig {
    /// Parse `times` into sorted, deduplicated wall-clock times.
    pub fn parsed_times(&self) -> Result<Vec<NaiveTime>> {
        let mut parsed = self
            .times
            .iter()
            .map(|t| {
                NaiveTime::parse_from_str(t.trim(), "%H:%M")
                    .with_context(|| format!("invalid scheduler time '{}', expected HH:MM", t))
            })
            .collect::<Result<Vec<_>>>()?;
        parsed.sort();
        parsed.dedup();
        Ok(parsed)
    }
}

/// News provider (Guardian content API) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsConfig {
    pub api_url: Option<String>,
    pub api_key_env: Option<String>,
    /// Terms matched against article text; any one of them qualifies an article
    #[serde(default)]
    pub filter_terms: Vec<String>,
    pub section: Option<String>,
    pub page_size: Option<u32>,
    pub max_pages: Option<u32>,
    /// How far back (hours) the batch looks for articles
    pub lookback_hours: Option<i64>,
    pub timeout_seconds: Option<u64>,
}

/// Book catalog (Google Books volumes API) configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BooksConfig {
    pub api_url: Option<String>,
    pub api_key_env: Option<String>,
    pub max_results: Option<u32>,
    /// Appended to every quoted keyword, e.g. "social justice"
    pub query_suffix: Option<String>,
    pub excluded_title_terms: Option<Vec<String>>,
    pub subject_filters: Option<Vec<String>>,
    pub min_published_year: Option<i32>,
    pub timeout_seconds: Option<u64>,
}

/// Remote LLM config (used if `llm.adapter = "remote"` or `"anthropic"`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteLlmConfig {
    pub api_url: Option<String>,
    pub api_key_env: Option<String>,
    pub model: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub max_tokens: Option<usize>,
}

/// LLM top-level config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub adapter: Option<String>, // "remote", "anthropic"
    pub remote: Option<RemoteLlmConfig>,
}

/// Pipeline thresholds and limits
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Subject domain the relevance prompt checks articles against
    pub subject_domain: Option<String>,
    pub min_article_score: Option<f64>,
    pub min_book_score: Option<f64>,
    pub max_keywords: Option<usize>,
    pub max_books_per_article: Option<usize>,
    pub max_concurrent_articles: Option<usize>,
    /// Article text is truncated to this many chars before reaching the model
    pub max_input_chars: Option<usize>,
    pub article_timeout_seconds: Option<u64>,
    pub reprocess_existing: Option<bool>,
}

/// Retry policy for the external HTTP APIs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: Option<u32>,
    pub base_backoff_ms: Option<u64>,
}

/// HTTP server bind settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind: Option<String>,
    pub port: Option<u16>,
}

/// Admin / maintenance config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    pub auto_migrate: Option<bool>,
}

/// Top-level application configuration (deserialized from config.toml)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub news: NewsConfig,
    pub books: Option<BooksConfig>,
    pub llm: Option<LlmConfig>,
    pub processing: Option<ProcessingConfig>,
    pub retry: Option<RetryConfig>,
    pub server: Option<ServerConfig>,
    pub admin: Option<AdminConfig>,
}

impl Config {
    /// Load configuration with an optional default file and an optional override file.
    /// If both are present, they are merged (override takes precedence).
    pub async fn load_with_defaults(default_path: Option<&Path>, override_path: Option<&Path>) -> Result<Self> {
        let mut config_value = toml::Value::Table(toml::map::Map::new());

        for path in [default_path, override_path].into_iter().flatten() {
            if !path.exists() {
                continue;
            }
            let data = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            let val: toml::Value = toml::from_str(&data)
                .with_context(|| format!("Failed to parse configuration: {}", path.display()))?;
            merge_toml(&mut config_value, val);
        }

        let cfg: Config = config_value.try_into().context("Failed to parse merged configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations the worker could never run with.
    pub fn validate(&self) -> Result<()> {
        self.scheduler.parsed_times()?;

        if self.news.filter_terms.iter().all(|t| t.trim().is_empty()) {
            anyhow::bail!("news.filter_terms must contain at least one non-empty term");
        }

        let urls = [
            ("news.api_url", self.news.api_url.as_deref()),
            ("books.api_url", self.books.as_ref().and_then(|b| b.api_url.as_deref())),
            (
                "llm.remote.api_url",
                self.llm.as_ref().and_then(|l| l.remote.as_ref()).and_then(|r| r.api_url.as_deref()),
            ),
        ];
        for (key, value) in urls {
            if let Some(raw) = value {
                url::Url::parse(raw).with_context(|| format!("{} is not a valid URL: {}", key, raw))?;
            }
        }

        if let Some(p) = &self.processing {
            for (key, value) in [("min_article_score", p.min_article_score), ("min_book_score", p.min_book_score)] {
                if let Some(v) = value {
                    if !(0.0..=1.0).contains(&v) {
                        anyhow::bail!("processing.{} must be within 0.0..=1.0, got {}", key, v);
                    }
                }
            }
            if p.max_concurrent_articles == Some(0) {
                anyhow::bail!("processing.max_concurrent_articles must be at least 1");
            }
        }

        Ok(())
    }
}

fn merge_toml(a: &mut toml::Value, b: toml::Value) {
    match (a, b) {
        (toml::Value::Table(a_map), toml::Value::Table(b_map)) => {
            for (k, v) in b_map {
                if let Some(a_val) = a_map.get_mut(&k) {
                    merge_toml(a_val, v);
                } else {
                    a_map.insert(k, v);
                }
            }
        }
        (a_val, b_val) => *a_val = b_val,
    }
}

/// Read an API key from the environment variable named in the config.
pub fn api_key_from_env(section: &str, api_key_env: Option<&str>) -> Result<String> {
    let var = api_key_env.with_context(|| format!("Missing api_key_env in [{}] config", section))?;
    std::env::var(var).with_context(|| format!("{} API key env var '{}' not set", section, var))
}

/// Run SQL migrations using sqlx's migration macro.
/// This expects a `migrations` directory at the workspace root containing SQL migration files.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("../migrations")
        .run(pool)
        .await
        .context("Failed to run sqlx migrations")?;

    Ok(())
}

/// Initialize an SQLite connection pool.
///
/// This function will create the parent directory if necessary, ensure the DB file exists
/// (attempting to create it if missing), and return a configured `SqlitePool` with foreign
/// keys enforced and WAL journaling.
///
/// Example:
///   let pool = init_db_pool("data/newsshelf.db", 5).await?;
pub async fn init_db_pool(path: &str, max_connections: u32) -> Result<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.with_context(|| {
                format!("Failed to create DB parent directory: {}", parent.display())
            })?;
        }
    }

    // Creating the file up front surfaces permission or path problems with a clearer error
    // than the SQLite connection attempt would.
    tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(path)
        .await
        .with_context(|| format!("Failed to create or open DB file: {}", path))?;

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(std::time::Duration::from_secs(10))
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to connect to sqlite database at path: {}", path))?;

    Ok(pool)
}
