//! Batch orchestration: fetch, analyze, find books, rank, persist.
//!
//! Each article is an independent unit of work with its own transaction. Errors
//! local to an article become a `Skipped` or `Failed` outcome and never stop the
//! rest of the batch; only infrastructure failures abort `run_batch`.

use anyhow::Context;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, Instrument};

use crate::analysis::{AnalyzerSettings, RelevanceAnalyzer, RelevanceAssessment};
use crate::books::{BookCatalog, CandidateBook, GoogleBooksClient};
use crate::error::{PipelineError, Result};
use crate::http::RetryPolicy;
use crate::llm::{self, LlmProvider};
use crate::news::{GuardianClient, NewsSource, PageWindow, RawArticle};
use crate::ranking::{ArticleContext, BookJudgement, BookRelevanceRanker};
use crate::storage::{self, RunCounts};

#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub filter_terms: Vec<String>,
    pub page_size: u32,
    pub max_pages: u32,
    /// Only fetch articles published within this many hours
    pub lookback_hours: Option<i64>,
    /// Optional cap on linked books; `None` keeps every accepted book
    pub max_books_per_article: Option<usize>,
    pub max_concurrent_articles: usize,
    pub article_timeout: Option<Duration>,
    pub reprocess_existing: bool,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            filter_terms: Vec::new(),
            page_size: 20,
            max_pages: 1,
            lookback_hours: None,
            max_books_per_article: None,
            max_concurrent_articles: 4,
            article_timeout: Some(Duration::from_secs(300)),
            reprocess_existing: false,
        }
    }
}

impl ProcessorSettings {
    pub fn from_config(cfg: &common::Config) -> Self {
        let default = Self::default();
        let processing = cfg.processing.clone().unwrap_or_default();
        Self {
            filter_terms: cfg.news.filter_terms.clone(),
            page_size: cfg.news.page_size.unwrap_or(default.page_size),
            max_pages: cfg.news.max_pages.unwrap_or(default.max_pages),
            lookback_hours: cfg.news.lookback_hours,
            // 0 means no cap
            max_books_per_article: processing
                .max_books_per_article
                .filter(|&n| n > 0)
                .or(default.max_books_per_article),
            max_concurrent_articles: processing
                .max_concurrent_articles
                .unwrap_or(default.max_concurrent_articles)
                .max(1),
            // 0 disables the per-article deadline
            article_timeout: match processing.article_timeout_seconds {
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
                None => default.article_timeout,
            },
            reprocess_existing: processing.reprocess_existing.unwrap_or(default.reprocess_existing),
        }
    }

    fn page_window(&self) -> PageWindow {
        PageWindow {
            first_page: 1,
            page_size: self.page_size,
            max_pages: self.max_pages,
            from_date: self.lookback_hours.map(|h| Utc::now() - chrono::Duration::hours(h)),
        }
    }
}

/// How far an article got through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArticleStage {
    Fetched,
    Analyzed,
    BooksFound,
    Ranked,
    Persisted,
}

impl fmt::Display for ArticleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArticleStage::Fetched => "fetched",
            ArticleStage::Analyzed => "analyzed",
            ArticleStage::BooksFound => "books_found",
            ArticleStage::Ranked => "ranked",
            ArticleStage::Persisted => "persisted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    NotRelevant,
    AlreadyProcessed,
    EmptyContent,
    TimedOut,
    /// An external call failed for this article
    Upstream(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ArticleOutcome {
    Persisted { article_id: i64, books: usize, topics: usize },
    Skipped { stage: ArticleStage, reason: SkipReason },
    Failed { stage: ArticleStage, error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ArticleReport {
    pub external_id: String,
    pub title: String,
    #[serde(flatten)]
    pub outcome: ArticleOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub run_id: String,
    pub articles: Vec<ArticleReport>,
    pub counts: RunCounts,
}

impl BatchReport {
    pub fn outcome_for(&self, external_id: &str) -> Option<&ArticleOutcome> {
        self.articles
            .iter()
            .find(|a| a.external_id == external_id)
            .map(|a| &a.outcome)
    }
}

/// Clears the running flag when the batch ends, on every exit path.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// An accepted book with the judgement that admitted it.
struct AcceptedBook {
    book: CandidateBook,
    judgement: BookJudgement,
}

pub struct ContentProcessor {
    news: Arc<dyn NewsSource>,
    catalog: Arc<dyn BookCatalog>,
    analyzer: RelevanceAnalyzer,
    ranker: BookRelevanceRanker,
    pool: SqlitePool,
    settings: ProcessorSettings,
    running: AtomicBool,
}

impl ContentProcessor {
    pub fn new(
        news: Arc<dyn NewsSource>,
        catalog: Arc<dyn BookCatalog>,
        analyzer: RelevanceAnalyzer,
        ranker: BookRelevanceRanker,
        pool: SqlitePool,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            news,
            catalog,
            analyzer,
            ranker,
            pool,
            settings,
            running: AtomicBool::new(false),
        }
    }

    /// Wire the production clients (news, catalog, language model) from configuration.
    pub fn from_config(cfg: &common::Config, pool: SqlitePool) -> anyhow::Result<Self> {
        let retry = RetryPolicy::from_config(cfg.retry.as_ref());
        let processing = cfg.processing.clone().unwrap_or_default();

        let news = GuardianClient::from_config(&cfg.news, retry).context("news client")?;
        let books_cfg = cfg.books.clone().unwrap_or_default();
        let catalog = GoogleBooksClient::from_config(&books_cfg, retry).context("book catalog client")?;
        let llm_cfg = cfg
            .llm
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("[llm] section is required for processing"))?;
        let llm: Arc<dyn LlmProvider> = Arc::from(llm::provider_from_config(llm_cfg, retry)?);
        info!(model = llm.model(), "processing: language model configured");

        let analyzer_defaults = AnalyzerSettings::default();
        let analyzer = RelevanceAnalyzer::new(
            llm.clone(),
            AnalyzerSettings {
                subject_domain: processing
                    .subject_domain
                    .clone()
                    .unwrap_or(analyzer_defaults.subject_domain),
                min_score: processing.min_article_score.unwrap_or(analyzer_defaults.min_score),
                max_keywords: processing.max_keywords.unwrap_or(analyzer_defaults.max_keywords),
                max_input_chars: processing.max_input_chars.unwrap_or(analyzer_defaults.max_input_chars),
            },
        );
        let ranker = BookRelevanceRanker::new(
            llm,
            processing.subject_domain.clone().unwrap_or_else(|| "social justice".to_string()),
            processing.min_book_score.unwrap_or(0.8),
        );

        Ok(Self::new(
            Arc::new(news),
            Arc::new(catalog),
            analyzer,
            ranker,
            pool,
            ProcessorSettings::from_config(cfg),
        ))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run one batch over the configured news window.
    ///
    /// Returns `BatchInProgress` when another batch holds the run guard, and a
    /// persistence error when the database cannot be reached or the run cannot be
    /// recorded. Per-article problems are reported in the returned `BatchReport`.
    pub async fn run_batch(&self) -> Result<BatchReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(PipelineError::BatchInProgress);
        }
        let _guard = RunGuard(&self.running);

        let run_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!("batch", run_id = %run_id);
        self.run_batch_inner(run_id).instrument(span).await
    }

    async fn run_batch_inner(&self, run_id: String) -> Result<BatchReport> {
        // Fail fast if the database is unreachable before calling any provider.
        drop(self.pool.acquire().await?);
        storage::start_run(&self.pool, &run_id, Utc::now()).await?;
        info!("processing: batch started");

        let window = self.settings.page_window();
        let articles = match self.news.fetch_candidates(&self.settings.filter_terms, &window).await {
            Ok(articles) => articles,
            Err(e) => {
                error!(error = %e, "processing: fetching candidates failed, aborting batch");
                storage::finish_run(&self.pool, &run_id, &RunCounts::default(), Some(&e.to_string())).await?;
                return Err(e);
            }
        };

        let mut seen = HashSet::new();
        let articles: Vec<RawArticle> = articles
            .into_iter()
            .filter(|a| seen.insert(a.external_id.clone()))
            .collect();

        let fetched = articles.len();
        let run_id_ref = run_id.as_str();
        let reports: Vec<ArticleReport> = stream::iter(articles)
            .map(|article| async move {
                let outcome = self.process_with_deadline(&article).await;
                ArticleReport {
                    external_id: article.external_id,
                    title: article.title,
                    outcome,
                }
                .logged(run_id_ref)
            })
            .buffer_unordered(self.settings.max_concurrent_articles.max(1))
            .collect()
            .await;

        let counts = tally(fetched, &reports);
        storage::finish_run(&self.pool, &run_id, &counts, None).await?;
        info!(
            fetched = counts.fetched,
            persisted = counts.persisted,
            skipped = counts.skipped,
            failed = counts.failed,
            "processing: batch finished"
        );

        Ok(BatchReport {
            run_id,
            articles: reports,
            counts,
        })
    }

    async fn process_with_deadline(&self, article: &RawArticle) -> ArticleOutcome {
        let span = tracing::info_span!("article", article = %article.external_id);
        let mut stage = ArticleStage::Fetched;

        let outcome = match self.settings.article_timeout {
            Some(deadline) => {
                tokio::time::timeout(deadline, self.process_article(article, &mut stage))
                    .instrument(span)
                    .await
            }
            None => Ok(self.process_article(article, &mut stage).instrument(span).await),
        };

        outcome.unwrap_or(ArticleOutcome::Skipped {
            stage,
            reason: SkipReason::TimedOut,
        })
    }

    /// Drive one article through the stages, recording progress in `stage`.
    async fn process_article(&self, article: &RawArticle, stage: &mut ArticleStage) -> ArticleOutcome {
        if article.body.trim().is_empty() {
            return ArticleOutcome::Skipped {
                stage: *stage,
                reason: SkipReason::EmptyContent,
            };
        }

        if !self.settings.reprocess_existing {
            match storage::article_exists(&self.pool, &article.external_id).await {
                Ok(true) => {
                    return ArticleOutcome::Skipped {
                        stage: *stage,
                        reason: SkipReason::AlreadyProcessed,
                    }
                }
                Ok(false) => {}
                Err(e) => return failed(*stage, e),
            }
        }

        let assessment = match self.analyzer.assess_relevance(&article.title, &article.body).await {
            Ok(a) => a,
            Err(PipelineError::InvalidInput(_)) => {
                return ArticleOutcome::Skipped {
                    stage: *stage,
                    reason: SkipReason::EmptyContent,
                }
            }
            Err(e) => return local_failure(*stage, e),
        };
        *stage = ArticleStage::Analyzed;

        if !assessment.is_relevant {
            debug!(reason = ?assessment.rejection, "processing: article not relevant");
            return match self.persist(article, &assessment, &[]).await {
                Ok(_) => ArticleOutcome::Skipped {
                    stage: *stage,
                    reason: SkipReason::NotRelevant,
                },
                Err(e) => failed(*stage, e),
            };
        }

        let candidates = match self.find_candidates(&assessment.keywords).await {
            Ok(c) => c,
            Err(e) => return local_failure(*stage, e),
        };
        *stage = ArticleStage::BooksFound;

        let context = ArticleContext {
            title: &article.title,
            text: &article.body,
            assessment: &assessment,
        };
        let accepted = match self.rank_candidates(&context, candidates).await {
            Ok(a) => a,
            Err(e) => return local_failure(*stage, e),
        };
        *stage = ArticleStage::Ranked;

        match self.persist(article, &assessment, &accepted).await {
            Ok(article_id) => {
                *stage = ArticleStage::Persisted;
                ArticleOutcome::Persisted {
                    article_id,
                    books: accepted.len(),
                    topics: assessment.keywords.len(),
                }
            }
            Err(e) => failed(*stage, e),
        }
    }

    /// Search every keyword and merge the results, first occurrence of an ISBN wins.
    async fn find_candidates(&self, keywords: &[String]) -> Result<Vec<CandidateBook>> {
        let mut seen = HashSet::new();
        let mut merged = Vec::new();
        for keyword in keywords {
            let found = self.catalog.search(keyword).await?;
            debug!(keyword = %keyword, found = found.len(), "processing: catalog searched");
            merged.extend(found.into_iter().filter(|b| seen.insert(b.isbn.clone())));
        }
        Ok(merged)
    }

    /// Judge each candidate once; keep accepted ones, best first.
    async fn rank_candidates(
        &self,
        context: &ArticleContext<'_>,
        candidates: Vec<CandidateBook>,
    ) -> Result<Vec<AcceptedBook>> {
        let mut accepted = Vec::new();
        for book in candidates {
            let judgement = self.ranker.judge_relevance(context, &book).await?;
            if judgement.relevant {
                accepted.push(AcceptedBook { book, judgement });
            }
        }
        accepted.sort_by(|a, b| b.judgement.score.total_cmp(&a.judgement.score));
        if let Some(cap) = self.settings.max_books_per_article {
            accepted.truncate(cap);
        }
        Ok(accepted)
    }

    /// Persist the article with its topics and accepted books in one transaction.
    /// Any error, unique conflicts included, drops the transaction and rolls back.
    async fn persist(
        &self,
        article: &RawArticle,
        assessment: &RelevanceAssessment,
        books: &[AcceptedBook],
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let article_id = storage::upsert_article(&mut *tx, article, assessment, Utc::now()).await?;
        storage::clear_article_links(&mut *tx, article_id).await?;

        let mut topic_ids = Vec::with_capacity(assessment.keywords.len());
        for keyword in &assessment.keywords {
            let topic_id = storage::upsert_topic(&mut *tx, keyword).await?;
            storage::link_article_topic(&mut *tx, article_id, topic_id).await?;
            topic_ids.push(topic_id);
        }

        for accepted in books {
            let book_id = storage::upsert_book(&mut *tx, &accepted.book).await?;
            storage::link_article_book(&mut *tx, article_id, book_id, &accepted.judgement).await?;
            for topic_id in &topic_ids {
                storage::link_book_topic(&mut *tx, book_id, *topic_id).await?;
            }
        }

        tx.commit().await?;
        Ok(article_id)
    }
}

impl ArticleReport {
    fn logged(self, run_id: &str) -> Self {
        match &self.outcome {
            ArticleOutcome::Persisted { article_id, books, topics } => {
                info!(run_id, article = %self.external_id, article_id, books, topics, "processing: article persisted")
            }
            ArticleOutcome::Skipped { stage, reason } => {
                info!(run_id, article = %self.external_id, stage = %stage, reason = ?reason, "processing: article skipped")
            }
            ArticleOutcome::Failed { stage, error } => {
                error!(run_id, article = %self.external_id, stage = %stage, error = %error, "processing: article failed")
            }
        }
        self
    }
}

fn local_failure(stage: ArticleStage, err: PipelineError) -> ArticleOutcome {
    if err.is_article_local() {
        ArticleOutcome::Skipped {
            stage,
            reason: SkipReason::Upstream(err.to_string()),
        }
    } else {
        failed(stage, err)
    }
}

fn failed(stage: ArticleStage, err: PipelineError) -> ArticleOutcome {
    ArticleOutcome::Failed {
        stage,
        error: err.to_string(),
    }
}

fn tally(fetched: usize, reports: &[ArticleReport]) -> RunCounts {
    let mut counts = RunCounts {
        fetched,
        ..RunCounts::default()
    };
    for report in reports {
        match report.outcome {
            ArticleOutcome::Persisted { .. } => counts.persisted += 1,
            ArticleOutcome::Skipped { .. } => counts.skipped += 1,
            ArticleOutcome::Failed { .. } => counts.failed += 1,
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(outcome: ArticleOutcome) -> ArticleReport {
        ArticleReport {
            external_id: "x".into(),
            title: "t".into(),
            outcome,
        }
    }

    #[test]
    fn tally_counts_each_outcome() {
        let reports = vec![
            report(ArticleOutcome::Persisted { article_id: 1, books: 2, topics: 2 }),
            report(ArticleOutcome::Skipped { stage: ArticleStage::Analyzed, reason: SkipReason::NotRelevant }),
            report(ArticleOutcome::Skipped { stage: ArticleStage::Fetched, reason: SkipReason::TimedOut }),
            report(ArticleOutcome::Failed { stage: ArticleStage::Ranked, error: "disk".into() }),
        ];
        let counts = tally(5, &reports);
        assert_eq!(
            counts,
            RunCounts { fetched: 5, persisted: 1, skipped: 2, failed: 1 }
        );
    }

    #[test]
    fn local_errors_skip_and_storage_errors_fail() {
        let skipped = local_failure(ArticleStage::Analyzed, PipelineError::upstream("book catalog", "503"));
        assert!(matches!(skipped, ArticleOutcome::Skipped { reason: SkipReason::Upstream(_), .. }));

        let failed = local_failure(ArticleStage::Ranked, PipelineError::PersistenceFailure("locked".into()));
        assert!(matches!(failed, ArticleOutcome::Failed { stage: ArticleStage::Ranked, .. }));

        let conflict = local_failure(ArticleStage::Ranked, PipelineError::PersistenceConflict("books.isbn".into()));
        assert!(matches!(conflict, ArticleOutcome::Failed { .. }));
    }

    #[test]
    fn zero_timeout_disables_deadline() {
        let cfg: common::Config = toml::from_str(
            r#"
            [database]
            path = "x.db"
            [scheduler]
            times = ["08:00"]
            [news]
            filter_terms = ["housing"]
            [processing]
            article_timeout_seconds = 0
            max_concurrent_articles = 0
            "#,
        )
        .expect("config parses");
        let settings = ProcessorSettings::from_config(&cfg);
        assert_eq!(settings.article_timeout, None);
        assert_eq!(settings.max_concurrent_articles, 1);
        assert_eq!(settings.filter_terms, vec!["housing"]);
    }
}
