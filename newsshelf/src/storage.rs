//! SQLite persistence for articles, books, topics and their associations.
//!
//! Write helpers take a `&mut SqliteConnection` so the processor can run a whole
//! article inside one transaction (`&mut *tx`). Read helpers serve the HTTP API and
//! only expose articles whose committed verdict is `relevant`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool};
use tracing::debug;

use crate::analysis::RelevanceAssessment;
use crate::books::CandidateBook;
use crate::error::Result;
use crate::news::RawArticle;
use crate::ranking::BookJudgement;

pub const RELEVANT: &str = "relevant";
pub const NOT_RELEVANT: &str = "not_relevant";

pub async fn article_exists(pool: &SqlitePool, external_id: &str) -> Result<bool> {
    let found = sqlx::query_scalar::<_, i64>("SELECT id FROM articles WHERE external_id = ?")
        .bind(external_id)
        .fetch_optional(pool)
        .await?;
    Ok(found.is_some())
}

/// Insert the article, or refresh its processing metadata when it already exists.
/// Content columns of an existing row are left untouched.
pub async fn upsert_article(
    conn: &mut SqliteConnection,
    article: &RawArticle,
    assessment: &RelevanceAssessment,
    processed_at: DateTime<Utc>,
) -> Result<i64> {
    let relevance = if assessment.is_relevant { RELEVANT } else { NOT_RELEVANT };
    let id = sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO articles (external_id, title, trail_text, body, source, url, section, image_url,
                              published_at, relevance, relevance_score, analysis_summary, processed_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(external_id) DO UPDATE SET
            relevance = excluded.relevance,
            relevance_score = excluded.relevance_score,
            analysis_summary = excluded.analysis_summary,
            processed_at = excluded.processed_at
        RETURNING id
        "#,
    )
    .bind(&article.external_id)
    .bind(&article.title)
    .bind(&article.trail_text)
    .bind(&article.body)
    .bind(&article.source)
    .bind(&article.url)
    .bind(&article.section)
    .bind(&article.image_url)
    .bind(article.published_at)
    .bind(relevance)
    .bind(assessment.score)
    .bind(&assessment.summary)
    .bind(processed_at)
    .fetch_one(&mut *conn)
    .await?;
    Ok(id)
}

/// Drop the article's book and topic links so a re-run can write the current set.
pub async fn clear_article_links(conn: &mut SqliteConnection, article_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM article_books WHERE article_id = ?")
        .bind(article_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM article_topics WHERE article_id = ?")
        .bind(article_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Insert-or-get a topic by its normalized name.
pub async fn upsert_topic(conn: &mut SqliteConnection, name: &str) -> Result<i64> {
    let inserted = sqlx::query_scalar::<_, i64>(
        "INSERT INTO topics (name) VALUES (?) ON CONFLICT(name) DO NOTHING RETURNING id",
    )
    .bind(name)
    .fetch_optional(&mut *conn)
    .await?;

    match inserted {
        Some(id) => Ok(id),
        None => {
            let id = sqlx::query_scalar::<_, i64>("SELECT id FROM topics WHERE name = ?")
                .bind(name)
                .fetch_one(&mut *conn)
                .await?;
            debug!(topic = name, id, "storage: reusing existing topic");
            Ok(id)
        }
    }
}

/// Insert-or-get a book by ISBN. The first discovery wins; later ones reuse the row.
pub async fn upsert_book(conn: &mut SqliteConnection, book: &CandidateBook) -> Result<i64> {
    let authors_json = serde_json::to_string(&book.authors)?;
    let inserted = sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO books (isbn, catalog_id, title, authors_json, description, info_url, cover_url, published_date)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(isbn) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(&book.isbn)
    .bind(&book.catalog_id)
    .bind(&book.title)
    .bind(&authors_json)
    .bind(&book.description)
    .bind(&book.info_url)
    .bind(&book.cover_url)
    .bind(&book.published_date)
    .fetch_optional(&mut *conn)
    .await?;

    match inserted {
        Some(id) => Ok(id),
        None => {
            let id = sqlx::query_scalar::<_, i64>("SELECT id FROM books WHERE isbn = ?")
                .bind(&book.isbn)
                .fetch_one(&mut *conn)
                .await?;
            debug!(isbn = %book.isbn, id, "storage: reusing existing book");
            Ok(id)
        }
    }
}

pub async fn link_article_topic(conn: &mut SqliteConnection, article_id: i64, topic_id: i64) -> Result<()> {
    sqlx::query("INSERT INTO article_topics (article_id, topic_id) VALUES (?, ?) ON CONFLICT DO NOTHING")
        .bind(article_id)
        .bind(topic_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn link_article_book(
    conn: &mut SqliteConnection,
    article_id: i64,
    book_id: i64,
    judgement: &BookJudgement,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO article_books (article_id, book_id, relevance_score, relevance_explanation)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(article_id, book_id) DO UPDATE SET
            relevance_score = excluded.relevance_score,
            relevance_explanation = excluded.relevance_explanation
        "#,
    )
    .bind(article_id)
    .bind(book_id)
    .bind(judgement.score)
    .bind(&judgement.explanation)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn link_book_topic(conn: &mut SqliteConnection, book_id: i64, topic_id: i64) -> Result<()> {
    sqlx::query("INSERT INTO book_topics (book_id, topic_id) VALUES (?, ?) ON CONFLICT DO NOTHING")
        .bind(book_id)
        .bind(topic_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

// Processing runs

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCounts {
    pub fetched: usize,
    pub persisted: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub async fn start_run(pool: &SqlitePool, run_id: &str, started_at: DateTime<Utc>) -> Result<()> {
    sqlx::query("INSERT INTO processing_runs (run_id, started_at, status) VALUES (?, ?, 'running')")
        .bind(run_id)
        .bind(started_at)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn finish_run(pool: &SqlitePool, run_id: &str, counts: &RunCounts, error: Option<&str>) -> Result<()> {
    let status = if error.is_some() { "failed" } else { "completed" };
    sqlx::query(
        r#"
        UPDATE processing_runs
        SET finished_at = ?, status = ?, fetched = ?, persisted = ?, skipped = ?, failed = ?, error_message = ?
        WHERE run_id = ?
        "#,
    )
    .bind(Utc::now())
    .bind(status)
    .bind(counts.fetched as i64)
    .bind(counts.persisted as i64)
    .bind(counts.skipped as i64)
    .bind(counts.failed as i64)
    .bind(error)
    .bind(run_id)
    .execute(pool)
    .await?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub run_id: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: String,
    pub fetched: i64,
    pub persisted: i64,
    pub skipped: i64,
    pub failed: i64,
    pub error_message: Option<String>,
}

pub async fn last_run(pool: &SqlitePool) -> Result<Option<RunRecord>> {
    let row = sqlx::query(
        r#"
        SELECT run_id, started_at, finished_at, status, fetched, persisted, skipped, failed, error_message
        FROM processing_runs
        ORDER BY id DESC
        LIMIT 1
        "#,
    )
    .fetch_optional(pool)
    .await?;

    row.map(|r| {
        Ok(RunRecord {
            run_id: r.try_get("run_id")?,
            started_at: r.try_get("started_at")?,
            finished_at: r.try_get("finished_at")?,
            status: r.try_get("status")?,
            fetched: r.try_get("fetched")?,
            persisted: r.try_get("persisted")?,
            skipped: r.try_get("skipped")?,
            failed: r.try_get("failed")?,
            error_message: r.try_get("error_message")?,
        })
    })
    .transpose()
}

// Read side

/// One page of a listing.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub total: i64,
    pub items: Vec<T>,
    pub skip: i64,
    pub limit: i64,
    pub has_more: bool,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: i64, skip: i64, limit: i64) -> Self {
        let has_more = skip + (items.len() as i64) < total;
        Self { total, items, skip, limit, has_more }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ArticleSummary {
    pub id: i64,
    pub external_id: String,
    pub title: String,
    pub trail_text: Option<String>,
    pub source: String,
    pub url: String,
    pub section: Option<String>,
    pub image_url: Option<String>,
    pub published_at: Option<String>,
    pub relevance_score: Option<f64>,
    pub analysis_summary: Option<String>,
    pub processed_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArticleDetail {
    #[serde(flatten)]
    pub article: ArticleSummary,
    pub body: String,
    pub books: Vec<LinkedBook>,
    pub topics: Vec<TopicRef>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BookRecord {
    pub id: i64,
    pub isbn: String,
    pub catalog_id: Option<String>,
    pub title: String,
    pub authors: Vec<String>,
    pub description: String,
    pub info_url: Option<String>,
    pub cover_url: Option<String>,
    pub published_date: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkedBook {
    #[serde(flatten)]
    pub book: BookRecord,
    pub relevance_score: f64,
    pub relevance_explanation: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BookDetail {
    #[serde(flatten)]
    pub book: BookRecord,
    pub articles: Vec<ArticleRef>,
    pub topics: Vec<TopicRef>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArticleRef {
    pub id: i64,
    pub title: String,
    pub url: String,
    pub relevance_score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopicRef {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopicRecord {
    pub id: i64,
    pub name: String,
    pub article_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopicDetail {
    pub id: i64,
    pub name: String,
    pub article_count: i64,
    pub book_count: i64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CatalogCounts {
    pub articles: i64,
    pub books: i64,
    pub topics: i64,
}

const ARTICLE_COLUMNS: &str = "a.id, a.external_id, a.title, a.trail_text, a.source, a.url, a.section, \
     a.image_url, a.published_at, a.relevance_score, a.analysis_summary, a.processed_at";

const BOOK_COLUMNS: &str =
    "b.id, b.isbn, b.catalog_id, b.title, b.authors_json, b.description, b.info_url, b.cover_url, b.published_date";

fn article_from_row(r: &SqliteRow) -> Result<ArticleSummary> {
    Ok(ArticleSummary {
        id: r.try_get("id")?,
        external_id: r.try_get("external_id")?,
        title: r.try_get("title")?,
        trail_text: r.try_get("trail_text")?,
        source: r.try_get("source")?,
        url: r.try_get("url")?,
        section: r.try_get("section")?,
        image_url: r.try_get("image_url")?,
        published_at: r.try_get("published_at")?,
        relevance_score: r.try_get("relevance_score")?,
        analysis_summary: r.try_get("analysis_summary")?,
        processed_at: r.try_get("processed_at")?,
    })
}

fn book_from_row(r: &SqliteRow) -> Result<BookRecord> {
    let authors_json: String = r.try_get("authors_json")?;
    Ok(BookRecord {
        id: r.try_get("id")?,
        isbn: r.try_get("isbn")?,
        catalog_id: r.try_get("catalog_id")?,
        title: r.try_get("title")?,
        authors: serde_json::from_str(&authors_json).unwrap_or_default(),
        description: r.try_get("description")?,
        info_url: r.try_get("info_url")?,
        cover_url: r.try_get("cover_url")?,
        published_date: r.try_get("published_date")?,
    })
}

pub async fn catalog_counts(pool: &SqlitePool) -> Result<CatalogCounts> {
    let row = sqlx::query(
        r#"
        SELECT
            (SELECT COUNT(*) FROM articles WHERE relevance = 'relevant') AS articles,
            (SELECT COUNT(*) FROM books) AS books,
            (SELECT COUNT(*) FROM topics) AS topics
        "#,
    )
    .fetch_one(pool)
    .await?;
    Ok(CatalogCounts {
        articles: row.try_get("articles")?,
        books: row.try_get("books")?,
        topics: row.try_get("topics")?,
    })
}

/// Optional narrowing of the article listing; all set filters must match.
#[derive(Debug, Clone, Default)]
pub struct ArticleFilter {
    pub topic_id: Option<i64>,
    /// Case-insensitive substring of title, trail text or body
    pub keyword: Option<String>,
    /// Inclusive bounds on `published_at`
    pub published_from: Option<DateTime<Utc>>,
    pub published_to: Option<DateTime<Utc>>,
}

/// Optional narrowing of the book listing; all set filters must match.
#[derive(Debug, Clone, Default)]
pub struct BookFilter {
    pub topic_id: Option<i64>,
    pub author: Option<String>,
    /// Case-insensitive substring of title or description
    pub keyword: Option<String>,
}

enum FilterArg {
    Id(i64),
    Text(String),
    Time(DateTime<Utc>),
}

fn like_pattern(raw: &str) -> String {
    format!("%{}%", raw.trim())
}

fn bind_args<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    args: &'q [FilterArg],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for arg in args {
        query = match arg {
            FilterArg::Id(v) => query.bind(*v),
            FilterArg::Text(v) => query.bind(v.as_str()),
            FilterArg::Time(v) => query.bind(*v),
        };
    }
    query
}

impl ArticleFilter {
    fn where_clause(&self) -> (String, Vec<FilterArg>) {
        let mut clauses = vec!["a.relevance = 'relevant'".to_string()];
        let mut args = Vec::new();
        if let Some(topic_id) = self.topic_id {
            clauses.push("EXISTS (SELECT 1 FROM article_topics tg WHERE tg.article_id = a.id AND tg.topic_id = ?)".into());
            args.push(FilterArg::Id(topic_id));
        }
        if let Some(keyword) = self.keyword.as_deref().filter(|k| !k.trim().is_empty()) {
            clauses.push("(a.title LIKE ? OR a.trail_text LIKE ? OR a.body LIKE ?)".into());
            for _ in 0..3 {
                args.push(FilterArg::Text(like_pattern(keyword)));
            }
        }
        if let Some(from) = self.published_from {
            clauses.push("datetime(a.published_at) >= datetime(?)".into());
            args.push(FilterArg::Time(from));
        }
        if let Some(to) = self.published_to {
            clauses.push("datetime(a.published_at) <= datetime(?)".into());
            args.push(FilterArg::Time(to));
        }
        (clauses.join(" AND "), args)
    }
}

impl BookFilter {
    fn where_clause(&self) -> (String, Vec<FilterArg>) {
        let mut clauses = vec!["1 = 1".to_string()];
        let mut args = Vec::new();
        if let Some(topic_id) = self.topic_id {
            clauses.push("EXISTS (SELECT 1 FROM book_topics bt WHERE bt.book_id = b.id AND bt.topic_id = ?)".into());
            args.push(FilterArg::Id(topic_id));
        }
        if let Some(author) = self.author.as_deref().filter(|a| !a.trim().is_empty()) {
            clauses.push("b.authors_json LIKE ?".into());
            args.push(FilterArg::Text(like_pattern(author)));
        }
        if let Some(keyword) = self.keyword.as_deref().filter(|k| !k.trim().is_empty()) {
            clauses.push("(b.title LIKE ? OR b.description LIKE ?)".into());
            for _ in 0..2 {
                args.push(FilterArg::Text(like_pattern(keyword)));
            }
        }
        (clauses.join(" AND "), args)
    }
}

/// Relevant articles, newest first.
pub async fn list_articles(
    pool: &SqlitePool,
    filter: &ArticleFilter,
    skip: i64,
    limit: i64,
) -> Result<Page<ArticleSummary>> {
    let (clause, args) = filter.where_clause();

    let count_sql = format!("SELECT COUNT(*) AS total FROM articles a WHERE {clause}");
    let total: i64 = bind_args(sqlx::query(&count_sql), &args)
        .fetch_one(pool)
        .await?
        .try_get("total")?;

    let sql = format!(
        "SELECT {ARTICLE_COLUMNS} FROM articles a WHERE {clause} \
         ORDER BY a.published_at DESC, a.id DESC LIMIT ? OFFSET ?"
    );
    let rows = bind_args(sqlx::query(&sql), &args)
        .bind(limit)
        .bind(skip)
        .fetch_all(pool)
        .await?;

    let items = rows.iter().map(article_from_row).collect::<Result<Vec<_>>>()?;
    Ok(Page::new(items, total, skip, limit))
}

pub async fn get_article(pool: &SqlitePool, id: i64) -> Result<Option<ArticleDetail>> {
    let row = sqlx::query(&format!(
        "SELECT {ARTICLE_COLUMNS}, a.body FROM articles a WHERE a.id = ? AND a.relevance = 'relevant'"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let article = article_from_row(&row)?;
    let body: String = row.try_get("body")?;

    let book_rows = sqlx::query(&format!(
        "SELECT {BOOK_COLUMNS}, ab.relevance_score, ab.relevance_explanation \
         FROM article_books ab JOIN books b ON b.id = ab.book_id \
         WHERE ab.article_id = ? ORDER BY ab.relevance_score DESC, b.id"
    ))
    .bind(id)
    .fetch_all(pool)
    .await?;

    let books = book_rows
        .iter()
        .map(|r| {
            Ok(LinkedBook {
                book: book_from_row(r)?,
                relevance_score: r.try_get("relevance_score")?,
                relevance_explanation: r.try_get("relevance_explanation")?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let topics = topic_refs(
        pool,
        "SELECT t.id, t.name FROM article_topics tg JOIN topics t ON t.id = tg.topic_id \
         WHERE tg.article_id = ? ORDER BY t.name",
        id,
    )
    .await?;

    Ok(Some(ArticleDetail { article, body, books, topics }))
}

/// Books, most recently added first.
pub async fn list_books(pool: &SqlitePool, filter: &BookFilter, skip: i64, limit: i64) -> Result<Page<BookRecord>> {
    let (clause, args) = filter.where_clause();

    let count_sql = format!("SELECT COUNT(*) AS total FROM books b WHERE {clause}");
    let total: i64 = bind_args(sqlx::query(&count_sql), &args)
        .fetch_one(pool)
        .await?
        .try_get("total")?;

    let sql = format!(
        "SELECT {BOOK_COLUMNS} FROM books b WHERE {clause} ORDER BY b.created_at DESC, b.id DESC LIMIT ? OFFSET ?"
    );
    let rows = bind_args(sqlx::query(&sql), &args)
        .bind(limit)
        .bind(skip)
        .fetch_all(pool)
        .await?;

    let items = rows.iter().map(book_from_row).collect::<Result<Vec<_>>>()?;
    Ok(Page::new(items, total, skip, limit))
}

pub async fn get_book_by_isbn(pool: &SqlitePool, isbn: &str) -> Result<Option<BookDetail>> {
    let id = sqlx::query_scalar::<_, i64>("SELECT id FROM books WHERE isbn = ?")
        .bind(isbn)
        .fetch_optional(pool)
        .await?;
    match id {
        Some(id) => get_book(pool, id).await,
        None => Ok(None),
    }
}

pub async fn get_book(pool: &SqlitePool, id: i64) -> Result<Option<BookDetail>> {
    let row = sqlx::query(&format!("SELECT {BOOK_COLUMNS} FROM books b WHERE b.id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let book = book_from_row(&row)?;

    let article_rows = sqlx::query(
        r#"
        SELECT a.id, a.title, a.url, ab.relevance_score
        FROM article_books ab JOIN articles a ON a.id = ab.article_id
        WHERE ab.book_id = ? AND a.relevance = 'relevant'
        ORDER BY a.published_at DESC, a.id DESC
        "#,
    )
    .bind(id)
    .fetch_all(pool)
    .await?;

    let articles = article_rows
        .iter()
        .map(|r| {
            Ok(ArticleRef {
                id: r.try_get("id")?,
                title: r.try_get("title")?,
                url: r.try_get("url")?,
                relevance_score: r.try_get("relevance_score")?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let topics = topic_refs(
        pool,
        "SELECT t.id, t.name FROM book_topics bt JOIN topics t ON t.id = bt.topic_id \
         WHERE bt.book_id = ? ORDER BY t.name",
        id,
    )
    .await?;

    Ok(Some(BookDetail { book, articles, topics }))
}

/// Topics with the number of relevant articles tagged with each, busiest first.
/// `keyword` matches a substring of the topic name.
pub async fn list_topics(pool: &SqlitePool, keyword: Option<&str>, skip: i64, limit: i64) -> Result<Page<TopicRecord>> {
    let pattern = keyword.filter(|k| !k.trim().is_empty()).map(like_pattern);

    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM topics t WHERE (? IS NULL OR t.name LIKE ?)")
        .bind(&pattern)
        .bind(&pattern)
        .fetch_one(pool)
        .await?;

    let rows = sqlx::query(
        r#"
        SELECT t.id, t.name, COUNT(a.id) AS article_count
        FROM topics t
        LEFT JOIN article_topics tg ON tg.topic_id = t.id
        LEFT JOIN articles a ON a.id = tg.article_id AND a.relevance = 'relevant'
        WHERE (? IS NULL OR t.name LIKE ?)
        GROUP BY t.id, t.name
        ORDER BY article_count DESC, t.name
        LIMIT ? OFFSET ?
        "#,
    )
    .bind(&pattern)
    .bind(&pattern)
    .bind(limit)
    .bind(skip)
    .fetch_all(pool)
    .await?;

    let items = rows
        .iter()
        .map(|r| {
            Ok(TopicRecord {
                id: r.try_get("id")?,
                name: r.try_get("name")?,
                article_count: r.try_get("article_count")?,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Page::new(items, total, skip, limit))
}

async fn topic_exists(pool: &SqlitePool, topic_id: i64) -> Result<bool> {
    let found = sqlx::query_scalar::<_, i64>("SELECT id FROM topics WHERE id = ?")
        .bind(topic_id)
        .fetch_optional(pool)
        .await?;
    Ok(found.is_some())
}

/// One topic with how many relevant articles and books carry it.
pub async fn get_topic(pool: &SqlitePool, topic_id: i64) -> Result<Option<TopicDetail>> {
    let row = sqlx::query(
        r#"
        SELECT t.id, t.name,
            (SELECT COUNT(*) FROM article_topics tg JOIN articles a ON a.id = tg.article_id
              WHERE tg.topic_id = t.id AND a.relevance = 'relevant') AS article_count,
            (SELECT COUNT(*) FROM book_topics bt WHERE bt.topic_id = t.id) AS book_count
        FROM topics t
        WHERE t.id = ?
        "#,
    )
    .bind(topic_id)
    .fetch_optional(pool)
    .await?;

    row.map(|r| {
        Ok(TopicDetail {
            id: r.try_get("id")?,
            name: r.try_get("name")?,
            article_count: r.try_get("article_count")?,
            book_count: r.try_get("book_count")?,
        })
    })
    .transpose()
}

/// Relevant articles tagged with a topic; `None` when the topic does not exist.
pub async fn topic_articles(
    pool: &SqlitePool,
    topic_id: i64,
    skip: i64,
    limit: i64,
) -> Result<Option<Page<ArticleSummary>>> {
    if !topic_exists(pool, topic_id).await? {
        return Ok(None);
    }
    let filter = ArticleFilter {
        topic_id: Some(topic_id),
        ..ArticleFilter::default()
    };
    list_articles(pool, &filter, skip, limit).await.map(Some)
}

/// Books linked to a topic; `None` when the topic does not exist.
pub async fn topic_books(pool: &SqlitePool, topic_id: i64, skip: i64, limit: i64) -> Result<Option<Page<BookRecord>>> {
    if !topic_exists(pool, topic_id).await? {
        return Ok(None);
    }
    let filter = BookFilter {
        topic_id: Some(topic_id),
        ..BookFilter::default()
    };
    list_books(pool, &filter, skip, limit).await.map(Some)
}

async fn topic_refs(pool: &SqlitePool, sql: &str, id: i64) -> Result<Vec<TopicRef>> {
    let rows = sqlx::query(sql).bind(id).fetch_all(pool).await?;
    rows.iter()
        .map(|r| {
            Ok(TopicRef {
                id: r.try_get("id")?,
                name: r.try_get("name")?,
            })
        })
        .collect()
}
