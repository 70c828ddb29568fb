use std::sync::Arc;

use anyhow::anyhow;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use rocket::figment::Figment;
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{get, post, routes, Build, Rocket, State};
use serde::Serialize;
use sqlx::SqlitePool;

use common::Config;

use crate::books::{isbn10_to_isbn13, normalize_isbn13};
use crate::error::PipelineError;
use crate::processing::ContentProcessor;
use crate::storage::{
    self, ArticleDetail, ArticleFilter, ArticleSummary, BookDetail, BookFilter, BookRecord, CatalogCounts, Page, RunRecord,
    TopicDetail, TopicRecord,
};

pub const DEFAULT_PAGE_LIMIT: i64 = 20;
pub const MAX_PAGE_LIMIT: i64 = 100;

/// Application state stored inside Rocket managed state.
#[derive(Clone)]
pub struct AppState {
    pub started_at: DateTime<Utc>,
    pub config: Option<Arc<Config>>,
    pub db: SqlitePool,
    /// Absent when the pipeline clients could not be configured; reads still work.
    pub processor: Option<Arc<ContentProcessor>>,
}

/// Response structure for `/api/v1/status`.
#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
    uptime_seconds: i64,
    scheduler_times: Vec<String>,
    processing: bool,
    catalog: CatalogCounts,
    last_run: Option<RunRecord>,
}

#[derive(Serialize)]
struct TriggerResponse {
    status: &'static str,
}

/// Normalize `skip`/`limit` query values: skip >= 0, limit in 1..=100.
pub fn page_bounds(skip: Option<i64>, limit: Option<i64>) -> (i64, i64) {
    let skip = skip.unwrap_or(0).max(0);
    let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT);
    (skip, limit)
}

/// Parse a `start_date`/`end_date` value: RFC 3339, or `YYYY-MM-DD` covering the whole day.
pub fn parse_date_bound(raw: &str, end_of_day: bool) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()?;
    let time = if end_of_day {
        date.and_hms_opt(23, 59, 59)?
    } else {
        date.and_hms_opt(0, 0, 0)?
    };
    Some(Utc.from_utc_datetime(&time))
}

fn date_param(raw: Option<String>, end_of_day: bool) -> Result<Option<DateTime<Utc>>, Status> {
    match raw {
        None => Ok(None),
        Some(s) => parse_date_bound(&s, end_of_day).map(Some).ok_or(Status::BadRequest),
    }
}

fn internal_error(context: &str, e: PipelineError) -> Status {
    tracing::error!(error = %e, "{}", context);
    Status::InternalServerError
}

#[get("/health")]
async fn health() -> &'static str {
    "OK"
}

#[get("/api/v1/status")]
async fn status(state: &State<AppState>) -> Result<Json<StatusResponse>, Status> {
    let uptime = (Utc::now() - state.started_at).num_seconds();
    let scheduler_times = state
        .config
        .as_ref()
        .map(|c| c.scheduler.times.clone())
        .unwrap_or_default();

    let catalog = storage::catalog_counts(&state.db)
        .await
        .map_err(|e| internal_error("failed to count catalog", e))?;
    let last_run = storage::last_run(&state.db)
        .await
        .map_err(|e| internal_error("failed to load last run", e))?;

    Ok(Json(StatusResponse {
        status: "ok",
        uptime_seconds: uptime,
        scheduler_times,
        processing: state.processor.as_ref().map_or(false, |p| p.is_running()),
        catalog,
        last_run,
    }))
}

#[get("/api/v1/articles?<skip>&<limit>&<topic_id>&<keyword>&<start_date>&<end_date>")]
async fn list_articles(
    state: &State<AppState>,
    skip: Option<i64>,
    limit: Option<i64>,
    topic_id: Option<i64>,
    keyword: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
) -> Result<Json<Page<ArticleSummary>>, Status> {
    let (skip, limit) = page_bounds(skip, limit);
    let filter = ArticleFilter {
        topic_id,
        keyword,
        published_from: date_param(start_date, false)?,
        published_to: date_param(end_date, true)?,
    };
    storage::list_articles(&state.db, &filter, skip, limit)
        .await
        .map(Json)
        .map_err(|e| internal_error("failed to list articles", e))
}

#[get("/api/v1/articles/<id>")]
async fn get_article(state: &State<AppState>, id: i64) -> Result<Json<ArticleDetail>, Status> {
    storage::get_article(&state.db, id)
        .await
        .map_err(|e| internal_error("failed to load article", e))?
        .map(Json)
        .ok_or(Status::NotFound)
}

#[get("/api/v1/books?<skip>&<limit>&<topic_id>&<author>&<keyword>")]
async fn list_books(
    state: &State<AppState>,
    skip: Option<i64>,
    limit: Option<i64>,
    topic_id: Option<i64>,
    author: Option<String>,
    keyword: Option<String>,
) -> Result<Json<Page<BookRecord>>, Status> {
    let (skip, limit) = page_bounds(skip, limit);
    let filter = BookFilter { topic_id, author, keyword };
    storage::list_books(&state.db, &filter, skip, limit)
        .await
        .map(Json)
        .map_err(|e| internal_error("failed to list books", e))
}

#[get("/api/v1/books/<id>")]
async fn get_book(state: &State<AppState>, id: i64) -> Result<Json<BookDetail>, Status> {
    storage::get_book(&state.db, id)
        .await
        .map_err(|e| internal_error("failed to load book", e))?
        .map(Json)
        .ok_or(Status::NotFound)
}

/// Accepts ISBN-13 or ISBN-10, with or without hyphens.
#[get("/api/v1/books/isbn/<isbn>")]
async fn get_book_by_isbn(state: &State<AppState>, isbn: &str) -> Result<Json<BookDetail>, Status> {
    let isbn = normalize_isbn13(isbn)
        .or_else(|| isbn10_to_isbn13(isbn))
        .ok_or(Status::BadRequest)?;
    storage::get_book_by_isbn(&state.db, &isbn)
        .await
        .map_err(|e| internal_error("failed to load book by isbn", e))?
        .map(Json)
        .ok_or(Status::NotFound)
}

#[get("/api/v1/topics?<skip>&<limit>&<keyword>")]
async fn list_topics(
    state: &State<AppState>,
    skip: Option<i64>,
    limit: Option<i64>,
    keyword: Option<String>,
) -> Result<Json<Page<TopicRecord>>, Status> {
    let (skip, limit) = page_bounds(skip, limit);
    storage::list_topics(&state.db, keyword.as_deref(), skip, limit)
        .await
        .map(Json)
        .map_err(|e| internal_error("failed to list topics", e))
}

#[get("/api/v1/topics/<id>")]
async fn get_topic(state: &State<AppState>, id: i64) -> Result<Json<TopicDetail>, Status> {
    storage::get_topic(&state.db, id)
        .await
        .map_err(|e| internal_error("failed to load topic", e))?
        .map(Json)
        .ok_or(Status::NotFound)
}

#[get("/api/v1/topics/<id>/books?<skip>&<limit>")]
async fn topic_books(
    state: &State<AppState>,
    id: i64,
    skip: Option<i64>,
    limit: Option<i64>,
) -> Result<Json<Page<BookRecord>>, Status> {
    let (skip, limit) = page_bounds(skip, limit);
    storage::topic_books(&state.db, id, skip, limit)
        .await
        .map_err(|e| internal_error("failed to list topic books", e))?
        .map(Json)
        .ok_or(Status::NotFound)
}

#[get("/api/v1/topics/<id>/articles?<skip>&<limit>")]
async fn topic_articles(
    state: &State<AppState>,
    id: i64,
    skip: Option<i64>,
    limit: Option<i64>,
) -> Result<Json<Page<ArticleSummary>>, Status> {
    let (skip, limit) = page_bounds(skip, limit);
    storage::topic_articles(&state.db, id, skip, limit)
        .await
        .map_err(|e| internal_error("failed to list topic articles", e))?
        .map(Json)
        .ok_or(Status::NotFound)
}

/// Start one processing batch in the background.
#[post("/api/system/process")]
async fn trigger_process(state: &State<AppState>) -> Result<(Status, Json<TriggerResponse>), Status> {
    let processor = state.processor.clone().ok_or(Status::ServiceUnavailable)?;
    if processor.is_running() {
        return Err(Status::Conflict);
    }

    tokio::spawn(async move {
        tracing::info!("manual trigger: starting processing batch");
        match processor.run_batch().await {
            Ok(report) => tracing::info!(run_id = %report.run_id, persisted = report.counts.persisted, "manual batch finished"),
            Err(PipelineError::BatchInProgress) => tracing::warn!("manual trigger raced with a running batch"),
            Err(e) => tracing::error!(error = %e, "manual batch failed"),
        }
    });

    Ok((Status::Accepted, Json(TriggerResponse { status: "accepted" })))
}

/// Build the Rocket instance with managed state and all routes mounted.
pub fn build_rocket(state: AppState, figment: Figment) -> Rocket<Build> {
    rocket::custom(figment).manage(state).mount(
        "/",
        routes![
            health,
            status,
            list_articles,
            get_article,
            list_books,
            get_book,
            get_book_by_isbn,
            list_topics,
            get_topic,
            topic_books,
            topic_articles,
            trigger_process,
        ],
    )
}

/// Launch the HTTP server, applying `[server] bind`/`port` over Rocket's defaults.
/// Runs until Rocket shuts down.
pub async fn launch_rocket(state: AppState) -> anyhow::Result<()> {
    let mut fig = rocket::Config::figment();
    if let Some(server) = state.config.as_ref().and_then(|c| c.server.clone()) {
        if let Some(bind) = server.bind {
            fig = fig.merge(("address", bind));
        }
        if let Some(port) = server.port {
            fig = fig.merge(("port", port));
        }
    }

    tracing::info!("Starting Rocket HTTP server");
    build_rocket(state, fig)
        .launch()
        .await
        .map_err(|e| anyhow!("Rocket failed: {}", e))?;

    tracing::info!("Rocket HTTP server has shut down");
    Ok(())
}
