use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use rocket::http::Status;
use rocket::local::asynchronous::Client;
use serde_json::Value;
use sqlx::SqlitePool;
use tokio::sync::Notify;

use newsshelf::analysis::{AnalyzerSettings, RelevanceAnalyzer, RelevanceAssessment};
use newsshelf::books::{BookCatalog, CandidateBook};
use newsshelf::error::Result;
use newsshelf::llm::{LlmProvider, LlmRequest, LlmResponse};
use newsshelf::news::{NewsSource, PageWindow, RawArticle};
use newsshelf::processing::{ContentProcessor, ProcessorSettings};
use newsshelf::ranking::{BookJudgement, BookRelevanceRanker};
use newsshelf::server::{build_rocket, AppState};
use newsshelf::storage;

struct GatedNews {
    gate: Arc<Notify>,
}

#[async_trait::async_trait]
impl NewsSource for GatedNews {
    async fn fetch_candidates(&self, _filter_terms: &[String], _window: &PageWindow) -> Result<Vec<RawArticle>> {
        self.gate.notified().await;
        Ok(Vec::new())
    }
}

struct EmptyCatalog;

#[async_trait::async_trait]
impl BookCatalog for EmptyCatalog {
    async fn search(&self, _keyword: &str) -> Result<Vec<CandidateBook>> {
        Ok(Vec::new())
    }
}

struct SilentLlm;

#[async_trait::async_trait]
impl LlmProvider for SilentLlm {
    async fn generate(&self, _request: LlmRequest) -> anyhow::Result<LlmResponse> {
        anyhow::bail!("no model in server tests")
    }

    fn model(&self) -> &str {
        "silent"
    }
}

async fn test_pool(dir: &tempfile::TempDir) -> SqlitePool {
    let path = dir.path().join("server.db");
    let pool = common::init_db_pool(&path.to_string_lossy(), 4).await.expect("pool");
    common::run_migrations(&pool).await.expect("migrations");
    pool
}

fn gated_processor(pool: &SqlitePool, gate: Arc<Notify>) -> Arc<ContentProcessor> {
    let llm: Arc<dyn LlmProvider> = Arc::new(SilentLlm);
    Arc::new(ContentProcessor::new(
        Arc::new(GatedNews { gate }),
        Arc::new(EmptyCatalog),
        RelevanceAnalyzer::new(llm.clone(), AnalyzerSettings::default()),
        BookRelevanceRanker::new(llm, "social justice", 0.8),
        pool.clone(),
        ProcessorSettings::default(),
    ))
}

async fn client(pool: &SqlitePool, processor: Option<Arc<ContentProcessor>>) -> Client {
    let state = AppState {
        started_at: Utc::now(),
        config: None,
        db: pool.clone(),
        processor,
    };
    Client::tracked(build_rocket(state, rocket::Config::figment()))
        .await
        .expect("valid rocket instance")
}

fn raw(id: &str, title: &str, day: u32) -> RawArticle {
    RawArticle {
        external_id: id.to_string(),
        title: title.to_string(),
        trail_text: None,
        body: format!("Body of {}", title),
        url: format!("https://www.theguardian.com/{}", id),
        section: Some("US news".to_string()),
        image_url: None,
        source: "The Guardian".to_string(),
        published_at: Some(Utc.with_ymd_and_hms(2025, 1, day, 9, 0, 0).unwrap()),
    }
}

fn assessment(relevant: bool, keywords: &[&str]) -> RelevanceAssessment {
    if relevant {
        RelevanceAssessment {
            is_relevant: true,
            score: 0.9,
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            summary: Some("Housing and lending".to_string()),
            rejection: None,
        }
    } else {
        RelevanceAssessment::not_relevant(0.1, "model judged the article not relevant")
    }
}

struct Seeded {
    relevant_id: i64,
    hidden_id: i64,
    book_id: i64,
    topic_id: i64,
}

/// Three relevant articles, one hidden article, one book and one topic linked to the first article.
async fn seed(pool: &SqlitePool) -> Seeded {
    let mut conn = pool.acquire().await.unwrap();
    let now = Utc::now();

    let mut redlining = raw("us-news/redlining", "Redlining is back", 3);
    redlining.image_url = Some("https://media.guim.co.uk/redlining/500.jpg".to_string());
    let relevant_id = storage::upsert_article(&mut conn, &redlining, &assessment(true, &["redlining"]), now)
        .await
        .unwrap();
    storage::upsert_article(&mut conn, &raw("us-news/vote", "Voting rights case", 2), &assessment(true, &["voting rights"]), now)
        .await
        .unwrap();
    storage::upsert_article(&mut conn, &raw("us-news/bail", "Bail reform vote", 1), &assessment(true, &["bail reform"]), now)
        .await
        .unwrap();
    let hidden_id = storage::upsert_article(&mut conn, &raw("sport/final", "Cup final recap", 4), &assessment(false, &[]), now)
        .await
        .unwrap();

    let topic_id = storage::upsert_topic(&mut conn, "redlining").await.unwrap();
    storage::link_article_topic(&mut conn, relevant_id, topic_id).await.unwrap();
    storage::link_article_topic(&mut conn, hidden_id, topic_id).await.unwrap();

    let book = CandidateBook {
        isbn: "9781631492853".to_string(),
        catalog_id: Some("vol-color-of-law".to_string()),
        title: "The Color of Law".to_string(),
        authors: vec!["Richard Rothstein".to_string()],
        description: "A forgotten history of how our government segregated America.".to_string(),
        info_url: None,
        cover_url: None,
        published_date: Some("2017".to_string()),
        categories: vec!["History".to_string()],
    };
    let book_id = storage::upsert_book(&mut conn, &book).await.unwrap();
    let judgement = BookJudgement {
        relevant: true,
        score: 0.95,
        explanation: "Documents the federal redlining maps".to_string(),
    };
    storage::link_article_book(&mut conn, relevant_id, book_id, &judgement).await.unwrap();
    storage::link_book_topic(&mut conn, book_id, topic_id).await.unwrap();

    Seeded {
        relevant_id,
        hidden_id,
        book_id,
        topic_id,
    }
}

#[tokio::test]
async fn test_health() {
    let dir = tempfile::tempdir().unwrap();
    let pool = test_pool(&dir).await;
    let client = client(&pool, None).await;

    let response = client.get("/health").dispatch().await;
    assert_eq!(response.status(), Status::Ok);
    assert_eq!(response.into_string().await.as_deref(), Some("OK"));
}

#[tokio::test]
async fn test_status_reports_counts() {
    let dir = tempfile::tempdir().unwrap();
    let pool = test_pool(&dir).await;
    seed(&pool).await;
    let client = client(&pool, None).await;

    let response = client.get("/api/v1/status").dispatch().await;
    assert_eq!(response.status(), Status::Ok);
    let body: Value = response.into_json().await.expect("json body");
    assert_eq!(body["status"], "ok");
    assert_eq!(body["processing"], false);
    assert_eq!(body["catalog"]["articles"], 3);
    assert_eq!(body["catalog"]["books"], 1);
    assert_eq!(body["catalog"]["topics"], 1);
    assert!(body["last_run"].is_null());
}

#[tokio::test]
async fn test_article_listing_is_paginated_and_hides_unrelated() {
    let dir = tempfile::tempdir().unwrap();
    let pool = test_pool(&dir).await;
    seed(&pool).await;
    let client = client(&pool, None).await;

    let response = client.get("/api/v1/articles?skip=0&limit=2").dispatch().await;
    assert_eq!(response.status(), Status::Ok);
    let page: Value = response.into_json().await.expect("json body");
    assert_eq!(page["total"], 3);
    assert_eq!(page["limit"], 2);
    assert_eq!(page["has_more"], true);
    let titles: Vec<&str> = page["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a["title"].as_str().unwrap())
        .collect();
    assert_eq!(titles, vec!["Redlining is back", "Voting rights case"]);

    let response = client.get("/api/v1/articles?skip=2&limit=500").dispatch().await;
    let page: Value = response.into_json().await.expect("json body");
    assert_eq!(page["limit"], 100);
    assert_eq!(page["has_more"], false);
    assert_eq!(page["items"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_article_detail_includes_books_and_topics() {
    let dir = tempfile::tempdir().unwrap();
    let pool = test_pool(&dir).await;
    let seeded = seed(&pool).await;
    let client = client(&pool, None).await;

    let response = client
        .get(format!("/api/v1/articles/{}", seeded.relevant_id))
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);
    let article: Value = response.into_json().await.expect("json body");
    assert_eq!(article["external_id"], "us-news/redlining");
    assert_eq!(article["books"][0]["isbn"], "9781631492853");
    assert_eq!(article["books"][0]["authors"][0], "Richard Rothstein");
    assert_eq!(article["books"][0]["relevance_explanation"], "Documents the federal redlining maps");
    assert_eq!(article["topics"][0]["name"], "redlining");
    assert_eq!(article["image_url"], "https://media.guim.co.uk/redlining/500.jpg");

    let response = client
        .get(format!("/api/v1/articles/{}", seeded.hidden_id))
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::NotFound);

    let response = client.get("/api/v1/articles/9999").dispatch().await;
    assert_eq!(response.status(), Status::NotFound);
}

fn titles(page: &Value) -> Vec<&str> {
    page["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a["title"].as_str().unwrap())
        .collect()
}

async fn get_json(client: &Client, uri: &str) -> Value {
    let response = client.get(uri.to_string()).dispatch().await;
    assert_eq!(response.status(), Status::Ok, "GET {}", uri);
    response.into_json().await.expect("json body")
}

#[tokio::test]
async fn test_article_listing_filters() {
    let dir = tempfile::tempdir().unwrap();
    let pool = test_pool(&dir).await;
    let seeded = seed(&pool).await;
    let client = client(&pool, None).await;

    let page = get_json(&client, &format!("/api/v1/articles?topic_id={}", seeded.topic_id)).await;
    assert_eq!(page["total"], 1);
    assert_eq!(titles(&page), vec!["Redlining is back"]);

    let page = get_json(&client, "/api/v1/articles?keyword=VOTING").await;
    assert_eq!(titles(&page), vec!["Voting rights case"]);

    // Body text is searched too.
    let page = get_json(&client, "/api/v1/articles?keyword=Body%20of%20Bail").await;
    assert_eq!(titles(&page), vec!["Bail reform vote"]);

    let page = get_json(&client, "/api/v1/articles?start_date=2025-01-02").await;
    assert_eq!(titles(&page), vec!["Redlining is back", "Voting rights case"]);

    let page = get_json(&client, "/api/v1/articles?start_date=2025-01-02&end_date=2025-01-02").await;
    assert_eq!(titles(&page), vec!["Voting rights case"]);

    let page = get_json(&client, "/api/v1/articles?end_date=2025-01-01T23:00:00Z&keyword=reform").await;
    assert_eq!(titles(&page), vec!["Bail reform vote"]);

    // The hidden article falls inside the window but is never listed.
    let page = get_json(&client, "/api/v1/articles?start_date=2025-01-04").await;
    assert_eq!(page["total"], 0);

    let response = client.get("/api/v1/articles?start_date=yesterday").dispatch().await;
    assert_eq!(response.status(), Status::BadRequest);
}

#[tokio::test]
async fn test_book_listing_filters_and_isbn_lookup() {
    let dir = tempfile::tempdir().unwrap();
    let pool = test_pool(&dir).await;
    let seeded = seed(&pool).await;
    {
        let mut conn = pool.acquire().await.unwrap();
        let other = CandidateBook {
            isbn: "9780812994520".to_string(),
            catalog_id: None,
            title: "Just Mercy".to_string(),
            authors: vec!["Bryan Stevenson".to_string()],
            description: "A story of justice and redemption.".to_string(),
            info_url: None,
            cover_url: None,
            published_date: Some("2014".to_string()),
            categories: vec!["Law".to_string()],
        };
        storage::upsert_book(&mut conn, &other).await.unwrap();
    }
    let client = client(&pool, None).await;

    let page = get_json(&client, "/api/v1/books").await;
    assert_eq!(page["total"], 2);

    let page = get_json(&client, &format!("/api/v1/books?topic_id={}", seeded.topic_id)).await;
    assert_eq!(titles(&page), vec!["The Color of Law"]);

    let page = get_json(&client, "/api/v1/books?author=stevenson").await;
    assert_eq!(titles(&page), vec!["Just Mercy"]);

    let page = get_json(&client, "/api/v1/books?keyword=segregated").await;
    assert_eq!(titles(&page), vec!["The Color of Law"]);

    let page = get_json(&client, "/api/v1/books?author=rothstein&keyword=mercy").await;
    assert_eq!(page["total"], 0);

    let book = get_json(&client, "/api/v1/books/isbn/978-1-63149-285-3").await;
    assert_eq!(book["id"], seeded.book_id);
    assert_eq!(book["articles"][0]["title"], "Redlining is back");

    // ISBN-10 form of the same book.
    let book = get_json(&client, "/api/v1/books/isbn/1631492853").await;
    assert_eq!(book["title"], "The Color of Law");

    let response = client.get("/api/v1/books/isbn/9780000000002").dispatch().await;
    assert_eq!(response.status(), Status::NotFound);
    let response = client.get("/api/v1/books/isbn/not-an-isbn").dispatch().await;
    assert_eq!(response.status(), Status::BadRequest);
}

#[tokio::test]
async fn test_topic_detail_and_books() {
    let dir = tempfile::tempdir().unwrap();
    let pool = test_pool(&dir).await;
    let seeded = seed(&pool).await;
    {
        let mut conn = pool.acquire().await.unwrap();
        storage::upsert_topic(&mut conn, "voting rights").await.unwrap();
    }
    let client = client(&pool, None).await;

    let topic = get_json(&client, &format!("/api/v1/topics/{}", seeded.topic_id)).await;
    assert_eq!(topic["name"], "redlining");
    // The hidden article is tagged too but not counted.
    assert_eq!(topic["article_count"], 1);
    assert_eq!(topic["book_count"], 1);

    let response = client.get("/api/v1/topics/9999").dispatch().await;
    assert_eq!(response.status(), Status::NotFound);

    let page = get_json(&client, &format!("/api/v1/topics/{}/books", seeded.topic_id)).await;
    assert_eq!(page["total"], 1);
    assert_eq!(page["items"][0]["isbn"], "9781631492853");

    let response = client.get("/api/v1/topics/9999/books").dispatch().await;
    assert_eq!(response.status(), Status::NotFound);

    let page = get_json(&client, "/api/v1/topics?keyword=VOTING").await;
    assert_eq!(page["total"], 1);
    assert_eq!(page["items"][0]["name"], "voting rights");
    assert_eq!(page["items"][0]["article_count"], 0);
}

#[tokio::test]
async fn test_book_endpoints() {
    let dir = tempfile::tempdir().unwrap();
    let pool = test_pool(&dir).await;
    let seeded = seed(&pool).await;
    let client = client(&pool, None).await;

    let page: Value = client
        .get("/api/v1/books")
        .dispatch()
        .await
        .into_json()
        .await
        .expect("json body");
    assert_eq!(page["total"], 1);
    assert_eq!(page["items"][0]["title"], "The Color of Law");

    let response = client.get(format!("/api/v1/books/{}", seeded.book_id)).dispatch().await;
    assert_eq!(response.status(), Status::Ok);
    let book: Value = response.into_json().await.expect("json body");
    assert_eq!(book["articles"].as_array().unwrap().len(), 1);
    assert_eq!(book["articles"][0]["title"], "Redlining is back");
    assert_eq!(book["topics"][0]["name"], "redlining");

    let response = client.get("/api/v1/books/9999").dispatch().await;
    assert_eq!(response.status(), Status::NotFound);
}

#[tokio::test]
async fn test_topic_endpoints() {
    let dir = tempfile::tempdir().unwrap();
    let pool = test_pool(&dir).await;
    let seeded = seed(&pool).await;
    let client = client(&pool, None).await;

    let page: Value = client
        .get("/api/v1/topics?limit=0")
        .dispatch()
        .await
        .into_json()
        .await
        .expect("json body");
    assert_eq!(page["limit"], 1);
    assert_eq!(page["total"], 1);

    let response = client
        .get(format!("/api/v1/topics/{}/articles", seeded.topic_id))
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);
    let page: Value = response.into_json().await.expect("json body");
    // The unrelated article shares the topic but stays hidden.
    assert_eq!(page["total"], 1);
    assert_eq!(page["items"][0]["id"], seeded.relevant_id);

    let response = client.get("/api/v1/topics/9999/articles").dispatch().await;
    assert_eq!(response.status(), Status::NotFound);
}

#[tokio::test]
async fn test_trigger_without_processor_is_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let pool = test_pool(&dir).await;
    let client = client(&pool, None).await;

    let response = client.post("/api/system/process").dispatch().await;
    assert_eq!(response.status(), Status::ServiceUnavailable);
}

#[tokio::test]
async fn test_trigger_accepts_then_conflicts_while_running() {
    let dir = tempfile::tempdir().unwrap();
    let pool = test_pool(&dir).await;
    let gate = Arc::new(Notify::new());
    let processor = gated_processor(&pool, gate.clone());
    let client = client(&pool, Some(processor.clone())).await;

    let response = client.post("/api/system/process").dispatch().await;
    assert_eq!(response.status(), Status::Accepted);
    let body: Value = response.into_json().await.expect("json body");
    assert_eq!(body["status"], "accepted");

    for _ in 0..100 {
        if processor.is_running() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(processor.is_running());

    let response = client.post("/api/system/process").dispatch().await;
    assert_eq!(response.status(), Status::Conflict);

    let status: Value = client
        .get("/api/v1/status")
        .dispatch()
        .await
        .into_json()
        .await
        .expect("json body");
    assert_eq!(status["processing"], true);

    gate.notify_one();
    for _ in 0..100 {
        if !processor.is_running() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!processor.is_running());

    let status: Value = client
        .get("/api/v1/status")
        .dispatch()
        .await
        .into_json()
        .await
        .expect("json body");
    assert_eq!(status["last_run"]["status"], "completed");
}
