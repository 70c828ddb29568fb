//! Diagnostic: fetch one window of candidate articles and, optionally, run the
//! catalog search for a keyword, without touching the database or the model.

use clap::Parser;
use std::path::PathBuf;

use newsshelf::books::{BookCatalog, GoogleBooksClient};
use newsshelf::http::RetryPolicy;
use newsshelf::news::{GuardianClient, NewsSource, PageWindow};

#[derive(Parser, Debug)]
#[command(name = "check_sources", about = "Query the news and book catalog APIs once and print the results")]
struct Args {
    /// Path to config.toml (merged over config.default.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Also search the book catalog for this keyword
    #[arg(long)]
    keyword: Option<String>,

    /// Number of articles to print
    #[arg(long, default_value_t = 5)]
    show: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    let default_path = PathBuf::from("config.default.toml");
    let config = common::Config::load_with_defaults(
        Some(default_path.as_path()).filter(|p| p.exists()),
        args.config.as_deref(),
    )
    .await?;

    let retry = RetryPolicy::from_config(config.retry.as_ref());
    let news = GuardianClient::from_config(&config.news, retry)?;
    let window = PageWindow {
        page_size: config.news.page_size.unwrap_or(20),
        ..PageWindow::default()
    };

    println!("\n{}", "=".repeat(60));
    println!("News filter: {:?}", config.news.filter_terms);
    println!("{}", "=".repeat(60));

    match news.fetch_candidates(&config.news.filter_terms, &window).await {
        Ok(articles) => {
            println!("✓ {} articles", articles.len());
            for (i, article) in articles.iter().take(args.show).enumerate() {
                println!("  {}. {}", i + 1, article.title);
                println!("     id: {}", article.external_id);
                println!("     url: {}", article.url);
                println!("     body: {} chars", article.body.chars().count());
            }
        }
        Err(e) => println!("✗ Failed: {}", e),
    }

    if let Some(keyword) = args.keyword {
        let catalog = GoogleBooksClient::from_config(&config.books.clone().unwrap_or_default(), retry)?;
        println!("\n{}", "=".repeat(60));
        println!("Book search: {:?}", keyword);
        println!("{}", "=".repeat(60));
        match catalog.search(&keyword).await {
            Ok(books) => {
                println!("✓ {} candidates after filtering", books.len());
                for book in books.iter().take(args.show) {
                    println!("  {} | {} | {}", book.isbn, book.title, book.authors.join(", "));
                }
            }
            Err(e) => println!("✗ Failed: {}", e),
        }
    }

    Ok(())
}
