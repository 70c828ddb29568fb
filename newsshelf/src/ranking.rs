use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::analysis::{prepare_text, RelevanceAssessment};
use crate::books::CandidateBook;
use crate::error::{PipelineError, Result};
use crate::llm::{decode_model_json, LlmProvider, LlmRequest};

const ARTICLE_EXCERPT_CHARS: usize = 2_000;

/// What the ranker knows about the article a book is judged against.
#[derive(Debug, Clone)]
pub struct ArticleContext<'a> {
    pub title: &'a str,
    pub text: &'a str,
    pub assessment: &'a RelevanceAssessment,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BookJudgement {
    pub relevant: bool,
    /// Confidence in [0, 1]
    pub score: f64,
    pub explanation: String,
}

impl BookJudgement {
    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            relevant: false,
            score: 0.0,
            explanation: reason.into(),
        }
    }
}

pub struct BookRelevanceRanker {
    llm: Arc<dyn LlmProvider>,
    subject_domain: String,
    min_score: f64,
}

impl BookRelevanceRanker {
    pub fn new(llm: Arc<dyn LlmProvider>, subject_domain: impl Into<String>, min_score: f64) -> Self {
        Self {
            llm,
            subject_domain: subject_domain.into(),
            min_score,
        }
    }

    /// Judge one candidate against the article. Undecodable output rejects the book;
    /// only a failed model call is returned as an error.
    pub async fn judge_relevance(&self, article: &ArticleContext<'_>, book: &CandidateBook) -> Result<BookJudgement> {
        let prompt = self.prompt(article, book);
        let response = self
            .llm
            .generate(LlmRequest {
                prompt,
                max_tokens: Some(750),
                temperature: Some(0.1),
                timeout_seconds: None,
            })
            .await
            .map_err(|e| PipelineError::AnalysisUnavailable(format!("{:#}", e)))?;

        match decode_judgement(&response.content, self.min_score) {
            Ok(judgement) => {
                debug!(
                    isbn = %book.isbn,
                    score = judgement.score,
                    relevant = judgement.relevant,
                    model = %response.model,
                    total_tokens = response.usage.total_tokens,
                    "ranking: book judged"
                );
                Ok(judgement)
            }
            Err(e) => {
                warn!(isbn = %book.isbn, title = %book.title, error = %e, "ranking: unreadable model output, rejecting book");
                Ok(BookJudgement::reject(e.to_string()))
            }
        }
    }

    fn prompt(&self, article: &ArticleContext<'_>, book: &CandidateBook) -> String {
        let excerpt = prepare_text(article.text, ARTICLE_EXCERPT_CHARS);
        format!(
            r#"Judge how well this book gives readers context for the {domain} issues in a news article.

Article title: {title}
Article keywords: {keywords}
Article summary: {summary}
Article excerpt: {excerpt}

Book title: {book_title}
Authors: {authors}
Description: {description}

Respond with valid JSON only:
{{
  "relevance_score": 0.0,
  "explanation": "why and how the book helps understand the article's issues"
}}
relevance_score is a number from 0.0 (unrelated) to 1.0 (essential reading)."#,
            domain = self.subject_domain,
            title = article.title,
            keywords = article.assessment.keywords.join(", "),
            summary = article.assessment.summary.as_deref().unwrap_or("(none)"),
            excerpt = excerpt,
            book_title = book.title,
            authors = book.authors.join(", "),
            description = book.description,
        )
    }
}

#[derive(Debug, Deserialize)]
struct JudgementJson {
    relevance_score: f64,
    #[serde(default)]
    explanation: String,
}

/// Decode a ranking answer; the book is accepted when its score reaches `min_score`.
pub fn decode_judgement(raw: &str, min_score: f64) -> Result<BookJudgement> {
    let parsed: JudgementJson = decode_model_json(raw)?;
    if !parsed.relevance_score.is_finite() {
        return Err(PipelineError::malformed("llm", "relevance_score is not a number"));
    }
    let score = parsed.relevance_score.clamp(0.0, 1.0);
    Ok(BookJudgement {
        relevant: score >= min_score,
        score,
        explanation: parsed.explanation.trim().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_at_threshold() {
        let j = decode_judgement(r#"{"relevance_score": 0.8, "explanation": " Covers redlining. "}"#, 0.8).unwrap();
        assert!(j.relevant);
        assert_eq!(j.explanation, "Covers redlining.");
    }

    #[test]
    fn rejects_below_threshold_and_clamps() {
        let j = decode_judgement(r#"{"relevance_score": 0.79}"#, 0.8).unwrap();
        assert!(!j.relevant);

        let j = decode_judgement(r#"{"relevance_score": -3}"#, 0.8).unwrap();
        assert_eq!(j.score, 0.0);
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            decode_judgement("Highly relevant, 9/10", 0.8),
            Err(PipelineError::MalformedResponse { .. })
        ));
    }
}
