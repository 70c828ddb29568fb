//! Article relevance analysis and keyword extraction.

use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::llm::{decode_model_json, LlmProvider, LlmRequest};

/// Outcome of asking the model whether an article belongs to the subject domain.
#[derive(Debug, Clone, PartialEq)]
pub struct RelevanceAssessment {
    pub is_relevant: bool,
    pub score: f64,
    /// Normalized search keywords; empty unless relevant
    pub keywords: Vec<String>,
    pub summary: Option<String>,
    /// Why the article was judged not relevant, when it was
    pub rejection: Option<String>,
}

impl RelevanceAssessment {
    pub fn not_relevant(score: f64, reason: impl Into<String>) -> Self {
        Self {
            is_relevant: false,
            score,
            keywords: Vec::new(),
            summary: None,
            rejection: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnalyzerSettings {
    pub subject_domain: String,
    pub min_score: f64,
    pub max_keywords: usize,
    pub max_input_chars: usize,
}

impl Default for AnalyzerSettings {
    fn default() -> Self {
        Self {
            subject_domain: "social justice".to_string(),
            min_score: 0.8,
            max_keywords: 5,
            max_input_chars: 12_000,
        }
    }
}

pub struct RelevanceAnalyzer {
    llm: Arc<dyn LlmProvider>,
    settings: AnalyzerSettings,
}

impl RelevanceAnalyzer {
    pub fn new(llm: Arc<dyn LlmProvider>, settings: AnalyzerSettings) -> Self {
        Self { llm, settings }
    }

    /// Ask the model for a relevance verdict and search keywords.
    ///
    /// Only a failed model call is an error (`AnalysisUnavailable`). Output that cannot
    /// be decoded, a score under the threshold, or a relevant verdict without usable
    /// keywords all come back as a not-relevant assessment.
    pub async fn assess_relevance(&self, title: &str, article_text: &str) -> Result<RelevanceAssessment> {
        let text = prepare_text(article_text, self.settings.max_input_chars);
        if text.is_empty() {
            return Err(PipelineError::InvalidInput("article text is empty".into()));
        }

        let prompt = relevance_prompt(&self.settings.subject_domain, title, &text);
        let response = self
            .llm
            .generate(LlmRequest {
                prompt,
                max_tokens: Some(1000),
                temperature: Some(0.0),
                timeout_seconds: None,
            })
            .await
            .map_err(|e| PipelineError::AnalysisUnavailable(format!("{:#}", e)))?;

        debug!(
            model = %response.model,
            prompt_tokens = response.usage.prompt_tokens,
            completion_tokens = response.usage.completion_tokens,
            total_tokens = response.usage.total_tokens,
            "analysis: relevance response received"
        );

        match decode_assessment(&response.content, &self.settings) {
            Ok(assessment) => {
                info!(
                    title,
                    relevant = assessment.is_relevant,
                    score = assessment.score,
                    keywords = ?assessment.keywords,
                    "analysis: article assessed"
                );
                Ok(assessment)
            }
            Err(e) => {
                warn!(title, error = %e, "analysis: unreadable model output, treating article as not relevant");
                Ok(RelevanceAssessment::not_relevant(0.0, e.to_string()))
            }
        }
    }
}

/// Expected shape of the model's JSON answer.
#[derive(Debug, Deserialize)]
struct AssessmentJson {
    is_relevant: bool,
    relevance_score: f64,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    summary: Option<String>,
}

/// Decode the model output and apply the confidence and keyword policy.
pub fn decode_assessment(raw: &str, settings: &AnalyzerSettings) -> Result<RelevanceAssessment> {
    let parsed: AssessmentJson = decode_model_json(raw)?;

    if !parsed.relevance_score.is_finite() {
        return Err(PipelineError::malformed("llm", "relevance_score is not a number"));
    }
    let score = parsed.relevance_score.clamp(0.0, 1.0);

    if !parsed.is_relevant {
        return Ok(RelevanceAssessment::not_relevant(score, "model judged the article not relevant"));
    }
    if score < settings.min_score {
        return Ok(RelevanceAssessment::not_relevant(
            score,
            format!("score {:.2} below threshold {:.2}", score, settings.min_score),
        ));
    }

    let keywords = normalize_keywords(&parsed.keywords, settings.max_keywords);
    if keywords.is_empty() {
        return Ok(RelevanceAssessment::not_relevant(score, "relevant verdict without usable keywords"));
    }

    Ok(RelevanceAssessment {
        is_relevant: true,
        score,
        keywords,
        summary: parsed.summary.filter(|s| !s.trim().is_empty()),
        rejection: None,
    })
}

/// Normalize a label: trim quotes and punctuation, collapse whitespace, lowercase.
pub fn normalize_label(raw: &str) -> String {
    raw.trim_matches(|c: char| c.is_whitespace() || matches!(c, '"' | '\'' | '`' | '.' | ',' | ';' | ':' | '-' | '*'))
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Normalize, drop empties, deduplicate keeping first occurrence, cap the count.
pub fn normalize_keywords(raw: &[String], max: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    raw.iter()
        .map(|k| normalize_label(k))
        .filter(|k| !k.is_empty())
        .filter(|k| seen.insert(k.clone()))
        .take(max)
        .collect()
}

/// Collapse whitespace and cut to `max_chars` characters on a char boundary.
pub fn prepare_text(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match collapsed.char_indices().nth(max_chars) {
        Some((idx, _)) => collapsed[..idx].to_string(),
        None => collapsed,
    }
}

fn relevance_prompt(domain: &str, title: &str, text: &str) -> String {
    format!(
        r#"Analyze this news article for relevance to {domain} and provide key information.

Title: {title}

Article text:
{text}

Decide:
1. Whether the article is relevant to {domain} issues (true/false)
2. A relevance score (0.0-1.0) for how strongly it relates to {domain}
3. Up to 10 short search terms (specific concepts, events, issues) that would find educational books giving context to this article
4. A brief summary focusing on the {domain} aspects

Respond with valid JSON only, in exactly this format:
{{
  "is_relevant": true,
  "relevance_score": 0.0,
  "keywords": ["term one", "term two"],
  "summary": "..."
}}"#
    )
}
