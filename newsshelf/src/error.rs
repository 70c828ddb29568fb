//! Error taxonomy shared by the pipeline components.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Network or HTTP failure from the news or book provider.
    #[error("{provider} unavailable: {reason}")]
    UpstreamUnavailable { provider: &'static str, reason: String },

    /// The language-model call itself failed (transport, status, timeout).
    #[error("analysis unavailable: {0}")]
    AnalysisUnavailable(String),

    /// A response arrived but could not be decoded into the expected shape.
    #[error("malformed response from {source_name}: {reason}")]
    MalformedResponse { source_name: &'static str, reason: String },

    /// Unique-constraint violation; the existing row can be re-fetched.
    #[error("persistence conflict on {0}")]
    PersistenceConflict(String),

    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("a processing batch is already running")]
    BatchInProgress,
}

impl PipelineError {
    pub fn upstream(provider: &'static str, reason: impl Into<String>) -> Self {
        PipelineError::UpstreamUnavailable {
            provider,
            reason: reason.into(),
        }
    }

    pub fn malformed(source_name: &'static str, reason: impl Into<String>) -> Self {
        PipelineError::MalformedResponse {
            source_name,
            reason: reason.into(),
        }
    }

    /// Errors that stay local to one article and turn it into a skipped outcome.
    pub fn is_article_local(&self) -> bool {
        matches!(
            self,
            PipelineError::UpstreamUnavailable { .. }
                | PipelineError::AnalysisUnavailable(_)
                | PipelineError::MalformedResponse { .. }
                | PipelineError::InvalidInput(_)
        )
    }
}

// SQLite extended result codes for UNIQUE and PRIMARY KEY violations.
const SQLITE_CONSTRAINT_UNIQUE: &str = "2067";
const SQLITE_CONSTRAINT_PRIMARYKEY: &str = "1555";

impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            let code = db_err.code();
            if matches!(code.as_deref(), Some(SQLITE_CONSTRAINT_UNIQUE) | Some(SQLITE_CONSTRAINT_PRIMARYKEY)) {
                return PipelineError::PersistenceConflict(db_err.message().to_string());
            }
        }
        PipelineError::PersistenceFailure(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::PersistenceFailure(format!("serialization: {}", err))
    }
}
