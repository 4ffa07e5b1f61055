//! Error taxonomy for the pipeline and the query translator.
//!
//! Row-level errors ([`ValidationError`], [`ReferentialError`]) are
//! collected into batch reports and never abort an ingestion run.
//! [`RebuildError`] and [`QuerySyntaxError`] are returned to the caller.

use thiserror::Error;

/// A raw row was malformed or missed a required field.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid field '{field}': {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn missing(field: &str) -> Self {
        Self::new(field, "required value is missing")
    }
}

/// A dependent row points at a `place_id` that does not exist.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{relation} row '{key}' references unknown place_id '{place_id}'")]
pub struct ReferentialError {
    pub relation: String,
    pub key: String,
    pub place_id: String,
}

/// The aggregate snapshot could not be rebuilt. The previously published
/// snapshot is left untouched.
#[derive(Debug, Error)]
pub enum RebuildError {
    #[error("base relation '{relation}' is unreadable: {source}")]
    Unreadable {
        relation: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("failed to write snapshot v{version}: {source}")]
    Write {
        version: i64,
        #[source]
        source: sqlx::Error,
    },

    #[error("failed to publish snapshot v{version}: {source}")]
    Swap {
        version: i64,
        #[source]
        source: sqlx::Error,
    },

    #[error("snapshot v{version} is incomplete: expected {expected} records, found {found}")]
    Incomplete {
        version: i64,
        expected: i64,
        found: i64,
    },

    #[error("snapshot v{version} was superseded by v{current} before it could be published")]
    Superseded { version: i64, current: i64 },
}

/// A shorthand query could not be translated. Nothing was executed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("syntax error at '{token}': {message}")]
pub struct QuerySyntaxError {
    pub token: String,
    pub message: String,
}

impl QuerySyntaxError {
    pub fn new(token: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            message: message.into(),
        }
    }
}

/// Why a single row did not make it into a base relation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RowError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Referential(#[from] ReferentialError),

    #[error("chunk {chunk} failed: {message}")]
    ChunkFailed { chunk: usize, message: String },

    #[error("database rejected row: {0}")]
    Database(String),
}

/// A rejected row with enough context to find it in the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowRejection {
    /// Source line when known (normalizer), otherwise the row key.
    pub locator: String,
    pub error: RowError,
}

impl RowRejection {
    pub fn at_line(line: u64, error: impl Into<RowError>) -> Self {
        Self {
            locator: format!("line {}", line),
            error: error.into(),
        }
    }

    pub fn for_key(key: impl Into<String>, error: impl Into<RowError>) -> Self {
        Self {
            locator: key.into(),
            error: error.into(),
        }
    }
}

impl std::fmt::Display for RowRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.locator, self.error)
    }
}
