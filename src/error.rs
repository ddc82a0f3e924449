use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{RefinementFailure, ValidationIteration};

/// Pipeline stage that produced a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Schema,
    Graph,
    Plan,
    Generate,
    Validate,
    Cache,
    Config,
}

/// Application error types
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Schema mismatch: {}", describe_ref(.table, .column.as_deref()))]
    SchemaMismatch {
        table: String,
        column: Option<String>,
    },

    #[error("Table '{table}' cannot be joined to base table '{base}'")]
    UnreachableTable { base: String, table: String },

    #[error("Ambiguous base table: {0}")]
    AmbiguousBaseTable(String),

    #[error("Conflicting filters on {table}.{column}: {}", .values.join(" vs "))]
    ConflictingFilter {
        table: String,
        column: String,
        values: Vec<String>,
    },

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Duplicate edge {from} -> {to} on {predicate}")]
    DuplicateEdge {
        from: String,
        to: String,
        predicate: String,
    },

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Unsupported SQL dialect: {0}")]
    UnsupportedDialect(String),

    #[error("Refinement exhausted after {} attempt(s): {}", .0.history.len(), .0.reason)]
    RefinementExhausted(Box<RefinementFailure>),

    #[error("Cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("LLM service error: {0}")]
    LlmService(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn describe_ref(table: &str, column: Option<&str>) -> String {
    match column {
        Some(column) => format!("column '{}.{}' does not exist", table, column),
        None => format!("table '{}' does not exist", table),
    }
}

impl AppError {
    pub fn unknown_table(table: impl Into<String>) -> Self {
        AppError::SchemaMismatch {
            table: table.into(),
            column: None,
        }
    }

    pub fn unknown_column(table: impl Into<String>, column: impl Into<String>) -> Self {
        AppError::SchemaMismatch {
            table: table.into(),
            column: Some(column.into()),
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            AppError::SchemaMismatch { .. } => "SCHEMA_MISMATCH",
            AppError::UnreachableTable { .. } => "UNREACHABLE_TABLE",
            AppError::AmbiguousBaseTable(_) => "AMBIGUOUS_BASE_TABLE",
            AppError::ConflictingFilter { .. } => "CONFLICTING_FILTER",
            AppError::InvalidFilter(_) => "INVALID_FILTER",
            AppError::DuplicateEdge { .. } => "DUPLICATE_EDGE",
            AppError::InvalidSchema(_) => "INVALID_SCHEMA",
            AppError::UnsupportedDialect(_) => "UNSUPPORTED_DIALECT",
            AppError::RefinementExhausted(_) => "REFINEMENT_EXHAUSTED",
            AppError::CacheUnavailable(_) => "CACHE_UNAVAILABLE",
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Connection(_) => "CONNECTION_ERROR",
            AppError::LlmService(_) => "LLM_SERVICE_ERROR",
            AppError::Cancelled => "CANCELLED",
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// The pipeline stage this error belongs to
    pub fn stage(&self) -> Stage {
        match self {
            AppError::SchemaMismatch { .. } => Stage::Schema,
            AppError::DuplicateEdge { .. } | AppError::InvalidSchema(_) => Stage::Graph,
            AppError::UnreachableTable { .. }
            | AppError::AmbiguousBaseTable(_)
            | AppError::ConflictingFilter { .. }
            | AppError::InvalidFilter(_) => Stage::Plan,
            AppError::UnsupportedDialect(_) => Stage::Generate,
            AppError::RefinementExhausted(_)
            | AppError::Database(_)
            | AppError::Connection(_)
            | AppError::LlmService(_)
            | AppError::Cancelled => Stage::Validate,
            AppError::CacheUnavailable(_) => Stage::Cache,
            AppError::Config(_) => Stage::Config,
            AppError::Internal(_) => Stage::Plan,
        }
    }

    /// Structured failure for the request boundary
    pub fn to_detail(&self) -> ErrorDetail {
        let detail = ErrorDetail::new(self.code(), self.stage(), self.to_string());
        match self {
            AppError::RefinementExhausted(failure) => detail
                .with_details("the last attempted statement did not pass validation")
                .with_rejected(failure.last_sql.clone(), failure.history.clone()),
            AppError::SchemaMismatch { .. } => detail
                .with_details("Check that the resolved entities use names from the loaded schema."),
            _ => detail,
        }
    }
}

/// Error response format
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub stage: Stage,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Last statement tried by a rejected validation session (unvalidated)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sql: Option<String>,
    /// Every validation round of a rejected session, issues included
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<ValidationIteration>,
}

impl ErrorDetail {
    pub fn new(code: impl Into<String>, stage: Stage, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            stage,
            message: message.into(),
            details: None,
            last_sql: None,
            history: Vec::new(),
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_rejected(mut self, last_sql: String, history: Vec<ValidationIteration>) -> Self {
        self.last_sql = Some(last_sql);
        self.history = history;
        self
    }
}

impl From<AppError> for ErrorResponse {
    fn from(err: AppError) -> Self {
        ErrorResponse {
            error: err.to_detail(),
        }
    }
}

/// Convert anyhow::Error to AppError
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// Convert rusqlite::Error to AppError
impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        AppError::CacheUnavailable(err.to_string())
    }
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        AppError::CacheUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Internal(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{IssueKind, RejectionReason, ValidationIssue};

    #[test]
    fn test_schema_mismatch_message() {
        let err = AppError::unknown_column("funds", "aum");
        assert_eq!(err.to_string(), "Schema mismatch: column 'funds.aum' does not exist");
        assert_eq!(err.stage(), Stage::Schema);

        let err = AppError::unknown_table("fundz");
        assert!(err.to_string().contains("table 'fundz'"));
    }

    #[test]
    fn test_error_detail_creation() {
        let err = AppError::ConflictingFilter {
            table: "funds".to_string(),
            column: "fund_type".to_string(),
            values: vec!["'conservative'".to_string(), "'aggressive'".to_string()],
        };
        let detail = err.to_detail();
        assert_eq!(detail.code, "CONFLICTING_FILTER");
        assert_eq!(detail.stage, Stage::Plan);
        assert!(detail.message.contains("funds.fund_type"));
        assert!(detail.details.is_none());
    }

    #[test]
    fn test_error_response_serializes_stage() {
        let response: ErrorResponse = AppError::UnsupportedDialect("oracle".to_string()).into();
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["error"]["stage"], "generate");
        assert_eq!(json["error"]["code"], "UNSUPPORTED_DIALECT");
        assert!(json["error"].get("history").is_none());
        assert!(json["error"].get("last_sql").is_none());
    }

    #[test]
    fn test_rejection_detail_keeps_history() {
        let mut first = ValidationIteration::new(1, "SELECT aum FROM funds");
        first
            .issues
            .push(ValidationIssue::new(IssueKind::Syntax, "column \"aum\" does not exist"));
        first.proposed_fix = Some("SELECT aum_total FROM funds".to_string());
        let mut second = ValidationIteration::new(2, "SELECT aum_total FROM funds");
        second
            .issues
            .push(ValidationIssue::new(IssueKind::Runtime, "column \"aum_total\" does not exist"));

        let err = AppError::RefinementExhausted(Box::new(RefinementFailure {
            session_id: "s-1".to_string(),
            last_sql: "SELECT aum_total FROM funds".to_string(),
            dialect: "postgresql".to_string(),
            reason: RejectionReason::IterationCap,
            history: vec![first, second],
            validated: false,
        }));

        let detail = err.to_detail();
        assert_eq!(detail.stage, Stage::Validate);
        assert_eq!(detail.last_sql.as_deref(), Some("SELECT aum_total FROM funds"));
        assert_eq!(detail.history.len(), 2);

        let json = serde_json::to_value(ErrorResponse { error: detail }).unwrap();
        assert_eq!(json["error"]["history"][0]["proposed_fix"], "SELECT aum_total FROM funds");
        assert_eq!(
            json["error"]["history"][1]["issues"][0]["message"],
            "column \"aum_total\" does not exist"
        );
    }
}
