use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of problem observed while validating a statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// DDL/DML keyword present
    NotReadOnly,
    /// Local parse or EXPLAIN rejected the statement
    Syntax,
    /// Trial execution raised an error
    Runtime,
    /// Trial execution or correction call exceeded its timeout
    Timeout,
    /// The correction collaborator failed to propose a statement
    Correction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub kind: IssueKind,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(kind: IssueKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// One validate → (propose correction) cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIteration {
    pub attempt: usize,
    pub sql: String,
    pub issues: Vec<ValidationIssue>,
    /// Statement proposed by the corrector in response to `issues`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proposed_fix: Option<String>,
    pub validated_at: DateTime<Utc>,
}

impl ValidationIteration {
    pub fn new(attempt: usize, sql: impl Into<String>) -> Self {
        Self {
            attempt,
            sql: sql.into(),
            issues: Vec::new(),
            proposed_fix: None,
            validated_at: Utc::now(),
        }
    }

    pub fn passed(&self) -> bool {
        self.issues.is_empty()
    }
}

/// A statement that passed both the syntax check and the bounded trial execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatedSql {
    pub session_id: String,
    pub sql: String,
    pub dialect: String,
    pub row_sample: usize,
    pub history: Vec<ValidationIteration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    /// The configured number of correction attempts was used up
    IterationCap,
    /// The corrector proposed a statement that was already tried
    LoopDetected,
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectionReason::IterationCap => write!(f, "iteration cap reached"),
            RejectionReason::LoopDetected => write!(f, "correction loop detected"),
        }
    }
}

/// Best-known statement and full history of a rejected validation session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefinementFailure {
    pub session_id: String,
    pub last_sql: String,
    pub dialect: String,
    pub reason: RejectionReason,
    pub history: Vec<ValidationIteration>,
    /// Always false; the statement must not be treated as safe
    pub validated: bool,
}
