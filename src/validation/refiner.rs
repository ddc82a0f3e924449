// Validate/refine loop
//
// Generated → Validating → {Valid, NeedsRefinement, Rejected}. Each round runs
// the local checks, an EXPLAIN, and a row-capped trial execution. On failure
// the corrector proposes one replacement statement. The session ends when a
// statement passes, when the corrector repeats an earlier statement, or when
// the correction budget is spent.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use super::sql_validator::SqlValidator;
use crate::config::RefinementConfig;
use crate::error::AppError;
use crate::models::{
    IssueKind, RefinementFailure, RejectionReason, ValidatedSql, ValidationIssue,
    ValidationIteration,
};
use crate::services::database::TrialExecutor;
use crate::services::dialect::{dialect_for, SqlDialect};

/// Input handed to a [`Corrector`]
#[derive(Debug, Clone, Copy)]
pub struct CorrectionRequest<'a> {
    pub sql: &'a str,
    pub dialect: &'a str,
    pub issues: &'a [ValidationIssue],
    /// Earlier rounds of this session, oldest first
    pub history: &'a [ValidationIteration],
}

/// Proposes a replacement for a statement that failed validation.
#[async_trait::async_trait]
pub trait Corrector: Send + Sync {
    async fn propose(&self, request: CorrectionRequest<'_>) -> Result<String, AppError>;
}

/// Cooperative cancellation for an in-flight validation session.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl CancelSignal {
    /// A signal plus the sender that trips it (`send(true)`).
    pub fn channel() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx: Some(rx) })
    }

    /// A signal that never fires
    pub fn never() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    async fn cancelled(&mut self) {
        if let Some(rx) = self.rx.as_mut() {
            let fired = rx.wait_for(|cancelled| *cancelled).await.is_ok();
            if fired {
                return;
            }
        }
        // no sender left, so nothing can cancel us
        std::future::pending::<()>().await
    }
}

#[derive(Debug, Clone)]
pub struct RefinerSettings {
    /// Maximum number of correction attempts per session
    pub max_iterations: usize,
    pub trial_row_cap: u64,
    pub trial_timeout: Duration,
    pub corrector_timeout: Duration,
}

impl Default for RefinerSettings {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            trial_row_cap: 5,
            trial_timeout: Duration::from_secs(10),
            corrector_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&RefinementConfig> for RefinerSettings {
    fn from(config: &RefinementConfig) -> Self {
        Self {
            max_iterations: config.max_iterations,
            trial_row_cap: config.trial_row_cap,
            trial_timeout: Duration::from_secs(config.trial_timeout_secs),
            corrector_timeout: Duration::from_secs(config.corrector_timeout_secs),
        }
    }
}

enum Bounded<T> {
    Done(T),
    Failed(AppError),
    TimedOut,
}

enum Verdict {
    Passed { rows: usize },
    Failed(Vec<ValidationIssue>),
}

pub struct SqlRefiner {
    executor: Arc<dyn TrialExecutor>,
    corrector: Option<Arc<dyn Corrector>>,
    dialect: Box<dyn SqlDialect>,
    settings: RefinerSettings,
}

impl SqlRefiner {
    /// The dialect is taken from the executor so local parsing and the
    /// database agree on grammar.
    pub fn new(
        executor: Arc<dyn TrialExecutor>,
        settings: RefinerSettings,
    ) -> Result<Self, AppError> {
        let dialect = dialect_for(executor.dialect())?;
        Ok(Self {
            executor,
            corrector: None,
            dialect,
            settings,
        })
    }

    pub fn with_corrector(mut self, corrector: Arc<dyn Corrector>) -> Self {
        self.corrector = Some(corrector);
        self
    }

    pub fn settings(&self) -> &RefinerSettings {
        &self.settings
    }

    pub fn dialect(&self) -> &dyn SqlDialect {
        self.dialect.as_ref()
    }

    /// Run one validation session.
    ///
    /// Returns the passing statement with its history, or
    /// [`AppError::RefinementExhausted`] carrying the last statement tried
    /// (unvalidated) and every round's issues.
    pub async fn refine(
        &self,
        sql: &str,
        mut cancel: CancelSignal,
    ) -> Result<ValidatedSql, AppError> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let mut attempted = HashSet::from([SqlValidator::normalize(sql)]);
        let mut history: Vec<ValidationIteration> = Vec::new();
        let mut current = sql.trim().to_string();
        let mut corrections = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }

            let mut iteration = ValidationIteration::new(history.len() + 1, current.clone());
            let issues = match self.check(&current, &mut cancel).await? {
                Verdict::Passed { rows } => {
                    history.push(iteration);
                    tracing::info!(
                        "SQL validated after {} round(s) [session {}, {} sample row(s)]",
                        history.len(),
                        session_id,
                        rows
                    );
                    return Ok(ValidatedSql {
                        session_id,
                        sql: current,
                        dialect: self.dialect.name().to_string(),
                        row_sample: rows,
                        history,
                    });
                }
                Verdict::Failed(issues) => issues,
            };

            tracing::debug!(
                "Validation round {} failed with {} issue(s) [session {}]",
                iteration.attempt,
                issues.len(),
                session_id
            );
            iteration.issues = issues;

            let corrector = match &self.corrector {
                Some(corrector) if corrections < self.settings.max_iterations => corrector,
                _ => {
                    history.push(iteration);
                    let reason = RejectionReason::IterationCap;
                    return Err(self.reject(session_id, current, reason, history));
                }
            };
            corrections += 1;

            let request = CorrectionRequest {
                sql: &current,
                dialect: self.dialect.name(),
                issues: &iteration.issues,
                history: &history,
            };
            let proposal = self
                .bounded(&mut cancel, self.settings.corrector_timeout, corrector.propose(request))
                .await?;

            match proposal {
                Bounded::Done(proposed) => {
                    let proposed = proposed.trim().trim_end_matches(';').trim_end().to_string();
                    iteration.proposed_fix = Some(proposed.clone());
                    history.push(iteration);

                    if !attempted.insert(SqlValidator::normalize(&proposed)) {
                        tracing::warn!(
                            "Corrector repeated an earlier statement [session {}]",
                            session_id
                        );
                        let reason = RejectionReason::LoopDetected;
                        return Err(self.reject(session_id, current, reason, history));
                    }
                    current = proposed;
                }
                Bounded::Failed(e) => {
                    tracing::warn!("Correction attempt {} failed: {}", corrections, e);
                    iteration
                        .issues
                        .push(ValidationIssue::new(IssueKind::Correction, e.to_string()));
                    history.push(iteration);
                }
                Bounded::TimedOut => {
                    tracing::warn!(
                        "Correction attempt {} timed out after {:?}",
                        corrections,
                        self.settings.corrector_timeout
                    );
                    iteration.issues.push(ValidationIssue::new(
                        IssueKind::Timeout,
                        format!("corrector timed out after {:?}", self.settings.corrector_timeout),
                    ));
                    history.push(iteration);
                }
            }
        }
    }

    async fn check(&self, sql: &str, cancel: &mut CancelSignal) -> Result<Verdict, AppError> {
        let issues = SqlValidator::static_issues(sql, self.dialect.as_ref());
        if !issues.is_empty() {
            return Ok(Verdict::Failed(issues));
        }

        let timeout = self.settings.trial_timeout;
        match self.bounded(cancel, timeout, self.executor.explain(sql)).await? {
            Bounded::Done(()) => {}
            Bounded::Failed(e) => {
                let issue = ValidationIssue::new(IssueKind::Syntax, e.to_string());
                return Ok(Verdict::Failed(vec![issue]));
            }
            Bounded::TimedOut => {
                return Ok(Verdict::Failed(vec![timeout_issue("EXPLAIN", timeout)]));
            }
        }

        let row_cap = self.settings.trial_row_cap;
        let trial = self.executor.execute_bounded(sql, row_cap);
        match self.bounded(cancel, timeout, trial).await? {
            Bounded::Done(rows) => Ok(Verdict::Passed { rows }),
            Bounded::Failed(e) => {
                let issue = ValidationIssue::new(IssueKind::Runtime, e.to_string());
                Ok(Verdict::Failed(vec![issue]))
            }
            Bounded::TimedOut => {
                Ok(Verdict::Failed(vec![timeout_issue("trial execution", timeout)]))
            }
        }
    }

    /// Await `fut` under a timeout; only cancellation escapes as an error.
    async fn bounded<T>(
        &self,
        cancel: &mut CancelSignal,
        limit: Duration,
        fut: impl Future<Output = Result<T, AppError>>,
    ) -> Result<Bounded<T>, AppError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(AppError::Cancelled),
            res = tokio::time::timeout(limit, fut) => Ok(match res {
                Ok(Ok(value)) => Bounded::Done(value),
                Ok(Err(e)) => Bounded::Failed(e),
                Err(_) => Bounded::TimedOut,
            }),
        }
    }

    fn reject(
        &self,
        session_id: String,
        last_sql: String,
        reason: RejectionReason,
        history: Vec<ValidationIteration>,
    ) -> AppError {
        tracing::warn!(
            "SQL rejected after {} round(s): {} [session {}]",
            history.len(),
            reason,
            session_id
        );
        AppError::RefinementExhausted(Box::new(RefinementFailure {
            session_id,
            last_sql,
            dialect: self.dialect.name().to_string(),
            reason,
            history,
            validated: false,
        }))
    }
}

fn timeout_issue(what: &str, limit: Duration) -> ValidationIssue {
    ValidationIssue::new(IssueKind::Timeout, format!("{} exceeded {:?}", what, limit))
}
