use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::config::PlannerConfig;
use crate::error::{AppError, ErrorDetail};
use crate::graph::{DeprecationAwareScorer, GraphHandle};
use crate::models::{QueryPlan, ResolvedIntent, SchemaMetadata, ValidatedSql};
use crate::services::cache::{self, CacheService, Scope, QUERY_PLAN, SQL_VALIDATION};
use crate::services::plan_builder::QueryPlanBuilder;
use crate::services::sql_generator::SqlGenerator;
use crate::validation::{CancelSignal, SqlRefiner};

/// Outbound result of one compilation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledQuery {
    pub plan: QueryPlan,
    pub sql: String,
    pub dialect: String,
    /// Present when a trial-execution target is configured
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidatedSql>,
    pub plan_cached: bool,
    pub compile_time_ms: u128,
}

impl CompiledQuery {
    /// Whether the statement was exercised against a live database
    pub fn is_validated(&self) -> bool {
        self.validation.is_some()
    }
}

/// Intent → plan → SQL → validation, with plan- and validation-level caching.
pub struct QueryCompiler {
    graph: Arc<GraphHandle>,
    generator: SqlGenerator,
    cache: Arc<dyn CacheService>,
    refiner: Option<SqlRefiner>,
    rank_limit: u64,
    max_path_depth: usize,
    scorer: Option<DeprecationAwareScorer>,
}

impl QueryCompiler {
    /// Fails fast on an unsupported dialect.
    pub fn new(
        graph: Arc<GraphHandle>,
        dialect: &str,
        cache: Arc<dyn CacheService>,
        planner: &PlannerConfig,
    ) -> Result<Self, AppError> {
        Ok(Self {
            graph,
            generator: SqlGenerator::new(dialect)?,
            cache,
            refiner: None,
            rank_limit: planner.default_rank_limit,
            max_path_depth: planner.max_path_depth,
            scorer: planner.avoid_deprecated.then(DeprecationAwareScorer::default),
        })
    }

    /// Validate generated SQL through `refiner` before returning it.
    pub fn with_refiner(mut self, refiner: SqlRefiner) -> Result<Self, AppError> {
        let (ours, theirs) = (self.generator.dialect().name(), refiner.dialect().name());
        if ours != theirs {
            return Err(AppError::Config(format!(
                "trial database speaks {} but SQL is generated for {}",
                theirs, ours
            )));
        }
        self.refiner = Some(refiner);
        Ok(self)
    }

    pub fn dialect(&self) -> &str {
        self.generator.dialect().name()
    }

    /// Rebuild the graph from new metadata and drop everything derived from
    /// the old one. The old graph stays in use if the new one is invalid.
    pub async fn reload_schema(&self, schema: &SchemaMetadata) -> Result<(), AppError> {
        self.graph.rebuild(schema)?;
        self.cache.invalidate(Scope::Category(QUERY_PLAN)).await;
        self.cache.invalidate(Scope::Category(SQL_VALIDATION)).await;
        tracing::info!("Schema reloaded; cached plans and validations dropped");
        Ok(())
    }

    /// Build (or fetch) the plan for an intent.
    ///
    /// Plans are keyed on the graph's schema fingerprint, so a plan built
    /// from one schema is never served for another.
    pub async fn plan(&self, intent: &ResolvedIntent) -> Result<(QueryPlan, bool), AppError> {
        let graph = self.graph.snapshot();
        let intent_key = serde_json::to_string(intent)?;
        let settings_key = format!(
            "{}:{}:{}",
            self.rank_limit,
            self.max_path_depth,
            self.scorer.is_some()
        );
        let key_parts = [graph.fingerprint(), intent_key.as_str(), settings_key.as_str()];

        let store = self.cache.as_ref();
        if let Some(plan) = cache::get_typed::<QueryPlan>(store, QUERY_PLAN, &key_parts).await {
            tracing::debug!("Query plan cache hit for base table {}", plan.base_table);
            return Ok((plan, true));
        }

        let mut builder = QueryPlanBuilder::new(&graph).with_rank_limit(self.rank_limit);
        if let Some(scorer) = &self.scorer {
            builder = builder.with_scorer(scorer, self.max_path_depth);
        }
        let plan = builder.build(intent)?;

        cache::set_typed(store, QUERY_PLAN, &plan, &key_parts).await;
        Ok((plan, false))
    }

    /// Validate a statement, reusing an earlier verdict for the same text.
    /// `None` when no trial-execution target is configured.
    pub async fn validate(
        &self,
        sql: &str,
        cancel: CancelSignal,
    ) -> Result<Option<ValidatedSql>, AppError> {
        let Some(refiner) = &self.refiner else {
            return Ok(None);
        };

        let key_parts = [self.dialect(), sql];
        if let Some(validated) =
            cache::get_typed::<ValidatedSql>(self.cache.as_ref(), SQL_VALIDATION, &key_parts).await
        {
            tracing::debug!("Validation cache hit [session {}]", validated.session_id);
            return Ok(Some(validated));
        }

        let validated = refiner.refine(sql, cancel).await?;
        // rejected statements are never cached
        cache::set_typed(self.cache.as_ref(), SQL_VALIDATION, &validated, &key_parts).await;
        Ok(Some(validated))
    }

    pub async fn compile(
        &self,
        intent: &ResolvedIntent,
        cancel: CancelSignal,
    ) -> Result<CompiledQuery, AppError> {
        let start_time = Instant::now();

        let (plan, plan_cached) = self.plan(intent).await?;
        let generated = self.generator.generate(&plan)?;
        let validation = self.validate(&generated, cancel).await?;

        // the refiner may have replaced the generated statement
        let sql = validation.as_ref().map(|v| v.sql.clone()).unwrap_or(generated);

        let compile_time_ms = start_time.elapsed().as_millis();
        tracing::info!(
            "Compiled {:?} intent over {} table(s) for {} in {}ms (validated: {})",
            intent.intent_type,
            plan.tables().len(),
            self.dialect(),
            compile_time_ms,
            validation.is_some()
        );

        Ok(CompiledQuery {
            plan,
            sql,
            dialect: self.dialect().to_string(),
            validation,
            plan_cached,
            compile_time_ms,
        })
    }

    /// Request boundary: every failure becomes a structured detail naming
    /// the stage that produced it.
    pub async fn handle(
        &self,
        intent: &ResolvedIntent,
        cancel: CancelSignal,
    ) -> Result<CompiledQuery, ErrorDetail> {
        self.compile(intent, cancel).await.map_err(|e| {
            tracing::warn!("Compilation failed at {:?} stage: {}", e.stage(), e);
            e.to_detail()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::error::Stage;
    use crate::graph::KnowledgeGraph;
    use crate::models::{Aggregation, FilterSpec, IntentType, Literal, Operator, ResolvedEntity};
    use crate::services::cache::{CacheManager, MemoryCache};
    use crate::services::database::TrialExecutor;
    use crate::services::dialect::dialect_for;
    use crate::storage::{DiskStore, SharedStore};
    use crate::test_fixtures::{wealth_graph, wealth_schema};
    use crate::validation::{CorrectionRequest, Corrector, RefinerSettings};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct CountingExecutor {
        dialect: &'static str,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl TrialExecutor for CountingExecutor {
        fn dialect(&self) -> &str {
            self.dialect
        }

        async fn explain(&self, _sql: &str) -> Result<(), AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn execute_bounded(&self, _sql: &str, _row_cap: u64) -> Result<usize, AppError> {
            Ok(2)
        }

        async fn test_connection(&self) -> Result<(), AppError> {
            Ok(())
        }
    }

    /// Target where every statement references a missing column
    struct MissingColumnExecutor;

    #[async_trait::async_trait]
    impl TrialExecutor for MissingColumnExecutor {
        fn dialect(&self) -> &str {
            "postgresql"
        }

        async fn explain(&self, _sql: &str) -> Result<(), AppError> {
            Err(AppError::Database(r#"column "zzz_marker" does not exist"#.to_string()))
        }

        async fn execute_bounded(&self, _sql: &str, _row_cap: u64) -> Result<usize, AppError> {
            Ok(0)
        }

        async fn test_connection(&self) -> Result<(), AppError> {
            Ok(())
        }
    }

    /// Proposes a different statement every time
    struct NumberedCorrector {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Corrector for NumberedCorrector {
        async fn propose(&self, _request: CorrectionRequest<'_>) -> Result<String, AppError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("SELECT fund_type FROM funds LIMIT {}", n))
        }
    }

    fn planner() -> PlannerConfig {
        PlannerConfig {
            max_path_depth: 6,
            default_rank_limit: 10,
            avoid_deprecated: false,
        }
    }

    fn compiler(dialect: &str) -> QueryCompiler {
        let graph = Arc::new(GraphHandle::new(wealth_graph()));
        let cache: Arc<dyn CacheService> =
            Arc::new(CacheManager::memory_only(&CacheConfig::default()));
        QueryCompiler::new(graph, dialect, cache, &planner()).unwrap()
    }

    /// Compiler whose lower cache layer lives on disk under `dir`
    async fn disk_backed_compiler(graph: KnowledgeGraph, dir: &Path) -> QueryCompiler {
        let config = CacheConfig::default();
        let disk: Arc<dyn SharedStore> = Arc::new(DiskStore::new(dir).await.unwrap());
        let cache: Arc<dyn CacheService> =
            Arc::new(CacheManager::new(MemoryCache::new(10, 3_600), vec![disk], &config));
        QueryCompiler::new(Arc::new(GraphHandle::new(graph)), "postgresql", cache, &planner())
            .unwrap()
    }

    fn aum_by_type() -> ResolvedIntent {
        ResolvedIntent::new(IntentType::Aggregation)
            .with_entity(ResolvedEntity::column("funds", "fund_type"))
            .with_entity(ResolvedEntity::aggregation("funds", "total_aum", Aggregation::Sum))
            .with_filter(FilterSpec::new(
                "funds",
                "fund_type",
                Operator::In,
                vec![Literal::string("Equity Growth"), Literal::string("Equity Value")],
            ))
    }

    #[tokio::test]
    async fn test_compile_without_database() {
        let compiler = compiler("postgresql");
        let compiled = compiler.compile(&aum_by_type(), CancelSignal::never()).await.unwrap();

        assert_eq!(compiled.dialect, "postgresql");
        assert!(!compiled.is_validated());
        assert!(!compiled.plan_cached);
        assert!(compiled
            .sql
            .contains("WHERE fund_type IN ('Equity Growth','Equity Value') AND is_active = true"));
        assert!(compiled.sql.contains("GROUP BY fund_type"));
    }

    #[tokio::test]
    async fn test_plan_is_cached() {
        let compiler = compiler("postgresql");
        let first = compiler.compile(&aum_by_type(), CancelSignal::never()).await.unwrap();
        let second = compiler.compile(&aum_by_type(), CancelSignal::never()).await.unwrap();
        assert!(!first.plan_cached);
        assert!(second.plan_cached);
        assert_eq!(first.plan, second.plan);
        assert_eq!(first.sql, second.sql);
    }

    #[tokio::test]
    async fn test_validation_is_cached() {
        let executor = Arc::new(CountingExecutor {
            dialect: "postgresql",
            calls: AtomicUsize::new(0),
        });
        let refiner = SqlRefiner::new(executor.clone(), RefinerSettings::default()).unwrap();
        let compiler = compiler("postgresql").with_refiner(refiner).unwrap();

        let compiled = compiler.compile(&aum_by_type(), CancelSignal::never()).await.unwrap();
        let validation = compiled.validation.as_ref().unwrap();
        assert_eq!(validation.row_sample, 2);
        assert_eq!(validation.history.len(), 1);
        assert_eq!(validation.sql, compiled.sql);

        compiler.compile(&aum_by_type(), CancelSignal::never()).await.unwrap();
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refiner_dialect_must_match() {
        let executor = Arc::new(CountingExecutor {
            dialect: "mysql",
            calls: AtomicUsize::new(0),
        });
        let refiner = SqlRefiner::new(executor, RefinerSettings::default()).unwrap();
        assert!(matches!(
            compiler("postgresql").with_refiner(refiner),
            Err(AppError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_unsupported_dialect_fails_fast() {
        let graph = Arc::new(GraphHandle::new(wealth_graph()));
        let cache: Arc<dyn CacheService> = Arc::new(MemoryCache::default());
        let err = QueryCompiler::new(graph, "oracle", cache, &planner()).err().unwrap();
        assert_eq!(err.code(), "UNSUPPORTED_DIALECT");
        assert!(dialect_for("mysql").is_ok());
    }

    #[tokio::test]
    async fn test_structured_failures() {
        let compiler = compiler("mysql");

        let conflicting = ResolvedIntent::new(IntentType::Retrieval)
            .with_entity(ResolvedEntity::column("funds", "fund_name"))
            .with_filter(FilterSpec::eq("funds", "fund_type", "conservative"))
            .with_filter(FilterSpec::eq("funds", "fund_type", "aggressive"));
        let detail = compiler.handle(&conflicting, CancelSignal::never()).await.unwrap_err();
        assert_eq!(detail.code, "CONFLICTING_FILTER");
        assert_eq!(detail.stage, Stage::Plan);

        let unknown = ResolvedIntent::new(IntentType::Retrieval)
            .with_entity(ResolvedEntity::column("funds", "aum"));
        let detail = compiler.handle(&unknown, CancelSignal::never()).await.unwrap_err();
        assert_eq!(detail.code, "SCHEMA_MISMATCH");
        assert!(detail.message.contains("funds.aum"));
    }

    #[tokio::test]
    async fn test_reload_schema_drops_cached_plans() {
        let compiler = compiler("postgresql");
        compiler.compile(&aum_by_type(), CancelSignal::never()).await.unwrap();

        compiler.reload_schema(&wealth_schema()).await.unwrap();
        let compiled = compiler.compile(&aum_by_type(), CancelSignal::never()).await.unwrap();
        assert!(!compiled.plan_cached);
    }

    #[tokio::test]
    async fn test_persisted_plans_are_scoped_to_their_schema() {
        let dir = tempdir().unwrap();

        let first = disk_backed_compiler(wealth_graph(), dir.path()).await;
        let compiled = first.compile(&aum_by_type(), CancelSignal::never()).await.unwrap();
        assert!(compiled.sql.contains("is_active = true"));

        // a later process over the same cache directory, without the default filter
        let mut schema = wealth_schema();
        for table in &mut schema.tables {
            for column in &mut table.columns {
                column.default_filter = None;
            }
        }
        let graph = KnowledgeGraph::from_schema(&schema).unwrap();
        let second = disk_backed_compiler(graph, dir.path()).await;
        let compiled = second.compile(&aum_by_type(), CancelSignal::never()).await.unwrap();
        assert!(!compiled.plan_cached);
        assert!(!compiled.sql.contains("is_active"));

        // the original schema still finds its own plan
        let third = disk_backed_compiler(wealth_graph(), dir.path()).await;
        let compiled = third.compile(&aum_by_type(), CancelSignal::never()).await.unwrap();
        assert!(compiled.plan_cached);
        assert!(compiled.sql.contains("is_active = true"));
    }

    #[tokio::test]
    async fn test_rejection_detail_carries_every_round() {
        let corrector = Arc::new(NumberedCorrector {
            calls: AtomicUsize::new(0),
        });
        let refiner = SqlRefiner::new(Arc::new(MissingColumnExecutor), RefinerSettings::default())
            .unwrap()
            .with_corrector(corrector);
        let compiler = compiler("postgresql").with_refiner(refiner).unwrap();

        let detail = compiler.handle(&aum_by_type(), CancelSignal::never()).await.unwrap_err();
        assert_eq!(detail.code, "REFINEMENT_EXHAUSTED");
        assert_eq!(detail.stage, Stage::Validate);

        // generated statement plus one round per correction
        let max_iterations = RefinerSettings::default().max_iterations;
        assert_eq!(detail.history.len(), max_iterations + 1);
        assert!(detail.history.iter().all(|round| !round.issues.is_empty()));
        assert!(detail.history[0].issues[0].message.contains("zzz_marker"));
        assert_eq!(
            detail.last_sql.as_deref(),
            Some(format!("SELECT fund_type FROM funds LIMIT {}", max_iterations).as_str())
        );

        let body = serde_json::to_string(&detail).unwrap();
        assert!(body.contains("zzz_marker"));
        assert!(body.contains("last_sql"));
    }
}
