// Query Plan Builder
//
// Turns a resolved intent into a dialect-neutral QueryPlan: picks the base
// table, discovers joins through the knowledge graph, normalises filters,
// injects schema default filters and derives GROUP BY / ORDER BY / LIMIT.
// Stateless apart from the borrowed graph snapshot.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::error::AppError;
use crate::graph::{join_path_sql, JoinPath, KnowledgeGraph, PathScorer};
use crate::models::{
    Aggregation, ColumnRef, EntityRef, Filter, FilterOrigin, FilterSpec, IntentType, JoinClause,
    Literal, Operator, OrderBy, QueryPlan, ResolvedIntent, SelectColumn, SortDirection,
};

pub const DEFAULT_RANK_LIMIT: u64 = 10;
pub const DEFAULT_MAX_PATH_DEPTH: usize = 6;

pub struct QueryPlanBuilder<'g> {
    graph: &'g KnowledgeGraph,
    default_rank_limit: u64,
    max_path_depth: usize,
    scorer: Option<&'g dyn PathScorer>,
}

/// A projected column before aliasing.
struct Projection {
    column: ColumnRef,
    aggregation: Option<Aggregation>,
    alias: Option<String>,
}

impl<'g> QueryPlanBuilder<'g> {
    pub fn new(graph: &'g KnowledgeGraph) -> Self {
        Self {
            graph,
            default_rank_limit: DEFAULT_RANK_LIMIT,
            max_path_depth: DEFAULT_MAX_PATH_DEPTH,
            scorer: None,
        }
    }

    pub fn with_rank_limit(mut self, limit: u64) -> Self {
        self.default_rank_limit = limit;
        self
    }

    /// Choose joins among all paths up to `max_depth` hops by the scorer's
    /// cost instead of taking the plain shortest path.
    pub fn with_scorer(mut self, scorer: &'g dyn PathScorer, max_depth: usize) -> Self {
        self.scorer = Some(scorer);
        self.max_path_depth = max_depth;
        self
    }

    pub fn build(&self, intent: &ResolvedIntent) -> Result<QueryPlan, AppError> {
        self.check_references(intent)?;

        let projections = collect_projections(intent);
        let user_filters = normalize_filters(collect_filter_specs(intent))?;
        check_conflicts(&user_filters)?;

        let base_table = self.choose_base_table(intent, &projections, &user_filters)?;

        let mut required: BTreeSet<&str> = BTreeSet::new();
        for entity in &intent.entities {
            required.insert(entity.entity.table());
        }
        for filter in &user_filters {
            required.insert(&filter.column.table);
        }
        for hint in &intent.order_by {
            required.insert(&hint.table);
        }
        required.remove(base_table.as_str());

        let joins = self.join_tree(&base_table, &required)?;

        let select = assign_aliases(projections);
        let mut filters = user_filters;
        let defaults = self.default_filters(&base_table, &joins, &filters);
        filters.extend(defaults);

        let group_by = if select.iter().any(|c| c.is_aggregated()) {
            let mut seen = HashSet::new();
            select
                .iter()
                .filter(|c| !c.is_aggregated())
                .filter(|c| seen.insert(c.column.clone()))
                .map(|c| c.column.clone())
                .collect()
        } else {
            Vec::new()
        };

        let (order_by, limit) = self.ordering(intent, &select);

        let plan = QueryPlan {
            base_table,
            joins,
            select,
            filters,
            group_by,
            order_by,
            limit,
        };

        tracing::info!(
            "Built query plan: base={}, joins={}, filters={} ({} default), group_by={}",
            plan.base_table,
            plan.joins.len(),
            plan.filters.len(),
            plan.default_filters().count(),
            plan.group_by.len()
        );

        Ok(plan)
    }

    /// Every table and column named by the intent must exist.
    fn check_references(&self, intent: &ResolvedIntent) -> Result<(), AppError> {
        let mut refs: Vec<(&str, Option<&str>)> = Vec::new();
        for entity in &intent.entities {
            let column = match &entity.entity {
                EntityRef::Aggregation {
                    column,
                    function: Aggregation::Count,
                    ..
                } if column == "*" => None,
                other => other.column(),
            };
            refs.push((entity.entity.table(), column));
        }
        for filter in &intent.filters {
            refs.push((&filter.table, Some(&filter.column)));
        }
        for hint in &intent.order_by {
            refs.push((&hint.table, Some(&hint.column)));
        }

        for (table, column) in refs {
            if !self.graph.has_table(table) {
                return Err(AppError::unknown_table(table));
            }
            if let Some(column) = column {
                if !self.graph.has_column(table, column) {
                    return Err(AppError::unknown_column(table, column));
                }
            }
        }
        Ok(())
    }

    /// Table owning most requested columns, then most filters, then alphabetical.
    fn choose_base_table(
        &self,
        intent: &ResolvedIntent,
        projections: &[Projection],
        filters: &[Filter],
    ) -> Result<String, AppError> {
        let mut filter_counts: HashMap<&str, usize> = HashMap::new();
        for filter in filters {
            *filter_counts.entry(&filter.column.table).or_default() += 1;
        }

        if !projections.is_empty() {
            let mut column_counts: HashMap<&str, usize> = HashMap::new();
            for p in projections {
                *column_counts.entry(&p.column.table).or_default() += 1;
            }

            let mut candidates: Vec<(&str, usize)> = column_counts.into_iter().collect();
            candidates.sort_by(|(a, a_count), (b, b_count)| {
                b_count
                    .cmp(a_count)
                    .then_with(|| {
                        let (a_filters, b_filters) = (
                            filter_counts.get(a).unwrap_or(&0),
                            filter_counts.get(b).unwrap_or(&0),
                        );
                        b_filters.cmp(a_filters)
                    })
                    .then_with(|| a.cmp(b))
            });
            return candidates
                .first()
                .map(|(table, _)| table.to_string())
                .ok_or_else(|| AppError::AmbiguousBaseTable("no columns requested".to_string()));
        }

        // No projected columns: the uniquely most-filtered referenced table.
        let mut referenced: BTreeSet<&str> =
            intent.entities.iter().map(|e| e.entity.table()).collect();
        referenced.extend(filters.iter().map(|f| f.column.table.as_str()));

        let mut ranked: Vec<(&str, usize)> = referenced
            .into_iter()
            .map(|t| (t, filter_counts.get(t).copied().unwrap_or(0)))
            .collect();
        ranked.sort_by(|(a, a_count), (b, b_count)| b_count.cmp(a_count).then_with(|| a.cmp(b)));

        match ranked.as_slice() {
            [] => Err(AppError::AmbiguousBaseTable("the intent references no tables".to_string())),
            [(only, _)] => Ok(only.to_string()),
            [(first, first_count), (second, second_count), ..] => {
                if first_count > second_count {
                    Ok(first.to_string())
                } else {
                    let tied: Vec<&str> = ranked
                        .iter()
                        .filter(|(_, count)| count == first_count)
                        .map(|(t, _)| *t)
                        .collect();
                    tracing::warn!("Base table tie between {} and {}", first, second);
                    Err(AppError::AmbiguousBaseTable(format!(
                        "no columns requested and tables [{}] are equally referenced",
                        tied.join(", ")
                    )))
                }
            }
        }
    }

    fn find_path(&self, base: &str, table: &str) -> Result<Option<JoinPath>, AppError> {
        match self.scorer {
            None => self.graph.shortest_path(base, table),
            Some(scorer) => {
                let paths = self.graph.all_paths(base, table, self.max_path_depth)?;
                Ok(self.graph.rank_paths(paths, scorer).into_iter().next())
            }
        }
    }

    /// Union of the paths from the base table to every required table, each
    /// joined table appearing once.
    fn join_tree(
        &self,
        base: &str,
        required: &BTreeSet<&str>,
    ) -> Result<Vec<JoinClause>, AppError> {
        let mut joined: HashSet<String> = HashSet::new();
        joined.insert(base.to_string());
        let mut joins = Vec::new();

        for table in required {
            let path = self.find_path(base, table)?.ok_or_else(|| AppError::UnreachableTable {
                base: base.to_string(),
                table: table.to_string(),
            })?;
            tracing::debug!("Join path {} -> {}: {}", base, table, path.tables().join(" -> "));

            for clause in join_path_sql(&path) {
                if joined.insert(clause.table.clone()) {
                    joins.push(clause);
                }
            }
        }

        Ok(joins)
    }

    /// Schema default filters for every table in the plan, unless the user
    /// already filters that exact column.
    fn default_filters(
        &self,
        base: &str,
        joins: &[JoinClause],
        user_filters: &[Filter],
    ) -> Vec<Filter> {
        let mut tables: Vec<&str> = joins.iter().map(|j| j.table.as_str()).collect();
        tables.sort();
        tables.insert(0, base);

        let mut injected = Vec::new();
        for table in tables {
            for (column, default) in self.graph.default_filters(table) {
                if user_filters.iter().any(|f| f.targets(table, column)) {
                    tracing::debug!(
                        "Default filter on {}.{} suppressed by user filter",
                        table,
                        column
                    );
                    continue;
                }
                injected.push(Filter {
                    column: ColumnRef::new(table, column),
                    operator: default.operator,
                    values: vec![default.value.clone()],
                    origin: FilterOrigin::Default,
                });
            }
        }
        injected
    }

    fn ordering(
        &self,
        intent: &ResolvedIntent,
        select: &[SelectColumn],
    ) -> (Vec<OrderBy>, Option<u64>) {
        let mut order_by: Vec<OrderBy> = intent
            .order_by
            .iter()
            .map(|hint| OrderBy {
                column: ColumnRef::new(&hint.table, &hint.column),
                aggregation: hint.aggregation,
                direction: hint.direction,
            })
            .collect();

        let mut limit = intent.limit;

        if intent.intent_type == IntentType::Ranking {
            if order_by.is_empty() {
                let primary = select.iter().find(|c| c.is_aggregated()).or_else(|| select.first());
                if let Some(primary) = primary {
                    order_by.push(OrderBy {
                        column: primary.column.clone(),
                        aggregation: primary.aggregation,
                        direction: SortDirection::Desc,
                    });
                }
            }
            limit = limit.or(Some(self.default_rank_limit));
        }

        (order_by, limit)
    }
}

fn collect_projections(intent: &ResolvedIntent) -> Vec<Projection> {
    let mut projections: Vec<Projection> = Vec::new();
    for entity in &intent.entities {
        let projection = match &entity.entity {
            EntityRef::Column {
                table,
                column,
                alias,
                date_part,
            } => Projection {
                column: ColumnRef {
                    table: table.clone(),
                    column: column.clone(),
                    date_part: *date_part,
                },
                aggregation: None,
                alias: alias.clone(),
            },
            EntityRef::Aggregation {
                table,
                column,
                function,
                alias,
            } => Projection {
                column: ColumnRef::new(table, column),
                aggregation: Some(*function),
                alias: alias.clone(),
            },
            EntityRef::Table { .. } | EntityRef::Value { .. } => continue,
        };

        let duplicate = projections
            .iter()
            .any(|p| p.column == projection.column && p.aggregation == projection.aggregation);
        if !duplicate {
            projections.push(projection);
        }
    }
    projections
}

/// Explicit filters followed by value entities as equality filters.
fn collect_filter_specs(intent: &ResolvedIntent) -> Vec<FilterSpec> {
    let mut specs = intent.filters.clone();
    for entity in &intent.entities {
        if let EntityRef::Value { table, column, value } = &entity.entity {
            specs.push(FilterSpec::eq(table, column, value.clone()));
        }
    }
    specs
}

/// Check operator arity, fold multi-value `=`/`!=` into `IN`/`NOT IN` and
/// collapse exact duplicates.
fn normalize_filters(specs: Vec<FilterSpec>) -> Result<Vec<Filter>, AppError> {
    let mut filters: Vec<Filter> = Vec::with_capacity(specs.len());

    for spec in specs {
        let mut values: Vec<Literal> = Vec::with_capacity(spec.values.len());
        for value in spec.values {
            if !values.contains(&value) {
                values.push(value);
            }
        }

        let operator = match (spec.operator, values.len()) {
            (Operator::Eq, n) if n > 1 => Operator::In,
            (Operator::NotEq, n) if n > 1 => Operator::NotIn,
            (op, _) => op,
        };

        let arity_ok = match operator {
            Operator::In | Operator::NotIn => !values.is_empty(),
            Operator::Between => values.len() == 2,
            _ => values.len() == 1,
        };
        if !arity_ok {
            return Err(AppError::InvalidFilter(format!(
                "{} on {}.{} cannot take {} value(s)",
                operator,
                spec.table,
                spec.column,
                values.len()
            )));
        }

        let filter = Filter {
            column: ColumnRef {
                table: spec.table,
                column: spec.column,
                date_part: spec.date_part,
            },
            operator,
            values,
            origin: FilterOrigin::User,
        };

        if !filters.contains(&filter) {
            filters.push(filter);
        }
    }

    Ok(filters)
}

/// Two single-value equalities on one column can never both hold.
fn check_conflicts(filters: &[Filter]) -> Result<(), AppError> {
    let mut seen: HashMap<&ColumnRef, &Literal> = HashMap::new();
    for filter in filters.iter().filter(|f| f.operator == Operator::Eq && f.values.len() == 1) {
        let value = &filter.values[0];
        match seen.get(&filter.column) {
            Some(existing) if *existing != value => {
                return Err(AppError::ConflictingFilter {
                    table: filter.column.table.clone(),
                    column: filter.column.column.clone(),
                    values: vec![existing.canonical(), value.canonical()],
                });
            }
            Some(_) => {}
            None => {
                seen.insert(&filter.column, value);
            }
        }
    }
    Ok(())
}

fn default_alias(p: &Projection) -> String {
    let column = if p.column.column == "*" {
        "all"
    } else {
        p.column.column.as_str()
    };
    let base = match p.column.date_part {
        Some(part) => format!("{}_{}", column, part.keyword().to_lowercase()),
        None => column.to_string(),
    };
    match p.aggregation {
        Some(agg) => format!("{}_{}", agg.as_sql().to_lowercase(), base),
        None => base,
    }
}

/// Aliases default to the column name; collisions get the table as prefix,
/// then a numeric suffix.
fn assign_aliases(projections: Vec<Projection>) -> Vec<SelectColumn> {
    let mut used: HashSet<String> = HashSet::new();
    let mut select = Vec::with_capacity(projections.len());

    for p in projections {
        let preferred = p.alias.clone().unwrap_or_else(|| default_alias(&p));
        let mut alias = preferred.clone();
        if used.contains(&alias) {
            alias = format!("{}_{}", p.column.table, preferred);
        }
        let mut n = 2;
        while used.contains(&alias) {
            alias = format!("{}_{}_{}", p.column.table, preferred, n);
            n += 1;
        }
        used.insert(alias.clone());

        select.push(SelectColumn {
            column: p.column,
            aggregation: p.aggregation,
            alias,
        });
    }

    select
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{DeprecationAwareScorer, Edge, Node, NodeMetadata, RelationshipKind};
    use crate::models::{DatePart, JoinType, OrderHint, ResolvedEntity};
    use crate::services::sql_generator::SqlGenerator;
    use crate::test_fixtures::wealth_graph;

    fn aum_by_type() -> ResolvedIntent {
        ResolvedIntent::new(IntentType::Aggregation)
            .with_entity(ResolvedEntity::aggregation("funds", "total_aum", Aggregation::Sum))
            .with_filter(FilterSpec::new(
                "funds",
                "fund_type",
                Operator::In,
                vec![Literal::string("Equity Growth"), Literal::string("Equity Value")],
            ))
    }

    #[test]
    fn test_membership_filter_and_default_filter() {
        let graph = wealth_graph();
        let plan = QueryPlanBuilder::new(&graph).build(&aum_by_type()).unwrap();

        assert_eq!(plan.base_table, "funds");
        assert!(plan.joins.is_empty());
        assert_eq!(plan.filters.len(), 2);
        assert_eq!(plan.filters[0].operator, Operator::In);
        assert_eq!(plan.filters[1].origin, FilterOrigin::Default);
        assert!(plan.group_by.is_empty());

        let sql = SqlGenerator::new("postgresql").unwrap().generate(&plan).unwrap();
        assert!(sql.contains("WHERE fund_type IN ('Equity Growth','Equity Value') AND is_active = true"));
        assert_eq!(sql.matches("fund_type").count(), 1);
    }

    #[test]
    fn test_conflicting_equality_filters() {
        let graph = wealth_graph();
        let intent = ResolvedIntent::new(IntentType::Retrieval)
            .with_entity(ResolvedEntity::column("funds", "fund_name"))
            .with_filter(FilterSpec::eq("funds", "fund_type", "conservative"))
            .with_filter(FilterSpec::eq("funds", "fund_type", "aggressive"));

        let err = QueryPlanBuilder::new(&graph).build(&intent).unwrap_err();
        match err {
            AppError::ConflictingFilter { table, column, values } => {
                assert_eq!(table, "funds");
                assert_eq!(column, "fund_type");
                assert_eq!(values, vec!["'conservative'", "'aggressive'"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_value_entity_conflicts_with_filter() {
        let graph = wealth_graph();
        let intent = ResolvedIntent::new(IntentType::Retrieval)
            .with_entity(ResolvedEntity::column("funds", "fund_name"))
            .with_entity(ResolvedEntity::value("funds", "fund_type", "Balanced"))
            .with_filter(FilterSpec::eq("funds", "fund_type", "Income"));
        assert!(matches!(
            QueryPlanBuilder::new(&graph).build(&intent),
            Err(AppError::ConflictingFilter { .. })
        ));
    }

    #[test]
    fn test_duplicate_equalities_collapse() {
        let graph = wealth_graph();
        let intent = ResolvedIntent::new(IntentType::Retrieval)
            .with_entity(ResolvedEntity::column("funds", "fund_name"))
            .with_entity(ResolvedEntity::value("funds", "fund_type", "Balanced"))
            .with_filter(FilterSpec::eq("funds", "fund_type", "Balanced"));
        let plan = QueryPlanBuilder::new(&graph).build(&intent).unwrap();
        assert_eq!(plan.user_filters().count(), 1);
    }

    #[test]
    fn test_multi_value_equality_becomes_in() {
        let graph = wealth_graph();
        let intent = ResolvedIntent::new(IntentType::Retrieval)
            .with_entity(ResolvedEntity::column("funds", "fund_name"))
            .with_filter(FilterSpec::new(
                "funds",
                "fund_type",
                Operator::Eq,
                vec![Literal::string("A"), Literal::string("B"), Literal::string("A")],
            ));
        let plan = QueryPlanBuilder::new(&graph).build(&intent).unwrap();
        let filter = plan.user_filters().next().unwrap();
        assert_eq!(filter.operator, Operator::In);
        assert_eq!(filter.values.len(), 2);
    }

    #[test]
    fn test_filter_arity_checked() {
        let graph = wealth_graph();
        let intent = ResolvedIntent::new(IntentType::Retrieval)
            .with_entity(ResolvedEntity::column("funds", "fund_name"))
            .with_filter(FilterSpec::new(
                "funds",
                "total_aum",
                Operator::Between,
                vec![Literal::Integer(1)],
            ));
        assert!(matches!(
            QueryPlanBuilder::new(&graph).build(&intent),
            Err(AppError::InvalidFilter(_))
        ));
    }

    #[test]
    fn test_user_filter_suppresses_default() {
        let graph = wealth_graph();
        let intent = ResolvedIntent::new(IntentType::Retrieval)
            .with_entity(ResolvedEntity::column("funds", "fund_name"))
            .with_filter(FilterSpec::eq("funds", "is_active", false));
        let plan = QueryPlanBuilder::new(&graph).build(&intent).unwrap();

        assert_eq!(plan.default_filters().count(), 0);
        let on_is_active: Vec<_> =
            plan.filters.iter().filter(|f| f.targets("funds", "is_active")).collect();
        assert_eq!(on_is_active.len(), 1);
        assert_eq!(on_is_active[0].values, vec![Literal::Boolean(false)]);
    }

    #[test]
    fn test_joins_and_group_by() {
        let graph = wealth_graph();
        let intent = ResolvedIntent::new(IntentType::Aggregation)
            .with_entity(ResolvedEntity::column("clients", "client_name"))
            .with_entity(ResolvedEntity::column("clients", "region"))
            .with_entity(ResolvedEntity::aggregation("holdings", "market_value", Aggregation::Sum))
            .with_filter(FilterSpec::eq("funds", "fund_type", "Equity Growth"));

        let plan = QueryPlanBuilder::new(&graph).build(&intent).unwrap();
        assert_eq!(plan.base_table, "clients");
        assert_eq!(plan.tables(), vec!["clients", "accounts", "holdings", "funds"]);
        assert!(plan.joins.iter().take(2).all(|j| j.join_type == JoinType::Left));
        assert_eq!(plan.joins[2].join_type, JoinType::Inner);

        // auto-filter from a joined table
        assert_eq!(plan.default_filters().count(), 1);
        assert!(plan.default_filters().all(|f| f.targets("funds", "is_active")));

        let non_aggregated: Vec<&ColumnRef> =
            plan.select.iter().filter(|c| !c.is_aggregated()).map(|c| &c.column).collect();
        assert_eq!(plan.group_by.iter().collect::<Vec<_>>(), non_aggregated);
    }

    #[test]
    fn test_shared_hops_joined_once() {
        let graph = wealth_graph();
        let intent = ResolvedIntent::new(IntentType::Retrieval)
            .with_entity(ResolvedEntity::column("clients", "client_name"))
            .with_entity(ResolvedEntity::column("clients", "segment"))
            .with_entity(ResolvedEntity::column("funds", "fund_name"))
            .with_entity(ResolvedEntity::column("holdings", "market_value"));

        let plan = QueryPlanBuilder::new(&graph).build(&intent).unwrap();
        let joined: Vec<&str> = plan.joins.iter().map(|j| j.table.as_str()).collect();
        assert_eq!(joined, vec!["accounts", "holdings", "funds"]);
    }

    #[test]
    fn test_base_table_tie_broken_by_filters_then_name() {
        let graph = wealth_graph();
        let intent = ResolvedIntent::new(IntentType::Retrieval)
            .with_entity(ResolvedEntity::column("clients", "client_name"))
            .with_entity(ResolvedEntity::column("funds", "fund_name"));
        let plan = QueryPlanBuilder::new(&graph).build(&intent).unwrap();
        assert_eq!(plan.base_table, "clients");

        let intent = intent.with_filter(FilterSpec::eq("funds", "fund_type", "Income"));
        let plan = QueryPlanBuilder::new(&graph).build(&intent).unwrap();
        assert_eq!(plan.base_table, "funds");
    }

    #[test]
    fn test_no_columns_uses_most_filtered_table() {
        let graph = wealth_graph();
        let intent = ResolvedIntent::new(IntentType::Retrieval)
            .with_entity(ResolvedEntity::table("clients"))
            .with_filter(FilterSpec::eq("funds", "fund_type", "Income"));
        let plan = QueryPlanBuilder::new(&graph).build(&intent).unwrap();
        assert_eq!(plan.base_table, "funds");
        assert!(plan.select.is_empty());
    }

    #[test]
    fn test_ambiguous_base_table() {
        let graph = wealth_graph();
        let intent = ResolvedIntent::new(IntentType::Retrieval)
            .with_entity(ResolvedEntity::table("clients"))
            .with_entity(ResolvedEntity::table("funds"));
        assert!(matches!(
            QueryPlanBuilder::new(&graph).build(&intent),
            Err(AppError::AmbiguousBaseTable(_))
        ));
        assert!(matches!(
            QueryPlanBuilder::new(&graph).build(&ResolvedIntent::default()),
            Err(AppError::AmbiguousBaseTable(_))
        ));
    }

    #[test]
    fn test_unreachable_table() {
        let mut graph = wealth_graph();
        graph.add_node(Node::table("audit_log")).unwrap();
        graph.add_node(Node::column("audit_log", "event", "varchar")).unwrap();

        let intent = ResolvedIntent::new(IntentType::Retrieval)
            .with_entity(ResolvedEntity::column("clients", "client_name"))
            .with_entity(ResolvedEntity::column("clients", "region"))
            .with_entity(ResolvedEntity::column("audit_log", "event"));

        match QueryPlanBuilder::new(&graph).build(&intent).unwrap_err() {
            AppError::UnreachableTable { base, table } => {
                assert_eq!(base, "clients");
                assert_eq!(table, "audit_log");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_column_is_schema_mismatch() {
        let graph = wealth_graph();
        let intent = ResolvedIntent::new(IntentType::Retrieval)
            .with_entity(ResolvedEntity::column("funds", "aum"));
        let err = QueryPlanBuilder::new(&graph).build(&intent).unwrap_err();
        assert!(matches!(err, AppError::SchemaMismatch { column: Some(ref c), .. } if c == "aum"));

        let intent = ResolvedIntent::new(IntentType::Retrieval)
            .with_filter(FilterSpec::eq("fundz", "x", 1i64));
        assert!(matches!(
            QueryPlanBuilder::new(&graph).build(&intent),
            Err(AppError::SchemaMismatch { column: None, .. })
        ));
    }

    #[test]
    fn test_ranking_defaults() {
        let graph = wealth_graph();
        let intent = ResolvedIntent::new(IntentType::Ranking)
            .with_entity(ResolvedEntity::column("funds", "fund_name"))
            .with_entity(ResolvedEntity::aggregation("holdings", "market_value", Aggregation::Sum));

        let plan = QueryPlanBuilder::new(&graph).build(&intent).unwrap();
        assert_eq!(plan.limit, Some(DEFAULT_RANK_LIMIT));
        assert_eq!(plan.order_by.len(), 1);
        assert_eq!(plan.order_by[0].aggregation, Some(Aggregation::Sum));
        assert_eq!(plan.order_by[0].direction, SortDirection::Desc);

        let plan = QueryPlanBuilder::new(&graph)
            .with_rank_limit(3)
            .build(&intent.clone().with_limit(5))
            .unwrap();
        assert_eq!(plan.limit, Some(5));
    }

    #[test]
    fn test_retrieval_leaves_order_and_limit_empty() {
        let graph = wealth_graph();
        let intent = ResolvedIntent::new(IntentType::Retrieval)
            .with_entity(ResolvedEntity::column("funds", "fund_name"));
        let plan = QueryPlanBuilder::new(&graph).build(&intent).unwrap();
        assert!(plan.order_by.is_empty());
        assert!(plan.limit.is_none());

        let intent = intent.with_order(OrderHint {
            table: "funds".to_string(),
            column: "fund_name".to_string(),
            aggregation: None,
            direction: SortDirection::Asc,
        });
        let plan = QueryPlanBuilder::new(&graph).build(&intent).unwrap();
        assert_eq!(plan.order_by.len(), 1);
    }

    #[test]
    fn test_alias_disambiguation() {
        let graph = wealth_graph();
        let intent = ResolvedIntent::new(IntentType::Retrieval)
            .with_entity(ResolvedEntity::column("holdings", "fund_id"))
            .with_entity(ResolvedEntity::column("funds", "fund_id"))
            .with_entity(ResolvedEntity::new(EntityRef::Column {
                table: "funds".to_string(),
                column: "launch_date".to_string(),
                alias: None,
                date_part: Some(DatePart::Quarter),
            }));

        let plan = QueryPlanBuilder::new(&graph).build(&intent).unwrap();
        let aliases: Vec<&str> = plan.select.iter().map(|c| c.alias.as_str()).collect();
        assert_eq!(aliases, vec!["fund_id", "funds_fund_id", "launch_date_quarter"]);
    }

    #[test]
    fn test_count_star() {
        let graph = wealth_graph();
        let intent = ResolvedIntent::new(IntentType::Aggregation)
            .with_entity(ResolvedEntity::column("funds", "fund_type"))
            .with_entity(ResolvedEntity::aggregation("funds", "*", Aggregation::Count));
        let plan = QueryPlanBuilder::new(&graph).build(&intent).unwrap();
        let sql = SqlGenerator::new("postgresql").unwrap().generate(&plan).unwrap();
        assert!(sql.starts_with("SELECT fund_type AS fund_type, COUNT(*) AS count_all FROM funds"));
        assert!(sql.ends_with("GROUP BY fund_type"));
    }

    #[test]
    fn test_scorer_avoids_deprecated_route() {
        let mut graph = wealth_graph();
        graph
            .add_node(Node::table("fund_links").with_metadata(NodeMetadata {
                deprecated: true,
                ..Default::default()
            }))
            .unwrap();
        graph.add_node(Node::column("fund_links", "client_id", "integer")).unwrap();
        graph.add_node(Node::column("fund_links", "fund_id", "integer")).unwrap();
        graph
            .add_edge(Edge::new(
                "fund_links",
                "client_id",
                "clients",
                "client_id",
                RelationshipKind::ManyToOne,
            ))
            .unwrap();
        graph
            .add_edge(Edge::new(
                "fund_links",
                "fund_id",
                "funds",
                "fund_id",
                RelationshipKind::ManyToOne,
            ))
            .unwrap();

        let intent = ResolvedIntent::new(IntentType::Retrieval)
            .with_entity(ResolvedEntity::column("clients", "client_name"))
            .with_entity(ResolvedEntity::column("clients", "region"))
            .with_entity(ResolvedEntity::column("funds", "fund_name"));

        let plan = QueryPlanBuilder::new(&graph).build(&intent).unwrap();
        assert_eq!(plan.tables(), vec!["clients", "fund_links", "funds"]);

        let scorer = DeprecationAwareScorer::default();
        let plan = QueryPlanBuilder::new(&graph).with_scorer(&scorer, 4).build(&intent).unwrap();
        assert_eq!(plan.tables(), vec!["clients", "accounts", "holdings", "funds"]);
    }
}
