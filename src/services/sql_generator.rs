// SQL Generator
//
// Renders a QueryPlan into one SQL statement for a target dialect. Clause
// order is fixed: SELECT, FROM, JOINs in plan order, WHERE, GROUP BY,
// ORDER BY, LIMIT. Column references are qualified with their table as soon
// as the plan joins more than one table.

use crate::error::AppError;
use crate::models::{ColumnRef, Filter, Literal, Operator, OrderBy, QueryPlan, SelectColumn};
use crate::services::dialect::{dialect_for, SqlDialect};

#[derive(Debug)]
pub struct SqlGenerator {
    dialect: Box<dyn SqlDialect>,
}

impl SqlGenerator {
    /// Fails with `UnsupportedDialect` for unknown dialect names.
    pub fn new(dialect_name: &str) -> Result<Self, AppError> {
        Ok(Self {
            dialect: dialect_for(dialect_name)?,
        })
    }

    pub fn with_dialect(dialect: Box<dyn SqlDialect>) -> Self {
        Self { dialect }
    }

    pub fn dialect(&self) -> &dyn SqlDialect {
        self.dialect.as_ref()
    }

    pub fn generate(&self, plan: &QueryPlan) -> Result<String, AppError> {
        let ctx = RenderContext {
            dialect: self.dialect.as_ref(),
            qualify: !plan.joins.is_empty(),
        };

        let mut clauses = Vec::with_capacity(7);

        let projection = if plan.select.is_empty() {
            format!("{}.*", ctx.ident(&plan.base_table))
        } else {
            plan.select
                .iter()
                .map(|c| ctx.select_column(c))
                .collect::<Vec<_>>()
                .join(", ")
        };
        clauses.push(format!("SELECT {}", projection));
        clauses.push(format!("FROM {}", ctx.ident(&plan.base_table)));

        for join in &plan.joins {
            clauses.push(format!(
                "{} {} ON {}.{} = {}.{}",
                join.join_type.as_sql(),
                ctx.ident(&join.table),
                ctx.ident(&join.from_table),
                ctx.ident(&join.from_column),
                ctx.ident(&join.table),
                ctx.ident(&join.to_column)
            ));
        }

        if !plan.filters.is_empty() {
            let predicates = plan
                .filters
                .iter()
                .map(|f| ctx.filter(f))
                .collect::<Result<Vec<_>, _>>()?;
            clauses.push(format!("WHERE {}", predicates.join(" AND ")));
        }

        if !plan.group_by.is_empty() {
            let columns: Vec<String> = plan.group_by.iter().map(|c| ctx.column(c)).collect();
            clauses.push(format!("GROUP BY {}", columns.join(", ")));
        }

        if !plan.order_by.is_empty() {
            let columns: Vec<String> = plan.order_by.iter().map(|o| ctx.order_by(o)).collect();
            clauses.push(format!("ORDER BY {}", columns.join(", ")));
        }

        if let Some(limit) = plan.limit {
            clauses.push(format!("LIMIT {}", limit));
        }

        let sql = clauses.join(" ");
        tracing::debug!("Generated {} SQL: {}", self.dialect.name(), sql);
        Ok(sql)
    }
}

struct RenderContext<'a> {
    dialect: &'a dyn SqlDialect,
    qualify: bool,
}

impl RenderContext<'_> {
    fn ident(&self, name: &str) -> String {
        self.dialect.identifier(name)
    }

    fn column(&self, col: &ColumnRef) -> String {
        if col.column == "*" {
            return "*".to_string();
        }
        let base = if self.qualify {
            format!("{}.{}", self.ident(&col.table), self.ident(&col.column))
        } else {
            self.ident(&col.column)
        };
        match col.date_part {
            Some(part) => self.dialect.extract_date_part(part, &base),
            None => base,
        }
    }

    fn select_column(&self, col: &SelectColumn) -> String {
        let expr = match col.aggregation {
            Some(agg) => format!("{}({})", agg.as_sql(), self.column(&col.column)),
            None => self.column(&col.column),
        };
        format!("{} AS {}", expr, self.ident(&col.alias))
    }

    fn order_by(&self, order: &OrderBy) -> String {
        let expr = match order.aggregation {
            Some(agg) => format!("{}({})", agg.as_sql(), self.column(&order.column)),
            None => self.column(&order.column),
        };
        format!("{} {}", expr, order.direction.as_sql())
    }

    fn literal(&self, value: &Literal) -> Result<String, AppError> {
        match value {
            Literal::String(s) => Ok(self.dialect.quote_string(s)),
            Literal::Integer(i) => Ok(i.to_string()),
            Literal::Float(f) if f.is_finite() => Ok(f.to_string()),
            Literal::Float(f) => Err(AppError::InvalidFilter(format!(
                "non-finite numeric literal {}",
                f
            ))),
            Literal::Boolean(b) => Ok(self.dialect.format_bool(*b).to_string()),
            Literal::Null => Ok("NULL".to_string()),
        }
    }

    fn filter(&self, filter: &Filter) -> Result<String, AppError> {
        let expr = self.column(&filter.column);
        let arity_error = || {
            AppError::InvalidFilter(format!(
                "{} on {}.{} cannot take {} value(s)",
                filter.operator,
                filter.column.table,
                filter.column.column,
                filter.values.len()
            ))
        };

        match filter.operator {
            Operator::In | Operator::NotIn => {
                if filter.values.is_empty() {
                    return Err(arity_error());
                }
                let values = filter
                    .values
                    .iter()
                    .map(|v| self.literal(v))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(format!("{} {} ({})", expr, filter.operator, values.join(",")))
            }
            Operator::Between => match filter.values.as_slice() {
                [low, high] => Ok(format!(
                    "{} BETWEEN {} AND {}",
                    expr,
                    self.literal(low)?,
                    self.literal(high)?
                )),
                _ => Err(arity_error()),
            },
            op => match filter.values.as_slice() {
                [Literal::Null] if op == Operator::Eq => Ok(format!("{} IS NULL", expr)),
                [Literal::Null] if op == Operator::NotEq => Ok(format!("{} IS NOT NULL", expr)),
                [value] => Ok(format!("{} {} {}", expr, op, self.literal(value)?)),
                _ => Err(arity_error()),
            },
        }
    }
}
