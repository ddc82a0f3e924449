// Query Plan Model
//
// Dialect-neutral intermediate representation produced by the plan builder
// and rendered by the SQL generator. A plan is immutable once built.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Literal value carried by a filter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Null,
}

impl Literal {
    pub fn string(s: impl Into<String>) -> Self {
        Literal::String(s.into())
    }

    /// Dialect-independent identity used for comparing values
    pub fn canonical(&self) -> String {
        match self {
            Literal::Boolean(b) => b.to_string(),
            Literal::Integer(i) => i.to_string(),
            Literal::Float(f) => f.to_string(),
            Literal::String(s) => format!("'{}'", s),
            Literal::Null => "NULL".to_string(),
        }
    }
}

impl From<&str> for Literal {
    fn from(s: &str) -> Self {
        Literal::String(s.to_string())
    }
}

impl From<bool> for Literal {
    fn from(b: bool) -> Self {
        Literal::Boolean(b)
    }
}

impl From<i64> for Literal {
    fn from(i: i64) -> Self {
        Literal::Integer(i)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=", alias = "<>")]
    NotEq,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    GtEq,
    #[serde(rename = "<=")]
    LtEq,
    #[serde(rename = "IN", alias = "in")]
    In,
    #[serde(rename = "NOT IN", alias = "not in")]
    NotIn,
    #[serde(rename = "LIKE", alias = "like")]
    Like,
    #[serde(rename = "NOT LIKE", alias = "not like")]
    NotLike,
    #[serde(rename = "BETWEEN", alias = "between")]
    Between,
}

impl Operator {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::NotEq => "!=",
            Operator::Gt => ">",
            Operator::Lt => "<",
            Operator::GtEq => ">=",
            Operator::LtEq => "<=",
            Operator::In => "IN",
            Operator::NotIn => "NOT IN",
            Operator::Like => "LIKE",
            Operator::NotLike => "NOT LIKE",
            Operator::Between => "BETWEEN",
        }
    }

    pub fn is_membership(&self) -> bool {
        matches!(self, Operator::In | Operator::NotIn)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Aggregation {
    #[serde(alias = "sum")]
    Sum,
    #[serde(alias = "avg")]
    Avg,
    #[serde(alias = "count")]
    Count,
    #[serde(alias = "min")]
    Min,
    #[serde(alias = "max")]
    Max,
}

impl Aggregation {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Aggregation::Sum => "SUM",
            Aggregation::Avg => "AVG",
            Aggregation::Count => "COUNT",
            Aggregation::Min => "MIN",
            Aggregation::Max => "MAX",
        }
    }
}

/// Date component extracted from a temporal column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatePart {
    Year,
    Quarter,
    Month,
    Day,
}

impl DatePart {
    pub fn keyword(&self) -> &'static str {
        match self {
            DatePart::Year => "YEAR",
            DatePart::Quarter => "QUARTER",
            DatePart::Month => "MONTH",
            DatePart::Day => "DAY",
        }
    }
}

/// A column reference, optionally wrapped in a date-part extraction
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnRef {
    pub table: String,
    pub column: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_part: Option<DatePart>,
}

impl ColumnRef {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
            date_part: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinType {
    Inner,
    Left,
}

impl JoinType {
    pub fn as_sql(&self) -> &'static str {
        match self {
            JoinType::Inner => "INNER JOIN",
            JoinType::Left => "LEFT JOIN",
        }
    }
}

/// One JOIN of the plan: `join_type table ON from_table.from_column = table.to_column`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinClause {
    pub table: String,
    pub join_type: JoinType,
    pub from_table: String,
    pub from_column: String,
    pub to_column: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectColumn {
    pub column: ColumnRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation: Option<Aggregation>,
    pub alias: String,
}

impl SelectColumn {
    pub fn is_aggregated(&self) -> bool {
        self.aggregation.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOrigin {
    /// From the resolved intent
    User,
    /// Injected from a schema default-filter declaration
    Default,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub column: ColumnRef,
    pub operator: Operator,
    pub values: Vec<Literal>,
    pub origin: FilterOrigin,
}

impl Filter {
    pub fn targets(&self, table: &str, column: &str) -> bool {
        self.column.table == table && self.column.column == column
    }

    /// True for a plain `column = value` predicate
    pub fn is_single_equality(&self) -> bool {
        self.operator == Operator::Eq && self.values.len() == 1 && self.column.date_part.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    #[serde(alias = "ASC")]
    Asc,
    #[serde(alias = "DESC")]
    Desc,
}

impl SortDirection {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub column: ColumnRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation: Option<Aggregation>,
    pub direction: SortDirection,
}

/// The complete intermediate representation of one query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    pub base_table: String,
    pub joins: Vec<JoinClause>,
    /// Empty means `SELECT base_table.*`
    pub select: Vec<SelectColumn>,
    pub filters: Vec<Filter>,
    pub group_by: Vec<ColumnRef>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u64>,
}

impl QueryPlan {
    pub fn has_aggregation(&self) -> bool {
        self.select.iter().any(|c| c.is_aggregated())
    }

    /// Base table followed by joined tables in join order
    pub fn tables(&self) -> Vec<&str> {
        std::iter::once(self.base_table.as_str())
            .chain(self.joins.iter().map(|j| j.table.as_str()))
            .collect()
    }

    pub fn user_filters(&self) -> impl Iterator<Item = &Filter> {
        self.filters.iter().filter(|f| f.origin == FilterOrigin::User)
    }

    pub fn default_filters(&self) -> impl Iterator<Item = &Filter> {
        self.filters.iter().filter(|f| f.origin == FilterOrigin::Default)
    }
}
