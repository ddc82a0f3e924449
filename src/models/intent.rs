// Resolved Intent Model
//
// The already-interpreted request handed to the core by the semantic
// resolution collaborator. Table and column names are trusted to exist in
// the schema; the plan builder checks them eagerly.

use serde::{Deserialize, Serialize};

use super::plan::{Aggregation, DatePart, Literal, Operator, SortDirection};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentType {
    #[default]
    Retrieval,
    Aggregation,
    Ranking,
    Comparison,
}

/// What a resolved entity refers to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityRef {
    /// A whole table ("list funds")
    Table { table: String },
    /// A projected column
    Column {
        table: String,
        column: String,
        #[serde(default)]
        alias: Option<String>,
        #[serde(default)]
        date_part: Option<DatePart>,
    },
    /// A domain value matched against a column; becomes an equality filter
    Value {
        table: String,
        column: String,
        value: Literal,
    },
    /// An aggregated metric
    Aggregation {
        table: String,
        column: String,
        function: Aggregation,
        #[serde(default)]
        alias: Option<String>,
    },
}

impl EntityRef {
    pub fn table(&self) -> &str {
        match self {
            EntityRef::Table { table }
            | EntityRef::Column { table, .. }
            | EntityRef::Value { table, .. }
            | EntityRef::Aggregation { table, .. } => table,
        }
    }

    pub fn column(&self) -> Option<&str> {
        match self {
            EntityRef::Table { .. } => None,
            EntityRef::Column { column, .. }
            | EntityRef::Value { column, .. }
            | EntityRef::Aggregation { column, .. } => Some(column),
        }
    }

    /// Whether this entity contributes a select column
    pub fn is_projected(&self) -> bool {
        matches!(self, EntityRef::Column { .. } | EntityRef::Aggregation { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedEntity {
    #[serde(flatten)]
    pub entity: EntityRef,
    #[serde(default)]
    pub confidence: Option<f64>,
    /// Which resolver produced the match ("exact", "alias", "semantic", ...)
    #[serde(default)]
    pub source: Option<String>,
}

impl ResolvedEntity {
    pub fn new(entity: EntityRef) -> Self {
        Self {
            entity,
            confidence: None,
            source: None,
        }
    }

    pub fn column(table: &str, column: &str) -> Self {
        Self::new(EntityRef::Column {
            table: table.to_string(),
            column: column.to_string(),
            alias: None,
            date_part: None,
        })
    }

    pub fn aggregation(table: &str, column: &str, function: Aggregation) -> Self {
        Self::new(EntityRef::Aggregation {
            table: table.to_string(),
            column: column.to_string(),
            function,
            alias: None,
        })
    }

    pub fn table(table: &str) -> Self {
        Self::new(EntityRef::Table {
            table: table.to_string(),
        })
    }

    pub fn value(table: &str, column: &str, value: impl Into<Literal>) -> Self {
        Self::new(EntityRef::Value {
            table: table.to_string(),
            column: column.to_string(),
            value: value.into(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub table: String,
    pub column: String,
    pub operator: Operator,
    pub values: Vec<Literal>,
    #[serde(default)]
    pub date_part: Option<DatePart>,
}

impl FilterSpec {
    pub fn new(table: &str, column: &str, operator: Operator, values: Vec<Literal>) -> Self {
        Self {
            table: table.to_string(),
            column: column.to_string(),
            operator,
            values,
            date_part: None,
        }
    }

    pub fn eq(table: &str, column: &str, value: impl Into<Literal>) -> Self {
        Self::new(table, column, Operator::Eq, vec![value.into()])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderHint {
    pub table: String,
    pub column: String,
    #[serde(default)]
    pub aggregation: Option<Aggregation>,
    #[serde(default)]
    pub direction: SortDirection,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedIntent {
    #[serde(default)]
    pub intent_type: IntentType,
    #[serde(default)]
    pub entities: Vec<ResolvedEntity>,
    #[serde(default)]
    pub filters: Vec<FilterSpec>,
    #[serde(default)]
    pub order_by: Vec<OrderHint>,
    #[serde(default)]
    pub limit: Option<u64>,
}

impl ResolvedIntent {
    pub fn new(intent_type: IntentType) -> Self {
        Self {
            intent_type,
            ..Default::default()
        }
    }

    pub fn with_entity(mut self, entity: ResolvedEntity) -> Self {
        self.entities.push(entity);
        self
    }

    pub fn with_filter(mut self, filter: FilterSpec) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_order(mut self, hint: OrderHint) -> Self {
        self.order_by.push(hint);
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }
}
