// Schema Metadata Model
//
// Table/column definitions, relationship declarations and default-filter
// declarations as supplied by the configuration loader. Consumed once to
// build the knowledge graph.

use serde::{Deserialize, Serialize};

use super::plan::{Literal, Operator};
use crate::graph::RelationshipKind;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaMetadata {
    pub tables: Vec<TableDef>,
    #[serde(default)]
    pub relationships: Vec<RelationshipDef>,
    /// Naming-convention rules used to infer relationships not declared explicitly
    #[serde(default)]
    pub inference_rules: Vec<InferenceRule>,
}

impl SchemaMetadata {
    pub fn table(&self, name: &str) -> Option<&TableDef> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn with_table(mut self, table: TableDef) -> Self {
        self.tables.push(table);
        self
    }

    pub fn with_relationship(mut self, relationship: RelationshipDef) -> Self {
        self.relationships.push(relationship);
        self
    }

    pub fn with_inference_rule(mut self, rule: InferenceRule) -> Self {
        self.inference_rules.push(rule);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Business aliases ("customers" for `clients`)
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Deprecated tables are penalised when ranking alternative join paths
    #[serde(default)]
    pub deprecated: bool,
    pub columns: Vec<ColumnDef>,
}

impl TableDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            aliases: Vec::new(),
            deprecated: false,
            columns: Vec::new(),
        }
    }

    pub fn with_column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    pub fn deprecated(mut self) -> Self {
        self.deprecated = true;
        self
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: String,
    #[serde(default = "default_nullable")]
    pub is_nullable: bool,
    #[serde(default)]
    pub is_primary_key: bool,
    #[serde(default)]
    pub is_foreign_key: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Filter applied automatically whenever the owning table takes part in a query
    #[serde(default)]
    pub default_filter: Option<DefaultFilterDef>,
}

fn default_nullable() -> bool {
    true
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            is_nullable: true,
            is_primary_key: false,
            is_foreign_key: false,
            description: None,
            aliases: Vec::new(),
            default_filter: None,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self.is_nullable = false;
        self
    }

    pub fn foreign_key(mut self) -> Self {
        self.is_foreign_key = true;
        self
    }

    pub fn with_default_filter(mut self, operator: Operator, value: Literal) -> Self {
        self.default_filter = Some(DefaultFilterDef { operator, value });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultFilterDef {
    pub operator: Operator,
    pub value: Literal,
}

/// Explicit foreign-key pair between two tables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipDef {
    pub from_table: String,
    pub from_column: String,
    pub to_table: String,
    pub to_column: String,
    #[serde(default = "default_relationship_kind")]
    pub kind: RelationshipKind,
}

fn default_relationship_kind() -> RelationshipKind {
    RelationshipKind::ManyToOne
}

impl RelationshipDef {
    pub fn new(
        from_table: impl Into<String>,
        from_column: impl Into<String>,
        to_table: impl Into<String>,
        to_column: impl Into<String>,
        kind: RelationshipKind,
    ) -> Self {
        Self {
            from_table: from_table.into(),
            from_column: from_column.into(),
            to_table: to_table.into(),
            to_column: to_column.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum InferenceRule {
    /// `accounts.client_id` references `clients` when the column ends in `suffix`
    ForeignKeySuffix { suffix: String },
}
