//! Wealth-management schema shared by unit tests.

use crate::graph::{KnowledgeGraph, RelationshipKind};
use crate::models::{ColumnDef, Literal, Operator, RelationshipDef, SchemaMetadata, TableDef};

pub fn wealth_schema() -> SchemaMetadata {
    SchemaMetadata::default()
        .with_table(
            TableDef::new("clients")
                .with_column(ColumnDef::new("client_id", "integer").primary_key())
                .with_column(ColumnDef::new("client_name", "varchar"))
                .with_column(ColumnDef::new("segment", "varchar"))
                .with_column(ColumnDef::new("region", "varchar")),
        )
        .with_table(
            TableDef::new("accounts")
                .with_column(ColumnDef::new("account_id", "integer").primary_key())
                .with_column(ColumnDef::new("client_id", "integer").foreign_key())
                .with_column(ColumnDef::new("account_type", "varchar"))
                .with_column(ColumnDef::new("opened_at", "date")),
        )
        .with_table(
            TableDef::new("holdings")
                .with_column(ColumnDef::new("holding_id", "integer").primary_key())
                .with_column(ColumnDef::new("account_id", "integer").foreign_key())
                .with_column(ColumnDef::new("fund_id", "integer").foreign_key())
                .with_column(ColumnDef::new("market_value", "decimal"))
                .with_column(ColumnDef::new("as_of_date", "date")),
        )
        .with_table(
            TableDef::new("funds")
                .with_column(ColumnDef::new("fund_id", "integer").primary_key())
                .with_column(ColumnDef::new("fund_name", "varchar"))
                .with_column(ColumnDef::new("fund_type", "varchar"))
                .with_column(ColumnDef::new("total_aum", "decimal"))
                .with_column(ColumnDef::new("launch_date", "date"))
                .with_column(
                    ColumnDef::new("is_active", "boolean")
                        .with_default_filter(Operator::Eq, Literal::Boolean(true)),
                ),
        )
        .with_relationship(RelationshipDef::new(
            "accounts",
            "client_id",
            "clients",
            "client_id",
            RelationshipKind::ManyToOne,
        ))
        .with_relationship(RelationshipDef::new(
            "holdings",
            "account_id",
            "accounts",
            "account_id",
            RelationshipKind::ManyToOne,
        ))
        .with_relationship(RelationshipDef::new(
            "holdings",
            "fund_id",
            "funds",
            "fund_id",
            RelationshipKind::ManyToOne,
        ))
}

pub fn wealth_graph() -> KnowledgeGraph {
    KnowledgeGraph::from_schema(&wealth_schema()).unwrap()
}
