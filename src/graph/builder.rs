//! Graph construction from schema metadata.

use inflector::Inflector;
use sha2::{Digest, Sha256};

use super::{Edge, KnowledgeGraph, Node, NodeMetadata, RelationshipKind};
use crate::error::AppError;
use crate::models::{InferenceRule, SchemaMetadata, TableDef};

impl KnowledgeGraph {
    /// Build a graph from declared tables, explicit relationships and
    /// naming-convention inference rules, in that order.
    pub fn from_schema(schema: &SchemaMetadata) -> Result<Self, AppError> {
        let mut graph = KnowledgeGraph::new();
        graph.fingerprint = schema_fingerprint(schema)?;

        for table in &schema.tables {
            graph.add_table(table)?;
        }

        for rel in &schema.relationships {
            graph.add_edge(Edge::new(
                &rel.from_table,
                &rel.from_column,
                &rel.to_table,
                &rel.to_column,
                rel.kind,
            ))?;
        }

        for rule in &schema.inference_rules {
            match rule {
                InferenceRule::ForeignKeySuffix { suffix } => {
                    let inferred = graph.infer_suffix_relationships(schema, suffix)?;
                    tracing::debug!(
                        "Inferred {} relationship(s) from '{}' suffix",
                        inferred,
                        suffix
                    );
                }
            }
        }

        tracing::info!(
            "Knowledge graph built: {} tables, {} nodes, {} relationships",
            graph.table_count(),
            graph.node_count(),
            graph.relationship_count()
        );

        Ok(graph)
    }

    fn add_table(&mut self, table: &TableDef) -> Result<(), AppError> {
        if table.name.is_empty() {
            return Err(AppError::InvalidSchema("table with empty name".to_string()));
        }

        self.add_node(Node::table(&table.name).with_metadata(NodeMetadata {
            description: table.description.clone(),
            aliases: table.aliases.clone(),
            deprecated: table.deprecated,
            default_filter: None,
        }))?;

        for col in &table.columns {
            let metadata = NodeMetadata {
                description: col.description.clone(),
                aliases: col.aliases.clone(),
                deprecated: false,
                default_filter: col.default_filter.clone(),
            };
            let mut node =
                Node::column(&table.name, &col.name, &col.data_type).with_metadata(metadata);
            node.is_nullable = col.is_nullable;
            node.is_primary_key = col.is_primary_key;
            node.is_foreign_key = col.is_foreign_key;
            self.add_node(node)?;
        }

        Ok(())
    }

    /// `accounts.client_id` → `clients.client_id` (or `clients.id`).
    ///
    /// Table pairs already linked by any relationship are left alone.
    fn infer_suffix_relationships(
        &mut self,
        schema: &SchemaMetadata,
        suffix: &str,
    ) -> Result<usize, AppError> {
        if suffix.is_empty() {
            return Err(AppError::InvalidSchema(
                "inference suffix must not be empty".to_string(),
            ));
        }

        let mut tables: Vec<&TableDef> = schema.tables.iter().collect();
        tables.sort_by(|a, b| a.name.cmp(&b.name));

        let mut inferred = 0;
        for table in tables {
            let mut columns: Vec<&str> = table.columns.iter().map(|c| c.name.as_str()).collect();
            columns.sort();

            for column in columns {
                let Some(stem) = column.strip_suffix(suffix).filter(|s| !s.is_empty()) else {
                    continue;
                };

                let Some((target, target_column)) = self.suffix_target(stem, column) else {
                    continue;
                };

                if target == table.name {
                    continue;
                }

                if self.are_connected(&table.name, &target) {
                    tracing::debug!(
                        "Skipping inferred {}.{} -> {}: tables already related",
                        table.name,
                        column,
                        target
                    );
                    continue;
                }

                self.add_edge(Edge::new(
                    &table.name,
                    column,
                    &target,
                    &target_column,
                    RelationshipKind::ManyToOne,
                ))?;
                inferred += 1;
            }
        }

        Ok(inferred)
    }

    fn suffix_target(&self, stem: &str, column: &str) -> Option<(String, String)> {
        let plural = stem.to_plural();
        let candidates = if plural == stem {
            vec![plural]
        } else {
            vec![plural, stem.to_string()]
        };

        candidates.into_iter().find_map(|table| {
            if self.has_column(&table, column) {
                Some((table, column.to_string()))
            } else if self.has_column(&table, "id") {
                Some((table, "id".to_string()))
            } else {
                None
            }
        })
    }
}

/// Sha256 over the serialized schema. Schema types hold only ordered
/// collections, so equal schemas serialize identically.
fn schema_fingerprint(schema: &SchemaMetadata) -> Result<String, AppError> {
    let digest = Sha256::digest(serde_json::to_vec(schema)?);
    Ok(digest.iter().map(|b| format!("{:02x}", b)).collect())
}
