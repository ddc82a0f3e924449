//! Schema knowledge graph - tables, columns and the relationships between them.
//!
//! Nodes and edges live in a petgraph arena addressed by index. Every
//! relationship is stored as a forward/reverse edge pair so traversal is
//! bidirectional. Only table nodes carry relationship edges, which makes the
//! petgraph itself the table-level projection used by path search.
//!
//! The graph is built once and published through [`GraphHandle`]; schema
//! changes build a new graph and swap it in, so readers never observe a
//! partially mutated graph.
//!
//! - `builder`: construction from schema metadata, naming-convention inference
//! - `path`: shortest/all path search, neighbors, join clause emission, scoring

mod builder;
mod path;


pub use path::{join_path_sql, DeprecationAwareScorer, LengthScorer, PathScorer};

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::{DefaultFilterDef, JoinType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Table,
    Column,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipKind {
    ForeignKey,
    OneToMany,
    ManyToOne,
    OneToOne,
    ManyToMany,
}

impl RelationshipKind {
    /// Kind carried by the reverse edge of a pair.
    pub fn reverse(&self) -> Self {
        match self {
            RelationshipKind::ForeignKey => RelationshipKind::OneToMany,
            RelationshipKind::OneToMany => RelationshipKind::ManyToOne,
            RelationshipKind::ManyToOne => RelationshipKind::OneToMany,
            RelationshipKind::OneToOne => RelationshipKind::OneToOne,
            RelationshipKind::ManyToMany => RelationshipKind::ManyToMany,
        }
    }

    /// Parent lookups are required (INNER); child fan-outs are optional (LEFT).
    pub fn join_type(&self) -> JoinType {
        match self {
            RelationshipKind::ManyToOne
            | RelationshipKind::OneToOne
            | RelationshipKind::ForeignKey => JoinType::Inner,
            RelationshipKind::OneToMany | RelationshipKind::ManyToMany => JoinType::Left,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub description: Option<String>,
    pub aliases: Vec<String>,
    pub deprecated: bool,
    pub default_filter: Option<DefaultFilterDef>,
}

/// A table or a column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// `table` for tables, `table.column` for columns
    pub id: String,
    pub name: String,
    pub kind: NodeKind,
    /// Owning table (columns only)
    pub table: Option<String>,
    pub data_type: Option<String>,
    pub is_nullable: bool,
    pub is_primary_key: bool,
    pub is_foreign_key: bool,
    pub metadata: NodeMetadata,
}

impl Node {
    pub fn table(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: name.clone(),
            name,
            kind: NodeKind::Table,
            table: None,
            data_type: None,
            is_nullable: false,
            is_primary_key: false,
            is_foreign_key: false,
            metadata: NodeMetadata::default(),
        }
    }

    pub fn column(
        table: impl Into<String>,
        name: impl Into<String>,
        data_type: impl Into<String>,
    ) -> Self {
        let table = table.into();
        let name = name.into();
        Self {
            id: column_id(&table, &name),
            name,
            kind: NodeKind::Column,
            table: Some(table),
            data_type: Some(data_type.into()),
            is_nullable: true,
            is_primary_key: false,
            is_foreign_key: false,
            metadata: NodeMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: NodeMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

pub fn column_id(table: &str, column: &str) -> String {
    format!("{}.{}", table, column)
}

/// A relationship between two tables, joined on
/// `from_table.from_column = to_table.to_column`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub from_table: String,
    pub to_table: String,
    pub from_column: String,
    pub to_column: String,
    pub kind: RelationshipKind,
}

impl Edge {
    pub fn new(
        from_table: impl Into<String>,
        from_column: impl Into<String>,
        to_table: impl Into<String>,
        to_column: impl Into<String>,
        kind: RelationshipKind,
    ) -> Self {
        Self {
            from_table: from_table.into(),
            to_table: to_table.into(),
            from_column: from_column.into(),
            to_column: to_column.into(),
            kind,
        }
    }

    /// The same relationship seen from the other side.
    pub fn reversed(&self) -> Self {
        Self {
            from_table: self.to_table.clone(),
            to_table: self.from_table.clone(),
            from_column: self.to_column.clone(),
            to_column: self.from_column.clone(),
            kind: self.kind.reverse(),
        }
    }

    pub fn predicate(&self) -> String {
        format!(
            "{}.{} = {}.{}",
            self.from_table, self.from_column, self.to_table, self.to_column
        )
    }
}

/// Edge weight stored in the arena.
#[derive(Debug, Clone)]
pub(crate) struct EdgeData {
    pub from_column: String,
    pub to_column: String,
    pub kind: RelationshipKind,
}

/// An ordered sequence of edges from a start table to an end table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinPath {
    pub edges: Vec<Edge>,
}

impl JoinPath {
    pub fn new() -> Self {
        Self { edges: vec![] }
    }

    /// Number of hops.
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Tables visited, start and end included.
    pub fn tables(&self) -> Vec<&str> {
        let mut result: Vec<&str> = Vec::new();
        for edge in &self.edges {
            if result.last().copied() != Some(edge.from_table.as_str()) {
                result.push(&edge.from_table);
            }
            result.push(&edge.to_table);
        }
        result
    }
}

/// In-memory graph of the schema.
#[derive(Debug, Clone, Default)]
pub struct KnowledgeGraph {
    graph: DiGraph<Node, EdgeData>,
    node_index: HashMap<String, NodeIndex>,
    /// Hex digest of the schema metadata the graph was built from; empty for
    /// graphs assembled by hand
    fingerprint: String,
}

impl KnowledgeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identity of the schema behind this graph. Anything derived from the
    /// graph and cached across rebuilds should be keyed on it.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Add a node; re-adding an existing id replaces its attributes.
    pub fn add_node(&mut self, node: Node) -> Result<(), AppError> {
        if node.kind == NodeKind::Column {
            let owner = node.table.as_deref().ok_or_else(|| {
                AppError::InvalidSchema(format!("Column node '{}' has no owning table", node.id))
            })?;
            if !self.has_table(owner) {
                return Err(AppError::InvalidSchema(format!(
                    "Column '{}' references unknown table '{}'",
                    node.id, owner
                )));
            }
        }

        if let Some(&idx) = self.node_index.get(&node.id) {
            if self.graph[idx].kind != node.kind {
                return Err(AppError::InvalidSchema(format!(
                    "Node '{}' already exists as a {:?}",
                    node.id, self.graph[idx].kind
                )));
            }
            self.graph[idx] = node;
            return Ok(());
        }

        let id = node.id.clone();
        let idx = self.graph.add_node(node);
        self.node_index.insert(id, idx);
        Ok(())
    }

    /// Add a relationship as a forward/reverse edge pair.
    pub fn add_edge(&mut self, edge: Edge) -> Result<(), AppError> {
        let from_idx = self.table_index(&edge.from_table)?;
        let to_idx = self.table_index(&edge.to_table)?;

        for (table, column) in [
            (&edge.from_table, &edge.from_column),
            (&edge.to_table, &edge.to_column),
        ] {
            if !self.has_column(table, column) {
                return Err(AppError::InvalidSchema(format!(
                    "Relationship {} references unknown column '{}.{}'",
                    edge.predicate(),
                    table,
                    column
                )));
            }
        }

        if from_idx == to_idx && edge.from_column == edge.to_column {
            return Err(AppError::InvalidSchema(format!(
                "Relationship {} joins a column to itself",
                edge.predicate()
            )));
        }

        if self.contains_edge(&edge) {
            tracing::error!("Duplicate relationship rejected: {}", edge.predicate());
            return Err(AppError::DuplicateEdge {
                from: edge.from_table.clone(),
                to: edge.to_table.clone(),
                predicate: edge.predicate(),
            });
        }

        self.graph.add_edge(
            from_idx,
            to_idx,
            EdgeData {
                from_column: edge.from_column.clone(),
                to_column: edge.to_column.clone(),
                kind: edge.kind,
            },
        );
        self.graph.add_edge(
            to_idx,
            from_idx,
            EdgeData {
                from_column: edge.to_column,
                to_column: edge.from_column,
                kind: edge.kind.reverse(),
            },
        );

        Ok(())
    }

    /// Whether the same join predicate is already present in either direction.
    pub fn contains_edge(&self, edge: &Edge) -> bool {
        let (Some(&from_idx), Some(&to_idx)) = (
            self.node_index.get(&edge.from_table),
            self.node_index.get(&edge.to_table),
        ) else {
            return false;
        };

        self.graph.edges_connecting(from_idx, to_idx).any(|e| {
            let data = e.weight();
            data.from_column == edge.from_column && data.to_column == edge.to_column
        })
    }

    /// Whether any relationship links the two tables.
    pub fn are_connected(&self, a: &str, b: &str) -> bool {
        match (self.node_index.get(a), self.node_index.get(b)) {
            (Some(&a), Some(&b)) => self.graph.find_edge(a, b).is_some(),
            _ => false,
        }
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.table_node(name).is_some()
    }

    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.column_node(table, column).is_some()
    }

    pub fn table_node(&self, name: &str) -> Option<&Node> {
        self.node_index
            .get(name)
            .map(|idx| &self.graph[*idx])
            .filter(|n| n.kind == NodeKind::Table)
    }

    pub fn column_node(&self, table: &str, column: &str) -> Option<&Node> {
        self.node_index
            .get(&column_id(table, column))
            .map(|idx| &self.graph[*idx])
            .filter(|n| n.kind == NodeKind::Column)
    }

    /// Columns of a table, sorted by name.
    pub fn columns(&self, table: &str) -> Vec<&Node> {
        let mut columns: Vec<&Node> = self
            .graph
            .node_weights()
            .filter(|n| n.kind == NodeKind::Column && n.table.as_deref() == Some(table))
            .collect();
        columns.sort_by(|a, b| a.name.cmp(&b.name));
        columns
    }

    /// Default-filter declarations of a table as `(column, filter)`, sorted by column.
    pub fn default_filters(&self, table: &str) -> Vec<(&str, &DefaultFilterDef)> {
        self.columns(table)
            .into_iter()
            .filter_map(|n| n.metadata.default_filter.as_ref().map(|f| (n.name.as_str(), f)))
            .collect()
    }

    pub fn is_deprecated(&self, table: &str) -> bool {
        self.table_node(table)
            .map(|n| n.metadata.deprecated)
            .unwrap_or(false)
    }

    /// All table names, sorted.
    pub fn table_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .graph
            .node_weights()
            .filter(|n| n.kind == NodeKind::Table)
            .map(|n| n.name.as_str())
            .collect();
        names.sort();
        names
    }

    pub fn table_count(&self) -> usize {
        self.graph
            .node_weights()
            .filter(|n| n.kind == NodeKind::Table)
            .count()
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Number of relationships (each stored as two edges).
    pub fn relationship_count(&self) -> usize {
        self.graph.edge_count() / 2
    }

    pub(crate) fn table_index(&self, name: &str) -> Result<NodeIndex, AppError> {
        self.node_index
            .get(name)
            .copied()
            .filter(|idx| self.graph[*idx].kind == NodeKind::Table)
            .ok_or_else(|| AppError::unknown_table(name))
    }
}

/// Shared, atomically swappable reference to the current graph.
///
/// Readers take a cheap `Arc` snapshot and keep using it for the whole request,
/// even if a rebuild is published in the meantime.
#[derive(Debug)]
pub struct GraphHandle {
    current: RwLock<Arc<KnowledgeGraph>>,
}

impl GraphHandle {
    pub fn new(graph: KnowledgeGraph) -> Self {
        Self {
            current: RwLock::new(Arc::new(graph)),
        }
    }

    pub fn snapshot(&self) -> Arc<KnowledgeGraph> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Publish a fully built graph, returning the one it replaces.
    pub fn swap(&self, graph: KnowledgeGraph) -> Arc<KnowledgeGraph> {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, Arc::new(graph))
    }

    /// Build a graph from new schema metadata and publish it.
    ///
    /// On failure the current graph stays in place.
    pub fn rebuild(
        &self,
        schema: &crate::models::SchemaMetadata,
    ) -> Result<Arc<KnowledgeGraph>, AppError> {
        let graph = KnowledgeGraph::from_schema(schema)?;
        tracing::info!(
            "Publishing rebuilt knowledge graph ({} tables, {} relationships)",
            graph.table_count(),
            graph.relationship_count()
        );
        self.swap(graph);
        Ok(self.snapshot())
    }
}
