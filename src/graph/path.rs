//! Path finding over the table-level projection of the graph.
//!
//! Neighbor expansion is ordered by (target table, from column, to column) so
//! that the first shortest path found is the lexicographically smallest one and
//! repeated calls on an unchanged graph return identical results.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::graph::{EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;

use super::{Edge, JoinPath, KnowledgeGraph};
use crate::error::AppError;
use crate::models::JoinClause;

struct ParentInfo {
    parent: NodeIndex,
    edge_idx: EdgeIndex,
}

impl KnowledgeGraph {
    /// Outgoing relationship edges of a table node in deterministic order.
    fn ordered_edges(&self, node: NodeIndex) -> Vec<(NodeIndex, EdgeIndex)> {
        let mut edges: Vec<(NodeIndex, EdgeIndex)> = self
            .graph
            .edges(node)
            .map(|e| (e.target(), e.id()))
            .collect();
        edges.sort_by(|(a_node, a_edge), (b_node, b_edge)| {
            let (a, b) = (&self.graph[*a_edge], &self.graph[*b_edge]);
            self.graph[*a_node]
                .name
                .cmp(&self.graph[*b_node].name)
                .then_with(|| a.from_column.cmp(&b.from_column))
                .then_with(|| a.to_column.cmp(&b.to_column))
        });
        edges
    }

    fn edge_at(&self, from: NodeIndex, to: NodeIndex, edge_idx: EdgeIndex) -> Edge {
        let data = &self.graph[edge_idx];
        Edge {
            from_table: self.graph[from].name.clone(),
            to_table: self.graph[to].name.clone(),
            from_column: data.from_column.clone(),
            to_column: data.to_column.clone(),
            kind: data.kind,
        }
    }

    /// Shortest join path between two tables.
    ///
    /// Returns `Ok(None)` when the tables are not connected and an empty path
    /// when `from == to`.
    pub fn shortest_path(&self, from: &str, to: &str) -> Result<Option<JoinPath>, AppError> {
        let from_idx = self.table_index(from)?;
        let to_idx = self.table_index(to)?;

        if from_idx == to_idx {
            return Ok(Some(JoinPath::new()));
        }

        let mut visited: HashSet<NodeIndex> = HashSet::new();
        let mut parents: HashMap<NodeIndex, ParentInfo> = HashMap::new();
        let mut queue: VecDeque<NodeIndex> = VecDeque::new();

        queue.push_back(from_idx);
        visited.insert(from_idx);

        while let Some(current) = queue.pop_front() {
            for (neighbor, edge_idx) in self.ordered_edges(current) {
                if visited.contains(&neighbor) {
                    continue;
                }

                parents.insert(
                    neighbor,
                    ParentInfo {
                        parent: current,
                        edge_idx,
                    },
                );

                if neighbor == to_idx {
                    return Ok(Some(self.reconstruct_path(from_idx, to_idx, &parents)));
                }

                visited.insert(neighbor);
                queue.push_back(neighbor);
            }
        }

        tracing::debug!("No join path between '{}' and '{}'", from, to);
        Ok(None)
    }

    fn reconstruct_path(
        &self,
        from_idx: NodeIndex,
        to_idx: NodeIndex,
        parents: &HashMap<NodeIndex, ParentInfo>,
    ) -> JoinPath {
        let mut edges = Vec::new();
        let mut current = to_idx;

        while current != from_idx {
            let Some(info) = parents.get(&current) else {
                break;
            };
            edges.push(self.edge_at(info.parent, current, info.edge_idx));
            current = info.parent;
        }

        edges.reverse();
        JoinPath { edges }
    }

    /// Every acyclic path of at most `max_depth` hops, shortest first.
    ///
    /// Ties are broken by the visited table sequence, then by join columns.
    pub fn all_paths(
        &self,
        from: &str,
        to: &str,
        max_depth: usize,
    ) -> Result<Vec<JoinPath>, AppError> {
        let from_idx = self.table_index(from)?;
        let to_idx = self.table_index(to)?;

        if from_idx == to_idx {
            return Ok(vec![JoinPath::new()]);
        }

        let mut results: Vec<JoinPath> = vec![];
        let mut stack: Vec<(NodeIndex, Vec<Edge>, HashSet<NodeIndex>)> = vec![];

        let mut initial_visited = HashSet::new();
        initial_visited.insert(from_idx);
        stack.push((from_idx, vec![], initial_visited));

        while let Some((current, path, visited)) = stack.pop() {
            if path.len() >= max_depth {
                continue;
            }

            for (neighbor, edge_idx) in self.ordered_edges(current) {
                if visited.contains(&neighbor) {
                    continue;
                }

                let mut new_path = path.clone();
                new_path.push(self.edge_at(current, neighbor, edge_idx));

                if neighbor == to_idx {
                    results.push(JoinPath { edges: new_path });
                    continue;
                }

                let mut new_visited = visited.clone();
                new_visited.insert(neighbor);
                stack.push((neighbor, new_path, new_visited));
            }
        }

        results.sort_by(|a, b| {
            a.len()
                .cmp(&b.len())
                .then_with(|| a.tables().cmp(&b.tables()))
                .then_with(|| column_key(a).cmp(&column_key(b)))
        });
        Ok(results)
    }

    /// Directly related tables with the edge leading to each, sorted.
    pub fn neighbors(&self, table: &str) -> Result<Vec<Edge>, AppError> {
        let idx = self.table_index(table)?;
        Ok(self
            .ordered_edges(idx)
            .into_iter()
            .map(|(neighbor, edge_idx)| self.edge_at(idx, neighbor, edge_idx))
            .collect())
    }

    /// Rank candidate paths by ascending cost; equal costs keep their input order.
    pub fn rank_paths(&self, mut paths: Vec<JoinPath>, scorer: &dyn PathScorer) -> Vec<JoinPath> {
        paths.sort_by_cached_key(|p| scorer.cost(self, p));
        paths
    }
}

fn column_key(path: &JoinPath) -> Vec<(&str, &str)> {
    path.edges
        .iter()
        .map(|e| (e.from_column.as_str(), e.to_column.as_str()))
        .collect()
}

/// JOIN clauses for a path, one per edge, in path order.
pub fn join_path_sql(path: &JoinPath) -> Vec<JoinClause> {
    path.edges
        .iter()
        .map(|edge| JoinClause {
            table: edge.to_table.clone(),
            join_type: edge.kind.join_type(),
            from_table: edge.from_table.clone(),
            from_column: edge.from_column.clone(),
            to_column: edge.to_column.clone(),
        })
        .collect()
}

/// Cost function for choosing among alternative join paths.
pub trait PathScorer: Send + Sync {
    fn cost(&self, graph: &KnowledgeGraph, path: &JoinPath) -> u32;
}

/// Cost is the hop count.
#[derive(Debug, Clone, Copy, Default)]
pub struct LengthScorer;

impl PathScorer for LengthScorer {
    fn cost(&self, _graph: &KnowledgeGraph, path: &JoinPath) -> u32 {
        path.len() as u32
    }
}

/// Hop count plus a fixed penalty for every deprecated table on the path.
#[derive(Debug, Clone, Copy)]
pub struct DeprecationAwareScorer {
    pub penalty: u32,
}

impl Default for DeprecationAwareScorer {
    fn default() -> Self {
        Self { penalty: 10 }
    }
}

impl PathScorer for DeprecationAwareScorer {
    fn cost(&self, graph: &KnowledgeGraph, path: &JoinPath) -> u32 {
        let deprecated = path
            .tables()
            .into_iter()
            .filter(|t| graph.is_deprecated(t))
            .count() as u32;
        path.len() as u32 + deprecated * self.penalty
    }
}
