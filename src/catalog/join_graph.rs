//! Join Graph Resolution
//!
//! Relationship edges are treated as an undirected graph over tables. Join
//! paths are the shortest paths in that graph; among paths of equal length
//! the one with fewer inferred (heuristic) edges wins, so a declared foreign
//! key is always preferred over a naming-convention guess.
//!
//! Join mechanics are deterministic: the same catalog and tables always
//! produce the same join chain.

use super::{Relationship, RelationshipOrigin, SchemaCatalog};
use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

/// One hop of a join chain, oriented in walking direction: `left_table` is
/// already part of the FROM clause, `right_table` is joined onto it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JoinStep {
    pub left_table: String,
    pub left_column: String,
    pub right_table: String,
    pub right_column: String,
    pub origin: RelationshipOrigin,
}

/// Path cost, compared lexicographically: hops, then inferred edges, then
/// edges whose column names differ.
type Cost = (usize, usize, usize);

fn edge_cost(rel: &Relationship) -> Cost {
    let inferred = usize::from(!rel.is_explicit());
    let renamed = usize::from(!rel.from_column.eq_ignore_ascii_case(&rel.to_column));
    (1, inferred, renamed)
}

fn add(a: Cost, b: Cost) -> Cost {
    (a.0 + b.0, a.1 + b.1, a.2 + b.2)
}

impl SchemaCatalog {
    /// Undirected adjacency, keyed by lower-cased table name. For each pair of
    /// tables only the best parallel edge is kept.
    fn adjacency(&self) -> HashMap<String, Vec<(String, &Relationship)>> {
        let mut best: HashMap<(String, String), &Relationship> = HashMap::new();
        for rel in self.relationships() {
            let from = rel.from_table.to_lowercase();
            let to = rel.to_table.to_lowercase();
            if from == to {
                continue;
            }
            for key in [(from.clone(), to.clone()), (to.clone(), from.clone())] {
                best.entry(key)
                    .and_modify(|current| {
                        let candidate = (edge_cost(rel), rel.from_table.as_str(), rel.from_column.as_str());
                        let existing = (
                            edge_cost(current),
                            current.from_table.as_str(),
                            current.from_column.as_str(),
                        );
                        if candidate < existing {
                            *current = rel;
                        }
                    })
                    .or_insert(rel);
            }
        }

        let mut graph: HashMap<String, Vec<(String, &Relationship)>> = HashMap::new();
        for ((from, to), rel) in best {
            graph.entry(from).or_default().push((to, rel));
        }
        for neighbours in graph.values_mut() {
            neighbours.sort_by(|a, b| a.0.cmp(&b.0));
        }
        graph
    }

    /// Best join path between two tables, `None` when they are not connected.
    /// A table is trivially connected to itself with an empty path.
    pub fn join_path(&self, from: &str, to: &str) -> Option<Vec<JoinStep>> {
        let start = self.table(from)?.name.to_lowercase();
        let goal = self.table(to)?.name.to_lowercase();
        if start == goal {
            return Some(Vec::new());
        }

        let graph = self.adjacency();
        let mut settled: HashSet<String> = HashSet::new();
        let mut best: HashMap<String, Cost> = HashMap::new();
        let mut previous: HashMap<String, (String, &Relationship)> = HashMap::new();
        let mut queue = BinaryHeap::new();

        best.insert(start.clone(), (0, 0, 0));
        queue.push(Reverse(((0, 0, 0), start.clone())));

        while let Some(Reverse((cost, table))) = queue.pop() {
            if !settled.insert(table.clone()) {
                continue;
            }
            if table == goal {
                break;
            }
            let Some(neighbours) = graph.get(&table) else {
                continue;
            };
            for (next, rel) in neighbours {
                if settled.contains(next) {
                    continue;
                }
                let next_cost = add(cost, edge_cost(rel));
                let improves = best.get(next).map_or(true, |c| next_cost < *c);
                if improves {
                    best.insert(next.clone(), next_cost);
                    previous.insert(next.clone(), (table.clone(), *rel));
                    queue.push(Reverse((next_cost, next.clone())));
                }
            }
        }

        if !settled.contains(&goal) {
            return None;
        }

        let mut steps = Vec::new();
        let mut current = goal;
        while current != start {
            let (prev, rel) = previous.get(&current)?;
            steps.push(orient(rel, prev));
            current = prev.clone();
        }
        steps.reverse();
        Some(steps)
    }

    /// Join chain from `base` reaching every table in `targets`. Steps shared
    /// by several paths appear once, in first-use order.
    pub fn join_chain(&self, base: &str, targets: &[String]) -> Result<Vec<JoinStep>> {
        let mut chain: Vec<JoinStep> = Vec::new();
        let mut joined: HashSet<String> = HashSet::new();
        joined.insert(base.to_lowercase());

        for target in targets {
            if joined.contains(&target.to_lowercase()) {
                continue;
            }
            let path = self
                .join_path(base, target)
                .ok_or_else(|| EngineError::UnresolvedJoinPath {
                    from: base.to_string(),
                    to: target.to_string(),
                })?;
            for step in path {
                if joined.insert(step.right_table.to_lowercase()) {
                    chain.push(step);
                }
            }
        }

        Ok(chain)
    }
}

/// Orient a relationship so that `from` (lower-cased) is the left side.
fn orient(rel: &Relationship, from: &str) -> JoinStep {
    if rel.from_table.to_lowercase() == from {
        JoinStep {
            left_table: rel.from_table.clone(),
            left_column: rel.from_column.clone(),
            right_table: rel.to_table.clone(),
            right_column: rel.to_column.clone(),
            origin: rel.origin,
        }
    } else {
        JoinStep {
            left_table: rel.to_table.clone(),
            left_column: rel.to_column.clone(),
            right_table: rel.from_table.clone(),
            right_column: rel.from_column.clone(),
            origin: rel.origin,
        }
    }
}
