//! Operation dependency graph and planning queries.
//!
//! Ordering uses Kahn's algorithm: zero in-degree nodes are repeatedly removed,
//! cheapest (`estimated_cost`) first with declaration order breaking ties. If
//! nodes remain when nothing is removable, the remainder contains a cycle,
//! which is extracted and reported in [`MigrateError::CycleDetected`].

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::error::{MigrateError, Result};

use super::operation::{OperationDefinition, OperationInstance, OperationType, ValidationReport};

/// Validated, acyclic set of operation definitions.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Definitions in declaration order.
    definitions: Vec<OperationDefinition>,
    index: HashMap<OperationType, usize>,
    /// Node indices in deterministic topological order.
    order: Vec<usize>,
}

/// Serializable view of a graph for display.
#[derive(Debug, Clone, Serialize)]
pub struct GraphSnapshot {
    pub operations: Vec<OperationDefinition>,
    /// `(dependency, dependent)` pairs.
    pub edges: Vec<(OperationType, OperationType)>,
    pub order: Vec<OperationType>,
}

impl DependencyGraph {
    /// Build a graph, rejecting duplicates, unknown dependencies and cycles.
    pub fn build(operations: Vec<OperationDefinition>) -> Result<Self> {
        let mut index = HashMap::with_capacity(operations.len());
        for (i, def) in operations.iter().enumerate() {
            if index.insert(def.op_type, i).is_some() {
                return Err(MigrateError::validation(format!(
                    "operation {} declared more than once",
                    def.op_type
                )));
            }
        }

        for def in &operations {
            for dep in &def.dependencies {
                if !index.contains_key(dep) {
                    return Err(MigrateError::validation(format!(
                        "operation {} depends on undeclared operation {}",
                        def.op_type, dep
                    )));
                }
            }
        }

        let order = kahn_order(&operations, &index)?;
        debug!("Built operation graph with {} nodes", operations.len());

        Ok(Self {
            definitions: operations,
            index,
            order,
        })
    }

    /// All operations, every dependency before its dependents.
    pub fn topological_order(&self) -> Vec<OperationType> {
        self.order
            .iter()
            .map(|&i| self.definitions[i].op_type)
            .collect()
    }

    /// `goal` plus its transitive dependencies, in topological order.
    ///
    /// Optional operations enter the set only through a dependency edge from
    /// an operation that is already included.
    pub fn minimal_operation_set(&self, goal: OperationType) -> Result<Vec<OperationType>> {
        let start = *self
            .index
            .get(&goal)
            .ok_or(MigrateError::UnknownOperation(goal))?;

        let mut included = HashSet::new();
        included.insert(start);

        let mut queue = VecDeque::from([start]);
        while let Some(node) = queue.pop_front() {
            for dep in &self.definitions[node].dependencies {
                let dep_idx = self.index[dep];
                if included.insert(dep_idx) {
                    queue.push_back(dep_idx);
                }
            }
        }

        Ok(self
            .order
            .iter()
            .filter(|i| included.contains(i))
            .map(|&i| self.definitions[i].op_type)
            .collect())
    }

    /// Union of the minimal sets of several goals, in topological order.
    pub fn minimal_operation_set_for(&self, goals: &[OperationType]) -> Result<Vec<OperationType>> {
        let mut wanted = HashSet::new();
        for goal in goals {
            wanted.extend(self.minimal_operation_set(*goal)?);
        }
        Ok(self
            .topological_order()
            .into_iter()
            .filter(|op| wanted.contains(op))
            .collect())
    }

    /// Check params and ordering of a submitted operation sequence.
    pub fn validate_operations(&self, ops: &[OperationInstance]) -> ValidationReport {
        let mut errors = Vec::new();
        let mut seen: HashSet<OperationType> = HashSet::new();

        for (pos, instance) in ops.iter().enumerate() {
            let Some(def) = self.get(instance.op_type) else {
                errors.push(format!(
                    "#{} {}: operation is not part of this graph",
                    pos + 1,
                    instance.op_type
                ));
                seen.insert(instance.op_type);
                continue;
            };

            for param in &def.required_params {
                let present = instance
                    .params
                    .get(param)
                    .map_or(false, |v| !v.is_null());
                if !present {
                    errors.push(format!(
                        "#{} {}: missing required parameter '{}'",
                        pos + 1,
                        instance.op_type,
                        param
                    ));
                }
            }

            for dep in &def.dependencies {
                if !seen.contains(dep) {
                    errors.push(format!(
                        "#{} {}: dependency {} must appear earlier",
                        pos + 1,
                        instance.op_type,
                        dep
                    ));
                }
            }

            seen.insert(instance.op_type);
        }

        ValidationReport {
            valid: errors.is_empty(),
            errors,
        }
    }

    pub fn get(&self, op: OperationType) -> Option<&OperationDefinition> {
        self.index.get(&op).map(|&i| &self.definitions[i])
    }

    pub fn contains(&self, op: OperationType) -> bool {
        self.index.contains_key(&op)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Sum of estimated costs along the given operations.
    pub fn estimated_cost(&self, ops: &[OperationType]) -> Duration {
        ops.iter()
            .filter_map(|op| self.get(*op))
            .map(|def| def.estimated_cost)
            .sum()
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        let edges = self
            .definitions
            .iter()
            .flat_map(|def| def.dependencies.iter().map(move |dep| (*dep, def.op_type)))
            .collect();

        GraphSnapshot {
            operations: self.definitions.clone(),
            edges,
            order: self.topological_order(),
        }
    }
}

fn kahn_order(
    definitions: &[OperationDefinition],
    index: &HashMap<OperationType, usize>,
) -> Result<Vec<usize>> {
    let n = definitions.len();
    let mut in_degree = vec![0usize; n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];

    for (i, def) in definitions.iter().enumerate() {
        in_degree[i] = def.dependencies.len();
        for dep in &def.dependencies {
            dependents[index[dep]].push(i);
        }
    }

    let mut ready: BinaryHeap<Reverse<(Duration, usize)>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, &d)| d == 0)
        .map(|(i, _)| Reverse((definitions[i].estimated_cost, i)))
        .collect();

    let mut order = Vec::with_capacity(n);
    while let Some(Reverse((_, node))) = ready.pop() {
        order.push(node);
        for &next in &dependents[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push(Reverse((definitions[next].estimated_cost, next)));
            }
        }
    }

    if order.len() < n {
        let residual: Vec<usize> = (0..n).filter(|i| in_degree[*i] > 0).collect();
        let cycle = extract_cycle(definitions, index, &residual);
        return Err(MigrateError::CycleDetected { cycle });
    }

    Ok(order)
}

/// Walk dependency edges inside the residual set until a node repeats.
///
/// Every residual node has at least one dependency that is also residual, so
/// the walk always closes. The returned sequence starts and ends with the same
/// operation; each entry depends on the one after it.
fn extract_cycle(
    definitions: &[OperationDefinition],
    index: &HashMap<OperationType, usize>,
    residual: &[usize],
) -> Vec<OperationType> {
    let in_residual: HashSet<usize> = residual.iter().copied().collect();
    let Some(&first) = residual.first() else {
        return Vec::new();
    };

    let mut path: Vec<usize> = Vec::new();
    let mut position: HashMap<usize, usize> = HashMap::new();
    let mut node = first;

    loop {
        if let Some(&start) = position.get(&node) {
            let mut cycle: Vec<OperationType> =
                path[start..].iter().map(|&i| definitions[i].op_type).collect();
            cycle.push(definitions[node].op_type);
            return cycle;
        }
        position.insert(node, path.len());
        path.push(node);

        let next = definitions[node]
            .dependencies
            .iter()
            .map(|dep| index[dep])
            .filter(|i| in_residual.contains(i))
            .min();
        match next {
            Some(n) => node = n,
            // Unreachable for a well-formed residual; report it verbatim.
            None => return residual.iter().map(|&i| definitions[i].op_type).collect(),
        }
    }
}
