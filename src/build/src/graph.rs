//! Stage graph resolution.
//!
//! Stages reference each other through `COPY --from=<stage>` and
//! `FROM <stage>`. The resolver turns those references into a DAG, rejects
//! cycles, and keeps only the stages the build target transitively needs.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

use a3s_forge_core::error::{ForgeError, Result};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use petgraph::Direction;
use serde::{Deserialize, Serialize};

use crate::instruction::Instruction;

/// A named build stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub instructions: Vec<Instruction>,
}

impl Stage {
    pub fn new(name: impl Into<String>, instructions: Vec<Instruction>) -> Self {
        Self {
            name: name.into(),
            instructions,
        }
    }
}

/// How one stage uses another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefKind {
    /// `FROM <stage>`: the stage continues the referenced chain
    Base,
    /// `COPY --from=<stage>`: the referenced tip is a copy source
    CopySource,
}

/// A resolved stage reference: the text as written, how it is used, and
/// the stage ordinal it points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageRef {
    pub reference: String,
    pub kind: RefKind,
    pub ordinal: usize,
}

/// Execution plan for one build target.
#[derive(Debug, Clone)]
pub struct BuildPlan {
    stages: Vec<Stage>,
    target: usize,
    /// Required stages, dependencies first, ties broken by ordinal
    order: Vec<usize>,
    references: HashMap<usize, Vec<StageRef>>,
    graph: DiGraph<usize, ()>,
    nodes: Vec<NodeIndex>,
}

impl BuildPlan {
    pub fn target(&self) -> &Stage {
        &self.stages[self.target]
    }

    pub fn target_ordinal(&self) -> usize {
        self.target
    }

    pub fn stage(&self, ordinal: usize) -> &Stage {
        &self.stages[ordinal]
    }

    /// Ordinals of the required stages in execution order.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Required stages in execution order.
    pub fn stages(&self) -> impl Iterator<Item = &Stage> {
        self.order.iter().map(|&i| &self.stages[i])
    }

    pub fn is_required(&self, ordinal: usize) -> bool {
        self.order.contains(&ordinal)
    }

    /// Names of stages the target does not need.
    pub fn skipped(&self) -> Vec<&str> {
        (0..self.stages.len())
            .filter(|i| !self.is_required(*i))
            .map(|i| self.stages[i].name.as_str())
            .collect()
    }

    /// Stage references made by `ordinal`, resolved.
    pub fn references(&self, ordinal: usize) -> &[StageRef] {
        self.references
            .get(&ordinal)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Direct dependencies of `ordinal`, deduplicated.
    pub fn dependencies(&self, ordinal: usize) -> BTreeSet<usize> {
        self.graph
            .neighbors_directed(self.nodes[ordinal], Direction::Incoming)
            .map(|n| self.graph[n])
            .collect()
    }

    /// Required stages that depend on `ordinal`, directly or transitively.
    pub fn dependents(&self, ordinal: usize) -> BTreeSet<usize> {
        let mut out = BTreeSet::new();
        let mut dfs = Dfs::new(&self.graph, self.nodes[ordinal]);
        while let Some(node) = dfs.next(&self.graph) {
            let i = self.graph[node];
            if i != ordinal && self.is_required(i) {
                out.insert(i);
            }
        }
        out
    }
}

/// Resolve `stages` into a plan for `target` (a stage name or ordinal).
///
/// Fails on duplicate stage names, an unknown target, a `COPY --from`
/// naming no stage, or any cycle. A `FROM` names a stage only when a stage
/// with that name is defined earlier; otherwise it is an external image.
pub fn resolve(stages: &[Stage], target: &str) -> Result<BuildPlan> {
    let mut by_name: HashMap<&str, usize> = HashMap::new();
    for (ordinal, stage) in stages.iter().enumerate() {
        if by_name.insert(stage.name.as_str(), ordinal).is_some() {
            return Err(ForgeError::DuplicateStage(stage.name.clone()));
        }
    }

    let lookup = |reference: &str| -> Option<usize> {
        by_name.get(reference).copied().or_else(|| {
            reference
                .parse::<usize>()
                .ok()
                .filter(|&i| i < stages.len())
        })
    };

    let target = lookup(target).ok_or_else(|| ForgeError::UnknownTarget(target.to_string()))?;

    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let nodes: Vec<NodeIndex> = (0..stages.len()).map(|i| graph.add_node(i)).collect();
    let mut references: HashMap<usize, Vec<StageRef>> = HashMap::new();

    for (ordinal, stage) in stages.iter().enumerate() {
        for instruction in &stage.instructions {
            let resolved = if let Some(reference) = instruction.copy_source_stage() {
                let dep = lookup(reference).ok_or_else(|| ForgeError::UnknownStage {
                    name: reference.to_string(),
                    referenced_by: stage.name.clone(),
                })?;
                Some((reference, RefKind::CopySource, dep))
            } else if let Some(reference) = instruction.from_reference() {
                by_name
                    .get(reference)
                    .copied()
                    .filter(|&dep| dep < ordinal)
                    .map(|dep| (reference, RefKind::Base, dep))
            } else {
                None
            };

            if let Some((reference, kind, dep)) = resolved {
                let refs = references.entry(ordinal).or_default();
                if !refs.iter().any(|r| r.reference == reference && r.kind == kind) {
                    refs.push(StageRef {
                        reference: reference.to_string(),
                        kind,
                        ordinal: dep,
                    });
                    graph.update_edge(nodes[dep], nodes[ordinal], ());
                }
            }
        }
    }

    toposort(&graph, None).map_err(|cycle| ForgeError::CycleDetected {
        stage: stages[graph[cycle.node_id()]].name.clone(),
    })?;

    // Everything the target reaches through incoming edges
    let mut required = vec![false; stages.len()];
    let reversed = petgraph::visit::Reversed(&graph);
    let mut dfs = Dfs::new(reversed, nodes[target]);
    while let Some(node) = dfs.next(reversed) {
        required[graph[node]] = true;
    }

    // Kahn's algorithm over the required subgraph, lowest ordinal first
    let mut in_degree: HashMap<usize, usize> = HashMap::new();
    for i in (0..stages.len()).filter(|&i| required[i]) {
        let deps = graph
            .neighbors_directed(nodes[i], Direction::Incoming)
            .filter(|&n| required[graph[n]])
            .count();
        in_degree.insert(i, deps);
    }
    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .filter(|&(_, &d)| d == 0)
        .map(|(&i, _)| Reverse(i))
        .collect();
    let mut order = Vec::new();
    while let Some(Reverse(i)) = ready.pop() {
        order.push(i);
        for n in graph.neighbors_directed(nodes[i], Direction::Outgoing) {
            let dependent = graph[n];
            if let Some(d) = in_degree.get_mut(&dependent) {
                *d -= 1;
                if *d == 0 {
                    ready.push(Reverse(dependent));
                }
            }
        }
    }

    tracing::debug!(
        target_stage = %stages[target].name,
        required = order.len(),
        total = stages.len(),
        "Resolved stage graph"
    );

    Ok(BuildPlan {
        stages: stages.to_vec(),
        target,
        order,
        references,
        graph,
        nodes,
    })
}
