// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};

use super::{EdgeSpec, OperatingMode, StageSpec};
use crate::core::frames::StageId;
use crate::core::selector::HoldSide;
use crate::core::{PipelineError, Result};

/// Stages and connections of one operating mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub mode: OperatingMode,
    pub stages: Vec<StageSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
    /// How long a stage waits on its input queue before logging and retrying.
    pub input_timeout_ms: u64,
    /// How long a stage waits for its hardware to finish one request.
    pub completion_timeout_ms: u64,
}

impl Topology {
    pub fn input_timeout(&self) -> Duration {
        Duration::from_millis(self.input_timeout_ms)
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_ms)
    }

    pub fn stage(&self, id: StageId) -> Option<&StageSpec> {
        self.stages.iter().find(|s| s.id == id)
    }

    pub fn require_stage(&self, id: StageId) -> Result<&StageSpec> {
        self.stage(id)
            .ok_or_else(|| PipelineError::NotFound(format!("stage {} in {:?}", id, self.mode)))
    }

    pub fn parent_of(&self, id: StageId) -> Option<StageId> {
        self.edges.iter().find(|e| e.to == id).map(|e| e.from)
    }

    pub fn children_of(&self, id: StageId) -> Vec<&EdgeSpec> {
        self.edges.iter().filter(|e| e.from == id).collect()
    }

    /// Stages with no upstream.
    pub fn roots(&self) -> Vec<StageId> {
        self.stages
            .iter()
            .filter(|s| self.parent_of(s.id).is_none())
            .map(|s| s.id)
            .collect()
    }

    /// Every pool a stage of this topology draws from.
    pub fn pool_names(&self) -> BTreeSet<String> {
        self.stages
            .iter()
            .flat_map(|s| s.dst_pool.iter().chain(s.src_pool.iter()))
            .cloned()
            .collect()
    }

    pub fn held_stages(&self) -> Vec<(StageId, HoldSide)> {
        self.stages
            .iter()
            .filter_map(|s| s.hold.map(|side| (s.id, side)))
            .collect()
    }

    fn graph(&self) -> Result<(DiGraph<StageId, usize>, HashMap<StageId, NodeIndex>)> {
        let mut graph = DiGraph::new();
        let mut nodes = HashMap::new();
        for stage in &self.stages {
            if nodes.insert(stage.id, graph.add_node(stage.id)).is_some() {
                return Err(PipelineError::Graph(format!("duplicate stage {}", stage.id)));
            }
        }
        for edge in &self.edges {
            let lookup = |id: StageId| {
                nodes.get(&id).copied().ok_or_else(|| {
                    PipelineError::Graph(format!(
                        "edge {} -> {} references unknown stage {}",
                        edge.from, edge.to, id
                    ))
                })
            };
            let (from, to) = (lookup(edge.from)?, lookup(edge.to)?);
            graph.add_edge(from, to, edge.queue_depth);
        }
        Ok((graph, nodes))
    }

    /// Reject graphs the dispatcher cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(PipelineError::Graph(format!("{:?} has no stages", self.mode)));
        }
        if self.input_timeout_ms == 0 || self.completion_timeout_ms == 0 {
            return Err(PipelineError::Configuration(
                "stage timeouts must be non-zero".into(),
            ));
        }

        let (graph, _) = self.graph()?;
        if is_cyclic_directed(&graph) {
            return Err(PipelineError::Graph("stage graph contains cycles".into()));
        }

        let mut upstream: HashMap<StageId, StageId> = HashMap::new();
        for edge in &self.edges {
            if edge.from == edge.to {
                return Err(PipelineError::Graph(format!("{} feeds itself", edge.from)));
            }
            if edge.queue_depth == 0 {
                return Err(PipelineError::Graph(format!(
                    "edge {} -> {} has zero queue depth",
                    edge.from, edge.to
                )));
            }
            if let Some(previous) = upstream.insert(edge.to, edge.from) {
                return Err(PipelineError::Graph(format!(
                    "{} has two upstream stages ({} and {})",
                    edge.to, previous, edge.from
                )));
            }
        }

        for stage in &self.stages {
            self.validate_stage(stage)?;
        }
        Ok(())
    }

    fn validate_stage(&self, stage: &StageSpec) -> Result<()> {
        let fail = |reason: &str| Err(PipelineError::Graph(format!("{}: {}", stage.id, reason)));

        if stage.kind.produces_output() && stage.dst_pool.is_none() {
            return fail("produces output but has no destination pool");
        }
        match self.parent_of(stage.id) {
            Some(parent) => {
                let parent_kind = self.require_stage(parent)?.kind;
                if stage.kind.needs_input() && !parent_kind.produces_output() {
                    return fail("needs input but its upstream produces none");
                }
            }
            None => {
                if stage.kind.needs_input() && stage.src_pool.is_none() {
                    return fail("root stage needs input but names no source pool");
                }
            }
        }
        if stage.regenerate && self.parent_of(stage.id).is_some() {
            return fail("only root stages can regenerate frames");
        }
        match stage.hold {
            Some(HoldSide::Destination) if !stage.kind.produces_output() => {
                fail("holds a destination it never produces")
            }
            Some(HoldSide::Source) if !stage.kind.needs_input() => {
                fail("holds a source it never consumes")
            }
            _ => Ok(()),
        }
    }

    /// Parents before children.
    pub fn topological_order(&self) -> Result<Vec<StageId>> {
        let (graph, _) = self.graph()?;
        let sorted = toposort(&graph, None)
            .map_err(|_| PipelineError::Graph("stage graph contains cycles".into()))?;
        Ok(sorted.into_iter().map(|idx| graph[idx]).collect())
    }

    /// Children before parents, for stopping.
    pub fn teardown_order(&self) -> Result<Vec<StageId>> {
        let mut order = self.topological_order()?;
        order.reverse();
        Ok(order)
    }
}
