// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Workflow DAG build: validation, cycle detection, ancestor sets, and the
//! per-node handle pairs that drive upstream parameter rewriting.
//!
//! A graph is built once per engine run (once per notebook, not once per
//! group) and snapshotted; executions take cheap copies of the dependency
//! sets for in-place removal.

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::error::SchedError;
use crate::store::{HandleTemplate, NodeType, WorkflowEdge, WorkflowNode};

/// Source/target handle pair of one incoming edge, resolved at build time.
#[derive(Debug, Clone)]
pub struct HandlePair {
    pub source_handle: HandleTemplate,
    pub target_handle: HandleTemplate,
    /// Absent when the upstream node was filtered out (disabled).
    pub source_node: Option<Uuid>,
}

impl HandlePair {
    /// Whether this edge carries a data dependency rather than only a
    /// ready signal.
    pub fn carries_data(&self) -> bool {
        self.source_handle.data_source == "executor"
            && self.source_handle.handle_key != "ready"
            && !self.source_handle.data_key.is_empty()
            && !self.target_handle.data_key.is_empty()
    }
}

/// Immutable build result shared across runs.
pub struct WorkflowGraph {
    nodes: HashMap<Uuid, WorkflowNode>,
    /// Full transitive ancestor set per node.
    ancestors: HashMap<Uuid, HashSet<Uuid>>,
    /// Incoming edge handle pairs per node (populated only when parameter
    /// translation is enabled).
    parent_pairs: HashMap<Uuid, Vec<HandlePair>>,
}

impl WorkflowGraph {
    /// Validate nodes and edges and build the execution graph.
    ///
    /// Disabled and group-typed nodes are filtered out before validation.
    pub fn build(
        all_nodes: &[WorkflowNode],
        edges: &[WorkflowEdge],
        handles: &[HandleTemplate],
        translate_node_param: bool,
    ) -> Result<Self, SchedError> {
        let mut nodes = HashMap::new();
        for node in all_nodes {
            if node.disabled || node.node_type == NodeType::Group {
                continue;
            }
            validate_node(node)?;
            nodes.insert(node.id, node.clone());
        }

        let mut children: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        let mut parents: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for edge in edges {
            if !nodes.contains_key(&edge.source_node) || !nodes.contains_key(&edge.target_node) {
                continue;
            }
            children.entry(edge.source_node).or_default().push(edge.target_node);
            parents.entry(edge.target_node).or_default().push(edge.source_node);
        }

        detect_cycle(&nodes, &children)?;

        let mut ancestors = HashMap::new();
        for id in nodes.keys() {
            let mut set = HashSet::new();
            collect_ancestors(*id, &parents, &mut set);
            ancestors.insert(*id, set);
        }

        let mut parent_pairs: HashMap<Uuid, Vec<HandlePair>> = HashMap::new();
        if translate_node_param {
            let handle_map: HashMap<Uuid, &HandleTemplate> =
                handles.iter().map(|h| (h.id, h)).collect();
            for edge in edges {
                let Some(target) = nodes.get(&edge.target_node) else { continue };
                let source_handle = handle_map.get(&edge.source_handle).ok_or_else(|| {
                    SchedError::MissingHandle(format!(
                        "node {}: source handle {}",
                        target.id, edge.source_handle
                    ))
                })?;
                let target_handle = handle_map.get(&edge.target_handle).ok_or_else(|| {
                    SchedError::MissingHandle(format!(
                        "node {}: target handle {}",
                        target.id, edge.target_handle
                    ))
                })?;
                parent_pairs.entry(edge.target_node).or_default().push(HandlePair {
                    source_handle: (*source_handle).clone(),
                    target_handle: (*target_handle).clone(),
                    // A filtered source means the parent was disabled.
                    source_node: nodes.contains_key(&edge.source_node).then_some(edge.source_node),
                });
            }
        }

        Ok(Self { nodes, ancestors, parent_pairs })
    }

    pub fn node(&self, id: Uuid) -> Option<&WorkflowNode> {
        self.nodes.get(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Incoming handle pairs for a node; empty when translation is off.
    pub fn parent_pairs(&self, id: Uuid) -> &[HandlePair] {
        self.parent_pairs.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Fresh dependency-set copy for one run; the scheduler removes
    /// completed nodes in place.
    pub fn dependencies(&self) -> HashMap<Uuid, HashSet<Uuid>> {
        self.ancestors.clone()
    }
}

/// Load a workflow's nodes, edges, and referenced handle templates from the
/// store and build the graph.
pub fn load_graph(
    store: &dyn crate::store::SchedStore,
    workflow_id: Uuid,
    translate_node_param: bool,
) -> Result<WorkflowGraph, SchedError> {
    let nodes = store.workflow_nodes(workflow_id)?;
    let node_ids: Vec<Uuid> = nodes.iter().map(|n| n.id).collect();
    let edges = store.workflow_edges(&node_ids)?;
    let handle_ids: Vec<Uuid> = edges
        .iter()
        .flat_map(|e| [e.source_handle, e.target_handle])
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    let handles = store.handle_templates(&handle_ids)?;
    WorkflowGraph::build(&nodes, &edges, &handles, translate_node_param)
}

fn validate_node(node: &WorkflowNode) -> Result<(), SchedError> {
    match node.node_type {
        NodeType::DeviceAction => {
            if node.device_name.as_deref().unwrap_or_default().is_empty() {
                return Err(SchedError::MissingDeviceName);
            }
            if node.action_name.is_empty() {
                return Err(SchedError::MissingActionName);
            }
            if node.action_type.is_empty() {
                return Err(SchedError::MissingActionType);
            }
        }
        NodeType::Script => {
            if node.script.as_deref().unwrap_or_default().is_empty() {
                return Err(SchedError::ScriptBodyEmpty);
            }
        }
        NodeType::Group => {}
    }
    Ok(())
}

/// DFS with a recursion stack.
fn detect_cycle(
    nodes: &HashMap<Uuid, WorkflowNode>,
    children: &HashMap<Uuid, Vec<Uuid>>,
) -> Result<(), SchedError> {
    let mut visited = HashSet::new();
    let mut stack = HashSet::new();
    for id in nodes.keys() {
        if !visited.contains(id) && dfs_has_cycle(*id, children, &mut visited, &mut stack) {
            return Err(SchedError::WorkflowHasCycle);
        }
    }
    Ok(())
}

fn dfs_has_cycle(
    id: Uuid,
    children: &HashMap<Uuid, Vec<Uuid>>,
    visited: &mut HashSet<Uuid>,
    stack: &mut HashSet<Uuid>,
) -> bool {
    visited.insert(id);
    stack.insert(id);
    if let Some(next) = children.get(&id) {
        for child in next {
            if !visited.contains(child) {
                if dfs_has_cycle(*child, children, visited, stack) {
                    return true;
                }
            } else if stack.contains(child) {
                return true;
            }
        }
    }
    stack.remove(&id);
    false
}

fn collect_ancestors(id: Uuid, parents: &HashMap<Uuid, Vec<Uuid>>, out: &mut HashSet<Uuid>) {
    if let Some(direct) = parents.get(&id) {
        for parent in direct {
            if out.insert(*parent) {
                collect_ancestors(*parent, parents, out);
            }
        }
    }
}

#[cfg(test)]
#[path = "graph_tests.rs"]
mod tests;
