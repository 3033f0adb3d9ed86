//! Static analysis of a flow graph: ordering, validation, reachability.

use std::collections::{HashMap, HashSet, VecDeque};

use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::flow::{Edge, Flow, StepKind, MAX_PRIORITY};

use crate::registry::StepRegistry;

/// Declared edges plus one handle edge per `outputs` entry not already wired.
pub fn effective_edges(flow: &Flow) -> Vec<Edge> {
    let mut edges = flow.edges.clone();
    let mut seen: HashSet<(String, String, Option<String>)> = edges
        .iter()
        .map(|e| (e.source.clone(), e.target.clone(), e.source_handle.clone()))
        .collect();

    for node in &flow.nodes {
        let mut branches: Vec<(&String, &String)> = node.outputs.iter().collect();
        branches.sort();
        for (branch, target) in branches {
            let key = (node.id.clone(), target.clone(), Some(branch.clone()));
            if seen.insert(key) {
                edges.push(Edge::from_handle(node.id.as_str(), branch.as_str(), target.as_str()));
            }
        }
    }
    edges
}

/// Kahn's algorithm. Ties resolve in node declaration order, so the result is
/// deterministic. A short order means a cycle.
pub fn topological_order(flow: &Flow, edges: &[Edge]) -> Result<Vec<String>> {
    let position: HashMap<&str, usize> = flow
        .nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.id.as_str(), i))
        .collect();

    let mut in_degree = vec![0usize; flow.nodes.len()];
    let mut adjacency: Vec<Vec<usize>> = vec![vec![]; flow.nodes.len()];
    let mut wired: HashSet<(usize, usize)> = HashSet::new();
    for edge in edges {
        let (Some(&s), Some(&t)) = (
            position.get(edge.source.as_str()),
            position.get(edge.target.as_str()),
        ) else {
            continue;
        };
        if wired.insert((s, t)) {
            adjacency[s].push(t);
            in_degree[t] += 1;
        }
    }

    let mut queue: VecDeque<usize> = (0..flow.nodes.len()).filter(|i| in_degree[*i] == 0).collect();
    let mut order = Vec::with_capacity(flow.nodes.len());
    while let Some(i) = queue.pop_front() {
        order.push(flow.nodes[i].id.clone());
        let mut next: Vec<usize> = vec![];
        for &t in &adjacency[i] {
            in_degree[t] -= 1;
            if in_degree[t] == 0 {
                next.push(t);
            }
        }
        next.sort_unstable();
        queue.extend(next);
    }

    if order.len() != flow.nodes.len() {
        return Err(FlowgateError::CycleDetected {
            ordered: order.len(),
            total: flow.nodes.len(),
        });
    }
    Ok(order)
}

/// Every structural problem in `flow`. Empty means runnable.
pub fn validate_flow(flow: &Flow, registry: &StepRegistry) -> Vec<String> {
    let mut errors = vec![];

    if flow.id.trim().is_empty() {
        errors.push("flow id is empty".to_string());
    }
    if flow.priority > MAX_PRIORITY {
        errors.push(format!(
            "priority {} is outside 0..={}",
            flow.priority, MAX_PRIORITY
        ));
    }

    let mut ids = HashSet::new();
    for node in &flow.nodes {
        if node.id.trim().is_empty() {
            errors.push("node with empty id".to_string());
        } else if !ids.insert(node.id.as_str()) {
            errors.push(format!("duplicate node id '{}'", node.id));
        }
    }

    for edge in &flow.edges {
        for end in [&edge.source, &edge.target] {
            if !ids.contains(end.as_str()) {
                errors.push(format!("edge '{}' references unknown node '{}'", edge.id, end));
            }
        }
        if edge.source == edge.target {
            errors.push(format!("edge '{}' is a self-loop", edge.id));
        }
    }

    for node in &flow.nodes {
        for (branch, target) in &node.outputs {
            if !ids.contains(target.as_str()) {
                errors.push(format!(
                    "node '{}': output '{}' targets unknown node '{}'",
                    node.id, branch, target
                ));
            }
        }
        match registry.get(node.kind) {
            Some(step) => errors.extend(step.validate(node)),
            None => errors.push(format!(
                "node '{}': no executor registered for '{}'",
                node.id, node.kind
            )),
        }
    }

    // Ordering is only meaningful once ids are unique.
    if errors.is_empty() {
        if let Err(e) = topological_order(flow, &effective_edges(flow)) {
            errors.push(e.to_string());
        }
    }
    errors
}

/// Nodes that start a run: no incoming edges, and never an error handler.
pub fn roots(flow: &Flow, edges: &[Edge]) -> Vec<String> {
    let targets: HashSet<&str> = edges.iter().map(|e| e.target.as_str()).collect();
    flow.nodes
        .iter()
        .filter(|n| !targets.contains(n.id.as_str()) && n.kind != StepKind::ErrorHandler)
        .map(|n| n.id.clone())
        .collect()
}

/// `starts` plus everything reachable from them.
pub fn descendants(edges: &[Edge], starts: &[String]) -> HashSet<String> {
    let mut seen: HashSet<String> = starts.iter().cloned().collect();
    let mut queue: VecDeque<String> = starts.iter().cloned().collect();
    while let Some(id) = queue.pop_front() {
        for edge in edges.iter().filter(|e| e.source == id) {
            if seen.insert(edge.target.clone()) {
                queue.push_back(edge.target.clone());
            }
        }
    }
    seen
}
