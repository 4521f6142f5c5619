/// Execution order and input resolution
///
/// The order resolver is a depth-first traversal that visits every producer of a
/// node before the node itself. It is seeded at trigger-like nodes, then sweeps the
/// remaining nodes in declaration order so disconnected islands are still covered.
/// Cycles are not rejected here; the visited set breaks them. `find_cycles` lets the
/// engine detect them up front with petgraph.

use crate::workflow::types::{Node, WorkflowGraph};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

/// Input handed to a node handler
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInput {
    /// Last upstream output in connection-map order, or the run input when nothing feeds the node
    pub primary: Value,
    /// Every upstream output in connection-map order
    pub upstream: Vec<Value>,
}

/// Dependency-respecting order in which nodes are dispatched
///
/// Every declared node appears exactly once. Dangling connection names are skipped.
pub fn execution_order(graph: &WorkflowGraph) -> Vec<&Node> {
    let index = GraphIndex::new(graph);
    let mut visited = HashSet::new();
    let mut order = Vec::with_capacity(graph.nodes.len());

    for node in graph.nodes.iter().filter(|node| node.is_entry_point()) {
        index.visit(&node.name, &mut visited, &mut order);
    }

    for node in &graph.nodes {
        index.visit(&node.name, &mut visited, &mut order);
    }

    order
}

/// Name lookups built once per ordering pass
struct GraphIndex<'g> {
    nodes: HashMap<&'g str, &'g Node>,
    /// Producers of each target, in connection-map order
    producers: HashMap<&'g str, Vec<&'g str>>,
}

impl<'g> GraphIndex<'g> {
    fn new(graph: &'g WorkflowGraph) -> Self {
        let mut nodes = HashMap::with_capacity(graph.nodes.len());
        for node in &graph.nodes {
            nodes.entry(node.name.as_str()).or_insert(node);
        }

        let mut producers: HashMap<&str, Vec<&str>> = HashMap::new();
        for connection in &graph.connections {
            let mut targets = HashSet::new();
            for target in &connection.targets {
                if targets.insert(target.as_str()) {
                    producers.entry(target.as_str()).or_default().push(connection.source.as_str());
                }
            }
        }

        Self { nodes, producers }
    }

    fn producers_of(&self, name: &str) -> std::vec::IntoIter<&'g str> {
        self.producers.get(name).cloned().unwrap_or_default().into_iter()
    }

    /// Post-order walk from `root`: producers first, then the node itself
    ///
    /// Uses an explicit stack so arbitrarily long chains do not exhaust the thread stack.
    fn visit(&self, root: &'g str, visited: &mut HashSet<&'g str>, order: &mut Vec<&'g Node>) {
        if !visited.insert(root) {
            return;
        }

        let Some(&node) = self.nodes.get(root) else {
            tracing::debug!("⏭️ Skipping dangling node reference: {}", root);
            return;
        };

        let mut stack = vec![(node, self.producers_of(root))];

        loop {
            let next = match stack.last_mut() {
                Some((_, producers)) => producers.next(),
                None => break,
            };

            match next {
                Some(source) => {
                    if !visited.insert(source) {
                        continue;
                    }
                    match self.nodes.get(source) {
                        Some(&producer) => stack.push((producer, self.producers_of(source))),
                        None => tracing::debug!("⏭️ Skipping dangling node reference: {}", source),
                    }
                }
                None => {
                    if let Some((finished, _)) = stack.pop() {
                        order.push(finished);
                    }
                }
            }
        }
    }
}

/// Outputs of every upstream node that already finished, in connection-map order
pub fn resolve_inputs(graph: &WorkflowGraph, node_name: &str, outputs: &Map<String, Value>) -> Vec<Value> {
    graph.sources_of(node_name)
        .filter_map(|source| outputs.get(source).cloned())
        .collect()
}

/// Last-writer-wins input for a node, falling back to the run input
pub fn resolve_input(
    graph: &WorkflowGraph,
    node_name: &str,
    outputs: &Map<String, Value>,
    run_input: &Value,
) -> NodeInput {
    let upstream = resolve_inputs(graph, node_name, outputs);
    let primary = upstream.last().cloned().unwrap_or_else(|| run_input.clone());
    NodeInput { primary, upstream }
}

/// Names of the nodes that sit on a directed cycle, in declaration order
///
/// Self-loops count. Connections naming unknown nodes are ignored.
pub fn find_cycles(graph: &WorkflowGraph) -> Vec<String> {
    let mut dag: DiGraph<&str, ()> = DiGraph::new();
    let mut index_of: HashMap<&str, NodeIndex> = HashMap::new();

    for node in &graph.nodes {
        index_of.entry(node.name.as_str())
            .or_insert_with(|| dag.add_node(node.name.as_str()));
    }

    for connection in &graph.connections {
        let Some(&from) = index_of.get(connection.source.as_str()) else { continue };
        for target in &connection.targets {
            if let Some(&to) = index_of.get(target.as_str()) {
                dag.add_edge(from, to, ());
            }
        }
    }

    let mut cyclic: HashSet<&str> = HashSet::new();
    for component in tarjan_scc(&dag) {
        if component.len() > 1 {
            cyclic.extend(component.iter().map(|&idx| dag[idx]));
        } else if let Some(&idx) = component.first() {
            if dag.contains_edge(idx, idx) {
                cyclic.insert(dag[idx]);
            }
        }
    }

    let mut seen = HashSet::new();
    graph.nodes.iter()
        .map(|node| node.name.as_str())
        .filter(|name| cyclic.contains(name) && seen.insert(*name))
        .map(str::to_string)
        .collect()
}
