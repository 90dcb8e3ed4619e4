/// Petgraph representation of a deployed process
///
/// Activities become graph nodes and sequence flows become edges. Unlike a
/// DAG, BPMN processes may loop, so the graph is only checked for reachability.

use crate::engine::parser::{ActivityKind, ActivityModel, ProcessModel, SequenceFlowModel};
use crate::error::{PlatformError, Result};
use parking_lot::RwLock;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Sequence flow plus its position in the model, so outgoing flows are
/// evaluated in document order
#[derive(Debug, Clone)]
struct FlowEdge {
    order: usize,
    flow: SequenceFlowModel,
}

/// Flow graph of one process
#[derive(Debug)]
pub struct ProcessGraph {
    process_id: String,
    graph: DiGraph<ActivityModel, FlowEdge>,
    node_id_to_index: HashMap<String, NodeIndex>,
    start_index: NodeIndex,
}

impl ProcessGraph {
    /// Build the graph, rejecting dangling flows
    pub fn build(process: &ProcessModel) -> Result<Self> {
        tracing::debug!("🏗️ Building process graph for '{}'", process.id);

        let mut graph = DiGraph::new();
        let mut node_id_to_index = HashMap::new();
        for activity in &process.activities {
            let index = graph.add_node(activity.clone());
            node_id_to_index.insert(activity.id.clone(), index);
        }

        for (order, flow) in process.flows.iter().enumerate() {
            let from = node_id_to_index.get(&flow.source).ok_or_else(|| {
                PlatformError::Validation(format!("Sequence flow '{}' references unknown activity: {}", flow.id, flow.source))
            })?;
            let to = node_id_to_index.get(&flow.target).ok_or_else(|| {
                PlatformError::Validation(format!("Sequence flow '{}' references unknown activity: {}", flow.id, flow.target))
            })?;
            graph.add_edge(*from, *to, FlowEdge { order, flow: flow.clone() });
        }

        let start_index = process
            .activities
            .iter()
            .find(|a| a.kind == ActivityKind::StartEvent)
            .and_then(|a| node_id_to_index.get(&a.id).copied())
            .ok_or_else(|| PlatformError::Validation(format!("Process '{}' has no start event", process.id)))?;

        let process_graph = Self {
            process_id: process.id.clone(),
            graph,
            node_id_to_index,
            start_index,
        };

        let reachable = process_graph.find_reachable_nodes(start_index);
        if reachable.len() < process_graph.graph.node_count() {
            tracing::warn!(
                "⚠️ Process '{}' has {} activities unreachable from its start event",
                process.id,
                process_graph.graph.node_count() - reachable.len()
            );
        }

        Ok(process_graph)
    }

    /// Process id
    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    /// The start event
    pub fn start_activity(&self) -> &ActivityModel {
        &self.graph[self.start_index]
    }

    /// Activity by id
    pub fn activity(&self, id: &str) -> Option<&ActivityModel> {
        self.node_id_to_index.get(id).map(|index| &self.graph[*index])
    }

    /// Outgoing flows of `id` in document order
    pub fn outgoing(&self, id: &str) -> Vec<&SequenceFlowModel> {
        let Some(index) = self.node_id_to_index.get(id) else {
            return Vec::new();
        };
        let mut edges: Vec<&FlowEdge> = self.graph.edges(*index).map(|edge| edge.weight()).collect();
        edges.sort_by_key(|edge| edge.order);
        edges.into_iter().map(|edge| &edge.flow).collect()
    }

    /// All nodes reachable from `start` (breadth first)
    fn find_reachable_nodes(&self, start: NodeIndex) -> HashSet<NodeIndex> {
        let mut reachable = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(start);
        reachable.insert(start);

        while let Some(current) = queue.pop_front() {
            for target in self.graph.neighbors(current) {
                if reachable.insert(target) {
                    queue.push_back(target);
                }
            }
        }
        reachable
    }
}

/// Definition id → compiled graph
#[derive(Debug, Default)]
pub struct GraphCache {
    graphs: RwLock<HashMap<String, Arc<ProcessGraph>>>,
}

impl GraphCache {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Graph of a definition, built on first use
    pub fn get_or_build(&self, definition_id: &str, process: &ProcessModel) -> Result<Arc<ProcessGraph>> {
        if let Some(graph) = self.graphs.read().get(definition_id) {
            return Ok(Arc::clone(graph));
        }
        let graph = Arc::new(ProcessGraph::build(process)?);
        self.graphs
            .write()
            .insert(definition_id.to_string(), Arc::clone(&graph));
        Ok(graph)
    }

    /// Drop every cached graph
    pub fn clear(&self) {
        self.graphs.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn activity(id: &str, kind: ActivityKind) -> ActivityModel {
        ActivityModel {
            id: id.to_string(),
            name: None,
            kind,
            async_before: false,
            default_flow: None,
        }
    }

    fn flow(id: &str, source: &str, target: &str) -> SequenceFlowModel {
        SequenceFlowModel {
            id: id.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            condition: None,
        }
    }

    #[test]
    fn test_outgoing_flows_keep_document_order() {
        let process = ProcessModel {
            id: "p".to_string(),
            executable: true,
            activities: vec![
                activity("start", ActivityKind::StartEvent),
                activity("gw", ActivityKind::ExclusiveGateway),
                activity("a", ActivityKind::Task),
                activity("b", ActivityKind::Task),
            ],
            flows: vec![
                flow("f0", "start", "gw"),
                flow("f1", "gw", "a"),
                flow("f2", "gw", "b"),
                flow("loop", "a", "gw"),
            ],
            ..Default::default()
        };

        let graph = ProcessGraph::build(&process).unwrap();
        assert_eq!(graph.start_activity().id, "start");
        let ids: Vec<&str> = graph.outgoing("gw").iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["f1", "f2"]);
        assert!(graph.outgoing("b").is_empty());
    }
}
