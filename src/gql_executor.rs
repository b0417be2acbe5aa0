//! Graph command executor
//!
//! [`GraphEngine`] owns the authoritative [`GraphMap`] and applies statement
//! batches to it. One call is one transaction:
//!
//! 1. parse the text into commands (`Parsing`)
//! 2. apply each command, buffering one change record per mutated entity
//!    (`Applying`)
//! 3. on success hand the records to the change-trace sink (`Committed`);
//!    on any failure revert the whole batch (`Failed`)
//!
//! The engine is back in `Idle` once a call returns; the outcome stays
//! available through [`GraphEngine::last_outcome`]. Callers that must persist
//! a batch before it is logged split the call with [`GraphEngine::stage`],
//! then [`GraphEngine::commit`] or [`GraphEngine::abort`].

use crate::change_log::{ChangeTraceSink, ChangeTrx, TracingChangeSink};
use crate::error::{GraphError, Result};
use crate::gql_ast::*;
use crate::gql_compiler::parse_commands;
use crate::graph::{edge_order, GraphEdge, GraphMap, GraphNode};
use crate::transaction::{BatchTransaction, ExecutionState};
use crate::types::now;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Node or edge set captured by `as alias`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum AliasResult {
    Nodes(Vec<GraphNode>),
    Edges(Vec<GraphEdge>),
}

/// Outcome of one execution call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    pub trx_id: String,
    /// Nodes selected by the batch's `select` statements.
    pub nodes: Vec<GraphNode>,
    /// Edges selected by the batch's `select` statements.
    pub edges: Vec<GraphEdge>,
    pub aliases: BTreeMap<String, AliasResult>,
    /// Committed change records, in apply order.
    pub changes: Vec<ChangeTrx>,
}

impl QueryResult {
    fn new(trx_id: &str) -> Self {
        QueryResult {
            trx_id: trx_id.to_string(),
            ..QueryResult::default()
        }
    }

    pub fn is_mutation(&self) -> bool {
        !self.changes.is_empty()
    }

    pub fn node(&self, key: &str) -> Option<&GraphNode> {
        let key = key.to_lowercase();
        self.nodes.iter().find(|n| n.key == key)
    }

    pub fn alias_nodes(&self, alias: &str) -> Option<&[GraphNode]> {
        match self.aliases.get(&alias.to_lowercase()) {
            Some(AliasResult::Nodes(nodes)) => Some(nodes),
            _ => None,
        }
    }

    pub fn alias_edges(&self, alias: &str) -> Option<&[GraphEdge]> {
        match self.aliases.get(&alias.to_lowercase()) {
            Some(AliasResult::Edges(edges)) => Some(edges),
            _ => None,
        }
    }
}

/// A batch applied to the map whose records have not reached the sink yet.
///
/// Must be handed back to [`GraphEngine::commit`] or [`GraphEngine::abort`]
/// before the engine accepts another call.
#[derive(Debug)]
#[must_use = "a staged batch must be committed or aborted"]
pub struct StagedBatch {
    trx: BatchTransaction,
    result: QueryResult,
    statements: usize,
}

impl StagedBatch {
    pub fn trx_id(&self) -> &str {
        self.trx.trx_id()
    }

    pub fn is_mutation(&self) -> bool {
        !self.trx.is_empty()
    }
}

pub struct GraphEngine {
    map: GraphMap,
    sink: Arc<dyn ChangeTraceSink>,
    state: ExecutionState,
    last_outcome: Option<ExecutionState>,
}

impl GraphEngine {
    pub fn new() -> Self {
        Self::with_map(GraphMap::new())
    }

    pub fn with_map(map: GraphMap) -> Self {
        GraphEngine {
            map,
            sink: Arc::new(TracingChangeSink),
            state: ExecutionState::Idle,
            last_outcome: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ChangeTraceSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn map(&self) -> &GraphMap {
        &self.map
    }

    pub fn into_map(self) -> GraphMap {
        self.map
    }

    /// Swap in a freshly loaded map, returning the previous one.
    pub fn replace_map(&mut self, map: GraphMap) -> GraphMap {
        std::mem::replace(&mut self.map, map)
    }

    /// Current state: `Idle` between calls, `Applying` while a staged batch
    /// is pending.
    pub fn state(&self) -> ExecutionState {
        self.state
    }

    /// `Committed` or `Failed` for the last finished call, `None` before the
    /// first.
    pub fn last_outcome(&self) -> Option<ExecutionState> {
        self.last_outcome
    }

    /// Parse and apply a statement batch as one transaction.
    pub fn execute(&mut self, query: &str) -> Result<QueryResult> {
        let staged = self.stage(query)?;
        self.commit(staged)
    }

    /// Apply already compiled commands as one transaction.
    pub fn execute_commands(&mut self, commands: &[GraphCommand]) -> Result<QueryResult> {
        let staged = self.stage_commands(commands)?;
        self.commit(staged)
    }

    /// Parse and apply a batch without delivering its records.
    pub fn stage(&mut self, query: &str) -> Result<StagedBatch> {
        self.ensure_idle()?;
        self.state = ExecutionState::Parsing;

        let commands = match parse_commands(query) {
            Ok(commands) => commands,
            Err(e) => {
                self.finish(ExecutionState::Failed);
                debug!(error = %e, "query rejected");
                return Err(e);
            }
        };

        self.apply_all(&commands)
    }

    /// Apply compiled commands without delivering their records.
    pub fn stage_commands(&mut self, commands: &[GraphCommand]) -> Result<StagedBatch> {
        self.ensure_idle()?;
        self.apply_all(commands)
    }

    /// Deliver a staged batch to the sink. A sink failure reverts the batch.
    pub fn commit(&mut self, staged: StagedBatch) -> Result<QueryResult> {
        let StagedBatch { trx, mut result, statements } = staged;

        if let Err(e) = trx.commit(self.sink.as_ref()) {
            let reverted = trx.rollback(&mut self.map);
            self.finish(ExecutionState::Failed);
            warn!(reverted, error = %e, "change sink rejected batch, rolled back");
            return Err(e);
        }

        if !trx.is_empty() {
            self.map.recompute_stats();
        }

        result.changes = trx.into_records();
        self.finish(ExecutionState::Committed);
        debug!(
            trx_id = %result.trx_id,
            statements,
            changes = result.changes.len(),
            "batch executed"
        );
        Ok(result)
    }

    /// Revert a staged batch; nothing reaches the sink. Returns the number of
    /// records reverted.
    pub fn abort(&mut self, staged: StagedBatch) -> usize {
        let trx_id = staged.trx.trx_id().to_string();
        let reverted = staged.trx.rollback(&mut self.map);
        self.finish(ExecutionState::Failed);
        debug!(trx_id = %trx_id, reverted, "staged batch aborted");
        reverted
    }

    fn ensure_idle(&self) -> Result<()> {
        if self.state != ExecutionState::Idle {
            return Err(GraphError::Conflict("a staged batch is still pending".to_string()));
        }
        Ok(())
    }

    fn finish(&mut self, outcome: ExecutionState) {
        self.last_outcome = Some(outcome);
        self.state = ExecutionState::Idle;
    }

    fn apply_all(&mut self, commands: &[GraphCommand]) -> Result<StagedBatch> {
        self.state = ExecutionState::Applying;
        let mut trx = BatchTransaction::begin();
        let mut result = QueryResult::new(trx.trx_id());

        for (index, command) in commands.iter().enumerate() {
            if let Err(e) = self.apply(command, &mut trx, &mut result) {
                let reverted = trx.rollback(&mut self.map);
                self.finish(ExecutionState::Failed);
                warn!(
                    statement = index,
                    command = command.verb(),
                    reverted,
                    error = %e,
                    "batch failed, rolled back"
                );
                return Err(e);
            }
        }

        Ok(StagedBatch {
            trx,
            result,
            statements: commands.len(),
        })
    }

    fn apply(&mut self, command: &GraphCommand, trx: &mut BatchTransaction, result: &mut QueryResult) -> Result<()> {
        match command {
            GraphCommand::AddNode(add) => {
                let node = GraphNode::new(&add.key, add.tags.clone()).with_links(add.links.clone());
                self.map.add_node(node.clone())?;
                trx.record(ChangeTrx::node_add(trx.trx_id(), node));
            }
            GraphCommand::AddEdge(add) => {
                let edge = GraphEdge::new(&add.from_key, &add.to_key, &add.edge_type, add.tags.clone());
                self.map.add_edge(edge.clone(), add.unique)?;
                trx.record(ChangeTrx::edge_add(trx.trx_id(), edge));
            }
            GraphCommand::UpdateNode { query, update } => {
                for node in self.matching_nodes(query)? {
                    let mut next = node.clone();
                    next.tags = apply_tags(&node.tags, update.replace_tags.as_ref(), &update.tags);
                    if let Some(links) = &update.links {
                        next.links = links.clone();
                    }
                    next.timestamp = now();

                    let prior = self.map.update_node(next.clone())?;
                    trx.record(ChangeTrx::node_change(trx.trx_id(), prior, next));
                }
            }
            GraphCommand::UpdateEdge { query, update } => {
                for edge in self.matching_edges(query)? {
                    let mut next = edge.clone();
                    next.tags = apply_tags(&edge.tags, update.replace_tags.as_ref(), &update.tags);
                    next.timestamp = now();

                    let prior = self.map.update_edge(next.clone())?;
                    trx.record(ChangeTrx::edge_change(trx.trx_id(), prior, next));
                }
            }
            GraphCommand::DeleteNode(query) => {
                for node in self.matching_nodes(query)? {
                    if let Some(removed) = self.map.remove_node(&node.key) {
                        trx.record(ChangeTrx::node_delete(trx.trx_id(), removed));
                    }
                }
            }
            GraphCommand::DeleteEdge(query) => {
                for edge in self.matching_edges(query)? {
                    if let Some(removed) = self.map.remove_edge(&edge.key) {
                        trx.record(ChangeTrx::edge_delete(trx.trx_id(), removed));
                    }
                }
            }
            GraphCommand::Select(select) => self.select(select, result)?,
        }
        Ok(())
    }

    fn matching_nodes(&self, query: &NodeQuery) -> Result<Vec<GraphNode>> {
        let nodes: Vec<GraphNode> = self.map.query_nodes(query).into_iter().cloned().collect();
        if nodes.is_empty() {
            return Err(GraphError::NotFound(match &query.key {
                Some(key) => format!("node '{}'", key),
                None => format!("no node matches tags '{}'", query.tags),
            }));
        }
        Ok(nodes)
    }

    fn matching_edges(&self, query: &EdgeQuery) -> Result<Vec<GraphEdge>> {
        let edges: Vec<GraphEdge> = self.map.query_edges(query).into_iter().cloned().collect();
        if edges.is_empty() {
            return Err(GraphError::NotFound(format!(
                "no edge matches fromKey={:?} toKey={:?} edgeType={:?} tags='{}'",
                query.from_key, query.to_key, query.edge_type, query.tags
            )));
        }
        Ok(edges)
    }

    fn select(&self, select: &SelectQuery, result: &mut QueryResult) -> Result<()> {
        let mut frontier = match &select.root {
            Selector::Node(query) => AliasResult::Nodes(self.map.query_nodes(query).into_iter().cloned().collect()),
            Selector::Edge(query) => AliasResult::Edges(self.map.query_edges(query).into_iter().cloned().collect()),
        };
        if let Some(alias) = &select.alias {
            result.aliases.insert(alias.clone(), frontier.clone());
        }

        for join in &select.joins {
            frontier = match (&frontier, &join.target) {
                (AliasResult::Nodes(nodes), Selector::Edge(query)) => {
                    AliasResult::Edges(self.hop_to_edges(nodes, join.direction, query))
                }
                (AliasResult::Edges(edges), Selector::Node(query)) => {
                    AliasResult::Nodes(self.hop_to_nodes(edges, join.direction, query))
                }
                _ => {
                    return Err(GraphError::BadRequest(
                        "joins must alternate between node and edge sets".to_string(),
                    ))
                }
            };
            if let Some(alias) = &join.alias {
                result.aliases.insert(alias.clone(), frontier.clone());
            }
        }

        match frontier {
            AliasResult::Nodes(nodes) => result.nodes.extend(nodes),
            AliasResult::Edges(edges) => result.edges.extend(edges),
        }
        Ok(())
    }

    fn hop_to_edges(&self, nodes: &[GraphNode], direction: Direction, query: &EdgeQuery) -> Vec<GraphEdge> {
        let mut seen = HashSet::new();
        let mut edges: Vec<GraphEdge> = nodes
            .iter()
            .flat_map(|node| match direction {
                Direction::Forward => self.map.edges_from(&node.key),
                Direction::Reverse => self.map.edges_to(&node.key),
            })
            .filter(|edge| query.matches(edge) && seen.insert(edge.key.clone()))
            .cloned()
            .collect();
        edges.sort_by(edge_order);
        edges
    }

    /// Dangling edge endpoints are skipped.
    fn hop_to_nodes(&self, edges: &[GraphEdge], direction: Direction, query: &NodeQuery) -> Vec<GraphNode> {
        let mut seen = HashSet::new();
        let mut nodes: Vec<GraphNode> = edges
            .iter()
            .map(|edge| match direction {
                Direction::Forward => edge.to_key.as_str(),
                Direction::Reverse => edge.from_key.as_str(),
            })
            .filter(|key| seen.insert(key.to_string()))
            .filter_map(|key| self.map.get_node(key))
            .filter(|node| query.matches(node))
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.key.cmp(&b.key));
        nodes
    }
}

impl Default for GraphEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_log::{ChangeTrxType, MemoryChangeLog};

    fn engine_with_log() -> (GraphEngine, Arc<MemoryChangeLog>) {
        let log = Arc::new(MemoryChangeLog::new());
        let engine = GraphEngine::new().with_sink(log.clone());
        (engine, log)
    }

    #[test]
    fn test_add_nodes_and_unique_edge() {
        let (mut engine, log) = engine_with_log();
        let result = engine
            .execute("add node key=node1; add node key=node2; add unique edge fromKey=node1,toKey=node2;")
            .unwrap();

        assert_eq!(engine.map().node_count(), 2);
        assert_eq!(engine.map().edge_count(), 1);
        assert_eq!(engine.last_outcome(), Some(ExecutionState::Committed));
        assert_eq!(engine.state(), ExecutionState::Idle);

        let types: Vec<ChangeTrxType> = result.changes.iter().map(|c| c.trx_type).collect();
        assert_eq!(types, vec![ChangeTrxType::NodeAdd, ChangeTrxType::NodeAdd, ChangeTrxType::EdgeAdd]);
        assert!(result.changes.iter().all(|c| c.trx_id == result.trx_id));
        assert_eq!(log.len(), 3);
        assert_eq!(engine.map().stats().node_count, 2);
    }

    #[test]
    fn test_update_then_delete_records() {
        let (mut engine, log) = engine_with_log();
        engine.execute("add node key=node1;").unwrap();
        log.clear();

        engine.execute("update (key=node1) set t1=v1;").unwrap();
        engine.execute("delete (key=node1);").unwrap();

        let records = log.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].trx_type, ChangeTrxType::NodeChange);
        let before = records[0].before.as_ref().and_then(|e| e.as_node()).unwrap();
        let after = records[0].after.as_ref().and_then(|e| e.as_node()).unwrap();
        assert!(before.tags.is_empty());
        assert_eq!(after.tags.to_string(), "t1=v1");

        assert_eq!(records[1].trx_type, ChangeTrxType::NodeDelete);
        let deleted = records[1].before.as_ref().and_then(|e| e.as_node()).unwrap();
        assert_eq!(deleted.tags.to_string(), "t1=v1");
    }

    #[test]
    fn test_failed_statement_rolls_back_batch() {
        let (mut engine, log) = engine_with_log();
        engine.execute("add node key=a;").unwrap();

        let err = engine
            .execute("add node key=b; update (key=a) set t=1; add node key=A;")
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(engine.last_outcome(), Some(ExecutionState::Failed));
        assert_eq!(engine.state(), ExecutionState::Idle);

        assert!(engine.map().get_node("b").is_none());
        assert!(engine.map().get_node("a").unwrap().tags.is_empty());
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_aborted_stage_never_reaches_sink() {
        let log = Arc::new(MemoryChangeLog::new());
        let mut engine = GraphEngine::new().with_sink(log.clone());

        let staged = engine.stage("add node key=a; add node key=b;").unwrap();
        assert!(staged.is_mutation());
        assert_eq!(engine.state(), ExecutionState::Applying);
        assert_eq!(engine.map().node_count(), 2);
        assert!(engine.execute("select (*);").unwrap_err().is_conflict());

        assert_eq!(engine.abort(staged), 2);
        assert_eq!(engine.state(), ExecutionState::Idle);
        assert_eq!(engine.last_outcome(), Some(ExecutionState::Failed));
        assert_eq!(engine.map().node_count(), 0);
        assert!(log.is_empty());

        let staged = engine.stage("add node key=c;").unwrap();
        let trx_id = staged.trx_id().to_string();
        let result = engine.commit(staged).unwrap();
        assert_eq!(result.trx_id, trx_id);
        assert_eq!(log.len(), 1);
        assert_eq!(engine.last_outcome(), Some(ExecutionState::Committed));
    }

    #[test]
    fn test_update_missing_node_is_not_found() {
        let mut engine = GraphEngine::new();
        assert!(engine.execute("update (key=ghost) set t=1;").unwrap_err().is_not_found());
        assert!(engine.execute("delete [fromKey=ghost];").unwrap_err().is_not_found());
    }

    #[test]
    fn test_update_replaces_tags_and_links() {
        let mut engine = GraphEngine::new();
        engine.execute("add node key=n, a=1, b, link=x;").unwrap();
        engine.execute("update (key=n) set tags='c=3', d, link=y, link=z;").unwrap();

        let node = engine.map().get_node("n").unwrap();
        assert_eq!(node.tags.to_string(), "c=3,d");
        assert_eq!(node.links, vec!["y", "z"]);

        engine.execute("update (key=n) set link='';").unwrap();
        assert!(engine.map().get_node("n").unwrap().links.is_empty());
    }

    #[test]
    fn test_select_join_traversal() {
        let mut engine = GraphEngine::new();
        engine
            .execute(
                "add node key=user1; add node key=group1, kind=group; add node key=group2, kind=group; \
                 add node key=chan1; \
                 add edge fromKey=user1, toKey=group1, edgeType=member; \
                 add edge fromKey=user1, toKey=group2, edgeType=member; \
                 add edge fromKey=group1, toKey=chan1, edgeType=channel;",
            )
            .unwrap();

        let result = engine
            .execute("select (key=user1) -> [edgeType=member] -> (kind=group) as groups -> [edgeType=channel] -> (*);")
            .unwrap();

        let keys: Vec<&str> = result.nodes.iter().map(|n| n.key.as_str()).collect();
        assert_eq!(keys, vec!["chan1"]);
        assert_eq!(result.alias_nodes("groups").unwrap().len(), 2);
        assert!(!result.is_mutation());

        let back = engine.execute("select (key=chan1) <- [*] <- (*);").unwrap();
        assert_eq!(back.nodes.len(), 1);
        assert_eq!(back.nodes[0].key, "group1");
    }

    #[test]
    fn test_select_is_case_insensitive() {
        let mut engine = GraphEngine::new();
        engine.execute("add node key=Node1;").unwrap();
        let result = engine.execute("select (key=node1);").unwrap();
        assert!(result.node("NODE1").is_some());
    }

    #[test]
    fn test_parse_failure_changes_nothing() {
        let (mut engine, log) = engine_with_log();
        assert!(engine.execute("add node key=a; add nod key=b;").unwrap_err().is_bad_request());
        assert_eq!(engine.map().node_count(), 0);
        assert!(log.is_empty());
    }
}
