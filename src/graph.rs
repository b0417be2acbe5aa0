//! In-memory graph map
//!
//! Nodes keyed by (lower-cased) key, edges keyed by generated id, plus:
//! - outgoing/incoming adjacency: node key -> edge type -> edge ids
//! - tag index: tag name -> node keys
//!
//! The map is not internally synchronized. A single owner (an engine inside
//! an access scope or a host worker) serializes every mutation.
//!
//! Cached counters in [`GraphStats`] are refreshed explicitly through
//! [`GraphMap::recompute_stats`], never per mutation.

use crate::error::{GraphError, Result};
use crate::gql_ast::{EdgeQuery, NodeQuery};
use crate::types::{new_id, normalize_key, now, Tags};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Keyed vertex. Identity is the lower-cased key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub key: String,
    pub tags: Tags,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub links: Vec<String>,
}

impl GraphNode {
    pub fn new(key: &str, tags: Tags) -> Self {
        GraphNode {
            key: normalize_key(key),
            tags,
            timestamp: now(),
            links: Vec::new(),
        }
    }

    pub fn with_links(mut self, links: Vec<String>) -> Self {
        self.links = links;
        self
    }
}

/// Typed directed relation between two node keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphEdge {
    pub key: String,
    pub from_key: String,
    pub to_key: String,
    pub edge_type: String,
    pub tags: Tags,
    pub timestamp: DateTime<Utc>,
}

impl GraphEdge {
    pub fn new(from_key: &str, to_key: &str, edge_type: &str, tags: Tags) -> Self {
        GraphEdge {
            key: new_id(),
            from_key: normalize_key(from_key),
            to_key: normalize_key(to_key),
            edge_type: normalize_key(edge_type),
            tags,
            timestamp: now(),
        }
    }

    /// True when both edges connect the same endpoints with the same type.
    pub fn same_triple(&self, other: &GraphEdge) -> bool {
        self.from_key == other.from_key && self.to_key == other.to_key && self.edge_type == other.edge_type
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphStats {
    pub node_count: usize,
    pub edge_count: usize,
    pub edge_types: BTreeMap<String, usize>,
    pub tag_names: usize,
    pub computed_at: Option<DateTime<Utc>>,
}

/// node key -> edge type -> edge ids
type Adjacency = HashMap<String, HashMap<String, Vec<String>>>;

#[derive(Debug, Clone, Default)]
pub struct GraphMap {
    nodes: HashMap<String, GraphNode>,
    edges: HashMap<String, GraphEdge>,
    outgoing: Adjacency,
    incoming: Adjacency,
    tag_index: HashMap<String, HashSet<String>>,
    stats: GraphStats,
}

impl GraphMap {
    pub fn new() -> Self {
        GraphMap::default()
    }

    /// Build a map from snapshot contents. Duplicate node keys keep the last
    /// occurrence.
    pub fn from_parts(nodes: Vec<GraphNode>, edges: Vec<GraphEdge>) -> Self {
        let mut map = GraphMap::new();
        for mut node in nodes {
            node.key = normalize_key(&node.key);
            map.unindex_node_key(&node.key);
            map.index_node(&node);
            map.nodes.insert(node.key.clone(), node);
        }
        for edge in edges {
            map.insert_edge(edge);
        }
        map.recompute_stats();
        map
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }

    // ========== Nodes ==========

    /// Insert a new node; an existing key (any case) is a conflict.
    pub fn add_node(&mut self, mut node: GraphNode) -> Result<()> {
        node.key = normalize_key(&node.key);
        if node.key.is_empty() {
            return Err(GraphError::BadRequest("node key is empty".to_string()));
        }
        if self.nodes.contains_key(&node.key) {
            return Err(GraphError::Conflict(format!("node '{}' already exists", node.key)));
        }

        self.index_node(&node);
        self.nodes.insert(node.key.clone(), node);
        Ok(())
    }

    pub fn get_node(&self, key: &str) -> Option<&GraphNode> {
        self.nodes.get(&normalize_key(key))
    }

    pub fn contains_node(&self, key: &str) -> bool {
        self.nodes.contains_key(&normalize_key(key))
    }

    /// Replace a node by key, returning the prior value.
    pub fn update_node(&mut self, mut node: GraphNode) -> Result<GraphNode> {
        node.key = normalize_key(&node.key);
        let prior = self
            .nodes
            .remove(&node.key)
            .ok_or_else(|| GraphError::NotFound(format!("node '{}'", node.key)))?;

        self.unindex_node(&prior);
        self.index_node(&node);
        self.nodes.insert(node.key.clone(), node);
        Ok(prior)
    }

    /// Remove a node. Edges touching it are left in place.
    pub fn remove_node(&mut self, key: &str) -> Option<GraphNode> {
        let node = self.nodes.remove(&normalize_key(key))?;
        self.unindex_node(&node);
        Some(node)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.values()
    }

    /// Nodes carrying tag `name`, sorted by key.
    pub fn nodes_with_tag(&self, name: &str) -> Vec<&GraphNode> {
        let mut nodes: Vec<&GraphNode> = self
            .tag_index
            .get(&name.to_lowercase())
            .map(|keys| keys.iter().filter_map(|k| self.nodes.get(k)).collect())
            .unwrap_or_default();
        nodes.sort_by(|a, b| a.key.cmp(&b.key));
        nodes
    }

    /// Nodes matching `query`, sorted by key.
    pub fn query_nodes(&self, query: &NodeQuery) -> Vec<&GraphNode> {
        if let Some(key) = &query.key {
            return self
                .nodes
                .get(&normalize_key(key))
                .filter(|node| node.tags.matches(&query.tags))
                .into_iter()
                .collect();
        }

        let mut nodes: Vec<&GraphNode> = match query.tags.names().next() {
            Some(first_tag) => self
                .tag_index
                .get(first_tag)
                .map(|keys| keys.iter().filter_map(|k| self.nodes.get(k)).collect())
                .unwrap_or_default(),
            None => self.nodes.values().collect(),
        };
        nodes.retain(|node| query.matches(node));
        nodes.sort_by(|a, b| a.key.cmp(&b.key));
        nodes
    }

    // ========== Edges ==========

    /// Insert an edge. With `unique`, an existing edge with the same
    /// (fromKey, toKey, edgeType) is a conflict and nothing changes.
    pub fn add_edge(&mut self, mut edge: GraphEdge, unique: bool) -> Result<()> {
        edge.from_key = normalize_key(&edge.from_key);
        edge.to_key = normalize_key(&edge.to_key);
        edge.edge_type = normalize_key(&edge.edge_type);

        if edge.from_key.is_empty() || edge.to_key.is_empty() {
            return Err(GraphError::BadRequest("edge endpoints must not be empty".to_string()));
        }
        if self.edges.contains_key(&edge.key) {
            return Err(GraphError::Conflict(format!("edge id '{}' already exists", edge.key)));
        }
        if unique {
            if let Some(existing) = self.find_edge(&edge.from_key, &edge.to_key, &edge.edge_type) {
                return Err(GraphError::Conflict(format!(
                    "unique edge {} -[{}]-> {} already exists ({})",
                    edge.from_key, edge.edge_type, edge.to_key, existing.key
                )));
            }
        }

        self.insert_edge(edge);
        Ok(())
    }

    pub fn get_edge(&self, key: &str) -> Option<&GraphEdge> {
        self.edges.get(key)
    }

    /// Replace an edge by id, returning the prior value.
    pub fn update_edge(&mut self, edge: GraphEdge) -> Result<GraphEdge> {
        let prior = self
            .remove_edge(&edge.key)
            .ok_or_else(|| GraphError::NotFound(format!("edge '{}'", edge.key)))?;
        self.insert_edge(edge);
        Ok(prior)
    }

    pub fn remove_edge(&mut self, key: &str) -> Option<GraphEdge> {
        let edge = self.edges.remove(key)?;
        detach(&mut self.outgoing, &edge.from_key, &edge.edge_type, &edge.key);
        detach(&mut self.incoming, &edge.to_key, &edge.edge_type, &edge.key);
        Some(edge)
    }

    /// First edge with the given endpoints and type.
    pub fn find_edge(&self, from_key: &str, to_key: &str, edge_type: &str) -> Option<&GraphEdge> {
        let to_key = normalize_key(to_key);
        self.outgoing
            .get(&normalize_key(from_key))
            .and_then(|by_type| by_type.get(&normalize_key(edge_type)))
            .and_then(|ids| {
                ids.iter()
                    .filter_map(|id| self.edges.get(id))
                    .find(|edge| edge.to_key == to_key)
            })
    }

    pub fn edges_from(&self, key: &str) -> Vec<&GraphEdge> {
        self.adjacent(&self.outgoing, key)
    }

    pub fn edges_to(&self, key: &str) -> Vec<&GraphEdge> {
        self.adjacent(&self.incoming, key)
    }

    pub fn edges(&self) -> impl Iterator<Item = &GraphEdge> {
        self.edges.values()
    }

    /// Edges matching `query`, sorted by (fromKey, toKey, edgeType, id).
    pub fn query_edges(&self, query: &EdgeQuery) -> Vec<&GraphEdge> {
        let mut edges: Vec<&GraphEdge> = if let Some(key) = &query.key {
            self.edges.get(key).into_iter().collect()
        } else if let Some(from_key) = &query.from_key {
            self.edges_from(from_key)
        } else if let Some(to_key) = &query.to_key {
            self.edges_to(to_key)
        } else {
            self.edges.values().collect()
        };

        edges.retain(|edge| query.matches(edge));
        edges.sort_by(|a, b| edge_order(a, b));
        edges
    }

    // ========== Stats ==========

    pub fn stats(&self) -> &GraphStats {
        &self.stats
    }

    pub fn recompute_stats(&mut self) -> &GraphStats {
        let mut edge_types = BTreeMap::new();
        for edge in self.edges.values() {
            *edge_types.entry(edge.edge_type.clone()).or_insert(0) += 1;
        }

        self.stats = GraphStats {
            node_count: self.nodes.len(),
            edge_count: self.edges.len(),
            edge_types,
            tag_names: self.tag_index.values().filter(|keys| !keys.is_empty()).count(),
            computed_at: Some(now()),
        };
        &self.stats
    }

    // ========== Internal ==========

    fn insert_edge(&mut self, edge: GraphEdge) {
        attach(&mut self.outgoing, &edge.from_key, &edge.edge_type, &edge.key);
        attach(&mut self.incoming, &edge.to_key, &edge.edge_type, &edge.key);
        self.edges.insert(edge.key.clone(), edge);
    }

    fn adjacent(&self, adjacency: &Adjacency, key: &str) -> Vec<&GraphEdge> {
        let mut edges: Vec<&GraphEdge> = adjacency
            .get(&normalize_key(key))
            .map(|by_type| {
                by_type
                    .values()
                    .flatten()
                    .filter_map(|id| self.edges.get(id))
                    .collect()
            })
            .unwrap_or_default();
        edges.sort_by(|a, b| edge_order(a, b));
        edges
    }

    fn index_node(&mut self, node: &GraphNode) {
        for name in node.tags.names() {
            self.tag_index
                .entry(name.to_string())
                .or_default()
                .insert(node.key.clone());
        }
    }

    fn unindex_node(&mut self, node: &GraphNode) {
        for name in node.tags.names() {
            if let Some(keys) = self.tag_index.get_mut(name) {
                keys.remove(&node.key);
                if keys.is_empty() {
                    self.tag_index.remove(name);
                }
            }
        }
    }

    fn unindex_node_key(&mut self, key: &str) {
        if let Some(existing) = self.nodes.remove(key) {
            self.unindex_node(&existing);
        }
    }
}

fn attach(adjacency: &mut Adjacency, node_key: &str, edge_type: &str, edge_key: &str) {
    adjacency
        .entry(node_key.to_string())
        .or_default()
        .entry(edge_type.to_string())
        .or_default()
        .push(edge_key.to_string());
}

fn detach(adjacency: &mut Adjacency, node_key: &str, edge_type: &str, edge_key: &str) {
    if let Some(by_type) = adjacency.get_mut(node_key) {
        if let Some(ids) = by_type.get_mut(edge_type) {
            ids.retain(|id| id != edge_key);
            if ids.is_empty() {
                by_type.remove(edge_type);
            }
        }
        if by_type.is_empty() {
            adjacency.remove(node_key);
        }
    }
}

pub(crate) fn edge_order(a: &GraphEdge, b: &GraphEdge) -> std::cmp::Ordering {
    (&a.from_key, &a.to_key, &a.edge_type, &a.key).cmp(&(&b.from_key, &b.to_key, &b.edge_type, &b.key))
}
