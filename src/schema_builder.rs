//! Schema-driven command builder
//!
//! Maps a typed record onto one node plus derived edges and computes the
//! commands that bring the graph from a record's previous version to its
//! current one:
//!
//! - the node carries the record's tags and an opaque payload (its link)
//! - each secondary index value becomes an edge
//!   `<index>:<value> -[index]-> <node>`
//! - each outgoing reference becomes an edge `<node> -[<type>]-> <target>`
//!
//! Edges are diffed as case-insensitive sets, so unchanged edges are left
//! alone and only additions and removals are emitted.

use crate::error::{GraphError, Result};
use crate::gql_grammar::quote_value;
use crate::types::{normalize_key, Tags};
use std::collections::BTreeSet;

/// Edge type of secondary-index edges.
pub const INDEX_EDGE_TYPE: &str = "index";

type KeySelector<T> = Box<dyn Fn(&T) -> String + Send + Sync>;
type TagSelector<T> = Box<dyn Fn(&T) -> Tags + Send + Sync>;
type PayloadSelector<T> = Box<dyn Fn(&T) -> Option<String> + Send + Sync>;
type ValueSelector<T> = Box<dyn Fn(&T) -> Vec<String> + Send + Sync>;

/// Declarative mapping of `T` onto the graph.
pub struct GraphSchema<T> {
    node_key: KeySelector<T>,
    tags: Option<TagSelector<T>>,
    payload: Option<PayloadSelector<T>>,
    indexes: Vec<(String, ValueSelector<T>)>,
    references: Vec<(String, ValueSelector<T>)>,
}

pub struct GraphSchemaBuilder<T> {
    node_key: Option<KeySelector<T>>,
    tags: Option<TagSelector<T>>,
    payload: Option<PayloadSelector<T>>,
    indexes: Vec<(String, ValueSelector<T>)>,
    references: Vec<(String, ValueSelector<T>)>,
}

impl<T> GraphSchemaBuilder<T> {
    pub fn node_key(mut self, selector: impl Fn(&T) -> String + Send + Sync + 'static) -> Self {
        self.node_key = Some(Box::new(selector));
        self
    }

    pub fn tags(mut self, selector: impl Fn(&T) -> Tags + Send + Sync + 'static) -> Self {
        self.tags = Some(Box::new(selector));
        self
    }

    pub fn payload(mut self, selector: impl Fn(&T) -> Option<String> + Send + Sync + 'static) -> Self {
        self.payload = Some(Box::new(selector));
        self
    }

    /// Secondary index: one edge per non-empty value.
    pub fn index(mut self, name: &str, selector: impl Fn(&T) -> Vec<String> + Send + Sync + 'static) -> Self {
        self.indexes.push((name.trim().to_lowercase(), Box::new(selector)));
        self
    }

    /// Outgoing reference: one edge per non-empty target key.
    pub fn reference(
        mut self,
        edge_type: &str,
        selector: impl Fn(&T) -> Vec<String> + Send + Sync + 'static,
    ) -> Self {
        self.references.push((normalize_key(edge_type), Box::new(selector)));
        self
    }

    pub fn build(self) -> Result<GraphSchema<T>> {
        let node_key = self
            .node_key
            .ok_or_else(|| GraphError::BadRequest("schema has no node key selector".to_string()))?;

        let mut names = BTreeSet::new();
        for (name, _) in &self.indexes {
            if name.is_empty() || !names.insert(name.clone()) {
                return Err(GraphError::BadRequest(format!("invalid or duplicate index name '{}'", name)));
            }
        }

        let mut edge_types = BTreeSet::new();
        for (edge_type, _) in &self.references {
            if edge_type.is_empty() || edge_type == INDEX_EDGE_TYPE || !edge_types.insert(edge_type.clone()) {
                return Err(GraphError::BadRequest(format!(
                    "invalid or duplicate reference type '{}'",
                    edge_type
                )));
            }
        }

        Ok(GraphSchema {
            node_key,
            tags: self.tags,
            payload: self.payload,
            indexes: self.indexes,
            references: self.references,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct NodeState {
    key: String,
    tags: Tags,
    payload: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct EdgeState {
    from_key: String,
    to_key: String,
    edge_type: String,
}

impl<T> GraphSchema<T> {
    pub fn builder() -> GraphSchemaBuilder<T> {
        GraphSchemaBuilder {
            node_key: None,
            tags: None,
            payload: None,
            indexes: Vec::new(),
            references: Vec::new(),
        }
    }

    /// Normalized node key of `record`.
    pub fn key_of(&self, record: &T) -> Result<String> {
        let key = normalize_key(&(self.node_key)(record));
        if key.is_empty() {
            return Err(GraphError::BadRequest("record resolves to an empty node key".to_string()));
        }
        Ok(key)
    }

    /// Commands converging the graph from `previous` to `current`.
    ///
    /// Without a previous version the node and all its edges are added.
    /// Identical versions produce no commands.
    pub fn build_commands(&self, current: &T, previous: Option<&T>) -> Result<Vec<String>> {
        let node = self.resolve_node(current)?;
        let edges = self.resolve_edges(current, &node.key);

        let Some(previous) = previous else {
            return Ok(self.create_commands(&node, &edges));
        };

        let old_node = self.resolve_node(previous)?;
        let old_edges = self.resolve_edges(previous, &old_node.key);

        if old_node.key != node.key {
            let mut commands = delete_commands(&old_node, &old_edges);
            commands.extend(self.create_commands(&node, &edges));
            return Ok(commands);
        }

        let mut commands = Vec::new();
        if old_node != node {
            commands.push(update_node(&node));
        }
        commands.extend(old_edges.difference(&edges).map(delete_edge));
        commands.extend(edges.difference(&old_edges).map(add_edge));
        Ok(commands)
    }

    /// [`build_commands`](Self::build_commands) joined into one batch.
    pub fn build_batch(&self, current: &T, previous: Option<&T>) -> Result<String> {
        Ok(self.build_commands(current, previous)?.join(" "))
    }

    /// Commands removing the record's node and every edge it derives.
    pub fn build_delete_commands(&self, record: &T) -> Result<Vec<String>> {
        let node = self.resolve_node(record)?;
        let edges = self.resolve_edges(record, &node.key);
        Ok(delete_commands(&node, &edges))
    }

    fn create_commands(&self, node: &NodeState, edges: &BTreeSet<EdgeState>) -> Vec<String> {
        let mut commands = vec![add_node(node)];
        commands.extend(edges.iter().map(add_edge));
        commands
    }

    fn resolve_node(&self, record: &T) -> Result<NodeState> {
        Ok(NodeState {
            key: self.key_of(record)?,
            tags: self.tags.as_ref().map(|f| f(record)).unwrap_or_default(),
            payload: self
                .payload
                .as_ref()
                .and_then(|f| f(record))
                .filter(|payload| !payload.is_empty()),
        })
    }

    fn resolve_edges(&self, record: &T, node_key: &str) -> BTreeSet<EdgeState> {
        let mut edges = BTreeSet::new();

        for (name, selector) in &self.indexes {
            for value in non_empty(selector(record)) {
                edges.insert(EdgeState {
                    from_key: normalize_key(&format!("{}:{}", name, value)),
                    to_key: node_key.to_string(),
                    edge_type: INDEX_EDGE_TYPE.to_string(),
                });
            }
        }

        for (edge_type, selector) in &self.references {
            for target in non_empty(selector(record)) {
                edges.insert(EdgeState {
                    from_key: node_key.to_string(),
                    to_key: normalize_key(&target),
                    edge_type: edge_type.clone(),
                });
            }
        }

        edges
    }
}

fn non_empty(values: Vec<String>) -> impl Iterator<Item = String> {
    values
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn delete_commands(node: &NodeState, edges: &BTreeSet<EdgeState>) -> Vec<String> {
    let mut commands: Vec<String> = edges.iter().map(delete_edge).collect();
    commands.push(format!("delete (key={});", quote_value(&node.key)));
    commands
}

fn add_node(node: &NodeState) -> String {
    let mut command = format!("add node key={}", quote_value(&node.key));
    if !node.tags.is_empty() {
        command.push_str(&format!(", tags={}", quote_value(&node.tags.to_string())));
    }
    if let Some(payload) = &node.payload {
        command.push_str(&format!(", link={}", quote_value(payload)));
    }
    command.push(';');
    command
}

fn update_node(node: &NodeState) -> String {
    format!(
        "update (key={}) set tags={}, link={};",
        quote_value(&node.key),
        quote_value(&node.tags.to_string()),
        quote_value(node.payload.as_deref().unwrap_or(""))
    )
}

fn edge_attributes(edge: &EdgeState) -> String {
    format!(
        "fromKey={}, toKey={}, edgeType={}",
        quote_value(&edge.from_key),
        quote_value(&edge.to_key),
        quote_value(&edge.edge_type)
    )
}

fn add_edge(edge: &EdgeState) -> String {
    format!("add unique edge {};", edge_attributes(edge))
}

fn delete_edge(edge: &EdgeState) -> String {
    format!("delete [{}];", edge_attributes(edge))
}
