//! Graph command AST
//!
//! Typed form of a parsed statement batch, produced by
//! [`crate::gql_compiler`] and consumed by [`crate::gql_executor`].

use crate::graph::{GraphEdge, GraphNode};
use crate::types::Tags;
use serde::{Deserialize, Serialize};

/// Attribute names with a fixed meaning; every other name is a free-form tag.
pub mod attributes {
    pub const KEY: &str = "key";
    pub const TAGS: &str = "tags";
    pub const FROM_KEY: &str = "fromkey";
    pub const TO_KEY: &str = "tokey";
    pub const EDGE_TYPE: &str = "edgetype";
    pub const LINK: &str = "link";
}

pub const DEFAULT_EDGE_TYPE: &str = "default";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GraphCommand {
    AddNode(AddNode),
    AddEdge(AddEdge),
    UpdateNode { query: NodeQuery, update: NodeUpdate },
    UpdateEdge { query: EdgeQuery, update: EdgeUpdate },
    DeleteNode(NodeQuery),
    DeleteEdge(EdgeQuery),
    Select(SelectQuery),
}

impl GraphCommand {
    pub fn is_mutation(&self) -> bool {
        !matches!(self, GraphCommand::Select(_))
    }

    pub fn verb(&self) -> &'static str {
        match self {
            GraphCommand::AddNode(_) => "add node",
            GraphCommand::AddEdge(_) => "add edge",
            GraphCommand::UpdateNode { .. } => "update node",
            GraphCommand::UpdateEdge { .. } => "update edge",
            GraphCommand::DeleteNode(_) => "delete node",
            GraphCommand::DeleteEdge(_) => "delete edge",
            GraphCommand::Select(_) => "select",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddNode {
    pub key: String,
    pub tags: Tags,
    pub links: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddEdge {
    pub from_key: String,
    pub to_key: String,
    pub edge_type: String,
    pub tags: Tags,
    pub unique: bool,
}

/// Node predicate. An empty query (`(*)`) matches every node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeQuery {
    pub key: Option<String>,
    pub tags: Tags,
}

impl NodeQuery {
    pub fn all() -> Self {
        NodeQuery::default()
    }

    pub fn by_key(key: &str) -> Self {
        NodeQuery {
            key: Some(key.to_lowercase()),
            tags: Tags::new(),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.key.is_none() && self.tags.is_empty()
    }

    pub fn matches(&self, node: &GraphNode) -> bool {
        if let Some(key) = &self.key {
            if node.key != *key {
                return false;
            }
        }
        node.tags.matches(&self.tags)
    }
}

/// Edge predicate. An empty query (`[*]`) matches every edge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EdgeQuery {
    pub key: Option<String>,
    pub from_key: Option<String>,
    pub to_key: Option<String>,
    pub edge_type: Option<String>,
    pub tags: Tags,
}

impl EdgeQuery {
    pub fn all() -> Self {
        EdgeQuery::default()
    }

    pub fn is_wildcard(&self) -> bool {
        self.key.is_none()
            && self.from_key.is_none()
            && self.to_key.is_none()
            && self.edge_type.is_none()
            && self.tags.is_empty()
    }

    pub fn matches(&self, edge: &GraphEdge) -> bool {
        let field = |expected: &Option<String>, actual: &str| {
            expected.as_deref().map(|e| e == actual).unwrap_or(true)
        };

        field(&self.key, &edge.key)
            && field(&self.from_key, &edge.from_key)
            && field(&self.to_key, &edge.to_key)
            && field(&self.edge_type, &edge.edge_type)
            && edge.tags.matches(&self.tags)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Selector {
    Node(NodeQuery),
    Edge(EdgeQuery),
}

impl Selector {
    pub fn is_node(&self) -> bool {
        matches!(self, Selector::Node(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeUpdate {
    /// Merged into the node's existing tags.
    pub tags: Tags,
    /// `tags=...`: replaces the tag set before `tags` is merged.
    pub replace_tags: Option<Tags>,
    /// `link=...`: replaces the link list.
    pub links: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EdgeUpdate {
    pub tags: Tags,
    pub replace_tags: Option<Tags>,
}

/// Apply a tag update: optional full replacement, then merge.
pub fn apply_tags(current: &Tags, replace: Option<&Tags>, merge: &Tags) -> Tags {
    let mut tags = replace.cloned().unwrap_or_else(|| current.clone());
    tags.merge(merge);
    tags
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// `->`: from the current set along edges to their targets.
    Forward,
    /// `<-`: from the current set along edges back to their sources.
    Reverse,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Join {
    pub direction: Direction,
    pub target: Selector,
    pub alias: Option<String>,
}

/// `select <selector> [as alias] { -> <selector> [as alias] } ;`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectQuery {
    pub root: Selector,
    pub alias: Option<String>,
    pub joins: Vec<Join>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_tags() {
        let current = Tags::parse("a=1,b");
        assert_eq!(apply_tags(&current, None, &Tags::parse("a=2")).to_string(), "a=2,b");
        let replaced = apply_tags(&current, Some(&Tags::parse("c")), &Tags::parse("d=4"));
        assert_eq!(replaced.to_string(), "c,d=4");
    }

    #[test]
    fn test_wildcards() {
        assert!(NodeQuery::all().is_wildcard());
        assert!(!NodeQuery::by_key("Node1").is_wildcard());
        assert_eq!(NodeQuery::by_key("Node1").key.as_deref(), Some("node1"));
        assert!(EdgeQuery::all().is_wildcard());
        assert!(GraphCommand::Select(SelectQuery {
            root: Selector::Node(NodeQuery::all()),
            alias: None,
            joins: vec![],
        })
        .verb()
        .starts_with("select"));
    }
}
