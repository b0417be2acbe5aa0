//! Graph command compiler
//!
//! Turns a matched [`SyntaxTree`] into typed [`GraphCommand`]s. Reserved
//! attribute names steer values into command fields; every other attribute
//! becomes a tag. Misplaced reserved attributes are rejected with the
//! attribute's token and position.

use crate::error::{Result, SyntaxError};
use crate::gql_ast::*;
use crate::gql_grammar::{graph_grammar, names};
use crate::meta_lexer::Token;
use crate::syntax_parser::{SyntaxNode, SyntaxParser, SyntaxTree};
use crate::types::{normalize_key, Tags};
use std::collections::HashSet;

/// Parse and compile a statement batch.
pub fn parse_commands(query: &str) -> Result<Vec<GraphCommand>> {
    let grammar = graph_grammar()?;
    let tree = SyntaxParser::new(grammar).parse(query)?;
    compile(&tree)
}

pub fn compile(tree: &SyntaxTree) -> Result<Vec<GraphCommand>> {
    let mut commands = Vec::with_capacity(tree.statements.len());
    for statement in &tree.statements {
        commands.push(compile_statement(statement)?);
    }
    Ok(commands)
}

fn compile_statement(statement: &SyntaxNode) -> std::result::Result<GraphCommand, SyntaxError> {
    match statement.name() {
        names::ADD_NODE => compile_add_node(statement),
        names::ADD_EDGE => compile_add_edge(statement),
        names::UPDATE => compile_update(statement),
        names::DELETE => compile_delete(statement),
        names::SELECT => compile_select(statement),
        other => Err(error_at(statement, &format!("unsupported statement '{}'", other))),
    }
}

/// One `name[=value]` attribute with its source token.
struct Attribute {
    name: String,
    value: Option<String>,
    token: Token,
}

impl Attribute {
    fn error(&self, message: impl Into<String>) -> SyntaxError {
        SyntaxError::at_token(message, &self.token.value, self.token.offset)
    }

    fn required_value(&self) -> std::result::Result<&str, SyntaxError> {
        match self.value.as_deref() {
            Some(value) if !value.trim().is_empty() => Ok(value),
            _ => Err(self.error(format!("'{}' requires a value", self.token.value))),
        }
    }
}

fn read_attributes(tags: Option<&SyntaxNode>) -> std::result::Result<Vec<Attribute>, SyntaxError> {
    let tags = match tags {
        Some(tags) => tags,
        None => return Ok(Vec::new()),
    };

    let mut out = Vec::new();
    for tag in tags.children_named(names::TAG) {
        let token = tag
            .child(names::SYMBOL)
            .and_then(SyntaxNode::token)
            .ok_or_else(|| error_at(tag, "attribute name expected"))?
            .clone();
        let value = tag
            .child(names::VALUE)
            .and_then(SyntaxNode::token)
            .map(|t| t.value.clone())
            .filter(|v| !v.is_empty());

        out.push(Attribute {
            name: token.value.to_lowercase(),
            value,
            token,
        });
    }
    Ok(out)
}

/// Rejects a second occurrence of a single-valued attribute.
#[derive(Default)]
struct Seen(HashSet<String>);

impl Seen {
    fn once(&mut self, attribute: &Attribute) -> std::result::Result<(), SyntaxError> {
        if self.0.insert(attribute.name.clone()) {
            Ok(())
        } else {
            Err(attribute.error(format!("duplicate attribute '{}'", attribute.token.value)))
        }
    }
}

fn compile_add_node(statement: &SyntaxNode) -> std::result::Result<GraphCommand, SyntaxError> {
    let mut seen = Seen::default();
    let mut key = None;
    let mut tags = Tags::new();
    let mut links = Vec::new();

    for attribute in read_attributes(statement.child(names::TAGS))? {
        match attribute.name.as_str() {
            attributes::KEY => {
                seen.once(&attribute)?;
                key = Some(normalize_key(attribute.required_value()?));
            }
            attributes::TAGS => {
                seen.once(&attribute)?;
                tags.merge(&Tags::parse(attribute.value.as_deref().unwrap_or("")));
            }
            attributes::LINK => links.extend(attribute.value.clone()),
            attributes::FROM_KEY | attributes::TO_KEY | attributes::EDGE_TYPE => {
                return Err(attribute.error(format!("'{}' is not valid for nodes", attribute.token.value)))
            }
            _ => tags.set(&attribute.name, attribute.value.clone()),
        }
    }

    let key = key.ok_or_else(|| error_at(statement, "add node requires a key"))?;
    Ok(GraphCommand::AddNode(AddNode { key, tags, links }))
}

fn compile_add_edge(statement: &SyntaxNode) -> std::result::Result<GraphCommand, SyntaxError> {
    let mut seen = Seen::default();
    let mut from_key = None;
    let mut to_key = None;
    let mut edge_type = None;
    let mut tags = Tags::new();

    for attribute in read_attributes(statement.child(names::TAGS))? {
        match attribute.name.as_str() {
            attributes::FROM_KEY => {
                seen.once(&attribute)?;
                from_key = Some(normalize_key(attribute.required_value()?));
            }
            attributes::TO_KEY => {
                seen.once(&attribute)?;
                to_key = Some(normalize_key(attribute.required_value()?));
            }
            attributes::EDGE_TYPE => {
                seen.once(&attribute)?;
                edge_type = Some(normalize_key(attribute.required_value()?));
            }
            attributes::TAGS => {
                seen.once(&attribute)?;
                tags.merge(&Tags::parse(attribute.value.as_deref().unwrap_or("")));
            }
            attributes::KEY => return Err(attribute.error("edge keys are generated and cannot be set")),
            attributes::LINK => return Err(attribute.error("'link' is not valid for edges")),
            _ => tags.set(&attribute.name, attribute.value.clone()),
        }
    }

    let from_key = from_key.ok_or_else(|| error_at(statement, "add edge requires fromKey"))?;
    let to_key = to_key.ok_or_else(|| error_at(statement, "add edge requires toKey"))?;

    Ok(GraphCommand::AddEdge(AddEdge {
        from_key,
        to_key,
        edge_type: edge_type.unwrap_or_else(|| DEFAULT_EDGE_TYPE.to_string()),
        tags,
        unique: statement.has_child(names::UNIQUE),
    }))
}

fn compile_update(statement: &SyntaxNode) -> std::result::Result<GraphCommand, SyntaxError> {
    let selector = compile_selector(first_spec(statement)?)?;
    let mut seen = Seen::default();
    let mut tags = Tags::new();
    let mut replace_tags = None;
    let mut links: Option<Vec<String>> = None;
    let assignments = read_attributes(statement.child(names::TAGS))?;

    match selector {
        Selector::Node(query) => {
            for attribute in assignments {
                match attribute.name.as_str() {
                    attributes::TAGS => {
                        seen.once(&attribute)?;
                        replace_tags = Some(Tags::parse(attribute.value.as_deref().unwrap_or("")));
                    }
                    attributes::LINK => {
                        let links = links.get_or_insert_with(Vec::new);
                        links.extend(attribute.value.clone());
                    }
                    attributes::KEY => return Err(attribute.error("node keys cannot be updated")),
                    attributes::FROM_KEY | attributes::TO_KEY | attributes::EDGE_TYPE => {
                        return Err(attribute.error(format!("'{}' is not valid for nodes", attribute.token.value)))
                    }
                    _ => tags.set(&attribute.name, attribute.value.clone()),
                }
            }
            Ok(GraphCommand::UpdateNode {
                query,
                update: NodeUpdate {
                    tags,
                    replace_tags,
                    links,
                },
            })
        }
        Selector::Edge(query) => {
            for attribute in assignments {
                match attribute.name.as_str() {
                    attributes::TAGS => {
                        seen.once(&attribute)?;
                        replace_tags = Some(Tags::parse(attribute.value.as_deref().unwrap_or("")));
                    }
                    attributes::KEY | attributes::FROM_KEY | attributes::TO_KEY | attributes::EDGE_TYPE => {
                        return Err(attribute.error("edge identity, endpoints and type cannot be updated"))
                    }
                    attributes::LINK => return Err(attribute.error("'link' is not valid for edges")),
                    _ => tags.set(&attribute.name, attribute.value.clone()),
                }
            }
            Ok(GraphCommand::UpdateEdge {
                query,
                update: EdgeUpdate { tags, replace_tags },
            })
        }
    }
}

fn compile_delete(statement: &SyntaxNode) -> std::result::Result<GraphCommand, SyntaxError> {
    Ok(match compile_selector(first_spec(statement)?)? {
        Selector::Node(query) => GraphCommand::DeleteNode(query),
        Selector::Edge(query) => GraphCommand::DeleteEdge(query),
    })
}

fn compile_select(statement: &SyntaxNode) -> std::result::Result<GraphCommand, SyntaxError> {
    let root = compile_selector(first_spec(statement)?)?;
    let mut aliases = HashSet::new();
    let alias = compile_alias(statement.child(names::ALIAS), &mut aliases)?;

    let mut joins = Vec::new();
    let mut current_is_node = root.is_node();

    for join in statement.children_named(names::JOIN) {
        let target = compile_selector(first_spec(join)?)?;
        if target.is_node() == current_is_node {
            return Err(error_at(join, "joins must alternate between node and edge sets"));
        }
        current_is_node = target.is_node();

        let direction = if join.has_child(names::FORWARD) {
            Direction::Forward
        } else {
            Direction::Reverse
        };

        joins.push(Join {
            direction,
            target,
            alias: compile_alias(join.child(names::ALIAS), &mut aliases)?,
        });
    }

    Ok(GraphCommand::Select(SelectQuery { root, alias, joins }))
}

fn compile_alias(
    alias: Option<&SyntaxNode>,
    seen: &mut HashSet<String>,
) -> std::result::Result<Option<String>, SyntaxError> {
    let token = match alias.and_then(|a| a.child(names::SYMBOL)).and_then(SyntaxNode::token) {
        Some(token) => token,
        None => return Ok(None),
    };

    let name = token.value.to_lowercase();
    if !seen.insert(name.clone()) {
        return Err(SyntaxError::at_token("duplicate alias", &token.value, token.offset));
    }
    Ok(Some(name))
}

fn first_spec(node: &SyntaxNode) -> std::result::Result<&SyntaxNode, SyntaxError> {
    node.children()
        .iter()
        .find(|c| c.name() == names::NODE_SPEC || c.name() == names::EDGE_SPEC)
        .ok_or_else(|| error_at(node, "predicate expected"))
}

fn compile_selector(spec: &SyntaxNode) -> std::result::Result<Selector, SyntaxError> {
    let is_node = spec.name() == names::NODE_SPEC;
    if spec.has_child(names::WILDCARD) {
        return Ok(if is_node {
            Selector::Node(NodeQuery::all())
        } else {
            Selector::Edge(EdgeQuery::all())
        });
    }

    let mut seen = Seen::default();
    let predicates = read_attributes(spec.child(names::TAGS))?;

    if is_node {
        let mut query = NodeQuery::all();
        for attribute in predicates {
            match attribute.name.as_str() {
                attributes::KEY => {
                    seen.once(&attribute)?;
                    query.key = Some(normalize_key(attribute.required_value()?));
                }
                attributes::TAGS => query.tags.merge(&Tags::parse(attribute.value.as_deref().unwrap_or(""))),
                attributes::LINK => return Err(attribute.error("'link' cannot be used in a predicate")),
                attributes::FROM_KEY | attributes::TO_KEY | attributes::EDGE_TYPE => {
                    return Err(attribute.error(format!("'{}' is not valid for nodes", attribute.token.value)))
                }
                _ => query.tags.set(&attribute.name, attribute.value.clone()),
            }
        }
        Ok(Selector::Node(query))
    } else {
        let mut query = EdgeQuery::all();
        for attribute in predicates {
            let slot = match attribute.name.as_str() {
                attributes::KEY => &mut query.key,
                attributes::FROM_KEY => &mut query.from_key,
                attributes::TO_KEY => &mut query.to_key,
                attributes::EDGE_TYPE => &mut query.edge_type,
                attributes::TAGS => {
                    query.tags.merge(&Tags::parse(attribute.value.as_deref().unwrap_or("")));
                    continue;
                }
                attributes::LINK => return Err(attribute.error("'link' is not valid for edges")),
                _ => {
                    query.tags.set(&attribute.name, attribute.value.clone());
                    continue;
                }
            };
            seen.once(&attribute)?;
            *slot = Some(normalize_key(attribute.required_value()?));
        }
        Ok(Selector::Edge(query))
    }
}

fn error_at(node: &SyntaxNode, message: &str) -> SyntaxError {
    match node.first_token() {
        Some(token) => SyntaxError::at_token(message, &token.value, token.offset),
        None => SyntaxError::new(message, None, 0),
    }
}
