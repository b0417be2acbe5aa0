//! Graph command grammar
//!
//! The concrete statement language, compiled once per process:
//!
//! ```text
//! add node key=node1, tags='t1=v1', link=payload;
//! add unique edge fromKey=node1, toKey=node2, edgeType=member;
//! update (key=node1) set t1=v1;
//! delete [fromKey=node1, edgeType=member];
//! select (key=user1) -> [edgeType=member] -> (*) as groups;
//! ```

use crate::error::SyntaxError;
use crate::meta_grammar::{Grammar, GrammarNode};
use crate::meta_lexer::{quote, Token};
use std::sync::OnceLock;

pub const GRAPH_GRAMMAR: &str = r#"
// terminals
symbol      = regex '^[A-Za-z0-9_][A-Za-z0-9_\-\.:@/#\$\+]*$' ;
value       = string ;

comma       = ',' ;
term        = ';' ;
equal       = '=' ;
open-node   = '(' ;
close-node  = ')' ;
open-edge   = '[' ;
close-edge  = ']' ;
wildcard    = '*' ;
forward     = '->' ;
reverse     = '<-' ;

add-sym     = 'add' ;
node-sym    = 'node' ;
edge-sym    = 'edge' ;
unique-sym  = 'unique' ;
update-sym  = 'update' ;
set-sym     = 'set' ;
delete-sym  = 'delete' ;
select-sym  = 'select' ;
as-sym      = 'as' ;

// attributes
tag         = symbol, [ equal, value ] ;
tags        = tag, { comma, tag } ;

// predicates
node-spec   = open-node, ( wildcard | tags ), close-node ;
edge-spec   = open-edge, ( wildcard | tags ), close-edge ;
alias       = as-sym, symbol ;
join        = ( forward | reverse ), ( node-spec | edge-spec ), [ alias ] ;

// statements
add-node    = add-sym, node-sym, tags, term ;
add-edge    = add-sym, [ unique-sym ], edge-sym, tags, term ;
update      = update-sym, ( node-spec | edge-spec ), set-sym, tags, term ;
delete      = delete-sym, ( node-spec | edge-spec ), term ;
select      = select-sym, ( node-spec | edge-spec ), [ alias ], { join }, term ;
"#;

/// Rule and terminal names the command compiler navigates by.
pub mod names {
    pub const ADD_NODE: &str = "add-node";
    pub const ADD_EDGE: &str = "add-edge";
    pub const UPDATE: &str = "update";
    pub const DELETE: &str = "delete";
    pub const SELECT: &str = "select";

    pub const TAGS: &str = "tags";
    pub const TAG: &str = "tag";
    pub const SYMBOL: &str = "symbol";
    pub const VALUE: &str = "value";
    pub const NODE_SPEC: &str = "node-spec";
    pub const EDGE_SPEC: &str = "edge-spec";
    pub const WILDCARD: &str = "wildcard";
    pub const ALIAS: &str = "alias";
    pub const JOIN: &str = "join";
    pub const FORWARD: &str = "forward";
    pub const UNIQUE: &str = "unique-sym";
}

static GRAMMAR: OnceLock<Result<Grammar, SyntaxError>> = OnceLock::new();

/// The compiled graph grammar, shared by every parser in the process.
pub fn graph_grammar() -> Result<&'static Grammar, SyntaxError> {
    match GRAMMAR.get_or_init(|| Grammar::compile(GRAPH_GRAMMAR)) {
        Ok(grammar) => Ok(grammar),
        Err(e) => Err(e.clone()),
    }
}

/// Render `value` so it reads back as one attribute value: plain symbols are
/// written as-is, anything else is quoted.
pub fn quote_value(value: &str) -> String {
    let plain = graph_grammar()
        .ok()
        .and_then(|grammar| match grammar.lookup(names::SYMBOL) {
            Some(GrammarNode::Terminal(symbol)) => {
                Some(symbol.matches(&Token::word(value), grammar.reserved_words()))
            }
            _ => None,
        })
        .unwrap_or(false);

    if plain {
        value.to_string()
    } else {
        quote(value)
    }
}
