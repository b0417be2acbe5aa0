//! Backtracking syntax parser
//!
//! Matches query text against a compiled [`Grammar`]. Input is tokenized with
//! the grammar's delimiter set, then each statement is matched against the
//! root rules in declaration order until the token stream is exhausted.
//!
//! Matching is recursive descent. Every rule attempt saves the cursor and
//! restores it when the attempt reports `NotFound`, so a sibling alternative
//! (or the caller) can retry from the same position.

use crate::error::SyntaxError;
use crate::meta_grammar::{Grammar, GrammarNode, Rule, RuleKind, Terminal};
use crate::meta_lexer::{Lexer, Token};

const MAX_DEPTH: usize = 256;

/// Node of a matched syntax tree. Anonymous groups are flattened into their
/// parent, so only named rules and matched terminals appear.
#[derive(Debug, Clone, PartialEq)]
pub enum SyntaxNode {
    Token { terminal: String, token: Token },
    Rule { name: String, children: Vec<SyntaxNode> },
}

impl SyntaxNode {
    /// Rule name, or the terminal name for tokens.
    pub fn name(&self) -> &str {
        match self {
            SyntaxNode::Token { terminal, .. } => terminal,
            SyntaxNode::Rule { name, .. } => name,
        }
    }

    pub fn token(&self) -> Option<&Token> {
        match self {
            SyntaxNode::Token { token, .. } => Some(token),
            SyntaxNode::Rule { .. } => None,
        }
    }

    pub fn children(&self) -> &[SyntaxNode] {
        match self {
            SyntaxNode::Token { .. } => &[],
            SyntaxNode::Rule { children, .. } => children,
        }
    }

    /// First direct child with the given name.
    pub fn child(&self, name: &str) -> Option<&SyntaxNode> {
        self.children().iter().find(|c| c.name() == name)
    }

    /// All direct children with the given name.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a SyntaxNode> + 'a {
        self.children().iter().filter(move |c| c.name() == name)
    }

    pub fn has_child(&self, name: &str) -> bool {
        self.child(name).is_some()
    }

    /// Leftmost token under this node.
    pub fn first_token(&self) -> Option<&Token> {
        match self {
            SyntaxNode::Token { token, .. } => Some(token),
            SyntaxNode::Rule { children, .. } => children.iter().find_map(|c| c.first_token()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyntaxTree {
    /// One entry per matched root rule, in input order.
    pub statements: Vec<SyntaxNode>,
}

pub struct SyntaxParser<'g> {
    grammar: &'g Grammar,
}

impl<'g> SyntaxParser<'g> {
    pub fn new(grammar: &'g Grammar) -> Self {
        SyntaxParser { grammar }
    }

    pub fn parse(&self, input: &str) -> Result<SyntaxTree, SyntaxError> {
        let tokens = Lexer::new(input, self.grammar.delimiters()).tokenize()?;
        let input_len = input.chars().count();

        if tokens.is_empty() {
            return Err(SyntaxError::at_end("empty input", input_len));
        }

        let mut cursor = Cursor::new(self.grammar, &tokens);
        let mut statements = Vec::new();

        while cursor.position < tokens.len() {
            let start = cursor.position;
            let mut matched = None;

            for root in self.grammar.roots() {
                if let Match::Found(mut nodes) = cursor.attempt(|c| c.match_reference(root, 0))? {
                    matched = nodes.pop();
                    break;
                }
            }

            match matched {
                Some(statement) if cursor.position > start => statements.push(statement),
                _ => return Err(cursor.failure(input_len)),
            }
        }

        Ok(SyntaxTree { statements })
    }
}

enum Match {
    Found(Vec<SyntaxNode>),
    NotFound,
}

struct Cursor<'a> {
    grammar: &'a Grammar,
    tokens: &'a [Token],
    position: usize,
    furthest: usize,
    expected: Vec<String>,
}

impl<'a> Cursor<'a> {
    fn new(grammar: &'a Grammar, tokens: &'a [Token]) -> Self {
        Cursor {
            grammar,
            tokens,
            position: 0,
            furthest: 0,
            expected: Vec::new(),
        }
    }

    /// Run `f` from a checkpoint; the cursor rewinds when it reports `NotFound`.
    fn attempt<F>(&mut self, f: F) -> Result<Match, SyntaxError>
    where
        F: FnOnce(&mut Self) -> Result<Match, SyntaxError>,
    {
        let checkpoint = self.position;
        let result = f(self)?;
        if let Match::NotFound = result {
            self.position = checkpoint;
        }
        Ok(result)
    }

    fn match_reference(&mut self, name: &str, depth: usize) -> Result<Match, SyntaxError> {
        if depth > MAX_DEPTH {
            return Err(self.error_here("grammar nesting too deep"));
        }

        let grammar = self.grammar;
        match grammar.lookup(name) {
            Some(GrammarNode::Terminal(terminal)) => Ok(self.match_terminal(terminal, name)),
            Some(GrammarNode::Rule(rule)) => match self.attempt(|c| c.match_rule(rule, depth + 1))? {
                Match::Found(children) => Ok(Match::Found(vec![SyntaxNode::Rule {
                    name: name.to_string(),
                    children,
                }])),
                Match::NotFound => Ok(Match::NotFound),
            },
            Some(other) => self.match_node(other, depth + 1),
            None => Err(self.error_here(format!("grammar references undefined rule '{}'", name))),
        }
    }

    fn match_node(&mut self, node: &GrammarNode, depth: usize) -> Result<Match, SyntaxError> {
        match node {
            GrammarNode::Terminal(terminal) | GrammarNode::VirtualTerminal(terminal) => {
                Ok(self.match_terminal(terminal, &terminal.name))
            }
            GrammarNode::Rule(rule) => self.attempt(|c| c.match_rule(rule, depth)),
            GrammarNode::RuleRef(reference) => self.match_reference(&reference.name, depth),
        }
    }

    fn match_rule(&mut self, rule: &Rule, depth: usize) -> Result<Match, SyntaxError> {
        match rule.kind {
            RuleKind::Sequence => self.match_sequence(&rule.children, depth),
            RuleKind::Or => {
                for child in &rule.children {
                    if let Match::Found(nodes) = self.attempt(|c| c.match_node(child, depth + 1))? {
                        return Ok(Match::Found(nodes));
                    }
                }
                Ok(Match::NotFound)
            }
            RuleKind::Optional => match self.attempt(|c| c.match_sequence(&rule.children, depth))? {
                Match::Found(nodes) => Ok(Match::Found(nodes)),
                Match::NotFound => Ok(Match::Found(Vec::new())),
            },
            RuleKind::Repeat => {
                let mut out = Vec::new();
                loop {
                    let before = self.position;
                    match self.attempt(|c| c.match_sequence(&rule.children, depth))? {
                        Match::Found(nodes) if self.position > before => out.extend(nodes),
                        _ => break,
                    }
                }
                Ok(Match::Found(out))
            }
        }
    }

    fn match_sequence(&mut self, children: &[GrammarNode], depth: usize) -> Result<Match, SyntaxError> {
        let mut out = Vec::new();
        for child in children {
            match self.match_node(child, depth + 1)? {
                Match::Found(nodes) => out.extend(nodes),
                Match::NotFound => return Ok(Match::NotFound),
            }
        }
        Ok(Match::Found(out))
    }

    fn match_terminal(&mut self, terminal: &Terminal, name: &str) -> Match {
        match self.tokens.get(self.position) {
            Some(token) if terminal.matches(token, self.grammar.reserved_words()) => {
                self.position += 1;
                Match::Found(vec![SyntaxNode::Token {
                    terminal: name.to_string(),
                    token: token.clone(),
                }])
            }
            _ => {
                self.record_failure(terminal.describe());
                Match::NotFound
            }
        }
    }

    fn record_failure(&mut self, expected: String) {
        if self.position > self.furthest {
            self.furthest = self.position;
            self.expected.clear();
        }
        if self.position == self.furthest && !self.expected.contains(&expected) {
            self.expected.push(expected);
        }
    }

    fn error_here(&self, message: impl Into<String>) -> SyntaxError {
        match self.tokens.get(self.position) {
            Some(token) => SyntaxError::at_token(message, &token.value, token.offset),
            None => SyntaxError::new(message, None, self.tokens.last().map(|t| t.offset).unwrap_or(0)),
        }
    }

    /// Error at the furthest position any terminal was tried.
    fn failure(&self, input_len: usize) -> SyntaxError {
        let expected = if self.expected.is_empty() {
            String::new()
        } else {
            format!(", expected {}", self.expected.join(" or "))
        };

        match self.tokens.get(self.furthest) {
            Some(token) => SyntaxError::at_token(format!("unexpected token{}", expected), &token.value, token.offset),
            None => SyntaxError::at_end(format!("unexpected end of input{}", expected), input_len),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRAMMAR: &str = r#"
        name = regex '^[a-z][a-z0-9]*$' ;
        value = string ;
        pair = name, [ '=', value ] ;
        list = pair, { ',', pair } ;
        stmt = 'put', ( '*' | list ), ';' ;
        drop = 'drop', name, ';' ;
    "#;

    fn grammar() -> Grammar {
        Grammar::compile(GRAMMAR).unwrap()
    }

    #[test]
    fn test_parse_batch() {
        let grammar = grammar();
        let tree = SyntaxParser::new(&grammar).parse("put a=1, b; drop c; put *;").unwrap();
        assert_eq!(tree.statements.len(), 3);
        assert_eq!(tree.statements[0].name(), "stmt");
        assert_eq!(tree.statements[1].name(), "drop");

        let list = tree.statements[0].child("list").unwrap();
        let pairs: Vec<_> = list.children_named("pair").collect();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].child("value").unwrap().token().unwrap().value, "1");
        assert!(pairs[1].child("value").is_none());
    }

    #[test]
    fn test_keywords_are_case_insensitive() {
        let grammar = grammar();
        assert!(SyntaxParser::new(&grammar).parse("PUT x;").is_ok());
    }

    #[test]
    fn test_reserved_word_is_not_a_name() {
        let grammar = grammar();
        let err = SyntaxParser::new(&grammar).parse("drop put;").unwrap_err();
        assert_eq!(err.token.as_deref(), Some("put"));
        assert_eq!(err.offset, 5);
    }

    #[test]
    fn test_quoted_values_are_free_form() {
        let grammar = grammar();
        let tree = SyntaxParser::new(&grammar).parse("put a='x, y; z';").unwrap();
        let pair = tree.statements[0].child("list").unwrap().child("pair").unwrap();
        assert_eq!(pair.child("value").unwrap().token().unwrap().value, "x, y; z");
    }

    #[test]
    fn test_missing_terminator_reports_end_of_input() {
        let grammar = grammar();
        let err = SyntaxParser::new(&grammar).parse("put a=1").unwrap_err();
        assert!(err.token.is_none());
        assert!(err.message.contains("';'"), "{}", err.message);
    }

    #[test]
    fn test_trailing_tokens_fail() {
        let grammar = grammar();
        let err = SyntaxParser::new(&grammar).parse("drop a; extra").unwrap_err();
        assert_eq!(err.token.as_deref(), Some("extra"));
        assert_eq!(err.offset, 8);
    }

    #[test]
    fn test_furthest_failure_position() {
        let grammar = grammar();
        let err = SyntaxParser::new(&grammar).parse("put a=1, ;").unwrap_err();
        assert_eq!(err.token.as_deref(), Some(";"));
        assert_eq!(err.offset, 9);
    }

    #[test]
    fn test_empty_input() {
        let grammar = grammar();
        assert!(SyntaxParser::new(&grammar).parse("   ").is_err());
    }

    #[test]
    fn test_or_backtracks_across_alternatives() {
        let grammar = Grammar::compile("root = ( 'a', 'b' | 'a', 'c' ), ';' ;").unwrap();
        let tree = SyntaxParser::new(&grammar).parse("a c;").unwrap();
        let values: Vec<&str> = tree.statements[0]
            .children()
            .iter()
            .filter_map(|n| n.token())
            .map(|t| t.value.as_str())
            .collect();
        assert_eq!(values, vec!["a", "c", ";"]);
    }
}
