//! Grammar compiler
//!
//! Compiles a textual grammar description into a [`Grammar`]: a lookup table
//! of named grammar nodes that the backtracking [`crate::syntax_parser`]
//! walks. Two definition forms are recognized:
//!
//! ```text
//! // terminals
//! symbol   = regex '^[a-z][a-z0-9]*$' ;   // regex-constrained
//! value    = string ;                     // free-form
//! term     = ';' ;                        // literal
//!
//! // production rules
//! tag      = symbol, [ '=', value ] ;     // [optional]
//! tags     = tag, { ',', tag } ;          // {repeat}
//! spec     = '(', ( '*' | tags ), ')' ;   // (group), `|` for alternatives
//! ```
//!
//! Bare names inside a rule are references resolved by name at match time,
//! so a rule may reference one declared later in the same source. Every
//! reference must resolve by the end of compilation. Quoted literals inside
//! rules become virtual terminals.
//!
//! Derived sets:
//! - delimiters: every literal that is not a plain word (`(`, `->`, ...)
//! - reserved words: every literal that is a plain word (`add`, `select`, ...)
//! - roots: production rules no other rule references, in declaration order

use crate::error::SyntaxError;
use crate::meta_lexer::{Lexer, Token, TokenKind};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use tracing::debug;

const META_DELIMITERS: &[&str] = &["=", ",", ";", "(", ")", "[", "]", "{", "}", "|"];

#[derive(Debug, Clone)]
pub enum TerminalMatcher {
    /// Case-insensitive match against an unquoted token.
    Literal(String),
    /// Any token that is not a delimiter.
    FreeForm,
    /// Unquoted word matching the pattern that is not a reserved word.
    Regex(Regex),
}

#[derive(Debug, Clone)]
pub struct Terminal {
    pub name: String,
    pub matcher: TerminalMatcher,
}

impl Terminal {
    pub fn matches(&self, token: &Token, reserved: &HashSet<String>) -> bool {
        match &self.matcher {
            TerminalMatcher::Literal(literal) => {
                token.kind != TokenKind::Quoted && token.value.eq_ignore_ascii_case(literal)
            }
            TerminalMatcher::FreeForm => token.kind != TokenKind::Delimiter,
            TerminalMatcher::Regex(regex) => {
                token.kind == TokenKind::Word
                    && !reserved.contains(&token.value.to_lowercase())
                    && regex.is_match(&token.value)
            }
        }
    }

    /// Human readable form for diagnostics.
    pub fn describe(&self) -> String {
        match &self.matcher {
            TerminalMatcher::Literal(literal) => format!("'{}'", literal),
            _ => self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    /// All children in order.
    Sequence,
    /// First child that matches.
    Or,
    /// Children as a sequence, zero or one time.
    Optional,
    /// Children as a sequence, zero or more times.
    Repeat,
}

#[derive(Debug, Clone)]
pub struct Rule {
    /// `None` for anonymous groups.
    pub name: Option<String>,
    pub kind: RuleKind,
    pub children: Vec<GrammarNode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleRef {
    pub name: String,
    pub offset: usize,
}

#[derive(Debug, Clone)]
pub enum GrammarNode {
    Terminal(Terminal),
    VirtualTerminal(Terminal),
    Rule(Rule),
    RuleRef(RuleRef),
}

#[derive(Debug, Clone)]
pub struct Grammar {
    definitions: HashMap<String, GrammarNode>,
    order: Vec<String>,
    roots: Vec<String>,
    delimiters: Vec<String>,
    reserved: HashSet<String>,
}

impl Grammar {
    /// Compile grammar source. Any malformed definition aborts the compile.
    pub fn compile(source: &str) -> Result<Grammar, SyntaxError> {
        let tokens = Lexer::new(source, META_DELIMITERS)
            .with_line_comments("//")
            .tokenize()?;

        let mut compiler = GrammarCompiler {
            tokens,
            position: 0,
            source_len: source.chars().count(),
        };
        compiler.compile()
    }

    pub fn lookup(&self, name: &str) -> Option<&GrammarNode> {
        self.definitions.get(name)
    }

    pub fn roots(&self) -> &[String] {
        &self.roots
    }

    pub fn delimiters(&self) -> &[String] {
        &self.delimiters
    }

    pub fn reserved_words(&self) -> &HashSet<String> {
        &self.reserved
    }

    pub fn is_reserved(&self, word: &str) -> bool {
        self.reserved.contains(&word.to_lowercase())
    }

    /// Definition names in declaration order.
    pub fn names(&self) -> &[String] {
        &self.order
    }
}

struct GrammarCompiler {
    tokens: Vec<Token>,
    position: usize,
    source_len: usize,
}

impl GrammarCompiler {
    fn compile(&mut self) -> Result<Grammar, SyntaxError> {
        let mut definitions = HashMap::new();
        let mut order = Vec::new();

        while self.position < self.tokens.len() {
            let name_token = self.expect_word("definition name")?;
            self.expect_delimiter("=")?;

            if definitions.contains_key(&name_token.value) {
                return Err(SyntaxError::at_token(
                    "duplicate definition",
                    &name_token.value,
                    name_token.offset,
                ));
            }

            let node = match self.parse_terminal(&name_token.value)? {
                Some(terminal) => GrammarNode::Terminal(terminal),
                None => {
                    let mut rule = self.parse_group(None)?;
                    rule.name = Some(name_token.value.clone());
                    GrammarNode::Rule(rule)
                }
            };

            order.push(name_token.value.clone());
            definitions.insert(name_token.value, node);
        }

        if definitions.is_empty() {
            return Err(SyntaxError::at_end("grammar has no definitions", self.source_len));
        }

        let mut referenced = HashSet::new();
        let mut literals = Vec::new();
        for name in &order {
            if let Some(node) = definitions.get(name) {
                collect(node, &mut referenced, &mut literals);
            }
        }

        for reference in &referenced {
            if !definitions.contains_key(&reference.name) {
                return Err(SyntaxError::at_token(
                    "reference to undefined rule",
                    &reference.name,
                    reference.offset,
                ));
            }
        }

        let referenced_names: HashSet<&str> = referenced.iter().map(|r| r.name.as_str()).collect();
        let roots: Vec<String> = order
            .iter()
            .filter(|name| matches!(definitions.get(*name), Some(GrammarNode::Rule(_))))
            .filter(|name| !referenced_names.contains(name.as_str()))
            .cloned()
            .collect();

        if roots.is_empty() {
            return Err(SyntaxError::at_end("grammar has no root rules", self.source_len));
        }

        let mut delimiters = Vec::new();
        let mut reserved = HashSet::new();
        for literal in literals {
            if is_plain_word(&literal) {
                reserved.insert(literal.to_lowercase());
            } else if !delimiters.contains(&literal) {
                delimiters.push(literal);
            }
        }

        debug!(
            definitions = order.len(),
            roots = roots.len(),
            delimiters = delimiters.len(),
            reserved = reserved.len(),
            "grammar compiled"
        );

        Ok(Grammar {
            definitions,
            order,
            roots,
            delimiters,
            reserved,
        })
    }

    /// `'literal' ;`, `regex 'pattern' ;` or `string ;`. Returns `None` (with
    /// the cursor untouched) when the body is a production rule.
    fn parse_terminal(&mut self, name: &str) -> Result<Option<Terminal>, SyntaxError> {
        let start = self.position;
        let first = match self.tokens.get(start) {
            Some(token) => token.clone(),
            None => return Err(SyntaxError::at_end("expected definition body", self.source_len)),
        };
        let second = self.tokens.get(start + 1).cloned();
        let third = self.tokens.get(start + 2).cloned();
        let is_term = |t: &Option<Token>| t.as_ref().map(|t| t.is_delimiter(";")).unwrap_or(false);

        let matcher = match first.kind {
            TokenKind::Quoted if is_term(&second) => {
                if first.value.is_empty() {
                    return Err(SyntaxError::at_token("empty literal", "''", first.offset));
                }
                self.position += 2;
                TerminalMatcher::Literal(first.value)
            }
            TokenKind::Word if first.value == "string" && is_term(&second) => {
                self.position += 2;
                TerminalMatcher::FreeForm
            }
            TokenKind::Word if first.value == "regex" => {
                let pattern = match second {
                    Some(token) if token.kind == TokenKind::Quoted => token,
                    Some(token) => {
                        return Err(SyntaxError::at_token(
                            "expected quoted regex pattern",
                            &token.value,
                            token.offset,
                        ))
                    }
                    None => return Err(SyntaxError::at_end("expected quoted regex pattern", self.source_len)),
                };
                if !is_term(&third) {
                    return Err(match third {
                        Some(token) => SyntaxError::at_token("expected ';'", &token.value, token.offset),
                        None => SyntaxError::at_end("expected ';'", self.source_len),
                    });
                }
                let regex = Regex::new(&pattern.value).map_err(|e| {
                    SyntaxError::at_token(format!("invalid regex: {}", e), &pattern.value, pattern.offset)
                })?;
                self.position += 3;
                TerminalMatcher::Regex(regex)
            }
            _ => return Ok(None),
        };

        Ok(Some(Terminal {
            name: name.to_string(),
            matcher,
        }))
    }

    /// Parse elements up to `closing` (or `;` for a top-level body).
    fn parse_group(&mut self, closing: Option<&str>) -> Result<Rule, SyntaxError> {
        let terminator = closing.unwrap_or(";");
        let mut alternatives: Vec<Vec<GrammarNode>> = vec![Vec::new()];
        let mut expect_separator = false;

        loop {
            let token = match self.tokens.get(self.position) {
                Some(token) => token.clone(),
                None => {
                    return Err(SyntaxError::at_end(
                        format!("expected '{}'", terminator),
                        self.source_len,
                    ))
                }
            };
            self.position += 1;

            if token.kind == TokenKind::Delimiter {
                match token.value.as_str() {
                    v if v == terminator => {
                        if !expect_separator {
                            return Err(SyntaxError::at_token("expected rule element", &token.value, token.offset));
                        }
                        break;
                    }
                    "," | "|" => {
                        if !expect_separator {
                            return Err(SyntaxError::at_token("expected rule element", &token.value, token.offset));
                        }
                        if token.value == "|" {
                            alternatives.push(Vec::new());
                        }
                        expect_separator = false;
                        continue;
                    }
                    "(" | "[" | "{" => {
                        self.require_separator(expect_separator, &token)?;
                        let (close, kind) = match token.value.as_str() {
                            "(" => (")", None),
                            "[" => ("]", Some(RuleKind::Optional)),
                            _ => ("}", Some(RuleKind::Repeat)),
                        };
                        let inner = self.parse_group(Some(close))?;
                        let node = match kind {
                            None => GrammarNode::Rule(inner),
                            Some(kind) => GrammarNode::Rule(Rule {
                                name: None,
                                kind,
                                children: vec![GrammarNode::Rule(inner)],
                            }),
                        };
                        push(&mut alternatives, node);
                        expect_separator = true;
                        continue;
                    }
                    _ => {
                        return Err(SyntaxError::at_token(
                            format!("unexpected '{}', expected '{}'", token.value, terminator),
                            &token.value,
                            token.offset,
                        ))
                    }
                }
            }

            self.require_separator(expect_separator, &token)?;
            let node = match token.kind {
                TokenKind::Quoted => {
                    if token.value.is_empty() {
                        return Err(SyntaxError::at_token("empty literal", "''", token.offset));
                    }
                    GrammarNode::VirtualTerminal(Terminal {
                        name: token.value.clone(),
                        matcher: TerminalMatcher::Literal(token.value.clone()),
                    })
                }
                _ => GrammarNode::RuleRef(RuleRef {
                    name: token.value.clone(),
                    offset: token.offset,
                }),
            };
            push(&mut alternatives, node);
            expect_separator = true;
        }

        if alternatives.len() == 1 {
            let children = alternatives.pop().unwrap_or_default();
            return Ok(Rule {
                name: None,
                kind: RuleKind::Sequence,
                children,
            });
        }

        let children = alternatives
            .into_iter()
            .map(|mut alternative| {
                if alternative.len() == 1 {
                    alternative.remove(0)
                } else {
                    GrammarNode::Rule(Rule {
                        name: None,
                        kind: RuleKind::Sequence,
                        children: alternative,
                    })
                }
            })
            .collect();

        Ok(Rule {
            name: None,
            kind: RuleKind::Or,
            children,
        })
    }

    fn require_separator(&self, expect_separator: bool, token: &Token) -> Result<(), SyntaxError> {
        if expect_separator {
            Err(SyntaxError::at_token("expected ',' or '|' between elements", &token.value, token.offset))
        } else {
            Ok(())
        }
    }

    fn expect_word(&mut self, what: &str) -> Result<Token, SyntaxError> {
        match self.tokens.get(self.position) {
            Some(token) if token.kind == TokenKind::Word => {
                self.position += 1;
                Ok(token.clone())
            }
            Some(token) => Err(SyntaxError::at_token(format!("expected {}", what), &token.value, token.offset)),
            None => Err(SyntaxError::at_end(format!("expected {}", what), self.source_len)),
        }
    }

    fn expect_delimiter(&mut self, delimiter: &str) -> Result<(), SyntaxError> {
        match self.tokens.get(self.position) {
            Some(token) if token.is_delimiter(delimiter) => {
                self.position += 1;
                Ok(())
            }
            Some(token) => Err(SyntaxError::at_token(
                format!("expected '{}'", delimiter),
                &token.value,
                token.offset,
            )),
            None => Err(SyntaxError::at_end(format!("expected '{}'", delimiter), self.source_len)),
        }
    }
}

fn push(alternatives: &mut [Vec<GrammarNode>], node: GrammarNode) {
    if let Some(last) = alternatives.last_mut() {
        last.push(node);
    }
}

fn collect(node: &GrammarNode, references: &mut HashSet<RuleRefKey>, literals: &mut Vec<String>) {
    match node {
        GrammarNode::Terminal(t) | GrammarNode::VirtualTerminal(t) => {
            if let TerminalMatcher::Literal(literal) = &t.matcher {
                if !literals.contains(literal) {
                    literals.push(literal.clone());
                }
            }
        }
        GrammarNode::Rule(rule) => {
            for child in &rule.children {
                collect(child, references, literals);
            }
        }
        GrammarNode::RuleRef(reference) => {
            references.insert(RuleRefKey {
                name: reference.name.clone(),
                offset: reference.offset,
            });
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RuleRefKey {
    name: String,
    offset: usize,
}

fn is_plain_word(literal: &str) -> bool {
    literal.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-')
        && literal.chars().any(|c| c.is_alphabetic())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        // terminals
        symbol = regex '^[a-z][a-z0-9]*$' ;
        value = string ;
        term = ';' ;

        stmt = 'let', symbol, [ '=', value ], { ',', pair }, term ;
        pair = symbol, ( '+' | '-' ), value ;
    "#;

    #[test]
    fn test_compile_sample() {
        let grammar = Grammar::compile(SAMPLE).unwrap();
        assert_eq!(grammar.names(), &["symbol", "value", "term", "stmt", "pair"]);
        assert_eq!(grammar.roots(), &["stmt".to_string()]);
        assert!(grammar.is_reserved("LET"));
        for delimiter in [";", "=", ",", "+", "-"] {
            assert!(grammar.delimiters().contains(&delimiter.to_string()), "{}", delimiter);
        }
    }

    #[test]
    fn test_rule_shapes() {
        let grammar = Grammar::compile(SAMPLE).unwrap();
        let stmt = match grammar.lookup("stmt") {
            Some(GrammarNode::Rule(rule)) => rule,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(stmt.kind, RuleKind::Sequence);
        assert_eq!(stmt.children.len(), 5);
        assert!(matches!(stmt.children[0], GrammarNode::VirtualTerminal(_)));
        assert!(matches!(&stmt.children[2], GrammarNode::Rule(r) if r.kind == RuleKind::Optional));
        assert!(matches!(&stmt.children[3], GrammarNode::Rule(r) if r.kind == RuleKind::Repeat));

        let pair = match grammar.lookup("pair") {
            Some(GrammarNode::Rule(rule)) => rule,
            other => panic!("unexpected {:?}", other),
        };
        assert!(matches!(&pair.children[1], GrammarNode::Rule(r) if r.kind == RuleKind::Or && r.children.len() == 2));
    }

    #[test]
    fn test_top_level_alternatives() {
        let grammar = Grammar::compile("a = 'x' ; b = 'y' ; root = a | b, a ;").unwrap();
        match grammar.lookup("root") {
            Some(GrammarNode::Rule(rule)) => {
                assert_eq!(rule.kind, RuleKind::Or);
                assert_eq!(rule.children.len(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_forward_reference() {
        let grammar = Grammar::compile("root = later, ';' ; later = 'x' ;").unwrap();
        assert_eq!(grammar.roots(), &["root".to_string()]);
    }

    #[test]
    fn test_undefined_reference() {
        let err = Grammar::compile("root = missing, ';' ;").unwrap_err();
        assert_eq!(err.token.as_deref(), Some("missing"));
        assert_eq!(err.offset, 7);
    }

    #[test]
    fn test_missing_separator() {
        let err = Grammar::compile("root = 'a' 'b' ;").unwrap_err();
        assert!(err.message.contains("between elements"));
        assert_eq!(err.token.as_deref(), Some("b"));
    }

    #[test]
    fn test_unclosed_group() {
        let err = Grammar::compile("root = 'a', [ 'b' ;").unwrap_err();
        assert_eq!(err.token.as_deref(), Some(";"));
    }

    #[test]
    fn test_mismatched_bracket() {
        let err = Grammar::compile("root = ( 'a' ] ;").unwrap_err();
        assert_eq!(err.token.as_deref(), Some("]"));
    }

    #[test]
    fn test_invalid_regex() {
        let err = Grammar::compile("sym = regex '[unclosed' ; root = sym ;").unwrap_err();
        assert!(err.message.contains("invalid regex"));
    }

    #[test]
    fn test_duplicate_definition() {
        let err = Grammar::compile("a = 'x' ; a = 'y' ; root = a ;").unwrap_err();
        assert_eq!(err.message, "duplicate definition");
    }

    #[test]
    fn test_no_rules() {
        assert!(Grammar::compile("").is_err());
        let err = Grammar::compile("a = 'x' ;").unwrap_err();
        assert!(err.message.contains("no root rules"));
    }

    #[test]
    fn test_regex_terminal_rejects_reserved_words() {
        let grammar = Grammar::compile(SAMPLE).unwrap();
        let symbol = match grammar.lookup("symbol") {
            Some(GrammarNode::Terminal(t)) => t,
            other => panic!("unexpected {:?}", other),
        };
        assert!(symbol.matches(&Token::word("name1"), grammar.reserved_words()));
        assert!(!symbol.matches(&Token::word("let"), grammar.reserved_words()));
        assert!(!symbol.matches(&Token::word("1abc"), grammar.reserved_words()));
    }
}
