//! Delimiter-driven tokenizer
//!
//! Shared by the grammar compiler and the syntax parser. The delimiter set is
//! supplied by the caller (a compiled grammar derives it from its symbol
//! literals), so the same lexer tokenizes both grammar source and queries:
//!
//! ```text
//! add node key=node1, t1='hello world';
//! => [add] [node] [key] [=] [node1] [,] [t1] [=] ['hello world'] [;]
//! ```
//!
//! Whitespace only separates tokens. Single or double quotes produce one
//! `Quoted` token (quotes stripped, backslash escapes honored). Longer
//! delimiters win over shorter ones (`->` before `-`).

use crate::error::SyntaxError;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Word,
    Quoted,
    Delimiter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub value: String,
    pub kind: TokenKind,
    /// Character offset of the first character (the opening quote for
    /// quoted tokens).
    pub offset: usize,
}

impl Token {
    pub fn new(value: impl Into<String>, kind: TokenKind, offset: usize) -> Self {
        Token {
            value: value.into(),
            kind,
            offset,
        }
    }

    pub fn word(value: impl Into<String>) -> Self {
        Token::new(value, TokenKind::Word, 0)
    }

    pub fn is_delimiter(&self, delimiter: &str) -> bool {
        self.kind == TokenKind::Delimiter && self.value == delimiter
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TokenKind::Quoted => write!(f, "'{}'", self.value),
            _ => f.write_str(&self.value),
        }
    }
}

pub struct Lexer {
    input: Vec<char>,
    position: usize,
    current_char: Option<char>,
    delimiters: Vec<Vec<char>>,
    line_comment: Option<Vec<char>>,
}

impl Lexer {
    pub fn new<S: AsRef<str>>(input: &str, delimiters: &[S]) -> Self {
        let chars: Vec<char> = input.chars().collect();
        let current = chars.first().copied();

        let mut delimiters: Vec<Vec<char>> = delimiters
            .iter()
            .map(|d| d.as_ref().chars().collect::<Vec<char>>())
            .filter(|d| !d.is_empty())
            .collect();
        delimiters.sort_by(|a, b| b.len().cmp(&a.len()));
        delimiters.dedup();

        Lexer {
            input: chars,
            position: 0,
            current_char: current,
            delimiters,
            line_comment: None,
        }
    }

    /// Skip everything from `prefix` to the end of the line.
    pub fn with_line_comments(mut self, prefix: &str) -> Self {
        self.line_comment = Some(prefix.chars().collect());
        self
    }

    /// Tokenize the entire input
    pub fn tokenize(&mut self) -> Result<Vec<Token>, SyntaxError> {
        let mut tokens = Vec::new();

        while let Some(token) = self.next_token()? {
            tokens.push(token);
        }

        Ok(tokens)
    }

    /// Get the next token, `None` at end of input
    pub fn next_token(&mut self) -> Result<Option<Token>, SyntaxError> {
        self.skip_trivia();

        let ch = match self.current_char {
            None => return Ok(None),
            Some(ch) => ch,
        };

        if ch == '\'' || ch == '"' {
            return self.read_string(ch).map(Some);
        }

        if let Some(len) = self.delimiter_at(self.position) {
            let offset = self.position;
            let value: String = self.input[offset..offset + len].iter().collect();
            for _ in 0..len {
                self.advance();
            }
            return Ok(Some(Token::new(value, TokenKind::Delimiter, offset)));
        }

        Ok(Some(self.read_word()))
    }

    fn advance(&mut self) {
        self.position += 1;
        self.current_char = self.input.get(self.position).copied();
    }

    fn starts_with(&self, position: usize, pattern: &[char]) -> bool {
        self.input
            .get(position..position + pattern.len())
            .map(|slice| slice == pattern)
            .unwrap_or(false)
    }

    fn delimiter_at(&self, position: usize) -> Option<usize> {
        self.delimiters
            .iter()
            .find(|d| self.starts_with(position, d))
            .map(|d| d.len())
    }

    fn at_comment(&self) -> bool {
        match &self.line_comment {
            Some(prefix) => self.starts_with(self.position, prefix),
            None => false,
        }
    }

    fn skip_trivia(&mut self) {
        loop {
            while let Some(ch) = self.current_char {
                if ch.is_whitespace() {
                    self.advance();
                } else {
                    break;
                }
            }

            if !self.at_comment() {
                return;
            }

            while let Some(ch) = self.current_char {
                self.advance();
                if ch == '\n' {
                    break;
                }
            }
        }
    }

    fn read_word(&mut self) -> Token {
        let offset = self.position;
        let mut result = String::new();

        while let Some(ch) = self.current_char {
            if ch.is_whitespace()
                || ch == '\''
                || ch == '"'
                || self.delimiter_at(self.position).is_some()
                || self.at_comment()
            {
                break;
            }
            result.push(ch);
            self.advance();
        }

        Token::new(result, TokenKind::Word, offset)
    }

    fn read_string(&mut self, quote_char: char) -> Result<Token, SyntaxError> {
        let offset = self.position;
        self.advance(); // skip opening quote

        let mut result = String::new();
        let mut escaped = false;

        while let Some(ch) = self.current_char {
            if escaped {
                match ch {
                    'n' => result.push('\n'),
                    't' => result.push('\t'),
                    'r' => result.push('\r'),
                    '\\' => result.push('\\'),
                    '\'' => result.push('\''),
                    '"' => result.push('"'),
                    _ => {
                        result.push('\\');
                        result.push(ch);
                    }
                }
                escaped = false;
                self.advance();
            } else if ch == '\\' {
                escaped = true;
                self.advance();
            } else if ch == quote_char {
                self.advance(); // skip closing quote
                return Ok(Token::new(result, TokenKind::Quoted, offset));
            } else {
                result.push(ch);
                self.advance();
            }
        }

        Err(SyntaxError::at_token(
            "unterminated string literal",
            &format!("{}{}", quote_char, result),
            offset,
        ))
    }
}

/// Quote `value` so the lexer reads it back as a single `Quoted` token.
pub fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            _ => out.push(ch),
        }
    }
    out.push('\'');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELIMITERS: &[&str] = &[",", ";", "=", "(", ")", "[", "]", "->", "<-", "*"];

    fn values(input: &str) -> Vec<String> {
        Lexer::new(input, DELIMITERS)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.value)
            .collect()
    }

    #[test]
    fn test_words_and_delimiters() {
        assert_eq!(
            values("add node key=node1,t1=v1;"),
            vec!["add", "node", "key", "=", "node1", ",", "t1", "=", "v1", ";"]
        );
    }

    #[test]
    fn test_whitespace_collapsing() {
        assert_eq!(values("  select\n\t( key = a )  ;"), vec!["select", "(", "key", "=", "a", ")", ";"]);
    }

    #[test]
    fn test_longest_delimiter_wins() {
        let tokens = Lexer::new("(a)->[b]<-(c)", DELIMITERS).tokenize().unwrap();
        assert!(tokens[3].is_delimiter("->"));
        assert!(tokens[7].is_delimiter("<-"));
    }

    #[test]
    fn test_hyphenated_word_is_not_split() {
        assert_eq!(values("user-1 a->b"), vec!["user-1", "a", "->", "b"]);
    }

    #[test]
    fn test_quoted_strings() {
        let tokens = Lexer::new(r#"t='hello, world' u="it's" v='a\'b'"#, DELIMITERS)
            .tokenize()
            .unwrap();
        assert_eq!(tokens[2].value, "hello, world");
        assert_eq!(tokens[2].kind, TokenKind::Quoted);
        assert_eq!(tokens[2].offset, 2);
        assert_eq!(tokens[5].value, "it's");
        assert_eq!(tokens[8].value, "a'b");
    }

    #[test]
    fn test_unterminated_string() {
        let err = Lexer::new("t='open", DELIMITERS).tokenize().unwrap_err();
        assert_eq!(err.offset, 2);
        assert!(err.message.contains("unterminated"));
    }

    #[test]
    fn test_line_comments() {
        let tokens = Lexer::new("a = 'x'; // trailing\n// whole line\nb = c;", &["=", ";"])
            .with_line_comments("//")
            .tokenize()
            .unwrap();
        let values: Vec<&str> = tokens.iter().map(|t| t.value.as_str()).collect();
        assert_eq!(values, vec!["a", "=", "x", ";", "b", "=", "c", ";"]);
    }

    #[test]
    fn test_quote_round_trips_through_lexer() {
        let raw = "it's a, b=c";
        let tokens = Lexer::new(&quote(raw), DELIMITERS).tokenize().unwrap();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].value, raw);
    }
}
