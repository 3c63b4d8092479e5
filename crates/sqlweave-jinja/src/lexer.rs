//! Template lexer
//!
//! Splits a source file into tokens. The lexer starts in text mode, where
//! raw characters accumulate into `Text` tokens, and switches to block mode
//! between `{{ }}` / `{% %}` markers. Comments (`{# #}`) are dropped
//! without leaving text mode.

use crate::error::{Position, Result, TemplateError};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Text,
    Identifier,
    String,
    Number,
    True,
    False,
    Null,

    ExprOpen,
    ExprClose,
    BlockOpen,
    BlockClose,

    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Dot,
    Colon,
    Pipe,
    Tilde,

    Plus,
    Minus,
    Star,
    Power,
    Slash,
    FloorDiv,
    Percent,

    Assign,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,

    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Text => "text",
            Self::Identifier => "identifier",
            Self::String => "string",
            Self::Number => "number",
            Self::True => "`true`",
            Self::False => "`false`",
            Self::Null => "`null`",
            Self::ExprOpen => "`{{`",
            Self::ExprClose => "`}}`",
            Self::BlockOpen => "`{%`",
            Self::BlockClose => "`%}`",
            Self::LParen => "`(`",
            Self::RParen => "`)`",
            Self::LBracket => "`[`",
            Self::RBracket => "`]`",
            Self::LBrace => "`{`",
            Self::RBrace => "`}`",
            Self::Comma => "`,`",
            Self::Dot => "`.`",
            Self::Colon => "`:`",
            Self::Pipe => "`|`",
            Self::Tilde => "`~`",
            Self::Plus => "`+`",
            Self::Minus => "`-`",
            Self::Star => "`*`",
            Self::Power => "`**`",
            Self::Slash => "`/`",
            Self::FloorDiv => "`//`",
            Self::Percent => "`%`",
            Self::Assign => "`=`",
            Self::Eq => "`==`",
            Self::NotEq => "`!=`",
            Self::Lt => "`<`",
            Self::LtEq => "`<=`",
            Self::Gt => "`>`",
            Self::GtEq => "`>=`",
            Self::Eof => "end of file",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Literal text; for strings this is the content between the quotes
    pub text: String,
    pub start: Position,
    pub end: Position,
}

impl Token {
    /// Human readable description used in parse errors
    pub fn describe(&self) -> String {
        match self.kind {
            TokenKind::Identifier => format!("identifier `{}`", self.text),
            TokenKind::String => format!("string '{}'", self.text),
            TokenKind::Number => format!("number {}", self.text),
            TokenKind::Text => "text".to_string(),
            other => other.to_string(),
        }
    }

    pub fn is_identifier(&self, name: &str) -> bool {
        self.kind == TokenKind::Identifier && self.text == name
    }
}

pub struct Lexer {
    file: Arc<str>,
    input: Vec<char>,
    position: usize,
    row: usize,
    column: usize,
    brace_depth: usize,
    tokens: Vec<Token>,
}

impl Lexer {
    pub fn new(file: impl Into<Arc<str>>, source: &str) -> Self {
        Lexer {
            file: file.into(),
            input: source.chars().collect(),
            position: 0,
            row: 1,
            column: 1,
            brace_depth: 0,
            tokens: Vec::new(),
        }
    }

    /// Tokenize the whole input; the last token is always `Eof`
    pub fn tokenize(mut self) -> Result<Vec<Token>> {
        while self.current_char().is_some() {
            self.lex_text()?;
            if self.current_char().is_some() {
                self.lex_block()?;
            }
        }

        let end = self.here();
        self.tokens.push(Token {
            kind: TokenKind::Eof,
            text: String::new(),
            start: end.clone(),
            end,
        });
        Ok(self.tokens)
    }

    fn current_char(&self) -> Option<char> {
        self.input.get(self.position).copied()
    }

    fn peek_char(&self, offset: usize) -> Option<char> {
        self.input.get(self.position + offset).copied()
    }

    fn starts_with(&self, pattern: &str) -> bool {
        pattern
            .chars()
            .enumerate()
            .all(|(i, c)| self.peek_char(i) == Some(c))
    }

    fn here(&self) -> Position {
        Position::new(self.file.clone(), self.row, self.column)
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.current_char()?;
        self.position += 1;
        if ch == '\n' {
            self.row += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    fn advance_by(&mut self, count: usize) {
        for _ in 0..count {
            self.advance();
        }
    }

    fn skip_whitespace(&mut self) {
        while self.current_char().is_some_and(char::is_whitespace) {
            self.advance();
        }
    }

    fn push(&mut self, kind: TokenKind, text: impl Into<String>, start: Position) {
        let end = self.here();
        self.tokens.push(Token {
            kind,
            text: text.into(),
            start,
            end,
        });
    }

    /// Accumulate raw text up to the next `{{` / `{%` marker
    fn lex_text(&mut self) -> Result<()> {
        let start = self.here();
        let mut text = String::new();

        loop {
            match (self.current_char(), self.peek_char(1)) {
                (None, _) | (Some('{'), Some('{')) | (Some('{'), Some('%')) => break,
                (Some('{'), Some('#')) => {
                    if self.peek_char(2) == Some('-') {
                        truncate_trailing_whitespace(&mut text);
                    }
                    self.skip_comment()?;
                }
                (Some(ch), _) => {
                    text.push(ch);
                    self.advance();
                }
            }
        }

        // `{{-` and `{%-` strip whitespace before the marker
        if self.current_char().is_some() && self.peek_char(2) == Some('-') {
            truncate_trailing_whitespace(&mut text);
        }

        if !text.is_empty() {
            self.push(TokenKind::Text, text, start);
        }
        Ok(())
    }

    fn skip_comment(&mut self) -> Result<()> {
        let start = self.here();
        self.advance_by(2);

        loop {
            if self.starts_with("-#}") {
                self.advance_by(3);
                self.skip_whitespace();
                return Ok(());
            }
            if self.starts_with("#}") {
                self.advance_by(2);
                return Ok(());
            }
            if self.advance().is_none() {
                return Err(TemplateError::lex(&start, "unterminated comment"));
            }
        }
    }

    /// Lex one `{{ ... }}` or `{% ... %}` region, including its markers
    fn lex_block(&mut self) -> Result<()> {
        let start = self.here();
        let kind = if self.starts_with("{{") {
            TokenKind::ExprOpen
        } else {
            TokenKind::BlockOpen
        };
        let width = if self.peek_char(2) == Some('-') { 3 } else { 2 };
        let marker: String = self.input[self.position..self.position + width].iter().collect();
        self.advance_by(width);
        self.push(kind, marker, start);
        self.brace_depth = 0;

        loop {
            self.skip_whitespace();
            let Some(ch) = self.current_char() else {
                return Ok(());
            };

            if let Some((kind, marker)) = self.close_marker() {
                let start = self.here();
                self.advance_by(marker.len());
                self.push(kind, marker, start);
                if marker.starts_with('-') {
                    self.skip_whitespace();
                }
                return Ok(());
            }

            self.lex_token(ch)?;
        }
    }

    fn close_marker(&self) -> Option<(TokenKind, &'static str)> {
        if self.starts_with("-%}") {
            Some((TokenKind::BlockClose, "-%}"))
        } else if self.starts_with("%}") {
            Some((TokenKind::BlockClose, "%}"))
        } else if self.brace_depth == 0 && self.starts_with("-}}") {
            Some((TokenKind::ExprClose, "-}}"))
        } else if self.brace_depth == 0 && self.starts_with("}}") {
            Some((TokenKind::ExprClose, "}}"))
        } else {
            None
        }
    }

    fn lex_token(&mut self, ch: char) -> Result<()> {
        let start = self.here();

        if ch.is_alphabetic() || ch == '_' {
            let ident = self.read_identifier();
            let kind = match ident.to_ascii_lowercase().as_str() {
                "true" => TokenKind::True,
                "false" => TokenKind::False,
                "null" | "none" => TokenKind::Null,
                _ => TokenKind::Identifier,
            };
            self.push(kind, ident, start);
            return Ok(());
        }

        if ch.is_ascii_digit() {
            let number = self.read_number();
            self.push(TokenKind::Number, number, start);
            return Ok(());
        }

        if self.starts_with("'''") {
            let text = self.read_triple_quoted(&start)?;
            self.push(TokenKind::String, text, start);
            return Ok(());
        }

        if ch == '\'' || ch == '"' {
            let text = self.read_string(ch, &start)?;
            self.push(TokenKind::String, text, start);
            return Ok(());
        }

        let two: Option<TokenKind> = match (ch, self.peek_char(1)) {
            ('*', Some('*')) => Some(TokenKind::Power),
            ('/', Some('/')) => Some(TokenKind::FloorDiv),
            ('=', Some('=')) => Some(TokenKind::Eq),
            ('!', Some('=')) => Some(TokenKind::NotEq),
            ('<', Some('=')) => Some(TokenKind::LtEq),
            ('>', Some('=')) => Some(TokenKind::GtEq),
            _ => None,
        };
        if let Some(kind) = two {
            self.advance_by(2);
            let text: String = self.input[self.position - 2..self.position].iter().collect();
            self.push(kind, text, start);
            return Ok(());
        }

        let kind = match ch {
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '[' => TokenKind::LBracket,
            ']' => TokenKind::RBracket,
            '{' => {
                self.brace_depth += 1;
                TokenKind::LBrace
            }
            '}' => {
                self.brace_depth = self.brace_depth.saturating_sub(1);
                TokenKind::RBrace
            }
            ',' => TokenKind::Comma,
            '.' => TokenKind::Dot,
            ':' => TokenKind::Colon,
            '|' => TokenKind::Pipe,
            '~' => TokenKind::Tilde,
            '+' => TokenKind::Plus,
            '-' => TokenKind::Minus,
            '*' => TokenKind::Star,
            '/' => TokenKind::Slash,
            '%' => TokenKind::Percent,
            '=' => TokenKind::Assign,
            '<' => TokenKind::Lt,
            '>' => TokenKind::Gt,
            other => {
                return Err(TemplateError::lex(
                    &start,
                    format!("unexpected character `{}`", other),
                ))
            }
        };
        self.advance();
        self.push(kind, ch.to_string(), start);
        Ok(())
    }

    fn read_identifier(&mut self) -> String {
        let mut result = String::new();
        while let Some(ch) = self.current_char() {
            if ch.is_alphanumeric() || ch == '_' {
                result.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        result
    }

    fn read_number(&mut self) -> String {
        let mut number = String::new();
        let mut seen_point = false;

        while let Some(ch) = self.current_char() {
            if ch.is_ascii_digit() {
                number.push(ch);
                self.advance();
            } else if ch == '.'
                && !seen_point
                && self.peek_char(1).is_some_and(|c| c.is_ascii_digit())
            {
                seen_point = true;
                number.push(ch);
                self.advance();
            } else {
                break;
            }
        }

        number
    }

    fn read_string(&mut self, quote: char, start: &Position) -> Result<String> {
        let mut result = String::new();
        self.advance(); // opening quote

        while let Some(ch) = self.advance() {
            if ch == quote {
                return Ok(result);
            }
            result.push(ch);
        }

        Err(TemplateError::lex(start, "unterminated string"))
    }

    fn read_triple_quoted(&mut self, start: &Position) -> Result<String> {
        let mut result = String::new();
        self.advance_by(3);

        loop {
            if self.starts_with("'''") {
                self.advance_by(3);
                return Ok(result);
            }
            match self.advance() {
                Some(ch) => result.push(ch),
                None => return Err(TemplateError::lex(start, "unterminated string")),
            }
        }
    }
}

fn truncate_trailing_whitespace(text: &mut String) {
    let keep = text.trim_end().len();
    text.truncate(keep);
}

/// Convenience wrapper around `Lexer::new(..).tokenize()`
pub fn tokenize(file: &str, source: &str) -> Result<Vec<Token>> {
    Lexer::new(file, source).tokenize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize("test.sql", source)
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn plain_text_is_one_token() {
        let tokens = tokenize("test.sql", "select 1\nfrom t").unwrap();
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0].kind, TokenKind::Text);
        assert_eq!(tokens[0].text, "select 1\nfrom t");
        assert_eq!(tokens[1].kind, TokenKind::Eof);
    }

    #[test]
    fn expression_block_tokens() {
        assert_eq!(
            kinds("a {{ x.y[0] }} b"),
            vec![
                TokenKind::Text,
                TokenKind::ExprOpen,
                TokenKind::Identifier,
                TokenKind::Dot,
                TokenKind::Identifier,
                TokenKind::LBracket,
                TokenKind::Number,
                TokenKind::RBracket,
                TokenKind::ExprClose,
                TokenKind::Text,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn operators() {
        let test_cases = vec![
            ("**", TokenKind::Power),
            ("//", TokenKind::FloorDiv),
            ("==", TokenKind::Eq),
            ("!=", TokenKind::NotEq),
            ("<=", TokenKind::LtEq),
            (">=", TokenKind::GtEq),
            ("<", TokenKind::Lt),
            ("~", TokenKind::Tilde),
            ("|", TokenKind::Pipe),
            ("=", TokenKind::Assign),
            ("%", TokenKind::Percent),
        ];

        for (input, expected) in test_cases {
            let source = format!("{{{{ {} }}}}", input);
            let tokens = tokenize("test.sql", &source).unwrap();
            assert_eq!(tokens[1].kind, expected, "Failed for input: {}", input);
        }
    }

    #[test]
    fn literal_keywords_are_case_insensitive() {
        assert_eq!(
            kinds("{{ TRUE False null None }}")[1..5],
            [TokenKind::True, TokenKind::False, TokenKind::Null, TokenKind::Null]
        );
    }

    #[test]
    fn strings_are_not_unescaped() {
        let tokens = tokenize("test.sql", r#"{{ 'a\n' "b'c" '''x\ty'z''' }}"#).unwrap();
        assert_eq!(tokens[1].text, r"a\n");
        assert_eq!(tokens[2].text, "b'c");
        assert_eq!(tokens[3].text, r"x\ty'z");
    }

    #[test]
    fn numbers_take_one_decimal_point() {
        let tokens = tokenize("test.sql", "{{ 3.25 10 }}").unwrap();
        assert_eq!(tokens[1].text, "3.25");
        assert_eq!(tokens[2].text, "10");
    }

    #[test]
    fn comments_are_discarded() {
        let tokens = tokenize("test.sql", "a{# one\ntwo {{ x }} #}b").unwrap();
        assert_eq!(tokens[0].text, "ab");
        assert_eq!(tokens.len(), 2);
    }

    #[test]
    fn unterminated_comment_fails() {
        assert!(matches!(
            tokenize("test.sql", "a {# nope"),
            Err(TemplateError::Lex { .. })
        ));
    }

    #[test]
    fn unknown_character_in_block_fails_with_position() {
        let err = tokenize("test.sql", "select\n  {{ $x }}").unwrap_err();
        match err {
            TemplateError::Lex { position, .. } => {
                assert_eq!(position.row, 2);
                assert_eq!(position.column, 6);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn unknown_character_in_text_is_fine() {
        let tokens = tokenize("test.sql", "select $1 from t").unwrap();
        assert_eq!(tokens[0].text, "select $1 from t");
    }

    #[test]
    fn token_start_excludes_whitespace() {
        let tokens = tokenize("test.sql", "{{    name }}").unwrap();
        assert_eq!(tokens[1].start.column, 8);
    }

    #[test]
    fn whitespace_control_markers_trim_text() {
        let tokens = tokenize("test.sql", "a  \n{%- if x -%}\n  b").unwrap();
        assert_eq!(tokens[0].text, "a");
        assert_eq!(tokens.last().map(|t| t.kind), Some(TokenKind::Eof));
        let text: Vec<&str> = tokens
            .iter()
            .filter(|t| t.kind == TokenKind::Text)
            .map(|t| t.text.as_str())
            .collect();
        assert_eq!(text, vec!["a", "b"]);
    }

    #[test]
    fn nested_map_braces_do_not_close_block() {
        let kinds = kinds("{{ {'a': {'b': 1}} }}");
        assert_eq!(kinds.iter().filter(|k| **k == TokenKind::ExprClose).count(), 1);
        assert_eq!(kinds.iter().filter(|k| **k == TokenKind::RBrace).count(), 2);
    }
}
