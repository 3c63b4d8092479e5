//! Recursive-descent template parser
//!
//! Block statements dispatch on their first identifier. A block holding a
//! lone identifier (`{% endif %}`, `{% else %}`) is an atom: it is never
//! consumed by the statement that opened it, but handed back to the
//! body-collection loop that listed it as a terminator.

use crate::ast::{
    Argument, BinaryOp, Body, Branch, MacroSyntax, Node, NodeKind, Parameter, UnaryOp,
};
use crate::error::{Position, Result, TemplateError};
use crate::lexer::{tokenize, Token, TokenKind};
use std::sync::Arc;

pub struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    /// `tokens` must end with an `Eof` token, as produced by the lexer
    pub fn new(tokens: Vec<Token>) -> Self {
        Parser {
            tokens,
            position: 0,
        }
    }

    /// Parse a whole file into its top-level body
    pub fn parse(mut self) -> Result<Body> {
        let (mut body, _) = self.parse_body(&[])?;
        let eof = self.expect(TokenKind::Eof, "end of file")?;
        body.nodes.push(Node::new(NodeKind::EndOfFile, eof.start));
        Ok(body)
    }

    fn peek(&self) -> &Token {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        let last = self.tokens.len().saturating_sub(1);
        &self.tokens[(self.position + offset).min(last)]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.position < self.tokens.len() - 1 {
            self.position += 1;
        }
        token
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.peek().kind == kind
    }

    fn check_keyword(&self, keyword: &str) -> bool {
        self.peek().is_identifier(keyword)
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.check_keyword(keyword) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error(&self, expected: impl Into<String>) -> TemplateError {
        let token = self.peek();
        TemplateError::parse(&token.start, expected, token.describe())
    }

    fn expect(&mut self, kind: TokenKind, expected: &str) -> Result<Token> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(self.error(expected))
        }
    }

    fn expect_identifier(&mut self) -> Result<Token> {
        self.expect(TokenKind::Identifier, "identifier")
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<()> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.error(format!("`{}`", keyword)))
        }
    }

    fn expect_block_close(&mut self) -> Result<()> {
        self.expect(TokenKind::BlockClose, "`%}`").map(|_| ())
    }

    /// Collect nodes until one of `terminators` (or end of file when the
    /// list is empty). Returns the terminator that stopped collection; its
    /// block-open and keyword are consumed, the block-close is consumed for
    /// everything except `elif`, whose condition belongs to the caller.
    fn parse_body(&mut self, terminators: &[&str]) -> Result<(Body, Option<String>)> {
        let mut nodes = Vec::new();

        loop {
            let token = self.peek().clone();
            match token.kind {
                TokenKind::Eof => {
                    if terminators.is_empty() {
                        return Ok((Body::new(nodes), None));
                    }
                    let expected = terminators
                        .iter()
                        .map(|t| format!("`{{% {} %}}`", t))
                        .collect::<Vec<_>>()
                        .join(" or ");
                    return Err(self.error(expected));
                }
                TokenKind::Text => {
                    self.advance();
                    nodes.push(Node::new(NodeKind::Text(token.text), token.start));
                }
                TokenKind::ExprOpen => {
                    self.advance();
                    let expr = self.parse_expression()?;
                    self.expect(TokenKind::ExprClose, "`}}`")?;
                    nodes.push(expr);
                }
                TokenKind::BlockOpen => {
                    let keyword = self.peek_at(1).clone();
                    if keyword.kind != TokenKind::Identifier {
                        self.advance();
                        return Err(self.error("block keyword"));
                    }

                    if terminators.contains(&keyword.text.as_str()) {
                        self.advance();
                        self.advance();
                        if keyword.text != "elif" {
                            self.expect_block_close()?;
                        }
                        return Ok((Body::new(nodes), Some(keyword.text)));
                    }

                    nodes.push(self.parse_statement()?);
                }
                _ => return Err(self.error("text, `{{` or `{%`")),
            }
        }
    }

    fn parse_statement(&mut self) -> Result<Node> {
        let open = self.expect(TokenKind::BlockOpen, "`{%`")?;
        let keyword = self.expect_identifier()?;
        let position = open.start;

        match keyword.text.as_str() {
            "macro" => self.parse_macro(position),
            "set" => self.parse_set(position),
            "for" => self.parse_for(position),
            "if" => self.parse_if(position),
            "call" => self.parse_call_block(position),
            "do" => {
                let expr = self.parse_expression()?;
                self.expect_block_close()?;
                Ok(Node::new(NodeKind::Do(Box::new(expr)), position))
            }
            _ if self.check(TokenKind::BlockClose) => Err(TemplateError::parse(
                &keyword.start,
                "a statement",
                format!("unexpected `{{% {} %}}`", keyword.text),
            )),
            _ => self.parse_unsupported(keyword.text, position),
        }
    }

    fn parse_macro(&mut self, position: Position) -> Result<Node> {
        let name = self.expect_identifier()?.text;
        self.expect(TokenKind::LParen, "`(`")?;

        let mut params = Vec::new();
        while !self.check(TokenKind::RParen) {
            let param = self.expect_identifier()?.text;
            let default = if self.eat(TokenKind::Assign) {
                Some(self.parse_expression()?)
            } else {
                None
            };
            params.push(Parameter {
                name: param,
                default,
            });
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen, "`)`")?;
        self.expect_block_close()?;

        let (body, _) = self.parse_body(&["endmacro"])?;
        Ok(Node::new(
            NodeKind::Macro(Arc::new(MacroSyntax { name, params, body })),
            position,
        ))
    }

    fn parse_set(&mut self, position: Position) -> Result<Node> {
        let name = self.expect_identifier()?.text;

        if self.eat(TokenKind::Assign) {
            let value = self.parse_expression()?;
            self.expect_block_close()?;
            return Ok(Node::new(
                NodeKind::Set {
                    name,
                    value: Box::new(value),
                },
                position,
            ));
        }

        if self.eat(TokenKind::BlockClose) {
            let (body, _) = self.parse_body(&["endset"])?;
            return Ok(Node::new(NodeKind::SetBlock { name, body }, position));
        }

        Err(self.error("`=` or `%}`"))
    }

    fn parse_for(&mut self, position: Position) -> Result<Node> {
        let first = self.expect_identifier()?.text;
        let (key, value) = if self.eat(TokenKind::Comma) {
            (Some(first), self.expect_identifier()?.text)
        } else {
            (None, first)
        };

        self.expect_keyword("in")?;
        let source = self.parse_expression()?;
        self.expect_block_close()?;

        let (body, terminator) = self.parse_body(&["endfor", "else"])?;
        let otherwise = if terminator.as_deref() == Some("else") {
            Some(self.parse_body(&["endfor"])?.0)
        } else {
            None
        };

        Ok(Node::new(
            NodeKind::For {
                key,
                value,
                source: Box::new(source),
                body,
                otherwise,
            },
            position,
        ))
    }

    fn parse_if(&mut self, position: Position) -> Result<Node> {
        let mut branches = Vec::new();
        let mut otherwise = None;
        let mut condition = self.parse_expression()?;
        self.expect_block_close()?;

        loop {
            let (body, terminator) = self.parse_body(&["elif", "else", "endif"])?;
            branches.push(Branch { condition, body });

            match terminator.as_deref() {
                Some("elif") => {
                    condition = self.parse_expression()?;
                    self.expect_block_close()?;
                }
                Some("else") => {
                    otherwise = Some(self.parse_body(&["endif"])?.0);
                    break;
                }
                _ => break,
            }
        }

        Ok(Node::new(NodeKind::If { branches, otherwise }, position))
    }

    fn parse_call_block(&mut self, position: Position) -> Result<Node> {
        let call = self.parse_postfix()?;
        if !matches!(call.kind, NodeKind::Call { .. }) {
            return Err(TemplateError::parse(
                &call.position,
                "a macro call",
                call.to_string(),
            ));
        }
        self.expect_block_close()?;

        let (body, _) = self.parse_body(&["endcall"])?;
        Ok(Node::new(
            NodeKind::CallBlock {
                call: Box::new(call),
                body: Arc::new(body),
            },
            position,
        ))
    }

    fn parse_unsupported(&mut self, keyword: String, position: Position) -> Result<Node> {
        let mut header = Vec::new();
        while !self.check(TokenKind::BlockClose) {
            if self.check(TokenKind::Eof) {
                return Err(self.error("`%}`"));
            }
            let token = self.advance();
            header.push(match token.kind {
                TokenKind::String => format!("'{}'", token.text),
                _ => token.text,
            });
        }
        self.expect_block_close()?;

        let end = format!("end{}", keyword);
        let (body, _) = self.parse_body(&[end.as_str()])?;
        Ok(Node::new(
            NodeKind::Unsupported {
                keyword,
                header: header.join(" "),
                body,
            },
            position,
        ))
    }

    /// expression := conditional
    pub fn parse_expression(&mut self) -> Result<Node> {
        let then = self.parse_or()?;

        if self.check_keyword("if") {
            let position = then.position.clone();
            self.advance();
            let condition = self.parse_or()?;
            let otherwise = if self.eat_keyword("else") {
                Some(Box::new(self.parse_expression()?))
            } else {
                None
            };
            return Ok(Node::new(
                NodeKind::Conditional {
                    then: Box::new(then),
                    condition: Box::new(condition),
                    otherwise,
                },
                position,
            ));
        }

        Ok(then)
    }

    fn parse_or(&mut self) -> Result<Node> {
        let mut lhs = self.parse_and()?;
        while self.check_keyword("or") {
            self.advance();
            let rhs = self.parse_and()?;
            lhs = binary(BinaryOp::Or, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Node> {
        let mut lhs = self.parse_not()?;
        while self.check_keyword("and") {
            self.advance();
            let rhs = self.parse_not()?;
            lhs = binary(BinaryOp::And, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Node> {
        if self.check_keyword("not") {
            let position = self.advance().start;
            let operand = self.parse_not()?;
            return Ok(unary(UnaryOp::Not, operand, position));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Node> {
        let mut lhs = self.parse_concat()?;

        loop {
            let op = match self.peek().kind {
                TokenKind::Eq => Some(BinaryOp::Eq),
                TokenKind::NotEq => Some(BinaryOp::NotEq),
                TokenKind::Lt => Some(BinaryOp::Lt),
                TokenKind::LtEq => Some(BinaryOp::LtEq),
                TokenKind::Gt => Some(BinaryOp::Gt),
                TokenKind::GtEq => Some(BinaryOp::GtEq),
                _ => None,
            };

            if let Some(op) = op {
                self.advance();
                let rhs = self.parse_concat()?;
                lhs = binary(op, lhs, rhs);
            } else if self.check_keyword("in") {
                self.advance();
                let haystack = self.parse_concat()?;
                lhs = membership(lhs, haystack, false);
            } else if self.check_keyword("not") && self.peek_at(1).is_identifier("in") {
                self.advance();
                self.advance();
                let haystack = self.parse_concat()?;
                lhs = membership(lhs, haystack, true);
            } else if self.check_keyword("is") {
                self.advance();
                lhs = self.parse_test(lhs)?;
            } else {
                return Ok(lhs);
            }
        }
    }

    fn parse_test(&mut self, value: Node) -> Result<Node> {
        let negated = self.eat_keyword("not");
        let name = match self.peek().kind {
            TokenKind::Identifier | TokenKind::True | TokenKind::False | TokenKind::Null => {
                self.advance().text.to_ascii_lowercase()
            }
            _ => return Err(self.error("test name")),
        };
        let args = if self.eat(TokenKind::LParen) {
            self.parse_arguments()?
        } else {
            Vec::new()
        };

        let position = value.position.clone();
        Ok(Node::new(
            NodeKind::Test {
                value: Box::new(value),
                name,
                args,
                negated,
            },
            position,
        ))
    }

    fn parse_concat(&mut self) -> Result<Node> {
        let mut lhs = self.parse_additive()?;
        while self.eat(TokenKind::Tilde) {
            let rhs = self.parse_additive()?;
            lhs = binary(BinaryOp::Concat, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Node> {
        let mut lhs = self.parse_term()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.parse_term()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn parse_term(&mut self) -> Result<Node> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::FloorDiv => BinaryOp::FloorDiv,
                TokenKind::Percent => BinaryOp::Mod,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn parse_unary(&mut self) -> Result<Node> {
        let op = match self.peek().kind {
            TokenKind::Minus => UnaryOp::Neg,
            TokenKind::Plus => UnaryOp::Pos,
            _ => return self.parse_power(),
        };
        let position = self.advance().start;
        let operand = self.parse_unary()?;
        Ok(unary(op, operand, position))
    }

    /// `**` binds tighter than unary minus on its left and is right-associative
    fn parse_power(&mut self) -> Result<Node> {
        let base = self.parse_filtered()?;
        if self.eat(TokenKind::Power) {
            let exponent = self.parse_unary()?;
            return Ok(binary(BinaryOp::Pow, base, exponent));
        }
        Ok(base)
    }

    fn parse_filtered(&mut self) -> Result<Node> {
        let mut expr = self.parse_postfix()?;
        while self.eat(TokenKind::Pipe) {
            let name = self.expect_identifier()?.text;
            let args = if self.eat(TokenKind::LParen) {
                self.parse_arguments()?
            } else {
                Vec::new()
            };
            let position = expr.position.clone();
            expr = Node::new(
                NodeKind::Filter {
                    target: Box::new(expr),
                    name,
                    args,
                },
                position,
            );
        }
        Ok(expr)
    }

    /// A primary followed by any mix of `.attr`, `[index]` and `(args)`
    fn parse_postfix(&mut self) -> Result<Node> {
        let mut expr = self.parse_primary()?;

        loop {
            let position = expr.position.clone();
            if self.eat(TokenKind::Dot) {
                let name = self.expect_identifier()?.text;
                expr = Node::new(
                    NodeKind::Attribute {
                        target: Box::new(expr),
                        name,
                    },
                    position,
                );
            } else if self.eat(TokenKind::LBracket) {
                let index = self.parse_expression()?;
                self.expect(TokenKind::RBracket, "`]`")?;
                expr = Node::new(
                    NodeKind::Index {
                        target: Box::new(expr),
                        index: Box::new(index),
                    },
                    position,
                );
            } else if self.eat(TokenKind::LParen) {
                let args = self.parse_arguments()?;
                expr = Node::new(
                    NodeKind::Call {
                        target: Box::new(expr),
                        args,
                    },
                    position,
                );
            } else {
                return Ok(expr);
            }
        }
    }

    /// Arguments after an opening `(`, through the closing `)`
    fn parse_arguments(&mut self) -> Result<Vec<Argument>> {
        let mut args = Vec::new();

        while !self.check(TokenKind::RParen) {
            let name = if self.check(TokenKind::Identifier)
                && self.peek_at(1).kind == TokenKind::Assign
            {
                let name = self.advance().text;
                self.advance();
                Some(name)
            } else {
                None
            };
            let value = self.parse_expression()?;
            args.push(Argument { name, value });

            if !self.eat(TokenKind::Comma) {
                break;
            }
        }

        self.expect(TokenKind::RParen, "`)`")?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Node> {
        let token = self.peek().clone();
        let position = token.start.clone();

        let kind = match token.kind {
            TokenKind::String => {
                self.advance();
                NodeKind::Str(token.text)
            }
            TokenKind::Number => {
                self.advance();
                let n = token
                    .text
                    .parse::<f64>()
                    .map_err(|_| TemplateError::parse(&position, "number", token.describe()))?;
                NodeKind::Number(n)
            }
            TokenKind::True => {
                self.advance();
                NodeKind::Bool(true)
            }
            TokenKind::False => {
                self.advance();
                NodeKind::Bool(false)
            }
            TokenKind::Null => {
                self.advance();
                NodeKind::Null
            }
            TokenKind::Identifier => {
                self.advance();
                NodeKind::Variable(token.text)
            }
            TokenKind::LParen => {
                self.advance();
                let first = self.parse_expression()?;
                if !self.check(TokenKind::Comma) {
                    self.expect(TokenKind::RParen, "`)`")?;
                    return Ok(first);
                }
                // tuple literal, evaluated as a list
                let mut items = vec![first];
                while self.eat(TokenKind::Comma) {
                    if self.check(TokenKind::RParen) {
                        break;
                    }
                    items.push(self.parse_expression()?);
                }
                self.expect(TokenKind::RParen, "`)`")?;
                NodeKind::List(items)
            }
            TokenKind::LBracket => {
                self.advance();
                let mut items = Vec::new();
                while !self.check(TokenKind::RBracket) {
                    items.push(self.parse_expression()?);
                    if !self.eat(TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(TokenKind::RBracket, "`]`")?;
                NodeKind::List(items)
            }
            TokenKind::LBrace => {
                self.advance();
                let mut entries = Vec::new();
                while !self.check(TokenKind::RBrace) {
                    let key = self.parse_expression()?;
                    self.expect(TokenKind::Colon, "`:`")?;
                    let value = self.parse_expression()?;
                    entries.push((key, value));
                    if !self.eat(TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(TokenKind::RBrace, "`}`")?;
                NodeKind::Map(entries)
            }
            _ => return Err(self.error("expression")),
        };

        Ok(Node::new(kind, position))
    }
}

fn binary(op: BinaryOp, lhs: Node, rhs: Node) -> Node {
    let position = lhs.position.clone();
    Node::new(
        NodeKind::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        },
        position,
    )
}

fn unary(op: UnaryOp, operand: Node, position: Position) -> Node {
    Node::new(
        NodeKind::Unary {
            op,
            operand: Box::new(operand),
        },
        position,
    )
}

fn membership(needle: Node, haystack: Node, negated: bool) -> Node {
    let position = needle.position.clone();
    Node::new(
        NodeKind::Membership {
            needle: Box::new(needle),
            haystack: Box::new(haystack),
            negated,
        },
        position,
    )
}

/// Lex and parse a source file
pub fn parse_template(file: &str, source: &str) -> Result<Body> {
    Parser::new(tokenize(file, source)?).parse()
}
