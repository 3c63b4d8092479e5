//! Template syntax tree
//!
//! Nodes are immutable once parsed and shared read-only between workers.
//! Every node formats back to template source, so `parse(node.to_string())`
//! yields an equivalent tree.

use crate::error::Position;
use crate::value::format_number;
use std::fmt;
use std::sync::Arc;

/// An ordered sequence of nodes: a file, or the inside of a block
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Body {
    pub nodes: Vec<Node>,
}

impl Body {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self { nodes }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Names of the macros defined at the top level of this body
    pub fn macro_names(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter_map(|node| match &node.kind {
                NodeKind::Macro(definition) => Some(definition.name.clone()),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub kind: NodeKind,
    pub position: Position,
}

impl Node {
    pub fn new(kind: NodeKind, position: Position) -> Self {
        Self { kind, position }
    }

    /// Whether this node produces a value (as opposed to a statement or raw text)
    pub fn is_expression(&self) -> bool {
        !matches!(
            self.kind,
            NodeKind::Text(_)
                | NodeKind::Macro(_)
                | NodeKind::CallBlock { .. }
                | NodeKind::If { .. }
                | NodeKind::For { .. }
                | NodeKind::Set { .. }
                | NodeKind::SetBlock { .. }
                | NodeKind::Do(_)
                | NodeKind::Unsupported { .. }
                | NodeKind::EndOfFile
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Argument {
    /// Keyword name for `name=value` arguments
    pub name: Option<String>,
    pub value: Node,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub default: Option<Node>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MacroSyntax {
    pub name: String,
    pub params: Vec<Parameter>,
    pub body: Body,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Branch {
    pub condition: Node,
    pub body: Body,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Pos,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    Concat,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::FloorDiv => "//",
            Self::Mod => "%",
            Self::Pow => "**",
            Self::Concat => "~",
            Self::Eq => "==",
            Self::NotEq => "!=",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::Gt => ">",
            Self::GtEq => ">=",
            Self::And => "and",
            Self::Or => "or",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// Raw text outside any block
    Text(String),

    Variable(String),
    Attribute {
        target: Box<Node>,
        name: String,
    },
    Index {
        target: Box<Node>,
        index: Box<Node>,
    },
    Call {
        target: Box<Node>,
        args: Vec<Argument>,
    },
    /// `target | name(args)`
    Filter {
        target: Box<Node>,
        name: String,
        args: Vec<Argument>,
    },

    Macro(Arc<MacroSyntax>),
    /// `{% call target(args) %}body{% endcall %}`
    CallBlock {
        call: Box<Node>,
        body: Arc<Body>,
    },
    If {
        branches: Vec<Branch>,
        otherwise: Option<Body>,
    },
    For {
        key: Option<String>,
        value: String,
        source: Box<Node>,
        body: Body,
        otherwise: Option<Body>,
    },
    Set {
        name: String,
        value: Box<Node>,
    },
    SetBlock {
        name: String,
        body: Body,
    },
    Do(Box<Node>),

    List(Vec<Node>),
    Map(Vec<(Node, Node)>),
    Str(String),
    Number(f64),
    Bool(bool),
    Null,

    Unary {
        op: UnaryOp,
        operand: Box<Node>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Node>,
        rhs: Box<Node>,
    },
    /// `then if condition [else otherwise]`
    Conditional {
        then: Box<Node>,
        condition: Box<Node>,
        otherwise: Option<Box<Node>>,
    },
    /// `needle [not] in haystack`
    Membership {
        needle: Box<Node>,
        haystack: Box<Node>,
        negated: bool,
    },
    /// `value is [not] name(args)`
    Test {
        value: Box<Node>,
        name: String,
        args: Vec<Argument>,
        negated: bool,
    },

    /// A block keyword the engine does not implement, kept for diagnostics
    Unsupported {
        keyword: String,
        header: String,
        body: Body,
    },
    EndOfFile,
}

fn write_string_literal(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    if !s.contains('\'') {
        write!(f, "'{}'", s)
    } else if !s.contains('"') {
        write!(f, "\"{}\"", s)
    } else {
        write!(f, "'''{}'''", s)
    }
}

fn write_args(f: &mut fmt::Formatter<'_>, args: &[Argument]) -> fmt::Result {
    f.write_str("(")?;
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        if let Some(name) = &arg.name {
            write!(f, "{}=", name)?;
        }
        write!(f, "{}", arg.value)?;
    }
    f.write_str(")")
}

impl fmt::Display for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for node in &self.nodes {
            if node.is_expression() {
                write!(f, "{{{{ {} }}}}", node)?;
            } else {
                write!(f, "{}", node)?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            NodeKind::Text(text) => f.write_str(text),
            NodeKind::Variable(name) => f.write_str(name),
            NodeKind::Attribute { target, name } => write!(f, "{}.{}", target, name),
            NodeKind::Index { target, index } => write!(f, "{}[{}]", target, index),
            NodeKind::Call { target, args } => {
                write!(f, "{}", target)?;
                write_args(f, args)
            }
            NodeKind::Filter { target, name, args } => {
                write!(f, "({} | {}", target, name)?;
                if !args.is_empty() {
                    write_args(f, args)?;
                }
                f.write_str(")")
            }
            NodeKind::Macro(definition) => {
                write!(f, "{{% macro {}(", definition.name)?;
                for (i, param) in definition.params.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    f.write_str(&param.name)?;
                    if let Some(default) = &param.default {
                        write!(f, "={}", default)?;
                    }
                }
                write!(f, ") %}}{}{{% endmacro %}}", definition.body)
            }
            NodeKind::CallBlock { call, body } => {
                write!(f, "{{% call {} %}}{}{{% endcall %}}", call, body)
            }
            NodeKind::If { branches, otherwise } => {
                for (i, branch) in branches.iter().enumerate() {
                    let keyword = if i == 0 { "if" } else { "elif" };
                    write!(f, "{{% {} {} %}}{}", keyword, branch.condition, branch.body)?;
                }
                if let Some(otherwise) = otherwise {
                    write!(f, "{{% else %}}{}", otherwise)?;
                }
                f.write_str("{% endif %}")
            }
            NodeKind::For {
                key,
                value,
                source,
                body,
                otherwise,
            } => {
                f.write_str("{% for ")?;
                if let Some(key) = key {
                    write!(f, "{}, ", key)?;
                }
                write!(f, "{} in {} %}}{}", value, source, body)?;
                if let Some(otherwise) = otherwise {
                    write!(f, "{{% else %}}{}", otherwise)?;
                }
                f.write_str("{% endfor %}")
            }
            NodeKind::Set { name, value } => write!(f, "{{% set {} = {} %}}", name, value),
            NodeKind::SetBlock { name, body } => {
                write!(f, "{{% set {} %}}{}{{% endset %}}", name, body)
            }
            NodeKind::Do(expr) => write!(f, "{{% do {} %}}", expr),
            NodeKind::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
            NodeKind::Map(entries) => {
                f.write_str("{")?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", key, value)?;
                }
                f.write_str("}")
            }
            NodeKind::Str(s) => write_string_literal(f, s),
            NodeKind::Number(n) => f.write_str(&format_number(*n)),
            NodeKind::Bool(true) => f.write_str("true"),
            NodeKind::Bool(false) => f.write_str("false"),
            NodeKind::Null => f.write_str("null"),
            NodeKind::Unary { op, operand } => match op {
                UnaryOp::Neg => write!(f, "(-{})", operand),
                UnaryOp::Pos => write!(f, "(+{})", operand),
                UnaryOp::Not => write!(f, "(not {})", operand),
            },
            NodeKind::Binary { op, lhs, rhs } => write!(f, "({} {} {})", lhs, op.symbol(), rhs),
            NodeKind::Conditional {
                then,
                condition,
                otherwise,
            } => {
                write!(f, "({} if {}", then, condition)?;
                if let Some(otherwise) = otherwise {
                    write!(f, " else {}", otherwise)?;
                }
                f.write_str(")")
            }
            NodeKind::Membership {
                needle,
                haystack,
                negated,
            } => {
                let op = if *negated { "not in" } else { "in" };
                write!(f, "({} {} {})", needle, op, haystack)
            }
            NodeKind::Test {
                value,
                name,
                args,
                negated,
            } => {
                let op = if *negated { "is not" } else { "is" };
                write!(f, "({} {} {}", value, op, name)?;
                if !args.is_empty() {
                    write_args(f, args)?;
                }
                f.write_str(")")
            }
            NodeKind::Unsupported {
                keyword,
                header,
                body,
            } => {
                write!(f, "{{% {}", keyword)?;
                if !header.is_empty() {
                    write!(f, " {}", header)?;
                }
                write!(f, " %}}{}{{% end{} %}}", body, keyword)
            }
            NodeKind::EndOfFile => Ok(()),
        }
    }
}
