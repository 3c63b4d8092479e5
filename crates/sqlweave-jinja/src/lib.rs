//! The sqlweave template language
//!
//! This crate handles:
//! - Lexing and parsing Jinja-style templates embedded in SQL
//! - Interpreting them against lexically scoped execution contexts
//! - The built-in library (`ref`, `config`, `var`, filters, tests)
//! - Compiling project units, including ephemeral CTE inlining

pub mod ast;
pub mod compiler;
pub mod context;
pub mod error;
pub mod eval;
pub mod filters;
pub mod fs;
pub mod functions;
pub mod lexer;
pub mod parser;
pub mod predicates;
pub mod value;

pub use ast::{Body, Node, NodeKind};
pub use compiler::{with_ctes, Compiler, EPHEMERAL_PREFIX};
pub use context::{BuildOptions, ExecutionContext, GlobalContext};
pub use error::{Position, Result, TemplateError};
pub use fs::{File, FileKind, FileState, FileSystem, FileSystemError};
pub use parser::parse_template;
pub use value::{Output, Value, ValueKind};
