//! Dependency graph and scheduling
//!
//! This crate handles:
//! - Building the unit graph from references recorded during compilation
//! - Selecting units by name, closure, tag and referencing tests
//! - Executing an action over the graph with a bounded pool of workers
//! - The parallel two-pass compile of a whole project

pub mod build;
pub mod graph;
pub mod scheduler;

pub use build::{compile_project, CompileOptions, CompileSummary};
pub use graph::{Graph, GraphError, Node};
pub use scheduler::Scheduler;
