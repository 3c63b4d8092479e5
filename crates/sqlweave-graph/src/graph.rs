//! Dependency graph construction
//!
//! Edges come from the upstream sets recorded on each unit while it was
//! compiled. An ephemeral model that is not itself a node is transparent:
//! an edge through it lands on the ephemeral model's own upstreams.

use sqlweave_core::{Diagnostic, DiagnosticCode, Materialization, Severity};
use sqlweave_jinja::{File, FileKind, FileSystem, TemplateError};
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("dependency cycle detected at `{unit}`")]
    Cycle { unit: String },

    #[error("unknown unit `{0}`")]
    UnknownUnit(String),

    #[error(transparent)]
    Template(#[from] TemplateError),
}

impl GraphError {
    pub fn to_diagnostic(&self) -> Diagnostic {
        match self {
            Self::Cycle { unit } => Diagnostic::new(
                DiagnosticCode::DependencyCycle,
                Severity::Error,
                self.to_string(),
            )
            .with_unit(unit.clone()),
            Self::UnknownUnit(unit) => {
                Diagnostic::new(DiagnosticCode::UnknownUnit, Severity::Error, self.to_string())
                    .with_unit(unit.clone())
            }
            Self::Template(err) => err.to_diagnostic(),
        }
    }
}

pub type Result<T> = std::result::Result<T, GraphError>;

/// One schedulable unit and its run state
pub struct Node {
    file: Arc<File>,
    /// Unordered nodes take no edges (compile passes)
    ordered: bool,
    upstreams: Vec<String>,
    downstreams: Vec<String>,
    queued: AtomicBool,
    done: AtomicBool,
}

impl Node {
    fn new(file: Arc<File>, ordered: bool) -> Self {
        Self {
            file,
            ordered,
            upstreams: Vec::new(),
            downstreams: Vec::new(),
            queued: AtomicBool::new(false),
            done: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        self.file.name()
    }

    pub fn file(&self) -> &Arc<File> {
        &self.file
    }

    /// Upstream nodes, in name order
    pub fn upstreams(&self) -> &[String] {
        &self.upstreams
    }

    pub fn downstreams(&self) -> &[String] {
        &self.downstreams
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub(crate) fn mark_done(&self) {
        self.done.store(true, Ordering::Release);
    }

    /// Claim the node for the ready list. True exactly once until reset.
    pub(crate) fn try_queue(&self) -> bool {
        !self.queued.swap(true, Ordering::AcqRel)
    }

    fn reset(&self) {
        self.done.store(false, Ordering::Release);
        self.queued.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name())
            .field("upstreams", &self.upstreams)
            .field("done", &self.is_done())
            .finish()
    }
}

/// The set of units one command operates on, with the edges between them
pub struct Graph {
    files: Arc<FileSystem>,
    nodes: BTreeMap<String, Node>,
}

impl Graph {
    pub fn new(files: Arc<FileSystem>) -> Self {
        Self {
            files,
            nodes: BTreeMap::new(),
        }
    }

    pub fn files(&self) -> &Arc<FileSystem> {
        &self.files
    }

    /// Add one model or test
    pub fn add_node(&mut self, name: &str) -> Result<()> {
        let file = self.unit(name)?;
        self.insert(file, true);
        self.link()
    }

    /// Add a unit and everything it transitively reads from
    pub fn add_node_with_upstreams(&mut self, name: &str) -> Result<()> {
        self.add_closure(name, File::upstreams)
    }

    /// Add a unit and everything that transitively reads from it
    pub fn add_node_with_downstreams(&mut self, name: &str) -> Result<()> {
        self.add_closure(name, File::downstreams)
    }

    /// Add every unit of `kind`. Ephemeral models are left out; they run
    /// inside the units that reference them.
    pub fn add_all(&mut self, kind: FileKind) -> Result<()> {
        let files: Vec<Arc<File>> = self
            .files
            .files(kind)
            .filter(|file| !self.is_ephemeral(file))
            .cloned()
            .collect();
        for file in files {
            self.insert(file, true);
        }
        self.link()
    }

    /// Add every unit of `kind` without edges, ephemeral models included.
    /// Used by the compile passes, where edges are not known yet.
    pub fn add_all_unordered(&mut self, kind: FileKind) -> Result<()> {
        let files: Vec<Arc<File>> = self.files.files(kind).cloned().collect();
        for file in files {
            self.insert(file, false);
        }
        self.link()
    }

    /// Add the models tagged `tag`, then every upstream in their closure
    /// that carries the same tag
    pub fn add_tagged(&mut self, tag: &str) -> Result<()> {
        let seeds: Vec<Arc<File>> = self
            .files
            .files(FileKind::Model)
            .filter(|file| !self.is_ephemeral(file) && self.files.tags(file).contains(tag))
            .cloned()
            .collect();

        let mut visited = HashSet::new();
        let mut queue: VecDeque<Arc<File>> = seeds.into_iter().collect();
        while let Some(file) = queue.pop_front() {
            if !visited.insert(file.name().to_string()) {
                continue;
            }
            if !self.is_ephemeral(&file) && self.files.tags(&file).contains(tag) {
                self.insert(file.clone(), true);
            }
            for upstream in file.upstreams() {
                if let Some(up) = self.files.model(&upstream) {
                    queue.push_back(up.clone());
                }
            }
        }

        self.link()
    }

    /// Add the tests that read from any unit already in the graph
    pub fn add_referencing_tests(&mut self) -> Result<()> {
        let tests: Vec<Arc<File>> = self
            .files
            .files(FileKind::Test)
            .filter(|test| !self.collapsed_upstreams(test).is_empty())
            .cloned()
            .collect();
        for test in tests {
            tracing::debug!(test = test.name(), "adding referencing test");
            self.insert(test, true);
        }
        self.link()
    }

    /// Add the ephemeral models the graph's nodes read from, following
    /// chains of ephemeral models
    pub fn add_ephemeral_upstreams(&mut self) -> Result<()> {
        let mut visited = HashSet::new();
        let mut queue: VecDeque<String> = self
            .nodes
            .values()
            .flat_map(|node| node.file.upstreams())
            .collect();

        let mut found = Vec::new();
        while let Some(name) = queue.pop_front() {
            if !visited.insert(name.clone()) {
                continue;
            }
            let Some(file) = self.files.model(&name) else {
                continue;
            };
            if self.is_ephemeral(file) {
                queue.extend(file.upstreams());
                found.push(file.clone());
            }
        }

        for file in found {
            self.insert(file, true);
        }
        self.link()
    }

    /// Mark every node as already run
    pub fn mark_all_done(&self) {
        for node in self.nodes.values() {
            node.mark_done();
        }
    }

    /// Clear the run state of one node
    pub fn reset(&self, name: &str) -> Result<()> {
        self.nodes
            .get(name)
            .ok_or_else(|| GraphError::UnknownUnit(name.to_string()))?
            .reset();
        Ok(())
    }

    pub fn reset_all(&self) {
        for node in self.nodes.values() {
            node.reset();
        }
    }

    /// Nodes not yet run
    pub fn remaining(&self) -> usize {
        self.nodes.values().filter(|node| !node.is_done()).count()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// Node names in order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// A node is ready once every upstream node is done
    pub(crate) fn is_ready(&self, node: &Node) -> bool {
        !node.is_done()
            && node
                .upstreams
                .iter()
                .all(|up| self.nodes.get(up).map_or(true, Node::is_done))
    }

    /// Forget the claims of nodes that never ran, e.g. after a failed run
    pub(crate) fn release_unrun(&self) {
        for node in self.nodes.values().filter(|node| !node.is_done()) {
            node.queued.store(false, Ordering::Release);
        }
    }

    fn unit(&self, name: &str) -> Result<Arc<File>> {
        self.files
            .unit(name)
            .cloned()
            .ok_or_else(|| GraphError::UnknownUnit(name.to_string()))
    }

    fn is_ephemeral(&self, file: &File) -> bool {
        file.kind() == FileKind::Model
            && self.files.materialization(file) == Materialization::Ephemeral
    }

    fn insert(&mut self, file: Arc<File>, ordered: bool) {
        match self.nodes.get_mut(file.name()) {
            Some(node) => node.ordered |= ordered,
            None => {
                tracing::debug!(unit = file.name(), ordered, "adding node");
                self.nodes
                    .insert(file.name().to_string(), Node::new(file, ordered));
            }
        }
    }

    /// Breadth-first walk from `name` along `next`, adding every unit found.
    /// Ephemeral models on the way are walked through but not added.
    fn add_closure(&mut self, name: &str, next: fn(&File) -> BTreeSet<String>) -> Result<()> {
        let root = self.unit(name)?;
        self.insert(root.clone(), true);

        let mut visited = HashSet::from([root.name().to_string()]);
        let mut queue: VecDeque<String> = next(&root).into_iter().collect();
        while let Some(name) = queue.pop_front() {
            if !visited.insert(name.clone()) {
                continue;
            }
            let file = self.unit(&name)?;
            if !self.is_ephemeral(&file) {
                self.insert(file.clone(), true);
            }
            queue.extend(next(&file));
        }

        self.link()
    }

    /// Upstream nodes of `file`, looking through ephemeral models that
    /// are not nodes
    fn collapsed_upstreams(&self, file: &File) -> BTreeSet<String> {
        let mut upstreams = BTreeSet::new();
        let mut visited = HashSet::new();
        let mut stack: Vec<String> = file.upstreams().into_iter().collect();

        while let Some(name) = stack.pop() {
            if !visited.insert(name.clone()) {
                continue;
            }
            if self.nodes.contains_key(&name) {
                upstreams.insert(name);
            } else if let Some(up) = self.files.model(&name) {
                if self.is_ephemeral(up) {
                    stack.extend(up.upstreams());
                }
            }
        }

        upstreams
    }

    /// Recompute every edge from the units' recorded references, then
    /// check the result is acyclic
    fn link(&mut self) -> Result<()> {
        let mut upstreams: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut downstreams: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for (name, node) in &self.nodes {
            if !node.ordered {
                continue;
            }
            for up in self.collapsed_upstreams(&node.file) {
                downstreams.entry(up.clone()).or_default().push(name.clone());
                upstreams.entry(name.clone()).or_default().push(up);
            }
        }

        for (name, node) in self.nodes.iter_mut() {
            node.upstreams = upstreams.remove(name).unwrap_or_default();
            node.downstreams = downstreams.remove(name).unwrap_or_default();
        }

        self.validate()
    }

    /// Containment walk: no node may reach itself through its upstreams
    fn validate(&self) -> Result<()> {
        for (name, node) in &self.nodes {
            let mut visited = HashSet::new();
            let mut stack: Vec<&str> = node.upstreams.iter().map(String::as_str).collect();

            while let Some(current) = stack.pop() {
                if current == name.as_str() {
                    tracing::warn!(unit = %name, "dependency cycle");
                    return Err(GraphError::Cycle { unit: name.clone() });
                }
                if !visited.insert(current) {
                    continue;
                }
                if let Some(up) = self.nodes.get(current) {
                    stack.extend(up.upstreams.iter().map(String::as_str));
                }
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.nodes.values()).finish()
    }
}
