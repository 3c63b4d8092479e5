//! Project loading and unit selection

use anyhow::{anyhow, bail, Context, Result};
use sqlweave_core::Config;
use sqlweave_graph::{Graph, GraphError};
use sqlweave_jinja::{File, FileKind, FileSystem};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use walkdir::WalkDir;

pub const CONFIG_FILE: &str = "sqlweave.toml";

/// A loaded project: its configuration and every unit on disk
pub struct Project {
    pub root: PathBuf,
    pub config: Config,
    pub files: Arc<FileSystem>,
}

impl Project {
    /// Load the project at `root`. The config is read from `config_path`,
    /// else `sqlweave.toml` in the root, else defaults.
    pub fn load(root: &Path, config_path: Option<&Path>) -> Result<Self> {
        let default_path = root.join(CONFIG_FILE);
        let mut config = match config_path {
            Some(path) => Config::from_file(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None if default_path.exists() => Config::from_file(&default_path)
                .with_context(|| format!("failed to load config {}", default_path.display()))?,
            None => {
                tracing::debug!(root = %root.display(), "no config file, using defaults");
                Config::default()
            }
        };
        config.project_root = root.to_path_buf();

        let mut files = FileSystem::new(config.models.clone());
        for (dir, kind) in [
            ("macros", FileKind::Macro),
            ("models", FileKind::Model),
            ("tests", FileKind::Test),
        ] {
            for path in discover(&root.join(dir))? {
                let file = read_unit(root, &path, kind)?;
                let clash = match kind {
                    FileKind::Model => files.test(file.name()),
                    FileKind::Test => files.model(file.name()),
                    FileKind::Macro => None,
                };
                if let Some(other) = clash {
                    bail!(
                        "`{}` is both a model and a test ({} and {})",
                        file.name(),
                        other.path(),
                        file.path()
                    );
                }
                files.add(file)?;
            }
        }

        tracing::info!(
            project = %config.name,
            models = files.files(FileKind::Model).count(),
            macros = files.files(FileKind::Macro).count(),
            tests = files.files(FileKind::Test).count(),
            "loaded project"
        );

        Ok(Self {
            root: root.to_path_buf(),
            config,
            files: Arc::new(files),
        })
    }

    /// `target/<stage>` under the project root
    pub fn target_dir(&self, stage: &str) -> PathBuf {
        self.root.join("target").join(stage)
    }
}

/// Every `.sql` file under `dir`, in path order
fn discover(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut sql_files = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("failed to scan {}", dir.display()))?;
        if entry.file_type().is_file() && entry.path().extension().is_some_and(|ext| ext == "sql") {
            sql_files.push(entry.into_path());
        }
    }

    Ok(sql_files)
}

fn read_unit(root: &Path, path: &Path, kind: FileKind) -> Result<File> {
    let name = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .ok_or_else(|| anyhow!("invalid file name {}", path.display()))?;
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let relative = path
        .strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/");

    Ok(File::new(name, relative, kind, source))
}

/// Which units a command operates on
///
/// * `name` - one unit
/// * `+name` - the unit and everything it reads from
/// * `name+` - the unit and everything reading from it
/// * `tag:x` - models tagged `x` and their tagged upstreams
///
/// Tests referencing a selected unit are always added.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    All,
    Unit {
        name: String,
        upstreams: bool,
        downstreams: bool,
    },
    Tag(String),
}

impl FromStr for Selector {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(tag) = s.strip_prefix("tag:") {
            if tag.is_empty() {
                bail!("empty tag in selector `{}`", s);
            }
            return Ok(Self::Tag(tag.to_string()));
        }

        let (upstreams, rest) = match s.strip_prefix('+') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let (downstreams, name) = match rest.strip_suffix('+') {
            Some(name) => (true, name),
            None => (false, rest),
        };
        if name.is_empty() || name.contains('+') {
            bail!("invalid selector `{}`", s);
        }

        Ok(Self::Unit {
            name: name.to_string(),
            upstreams,
            downstreams,
        })
    }
}

impl Selector {
    pub fn parse_optional(selector: Option<&str>) -> Result<Self> {
        selector.map_or(Ok(Self::All), str::parse)
    }

    /// Build the graph of the selected units
    pub fn graph(&self, files: &Arc<FileSystem>) -> Result<Graph, GraphError> {
        let mut graph = Graph::new(files.clone());
        match self {
            Self::All => {
                graph.add_all(FileKind::Model)?;
                graph.add_all(FileKind::Test)?;
            }
            Self::Unit {
                name,
                upstreams,
                downstreams,
            } => {
                if *upstreams {
                    graph.add_node_with_upstreams(name)?;
                }
                if *downstreams {
                    graph.add_node_with_downstreams(name)?;
                }
                if !upstreams && !downstreams {
                    graph.add_node(name)?;
                }
                graph.add_referencing_tests()?;
            }
            Self::Tag(tag) => {
                graph.add_tagged(tag)?;
                graph.add_referencing_tests()?;
            }
        }
        Ok(graph)
    }
}
