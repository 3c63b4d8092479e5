mod commands;
mod project;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use commands::RunOptions;
use project::{Project, Selector};

/// sqlweave - templated SQL build tool
#[derive(Parser)]
#[command(name = "sqlweave")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Project directory
    #[arg(short, long, global = true, default_value = ".")]
    project: PathBuf,

    /// Path to config file (default: <project>/sqlweave.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Number of worker threads (default: `threads` from the config)
    #[arg(short = 'j', long, global = true)]
    threads: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile units and write them to target/compiled/
    Compile {
        /// Units to compile: name, +name, name+ or tag:x (default: all)
        selector: Option<String>,
    },

    /// Compile and materialise units in dependency order into target/run/
    Run {
        /// Units to run: name, +name, name+ or tag:x (default: all)
        selector: Option<String>,

        /// Read units outside the selection from the [upstream] target
        #[arg(long)]
        upstream: bool,

        /// Rebuild incremental models from scratch
        #[arg(long)]
        full_refresh: bool,
    },

    /// Print the compiled SQL of a model or test
    Show {
        /// Unit name
        model: String,
    },

    /// Print the selected units and their upstreams
    Graph {
        /// Units to show: name, +name, name+ or tag:x (default: all)
        selector: Option<String>,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

/// Load `<project>/.env` so `env_var()` sees it
fn load_env(root: &Path) -> Result<()> {
    match dotenvy::from_path(root.join(".env")) {
        Ok(()) => {
            tracing::debug!("loaded .env");
            Ok(())
        }
        Err(e) if e.not_found() => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    load_env(&cli.project)?;

    let project = Project::load(&cli.project, cli.config.as_deref())?;
    let threads = cli.threads.unwrap_or(project.config.threads).max(1);

    if cli.verbose {
        eprintln!(
            "{} {} ({} threads)",
            "Using project".cyan(),
            project.config.name,
            threads
        );
    }

    match cli.command {
        Commands::Compile { selector } => {
            let selector = Selector::parse_optional(selector.as_deref())?;
            commands::compile_command(&project, &selector, threads)?;
        }
        Commands::Run {
            selector,
            upstream,
            full_refresh,
        } => {
            let selector = Selector::parse_optional(selector.as_deref())?;
            let options = RunOptions {
                full_refresh,
                upstream,
            };
            commands::run_command(&project, &selector, threads, options)?;
        }
        Commands::Show { model } => {
            commands::show_command(&project, &model, threads)?;
        }
        Commands::Graph { selector, json } => {
            let selector = Selector::parse_optional(selector.as_deref())?;
            commands::graph_command(&project, &selector, threads, json)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_run_flags() {
        let cli = Cli::try_parse_from([
            "sqlweave",
            "-p",
            "shop",
            "-j",
            "8",
            "run",
            "+orders",
            "--upstream",
            "--full-refresh",
        ])
        .unwrap();

        assert_eq!(cli.project, PathBuf::from("shop"));
        assert_eq!(cli.threads, Some(8));
        match cli.command {
            Commands::Run {
                selector,
                upstream,
                full_refresh,
            } => {
                assert_eq!(selector.as_deref(), Some("+orders"));
                assert!(upstream && full_refresh);
            }
            _ => panic!("expected run"),
        }
    }
}
