// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

/// Command-line arguments for `flowdag`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "flowdag",
    version,
    about = "Run a declared task-graph recipe against external operations.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the recipe file (TOML).
    ///
    /// Default: `Recipe.toml` in the current working directory.
    #[arg(long, value_name = "PATH", default_value = "Recipe.toml")]
    pub recipe: String,

    /// Recipe input as `name=value`; repeatable.
    #[arg(long = "input", value_name = "NAME=VALUE")]
    pub inputs: Vec<String>,

    /// Folder the run writes its outputs into.
    #[arg(long, value_name = "PATH", default_value = ".flowdag/run")]
    pub work_dir: String,

    /// Maximum task instances running concurrently.
    ///
    /// Overrides the recipe's `[config].max_concurrency`.
    #[arg(long, value_name = "N")]
    pub max_concurrency: Option<usize>,

    /// Overall run deadline in seconds.
    ///
    /// Overrides the recipe's `[config].deadline_secs`. When it elapses,
    /// running instances are cancelled and the run reports a timeout.
    #[arg(long, value_name = "SECONDS")]
    pub deadline_secs: Option<u64>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `FLOWDAG_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Parse + validate, print the run plan, but don't execute anything.
    #[arg(long)]
    pub dry_run: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
