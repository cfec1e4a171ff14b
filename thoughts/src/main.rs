use std::{fmt::Write as _, fs, path::PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use thoughts::config::CoreConfig;
use thoughts::core::{Path, ROOT_TOKEN, ThoughtError};
use thoughts::export::export_context;
use thoughts::import::import_text;
use thoughts::integrity;
use thoughts::moves::{archive_thought, move_context};
use thoughts::path::{path_to_context, rank_thoughts_first_match};
use thoughts::storage::{JsonFileRepository, ThoughtRepository, load_local_thoughts, snapshot_of};
use thoughts::store::{State, is_immovable};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "thoughts",
    about = "Outline tooling built on the thoughts crate",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// TOML config file. Missing files fall back to defaults.
    #[arg(long, global = true, default_value = "thoughts.toml")]
    config: PathBuf,
    /// Snapshot file; overrides `storage.snapshot_path` from the config.
    #[arg(long, global = true)]
    snapshot: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Import an indented `- item` outline.
    Import(ImportArgs),

    /// Print a context and its descendants as an outline.
    Export(ExportArgs),

    /// Move a thought under another parent.
    Move(MoveArgs),

    /// Move a thought into its context's `=archive`.
    Archive(ArchiveArgs),

    /// Verify that both indexes agree.
    Check,

    /// List recently edited thoughts, newest first.
    Recent(RecentArgs),
}

#[derive(Debug, Args)]
struct ImportArgs {
    /// Outline file to read.
    input: PathBuf,
    /// Slash-separated values of the thought to import under. Defaults to the root.
    #[arg(long, default_value = "")]
    at: String,
}

#[derive(Debug, Args)]
struct ExportArgs {
    /// Slash-separated context to export. Defaults to the root.
    #[arg(long, default_value = "")]
    context: String,
}

#[derive(Debug, Args)]
struct MoveArgs {
    /// Slash-separated values of the thought to move.
    from: String,
    /// Slash-separated values of the new parent; empty for the root.
    to: String,
    /// Move even when the thought is marked `=immovable`.
    #[arg(long)]
    force: bool,
}

#[derive(Debug, Args)]
struct ArchiveArgs {
    /// Slash-separated values of the thought to archive.
    path: String,
}

#[derive(Debug, Args)]
struct RecentArgs {
    /// Maximum number of entries. Defaults to `recently_edited.limit`.
    #[arg(long)]
    limit: Option<usize>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = CoreConfig::load(&cli.config)?;
    init_tracing(if cli.verbose { "debug" } else { config.logging.level.as_str() });
    let output = run(cli, &config)?;
    if !output.is_empty() {
        println!("{output}");
    }
    Ok(())
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_env("THOUGHTS_LOG")
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Loads the snapshot, applies one command, saves when it changed anything, and
/// returns what should be printed.
fn run(cli: Cli, config: &CoreConfig) -> Result<String> {
    let snapshot_path = cli
        .snapshot
        .unwrap_or_else(|| config.storage.snapshot_path.clone());
    let mut repo = JsonFileRepository::new(snapshot_path);
    let state = load_local_thoughts(&config.initial_state(), &repo)
        .with_context(|| format!("loading {}", repo.path().display()))?;

    let mut output = String::new();
    let next = match cli.command {
        Commands::Import(args) => {
            let text = fs::read_to_string(&args.input)
                .with_context(|| format!("reading {:?}", args.input))?;
            let at = resolve(&state, &parse_values(&args.at))?;
            Some(import_text(&state, &at, &text)?)
        }
        Commands::Export(args) => {
            let mut context = parse_values(&args.context);
            if context.is_empty() {
                context.push(ROOT_TOKEN.to_string());
            }
            output = export_context(&state.thoughts, &context);
            None
        }
        Commands::Move(args) => {
            let from = parse_values(&args.from);
            ensure_movable(&state, &from, args.force)?;
            Some(move_context(&state, &from, &parse_values(&args.to))?)
        }
        Commands::Archive(args) => {
            let path = resolve(&state, &parse_values(&args.path))?;
            Some(archive_thought(&state, &path))
        }
        Commands::Check => {
            let violations = integrity::check(&state.thoughts);
            for violation in &violations {
                let _ = writeln!(output, "{violation}");
            }
            if !violations.is_empty() {
                anyhow::bail!("{}found {} integrity violations", output, violations.len());
            }
            output.push_str("ok");
            None
        }
        Commands::Recent(args) => {
            let limit = args.limit.unwrap_or(config.recently_edited.limit);
            let lines: Vec<String> = state
                .recently_edited
                .leaves_by_recency(limit)
                .into_iter()
                .map(|leaf| {
                    format!(
                        "{}\t{}",
                        leaf.last_updated.to_rfc3339(),
                        path_to_context(&leaf.path).join("/")
                    )
                })
                .collect();
            output = lines.join("\n");
            None
        }
    };

    if let Some(next) = next {
        repo.save(&snapshot_of(&next))?;
    }
    Ok(output)
}

/// `a/b/c` -> `["a", "b", "c"]`; empty segments are dropped.
fn parse_values(raw: &str) -> Vec<String> {
    raw.split('/')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

/// Ranked path of `values`; the empty path stands for the root.
fn resolve(state: &State, values: &[String]) -> Result<Path> {
    rank_thoughts_first_match(&state.thoughts, values)
        .ok_or_else(|| ThoughtError::NotFound(values.to_vec()).into())
}

/// Shortcut-layer guard: thoughts carrying `=immovable` stay put unless forced.
fn ensure_movable(state: &State, context: &[String], force: bool) -> Result<()> {
    if !force && is_immovable(&state.thoughts, context) {
        let value = context.last().cloned().unwrap_or_default();
        return Err(ThoughtError::Immovable(value).into());
    }
    Ok(())
}
