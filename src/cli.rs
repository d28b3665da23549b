//! Shopper Mind CLI - inspect persisted shopping sessions
//!
//! Usage:
//!   shopper-mind thoughts [run_dir]          Show reflections of a run (latest by default)
//!   shopper-mind inspect <trace>             Print a memory trace as model-input lines
//!   shopper-mind stats <trace>               Counts and mean importance per kind
//!   shopper-mind defaults                    Print the default orchestrator config

use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use shopper_mind::{
    latest_run, read_memory_trace, MemoryKind, OrchestratorConfig, TraceSummary, TracedPiece,
};
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "shopper-mind")]
#[command(about = "Shopper Mind - inspect synthetic shopper sessions")]
#[command(version)]
struct Cli {
    /// Directory holding run directories
    #[arg(short, long, default_value = "./runs", env = "SHOPPER_RUNS_DIR")]
    runs_dir: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show one kind of memory from a run, reflections by default
    Thoughts {
        /// Run directory or memory trace file; the latest run when omitted
        run: Option<PathBuf>,

        /// Memory kind to show
        #[arg(short, long, value_enum, default_value = "reflection")]
        kind: CliMemoryKind,

        /// Highlight entries containing any of these words
        #[arg(short = 'w', long = "keyword")]
        keywords: Vec<String>,
    },

    /// Print a memory trace as formatted lines
    Inspect {
        /// Run directory or memory trace file
        trace: PathBuf,

        /// Only show this kind
        #[arg(short, long, value_enum)]
        kind: Option<CliMemoryKind>,

        /// Group by kind, then timestamp
        #[arg(short, long)]
        sorted: bool,

        /// Maximum lines
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Show trace statistics
    Stats {
        /// Run directory or memory trace file; the latest run when omitted
        trace: Option<PathBuf>,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the default orchestrator configuration as JSON
    Defaults,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum CliMemoryKind {
    Observation,
    Reflection,
    Plan,
    Action,
    Thought,
}

impl From<CliMemoryKind> for MemoryKind {
    fn from(cli: CliMemoryKind) -> Self {
        match cli {
            CliMemoryKind::Observation => MemoryKind::Observation,
            CliMemoryKind::Reflection => MemoryKind::Reflection,
            CliMemoryKind::Plan => MemoryKind::Plan,
            CliMemoryKind::Action => MemoryKind::Action,
            CliMemoryKind::Thought => MemoryKind::Thought,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "debug"
    } else {
        "warn,shopper_mind=info"
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Thoughts {
            run,
            kind,
            keywords,
        } => cmd_thoughts(&cli.runs_dir, run, kind.into(), &keywords),
        Commands::Inspect {
            trace,
            kind,
            sorted,
            limit,
        } => cmd_inspect(&trace, kind.map(Into::into), sorted, limit),
        Commands::Stats { trace, json } => cmd_stats(&cli.runs_dir, trace, json),
        Commands::Defaults => {
            println!(
                "{}",
                serde_json::to_string_pretty(&OrchestratorConfig::default())?
            );
            Ok(())
        }
    }
}

fn resolve_run(runs_dir: &Path, run: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    match run {
        Some(path) => Ok(path),
        None => {
            let latest = latest_run(runs_dir)?;
            println!("{} {}", "Latest run:".dimmed(), latest.display());
            Ok(latest)
        }
    }
}

fn cmd_thoughts(
    runs_dir: &Path,
    run: Option<PathBuf>,
    kind: MemoryKind,
    keywords: &[String],
) -> anyhow::Result<()> {
    let run = resolve_run(runs_dir, run)?;
    let pieces: Vec<TracedPiece> = read_memory_trace(&run)?
        .into_iter()
        .filter(|p| p.kind == kind)
        .collect();

    if pieces.is_empty() {
        println!("{}", format!("No {kind} memories in this run").yellow());
        return Ok(());
    }

    println!(
        "{}",
        format!("{} {} memories", pieces.len(), kind).bold().underline()
    );
    for (i, piece) in pieces.iter().enumerate() {
        let key = keywords.iter().any(|k| piece.content.contains(k.as_str()));
        let header = format!("[{}] step {}", i + 1, piece.timestamp);
        if key {
            println!("\n{} {}", header.magenta().bold(), "(key)".magenta());
            println!("{}", piece.content.bold());
        } else {
            println!("\n{}", header.cyan());
            println!("{}", piece.content);
        }
    }
    Ok(())
}

fn cmd_inspect(
    trace: &Path,
    kind: Option<MemoryKind>,
    sorted: bool,
    limit: Option<usize>,
) -> anyhow::Result<()> {
    let mut pieces: Vec<TracedPiece> = read_memory_trace(trace)?
        .into_iter()
        .filter(|p| kind.map_or(true, |k| p.kind == k))
        .collect();

    if pieces.is_empty() {
        println!("{}", "No memories found".yellow());
        return Ok(());
    }

    if sorted {
        TracedPiece::sort_by_kind(&mut pieces);
    }

    let shown = limit.unwrap_or(pieces.len()).min(pieces.len());
    println!(
        "{}",
        format!("Showing {} of {} memories", shown, pieces.len()).bold()
    );
    println!();
    for piece in pieces.iter().take(shown) {
        println!("{}", piece.render());
    }
    Ok(())
}

fn cmd_stats(runs_dir: &Path, trace: Option<PathBuf>, json: bool) -> anyhow::Result<()> {
    let trace = resolve_run(runs_dir, trace)?;
    let summary = TraceSummary::from_pieces(&read_memory_trace(&trace)?);

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("{}", "Trace Statistics".bold().underline());
    println!();
    println!("  Total memories: {}", summary.total);
    println!("  Unscored:       {}", summary.unscored);
    if let Some(last) = summary.last_timestamp {
        println!("  Last step:      {}", last);
    }

    println!("\n{}", "By Kind:".bold());
    for (kind, entry) in &summary.by_kind {
        let importance = entry
            .mean_importance
            .map(|m| format!("{:.2}", m))
            .unwrap_or_else(|| "N/A".to_string());
        println!(
            "  {:<12} {:>5}  (mean importance {})",
            kind.as_str(),
            entry.count,
            importance
        );
    }
    Ok(())
}
