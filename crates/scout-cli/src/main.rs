use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use clap::{Args, Parser, Subcommand};
use scout_adapters::{AdapterSet, Provider};
use scout_core::{Keyword, Registry, Severity, SourceDescriptor, Target, TelemetrySink, TracingTelemetry};
use scout_storage::ScoutStore;
use scout_sync::{SweepConfig, SweepPhase, SweepScope, SweepSummary, Sweeper, YamlRegistry, MAX_RETENTION_DAYS};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_DIRECTIVES: &str = "scout=info,scout_core=info,scout_storage=info,scout_adapters=info,scout_sync=info";

#[derive(Debug, Parser)]
#[command(name = "scout")]
#[command(about = "Marketplace sweep engine: search providers for keywords and archive new listings")]
struct Cli {
    /// Overrides SCOUT_DATABASE_URL.
    #[arg(long, global = true)]
    database_url: Option<String>,
    /// Append log lines to this file instead of stderr.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sweep over the selected (or registered) targets and sources.
    Sweep(SweepArgs),
    /// Show archived findings, newest first.
    Archive {
        #[arg(long)]
        since: Option<DateTime<Utc>>,
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Delete findings older than the retention window.
    Purge {
        #[arg(long)]
        days: Option<i64>,
    },
    /// Delete every archived finding.
    Wipe {
        #[arg(long)]
        yes: bool,
    },
    Targets {
        #[command(subcommand)]
        action: TargetAction,
    },
    Sources {
        #[command(subcommand)]
        action: SourceAction,
    },
}

#[derive(Debug, Default, Args)]
struct SweepArgs {
    /// Keyword to sweep; repeatable. Defaults to the registry's targets.
    #[arg(long = "target")]
    targets: Vec<String>,
    /// Provider id or custom:<domain>; repeatable. Defaults to the registry's sources.
    #[arg(long = "source")]
    sources: Vec<String>,
    #[arg(long)]
    parallelism: Option<usize>,
    /// Print the summary as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum TargetAction {
    Add {
        keyword: String,
        #[arg(long)]
        schedule_hint: Option<String>,
    },
    Remove {
        keyword: String,
    },
    List,
}

#[derive(Debug, Subcommand)]
enum SourceAction {
    Add { source: String },
    Remove { source: String },
    List,
}

fn init_tracing(log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(DEFAULT_LOG_DIRECTIVES))?;
    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::<File>::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_file.as_deref())?;

    let mut config = SweepConfig::from_env();
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }

    match cli.command.unwrap_or(Commands::Sweep(SweepArgs::default())) {
        Commands::Sweep(args) => run_sweep(&config, args).await?,
        Commands::Archive { since, limit } => {
            let sweeper = Sweeper::new(open_store(&config).await?, AdapterSet::new());
            let findings = sweeper.get_archive(since, limit).await?;
            for f in &findings {
                println!(
                    "{}  [{}] {} | {} | {}",
                    f.discovered_at.format("%Y-%m-%d %H:%M"),
                    f.source_label,
                    f.title,
                    f.price,
                    f.url
                );
            }
            println!("{} findings", findings.len());
        }
        Commands::Purge { days } => {
            let retention = retention_window(days, &config)?;
            let sweeper = Sweeper::new(open_store(&config).await?, AdapterSet::new());
            let removed = sweeper.purge_expired(retention).await?;
            println!("purged {removed} findings older than {} days", retention.num_days());
        }
        Commands::Wipe { yes } => {
            if !yes {
                bail!("refusing to wipe the archive without --yes");
            }
            let removed = open_store(&config).await?.wipe().await?;
            TracingTelemetry.emit("STORE", &format!("archive wiped ({removed} findings)"), Severity::Warn);
            println!("wiped {removed} findings");
        }
        Commands::Targets { action } => edit_targets(&open_store(&config).await?, action, &TracingTelemetry).await?,
        Commands::Sources { action } => edit_sources(&open_store(&config).await?, action, &TracingTelemetry).await?,
    }

    Ok(())
}

async fn open_store(config: &SweepConfig) -> Result<ScoutStore> {
    ScoutStore::connect(&config.database_url)
        .await
        .with_context(|| format!("opening archive at {}", config.database_url))
}

fn retention_window(days: Option<i64>, config: &SweepConfig) -> Result<TimeDelta> {
    match days {
        None => Ok(config.retention()),
        Some(d) if !(1..=MAX_RETENTION_DAYS).contains(&d) => {
            bail!("--days must be between 1 and {MAX_RETENTION_DAYS}, got {d}")
        }
        Some(d) => TimeDelta::try_days(d).ok_or_else(|| anyhow!("--days {d} is out of range")),
    }
}

async fn run_sweep(config: &SweepConfig, args: SweepArgs) -> Result<()> {
    let sweeper = Sweeper::from_config(config)
        .await
        .context("starting sweep engine")?
        .with_parallelism(args.parallelism.unwrap_or(config.source_parallelism));

    let registry: Box<dyn Registry> = match &config.registry_file {
        Some(path) => Box::new(YamlRegistry::new(path)),
        None => Box::new(sweeper.store().clone()),
    };
    let targets = args
        .targets
        .iter()
        .map(|t| Keyword::parse(t))
        .collect::<Result<Vec<_>, _>>()
        .context("invalid --target")?;
    let sources = args
        .sources
        .iter()
        .map(|s| SourceDescriptor::parse(s))
        .collect::<Result<Vec<_>, _>>()
        .context("invalid --source")?;
    let scope = SweepScope::with_registry_fallback(targets, sources, registry.as_ref())
        .await
        .context("reading target/source registry")?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing the current pair then stopping");
            on_signal.cancel();
        }
    });

    let summary = sweeper.execute_sweep_with_cancel(&scope, cancel).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(())
}

fn print_summary(summary: &SweepSummary) {
    if summary.phase == SweepPhase::Aborted {
        if let Some(reason) = summary.abort_reason {
            println!("sweep not started: {reason}");
        }
        return;
    }
    println!(
        "sweep {:?} in {:.1}s: {} results, {} new ({} of {} pairs failed)",
        summary.phase,
        summary.elapsed.as_secs_f64(),
        summary.results_returned,
        summary.results_inserted,
        summary.pairs_failed,
        summary.pairs_attempted
    );
    for f in &summary.newly_discovered {
        println!("  [{}] {} | {} | {}", f.source_label, f.title, f.price, f.url);
    }
}

async fn edit_targets(store: &ScoutStore, action: TargetAction, telemetry: &dyn TelemetrySink) -> Result<()> {
    match action {
        TargetAction::Add { keyword, schedule_hint } => {
            let target = Target {
                schedule_hint,
                ..Target::parse(&keyword)?
            };
            if store.add_target(&target).await? {
                telemetry.emit("CONFIG", &format!("target added: {}", target.name), Severity::Info);
            } else {
                println!("target {:?} already registered", target.name.as_str());
            }
        }
        TargetAction::Remove { keyword } => {
            let keyword = Keyword::parse(&keyword)?;
            if store.remove_target(&keyword).await? {
                telemetry.emit("CONFIG", &format!("target removed: {keyword}"), Severity::Info);
            } else {
                println!("target {:?} not registered", keyword.as_str());
            }
        }
        TargetAction::List => {
            for target in store.targets().await? {
                match &target.schedule_hint {
                    Some(hint) => println!("{} ({hint})", target.name),
                    None => println!("{}", target.name),
                }
            }
        }
    }
    Ok(())
}

async fn edit_sources(store: &ScoutStore, action: SourceAction, telemetry: &dyn TelemetrySink) -> Result<()> {
    match action {
        SourceAction::Add { source } => {
            let source = SourceDescriptor::parse(&source)?;
            if let SourceDescriptor::Provider(id) = &source {
                if Provider::from_id(id).is_none() {
                    let known = Provider::ALL.map(|p| p.id()).join(", ");
                    bail!("unknown provider {id:?}; expected one of {known} or custom:<domain>");
                }
            }
            if store.add_source(&source).await? {
                telemetry.emit("CONFIG", &format!("source added: {source}"), Severity::Info);
            } else {
                println!("source {source} already registered");
            }
        }
        SourceAction::Remove { source } => {
            let source = SourceDescriptor::parse(&source)?;
            if store.remove_source(&source).await? {
                telemetry.emit("CONFIG", &format!("source removed: {source}"), Severity::Info);
            } else {
                println!("source {source} not registered");
            }
        }
        SourceAction::List => {
            for source in store.sources().await? {
                println!("{source}");
            }
        }
    }
    Ok(())
}
