use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use batchwise_core::{
    config_schema_json, load_config, write_schema_file, BatchPlanner, Config, ContentCache,
    HttpOracle, MetricsCollector, ParallelScheduler, ThresholdPlanner,
};
use clap::{Args, CommandFactory, Parser, Subcommand};
use serde_json::json;
use tokio_util::sync::CancellationToken;

mod items;

#[derive(Parser)]
#[command(name = "batchwise", version, about = "Cached, bounded-concurrency batch runs against an analysis oracle")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan and run work items against an HTTP oracle (JSON result on stdout)
    Run(RunArgs),
    /// Inspect or maintain a cache snapshot file
    Cache {
        #[command(subcommand)]
        cmd: CacheCmd,
    },
    /// Configuration helpers
    Config {
        #[command(subcommand)]
        cmd: ConfigCmd,
    },
    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Items file: a JSON array or JSON lines of {id, source, payload}
    #[arg(long)]
    items: PathBuf,
    /// Oracle endpoint; every payload is POSTed here as JSON
    #[arg(long, env = "BATCHWISE_ORACLE_URL")]
    endpoint: String,
    /// Bearer token for the oracle
    #[arg(long, env = "BATCHWISE_ORACLE_TOKEN", hide_env_values = true)]
    token: Option<String>,
    /// TOML config file (defaults plus BATCHWISE_* env when omitted)
    #[arg(long)]
    config: Option<String>,
    /// Cache snapshot loaded before and saved after the run
    #[arg(long)]
    snapshot: Option<PathBuf>,
    /// Override scheduler.max_concurrency
    #[arg(long)]
    max_concurrency: Option<usize>,
    /// Largest batch the planner forms
    #[arg(long, default_value_t = 8)]
    max_batch_items: usize,
    /// Items costing more than this always run alone
    #[arg(long, default_value_t = 8 * 1024)]
    max_item_cost: u64,
    /// Disable result caching for this run
    #[arg(long)]
    no_cache: bool,
    /// Exit non-zero when any item failed
    #[arg(long)]
    strict: bool,
    /// Pretty-print JSON output
    #[arg(long)]
    pretty: bool,
}

#[derive(Subcommand)]
enum CacheCmd {
    /// Print entry counts and counters of a snapshot
    Stats(SnapshotArgs),
    /// Drop expired entries from a snapshot
    Prune(SnapshotArgs),
    /// Empty a snapshot
    Clear(SnapshotArgs),
}

#[derive(Args)]
struct SnapshotArgs {
    /// Snapshot file
    #[arg(long)]
    snapshot: PathBuf,
    /// Pretty-print JSON output
    #[arg(long)]
    pretty: bool,
}

#[derive(Subcommand)]
enum ConfigCmd {
    /// Print (or write) the JSON schema of the config file
    Schema {
        /// Write to this path instead of stdout
        #[arg(long)]
        out: Option<String>,
    },
    /// Print the effective configuration
    Show {
        #[arg(long)]
        config: Option<String>,
    },
}

#[derive(Args)]
struct CompletionsArgs {
    /// Target shell (bash, zsh, fish, powershell, elvish)
    shell: clap_complete::Shell,
    /// Output directory (writes a file). If not set, prints to stdout.
    #[arg(long)]
    out_dir: Option<String>,
}

#[tokio::main]
async fn main() {
    batchwise_otel::init();
    let cli = Cli::parse();
    let outcome = match cli.command {
        Commands::Run(args) => cmd_run(args).await,
        Commands::Cache { cmd } => match cmd {
            CacheCmd::Stats(args) => cmd_cache_stats(&args).await,
            CacheCmd::Prune(args) => cmd_cache_prune(&args).await,
            CacheCmd::Clear(args) => cmd_cache_clear(&args).await,
        },
        Commands::Config { cmd } => match cmd {
            ConfigCmd::Schema { out } => cmd_config_schema(out.as_deref()),
            ConfigCmd::Show { config } => cmd_config_show(config.as_deref()),
        },
        Commands::Completions(args) => cmd_completions(args.shell, args.out_dir.as_deref()),
    };
    match outcome {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn print_json(value: &serde_json::Value, pretty: bool) {
    if pretty {
        println!(
            "{}",
            serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
        );
    } else {
        println!("{}", value);
    }
}

fn effective_config(path: Option<&str>) -> Result<Config> {
    match path {
        Some(path) => load_config(path),
        None => {
            let cfg = Config::from_env();
            cfg.validate().context("validating environment configuration")?;
            Ok(cfg)
        }
    }
}

async fn cmd_run(args: RunArgs) -> Result<i32> {
    let mut cfg = effective_config(args.config.as_deref())?;
    if let Some(n) = args.max_concurrency {
        cfg.scheduler.max_concurrency = n;
    }
    if args.no_cache {
        cfg.cache.enabled = false;
    }
    let work = items::load_items(&args.items)?;

    let metrics = Arc::new(MetricsCollector::new());
    metrics.set_enabled(cfg.metrics.enabled);
    let cache = Arc::new(
        ContentCache::from_config(&cfg.cache)
            .context("opening cache store")?
            .with_metrics(metrics.clone()),
    );
    if let (Some(path), true) = (&args.snapshot, cfg.cache.enabled) {
        let loaded = cache
            .load_snapshot(path)
            .await
            .with_context(|| format!("loading snapshot {}", path.display()))?;
        tracing::info!(entries = loaded, "cache warmed from snapshot");
    }
    let janitor = match (cfg.cache.enabled, cfg.cache.cleanup_interval()) {
        (true, Some(interval)) => Some(cache.spawn_janitor(interval)),
        _ => None,
    };

    let mut oracle = HttpOracle::new(args.endpoint.clone()).context("building oracle client")?;
    if let Some(token) = args.token.as_deref() {
        oracle = oracle.with_bearer(token);
    }
    tracing::info!(
        endpoint = oracle.endpoint(),
        authenticated = args.token.is_some(),
        "oracle configured"
    );
    let scheduler = ParallelScheduler::builder(Arc::new(oracle))
        .apply_config(&cfg)
        .cache(cache.clone())
        .metrics(metrics.clone())
        .build()
        .context("configuring scheduler")?;

    let planner = ThresholdPlanner::default()
        .with_max_batch_items(args.max_batch_items)
        .with_max_item_cost(args.max_item_cost);
    let planned = planner.plan(work);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; finishing the current chunk");
            on_signal.cancel();
        }
    });

    let result = scheduler
        .run_with_cancel(planned.batches, planned.individual, &cancel)
        .await?;

    cache.stop_janitor();
    if let Some(handle) = janitor {
        let _ = handle.await;
    }
    if let (Some(path), true) = (&args.snapshot, cfg.cache.enabled) {
        cache
            .save_snapshot(path)
            .await
            .with_context(|| format!("saving snapshot {}", path.display()))?;
    }

    let out = json!({
        "results": result.results,
        "metrics": result.metrics,
        "errors": result.errors,
        "cache": cache.stats(),
        "counters": metrics.snapshot(),
    });
    print_json(&out, args.pretty);
    Ok(if args.strict && !result.all_succeeded() { 2 } else { 0 })
}

/// Snapshot files are maintained through an in-memory cache sized to hold them.
fn snapshot_cache() -> ContentCache {
    let cfg = Config::from_env();
    ContentCache::new(u64::MAX, cfg.cache.ttl())
}

async fn snapshot_entry_count(path: &Path) -> Result<usize> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let snapshot: batchwise_core::CacheSnapshot = serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing snapshot {}", path.display()))?;
            Ok(snapshot.entries.len())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(err) => Err(err).with_context(|| format!("reading snapshot {}", path.display())),
    }
}

async fn cmd_cache_stats(args: &SnapshotArgs) -> Result<i32> {
    let stored = snapshot_entry_count(&args.snapshot).await?;
    let cache = snapshot_cache();
    cache
        .load_snapshot(&args.snapshot)
        .await
        .with_context(|| format!("loading snapshot {}", args.snapshot.display()))?;
    let stats = cache.stats();
    let out = json!({
        "snapshot": args.snapshot.display().to_string(),
        "stored_entries": stored,
        "live_entries": stats.entries,
        "total_size": stats.total_size,
        "hits": stats.hits,
        "misses": stats.misses,
        "sets": stats.sets,
        "deletes": stats.deletes,
        "hit_rate": stats.hit_rate,
    });
    print_json(&out, args.pretty);
    Ok(0)
}

async fn cmd_cache_prune(args: &SnapshotArgs) -> Result<i32> {
    let before = snapshot_entry_count(&args.snapshot).await?;
    let cache = snapshot_cache();
    let after = cache
        .load_snapshot(&args.snapshot)
        .await
        .with_context(|| format!("loading snapshot {}", args.snapshot.display()))?;
    cache
        .save_snapshot(&args.snapshot)
        .await
        .with_context(|| format!("saving snapshot {}", args.snapshot.display()))?;
    print_json(
        &json!({"before": before, "after": after, "removed": before.saturating_sub(after)}),
        args.pretty,
    );
    Ok(0)
}

async fn cmd_cache_clear(args: &SnapshotArgs) -> Result<i32> {
    let before = snapshot_entry_count(&args.snapshot).await?;
    let cache = snapshot_cache();
    cache
        .save_snapshot(&args.snapshot)
        .await
        .with_context(|| format!("saving snapshot {}", args.snapshot.display()))?;
    print_json(&json!({"removed": before}), args.pretty);
    Ok(0)
}

fn cmd_config_schema(out: Option<&str>) -> Result<i32> {
    match out {
        Some(path) => {
            write_schema_file(path).with_context(|| format!("writing schema to {path}"))?;
            println!("Wrote {path}");
        }
        None => print_json(&config_schema_json(), true),
    }
    Ok(0)
}

fn cmd_config_show(path: Option<&str>) -> Result<i32> {
    let cfg = effective_config(path)?;
    let value = serde_json::to_value(&cfg)?;
    print_json(&value, true);
    Ok(0)
}

fn cmd_completions(shell: clap_complete::Shell, out_dir: Option<&str>) -> Result<i32> {
    use clap_complete::{generate, generate_to};
    use std::io::stdout;
    let mut cmd = Cli::command();
    let bin = "batchwise";
    if let Some(dir) = out_dir {
        let dir_path = Path::new(dir);
        std::fs::create_dir_all(dir_path).ok();
        let path = generate_to(shell, &mut cmd, bin, dir_path)?;
        println!("Wrote {}", path.display());
    } else {
        generate(shell, &mut cmd, bin, &mut stdout());
    }
    Ok(0)
}
