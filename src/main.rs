//! batchwise CLI - resumable batch resolution against a lookup API.

use anyhow::{Context, Result, bail};
use batchwise::checkpoint::NamespaceLock;
use batchwise::models::load_input;
use batchwise::{
    BatchPlanner, BatchRunner, CheckpointStore, Config, FailureLog, HttpResolver, Lookup, Plan,
    RateLimiter, RunOutcome, ShutdownSignal,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "batchwise")]
#[command(version)]
#[command(about = "Resumable batch resolution of identifiers against a remote lookup API")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve the next batch(es) and commit the checkpoint
    Run {
        /// Override engine.batch_size
        #[arg(long)]
        batch_size: Option<usize>,

        /// Override engine.max_total
        #[arg(long)]
        max_total: Option<usize>,

        /// Override engine.workers
        #[arg(long)]
        workers: Option<usize>,

        /// Override engine.max_batches
        #[arg(long)]
        max_batches: Option<usize>,

        /// Hide the progress bar
        #[arg(long)]
        no_progress: bool,
    },

    /// Show checkpoint progress and the next planned slice
    Status,

    /// Write still-unresolved failures as a new input file
    ExportFailures {
        /// Path to output JSON file
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Validate configuration file
    Validate,

    /// Show example configuration
    Example,

    /// Remove a stale checkpoint lock left by a killed run
    Unlock,
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("warning: tracing subscriber already set");
    }
}

fn print_example_config() {
    let example = r#"# batchwise configuration file

[resolver]
base_url = "https://mdl-pi.vercel.app"
search_path = "/search/q/{query}"
detail_path = "/id/{key}"
timeout_secs = 10
user_agent = "Mozilla/5.0"
# headers = { Authorization = "Bearer ${LOOKUP_TOKEN}" }

[resolver.lookup]
query_from = "slug"          # or "title"
results_pointer = "/results/dramas"
identity_field = "slug"
identity_format = "{id}"     # e.g. "{id}-2019" when ids lack a suffix
# detail_key_field = "slug"  # fetch details for the matched entry

[engine]
batch_size = 4000
# max_total = 10000
max_attempts = 3
retry_delay_ms = 1000
request_delay_ms = 1000
workers = 1
no_match_is_permanent = false
max_batches = 1

[storage]
input = "input.json"
checkpoint_dir = "checkpoint"
output_dir = "output"
# failure_log = "checkpoint/failures.jsonl"
"#;
    println!("{example}");
}

fn load_config(path: &PathBuf) -> Result<Config> {
    Config::from_file(path).with_context(|| format!("Failed to load config from {path:?}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Example => {
            print_example_config();
        }

        Commands::Validate => {
            let config = load_config(&cli.config)?;
            config
                .engine_config(false)
                .context("Invalid engine configuration")?;
            HttpResolver::new(&config.resolver, None).context("Invalid resolver configuration")?;

            info!("Configuration is valid");
            info!("  Resolver: {}", config.resolver.base_url);
            info!(
                "  Batch size: {}, attempts: {}, workers: {}",
                config.engine.batch_size, config.engine.max_attempts, config.engine.workers
            );
            info!("  Input: {:?}", config.storage.input);
        }

        Commands::Run {
            batch_size,
            max_total,
            workers,
            max_batches,
            no_progress,
        } => {
            let mut config = load_config(&cli.config)?;

            // CLI overrides
            if let Some(n) = batch_size {
                config.engine.batch_size = n;
            }
            if max_total.is_some() {
                config.engine.max_total = max_total;
            }
            if let Some(n) = workers {
                config.engine.workers = n;
            }
            if let Some(n) = max_batches {
                config.engine.max_batches = n;
            }

            let engine = config
                .engine_config(!no_progress)
                .context("Invalid engine configuration")?;
            let rate_limiter = Arc::new(RateLimiter::new());
            let resolver = Arc::new(
                HttpResolver::new(&config.resolver, Some(Arc::clone(&rate_limiter)))
                    .context("Failed to build resolver")?,
            );
            let lookup = Lookup::new(config.resolver.lookup.clone());

            let shutdown = ShutdownSignal::new();
            let trigger = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, stopping after in-flight requests");
                    trigger.trigger();
                }
            });

            let mut runner = BatchRunner::new(engine, resolver, lookup, shutdown);
            let outcome = runner.run().await;
            let report = outcome.report();

            println!("\n=== Run {} ===", report.run_id);
            for batch in &report.batches {
                println!(
                    "Batch {:>4}  [{}..{})  resolved {:>5}  failed {:>5}  skipped {:>5}  {:.1}s",
                    batch.batch_index,
                    batch.start,
                    batch.end,
                    batch.resolved,
                    batch.failed,
                    batch.skipped,
                    batch.runtime_secs
                );
            }
            println!("Resolved:    {}", report.resolved());
            println!("Failed:      {}", report.failed());
            println!("Skipped:     {}", report.skipped());
            let limits = rate_limiter.stats();
            println!(
                "Requests:    {} ({} rate limited, {:.1}s waited)",
                limits.total_requests, limits.total_429s, limits.total_wait_secs
            );
            if report.recovered_batches > 0 {
                println!("Recovered:   {} interrupted batch(es)", report.recovered_batches);
            }
            println!(
                "Remaining:   {}",
                if report.exhausted { "none" } else { "more batches to run" }
            );

            if let RunOutcome::Aborted { reason, .. } = outcome {
                bail!("Run aborted: {reason}");
            }
        }

        Commands::Status => {
            let config = load_config(&cli.config)?;
            let mut store = CheckpointStore::new(&config.storage.checkpoint_dir)
                .context("Failed to open checkpoint")?;
            let state = store.load();
            let failure_log = FailureLog::new(&config.storage.failure_log_path());
            let failures = failure_log.read_all();
            let unresolved = failure_log.unresolved_ids(&state.done);

            if store.exists() {
                println!("Checkpoint:  {:?}", config.storage.checkpoint_dir);
            } else {
                println!("Checkpoint:  {:?} (none yet)", config.storage.checkpoint_dir);
            }
            println!("Done:        {}", state.done.len());
            println!(
                "Cursor:      index {} (batch {})",
                state.cursor.last_index, state.cursor.batch_index
            );
            if let Some(updated_at) = state.updated_at {
                println!("Updated:     {updated_at}");
            }
            println!("Failures:    {} logged, {} unresolved", failures.len(), unresolved.len());
            if let Some(owner) = NamespaceLock::owner(&config.storage.checkpoint_dir) {
                println!("Locked by:   pid {} (run {})", owner.pid, owner.run_id);
            }

            match load_input(&config.storage.input) {
                Ok(items) => {
                    let planner =
                        BatchPlanner::new(config.engine.batch_size, config.engine.max_total);
                    match planner.next_slice(&items, state.cursor) {
                        Plan::Slice { plan, .. } => println!(
                            "Next batch:  {} [{}..{}) of {}",
                            plan.batch_index,
                            plan.start,
                            plan.end,
                            items.len()
                        ),
                        Plan::Exhausted => println!("Next batch:  none, all {} planned", items.len()),
                    }
                }
                Err(e) => warn!(error = %e, "Cannot plan next batch"),
            }
        }

        Commands::ExportFailures { output } => {
            let config = load_config(&cli.config)?;
            let mut store = CheckpointStore::new(&config.storage.checkpoint_dir)
                .context("Failed to open checkpoint")?;
            let state = store.load();
            let count = FailureLog::new(&config.storage.failure_log_path())
                .export_unresolved(&state.done, &output)
                .with_context(|| format!("Failed to export failures to {output:?}"))?;
            println!("Exported {count} unresolved item(s) to {output:?}");
        }

        Commands::Unlock => {
            let config = load_config(&cli.config)?;
            let dir = &config.storage.checkpoint_dir;
            if NamespaceLock::force_release(dir).context("Failed to remove lock")? {
                info!(checkpoint = ?dir, "Lock removed");
            } else {
                info!(checkpoint = ?dir, "No lock present");
            }
        }
    }

    Ok(())
}
