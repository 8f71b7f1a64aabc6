//! Operator CLI for the AI queue.
//!
//! Every command connects to the shared store, performs one administrative
//! action and prints the result, either as text or as JSON with `--json`.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;

use crate::clock::{system_clock, SharedClock};
use crate::config::Settings;
use crate::metrics::{export_metrics, init_metrics, MetricsCollector};
use crate::queue::{
    sweep_once, AiOperation, AiQueue, EnqueueRequest, Priority, RecoverySweeper, WorkItem,
};
use crate::rate_limit::{LimitKind, RateLimiter};
use crate::store::{RedisStore, SharedStore};

/// Default number of items shown by `peek`.
const DEFAULT_PEEK_LIMIT: usize = 10;

/// Operator tool for the Redis-backed AI request queue.
#[derive(Parser)]
#[command(name = "ai-queue")]
#[command(about = "Inspect and administer the AI request queue, cache and rate limiter")]
#[command(version)]
#[command(
    long_about = "ai-queue inspects and administers the shared AI request queue.\n\nAll processes coordinate through Redis; this tool talks to the same keys.\n\nExample usage:\n  ai-queue status\n  ai-queue peek --limit 5\n  ai-queue sweep --interval-secs 30"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Redis connection URL (overrides REDIS_URL).
    #[arg(long, global = true)]
    pub redis_url: Option<String>,

    /// Queue key namespace (overrides AI_QUEUE_NAMESPACE).
    #[arg(long, global = true)]
    pub namespace: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Output JSON instead of text.
    #[arg(short = 'j', long, global = true)]
    pub json: bool,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Show how many items are pending and in flight.
    Status,

    /// List the next pending items without claiming them.
    Peek(PeekArgs),

    /// Show the status record of one item.
    Inspect(InspectArgs),

    /// Add an item to the queue.
    Enqueue(EnqueueArgs),

    /// Requeue or discard in-flight items whose deadline has passed.
    Recover,

    /// Run the recovery sweep periodically until Ctrl-C.
    Sweep(SweepArgs),

    /// Delete every pending and in-flight item.
    Purge(PurgeArgs),

    /// Check one request against a named rate limit.
    #[command(name = "rate-limit")]
    RateLimit(RateLimitArgs),

    /// Sweep once and print the Prometheus exposition.
    Metrics,
}

/// Arguments for `ai-queue peek`.
#[derive(Parser, Debug)]
pub struct PeekArgs {
    /// Maximum number of items to show.
    #[arg(short = 'n', long, default_value_t = DEFAULT_PEEK_LIMIT)]
    pub limit: usize,
}

/// Arguments for `ai-queue inspect`.
#[derive(Parser, Debug)]
pub struct InspectArgs {
    /// Item id as returned by `enqueue`.
    pub id: String,
}

/// Arguments for `ai-queue enqueue`.
#[derive(Parser, Debug)]
pub struct EnqueueArgs {
    /// User the request belongs to.
    #[arg(long)]
    pub owner: String,

    /// Priority (high, normal, low). Required; there is no implicit default.
    #[arg(short, long)]
    pub priority: Priority,

    /// Operation as JSON, e.g. {"operationKind":"quiz-generation","payload":{...}}.
    #[arg(long)]
    pub operation: String,
}

/// Arguments for `ai-queue sweep`.
#[derive(Parser, Debug)]
pub struct SweepArgs {
    /// Seconds between sweeps (overrides AI_QUEUE_SWEEP_INTERVAL_SECS).
    #[arg(long)]
    pub interval_secs: Option<u64>,
}

/// Arguments for `ai-queue purge`.
#[derive(Parser, Debug)]
pub struct PurgeArgs {
    /// Confirm deletion.
    #[arg(long)]
    pub yes: bool,
}

/// Arguments for `ai-queue rate-limit`.
#[derive(Parser, Debug)]
pub struct RateLimitArgs {
    /// Limit name (auth, ai-generation, quiz-submission, upload, api).
    pub limit: LimitKind,

    /// Caller identifier, e.g. a user id or client address.
    pub identifier: String,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
///
/// Loads [`Settings`] from the environment, applies the global flags and
/// connects to Redis before dispatching.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let mut settings = Settings::from_env()?;
    if let Some(url) = cli.redis_url {
        settings = settings.with_redis_url(url);
    }
    if let Some(namespace) = cli.namespace {
        settings = settings.with_namespace(namespace);
    }
    settings.validate()?;

    let store: SharedStore = Arc::new(RedisStore::connect(&settings.redis_url).await?);
    let ctx = CommandContext {
        store,
        clock: system_clock(),
        settings,
        json: cli.json,
    };
    execute(cli.command, &ctx).await
}

/// Everything a command needs besides its own arguments.
pub struct CommandContext {
    pub store: SharedStore,
    pub clock: SharedClock,
    pub settings: Settings,
    pub json: bool,
}

impl CommandContext {
    fn queue(&self) -> anyhow::Result<AiQueue<AiOperation>> {
        Ok(AiQueue::new(
            self.store.clone(),
            self.clock.clone(),
            self.settings.queue.clone(),
        )?)
    }

    fn print<T: Serialize>(&self, value: &T, text: impl FnOnce() -> String) -> anyhow::Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            println!("{}", text());
        }
        Ok(())
    }
}

/// Executes one command against an already connected store.
pub async fn execute(command: Commands, ctx: &CommandContext) -> anyhow::Result<()> {
    match command {
        Commands::Status => run_status_command(ctx).await,
        Commands::Peek(args) => run_peek_command(args, ctx).await,
        Commands::Inspect(args) => run_inspect_command(args, ctx).await,
        Commands::Enqueue(args) => run_enqueue_command(args, ctx).await,
        Commands::Recover => run_recover_command(ctx).await,
        Commands::Sweep(args) => run_sweep_command(args, ctx).await,
        Commands::Purge(args) => run_purge_command(args, ctx).await,
        Commands::RateLimit(args) => run_rate_limit_command(args, ctx).await,
        Commands::Metrics => run_metrics_command(ctx).await,
    }
}

// ============================================================================
// Queue Commands
// ============================================================================

async fn run_status_command(ctx: &CommandContext) -> anyhow::Result<()> {
    let queue = ctx.queue()?;
    let status = queue.status().await?;
    ctx.print(&status, || {
        format!(
            "Queue '{}'\n  Pending:   {}\n  In flight: {}",
            ctx.settings.queue.namespace, status.pending, status.in_flight
        )
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PeekEntry {
    id: String,
    owner_id: String,
    operation: String,
    priority: Priority,
    retry_count: u32,
    age_ms: i64,
}

impl PeekEntry {
    fn from_item(item: &WorkItem<AiOperation>, now_ms: i64) -> Self {
        Self {
            id: item.id.clone(),
            owner_id: item.owner_id.clone(),
            operation: item.kind().to_string(),
            priority: item.priority,
            retry_count: item.retry_count,
            age_ms: item.age_ms(now_ms),
        }
    }
}

async fn run_peek_command(args: PeekArgs, ctx: &CommandContext) -> anyhow::Result<()> {
    let queue = ctx.queue()?;
    let now = ctx.clock.now_ms();
    let entries: Vec<PeekEntry> = queue
        .peek_pending(args.limit)
        .await?
        .iter()
        .map(|item| PeekEntry::from_item(item, now))
        .collect();

    ctx.print(&entries, || {
        if entries.is_empty() {
            return "No pending items.".to_string();
        }
        let mut out = format!("Next {} pending item(s):", entries.len());
        for entry in &entries {
            out.push_str(&format!(
                "\n  {:<24} {:<6} {:<22} owner={} retries={} age={:.1}s",
                entry.id,
                entry.priority.as_str(),
                entry.operation,
                entry.owner_id,
                entry.retry_count,
                entry.age_ms as f64 / 1000.0
            ));
        }
        out
    })
}

async fn run_inspect_command(args: InspectArgs, ctx: &CommandContext) -> anyhow::Result<()> {
    let queue = ctx.queue()?;
    let Some(record) = queue.item_status(&args.id).await? else {
        anyhow::bail!("no status record for item '{}' (unknown or expired)", args.id);
    };

    ctx.print(&record, || {
        let mut out = format!(
            "Item {}\n  Owner:     {}\n  Operation: {}\n  State:     {}\n  Retries:   {}\n  Updated:   {}",
            record.id,
            record.owner_id,
            record.operation_kind,
            record.state,
            record.retry_count,
            format_timestamp(record.updated_at_ms)
        );
        if let Some(error) = &record.last_error {
            out.push_str(&format!("\n  Error:     {error}"));
        }
        out
    })
}

async fn run_enqueue_command(args: EnqueueArgs, ctx: &CommandContext) -> anyhow::Result<()> {
    let operation: AiOperation = serde_json::from_str(&args.operation)
        .map_err(|e| anyhow::anyhow!("invalid --operation JSON: {e}"))?;
    let queue = ctx.queue()?;
    let id = queue
        .enqueue(EnqueueRequest::new(args.owner, operation, args.priority))
        .await?;

    ctx.print(&serde_json::json!({ "id": id }), || format!("Enqueued {id}"))
}

async fn run_recover_command(ctx: &CommandContext) -> anyhow::Result<()> {
    let queue = ctx.queue()?;
    let requeued = queue.recover_stuck().await?;
    ctx.print(&serde_json::json!({ "requeued": requeued }), || {
        format!("Requeued {requeued} stuck item(s)")
    })
}

async fn run_sweep_command(args: SweepArgs, ctx: &CommandContext) -> anyhow::Result<()> {
    let queue = Arc::new(ctx.queue()?);
    let interval = args
        .interval_secs
        .map(Duration::from_secs)
        .unwrap_or(ctx.settings.pool.sweep_interval);
    if interval.is_zero() {
        anyhow::bail!("--interval-secs must be greater than zero");
    }

    let report = sweep_once(queue.as_ref(), &MetricsCollector::new()).await?;
    info!(
        requeued = report.requeued,
        pending = report.status.pending,
        in_flight = report.status.in_flight,
        "Initial sweep finished"
    );

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let sweeper = tokio::spawn(RecoverySweeper::new(queue, interval, shutdown_rx).run());

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, stopping sweeper");
    let _ = shutdown_tx.send(());
    sweeper.await?;
    Ok(())
}

async fn run_purge_command(args: PurgeArgs, ctx: &CommandContext) -> anyhow::Result<()> {
    if !args.yes {
        anyhow::bail!(
            "purge deletes every pending and in-flight item in '{}'; pass --yes to confirm",
            ctx.settings.queue.namespace
        );
    }

    let queue = ctx.queue()?;
    let removed = queue.purge().await?;
    ctx.print(&removed, || {
        format!(
            "Purged {} pending and {} in-flight item(s)",
            removed.pending, removed.in_flight
        )
    })
}

// ============================================================================
// Rate Limit and Metrics Commands
// ============================================================================

async fn run_rate_limit_command(args: RateLimitArgs, ctx: &CommandContext) -> anyhow::Result<()> {
    let limiter = RateLimiter::new(
        ctx.store.clone(),
        ctx.clock.clone(),
        ctx.settings.rate_limit.clone(),
    )?;
    let decision = limiter.check(args.limit, &args.identifier).await;
    let now = ctx.clock.now_ms();

    ctx.print(&decision, || {
        let verdict = if decision.allowed { "allowed" } else { "denied" };
        format!(
            "{} for {}: {}\n  Remaining: {}/{}\n  Resets:    {} (in {:.1}s)",
            args.limit,
            args.identifier,
            verdict,
            decision.remaining,
            decision.limit,
            format_timestamp(decision.reset_at_ms),
            (decision.reset_at_ms - now).max(0) as f64 / 1000.0
        )
    })
}

async fn run_metrics_command(ctx: &CommandContext) -> anyhow::Result<()> {
    init_metrics()?;
    let queue = ctx.queue()?;
    sweep_once(&queue, &MetricsCollector::new()).await?;
    print!("{}", export_metrics());
    Ok(())
}

fn format_timestamp(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
        .unwrap_or_else(|| ms.to_string())
}
