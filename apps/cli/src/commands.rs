//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use pipewright_core::orchestrator::{
    AgentBatchConfig, BatchOutcome, BatchProgress, ItemOutcome, Orchestrator,
    OrchestratorSettings,
};
use pipewright_core::replay::{ReplayEngine, ReplayOptions, RerunOutcome};
use pipewright_core::wip::WipController;
use pipewright_core::{CommandAgent, StatusRegistry, TransitionTable};
use pipewright_shared::{
    Actor, AppConfig, EntryOrigin, NewQueueItem, RunStatus, init_config, load_config,
    load_config_from,
};
use pipewright_storage::{RunSampleFilter, Storage};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Pipewright: staged content pipeline with per-agent batches.
#[derive(Parser)]
#[command(
    name = "pipewright",
    version,
    about = "Run agent batches over a staged content queue and replay recorded runs.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Database file (defaults to the config value, then ~/.pipewright/pipewright.db).
    #[arg(long, env = "PIPEWRIGHT_DB", global = true)]
    pub db: Option<PathBuf>,

    /// Config file (defaults to ~/.pipewright/pipewright.toml).
    #[arg(long, env = "PIPEWRIGHT_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Queue items: submit, inspect, requeue.
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Agent batch jobs.
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },

    /// Replay recorded pipeline runs.
    Replay {
        #[command(subcommand)]
        action: ReplayAction,
    },

    /// Stage catalogue and transition graph.
    States {
        #[command(subcommand)]
        action: StatesAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Entry origin accepted on the command line.
#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub(crate) enum OriginArg {
    Manual,
    Rss,
    Sitemap,
    Discovery,
}

impl From<OriginArg> for EntryOrigin {
    fn from(origin: OriginArg) -> Self {
        match origin {
            OriginArg::Manual => EntryOrigin::Manual,
            OriginArg::Rss => EntryOrigin::Rss,
            OriginArg::Sitemap => EntryOrigin::Sitemap,
            OriginArg::Discovery => EntryOrigin::Discovery,
        }
    }
}

#[derive(Subcommand)]
pub(crate) enum QueueAction {
    /// Add an item to the queue.
    Submit {
        /// Source URL of the content.
        #[arg(long)]
        url: String,

        /// Title stored in the payload.
        #[arg(long)]
        title: Option<String>,

        /// How the item was found.
        #[arg(long, value_enum, default_value = "manual")]
        origin: OriginArg,

        /// Stage name to enter at.
        #[arg(long, default_value = "to_score")]
        status: String,
    },

    /// Show an item and its status history.
    Show {
        /// Queue item ID.
        id: String,
    },

    /// Manually move an item (e.g. out of dead_letter) back into the pipeline.
    Requeue {
        /// Queue item ID.
        id: String,

        /// Target stage name. Defaults to the ready stage of the step that last failed.
        #[arg(long)]
        status: Option<String>,

        /// Operator name recorded in the history.
        #[arg(long, env = "USER", default_value = "operator")]
        user: String,
    },
}

#[derive(Subcommand)]
pub(crate) enum JobsAction {
    /// Run one batch for an agent.
    Start {
        /// Agent name (e.g. tagger).
        agent: String,

        /// Maximum items to take (defaults to `batch_limit`).
        #[arg(short, long)]
        limit: Option<u32>,
    },

    /// Recent jobs of an agent, newest first.
    List {
        agent: String,

        #[arg(short, long, default_value = "20")]
        limit: u32,
    },

    /// Cancel an agent's running job after its current item.
    Cancel { agent: String },

    /// WIP capacity of every configured agent.
    Wip,
}

#[derive(Subcommand)]
pub(crate) enum ReplayAction {
    /// Replay one run.
    Run {
        run_id: String,

        /// Persist the validation summary onto the run.
        #[arg(long)]
        no_simulate: bool,

        /// Log every replayed step.
        #[arg(long)]
        verbose_steps: bool,
    },

    /// Replay several runs and report the success rate.
    Batch {
        #[arg(required = true)]
        run_ids: Vec<String>,

        #[arg(long)]
        no_simulate: bool,
    },

    /// Replay a random sample of completed runs against the target rate.
    Test {
        #[arg(long, default_value = "100")]
        sample_size: u32,
    },

    /// Run a recorded step's agent again on its recorded input and compare.
    RerunStep {
        /// Step attempt ID.
        step_id: String,
    },

    /// Print random run IDs.
    Sample {
        #[arg(long, default_value = "10")]
        size: u32,

        /// Run status: running, completed or failed.
        #[arg(long)]
        status: Option<String>,

        /// Earliest creation time (RFC 3339 or YYYY-MM-DD).
        #[arg(long)]
        min_date: Option<String>,

        /// Latest creation time (RFC 3339 or YYYY-MM-DD, inclusive).
        #[arg(long)]
        max_date: Option<String>,
    },
}

impl QueueAction {
    fn access(&self) -> Access {
        match self {
            Self::Show { .. } => Access::ReadOnly,
            Self::Submit { .. } | Self::Requeue { .. } => Access::ReadWrite,
        }
    }
}

impl JobsAction {
    fn access(&self) -> Access {
        match self {
            Self::List { .. } | Self::Wip => Access::ReadOnly,
            Self::Start { .. } | Self::Cancel { .. } => Access::ReadWrite,
        }
    }
}

impl ReplayAction {
    fn access(&self) -> Access {
        match self {
            Self::Run { no_simulate, .. } | Self::Batch { no_simulate, .. } if *no_simulate => {
                Access::ReadWrite
            }
            _ => Access::ReadOnly,
        }
    }
}

#[derive(Subcommand)]
pub(crate) enum StatesAction {
    /// List all stages.
    List,
    /// Print the transition graph as a Mermaid state diagram.
    Diagram,
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "pipewright=info",
        1 => "pipewright=debug",
        _ => "pipewright=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };

    match cli.command {
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(&config).await,
        },
        Command::Queue { action } => {
            let ctx = Context::open(config, cli.db, action.access()).await?;
            run_queue(&ctx, action).await
        }
        Command::Jobs { action } => {
            let ctx = Context::open(config, cli.db, action.access()).await?;
            run_jobs(&ctx, action).await
        }
        Command::Replay { action } => {
            let ctx = Context::open(config, cli.db, action.access()).await?;
            run_replay(&ctx, action).await
        }
        Command::States { action } => {
            let ctx = Context::open(config, cli.db, Access::ReadOnly).await?;
            match action {
                StatesAction::List => cmd_states_list(&ctx).await,
                StatesAction::Diagram => cmd_states_diagram(&ctx).await,
            }
        }
    }
}

async fn run_queue(ctx: &Context, action: QueueAction) -> Result<()> {
    match action {
        QueueAction::Submit {
            url,
            title,
            origin,
            status,
        } => cmd_queue_submit(ctx, &url, title, origin, &status).await,
        QueueAction::Show { id } => cmd_queue_show(ctx, &id).await,
        QueueAction::Requeue { id, status, user } => {
            cmd_queue_requeue(ctx, &id, status.as_deref(), &user).await
        }
    }
}

async fn run_jobs(ctx: &Context, action: JobsAction) -> Result<()> {
    match action {
        JobsAction::Start { agent, limit } => cmd_jobs_start(ctx, &agent, limit).await,
        JobsAction::List { agent, limit } => cmd_jobs_list(ctx, &agent, limit).await,
        JobsAction::Cancel { agent } => cmd_jobs_cancel(ctx, &agent).await,
        JobsAction::Wip => cmd_jobs_wip(ctx).await,
    }
}

async fn run_replay(ctx: &Context, action: ReplayAction) -> Result<()> {
    match action {
        ReplayAction::Run {
            run_id,
            no_simulate,
            verbose_steps,
        } => cmd_replay_run(ctx, &run_id, !no_simulate, verbose_steps).await,
        ReplayAction::Batch {
            run_ids,
            no_simulate,
        } => cmd_replay_batch(ctx, &run_ids, !no_simulate).await,
        ReplayAction::Test { sample_size } => cmd_replay_test(ctx, sample_size).await,
        ReplayAction::RerunStep { step_id } => cmd_replay_rerun_step(ctx, &step_id).await,
        ReplayAction::Sample {
            size,
            status,
            min_date,
            max_date,
        } => {
            cmd_replay_sample(
                ctx,
                size,
                status.as_deref(),
                min_date.as_deref(),
                max_date.as_deref(),
            )
            .await
        }
    }
}

// ---------------------------------------------------------------------------
// Shared context
// ---------------------------------------------------------------------------

/// How a command opens the database.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Access {
    ReadWrite,
    /// Inspection and simulated replay. Writes are refused by the store.
    ReadOnly,
}

/// Loaded config, open database and the stage graph.
struct Context {
    config: AppConfig,
    storage: Storage,
    registry: StatusRegistry,
    transitions: TransitionTable,
}

impl Context {
    async fn open(config: AppConfig, db: Option<PathBuf>, access: Access) -> Result<Self> {
        let path = match db {
            Some(path) => path,
            None => config.database_path()?,
        };
        // A missing database is created and migrated first.
        let storage = if access == Access::ReadOnly && path.exists() {
            info!(path = %path.display(), "opening database read-only");
            Storage::open_readonly(&path).await?
        } else {
            info!(path = %path.display(), "opening database");
            Storage::open(&path).await?
        };

        let registry = StatusRegistry::new();
        registry.load(&storage).await?;
        let transitions = TransitionTable::new();
        transitions.load(&storage).await?;

        Ok(Self {
            config,
            storage,
            registry,
            transitions,
        })
    }

    fn orchestrator(&self) -> Orchestrator<'_> {
        Orchestrator::new(
            &self.storage,
            &self.registry,
            &self.transitions,
            OrchestratorSettings::from(&self.config.defaults),
        )
    }

    fn batch_config(&self, agent: &str) -> Result<(CommandAgent, AgentBatchConfig)> {
        let settings = self
            .config
            .agent(agent)
            .ok_or_else(|| eyre!("unknown agent '{agent}'"))?;
        let runner = CommandAgent::new(agent, &settings.command)?;
        let batch = AgentBatchConfig::resolve(
            agent,
            &settings,
            &self.registry,
            self.config.wip_limit(agent),
        )?;
        Ok((runner, batch))
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

async fn cmd_queue_submit(
    ctx: &Context,
    url: &str,
    title: Option<String>,
    origin: OriginArg,
    status: &str,
) -> Result<()> {
    let status_code = ctx.registry.code(status)?;
    let payload = match title {
        Some(title) => serde_json::json!({ "title": title }),
        None => serde_json::json!({}),
    };

    let item = ctx
        .storage
        .enqueue_item(&NewQueueItem {
            url: Some(url.to_string()),
            status_code,
            payload,
            origin: origin.into(),
        })
        .await?;

    info!(item_id = %item.id, status = status_code, "item submitted");
    println!("{}", item.id);
    Ok(())
}

async fn cmd_queue_show(ctx: &Context, id: &str) -> Result<()> {
    let item = ctx.storage.require_item(id).await?;
    println!("{}", serde_json::to_string_pretty(&item)?);

    let history = ctx.storage.status_history(id).await?;
    if !history.is_empty() {
        println!();
        println!("  History:");
        for change in history {
            println!(
                "  {}  {} → {}  {}{}",
                change.changed_at.format("%Y-%m-%d %H:%M:%S"),
                ctx.registry.label(change.from)?,
                ctx.registry.label(change.to)?,
                change.actor,
                if change.manual { " (manual)" } else { "" }
            );
        }
    }

    let runs = ctx.storage.runs_for_item(id).await?;
    if !runs.is_empty() {
        println!();
        println!("  Runs:");
        for run in runs {
            let current = item.current_run_id.as_deref() == Some(run.id.as_str());
            println!(
                "  {}  {:<9}  {}  {}{}",
                run.created_at.format("%Y-%m-%d %H:%M:%S"),
                run.status.as_str(),
                run.trigger.as_str(),
                run.id,
                if current { " (current)" } else { "" }
            );
        }
    }
    Ok(())
}

async fn cmd_queue_requeue(
    ctx: &Context,
    id: &str,
    status: Option<&str>,
    user: &str,
) -> Result<()> {
    let target = match status {
        Some(name) => ctx.registry.code(name)?,
        None => {
            let item = ctx.storage.require_item(id).await?;
            let step = item
                .last_failed_step
                .ok_or_else(|| eyre!("item {id} has no failed step; pass --status"))?;
            let settings = ctx
                .config
                .all_agents()
                .into_values()
                .find(|a| a.step_name == step)
                .ok_or_else(|| eyre!("no agent runs step '{step}'; pass --status"))?;
            ctx.registry.code(&settings.ready_status)?
        }
    };

    let item = ctx
        .orchestrator()
        .requeue(id, target, &Actor::User(user.to_string()))
        .await?;
    println!("{} → {}", item.id, ctx.registry.label(item.status_code)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// Batch progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new(agent: &str) -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.set_message(format!("{agent}: selecting items"));
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl BatchProgress for CliProgress {
    fn item_started(&self, index: usize, total: usize, title: &str) {
        self.spinner
            .set_message(format!("[{}/{total}] {title}", index + 1));
    }

    fn item_finished(&self, item_id: &str, outcome: &ItemOutcome) {
        let line = match outcome {
            ItemOutcome::Advanced { to } => format!("  ✓ {item_id} → {to}"),
            ItemOutcome::Rejected => format!("  – {item_id} rejected"),
            ItemOutcome::Retrying { failure_count } => {
                format!("  ✗ {item_id} failed (attempt {failure_count}), will retry")
            }
            ItemOutcome::DeadLettered { failure_count } => {
                format!("  ✗ {item_id} dead-lettered after {failure_count} failure(s)")
            }
            ItemOutcome::Contended { reason } => format!("  ~ {item_id} skipped: {reason}"),
        };
        self.spinner.println(line);
    }
}

async fn cmd_jobs_start(ctx: &Context, agent: &str, limit: Option<u32>) -> Result<()> {
    let (runner, batch) = ctx.batch_config(agent)?;
    let limit = limit.unwrap_or(ctx.config.defaults.batch_limit);

    let progress = CliProgress::new(agent);
    let outcome = ctx
        .orchestrator()
        .run_batch(&runner, &batch, limit, &progress)
        .await;
    progress.finish();
    let outcome = outcome?;

    match &outcome {
        BatchOutcome::Skipped {
            capacity: Some(capacity),
            ..
        } => println!(
            "{} ({}/{} in {})",
            outcome.message(),
            capacity.current,
            capacity.limit,
            ctx.registry.label(batch.stages.working)?
        ),
        _ => println!("{}", outcome.message()),
    }
    Ok(())
}

async fn cmd_jobs_list(ctx: &Context, agent: &str, limit: u32) -> Result<()> {
    let jobs = ctx.storage.list_jobs(Some(agent), limit).await?;
    if jobs.is_empty() {
        println!("no jobs for {agent}");
        return Ok(());
    }

    for job in jobs {
        println!(
            "{}  {:<9}  {:>3}/{:<3}  ok={} failed={}  {}{}",
            job.id,
            job.status.as_str(),
            job.processed_items,
            job.total_items,
            job.success_count,
            job.failed_count,
            job.started_at.format("%Y-%m-%d %H:%M:%S"),
            job.error_message
                .as_deref()
                .map(|m| format!("  ({m})"))
                .unwrap_or_default()
        );
    }
    Ok(())
}

async fn cmd_jobs_cancel(ctx: &Context, agent: &str) -> Result<()> {
    match ctx.orchestrator().cancel_job(agent).await? {
        Some(job) => println!(
            "cancelled job {} ({}/{} processed)",
            job.id, job.processed_items, job.total_items
        ),
        None => println!("no running job for {agent}"),
    }
    Ok(())
}

async fn cmd_jobs_wip(ctx: &Context) -> Result<()> {
    let wip = WipController::new(&ctx.storage);
    for (name, settings) in ctx.config.all_agents() {
        let working = match ctx.registry.code(&settings.working_status) {
            Ok(code) => code,
            Err(e) => {
                warn!(agent = %name, error = %e, "skipping agent");
                continue;
            }
        };
        let capacity = wip
            .check_capacity(&name, working, ctx.config.wip_limit(&name))
            .await?;
        println!(
            "{name:<12}  current={:<4} limit={:<4} available={:<4} utilization={:.1}%",
            capacity.current, capacity.limit, capacity.available, capacity.utilization_pct
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

async fn cmd_replay_run(ctx: &Context, run_id: &str, simulate: bool, verbose: bool) -> Result<()> {
    let report = ReplayEngine::new(&ctx.storage)
        .replay_run(run_id, ReplayOptions { simulate, verbose })
        .await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn cmd_replay_batch(ctx: &Context, run_ids: &[String], simulate: bool) -> Result<()> {
    let summary = ReplayEngine::new(&ctx.storage)
        .replay_batch(run_ids, simulate)
        .await;

    for result in &summary.results {
        let detail = result
            .error
            .clone()
            .or_else(|| result.validation.errors.first().cloned())
            .unwrap_or_default();
        println!(
            "  {} {}  {}",
            if result.success { "✓" } else { "✗" },
            result.run_id,
            detail
        );
    }
    println!();
    println!("  Total:        {}", summary.total);
    println!("  Successful:   {}", summary.successful);
    println!("  Failed:       {}", summary.failed);
    println!("  Success rate: {:.2}%", summary.success_rate);
    Ok(())
}

async fn cmd_replay_test(ctx: &Context, sample_size: u32) -> Result<()> {
    let target = ctx.config.defaults.replay_target_pct;
    let report = ReplayEngine::new(&ctx.storage)
        .test_replay_capability(sample_size, target)
        .await?;

    println!();
    println!("  Replay test on {} completed run(s)", report.summary.total);
    println!("  Successful:   {}", report.summary.successful);
    println!("  Failed:       {}", report.summary.failed);
    println!("  Success rate: {:.2}%", report.summary.success_rate);
    println!("  Target:       {:.2}%", report.target_pct);
    println!(
        "  Status:       {}",
        if report.meets_target { "PASS" } else { "FAIL" }
    );
    println!();

    if !report.meets_target {
        return Err(eyre!(
            "replay success rate {:.2}% is below the {:.2}% target",
            report.summary.success_rate,
            report.target_pct
        ));
    }
    Ok(())
}

async fn cmd_replay_rerun_step(ctx: &Context, step_id: &str) -> Result<()> {
    let step = ctx
        .storage
        .get_step(step_id)
        .await?
        .ok_or_else(|| eyre!("step run not found: {step_id}"))?;
    let (name, settings) = ctx
        .config
        .all_agents()
        .into_iter()
        .find(|(_, a)| a.step_name == step.step_name)
        .ok_or_else(|| eyre!("no agent runs step '{}'", step.step_name))?;
    let runner = CommandAgent::new(&name, &settings.command)?;
    info!(agent = runner.name(), step = %step.step_name, "rerunning recorded step");

    let report = ReplayEngine::new(&ctx.storage)
        .rerun_step(step_id, &runner, ctx.config.defaults.agent_timeout())
        .await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.matches_recorded {
        let detail = match &report.outcome {
            RerunOutcome::Completed { .. } => "output differs".to_string(),
            RerunOutcome::Rejected { reason } => format!("rejected: {reason}"),
            RerunOutcome::Failed { error } => format!("failed: {error}"),
        };
        warn!(agent = runner.name(), %detail, "rerun does not match the recorded step");
    }
    Ok(())
}

async fn cmd_replay_sample(
    ctx: &Context,
    size: u32,
    status: Option<&str>,
    min_date: Option<&str>,
    max_date: Option<&str>,
) -> Result<()> {
    let status = status
        .map(|s| RunStatus::parse(s).ok_or_else(|| eyre!("unknown run status '{s}'")))
        .transpose()?;
    let filter = RunSampleFilter {
        size,
        status,
        since: min_date.map(|d| parse_date(d, false)).transpose()?,
        until: max_date.map(|d| parse_date(d, true)).transpose()?,
    };

    for run_id in ReplayEngine::new(&ctx.storage).sample(&filter).await? {
        println!("{run_id}");
    }
    Ok(())
}

/// Parse an RFC 3339 timestamp or a plain date. A plain date means the start
/// of that day, or its last second when `end_of_day` is set.
fn parse_date(input: &str, end_of_day: bool) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(input) {
        return Ok(ts.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .map_err(|e| eyre!("invalid date '{input}': {e}"))?;
    let time = if end_of_day {
        date.and_hms_opt(23, 59, 59)
    } else {
        date.and_hms_opt(0, 0, 0)
    };
    time.map(|t| t.and_utc())
        .ok_or_else(|| eyre!("invalid date '{input}'"))
}

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

async fn cmd_states_list(ctx: &Context) -> Result<()> {
    for entry in ctx.registry.entries()? {
        let note = if ctx.transitions.is_terminal(entry.code)? {
            "  (terminal)"
        } else if ctx.transitions.ends_automation(entry.code)? {
            "  (manual only)"
        } else {
            ""
        };
        println!("{:>4}  {}{note}", entry.code, entry.name);
    }
    Ok(())
}

async fn cmd_states_diagram(ctx: &Context) -> Result<()> {
    print!("{}", ctx.transitions.to_mermaid(&ctx.registry)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(config: &AppConfig) -> Result<()> {
    let resolved = AppConfig {
        agents: config.all_agents(),
        ..config.clone()
    };
    let toml_str = toml::to_string_pretty(&resolved)?;
    println!("{toml_str}");
    Ok(())
}
