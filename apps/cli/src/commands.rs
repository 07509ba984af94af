//! CLI command definitions, routing, and tracing setup.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use leadscout_core::{JobLifecycle, JobMachine, PollOrchestrator, PromptConfig, TieredParser};
use leadscout_remote::GeminiClient;
use leadscout_shared::{
    AppConfig, JobId, JobStatus, ResearchJob, config_file_path, init_config, load_config,
    validate_api_key,
};
use leadscout_storage::Storage;
use tracing::info;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// LeadScout: AI research jobs for lead discovery.
#[derive(Parser)]
#[command(
    name = "leadscout",
    version,
    about = "Submit AI research jobs per city and merge the leads they find.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Database path (overrides the config file).
    #[arg(long, global = true, env = "LEADSCOUT_DB")]
    pub db: Option<PathBuf>,

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
    /// Start a research job for a locality (id or name).
    Submit {
        locality: String,
    },

    /// Run one poll cycle over all running jobs.
    Poll,

    /// Poll running jobs on an interval until interrupted.
    Watch {
        /// Seconds between cycles (defaults to the config value).
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Re-parse a finished job's stored output.
    Reprocess {
        job: String,
    },

    /// Delete a finished job.
    Delete {
        job: String,
    },

    /// Inspect research jobs.
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },

    /// Manage research localities.
    Locality {
        #[command(subcommand)]
        action: LocalityAction,
    },

    /// Manage the record type taxonomy.
    Types {
        #[command(subcommand)]
        action: TypesAction,
    },

    /// Inspect persisted records.
    Records {
        #[command(subcommand)]
        action: RecordsAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub(crate) enum JobsAction {
    /// List jobs, newest first.
    List {
        /// Only jobs in this status.
        #[arg(long)]
        status: Option<String>,
    },
    /// Show one job in detail.
    Show { job: String },
}

#[derive(Subcommand)]
pub(crate) enum LocalityAction {
    /// Register a locality.
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        country: String,
        /// ISO 3166-1 alpha-2 country code, used for phone numbers.
        #[arg(long, default_value = "")]
        iso2: String,
    },
    /// List localities.
    List,
}

#[derive(Subcommand)]
pub(crate) enum TypesAction {
    /// Register a record type.
    Add { name: String },
    /// List record types.
    List,
}

#[derive(Subcommand)]
pub(crate) enum RecordsAction {
    /// List the records of a locality (id or name).
    List { locality: String },
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
        0 => "leadscout=info",
        1 => "leadscout=debug",
        _ => "leadscout=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let db = cli.db;
    match cli.command {
        Command::Submit { locality } => cmd_submit(&Context::open(db).await?, &locality).await,
        Command::Poll => cmd_poll(&Context::open(db).await?).await,
        Command::Watch { interval } => cmd_watch(&Context::open(db).await?, interval).await,
        Command::Reprocess { job } => cmd_reprocess(&Context::open(db).await?, &job).await,
        Command::Delete { job } => cmd_delete(&Context::open(db).await?, &job).await,
        Command::Jobs { action } => {
            let ctx = Context::open(db).await?;
            match action {
                JobsAction::List { status } => cmd_jobs_list(&ctx, status.as_deref()).await,
                JobsAction::Show { job } => cmd_jobs_show(&ctx, &job).await,
            }
        }
        Command::Locality { action } => {
            let ctx = Context::open(db).await?;
            match action {
                LocalityAction::Add {
                    name,
                    country,
                    iso2,
                } => cmd_locality_add(&ctx, &name, &country, &iso2).await,
                LocalityAction::List => cmd_locality_list(&ctx).await,
            }
        }
        Command::Types { action } => {
            let ctx = Context::open(db).await?;
            match action {
                TypesAction::Add { name } => cmd_types_add(&ctx, &name).await,
                TypesAction::List => cmd_types_list(&ctx).await,
            }
        }
        Command::Records { action } => match action {
            RecordsAction::List { locality } => {
                cmd_records_list(&Context::open(db).await?, &locality).await
            }
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(db),
        },
    }
}

/// Loaded config plus an open database.
struct Context {
    config: AppConfig,
    storage: Arc<Storage>,
}

impl Context {
    async fn open(db: Option<PathBuf>) -> Result<Self> {
        let config = load_config()?;
        let path = match db {
            Some(path) => path,
            None => config.database.resolved_path()?,
        };
        info!(path = %path.display(), "opening database");
        let storage = Arc::new(Storage::open(&path).await?);
        Ok(Self { config, storage })
    }

    /// Build the job state machine against the Gemini API.
    fn machine(&self) -> Result<Arc<JobMachine>> {
        let api_key = validate_api_key(&self.config)?;
        let client = Arc::new(GeminiClient::new(&self.config.gemini, api_key)?);
        let parser = if self.config.research.ai_fallback {
            TieredParser::with_reformatter(client.clone())
        } else {
            TieredParser::new()
        };
        Ok(Arc::new(JobMachine::new(
            self.storage.clone(),
            client,
            Arc::new(parser),
        )))
    }

    fn orchestrator(&self) -> Result<PollOrchestrator> {
        Ok(PollOrchestrator::new(self.storage.clone(), self.machine()?))
    }
}

fn parse_job_id(raw: &str) -> Result<JobId> {
    raw.trim()
        .parse::<JobId>()
        .map_err(|e| eyre!("invalid job id '{raw}': {e}"))
}

// ---------------------------------------------------------------------------
// Job commands
// ---------------------------------------------------------------------------

async fn cmd_submit(ctx: &Context, locality: &str) -> Result<()> {
    let machine = ctx.machine()?;
    let prompt = PromptConfig::from_config(&ctx.config.research);

    let job = machine.submit(locality, &prompt).await?;

    println!();
    println!("  Research job submitted!");
    println!("  Job:         {}", job.id);
    println!("  Status:      {}", job.status);
    println!(
        "  Interaction: {}",
        job.interaction_id.as_deref().unwrap_or("-")
    );
    println!();
    Ok(())
}

async fn cmd_poll(ctx: &Context) -> Result<()> {
    let summary = ctx.orchestrator()?.poll_cycle().await?;

    println!();
    println!("  Processed: {}", summary.processed);
    println!("  Completed: {}", summary.completed);
    println!("  Failed:    {}", summary.failed);
    println!("  Cancelled: {}", summary.cancelled);
    println!("  Errors:    {}", summary.errors);
    println!();
    Ok(())
}

async fn cmd_watch(ctx: &Context, interval: Option<u64>) -> Result<()> {
    let secs = interval.unwrap_or(ctx.config.poll.interval_secs);
    if secs == 0 {
        return Err(eyre!("poll interval must be at least one second"));
    }
    let orchestrator = ctx.orchestrator()?;

    info!(interval_secs = secs, "watching running jobs (Ctrl-C to stop)");
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let cycles = orchestrator
        .watch(Duration::from_secs(secs), shutdown)
        .await;

    println!("  Stopped after {cycles} poll cycle(s).");
    Ok(())
}

async fn cmd_reprocess(ctx: &Context, job: &str) -> Result<()> {
    let id = parse_job_id(job)?;
    let job = ctx.machine()?.reprocess(&id).await?;

    println!();
    println!("  Job reprocessed!");
    println!("  Job:     {}", job.id);
    println!("  Status:  {}", job.status);
    println!(
        "  Tier:    {}",
        job.parse_tier.map_or("-", |t| t.as_str())
    );
    println!("  Created: {}", job.records_created);
    println!("  Updated: {}", job.records_updated);
    println!();
    Ok(())
}

async fn cmd_delete(ctx: &Context, job: &str) -> Result<()> {
    let id = parse_job_id(job)?;
    // Deleting is local only, so no API key is needed.
    ctx.storage.delete_job(&id).await?;
    info!(job_id = %id, "research job deleted");
    println!("  Deleted job {id}.");
    Ok(())
}

async fn cmd_jobs_list(ctx: &Context, status: Option<&str>) -> Result<()> {
    let jobs = match status {
        Some(s) => {
            let status: JobStatus = s.parse()?;
            ctx.storage.list_jobs_by_status(status).await?
        }
        None => ctx.storage.list_jobs().await?,
    };

    if jobs.is_empty() {
        println!("  No research jobs.");
        return Ok(());
    }

    let names: HashMap<String, String> = ctx
        .storage
        .list_localities()
        .await?
        .into_iter()
        .map(|l| (l.id.clone(), l.to_string()))
        .collect();

    println!();
    println!(
        "  {:<36}  {:<9}  {:>7}  {:>7}  {:<16}  LOCALITY",
        "ID", "STATUS", "CREATED", "UPDATED", "SUBMITTED"
    );
    for job in &jobs {
        println!(
            "  {:<36}  {:<9}  {:>7}  {:>7}  {:<16}  {}",
            job.id,
            job.status,
            job.records_created,
            job.records_updated,
            job.created_at.format("%Y-%m-%d %H:%M"),
            names
                .get(&job.locality_id)
                .map_or(job.locality_id.as_str(), String::as_str),
        );
    }
    println!();
    Ok(())
}

async fn cmd_jobs_show(ctx: &Context, job: &str) -> Result<()> {
    let id = parse_job_id(job)?;
    let job = ctx
        .storage
        .get_job(&id)
        .await?
        .ok_or_else(|| eyre!("job {id} not found"))?;
    let locality = ctx.storage.get_locality(&job.locality_id).await?;

    print_job(&job, locality.map(|l| l.to_string()));
    Ok(())
}

fn print_job(job: &ResearchJob, locality: Option<String>) {
    println!();
    println!("  Job:         {}", job.id);
    println!(
        "  Locality:    {}",
        locality.as_deref().unwrap_or(job.locality_id.as_str())
    );
    println!("  Status:      {}", job.status);
    println!(
        "  Interaction: {}",
        job.interaction_id.as_deref().unwrap_or("-")
    );
    println!(
        "  Tier:        {}",
        job.parse_tier.map_or("-", |t| t.as_str())
    );
    println!("  Created:     {}", job.records_created);
    println!("  Updated:     {}", job.records_updated);
    println!("  Submitted:   {}", job.created_at.to_rfc3339());
    if let Some(done) = job.completed_at {
        println!("  Finished:    {}", done.to_rfc3339());
    }
    if let Some(raw) = &job.raw_result {
        println!("  Raw output:  {} chars", raw.chars().count());
    }
    if let Some(error) = &job.error {
        println!("  Error:");
        for line in error.lines() {
            println!("    {line}");
        }
    }
    if let Some(result) = &job.result {
        let pretty = serde_json::to_string_pretty(result).unwrap_or_else(|_| result.to_string());
        println!("  Result:");
        for line in pretty.lines() {
            println!("    {line}");
        }
    }
    println!();
}

// ---------------------------------------------------------------------------
// Registry commands
// ---------------------------------------------------------------------------

async fn cmd_locality_add(ctx: &Context, name: &str, country: &str, iso2: &str) -> Result<()> {
    if name.trim().is_empty() || country.trim().is_empty() {
        return Err(eyre!("locality name and country must not be empty"));
    }
    if !iso2.is_empty() && (iso2.len() != 2 || !iso2.chars().all(|c| c.is_ascii_alphabetic())) {
        return Err(eyre!("iso2 must be a two-letter country code, got '{iso2}'"));
    }

    let locality = ctx.storage.insert_locality(name, country, iso2).await?;
    println!("  Added locality {locality} ({})", locality.id);
    Ok(())
}

async fn cmd_locality_list(ctx: &Context) -> Result<()> {
    let localities = ctx.storage.list_localities().await?;
    if localities.is_empty() {
        println!("  No localities. Add one with `leadscout locality add`.");
        return Ok(());
    }
    for l in &localities {
        println!("  {:<36}  {:<4}  {l}", l.id, l.iso2);
    }
    Ok(())
}

async fn cmd_types_add(ctx: &Context, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(eyre!("record type name must not be empty"));
    }
    ctx.storage.ensure_record_type(name).await?;
    println!("  Record type '{}' registered.", name.trim());
    Ok(())
}

async fn cmd_types_list(ctx: &Context) -> Result<()> {
    let types = ctx.storage.list_record_types().await?;
    if types.is_empty() {
        println!("  No record types.");
    }
    for name in &types {
        println!("  {name}");
    }
    Ok(())
}

async fn cmd_records_list(ctx: &Context, locality: &str) -> Result<()> {
    let locality = ctx
        .storage
        .find_locality(locality)
        .await?
        .ok_or_else(|| eyre!("locality '{locality}' not found"))?;
    let records = ctx.storage.list_records_by_locality(&locality.id).await?;

    println!();
    println!("  {} record(s) in {locality}", records.len());
    for r in &records {
        println!();
        println!("  {} [{}]", r.name, r.record_type.as_deref().unwrap_or("untyped"));
        for (label, value) in [
            ("email", &r.email),
            ("phone", &r.phone),
            ("instagram", &r.instagram),
            ("telegram", &r.telegram),
            ("website", &r.website),
        ] {
            if let Some(v) = value {
                println!("    {label:<10} {v}");
            }
        }
        if let Some(t) = r.temperature {
            println!("    {:<10} {}", "temp", t.as_str());
        }
        if !r.tags.is_empty() {
            println!("    {:<10} {}", "tags", r.tags.join(", "));
        }
        println!("    {:<10} {}", "source", r.source);
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Config commands
// ---------------------------------------------------------------------------

fn cmd_config_init() -> Result<()> {
    let path = config_file_path()?;
    if path.exists() {
        println!("  Config already exists at {}", path.display());
        return Ok(());
    }
    let path = init_config()?;
    println!("  Created config at {}", path.display());
    Ok(())
}

fn cmd_config_show(db: Option<PathBuf>) -> Result<()> {
    let mut config = load_config()?;
    if let Some(db) = db {
        config.database.path = db.display().to_string();
    }

    println!("# {}", config_file_path()?.display());
    println!("{}", toml::to_string_pretty(&config)?);
    println!(
        "# {} is {}",
        config.gemini.api_key_env,
        if validate_api_key(&config).is_ok() {
            "set"
        } else {
            "NOT set"
        }
    );
    Ok(())
}
