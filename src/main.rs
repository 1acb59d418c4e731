use clap::Parser;
use colored::*;
use eyre::{Context, Result, eyre};
use log::info;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

mod cli;
mod config;

use cli::Cli;
use cli::commands::{Commands, RepoCommands, WorkspaceCommands};
use config::Config;
use hubcapture::backfill::InitiationOutcome;
use hubcapture::daemon::Daemon;
use hubcapture::dispatch::{JobSubmitter, OutboxDispatcher, RepositoryProvider, TaskDispatcher};
use hubcapture::engine::{CaptureEngine, SubmitOutcome, SubmitRequest};
use hubcapture::placement::PlacementSync;
use hubcapture::retry::RetryService;
use hubcapture::scheduler::HealthStatus;
use hubcapture::store::{CaptureStore, JobFilter, JobStatus, RepositoryRecord};

const DAY_SECS: u64 = 24 * 60 * 60;

fn setup_logging() -> Result<()> {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hubcapture")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("hubcapture.log");

    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    // Config narrows the level later unless RUST_LOG is set
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("trace"))
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

fn apply_log_level(config: &Config) -> Result<()> {
    if std::env::var_os("RUST_LOG").is_some() {
        return Ok(());
    }
    let level = config.log_level.as_deref().unwrap_or("info");
    let filter: log::LevelFilter = level
        .parse()
        .map_err(|_| eyre!("Invalid log_level '{}'", level))?;
    log::set_max_level(filter);
    Ok(())
}

/// Long-lived services shared by every command.
struct Services {
    store: Arc<CaptureStore>,
    engine: Arc<CaptureEngine>,
    retry: Arc<RetryService>,
}

fn build_services(config: &Config) -> Result<Services> {
    let db_path = config.database_path();
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent).context("Failed to create data directory")?;
    }
    let store = Arc::new(
        CaptureStore::open(&db_path).context(format!("Failed to open store at {}", db_path.display()))?,
    );

    let dispatcher: Arc<dyn TaskDispatcher> = Arc::new(OutboxDispatcher::new(store.clone()));
    let engine = Arc::new(CaptureEngine::new(store.clone(), dispatcher, config.engine_config()?));

    let repositories: Arc<dyn RepositoryProvider> = store.clone();
    let submitter: Arc<dyn JobSubmitter> = engine.clone();
    let retry = Arc::new(RetryService::new(
        config.retry_config(),
        store.clone(),
        repositories,
        submitter,
    ));

    Ok(Services { store, engine, retry })
}

/// Accept a repository id or `owner/name`.
fn resolve_repository(store: &CaptureStore, reference: &str) -> Result<Option<RepositoryRecord>> {
    if let Some(repo) = store.get_repository(reference)? {
        return Ok(Some(repo));
    }
    match reference.split_once('/') {
        Some((owner, name)) => Ok(store.find_repository(owner, name)?),
        None => Ok(None),
    }
}

fn require_repository(store: &CaptureStore, reference: &str) -> Result<RepositoryRecord> {
    resolve_repository(store, reference)?.ok_or_else(|| eyre!("Unknown repository: {}", reference))
}

fn status_colored(status: JobStatus) -> ColoredString {
    match status {
        JobStatus::Pending => status.as_str().normal(),
        JobStatus::Processing => status.as_str().cyan(),
        JobStatus::Completed => status.as_str().green(),
        JobStatus::Failed => status.as_str().yellow(),
        JobStatus::DeadLetter => status.as_str().red(),
    }
}

fn format_ms(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ms.to_string())
}

async fn run_application(cli: &Cli, config: &Config) -> Result<()> {
    info!("Starting application");

    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    let services = build_services(config)?;

    match &cli.command {
        Commands::Daemon => handle_daemon(&services, config).await,
        Commands::Submit {
            repo,
            job_type,
            days,
            max_items,
            priority,
        } => {
            let mut request = SubmitRequest::new(*job_type, repository_id(&services.store, repo)?);
            if let Some(days) = days {
                request = request.with_time_range(*days);
            }
            if let Some(max_items) = max_items {
                request = request.with_max_items(*max_items);
            }
            if let Some(priority) = priority {
                request = request.with_priority(*priority);
            }
            handle_submit(&services, request).await
        }
        Commands::Status { job_id } => handle_status(&services, job_id),
        Commands::History { repo, status, limit } => handle_history(&services, repo.as_deref(), *status, *limit),
        Commands::RetryStats { days } => handle_retry_stats(&services, *days),
        Commands::RetryScan => handle_retry_scan(&services).await,
        Commands::SyncPriorities => handle_sync_priorities(&services),
        Commands::Backfill { repo, captured } => handle_backfill(&services, repo, *captured).await,
        Commands::Health => handle_health(&services).await,
        Commands::Repo { command } => handle_repo_command(&services, command),
        Commands::Workspace { command } => handle_workspace_command(&services, command),
    }
}

fn repository_id(store: &CaptureStore, reference: &str) -> Result<String> {
    match resolve_repository(store, reference)? {
        Some(repo) => Ok(repo.id),
        None => {
            println!(
                "{} unknown repository {}, routing without metadata",
                "Warning:".yellow(),
                reference
            );
            Ok(reference.to_string())
        }
    }
}

async fn handle_daemon(services: &Services, config: &Config) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let daemon = Daemon::new(services.engine.clone(), services.retry.clone(), config.tick_config());
    let handle = tokio::spawn(daemon.run(shutdown_rx));

    println!("{} (Ctrl-C to stop)", "Daemon running".cyan());
    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    info!("Shutdown requested");
    let _ = shutdown_tx.send(true);

    let state = handle.await.context("Daemon task failed")?;
    println!(
        "{} {} ticks, {} dispatched, {} retried, {} permanent, {} exhausted",
        "Daemon stopped:".green(),
        state.tick_count,
        state.total_dispatched,
        state.total_retried,
        state.total_permanent,
        state.total_exhausted
    );
    Ok(())
}

async fn handle_submit(services: &Services, request: SubmitRequest) -> Result<()> {
    info!("Submitting {} for {}", request.job_type, request.repository_id);
    match services.engine.submit(request).await? {
        SubmitOutcome::Dispatched {
            job_id,
            processor,
            external_id,
        } => println!(
            "{} {} on {} ({})",
            "Dispatched:".green(),
            job_id,
            processor,
            external_id
        ),
        SubmitOutcome::Queued {
            job_id,
            processor,
            position,
            estimated_wait,
        } => println!(
            "{} {} on {} at position {} (~{}s)",
            "Queued:".yellow(),
            job_id,
            processor,
            position,
            estimated_wait.as_secs()
        ),
        SubmitOutcome::Rejected { job_id, processor } => {
            println!("{} {} ({} queue full)", "Rejected:".red(), job_id, processor)
        }
        SubmitOutcome::DispatchFailed { job_id, error } => {
            println!("{} {}: {}", "Dispatch failed:".red(), job_id, error)
        }
    }
    Ok(())
}

fn handle_status(services: &Services, job_id: &str) -> Result<()> {
    let job = services.store.require_job(job_id)?;
    println!("{} {}", "Job:".green(), job.id);
    println!("  type:       {}", job.job_type);
    println!(
        "  repository: {}",
        job.repository_name.as_deref().unwrap_or(&job.repository_id)
    );
    println!("  status:     {}", status_colored(job.status));
    if let Some(processor) = job.processor {
        println!("  processor:  {}", processor);
    }
    println!("  priority:   {}", job.priority);
    println!("  retries:    {}", job.retry_count);
    println!("  created:    {}", format_ms(job.created_at));
    if let Some(started) = job.started_at {
        println!("  started:    {}", format_ms(started));
    }
    if let Some(completed) = job.completed_at {
        println!("  completed:  {}", format_ms(completed));
    }
    if let Some(routing) = &job.metadata.routing {
        println!("  routing:    {} (confidence {:.2})", routing.reason, routing.confidence);
    }
    if let Some(progress) = services.store.get_progress(&job.id)? {
        println!(
            "  progress:   {}/{} processed, {} failed",
            progress.processed, progress.total, progress.failed
        );
    }
    if let Some(error) = &job.last_error {
        println!("  {} {}", "error:".red(), error);
    }
    Ok(())
}

fn handle_history(services: &Services, repo: Option<&str>, status: Option<JobStatus>, limit: usize) -> Result<()> {
    let mut filter = JobFilter::default().with_limit(limit);
    if let Some(reference) = repo {
        filter = filter.with_repository(repository_id(&services.store, reference)?);
    }
    if let Some(status) = status {
        filter = filter.with_status(status);
    }

    let jobs = services.store.list_jobs(&filter)?;
    if jobs.is_empty() {
        println!("{}", "No jobs found".yellow());
        return Ok(());
    }

    for job in jobs {
        println!(
            "{}  {:<16} {:<12} {:<24} {}",
            format_ms(job.created_at),
            job.job_type.as_str(),
            status_colored(job.status),
            job.repository_name.as_deref().unwrap_or(&job.repository_id),
            job.id
        );
        if matches!(job.status, JobStatus::Failed | JobStatus::DeadLetter)
            && let Some(error) = &job.last_error
        {
            println!("    {} {}", "last error:".red(), error);
        }
    }
    Ok(())
}

fn handle_retry_stats(services: &Services, days: Option<u64>) -> Result<()> {
    let stats = match days {
        Some(days) => services.retry.stats_over(Duration::from_secs(days * DAY_SECS))?,
        None => services.retry.stats()?,
    };
    println!(
        "{} last {} day(s)",
        "Retry statistics:".green(),
        stats.window.as_secs() / DAY_SECS
    );
    println!("  total retries:      {}", stats.total_retries);
    println!("  successful retries: {}", stats.successful_retries);
    println!("  failed retries:     {}", stats.failed_retries);
    println!("  average retries:    {:.2}", stats.average_retry_count);
    println!("  permanent failures: {}", stats.permanent_failures);
    Ok(())
}

async fn handle_retry_scan(services: &Services) -> Result<()> {
    let report = services.retry.scan().await;
    println!("{} {} failed job(s) scanned", "Retry scan:".green(), report.scanned);
    for (original, replacement) in &report.retried {
        println!("  {} {} -> {}", "retried".cyan(), original, replacement);
    }
    for job_id in &report.permanent {
        println!("  {} {}", "dead letter".red(), job_id);
    }
    for job_id in &report.exhausted {
        println!("  {} {}", "exhausted".yellow(), job_id);
    }
    if report.not_due > 0 {
        println!("  {} not yet due", report.not_due);
    }
    for (job_id, error) in &report.errors {
        println!("  {} {}: {}", "error".red(), job_id, error);
    }
    Ok(())
}

fn handle_sync_priorities(services: &Services) -> Result<()> {
    let report = PlacementSync::new(services.store.clone()).full_sync()?;
    println!(
        "{} {} workspace, {} tracked-only, {} write(s)",
        "Placement synced:".green(),
        report.workspace_repos,
        report.tracked_only,
        report.writes
    );
    for id in &report.promoted {
        println!("  {} {}", "promoted".cyan(), id);
    }
    for id in &report.demoted {
        println!("  {} {}", "demoted".yellow(), id);
    }
    Ok(())
}

async fn handle_backfill(services: &Services, reference: &str, captured: u64) -> Result<()> {
    let repo = require_repository(&services.store, reference)?;
    let start = services.engine.initiate_backfill(&repo.id, captured).await?;
    match start.outcome {
        InitiationOutcome::Initiated(state) => {
            println!(
                "{} {} for {}: {}/{} items, chunks of {}",
                "Backfill started:".green(),
                state.id,
                repo.full_name(),
                state.processed_items,
                state.total_items,
                state.chunk_size
            );
            if let Some(chunk) = start.first_chunk {
                println!("  first chunk: {}", chunk.job_id());
            }
        }
        InitiationOutcome::AlreadyActive(state) => println!(
            "{} {} ({:.0}% done)",
            "Backfill already active:".yellow(),
            state.id,
            state.progress() * 100.0
        ),
        InitiationOutcome::NotEligible(reason) => {
            println!("{} {}", "Not eligible:".yellow(), reason)
        }
    }
    Ok(())
}

async fn handle_health(services: &Services) -> Result<()> {
    for report in services.engine.health().await {
        let status = match report.status {
            HealthStatus::Healthy => report.status.to_string().green(),
            HealthStatus::Degraded => report.status.to_string().yellow(),
            HealthStatus::Critical => report.status.to_string().red(),
        };
        let metrics = &report.metrics;
        println!(
            "{:<12} {}  running {} (peak {}), queue {}/{}, throttle {:.1}%",
            metrics.processor.as_str(),
            status,
            metrics.current_concurrent,
            metrics.peak_concurrent,
            metrics.queue_length,
            metrics.queue_capacity,
            metrics.throttle_rate() * 100.0
        );
    }
    if let Some(remaining) = services.engine.upstream_backoff_remaining().await {
        println!("{} {}s remaining", "Upstream backoff:".yellow(), remaining.as_secs());
    }
    Ok(())
}

fn handle_repo_command(services: &Services, command: &RepoCommands) -> Result<()> {
    match command {
        RepoCommands::Add {
            full_name,
            items,
            stars,
            id,
        } => {
            let (owner, name) = full_name
                .split_once('/')
                .ok_or_else(|| eyre!("Expected owner/name, got {}", full_name))?;
            let id = id.clone().unwrap_or_else(|| full_name.clone());

            let mut repo = services
                .store
                .get_repository(&id)?
                .unwrap_or_else(|| RepositoryRecord::new(id.clone(), owner, name, *items));
            repo.item_count = *items;
            repo.stars = *stars;
            services.store.upsert_repository(&repo)?;
            info!("Repository {} saved as {}", full_name, id);
            println!("{} {} ({} items)", "Repository saved:".green(), full_name, items);
        }
    }
    Ok(())
}

fn handle_workspace_command(services: &Services, command: &WorkspaceCommands) -> Result<()> {
    let placement = PlacementSync::new(services.store.clone());
    match command {
        WorkspaceCommands::Add { workspace, repo } => {
            let repo = require_repository(&services.store, repo)?;
            services.store.add_workspace_repository(workspace, &repo.id)?;
            placement.mark_as_workspace_repo(&repo.id)?;
            println!("{} {} to {}", "Added:".green(), repo.full_name(), workspace);
        }
        WorkspaceCommands::Remove { workspace, repo } => {
            let repo = require_repository(&services.store, repo)?;
            if !services.store.remove_workspace_repository(workspace, &repo.id)? {
                println!("{} {} is not in {}", "Warning:".yellow(), repo.full_name(), workspace);
                return Ok(());
            }
            placement.mark_as_tracked_only(&repo.id)?;
            println!("{} {} from {}", "Removed:".green(), repo.full_name(), workspace);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Setup logging first
    setup_logging().context("Failed to setup logging")?;

    let cli = Cli::parse();

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    apply_log_level(&config)?;

    info!("Starting with config from: {:?}", cli.config);

    run_application(&cli, &config).await.context("Application failed")?;

    Ok(())
}
