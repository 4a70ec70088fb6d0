use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use boardsync::broadcast::ChangeNotifier;
use boardsync::db::DbHandle;
use boardsync::indexer::FileIndexBuilder;
use boardsync::models::{CardStatus, JobType, Provider};
use boardsync::scheduler::{IndexReason, IndexScheduler, SchedulerConfig};
use boardsync::sync;
use boardsync::watcher::MtimeWatcher;
use boardsync::workspace::DiskWorkspace;

#[derive(Parser)]
#[command(name = "boardsync")]
#[command(version, about = "Background automation for kanban project boards")]
struct Cli {
    /// Path to the SQLite database. Defaults to the platform data directory.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the index scheduler and the periodic remote sync loop
    Serve {
        /// Seconds between remote polls
        #[arg(long, default_value = "120")]
        poll_interval: u64,
    },
    /// Manage tracked projects
    Project {
        #[command(subcommand)]
        command: ProjectCommands,
    },
    /// Poll the remote once for one project
    Sync {
        #[arg(short, long)]
        project: i64,
    },
    /// Push a card's current status to the remote
    Push {
        #[arg(long)]
        card: i64,
        #[arg(long)]
        status: String,
    },
    /// Run one index build for one project
    Index {
        #[arg(short, long)]
        project: i64,
    },
}

#[derive(Subcommand)]
enum ProjectCommands {
    /// Register a repository
    Add {
        name: String,
        #[arg(long)]
        repo_root: PathBuf,
        /// Remote repository key, e.g. github:owner/repo
        #[arg(long)]
        remote: Option<String>,
        /// Enable automatic index refreshes from the start
        #[arg(long)]
        auto_index: bool,
    },
    List,
}

fn default_db_path() -> Result<PathBuf> {
    let dir = dirs::data_dir()
        .context("Could not determine the platform data directory")?
        .join("boardsync");
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create data directory {}", dir.display()))?;
    Ok(dir.join("boardsync.db"))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("boardsync=info")),
        )
        .init();

    let cli = Cli::parse();
    let db_path = match cli.db {
        Some(path) => path,
        None => default_db_path()?,
    };
    let db = DbHandle::open(&db_path)?;
    let notifier = ChangeNotifier::new();

    match cli.command {
        Commands::Serve { poll_interval } => serve(db, notifier, poll_interval).await,
        Commands::Project { command } => project_command(db, command).await,
        Commands::Sync { project } => run_sync(db, notifier, project).await,
        Commands::Push { card, status } => run_push(db, notifier, card, status).await,
        Commands::Index { project } => run_index(db, notifier, project).await,
    }
}

fn build_scheduler(db: DbHandle, notifier: ChangeNotifier) -> IndexScheduler {
    IndexScheduler::new(
        db,
        Arc::new(FileIndexBuilder),
        Arc::new(DiskWorkspace),
        Arc::new(MtimeWatcher::default()),
        notifier,
        SchedulerConfig::default(),
    )
}

async fn serve(db: DbHandle, notifier: ChangeNotifier, poll_interval: u64) -> Result<()> {
    let scheduler = build_scheduler(db.clone(), notifier.clone());
    scheduler.start().await?;
    tracing::info!("scheduler started, polling remotes every {}s", poll_interval);

    let mut ticker = tokio::time::interval(Duration::from_secs(poll_interval));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = poll_all_remotes(&db, &notifier).await {
                    tracing::warn!("remote poll pass failed: {:#}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                scheduler.shutdown();
                return Ok(());
            }
        }
    }
}

async fn poll_all_remotes(db: &DbHandle, notifier: &ChangeNotifier) -> Result<()> {
    let projects = db.call(|db| db.list_projects()).await?;
    for project in projects.into_iter().filter(|p| p.remote_repo.is_some()) {
        let project_id = project.id;
        let job = db
            .call(move |db| db.create_job(project_id, JobType::SyncPoll, None, None))
            .await?;
        if let Err(e) = sync::process_job(db.clone(), notifier.clone(), job.id).await {
            tracing::warn!(project_id, "sync job {} failed to run: {:#}", job.id, e);
        }
    }
    Ok(())
}

async fn project_command(db: DbHandle, command: ProjectCommands) -> Result<()> {
    match command {
        ProjectCommands::Add {
            name,
            repo_root,
            remote,
            auto_index,
        } => {
            let provider = match remote.as_deref() {
                Some(r) if r.starts_with("github:") => Some(Provider::Github),
                Some(r) if r.starts_with("gitlab:") => Some(Provider::Gitlab),
                Some(r) => anyhow::bail!("Unrecognized remote repository key '{}'", r),
                None => None,
            };
            let root = repo_root.display().to_string();
            let project = db
                .call(move |db| {
                    let project = db.insert_project(&name, &root, remote.as_deref(), provider)?;
                    if auto_index {
                        db.set_auto_index(project.id, true)?;
                    }
                    Ok(project)
                })
                .await?;
            println!("Added project {} ({})", project.id, project.name);
        }
        ProjectCommands::List => {
            let projects = db.call(|db| db.list_projects()).await?;
            for p in projects {
                println!(
                    "{:>4}  {:<20} {:<30} auto_index={}  last_synced={}",
                    p.id,
                    p.name,
                    p.remote_repo.as_deref().unwrap_or("-"),
                    p.auto_index,
                    p.last_synced_at.as_deref().unwrap_or("never"),
                );
            }
        }
    }
    Ok(())
}

async fn run_sync(db: DbHandle, notifier: ChangeNotifier, project_id: i64) -> Result<()> {
    let job = db
        .call(move |db| db.create_job(project_id, JobType::SyncPoll, None, None))
        .await?;
    sync::process_job(db.clone(), notifier, job.id).await?;
    print_job(&db, job.id).await
}

async fn run_push(
    db: DbHandle,
    notifier: ChangeNotifier,
    card_id: i64,
    status: String,
) -> Result<()> {
    let status: CardStatus = status
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;
    let card = db
        .call(move |db| db.get_card(card_id))
        .await?
        .with_context(|| format!("Card {} not found", card_id))?;
    let project_id = card.project_id;
    let payload = serde_json::json!({ "status": status });
    let job = db
        .call(move |db| db.create_job(project_id, JobType::SyncPush, Some(card_id), Some(&payload)))
        .await?;
    sync::process_job(db.clone(), notifier, job.id).await?;
    print_job(&db, job.id).await
}

async fn run_index(db: DbHandle, notifier: ChangeNotifier, project_id: i64) -> Result<()> {
    let project = db
        .call(move |db| db.get_project(project_id))
        .await?
        .with_context(|| format!("Project {} not found", project_id))?;

    let scheduler = build_scheduler(db.clone(), notifier);
    scheduler.register_project(project_id, Path::new(&project.repo_root));
    scheduler.request_index_now(project_id, IndexReason::Manual);

    // Wait for the requested run to reach a terminal job state.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(300);
    let job = loop {
        let jobs = db.call(move |db| db.list_jobs(project_id)).await?;
        if let Some(job) = jobs
            .into_iter()
            .filter(|j| j.job_type == JobType::IndexRefresh)
            .last()
        {
            if job.state.is_terminal() {
                break job;
            }
        }
        if tokio::time::Instant::now() > deadline {
            scheduler.shutdown();
            anyhow::bail!("Index run did not finish within 300s");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    };
    scheduler.shutdown();
    print_job(&db, job.id).await
}

async fn print_job(db: &DbHandle, job_id: i64) -> Result<()> {
    let job = db
        .call(move |db| db.get_job(job_id))
        .await?
        .with_context(|| format!("Job {} not found", job_id))?;
    println!("job {} ({}) -> {}", job.id, job.job_type.as_str(), job.state);
    if let Some(result) = &job.result {
        println!("  result: {}", result);
    }
    if let Some(error) = &job.error {
        println!("  error: {}", error);
    }
    if job.state == boardsync::models::JobState::Succeeded {
        Ok(())
    } else {
        anyhow::bail!("job {} ended in state {}", job.id, job.state)
    }
}
