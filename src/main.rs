mod archive;
mod cancel;
mod catalog;
mod config;
mod counter;
mod db;
mod errors;
mod models;
mod notify;
mod pipeline;
mod scanner;
mod stage;
mod tape;
mod util;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::info;

use crate::models::{BackupTask, TapeCartridge, TaskType};
use crate::util::{format_bytes, ts_to_string};

/// Tapeline - streaming backup engine for LTO tape volumes
#[derive(Parser, Debug)]
#[command(name = "tapeline")]
#[command(about = "Back up filesystem trees into size-bounded archives on LTFS tape")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "tapeline.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute a backup task by id
    Run {
        /// Task id to execute
        task_id: u32,
        /// Manual trigger: skip the scheduled-run pre-flight checks
        #[arg(long)]
        manual: bool,
        /// Additional exclude patterns for this run only
        #[arg(long = "exclude")]
        excludes: Vec<String>,
    },
    /// Create a new backup task
    CreateTask {
        /// Task name
        name: String,
        /// Source paths to back up
        #[arg(required = true)]
        sources: Vec<String>,
        /// Task type: full, incremental, differential, monthly_full
        #[arg(long = "type", default_value = "full")]
        task_type: String,
        /// Exclude patterns (globs, matched against paths and ancestors)
        #[arg(long = "exclude")]
        excludes: Vec<String>,
    },
    /// List tasks and their state
    ListTasks,
    /// Register a tape cartridge in the catalog
    RegisterTape {
        /// Cartridge id (usually the volume label)
        tape_id: String,
        /// Volume label; defaults to the tape id
        #[arg(long)]
        label: Option<String>,
        /// Capacity in bytes
        #[arg(long, default_value_t = 0)]
        capacity: u64,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Arc::new(config::Config::from_file(&cli.config)?);
    let db = db::BackupDb::new(&config.storage.db_path)
        .with_context(|| format!("cannot open catalog {}", config.storage.db_path))?;

    match cli.command {
        Commands::Run {
            task_id,
            manual,
            excludes,
        } => run_task(config, db, task_id, manual, excludes),
        Commands::CreateTask {
            name,
            sources,
            task_type,
            excludes,
        } => create_task(&config, &db, name, sources, task_type, excludes),
        Commands::ListTasks => list_tasks(&db),
        Commands::RegisterTape {
            tape_id,
            label,
            capacity,
        } => register_tape(&db, tape_id, label, capacity),
    }
}

fn run_task(
    config: Arc<config::Config>,
    db: db::BackupDb,
    task_id: u32,
    manual: bool,
    excludes: Vec<String>,
) -> Result<()> {
    let tape = Arc::new(tape::MountTapeController::from_config(&config));
    let controller = pipeline::PipelineController::new(
        config,
        db,
        tape,
        Arc::new(notify::LogNotifier),
    );

    let token = controller.cancel_token();
    ctrlc::set_handler(move || {
        info!("Interrupt received, cancelling backup run");
        token.cancel();
    })
    .context("cannot install interrupt handler")?;

    controller.execute_task(task_id, &excludes, manual)?;
    Ok(())
}

fn create_task(
    config: &config::Config,
    db: &db::BackupDb,
    name: String,
    sources: Vec<String>,
    task_type: String,
    excludes: Vec<String>,
) -> Result<()> {
    let Some(task_type) = TaskType::parse(&task_type) else {
        bail!("Unknown task type: {task_type}");
    };
    let mut task = BackupTask::new(&name, task_type, sources);
    task.exclude_patterns = excludes;
    task.retention_days = config.retention_days;

    let id = db.create_task(&mut task)?;
    println!("Created task {id}: {name} ({})", task_type.as_str());
    Ok(())
}

fn list_tasks(db: &db::BackupDb) -> Result<()> {
    let tasks = db.list_tasks()?;
    if tasks.is_empty() {
        println!("No tasks in the catalog.");
        return Ok(());
    }

    println!(
        "{:<5} {:<24} {:<12} {:<10} {:>9} {:>12} {:>12} {:<20}",
        "ID", "Name", "Type", "Status", "Progress", "Files", "Bytes", "Started"
    );
    println!("{}", "=".repeat(110));
    for task in tasks {
        println!(
            "{:<5} {:<24} {:<12} {:<10} {:>8.1}% {:>12} {:>12} {:<20}",
            task.id,
            truncate(&task.task_name, 24),
            task.task_type.as_str(),
            task.status.as_str(),
            task.progress_percent,
            task.processed_files,
            format_bytes(task.processed_bytes),
            task.started_at.map(ts_to_string).unwrap_or_default(),
        );
    }
    Ok(())
}

fn register_tape(
    db: &db::BackupDb,
    tape_id: String,
    label: Option<String>,
    capacity: u64,
) -> Result<()> {
    let cartridge = TapeCartridge {
        label: label.unwrap_or_else(|| tape_id.clone()),
        tape_id: tape_id.clone(),
        status: "active".to_string(),
        capacity_bytes: capacity,
        used_bytes: 0,
    };
    db.register_cartridge(&cartridge)?;
    println!("Registered tape {tape_id}");
    Ok(())
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() > max {
        format!("{}...", &text[..max.saturating_sub(3)])
    } else {
        text.to_string()
    }
}
