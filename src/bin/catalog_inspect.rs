use anyhow::Result;
use clap::{Parser, Subcommand};
use tapeline::db::BackupDb;
use tapeline::util::{format_bytes, ts_to_string};

/// Catalog inspection tool for tapeline backups
#[derive(Parser, Debug)]
#[command(name = "catalog-inspect")]
#[command(about = "Inspect tapeline catalog contents")]
struct Cli {
    /// Path to catalog database file
    #[arg(short, long, default_value = "tapeline_catalog.redb")]
    db_path: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show catalog statistics
    Stats,
    /// List all backup tasks
    ListTasks,
    /// List all backup sets
    ListSets,
    /// List cataloged files of one backup set
    ListFiles {
        /// Backup set id (numeric)
        set_id: u32,
        /// Optional path filter
        #[arg(short, long)]
        filter: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let db = BackupDb::new(&cli.db_path)?;

    match cli.command {
        Commands::Stats => show_stats(&db)?,
        Commands::ListTasks => list_tasks(&db)?,
        Commands::ListSets => list_sets(&db)?,
        Commands::ListFiles { set_id, filter } => list_files(&db, set_id, filter.as_deref())?,
    }

    Ok(())
}

fn show_stats(db: &BackupDb) -> Result<()> {
    let tasks = db.list_tasks()?;
    let sets = db.list_sets()?;
    let cartridges = db.list_cartridges()?;

    let mut file_rows: u64 = 0;
    for set in &sets {
        file_rows += db.count_files(&set.backup_files_table)?;
    }

    println!("Catalog Statistics");
    println!("==================");
    println!("Catalog path:  {}", db.path().display());
    println!("Tasks:         {}", tasks.len());
    println!("Backup sets:   {}", sets.len());
    println!("Cartridges:    {}", cartridges.len());
    println!("File rows:     {file_rows}");

    Ok(())
}

fn list_tasks(db: &BackupDb) -> Result<()> {
    println!(
        "{:<5} {:<24} {:<10} {:<10} {:>12} {:>12} {:<20}",
        "ID", "Name", "Status", "Scan", "Files", "Bytes", "Completed"
    );
    println!("{}", "=".repeat(100));

    for task in db.list_tasks()? {
        println!(
            "{:<5} {:<24} {:<10} {:<10} {:>12} {:>12} {:<20}",
            task.id,
            task.task_name,
            task.status.as_str(),
            task.scan_status.as_str(),
            task.processed_files,
            format_bytes(task.processed_bytes),
            task.completed_at.map(ts_to_string).unwrap_or_default(),
        );
    }

    Ok(())
}

fn list_sets(db: &BackupDb) -> Result<()> {
    println!(
        "{:<5} {:<40} {:<14} {:>9} {:>12} {:>12} {:<20}",
        "ID", "Set", "Tape", "Archives", "Original", "Compressed", "Finalized"
    );
    println!("{}", "=".repeat(120));

    for set in db.list_sets()? {
        println!(
            "{:<5} {:<40} {:<14} {:>9} {:>12} {:>12} {:<20}",
            set.id,
            set.set_id,
            set.tape_id,
            set.archive_count,
            format_bytes(set.original_bytes),
            format_bytes(set.compressed_bytes),
            set.finalized_at.map(ts_to_string).unwrap_or_default(),
        );
    }

    Ok(())
}

fn list_files(db: &BackupDb, set_id: u32, filter: Option<&str>) -> Result<()> {
    let set = db.get_set(set_id)?;
    println!("Files of set {} (table {})", set.set_id, set.backup_files_table);
    println!(
        "{:<60} {:>12} {:>12} {:>6} {:>3} {:<20}",
        "Path", "Size", "Stored", "Chunk", "OK", "Backed up"
    );
    println!("{}", "=".repeat(120));

    for row in db.list_files(&set.backup_files_table)? {
        if let Some(filter) = filter {
            if !row.file_path.contains(filter) {
                continue;
            }
        }
        let path = if row.file_path.len() > 60 {
            format!("{}...", &row.file_path[..57])
        } else {
            row.file_path.clone()
        };
        println!(
            "{:<60} {:>12} {:>12} {:>6} {:>3} {:<20}",
            path,
            format_bytes(row.file_size),
            format_bytes(row.compressed_size),
            row.chunk_number,
            if row.is_copy_success { "y" } else { "n" },
            ts_to_string(row.backup_time),
        );
    }

    Ok(())
}
