use rkyv::{Archive, Deserialize, Serialize};

/// Backup task kind. Incremental and differential are accepted but run the
/// full-backup path; only pre-flight formatting is type-sensitive.
#[derive(Archive, Deserialize, Serialize, Debug, PartialEq, Eq, Clone, Copy)]
#[archive(check_bytes)]
pub enum TaskType {
    Full,
    Incremental,
    Differential,
    MonthlyFull,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Full => "full",
            TaskType::Incremental => "incremental",
            TaskType::Differential => "differential",
            TaskType::MonthlyFull => "monthly_full",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "full" => Some(TaskType::Full),
            "incremental" => Some(TaskType::Incremental),
            "differential" => Some(TaskType::Differential),
            "monthly_full" => Some(TaskType::MonthlyFull),
            _ => None,
        }
    }
}

#[derive(Archive, Deserialize, Serialize, Debug, PartialEq, Eq, Clone, Copy)]
#[archive(check_bytes)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Paused => "paused",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

#[derive(Archive, Deserialize, Serialize, Debug, PartialEq, Eq, Clone, Copy)]
#[archive(check_bytes)]
pub enum ScanStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Pending => "pending",
            ScanStatus::Running => "running",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
        }
    }
}

/// The unit of work and the progress surface read by UIs and schedulers.
///
/// While a run is active the row is written only by the pipeline controller
/// and by the scan-progress helpers, which touch disjoint fields; all
/// updates go through a single read-modify-write transaction.
#[derive(Archive, Deserialize, Serialize, Debug, PartialEq, Clone)]
#[archive(check_bytes)]
pub struct BackupTask {
    pub id: u32,
    pub task_name: String,
    pub task_type: TaskType,
    pub description: String,
    pub status: TaskStatus,
    pub template_id: Option<u32>,

    pub source_paths: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub compression_enabled: bool,
    pub encryption_enabled: bool,
    pub retention_days: u32,

    pub scan_status: ScanStatus,
    pub scan_completed_at: Option<i64>,
    pub total_files: u64,
    pub total_bytes: u64,
    pub processed_files: u64,
    pub processed_bytes: u64,
    pub compressed_bytes: u64,
    pub progress_percent: f32,
    pub operation_stage: String,

    pub tape_id: String,
    pub backup_set_id: String,
    pub backup_files_table: String,

    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub error_message: String,
    pub result_summary_json: String,

    pub created_at: i64,
    pub updated_at: i64,
}

impl BackupTask {
    /// A fresh pending task; id and timestamps are assigned on insert.
    pub fn new(task_name: &str, task_type: TaskType, source_paths: Vec<String>) -> Self {
        Self {
            id: 0,
            task_name: task_name.to_string(),
            task_type,
            description: String::new(),
            status: TaskStatus::Pending,
            template_id: None,
            source_paths,
            exclude_patterns: Vec::new(),
            compression_enabled: true,
            encryption_enabled: false,
            retention_days: 180,
            scan_status: ScanStatus::Pending,
            scan_completed_at: None,
            total_files: 0,
            total_bytes: 0,
            processed_files: 0,
            processed_bytes: 0,
            compressed_bytes: 0,
            progress_percent: 0.0,
            operation_stage: String::new(),
            tape_id: String::new(),
            backup_set_id: String::new(),
            backup_files_table: String::new(),
            started_at: None,
            completed_at: None,
            error_message: String::new(),
            result_summary_json: String::new(),
            created_at: 0,
            updated_at: 0,
        }
    }
}

/// One tape's worth of one task: the collection of archives produced by a
/// single run, finalized exactly once when the last archive is staged.
#[derive(Archive, Deserialize, Serialize, Debug, PartialEq, Clone)]
#[archive(check_bytes)]
pub struct BackupSet {
    pub id: u32,
    pub set_id: String,
    pub task_id: u32,
    pub tape_id: String,
    pub archive_count: u32,
    pub original_bytes: u64,
    pub compressed_bytes: u64,
    pub finalized_at: Option<i64>,
    pub backup_files_table: String,
    pub created_at: i64,
}

/// Per-file provenance row, stored in the set's sharded file table keyed by
/// the file path. `chunk_number` is the zero-based archive index within the
/// set; a restore locates the file by set, chunk, then path.
#[derive(Archive, Deserialize, Serialize, Debug, PartialEq, Clone)]
#[archive(check_bytes)]
pub struct BackupFile {
    pub backup_set_id: u32,
    pub file_path: String,
    pub file_name: String,
    pub directory_path: String,
    pub file_type: String,
    pub file_size: u64,
    pub compressed_size: u64,
    pub file_permissions: String,
    pub created_time: i64,
    pub modified_time: i64,
    pub accessed_time: i64,
    pub chunk_number: u32,
    pub is_copy_success: bool,
    pub backup_time: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Registered tape cartridge. Read-only from the pipeline's point of view;
/// registration happens through the CLI or an external catalog manager.
#[derive(Archive, Deserialize, Serialize, Debug, PartialEq, Clone)]
#[archive(check_bytes)]
pub struct TapeCartridge {
    pub tape_id: String,
    pub label: String,
    pub status: String,
    pub capacity_bytes: u64,
    pub used_bytes: u64,
}

/// Per-run counters for contained errors, serialized into the task row's
/// `result_summary_json` at finalize. None of these is fatal on its own.
#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RunSummary {
    pub file_errors: u64,
    pub dir_errors: u64,
    pub long_path_skips: u64,
    pub symlinks_skipped: u64,
    pub failed_groups: u64,
    pub dropped_catalog_rows: u64,
    pub estimated_archive_count: u64,
}
