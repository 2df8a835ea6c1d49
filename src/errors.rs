use std::path::PathBuf;
use thiserror::Error;

/// Catalog database failures. Per-batch insert failures are handled by the
/// writer's retry-and-drop policy; everything else bubbles up through here.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog database error: {0}")]
    Database(#[from] redb::DatabaseError),
    #[error("catalog transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),
    #[error("catalog table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("catalog storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("catalog commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("catalog row decode failed: {0}")]
    Decode(String),
    #[error("backup task {0} not found")]
    TaskNotFound(u32),
    #[error("backup set {0} not found")]
    SetNotFound(u32),
}

/// Errors surfaced by the backup pipeline. Containable kinds (per-file,
/// per-group, per-batch) are reduced into run counters and never appear
/// here; these are the fatal and terminal conditions.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline not initialized: {0}")]
    NotInitialized(String),
    #[error("task {0:?} already has a running instance")]
    AlreadyRunning(String),
    #[error("tape drive path {0} is not reachable")]
    TapeDriveMissing(PathBuf),
    #[error("tape {0} is not registered in the catalog")]
    TapeNotRegistered(String),
    #[error("tape label check failed: {0}")]
    LabelMismatch(String),
    #[error("tape format failed: {0}")]
    FormatFailed(String),
    #[error("disk space exhausted: need {required} bytes, {available} available")]
    DiskFull { required: u64, available: u64 },
    #[error("archive {0} came out empty with no successful members")]
    EmptyArchive(PathBuf),
    #[error("archive build failed: {0}")]
    ArchiveBuild(String),
    #[error("staging to tape failed: {0}")]
    Stage(String),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cancelled")]
    Cancelled,
}
