use chrono::Datelike;
use glob::Pattern;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::archive::{partition_files, ArchiveBuilder, CompressProgress};
use crate::cancel::CancelToken;
use crate::catalog::CatalogWriter;
use crate::config::Config;
use crate::counter::ScanCounter;
use crate::db::BackupDb;
use crate::errors::PipelineError;
use crate::models::{BackupSet, BackupTask, RunSummary, ScanStatus, TaskStatus, TaskType};
use crate::notify::{EventKind, Notifier, NotifyEvent};
use crate::scanner::{compile_patterns, FileInfo, PathEnumerator, ScanStats, WalkStrategy};
use crate::stage::TapeStager;
use crate::tape::{extract_label_year_month, TapeController};
use crate::util::{format_bytes, now_ts, timestamp_fragment};

/// How long finalize waits for the scan counter before abandoning it.
const COUNTER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Clone, Copy)]
struct RunAggregates {
    archives: u32,
    original_bytes: u64,
    compressed_bytes: u64,
}

/// Drives one backup task end to end: pre-flight, backup set creation, the
/// streaming enumerate → group+compress → stage loop, cataloging, and
/// terminal-state bookkeeping.
///
/// One controller instance drives one run; its cancellation token is shared
/// with every subordinate worker and latches once cancelled.
pub struct PipelineController {
    config: Arc<Config>,
    db: BackupDb,
    tape: Arc<dyn TapeController>,
    notifier: Arc<dyn Notifier>,
    cancel: CancelToken,
    progress: Arc<CompressProgress>,
}

impl PipelineController {
    pub fn new(
        config: Arc<Config>,
        db: BackupDb,
        tape: Arc<dyn TapeController>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            db,
            tape,
            notifier,
            cancel: CancelToken::new(),
            progress: Arc::new(CompressProgress::default()),
        }
    }

    /// Token to hook into an external cancellation source (signal handler,
    /// task manager).
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Live build progress of the currently compressing group.
    pub fn compress_progress(&self) -> Arc<CompressProgress> {
        Arc::clone(&self.progress)
    }

    /// Execute the task with the given id. `extra_excludes` come from the
    /// triggering schedule; `manual_run` skips the scheduled-run pre-flight
    /// checks (already-running, label month, re-format).
    pub fn execute_task(
        &self,
        task_id: u32,
        extra_excludes: &[String],
        manual_run: bool,
    ) -> Result<(), PipelineError> {
        let task = self.db.get_task(task_id)?;
        info!(
            "Executing backup task {} ({:?}, type {}), manual={}",
            task.id,
            task.task_name,
            task.task_type.as_str(),
            manual_run
        );

        self.ensure_directories()?;

        if manual_run {
            info!("Manual run: skipping already-running, label and format pre-flight checks");
        } else {
            if self.db.any_running_sibling(&task)? {
                return Err(PipelineError::AlreadyRunning(task.task_name));
            }
            if let Err(e) = self.check_label_month() {
                self.fail_task(&task, &e);
                return Err(e);
            }
            if task.task_type == TaskType::Full {
                info!("Scheduled full run: re-formatting tape, preserving label");
                let db = self.db.clone();
                let format_result = self.tape.format_preserve_label(&mut |pct| {
                    let _ = db.set_stage_description(
                        task_id,
                        "formatting",
                        &format!("Formatting tape: {pct}%"),
                    );
                });
                if let Err(e) = format_result {
                    let e = match e {
                        PipelineError::FormatFailed(_) => e,
                        other => PipelineError::FormatFailed(other.to_string()),
                    };
                    self.fail_task(&task, &e);
                    return Err(e);
                }
            }
        }

        let task = self.db.with_task_mut(task_id, |t| {
            t.status = TaskStatus::Running;
            t.started_at = Some(now_ts());
            t.completed_at = None;
            t.processed_files = 0;
            t.processed_bytes = 0;
            t.compressed_bytes = 0;
            t.progress_percent = 0.0;
            t.error_message.clear();
            t.result_summary_json.clear();
            t.scan_status = ScanStatus::Pending;
            t.operation_stage = "starting".to_string();
            t.description = format!("Backup run of {}", t.task_name);
        })?;
        self.notifier.notify(NotifyEvent::new(
            &task.task_name,
            EventKind::Started,
            format!("Backup task {} started", task.task_name),
        ));

        let cartridge = match self
            .tape
            .current_cartridge()
            .or_else(|| self.tape.get_available_cartridge())
        {
            Some(cartridge) => cartridge,
            None => {
                let e = PipelineError::TapeDriveMissing(self.config.tape_drive());
                self.fail_task(&task, &e);
                return Err(e);
            }
        };
        match self.db.get_cartridge(&cartridge.tape_id) {
            Ok(Some(_)) => {}
            Ok(None) => {
                self.notifier.notify(NotifyEvent::new(
                    &task.task_name,
                    EventKind::TapeUnknown,
                    format!(
                        "Tape {} (label {:?}) is not registered in the catalog",
                        cartridge.tape_id, cartridge.label
                    ),
                ));
                let e = PipelineError::TapeNotRegistered(cartridge.tape_id.clone());
                self.fail_task(&task, &e);
                return Err(e);
            }
            Err(e) => {
                let e = PipelineError::from(e);
                self.fail_task(&task, &e);
                return Err(e);
            }
        }

        let set_id = make_set_id(&task.task_name);
        let table_name = match self.db.create_file_table(&set_id) {
            Ok(name) => name,
            Err(e) => {
                let e = PipelineError::from(e);
                self.fail_task(&task, &e);
                return Err(e);
            }
        };
        let mut set = BackupSet {
            id: 0,
            set_id: set_id.clone(),
            task_id,
            tape_id: cartridge.tape_id.clone(),
            archive_count: 0,
            original_bytes: 0,
            compressed_bytes: 0,
            finalized_at: None,
            backup_files_table: table_name.clone(),
            created_at: 0,
        };
        let set_db_id = match self.db.create_set(&mut set) {
            Ok(id) => id,
            Err(e) => {
                let e = PipelineError::from(e);
                self.fail_task(&task, &e);
                return Err(e);
            }
        };
        info!("Created backup set {set_id} (file table {table_name}) on tape {}", cartridge.tape_id);

        let task = self.db.with_task_mut(task_id, |t| {
            t.tape_id = cartridge.tape_id.clone();
            t.backup_set_id = set_id.clone();
            t.backup_files_table = table_name.clone();
            t.operation_stage = "scanning".to_string();
        })?;

        let mut raw_patterns = task.exclude_patterns.clone();
        raw_patterns.extend(extra_excludes.iter().cloned());
        let patterns = compile_patterns(&raw_patterns);
        let sources: Vec<PathBuf> = task.source_paths.iter().map(PathBuf::from).collect();

        let counter = ScanCounter::new(
            self.db.clone(),
            task_id,
            sources.clone(),
            patterns.clone(),
            self.config.scan.update_interval,
            self.config.scan.log_interval_seconds,
        )
        .start(self.cancel.child());

        let outcome = self.run_pipeline(&task, &set_id, set_db_id, table_name, sources, patterns);

        counter.stop(COUNTER_STOP_TIMEOUT);

        match outcome {
            Ok((summary, aggregates)) => {
                self.finalize_success(&task, set_db_id, &summary, aggregates)?;
                Ok(())
            }
            Err(PipelineError::Cancelled) => {
                self.finalize_cancelled(&task);
                Err(PipelineError::Cancelled)
            }
            Err(e) => {
                self.fail_task(&task, &e);
                Err(e)
            }
        }
    }

    /// The streaming main loop: pull file records off the enumerator's
    /// bounded channel, accumulate until a threshold fires, then partition
    /// and serially produce → stage → catalog each group.
    fn run_pipeline(
        &self,
        task: &BackupTask,
        set_id: &str,
        set_db_id: u32,
        table_name: String,
        sources: Vec<PathBuf>,
        patterns: Vec<Pattern>,
    ) -> Result<(RunSummary, RunAggregates), PipelineError> {
        let scan = &self.config.scan;
        let strategy = if scan.use_multithread {
            WalkStrategy::Concurrent {
                threads: scan.threads,
            }
        } else {
            WalkStrategy::Sequential
        };
        let enumerator = PathEnumerator::new(
            sources.clone(),
            patterns,
            strategy,
            self.cancel.child(),
        );
        let (rx, walker) = enumerator.spawn(scan.batch_size * 2);

        let builder = ArchiveBuilder::new(&self.config, Arc::clone(&self.progress));
        let stager = TapeStager::new(&self.config);
        let mut catalog = CatalogWriter::new(self.db.clone(), set_db_id, table_name);

        let mut summary = RunSummary::default();
        let mut aggregates = RunAggregates::default();
        let mut batch: Vec<FileInfo> = Vec::new();
        let mut batch_bytes: u64 = 0;
        let mut chunk_index: u32 = 0;
        let mut cancelled = false;

        loop {
            let info = match rx.recv() {
                Ok(info) => info,
                Err(_) => break,
            };
            if self.cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            if info.is_symlink {
                continue;
            }
            batch_bytes += info.size;
            batch.push(info);

            let count_hit = batch.len() >= scan.batch_size;
            let bytes_hit = batch_bytes >= scan.batch_size_bytes;
            if count_hit || bytes_hit {
                let trigger = match (count_hit, bytes_hit) {
                    (true, true) => "file-count and byte thresholds",
                    (true, false) => "file-count threshold",
                    _ => "byte threshold",
                };
                info!(
                    "Flushing batch: {} files, {} ({trigger})",
                    batch.len(),
                    format_bytes(batch_bytes)
                );
                self.flush_batch(
                    task,
                    set_id,
                    &sources,
                    &mut batch,
                    &mut batch_bytes,
                    &mut chunk_index,
                    &builder,
                    &stager,
                    &mut catalog,
                    &mut summary,
                    &mut aggregates,
                )?;
                if self.cancel.is_cancelled() {
                    cancelled = true;
                    break;
                }
            }
        }

        // unblocks producers still waiting on channel capacity
        drop(rx);
        let walk_stats = walker.join().unwrap_or_else(|_| {
            warn!("Enumerator worker panicked; continuing with empty walk statistics");
            ScanStats::default()
        });
        summary.file_errors += walk_stats.file_errors();
        summary.dir_errors += walk_stats.dirs_failed;
        summary.long_path_skips += walk_stats.long_paths;
        summary.symlinks_skipped += walk_stats.symlinks;

        if cancelled || self.cancel.is_cancelled() {
            summary.dropped_catalog_rows = catalog.dropped_rows();
            return Err(PipelineError::Cancelled);
        }

        if !batch.is_empty() {
            info!(
                "Flushing final batch: {} files, {}",
                batch.len(),
                format_bytes(batch_bytes)
            );
            self.flush_batch(
                task,
                set_id,
                &sources,
                &mut batch,
                &mut batch_bytes,
                &mut chunk_index,
                &builder,
                &stager,
                &mut catalog,
                &mut summary,
                &mut aggregates,
            )?;
        }

        summary.dropped_catalog_rows = catalog.dropped_rows();
        Ok((summary, aggregates))
    }

    #[allow(clippy::too_many_arguments)]
    fn flush_batch(
        &self,
        task: &BackupTask,
        set_id: &str,
        source_roots: &[PathBuf],
        batch: &mut Vec<FileInfo>,
        batch_bytes: &mut u64,
        chunk_index: &mut u32,
        builder: &ArchiveBuilder,
        stager: &TapeStager,
        catalog: &mut CatalogWriter,
        summary: &mut RunSummary,
        aggregates: &mut RunAggregates,
    ) -> Result<(), PipelineError> {
        let files = std::mem::take(batch);
        *batch_bytes = 0;
        let groups = partition_files(files, self.config.compression.max_archive_size);

        for group in groups {
            if self.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            let group_files = group.files.len() as u64;
            let group_bytes = group.total_size;

            let mut archive =
                match builder.build(group, set_id, source_roots, *chunk_index, &self.cancel) {
                    Ok(archive) => archive,
                    Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                    Err(e @ PipelineError::DiskFull { .. }) => return Err(e),
                    Err(e) => {
                        warn!("Group {} build failed, continuing with next group: {e}", *chunk_index);
                        summary.failed_groups += 1;
                        continue;
                    }
                };

            match stager.stage(&mut archive) {
                Ok(_) => {}
                Err(e @ PipelineError::TapeDriveMissing(_)) => return Err(e),
                Err(e) => {
                    warn!(
                        "Group {} stage failed, continuing with next group: {e}",
                        archive.group_index
                    );
                    summary.failed_groups += 1;
                    let _ = fs::remove_file(&archive.staging_path);
                    continue;
                }
            }

            catalog.record_archive(&archive);

            aggregates.archives += 1;
            aggregates.original_bytes += archive.original_size;
            aggregates.compressed_bytes += archive.compressed_size;
            *chunk_index += 1;

            let archives_so_far = aggregates.archives as u64;
            let compressed = archive.compressed_size;
            let group_index = archive.group_index;
            self.db.with_task_mut(task.id, |t| {
                t.processed_files += group_files;
                t.processed_bytes += group_bytes;
                t.compressed_bytes += compressed;
                t.operation_stage = "archiving".to_string();
                t.description = format!(
                    "Archived group {group_index}: {group_files} files, {}",
                    format_bytes(group_bytes)
                );
                let denominator = t.total_files.max(t.processed_files);
                if t.total_files > 0 && denominator > 0 {
                    let pct = 10.0 + 90.0 * (t.processed_files as f32 / denominator as f32);
                    t.progress_percent = t.progress_percent.max(pct.min(100.0));
                } else {
                    // no denominator from the counter yet
                    t.progress_percent = t.progress_percent.max(10.0);
                }
                let files_per_archive = (t.processed_files / archives_so_far).max(1);
                summary.estimated_archive_count =
                    archives_so_far.max(t.total_files / files_per_archive);
            })?;
        }
        Ok(())
    }

    fn finalize_success(
        &self,
        task: &BackupTask,
        set_db_id: u32,
        summary: &RunSummary,
        aggregates: RunAggregates,
    ) -> Result<(), PipelineError> {
        self.db.finalize_set(
            set_db_id,
            aggregates.archives,
            aggregates.original_bytes,
            aggregates.compressed_bytes,
        )?;
        let json = serde_json::to_string(summary).unwrap_or_else(|_| "{}".to_string());
        let updated = self.db.with_task_mut(task.id, |t| {
            t.status = TaskStatus::Completed;
            t.progress_percent = 100.0;
            t.completed_at = Some(now_ts());
            t.operation_stage = "completed".to_string();
            t.description = format!(
                "Completed: {} archives, {} -> {}",
                aggregates.archives,
                format_bytes(aggregates.original_bytes),
                format_bytes(aggregates.compressed_bytes)
            );
            t.result_summary_json = json.clone();
        })?;
        info!(
            "Backup task {} completed: {} files, {} archives, {} -> {}",
            updated.task_name,
            updated.processed_files,
            aggregates.archives,
            format_bytes(aggregates.original_bytes),
            format_bytes(aggregates.compressed_bytes)
        );
        self.notifier.notify(NotifyEvent::new(
            &updated.task_name,
            EventKind::Success,
            format!(
                "Backup completed: {} files in {} archives, {} written to tape",
                updated.processed_files,
                aggregates.archives,
                format_bytes(aggregates.compressed_bytes)
            ),
        ));
        Ok(())
    }

    /// Cancellation is terminal but not a failure: cataloged groups stay,
    /// the set is left unfinalized, and no failure notification goes out.
    fn finalize_cancelled(&self, task: &BackupTask) {
        info!("Backup task {} cancelled", task.task_name);
        let result = self.db.with_task_mut(task.id, |t| {
            t.status = TaskStatus::Cancelled;
            t.error_message = "cancelled".to_string();
            t.completed_at = Some(now_ts());
            t.operation_stage = "cancelled".to_string();
            if !t.description.ends_with("[cancelled]") {
                t.description = format!("{} [cancelled]", t.description.trim_end());
            }
        });
        if let Err(e) = result {
            warn!("Cannot persist cancelled state: {e}");
        }
    }

    fn fail_task(&self, task: &BackupTask, error: &PipelineError) {
        warn!("Backup task {} failed: {error}", task.task_name);
        let result = self.db.with_task_mut(task.id, |t| {
            t.status = TaskStatus::Failed;
            t.error_message = error.to_string();
            t.completed_at = Some(now_ts());
            t.operation_stage = "failed".to_string();
        });
        if let Err(e) = result {
            warn!("Cannot persist failure state: {e}");
        }
        self.notifier.notify(NotifyEvent::new(
            &task.task_name,
            EventKind::Failed,
            error.to_string(),
        ));
    }

    fn ensure_directories(&self) -> Result<(), PipelineError> {
        for dir in [self.config.temp_dir(), self.config.compress_dir()] {
            fs::create_dir_all(&dir).map_err(|e| {
                PipelineError::NotInitialized(format!("cannot prepare {}: {e}", dir.display()))
            })?;
        }
        Ok(())
    }

    /// The cartridge label must encode the current month. The year may
    /// differ (carried-over cartridges get re-labeled by the format step);
    /// a missing label is logged and allowed through.
    fn check_label_month(&self) -> Result<(), PipelineError> {
        let label = match self.tape.read_label() {
            Some(label) if !label.trim().is_empty() => label,
            _ => {
                warn!("No tape label readable; skipping current-month verification");
                return Ok(());
            }
        };
        let now = chrono::Local::now();
        match extract_label_year_month(&label) {
            None => Err(PipelineError::LabelMismatch(format!(
                "label {label:?} does not encode a year-month"
            ))),
            Some((_, month)) if !(1..=12).contains(&month) => Err(PipelineError::LabelMismatch(
                format!("label {label:?} encodes illegal month {month}"),
            )),
            Some((year, month)) => {
                if month != now.month() {
                    return Err(PipelineError::LabelMismatch(format!(
                        "label {label:?} shows month {month:02}, current month is {:02}; load the current cartridge",
                        now.month()
                    )));
                }
                if year != now.year() {
                    warn!(
                        "Tape label {label:?} year {year} differs from current year {}, month matches; allowing",
                        now.year()
                    );
                }
                info!("Tape label {label:?} matches the current month");
                Ok(())
            }
        }
    }
}

fn make_set_id(task_name: &str) -> String {
    let sanitized: String = task_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!(
        "backup_{}_{}",
        timestamp_fragment(chrono::Local::now()),
        sanitized
    )
}
