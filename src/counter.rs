use glob::Pattern;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::db::BackupDb;
use crate::models::ScanStatus;
use crate::scanner::{PathEnumerator, WalkStrategy};
use crate::util::format_bytes;

/// Independent counting pass over the same sources and exclusions as the
/// main pipeline. It exists only to give the UI a live denominator
/// (`total_files` / `total_bytes`) while the producer is still streaming;
/// the main pipeline never waits for it and either may finish first.
pub struct ScanCounter {
    db: BackupDb,
    task_id: u32,
    sources: Vec<PathBuf>,
    patterns: Vec<Pattern>,
    update_interval: u64,
    log_interval: Duration,
}

/// Handle for stopping the counter. Dropping it abandons the counter,
/// which is background-safe.
pub struct ScanCounterHandle {
    cancel: CancelToken,
    done_rx: Receiver<()>,
}

impl ScanCounter {
    pub fn new(
        db: BackupDb,
        task_id: u32,
        sources: Vec<PathBuf>,
        patterns: Vec<Pattern>,
        update_interval: u64,
        log_interval_seconds: u64,
    ) -> Self {
        Self {
            db,
            task_id,
            sources,
            patterns,
            update_interval: update_interval.max(1),
            log_interval: Duration::from_secs(log_interval_seconds.max(1)),
        }
    }

    /// Spawn the counter thread. `cancel` should be a child of the run
    /// token so run-wide cancellation reaches the counter too.
    pub fn start(self, cancel: CancelToken) -> ScanCounterHandle {
        let (done_tx, done_rx) = mpsc::channel();
        let counter_cancel = cancel.clone();

        thread::spawn(move || {
            self.run(&counter_cancel);
            let _ = done_tx.send(());
        });

        ScanCounterHandle { cancel, done_rx }
    }

    fn run(&self, cancel: &CancelToken) {
        if let Err(e) = self.db.set_scan_status(self.task_id, ScanStatus::Running) {
            warn!("Scan counter cannot mark itself running: {e}");
            return;
        }

        let enumerator = PathEnumerator::new(
            self.sources.clone(),
            self.patterns.clone(),
            WalkStrategy::Sequential,
            cancel.clone(),
        );

        let mut files: u64 = 0;
        let mut bytes: u64 = 0;
        let mut since_flush: u64 = 0;
        let mut last_flush = Instant::now();
        let mut db_failed = false;

        let db = &self.db;
        let task_id = self.task_id;
        let update_interval = self.update_interval;
        let log_interval = self.log_interval;

        let stats = enumerator.for_each_sequential(&mut |info| {
            if info.is_symlink {
                return true;
            }
            files += 1;
            bytes += info.size;
            since_flush += 1;
            if since_flush >= update_interval || last_flush.elapsed() >= log_interval {
                if let Err(e) = db.update_scan_progress(task_id, files, bytes) {
                    warn!("Scan counter progress write failed: {e}");
                    db_failed = true;
                    return false;
                }
                since_flush = 0;
                last_flush = Instant::now();
            }
            true
        });

        // always persist the final (or partial, on cancel) totals
        if let Err(e) = self.db.update_scan_progress(self.task_id, files, bytes) {
            warn!("Scan counter final progress write failed: {e}");
            db_failed = true;
        }

        if db_failed {
            let _ = self.db.set_scan_status(self.task_id, ScanStatus::Failed);
            return;
        }
        if cancel.is_cancelled() {
            info!(
                "Scan counter cancelled with partial totals: {} files, {}",
                files,
                format_bytes(bytes)
            );
            return;
        }

        info!(
            "Scan counter finished: {} files, {} ({} contained errors)",
            files,
            format_bytes(bytes),
            stats.file_errors() + stats.dirs_failed
        );
        let _ = self.db.set_scan_status(self.task_id, ScanStatus::Completed);
    }
}

impl ScanCounterHandle {
    /// Cancel the counter and wait up to `timeout` for it to exit. Returns
    /// false when the counter had to be abandoned.
    pub fn stop(self, timeout: Duration) -> bool {
        self.cancel.cancel();
        match self.done_rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => {
                warn!("Scan counter did not stop within {timeout:?}, abandoning it");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BackupTask, TaskType};
    use crate::scanner::compile_patterns;
    use std::fs;
    use tempfile::TempDir;

    fn setup() -> (TempDir, BackupDb, u32) {
        let dir = TempDir::new().unwrap();
        let db = BackupDb::new(dir.path().join("catalog.redb")).unwrap();
        let mut task = BackupTask::new("count", TaskType::Full, vec![]);
        let id = db.create_task(&mut task).unwrap();
        (dir, db, id)
    }

    #[test]
    fn test_counter_writes_totals_and_completes() {
        let (dir, db, task_id) = setup();
        let src = dir.path().join("src");
        fs::create_dir(&src).unwrap();
        for i in 0..25 {
            fs::write(src.join(format!("f{i}.txt")), "12345").unwrap();
        }

        let counter = ScanCounter::new(db.clone(), task_id, vec![src], Vec::new(), 10, 60);
        let handle = counter.start(CancelToken::new());
        assert!(handle.stop(Duration::from_secs(5)));

        let task = db.get_task(task_id).unwrap();
        assert_eq!(task.total_files, 25);
        assert_eq!(task.total_bytes, 125);
        assert_eq!(task.scan_status, ScanStatus::Completed);
        assert!(task.scan_completed_at.is_some());
    }

    #[test]
    fn test_counter_honors_exclusions() {
        let (dir, db, task_id) = setup();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("skip")).unwrap();
        fs::write(src.join("keep.txt"), "keep").unwrap();
        fs::write(src.join("skip").join("s.txt"), "skip").unwrap();

        let patterns =
            compile_patterns(&[format!("{}/skip*", src.display())]);
        let counter = ScanCounter::new(db.clone(), task_id, vec![src], patterns, 1, 60);
        let handle = counter.start(CancelToken::new());
        assert!(handle.stop(Duration::from_secs(5)));

        let task = db.get_task(task_id).unwrap();
        assert_eq!(task.total_files, 1);
        assert_eq!(task.total_bytes, 4);
    }

    #[test]
    fn test_counter_cancellation_keeps_partials() {
        let (dir, db, task_id) = setup();
        let src = dir.path().join("src");
        fs::create_dir(&src).unwrap();
        fs::write(src.join("a.txt"), "abc").unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();
        let counter = ScanCounter::new(db.clone(), task_id, vec![src], Vec::new(), 1, 60);
        let handle = counter.start(cancel);
        assert!(handle.stop(Duration::from_secs(5)));

        let task = db.get_task(task_id).unwrap();
        // cancelled before walking anything: partial totals are zero and
        // the scan never reports completed
        assert_ne!(task.scan_status, ScanStatus::Completed);
    }
}
