use glob::Pattern;
use jwalk::{Parallelism, WalkDir};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::SystemTime;
use tracing::{debug, warn};

use crate::cancel::CancelToken;

#[cfg(windows)]
const MAX_PATH_LEN: usize = 260;
#[cfg(not(windows))]
const MAX_PATH_LEN: usize = 4096;

/// Only the first errors of each kind are logged; the rest are counted
/// silently so a tree with a million unreadable entries does not flood logs.
const MAX_LOGGED_ERRORS: u64 = 20;

/// Cancellation is observed on every directory pop and every N-th file.
const CANCEL_CHECK_FILES: u64 = 1000;

/// One enumerated source file, with everything the catalog row needs.
#[derive(Debug, Clone, PartialEq)]
pub struct FileInfo {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    pub modified: i64,
    pub created: i64,
    pub accessed: i64,
    /// Three-digit octal permission bits.
    pub permissions: String,
    pub is_symlink: bool,
}

impl FileInfo {
    fn from_symlink_metadata(path: PathBuf, meta: &fs::Metadata) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string_lossy().to_string());
        Self {
            name,
            size: meta.len(),
            modified: ts_or_zero(meta.modified()),
            created: ts_or_zero(meta.created()),
            accessed: ts_or_zero(meta.accessed()),
            permissions: permission_bits(meta),
            is_symlink: meta.file_type().is_symlink(),
            path,
        }
    }
}

fn ts_or_zero(time: std::io::Result<SystemTime>) -> i64 {
    time.ok()
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(unix)]
fn permission_bits(meta: &fs::Metadata) -> String {
    use std::os::unix::fs::PermissionsExt;
    format!("{:03o}", meta.permissions().mode() & 0o777)
}

#[cfg(not(unix))]
fn permission_bits(meta: &fs::Metadata) -> String {
    if meta.permissions().readonly() {
        "555".to_string()
    } else {
        "755".to_string()
    }
}

/// Contained-error statistics for one walk. Nothing in here is fatal.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanStats {
    pub files: u64,
    pub bytes: u64,
    pub symlinks: u64,
    pub permission_denied: u64,
    pub not_found: u64,
    pub io_errors: u64,
    pub long_paths: u64,
    pub dirs_failed: u64,
}

impl ScanStats {
    pub fn file_errors(&self) -> u64 {
        self.permission_denied + self.not_found + self.io_errors
    }

    fn record_entry_error(&mut self, path: &Path, err: &std::io::Error) {
        use std::io::ErrorKind;
        let bucket = match err.kind() {
            ErrorKind::PermissionDenied => {
                self.permission_denied += 1;
                self.permission_denied
            }
            ErrorKind::NotFound => {
                self.not_found += 1;
                self.not_found
            }
            _ => {
                self.io_errors += 1;
                self.io_errors
            }
        };
        if bucket <= MAX_LOGGED_ERRORS {
            warn!("Cannot read entry {}: {}", path.display(), err);
        }
    }

    fn record_dir_error(&mut self, path: &Path, err: &std::io::Error) {
        self.dirs_failed += 1;
        if self.dirs_failed <= MAX_LOGGED_ERRORS {
            warn!("Cannot read directory {}: {}, skipping subtree", path.display(), err);
        }
    }

    fn record_long_path(&mut self, path: &Path) {
        self.long_paths += 1;
        if self.long_paths <= MAX_LOGGED_ERRORS {
            warn!(
                "Path exceeds {} characters, skipping: {}",
                MAX_PATH_LEN,
                path.display()
            );
        }
    }
}

/// Compile raw glob strings; invalid patterns are logged and dropped so one
/// typo in a task definition does not abort the whole run.
pub fn compile_patterns(raw: &[String]) -> Vec<Pattern> {
    let mut patterns = Vec::with_capacity(raw.len());
    for text in raw {
        let normalized = text.replace('\\', "/");
        match Pattern::new(&normalized) {
            Ok(pattern) => patterns.push(pattern),
            Err(e) => warn!("Ignoring invalid exclude pattern {text:?}: {e}"),
        }
    }
    patterns
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// True when the path, any of its ancestors, or any ancestor with `/*`
/// appended matches one of the exclusion patterns. Called on directories to
/// prune whole subtrees and on files to filter leaves.
pub fn should_exclude(path: &Path, patterns: &[Pattern]) -> bool {
    if patterns.is_empty() {
        return false;
    }
    let normalized = normalize_path(path);
    for pattern in patterns {
        if pattern.matches(&normalized) {
            return true;
        }
    }

    let parts: Vec<&str> = normalized.split('/').collect();
    let mut ancestor = String::with_capacity(normalized.len());
    for (idx, part) in parts.iter().enumerate() {
        if idx > 0 {
            ancestor.push('/');
        }
        ancestor.push_str(part);
        if ancestor.is_empty() {
            continue;
        }
        for pattern in patterns {
            if pattern.matches(&ancestor) {
                return true;
            }
            if pattern.matches(&format!("{ancestor}/*")) {
                return true;
            }
        }
    }
    false
}

fn exceeds_path_limit(path: &Path) -> bool {
    path.as_os_str().len() > MAX_PATH_LEN
}

/// Enumerator strategy, selected from configuration at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkStrategy {
    Sequential,
    Concurrent { threads: usize },
}

/// Lazily produces file records for a set of source roots, honoring the
/// exclusion patterns and containing per-entry errors. The batch thresholds
/// belong to the consumer; the enumerator only provides backpressure via a
/// bounded channel.
pub struct PathEnumerator {
    sources: Vec<PathBuf>,
    patterns: Vec<Pattern>,
    strategy: WalkStrategy,
    cancel: CancelToken,
}

impl PathEnumerator {
    pub fn new(
        sources: Vec<PathBuf>,
        patterns: Vec<Pattern>,
        strategy: WalkStrategy,
        cancel: CancelToken,
    ) -> Self {
        Self {
            sources,
            patterns,
            strategy,
            cancel,
        }
    }

    /// Start the producer worker(s). File records arrive on the returned
    /// bounded channel; the join handle yields the walk statistics once the
    /// channel has been fully drained or the run was cancelled.
    pub fn spawn(self, channel_bound: usize) -> (Receiver<FileInfo>, thread::JoinHandle<ScanStats>) {
        let (tx, rx) = std::sync::mpsc::sync_channel(channel_bound.max(1));
        let handle = thread::spawn(move || match self.strategy {
            WalkStrategy::Sequential => {
                let mut stats = ScanStats::default();
                self.walk_sequential(&mut stats, &mut |info| tx.send(info).is_ok());
                stats
            }
            WalkStrategy::Concurrent { threads } => {
                let stats = Arc::new(Mutex::new(ScanStats::default()));
                self.walk_concurrent(threads.max(1), tx, &stats);
                let stats = stats.lock().expect("walk stats lock");
                stats.clone()
            }
        });
        (rx, handle)
    }

    /// Drive the sequential walker on the calling thread, handing each file
    /// record to `emit`. Returning `false` from `emit` stops the walk. Used
    /// directly by the scan counter, which needs no channel.
    pub fn for_each_sequential(&self, emit: &mut dyn FnMut(FileInfo) -> bool) -> ScanStats {
        let mut stats = ScanStats::default();
        self.walk_sequential(&mut stats, emit);
        stats
    }

    /// Depth-first walk over an explicit directory stack. Directory entries
    /// carry their file type, so regular files need a single metadata call.
    fn walk_sequential(&self, stats: &mut ScanStats, emit: &mut dyn FnMut(FileInfo) -> bool) {
        let mut stack: Vec<PathBuf> = Vec::new();
        let mut tick: u64 = 0;

        for source in &self.sources {
            if self.cancel.is_cancelled() {
                return;
            }
            if should_exclude(source, &self.patterns) {
                debug!("Source {} matches an exclude pattern, skipping", source.display());
                continue;
            }
            match fs::symlink_metadata(source) {
                Ok(meta) if meta.is_dir() => stack.push(source.clone()),
                Ok(meta) => {
                    if !self.emit_entry(source.clone(), &meta, stats, emit) {
                        return;
                    }
                }
                Err(e) => stats.record_entry_error(source, &e),
            }
        }

        while let Some(dir) = stack.pop() {
            if self.cancel.is_cancelled() {
                return;
            }
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) => {
                    stats.record_dir_error(&dir, &e);
                    continue;
                }
            };
            for entry in entries {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        stats.record_entry_error(&dir, &e);
                        continue;
                    }
                };
                let path = entry.path();
                if exceeds_path_limit(&path) {
                    stats.record_long_path(&path);
                    continue;
                }
                if should_exclude(&path, &self.patterns) {
                    continue;
                }
                let file_type = match entry.file_type() {
                    Ok(file_type) => file_type,
                    Err(e) => {
                        stats.record_entry_error(&path, &e);
                        continue;
                    }
                };
                if file_type.is_dir() {
                    stack.push(path);
                    continue;
                }
                // Symlinks and regular files both need metadata; symlink
                // metadata is never followed.
                match fs::symlink_metadata(&path) {
                    Ok(meta) => {
                        if !self.emit_entry(path, &meta, stats, emit) {
                            return;
                        }
                    }
                    Err(e) => stats.record_entry_error(&path, &e),
                }
                tick += 1;
                if tick % CANCEL_CHECK_FILES == 0 && self.cancel.is_cancelled() {
                    return;
                }
            }
        }
    }

    fn emit_entry(
        &self,
        path: PathBuf,
        meta: &fs::Metadata,
        stats: &mut ScanStats,
        emit: &mut dyn FnMut(FileInfo) -> bool,
    ) -> bool {
        let info = FileInfo::from_symlink_metadata(path, meta);
        if info.is_symlink {
            stats.symlinks += 1;
        } else {
            stats.files += 1;
            stats.bytes += info.size;
        }
        emit(info)
    }

    /// Bounded worker-pool walk: jwalk fans subtrees out over a rayon pool
    /// and every worker pushes finished records straight onto the shared
    /// output channel from the read-dir callback. Excluded directories are
    /// dropped from the children list, which prunes the subtree before any
    /// worker descends into it.
    fn walk_concurrent(
        &self,
        threads: usize,
        tx: SyncSender<FileInfo>,
        stats: &Arc<Mutex<ScanStats>>,
    ) {
        let stop = Arc::new(AtomicBool::new(false));

        for source in &self.sources {
            if self.cancel.is_cancelled() || stop.load(Ordering::SeqCst) {
                return;
            }
            if should_exclude(source, &self.patterns) {
                debug!("Source {} matches an exclude pattern, skipping", source.display());
                continue;
            }
            match fs::symlink_metadata(source) {
                Ok(meta) if meta.is_dir() => {}
                Ok(meta) => {
                    let mut guard = stats.lock().expect("walk stats lock");
                    let info = FileInfo::from_symlink_metadata(source.clone(), &meta);
                    if info.is_symlink {
                        guard.symlinks += 1;
                    } else {
                        guard.files += 1;
                        guard.bytes += info.size;
                    }
                    drop(guard);
                    if tx.send(info).is_err() {
                        return;
                    }
                    continue;
                }
                Err(e) => {
                    stats
                        .lock()
                        .expect("walk stats lock")
                        .record_entry_error(source, &e);
                    continue;
                }
            }

            let patterns = self.patterns.clone();
            let cancel = self.cancel.clone();
            let worker_tx = tx.clone();
            let worker_stats = Arc::clone(stats);
            let worker_stop = Arc::clone(&stop);

            let walk = WalkDir::new(source)
                .follow_links(false)
                .skip_hidden(false)
                .parallelism(Parallelism::RayonNewPool(threads))
                .process_read_dir(move |_depth, _path, _state, children| {
                    if cancel.is_cancelled() || worker_stop.load(Ordering::SeqCst) {
                        children.clear();
                        return;
                    }
                    children.retain(|child| {
                        let child = match child {
                            Ok(child) => child,
                            // read errors stay in the list so the driving
                            // iterator can count them
                            Err(_) => return true,
                        };
                        let path = child.path();
                        if exceeds_path_limit(&path) {
                            worker_stats
                                .lock()
                                .expect("walk stats lock")
                                .record_long_path(&path);
                            return false;
                        }
                        if should_exclude(&path, &patterns) {
                            return false;
                        }
                        if child.file_type().is_dir() {
                            return true;
                        }
                        match fs::symlink_metadata(&path) {
                            Ok(meta) => {
                                let info = FileInfo::from_symlink_metadata(path, &meta);
                                let mut guard =
                                    worker_stats.lock().expect("walk stats lock");
                                if info.is_symlink {
                                    guard.symlinks += 1;
                                } else {
                                    guard.files += 1;
                                    guard.bytes += info.size;
                                }
                                drop(guard);
                                if worker_tx.send(info).is_err() {
                                    worker_stop.store(true, Ordering::SeqCst);
                                }
                            }
                            Err(e) => worker_stats
                                .lock()
                                .expect("walk stats lock")
                                .record_entry_error(&path, &e),
                        }
                        false
                    });
                });

            let mut tick: u64 = 0;
            for entry in walk {
                tick += 1;
                if tick % CANCEL_CHECK_FILES == 0
                    && (self.cancel.is_cancelled() || stop.load(Ordering::SeqCst))
                {
                    break;
                }
                if let Err(e) = entry {
                    let mut guard = stats.lock().expect("walk stats lock");
                    match e.io_error() {
                        Some(io_err) => {
                            let path = e.path().unwrap_or(source).to_path_buf();
                            guard.record_dir_error(&path, io_err);
                        }
                        None => guard.dirs_failed += 1,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::fs;
    use tempfile::TempDir;

    fn patterns(raw: &[&str]) -> Vec<Pattern> {
        compile_patterns(&raw.iter().map(|s| s.to_string()).collect::<Vec<_>>())
    }

    fn collect(enumerator: PathEnumerator) -> (Vec<FileInfo>, ScanStats) {
        let (rx, handle) = enumerator.spawn(64);
        let files: Vec<FileInfo> = rx.into_iter().collect();
        let stats = handle.join().expect("walker thread");
        (files, stats)
    }

    fn make_tree(root: &Path) {
        fs::create_dir(root.join("keep")).unwrap();
        fs::write(root.join("keep").join("k.txt"), "keep me").unwrap();
        fs::create_dir_all(root.join("skip").join("sub")).unwrap();
        fs::write(root.join("skip").join("s1.txt"), "skip").unwrap();
        fs::write(root.join("skip").join("sub").join("s2.txt"), "skip").unwrap();
        fs::write(root.join("top.txt"), "top-level").unwrap();
    }

    #[test]
    fn test_should_exclude_direct_and_ancestors() {
        let pats = patterns(&["/src/skip*"]);
        assert!(should_exclude(Path::new("/src/skip"), &pats));
        assert!(should_exclude(Path::new("/src/skip/s1.txt"), &pats));
        assert!(should_exclude(Path::new("/src/skip/sub/s2.txt"), &pats));
        assert!(!should_exclude(Path::new("/src/keep/k.txt"), &pats));
    }

    #[test]
    fn test_should_exclude_directory_star_pattern() {
        let pats = patterns(&["/data/tmp/*"]);
        assert!(should_exclude(Path::new("/data/tmp/a.log"), &pats));
        assert!(should_exclude(Path::new("/data/tmp/deep/b.log"), &pats));
        assert!(!should_exclude(Path::new("/data/tmp2/c.log"), &pats));
    }

    #[test]
    fn test_should_exclude_backslash_normalization() {
        let pats = patterns(&["D:\\temp*"]);
        assert!(should_exclude(Path::new("D:/temp/file.txt"), &pats));
    }

    #[test]
    fn test_invalid_pattern_is_dropped() {
        let pats = patterns(&["[unclosed", "*.log"]);
        assert_eq!(pats.len(), 1);
        assert!(should_exclude(Path::new("a.log"), &pats));
    }

    #[test]
    fn test_long_path_detection() {
        let long = "a/".repeat(MAX_PATH_LEN);
        assert!(exceeds_path_limit(Path::new(&long)));
        assert!(!exceeds_path_limit(Path::new("/short/path")));
    }

    #[test]
    fn test_sequential_walk_with_exclusions() {
        let temp = TempDir::new().unwrap();
        make_tree(temp.path());
        let exclude = vec![format!("{}/skip*", temp.path().display())];

        let enumerator = PathEnumerator::new(
            vec![temp.path().to_path_buf()],
            compile_patterns(&exclude),
            WalkStrategy::Sequential,
            CancelToken::new(),
        );
        let (files, stats) = collect(enumerator);

        let names: BTreeSet<String> = files.iter().map(|f| f.name.clone()).collect();
        assert_eq!(
            names,
            BTreeSet::from(["k.txt".to_string(), "top.txt".to_string()])
        );
        assert_eq!(stats.files, 2);
        assert_eq!(stats.bytes, 7 + 9);
        assert_eq!(stats.dirs_failed, 0);
    }

    #[test]
    fn test_concurrent_walk_matches_sequential() {
        let temp = TempDir::new().unwrap();
        make_tree(temp.path());
        let exclude = vec![format!("{}/skip*", temp.path().display())];

        let sequential = PathEnumerator::new(
            vec![temp.path().to_path_buf()],
            compile_patterns(&exclude),
            WalkStrategy::Sequential,
            CancelToken::new(),
        );
        let concurrent = PathEnumerator::new(
            vec![temp.path().to_path_buf()],
            compile_patterns(&exclude),
            WalkStrategy::Concurrent { threads: 4 },
            CancelToken::new(),
        );

        let (mut seq_files, seq_stats) = collect(sequential);
        let (mut con_files, con_stats) = collect(concurrent);
        seq_files.sort_by(|a, b| a.path.cmp(&b.path));
        con_files.sort_by(|a, b| a.path.cmp(&b.path));

        assert_eq!(seq_files, con_files);
        assert_eq!(seq_stats.files, con_stats.files);
        assert_eq!(seq_stats.bytes, con_stats.bytes);
    }

    #[test]
    fn test_file_source_is_emitted_directly() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("single.bin");
        fs::write(&file, vec![0u8; 128]).unwrap();

        let enumerator = PathEnumerator::new(
            vec![file.clone()],
            Vec::new(),
            WalkStrategy::Sequential,
            CancelToken::new(),
        );
        let (files, stats) = collect(enumerator);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, file);
        assert_eq!(files[0].size, 128);
        assert_eq!(stats.files, 1);
    }

    #[test]
    fn test_missing_source_is_contained() {
        let temp = TempDir::new().unwrap();
        let enumerator = PathEnumerator::new(
            vec![temp.path().join("does_not_exist")],
            Vec::new(),
            WalkStrategy::Sequential,
            CancelToken::new(),
        );
        let (files, stats) = collect(enumerator);
        assert!(files.is_empty());
        assert_eq!(stats.not_found, 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_are_recorded_not_followed() {
        let temp = TempDir::new().unwrap();
        fs::create_dir(temp.path().join("real")).unwrap();
        fs::write(temp.path().join("real").join("data.txt"), "data").unwrap();
        std::os::unix::fs::symlink(temp.path().join("real"), temp.path().join("link")).unwrap();

        let enumerator = PathEnumerator::new(
            vec![temp.path().to_path_buf()],
            Vec::new(),
            WalkStrategy::Sequential,
            CancelToken::new(),
        );
        let (files, stats) = collect(enumerator);

        // one regular file plus the link itself; nothing behind the link
        assert_eq!(stats.files, 1);
        assert_eq!(stats.symlinks, 1);
        assert_eq!(files.iter().filter(|f| f.is_symlink).count(), 1);
        assert_eq!(files.len(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_directory_is_contained() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("ok.txt"), "fine").unwrap();
        let locked = temp.path().join("locked");
        fs::create_dir(&locked).unwrap();
        fs::write(locked.join("secret.txt"), "secret").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        // running as root bypasses permission bits; nothing to test then
        if fs::read_dir(&locked).is_ok() {
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let enumerator = PathEnumerator::new(
            vec![temp.path().to_path_buf()],
            Vec::new(),
            WalkStrategy::Sequential,
            CancelToken::new(),
        );
        let (files, stats) = collect(enumerator);
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(files.len(), 1);
        assert_eq!(stats.dirs_failed, 1);
    }

    #[test]
    fn test_cancellation_stops_walk() {
        let temp = TempDir::new().unwrap();
        for i in 0..50 {
            fs::write(temp.path().join(format!("f{i}.txt")), "x").unwrap();
        }
        let cancel = CancelToken::new();
        cancel.cancel();

        let enumerator = PathEnumerator::new(
            vec![temp.path().to_path_buf()],
            Vec::new(),
            WalkStrategy::Sequential,
            cancel,
        );
        let (files, _stats) = collect(enumerator);
        assert!(files.is_empty());
    }
}
