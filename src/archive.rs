use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::config::{CompressionMethod, Config};
use crate::errors::PipelineError;
use crate::scanner::FileInfo;
use crate::util::{format_bytes, parse_size_bytes, timestamp_fragment};

/// An archive is suspect when a sizable group compresses to almost nothing
/// and not a single member made it in.
const EMPTY_ARCHIVE_MIN_ORIGINAL: u64 = 100 * 1024 * 1024;
const EMPTY_ARCHIVE_RATIO: f64 = 0.001;

/// Write-buffer bounds for the compressing formats.
const MIN_WRITE_BUFFER: u64 = 64 * 1024;
const MAX_WRITE_BUFFER: u64 = 16 * 1024 * 1024;

/// Ordered files whose summed size fits one archive (except acknowledged
/// single-file overflow groups).
#[derive(Debug, Clone, PartialEq)]
pub struct FileGroup {
    pub files: Vec<FileInfo>,
    pub total_size: u64,
}

impl FileGroup {
    fn new(files: Vec<FileInfo>, total_size: u64) -> Self {
        Self { files, total_size }
    }
}

/// One member of a produced archive: the file record plus whether it was
/// actually written. Failed members stay listed so the catalog can mark
/// them unsuccessful.
#[derive(Debug, Clone)]
pub struct ArchiveMember {
    pub info: FileInfo,
    pub ok: bool,
    pub error: Option<String>,
}

/// A produced archive and its placement so far. `final_path` is filled by
/// the tape stager.
#[derive(Debug, Clone)]
pub struct ArchiveRecord {
    pub staging_path: PathBuf,
    pub final_path: Option<PathBuf>,
    pub original_size: u64,
    pub compressed_size: u64,
    pub format: CompressionMethod,
    pub group_index: u32,
    pub members: Vec<ArchiveMember>,
}

impl ArchiveRecord {
    pub fn successful_members(&self) -> usize {
        self.members.iter().filter(|m| m.ok).count()
    }
}

/// Mutable build progress, shared between the active builder and whoever
/// surfaces it (the controller polls, UIs read). Plain atomics; no locking.
#[derive(Debug, Default)]
pub struct CompressProgress {
    current_file_index: AtomicUsize,
    total_files_in_group: AtomicUsize,
    bytes_written: AtomicU64,
    group_size_bytes: AtomicU64,
    completed: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressSnapshot {
    pub current_file_index: usize,
    pub total_files_in_group: usize,
    pub bytes_written: u64,
    pub group_size_bytes: u64,
    pub completed: bool,
}

impl CompressProgress {
    fn reset(&self, total_files: usize, group_size: u64) {
        self.current_file_index.store(0, Ordering::Relaxed);
        self.total_files_in_group.store(total_files, Ordering::Relaxed);
        self.bytes_written.store(0, Ordering::Relaxed);
        self.group_size_bytes.store(group_size, Ordering::Relaxed);
        self.completed.store(false, Ordering::Relaxed);
    }

    fn set_current(&self, index: usize) {
        self.current_file_index.store(index, Ordering::Relaxed);
    }

    fn add_bytes(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    fn mark_completed(&self) {
        self.completed.store(true, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CompressSnapshot {
        CompressSnapshot {
            current_file_index: self.current_file_index.load(Ordering::Relaxed),
            total_files_in_group: self.total_files_in_group.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            group_size_bytes: self.group_size_bytes.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
        }
    }
}

/// Partition files into groups of at most `max_size` bytes.
///
/// When the batch does not fit a single archive, aim for `ceil(total/max)`
/// evenly sized groups: files are placed largest-first, a group is closed
/// when the next file would overflow the cap, and a group that already
/// holds 80% of the target is closed early rather than ballooning past
/// 120% of it, provided at least half a target's worth of bytes remains.
/// Files individually larger than the cap get a group of their own.
pub fn partition_files(files: Vec<FileInfo>, max_size: u64) -> Vec<FileGroup> {
    if files.is_empty() {
        return Vec::new();
    }
    let total: u64 = files.iter().map(|f| f.size).sum();
    if total <= max_size {
        return vec![FileGroup::new(files, total)];
    }

    let num_groups = total.div_ceil(max_size);
    let target = total as f64 / num_groups as f64;
    debug!(
        "Batch of {} does not fit one archive, targeting {} groups of ~{}",
        format_bytes(total),
        num_groups,
        format_bytes(target as u64)
    );

    let mut sorted = files;
    sorted.sort_by(|a, b| b.size.cmp(&a.size));

    // remaining[i] = summed size of everything after index i
    let mut remaining = vec![0u64; sorted.len()];
    let mut cumulative = 0u64;
    for idx in (0..sorted.len()).rev() {
        remaining[idx] = cumulative;
        cumulative += sorted[idx].size;
    }

    let mut groups: Vec<FileGroup> = Vec::new();
    let mut current: Vec<FileInfo> = Vec::new();
    let mut current_size: u64 = 0;

    for (idx, file) in sorted.into_iter().enumerate() {
        let file_size = file.size;
        let rest = remaining[idx];

        if file_size > max_size {
            if !current.is_empty() {
                groups.push(FileGroup::new(std::mem::take(&mut current), current_size));
                current_size = 0;
            }
            warn!(
                "File {} ({}) exceeds the archive cap of {}; writing it as a solo oversized archive",
                file.path.display(),
                format_bytes(file_size),
                format_bytes(max_size)
            );
            groups.push(FileGroup::new(vec![file], file_size));
            continue;
        }

        if current_size + file_size > max_size && !current.is_empty() {
            groups.push(FileGroup::new(std::mem::take(&mut current), current_size));
            current_size = 0;
        }

        if !current.is_empty()
            && current_size as f64 >= target * 0.8
            && (current_size + file_size) as f64 > target * 1.2
            && rest as f64 >= target * 0.5
        {
            groups.push(FileGroup::new(std::mem::take(&mut current), current_size));
            current_size = 0;
        }

        current_size += file_size;
        current.push(file);
    }

    if !current.is_empty() {
        groups.push(FileGroup::new(current, current_size));
    }

    groups
}

/// Name a member inside the archive: the path relative to the first source
/// root that contains it, falling back to the base name.
pub fn arcname_for(path: &Path, source_roots: &[PathBuf]) -> PathBuf {
    for root in source_roots {
        if let Ok(rel) = path.strip_prefix(root) {
            if !rel.as_os_str().is_empty() {
                return rel.to_path_buf();
            }
        }
    }
    path.file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| path.to_path_buf())
}

/// Builds one archive per file group in the configured format, staged under
/// `compress_dir/temp/<set_id>/` and, in staged mode, handed over to
/// `final/<set_id>/` once complete.
pub struct ArchiveBuilder<'a> {
    config: &'a Config,
    progress: Arc<CompressProgress>,
}

impl<'a> ArchiveBuilder<'a> {
    pub fn new(config: &'a Config, progress: Arc<CompressProgress>) -> Self {
        Self { config, progress }
    }

    pub fn progress(&self) -> &Arc<CompressProgress> {
        &self.progress
    }

    pub fn build(
        &self,
        group: FileGroup,
        set_id: &str,
        source_roots: &[PathBuf],
        group_index: u32,
        cancel: &CancelToken,
    ) -> Result<ArchiveRecord, PipelineError> {
        let method = self.config.compression.method;
        let staging_dir = self.config.compress_dir().join("temp").join(set_id);
        fs::create_dir_all(&staging_dir)?;

        ensure_disk_space(
            &staging_dir,
            self.config.compression.max_archive_size,
            self.config.disk.check_interval_secs,
            self.config.disk.max_retries,
            cancel,
        )?;

        let timestamp = timestamp_fragment(chrono::Local::now());
        let filename = format!("backup_{set_id}_{timestamp}.{}", method.extension());
        let archive_path = staging_dir.join(&filename);

        self.progress.reset(group.files.len(), group.total_size);
        info!(
            "Building group {} as {}: {} files, {}",
            group_index,
            filename,
            group.files.len(),
            format_bytes(group.total_size)
        );

        let members = match self.write_archive(&archive_path, &group, source_roots, cancel) {
            Ok(members) => members,
            Err(e) => {
                // never leave a half-written archive behind
                let _ = fs::remove_file(&archive_path);
                return Err(e);
            }
        };

        let compressed_size = fs::metadata(&archive_path)?.len();
        let successful = members.iter().filter(|m| m.ok).count();
        if group.total_size > EMPTY_ARCHIVE_MIN_ORIGINAL
            && (compressed_size as f64) < group.total_size as f64 * EMPTY_ARCHIVE_RATIO
            && successful == 0
        {
            let _ = fs::remove_file(&archive_path);
            return Err(PipelineError::EmptyArchive(archive_path));
        }

        let staging_path = if self.config.compression.direct_to_tape {
            archive_path
        } else {
            let final_dir = self.config.compress_dir().join("final").join(set_id);
            fs::create_dir_all(&final_dir)?;
            let final_path = final_dir.join(&filename);
            fs::rename(&archive_path, &final_path).map_err(|e| {
                PipelineError::ArchiveBuild(format!(
                    "cannot move finished archive to {}: {e}",
                    final_dir.display()
                ))
            })?;
            final_path
        };

        self.progress.mark_completed();
        info!(
            "Group {} archived: {} -> {} ({} of {} members)",
            group_index,
            format_bytes(group.total_size),
            format_bytes(compressed_size),
            successful,
            members.len()
        );

        Ok(ArchiveRecord {
            staging_path,
            final_path: None,
            original_size: group.total_size,
            compressed_size,
            format: method,
            group_index,
            members,
        })
    }

    fn write_archive(
        &self,
        archive_path: &Path,
        group: &FileGroup,
        source_roots: &[PathBuf],
        cancel: &CancelToken,
    ) -> Result<Vec<ArchiveMember>, PipelineError> {
        let compression = &self.config.compression;
        match compression.method {
            CompressionMethod::Tar => {
                let file = File::create(archive_path)?;
                let mut builder = tar::Builder::new(BufWriter::new(file));
                let members = self.append_members(&mut builder, group, source_roots, cancel)?;
                let mut writer = builder.into_inner()?;
                writer.flush()?;
                Ok(members)
            }
            CompressionMethod::Pgzip => {
                let level = compression.level.clamp(0, 9) as u32;
                let capacity = write_buffer_capacity(&compression.pgzip_block_size);
                let file = File::create(archive_path)?;
                let encoder = flate2::write::GzEncoder::new(
                    BufWriter::with_capacity(capacity, file),
                    flate2::Compression::new(level),
                );
                let mut builder = tar::Builder::new(encoder);
                let members = self.append_members(&mut builder, group, source_roots, cancel)?;
                let encoder = builder.into_inner()?;
                let mut writer = encoder.finish()?;
                writer.flush()?;
                Ok(members)
            }
            CompressionMethod::Zstd => {
                let level = compression.level.clamp(1, 19);
                let capacity = write_buffer_capacity(&compression.zstd_write_size);
                let file = File::create(archive_path)?;
                let mut encoder =
                    zstd::Encoder::new(BufWriter::with_capacity(capacity, file), level)?;
                encoder.multithread(compression.zstd_threads as u32)?;
                let mut builder = tar::Builder::new(encoder);
                let members = self.append_members(&mut builder, group, source_roots, cancel)?;
                let encoder = builder.into_inner()?;
                let mut writer = encoder.finish()?;
                writer.flush()?;
                Ok(members)
            }
            CompressionMethod::P7zip => {
                self.write_7z_archive(archive_path, group, source_roots, cancel)
            }
        }
    }

    fn append_members<W: Write>(
        &self,
        builder: &mut tar::Builder<W>,
        group: &FileGroup,
        source_roots: &[PathBuf],
        cancel: &CancelToken,
    ) -> Result<Vec<ArchiveMember>, PipelineError> {
        let mut members = Vec::with_capacity(group.files.len());
        for (idx, info) in group.files.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            let arcname = arcname_for(&info.path, source_roots);
            let outcome = File::open(&info.path)
                .map_err(|e| e.to_string())
                .and_then(|mut file| {
                    builder
                        .append_file(&arcname, &mut file)
                        .map_err(|e| e.to_string())
                });
            match outcome {
                Ok(()) => {
                    self.progress.add_bytes(info.size);
                    members.push(ArchiveMember {
                        info: info.clone(),
                        ok: true,
                        error: None,
                    });
                }
                Err(reason) => {
                    warn!("Cannot add {} to archive: {reason}", info.path.display());
                    members.push(ArchiveMember {
                        info: info.clone(),
                        ok: false,
                        error: Some(reason),
                    });
                }
            }
            self.progress.set_current(idx + 1);
        }
        Ok(members)
    }

    /// External 7z build. Members are laid out under a work directory with
    /// their archive-relative paths, then the binary packs the whole
    /// directory, so entry names match the other formats.
    fn write_7z_archive(
        &self,
        archive_path: &Path,
        group: &FileGroup,
        source_roots: &[PathBuf],
        cancel: &CancelToken,
    ) -> Result<Vec<ArchiveMember>, PipelineError> {
        let compression = &self.config.compression;
        let work_dir = self
            .config
            .temp_dir()
            .join(format!("7z_work_{}", timestamp_fragment(chrono::Local::now())));
        fs::create_dir_all(&work_dir)?;

        let mut members = Vec::with_capacity(group.files.len());
        for (idx, info) in group.files.iter().enumerate() {
            if cancel.is_cancelled() {
                let _ = fs::remove_dir_all(&work_dir);
                return Err(PipelineError::Cancelled);
            }
            let arcname = arcname_for(&info.path, source_roots);
            let dest = work_dir.join(&arcname);
            let outcome = dest
                .parent()
                .map(fs::create_dir_all)
                .transpose()
                .map_err(|e| e.to_string())
                .and_then(|_| {
                    // hard links avoid copying; fall back when the work dir
                    // sits on another filesystem
                    fs::hard_link(&info.path, &dest)
                        .or_else(|_| fs::copy(&info.path, &dest).map(|_| ()))
                        .map_err(|e| e.to_string())
                });
            match outcome {
                Ok(()) => {
                    self.progress.add_bytes(info.size);
                    members.push(ArchiveMember {
                        info: info.clone(),
                        ok: true,
                        error: None,
                    });
                }
                Err(reason) => {
                    warn!(
                        "Cannot lay out {} for 7z archive: {reason}",
                        info.path.display()
                    );
                    members.push(ArchiveMember {
                        info: info.clone(),
                        ok: false,
                        error: Some(reason),
                    });
                }
            }
            self.progress.set_current(idx + 1);
        }

        if cancel.is_cancelled() {
            let _ = fs::remove_dir_all(&work_dir);
            return Err(PipelineError::Cancelled);
        }

        // 7z resolves the archive path against its working directory
        let archive_abs = if archive_path.is_absolute() {
            archive_path.to_path_buf()
        } else {
            std::env::current_dir()?.join(archive_path)
        };

        let level = compression.level.clamp(0, 9);
        let status = Command::new(&compression.sevenzip_path)
            .arg("a")
            .arg("-t7z")
            .arg(format!("-mx={level}"))
            .arg(format!("-mmt={}", compression.command_threads))
            .arg(format!("-md={}", compression.dictionary_size))
            .arg("-y")
            .arg(&archive_abs)
            .arg(".")
            .current_dir(&work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        let _ = fs::remove_dir_all(&work_dir);

        match status {
            Ok(status) if status.success() => Ok(members),
            Ok(status) => Err(PipelineError::ArchiveBuild(format!(
                "7z exited with {status}"
            ))),
            Err(e) => Err(PipelineError::ArchiveBuild(format!(
                "cannot run {}: {e}",
                compression.sevenzip_path
            ))),
        }
    }
}

fn write_buffer_capacity(size: &str) -> usize {
    parse_size_bytes(size)
        .unwrap_or(MAX_WRITE_BUFFER)
        .clamp(MIN_WRITE_BUFFER, MAX_WRITE_BUFFER) as usize
}

/// Require `3 × max_archive_size` free at the staging path before building,
/// retrying on a timer so a stager that is draining archives to tape gets a
/// chance to free space.
fn ensure_disk_space(
    dir: &Path,
    max_archive_size: u64,
    check_interval_secs: u64,
    max_retries: u32,
    cancel: &CancelToken,
) -> Result<(), PipelineError> {
    if max_archive_size == 0 {
        return Ok(());
    }
    let required = max_archive_size.saturating_mul(3);
    let mut retries = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let available = match fs2::available_space(dir) {
            Ok(available) => available,
            Err(e) => {
                warn!(
                    "Cannot query free space at {}, skipping disk gate: {e}",
                    dir.display()
                );
                return Ok(());
            }
        };
        if available >= required {
            return Ok(());
        }

        retries += 1;
        warn!(
            "Low disk space at {}: {} free, {} required; retry {}/{}",
            dir.display(),
            format_bytes(available),
            format_bytes(required),
            retries,
            max_retries
        );
        if retries >= max_retries {
            return Err(PipelineError::DiskFull {
                required,
                available,
            });
        }
        std::thread::sleep(Duration::from_secs(check_interval_secs));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        CompressionConfig, DiskConfig, ScanConfig, StorageConfig, TapeConfig,
    };
    use std::io::Read;
    use tempfile::TempDir;

    fn fake_file(name: &str, size: u64) -> FileInfo {
        FileInfo {
            path: PathBuf::from(format!("/src/{name}")),
            name: name.to_string(),
            size,
            modified: 0,
            created: 0,
            accessed: 0,
            permissions: "644".to_string(),
            is_symlink: false,
        }
    }

    fn test_config(root: &Path, method: CompressionMethod) -> Config {
        Config {
            storage: StorageConfig {
                db_path: root.join("catalog.redb").display().to_string(),
                temp_dir: root.join("tmp").display().to_string(),
                compress_dir: root.join("compress").display().to_string(),
            },
            tape: TapeConfig::default(),
            scan: ScanConfig::default(),
            compression: CompressionConfig {
                method,
                level: 3,
                max_archive_size: 1024 * 1024,
                direct_to_tape: true,
                ..CompressionConfig::default()
            },
            disk: DiskConfig {
                check_interval_secs: 1,
                max_retries: 1,
            },
            retention_days: 180,
        }
    }

    fn real_group(dir: &Path, specs: &[(&str, &str)]) -> (FileGroup, Vec<PathBuf>) {
        let mut files = Vec::new();
        let mut total = 0u64;
        for (name, content) in specs {
            let path = dir.join(name);
            fs::write(&path, content).unwrap();
            let meta = fs::metadata(&path).unwrap();
            total += meta.len();
            files.push(FileInfo {
                path,
                name: name.to_string(),
                size: meta.len(),
                modified: 0,
                created: 0,
                accessed: 0,
                permissions: "644".to_string(),
                is_symlink: false,
            });
        }
        (FileGroup::new(files, total), vec![dir.to_path_buf()])
    }

    #[test]
    fn test_partition_single_group_when_under_cap() {
        let files = vec![fake_file("a", 10), fake_file("b", 20), fake_file("c", 30)];
        let groups = partition_files(files, 1_000_000);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].total_size, 60);
        assert_eq!(groups[0].files.len(), 3);
    }

    #[test]
    fn test_partition_even_split() {
        const MIB: u64 = 1024 * 1024;
        let files: Vec<FileInfo> = (0..10)
            .map(|i| fake_file(&format!("f{i}"), 100 * MIB))
            .collect();
        let groups = partition_files(files, 300 * MIB);

        assert_eq!(groups.len(), 4);
        let sizes: Vec<u64> = groups.iter().map(|g| g.total_size).collect();
        assert_eq!(sizes, vec![300 * MIB, 300 * MIB, 300 * MIB, 100 * MIB]);
        let total_members: usize = groups.iter().map(|g| g.files.len()).sum();
        assert_eq!(total_members, 10);
    }

    #[test]
    fn test_partition_oversized_file_gets_solo_group() {
        let files = vec![
            fake_file("big", 5000),
            fake_file("a", 100),
            fake_file("b", 100),
        ];
        let groups = partition_files(files, 1000);

        let solo = groups.iter().find(|g| g.files.len() == 1).unwrap();
        assert_eq!(solo.files[0].name, "big");
        assert_eq!(solo.total_size, 5000);
        for group in &groups {
            assert!(group.total_size <= 1000 || group.files.len() == 1);
        }
    }

    #[test]
    fn test_partition_respects_cap() {
        let files: Vec<FileInfo> = (0..100)
            .map(|i| fake_file(&format!("f{i}"), 37 + (i % 13) * 11))
            .collect();
        let total: u64 = files.iter().map(|f| f.size).sum();
        let groups = partition_files(files, 300);

        let grouped: u64 = groups.iter().map(|g| g.total_size).sum();
        assert_eq!(grouped, total);
        for group in &groups {
            assert!(!group.files.is_empty());
            assert!(group.total_size <= 300 || group.files.len() == 1);
        }
    }

    #[test]
    fn test_partition_is_deterministic() {
        let files: Vec<FileInfo> = (0..50)
            .map(|i| fake_file(&format!("f{i}"), 10 + (i * 7) % 90))
            .collect();
        let a = partition_files(files.clone(), 200);
        let b = partition_files(files, 200);
        assert_eq!(a, b);
    }

    #[test]
    fn test_partition_empty_input() {
        assert!(partition_files(Vec::new(), 1000).is_empty());
    }

    #[test]
    fn test_arcname_relative_to_first_containing_root() {
        let roots = vec![PathBuf::from("/data/photos"), PathBuf::from("/data/docs")];
        assert_eq!(
            arcname_for(Path::new("/data/docs/2026/report.pdf"), &roots),
            PathBuf::from("2026/report.pdf")
        );
        assert_eq!(
            arcname_for(Path::new("/elsewhere/file.bin"), &roots),
            PathBuf::from("file.bin")
        );
    }

    #[test]
    fn test_build_tar_archive() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(&src).unwrap();
        let (group, roots) = real_group(&src, &[("a.txt", "alpha"), ("b.txt", "bravo")]);

        let config = test_config(temp.path(), CompressionMethod::Tar);
        let builder = ArchiveBuilder::new(&config, Arc::new(CompressProgress::default()));
        let record = builder
            .build(group, "backup_20260801_000000_t", &roots, 0, &CancelToken::new())
            .unwrap();

        assert_eq!(record.successful_members(), 2);
        assert_eq!(record.original_size, 10);
        assert!(record.compressed_size > 0);
        assert!(record.staging_path.exists());

        let mut names = Vec::new();
        let mut archive = tar::Archive::new(File::open(&record.staging_path).unwrap());
        for entry in archive.entries().unwrap() {
            names.push(
                entry
                    .unwrap()
                    .path()
                    .unwrap()
                    .to_string_lossy()
                    .to_string(),
            );
        }
        names.sort();
        assert_eq!(names, vec!["a.txt".to_string(), "b.txt".to_string()]);

        let snapshot = builder.progress().snapshot();
        assert!(snapshot.completed);
        assert_eq!(snapshot.current_file_index, 2);
    }

    #[test]
    fn test_build_zstd_round_trip() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(&src).unwrap();
        let payload = "payload ".repeat(1000);
        let (group, roots) = real_group(&src, &[("data.bin", payload.as_str())]);

        let config = test_config(temp.path(), CompressionMethod::Zstd);
        let builder = ArchiveBuilder::new(&config, Arc::new(CompressProgress::default()));
        let record = builder
            .build(group, "backup_20260801_000000_t", &roots, 0, &CancelToken::new())
            .unwrap();

        assert!(record.staging_path.to_string_lossy().ends_with(".tar.zst"));
        assert!(record.compressed_size < record.original_size);

        let decoder = zstd::Decoder::new(File::open(&record.staging_path).unwrap()).unwrap();
        let mut archive = tar::Archive::new(decoder);
        let mut entries = archive.entries().unwrap();
        let mut content = String::new();
        entries
            .next()
            .unwrap()
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, payload);
    }

    #[test]
    fn test_build_pgzip_round_trip() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(&src).unwrap();
        let (group, roots) = real_group(&src, &[("x.txt", "hello gzip")]);

        let mut config = test_config(temp.path(), CompressionMethod::Pgzip);
        config.compression.level = 5;
        let builder = ArchiveBuilder::new(&config, Arc::new(CompressProgress::default()));
        let record = builder
            .build(group, "backup_20260801_000000_t", &roots, 0, &CancelToken::new())
            .unwrap();

        assert!(record.staging_path.to_string_lossy().ends_with(".tar.gz"));
        let decoder = flate2::read::GzDecoder::new(File::open(&record.staging_path).unwrap());
        let mut archive = tar::Archive::new(decoder);
        let mut content = String::new();
        archive
            .entries()
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "hello gzip");
    }

    #[test]
    fn test_missing_member_is_recorded_not_fatal() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(&src).unwrap();
        let (mut group, roots) = real_group(&src, &[("present.txt", "here")]);
        group.files.push(fake_file("ghost.txt", 4));
        group.total_size += 4;

        let config = test_config(temp.path(), CompressionMethod::Tar);
        let builder = ArchiveBuilder::new(&config, Arc::new(CompressProgress::default()));
        let record = builder
            .build(group, "backup_20260801_000000_t", &roots, 0, &CancelToken::new())
            .unwrap();

        assert_eq!(record.members.len(), 2);
        assert_eq!(record.successful_members(), 1);
        let ghost = record.members.iter().find(|m| !m.ok).unwrap();
        assert_eq!(ghost.info.name, "ghost.txt");
        assert!(ghost.error.is_some());
    }

    #[test]
    fn test_empty_archive_detection() {
        let temp = TempDir::new().unwrap();
        // a large group where every member is missing compresses to a bare
        // tar footer, which the verifier must reject
        let files: Vec<FileInfo> = (0..4)
            .map(|i| fake_file(&format!("missing{i}"), 50 * 1024 * 1024))
            .collect();
        let total: u64 = files.iter().map(|f| f.size).sum();
        let group = FileGroup::new(files, total);

        let config = test_config(temp.path(), CompressionMethod::Tar);
        let builder = ArchiveBuilder::new(&config, Arc::new(CompressProgress::default()));
        let result = builder.build(
            group,
            "backup_20260801_000000_t",
            &[PathBuf::from("/src")],
            0,
            &CancelToken::new(),
        );
        assert!(matches!(result, Err(PipelineError::EmptyArchive(_))));
    }

    #[test]
    fn test_staged_mode_moves_to_final_dir() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(&src).unwrap();
        let (group, roots) = real_group(&src, &[("f.txt", "final")]);

        let mut config = test_config(temp.path(), CompressionMethod::Tar);
        config.compression.direct_to_tape = false;
        let builder = ArchiveBuilder::new(&config, Arc::new(CompressProgress::default()));
        let record = builder
            .build(group, "backup_20260801_000000_t", &roots, 0, &CancelToken::new())
            .unwrap();

        assert!(record
            .staging_path
            .starts_with(config.compress_dir().join("final")));
        assert!(record.staging_path.exists());
    }

    #[test]
    fn test_disk_gate_fails_when_space_is_impossible() {
        let temp = TempDir::new().unwrap();
        let result = ensure_disk_space(
            temp.path(),
            u64::MAX / 4,
            1,
            1,
            &CancelToken::new(),
        );
        assert!(matches!(result, Err(PipelineError::DiskFull { .. })));
    }

    #[test]
    fn test_disk_gate_passes_with_tiny_requirement() {
        let temp = TempDir::new().unwrap();
        assert!(ensure_disk_space(temp.path(), 1024, 1, 3, &CancelToken::new()).is_ok());
    }

    #[test]
    fn test_cancelled_build_removes_partial_archive() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(&src).unwrap();
        let (group, roots) = real_group(&src, &[("a.txt", "alpha")]);

        let cancel = CancelToken::new();
        cancel.cancel();

        let config = test_config(temp.path(), CompressionMethod::Tar);
        let builder = ArchiveBuilder::new(&config, Arc::new(CompressProgress::default()));
        let result = builder.build(group, "backup_20260801_000000_t", &roots, 0, &cancel);
        assert!(matches!(result, Err(PipelineError::Cancelled)));

        let staging = config.compress_dir().join("temp").join("backup_20260801_000000_t");
        let leftovers: Vec<_> = fs::read_dir(staging).unwrap().collect();
        assert!(leftovers.is_empty());
    }
}
