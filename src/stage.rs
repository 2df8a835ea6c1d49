use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::archive::ArchiveRecord;
use crate::config::Config;
use crate::errors::PipelineError;
use crate::util::format_bytes;

/// The file must report the same size this many times in a row before it is
/// considered fully flushed and safe to move.
const STABLE_SAMPLES: u32 = 3;
const SAMPLE_INTERVAL: Duration = Duration::from_millis(500);
const MAX_SAMPLES: u32 = 120;

const MOVE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Moves finished archives onto the tape mount and records their final
/// placement. In direct-write mode the archive was produced on the tape
/// filesystem already and staging reduces to a path check.
pub struct TapeStager<'a> {
    config: &'a Config,
}

impl<'a> TapeStager<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    /// Stage one archive. A failure here loses the group, not the run.
    pub fn stage(&self, archive: &mut ArchiveRecord) -> Result<PathBuf, PipelineError> {
        let drive = self.config.tape_drive();
        if !drive.exists() {
            return Err(PipelineError::TapeDriveMissing(drive));
        }

        if self.config.compression.direct_to_tape {
            debug!(
                "Direct-write mode, archive already on tape filesystem: {}",
                archive.staging_path.display()
            );
            archive.final_path = Some(archive.staging_path.clone());
            return Ok(archive.staging_path.clone());
        }

        wait_for_stable_size(&archive.staging_path)?;

        let filename = archive
            .staging_path
            .file_name()
            .ok_or_else(|| {
                PipelineError::Stage(format!(
                    "archive path {} has no file name",
                    archive.staging_path.display()
                ))
            })?
            .to_os_string();
        let destination = drive.join(filename);

        move_with_retries(
            &archive.staging_path,
            &destination,
            self.config.tape.move_retries,
        )?;
        info!(
            "Staged group {} to tape: {} ({})",
            archive.group_index,
            destination.display(),
            format_bytes(archive.compressed_size)
        );

        archive.final_path = Some(destination.clone());
        Ok(destination)
    }
}

fn wait_for_stable_size(path: &Path) -> Result<(), PipelineError> {
    let mut last_size: Option<u64> = None;
    let mut streak = 0u32;

    for _ in 0..MAX_SAMPLES {
        let size = fs::metadata(path)
            .map_err(|e| PipelineError::Stage(format!("cannot stat {}: {e}", path.display())))?
            .len();
        if last_size == Some(size) {
            streak += 1;
        } else {
            streak = 1;
            last_size = Some(size);
        }
        if streak >= STABLE_SAMPLES {
            return Ok(());
        }
        std::thread::sleep(SAMPLE_INTERVAL);
    }

    Err(PipelineError::Stage(format!(
        "size of {} did not stabilize",
        path.display()
    )))
}

/// Rename when source and destination share a filesystem; otherwise copy
/// and remove. Transient failures are retried on a delay.
fn move_with_retries(source: &Path, destination: &Path, retries: u32) -> Result<(), PipelineError> {
    let attempts = retries.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match fs::rename(source, destination) {
            Ok(()) => return Ok(()),
            Err(rename_err) => {
                match fs::copy(source, destination).and_then(|_| fs::remove_file(source)) {
                    Ok(()) => return Ok(()),
                    Err(copy_err) => {
                        last_error =
                            format!("rename failed ({rename_err}), copy failed ({copy_err})");
                        warn!(
                            "Move to tape attempt {attempt}/{attempts} failed for {}: {last_error}",
                            source.display()
                        );
                    }
                }
            }
        }
        if attempt < attempts {
            std::thread::sleep(MOVE_RETRY_DELAY);
        }
    }

    Err(PipelineError::Stage(format!(
        "cannot move {} to {}: {last_error}",
        source.display(),
        destination.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveRecord;
    use crate::config::{
        CompressionConfig, CompressionMethod, DiskConfig, ScanConfig, StorageConfig, TapeConfig,
    };
    use tempfile::TempDir;

    fn stager_config(root: &Path, direct: bool) -> Config {
        Config {
            storage: StorageConfig {
                db_path: root.join("catalog.redb").display().to_string(),
                temp_dir: root.join("tmp").display().to_string(),
                compress_dir: root.join("compress").display().to_string(),
            },
            tape: TapeConfig {
                drive_path: root.join("tape").display().to_string(),
                max_volume_size: 0,
                move_retries: 2,
            },
            scan: ScanConfig::default(),
            compression: CompressionConfig {
                method: CompressionMethod::Tar,
                direct_to_tape: direct,
                ..CompressionConfig::default()
            },
            disk: DiskConfig::default(),
            retention_days: 180,
        }
    }

    fn record_for(path: PathBuf) -> ArchiveRecord {
        ArchiveRecord {
            staging_path: path,
            final_path: None,
            original_size: 9,
            compressed_size: 9,
            format: CompressionMethod::Tar,
            group_index: 0,
            members: Vec::new(),
        }
    }

    #[test]
    fn test_missing_drive_is_detected() {
        let temp = TempDir::new().unwrap();
        let config = stager_config(temp.path(), false);
        let mut record = record_for(temp.path().join("a.tar"));

        let result = TapeStager::new(&config).stage(&mut record);
        assert!(matches!(result, Err(PipelineError::TapeDriveMissing(_))));
    }

    #[test]
    fn test_direct_mode_is_a_no_op() {
        let temp = TempDir::new().unwrap();
        let config = stager_config(temp.path(), true);
        fs::create_dir_all(config.tape_drive()).unwrap();

        let archive_path = temp.path().join("a.tar");
        fs::write(&archive_path, "data").unwrap();
        let mut record = record_for(archive_path.clone());

        let staged = TapeStager::new(&config).stage(&mut record).unwrap();
        assert_eq!(staged, archive_path);
        assert_eq!(record.final_path, Some(archive_path.clone()));
        assert!(archive_path.exists());
    }

    #[test]
    fn test_staged_mode_moves_archive_to_drive() {
        let temp = TempDir::new().unwrap();
        let config = stager_config(temp.path(), false);
        fs::create_dir_all(config.tape_drive()).unwrap();

        let archive_path = temp.path().join("backup_x_1.tar");
        fs::write(&archive_path, "archive bytes").unwrap();
        let mut record = record_for(archive_path.clone());

        let staged = TapeStager::new(&config).stage(&mut record).unwrap();
        assert_eq!(staged, config.tape_drive().join("backup_x_1.tar"));
        assert!(staged.exists());
        assert!(!archive_path.exists());
        assert_eq!(record.final_path, Some(staged));
    }

    #[test]
    fn test_missing_archive_is_a_stage_error() {
        let temp = TempDir::new().unwrap();
        let config = stager_config(temp.path(), false);
        fs::create_dir_all(config.tape_drive()).unwrap();

        let mut record = record_for(temp.path().join("vanished.tar"));
        let result = TapeStager::new(&config).stage(&mut record);
        assert!(matches!(result, Err(PipelineError::Stage(_))));
    }
}
