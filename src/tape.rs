use chrono::Datelike;
use regex::Regex;
use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::{info, warn};

use crate::config::Config;
use crate::errors::PipelineError;

/// Volume label file at the root of an LTFS-style mount.
pub const LABEL_FILE: &str = ".tape_label";

/// A cartridge as reported by the drive, before any catalog lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct Cartridge {
    pub tape_id: String,
    pub label: Option<String>,
    pub capacity_bytes: u64,
    pub used_bytes: u64,
}

/// Tape hardware boundary. The pipeline only ever talks to this trait;
/// SCSI- or changer-backed implementations live outside this crate.
pub trait TapeController: Send + Sync {
    /// The currently loaded cartridge, if any. Non-blocking.
    fn current_cartridge(&self) -> Option<Cartridge>;

    /// Raw volume label, if one can be read.
    fn read_label(&self) -> Option<String>;

    /// Re-format the volume while preserving (and re-normalizing) its
    /// label. Long-running; progress is reported as a percentage.
    fn format_preserve_label(&self, progress: &mut dyn FnMut(u8)) -> Result<(), PipelineError>;

    /// A cartridge that could be loaded, if the drive knows one.
    fn get_available_cartridge(&self) -> Option<Cartridge>;
}

/// Extract the year and month encoded in a volume label. Recognizes the
/// `TP YYYY MM NN`, `TAPE YYYY MM NN` and bare `YYYYMM` families.
pub fn extract_label_year_month(label: &str) -> Option<(i32, u32)> {
    static PATTERNS: OnceLock<[Regex; 3]> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            Regex::new(r"TP(\d{4})(\d{2})").unwrap(),
            Regex::new(r"TAPE(\d{4})(\d{2})").unwrap(),
            Regex::new(r"(\d{4})(\d{2})").unwrap(),
        ]
    });

    let clean = label.trim().to_ascii_uppercase();
    for pattern in patterns {
        if let Some(caps) = pattern.captures(&clean) {
            let year = caps[1].parse().ok()?;
            let month = caps[2].parse().ok()?;
            return Some((year, month));
        }
    }
    None
}

/// Normalize any recognized label shape to `TPYYYYMMNN`, preserving the
/// sequence number and any trailing suffix; unrecognized or missing labels
/// get sequence `01` for the target month.
pub fn normalize_volume_label(label: Option<&str>, year: i32, month: u32) -> String {
    static PATTERNS: OnceLock<[Regex; 4]> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            Regex::new(r"^TP(\d{4})(\d{2})(\d{2})(.*)$").unwrap(),
            Regex::new(r"^TP(\d{4})(\d{2})(\d+)(.*)$").unwrap(),
            Regex::new(r"^TAPE(\d{4})(\d{2})(\d{2})(.*)$").unwrap(),
            Regex::new(r"^TAPE(\d{4})(\d{2})(\d+)(.*)$").unwrap(),
        ]
    });
    static BARE: OnceLock<Regex> = OnceLock::new();
    let bare = BARE.get_or_init(|| Regex::new(r"(\d{4})(\d{2})(\d{2})").unwrap());

    let build = |seq: &str, suffix: &str| {
        let seq = if !seq.is_empty() && seq.chars().all(|c| c.is_ascii_digit()) {
            seq
        } else {
            "01"
        };
        let padded = format!("{seq:0>2}");
        format!("TP{year:04}{month:02}{}{suffix}", &padded[..2])
    };

    let clean = match label {
        Some(raw) if !raw.trim().is_empty() => raw.trim().to_ascii_uppercase(),
        _ => return build("01", ""),
    };

    for pattern in patterns {
        if let Some(caps) = pattern.captures(&clean) {
            return build(&caps[3], &caps[4]);
        }
    }
    if let Some(caps) = bare.captures(&clean) {
        return build(&caps[3], "");
    }
    build("01", "")
}

/// Mount-backed controller for drives exposed as a filesystem path. The
/// volume label lives in a marker file at the mount root; formatting clears
/// the mount and re-writes the label, which is what LTFS-level tooling does
/// for a quick erase.
pub struct MountTapeController {
    mount: PathBuf,
    max_volume_size: u64,
}

impl MountTapeController {
    pub fn new(mount: PathBuf, max_volume_size: u64) -> Self {
        Self {
            mount,
            max_volume_size,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.tape_drive(), config.tape.max_volume_size)
    }

    pub fn write_label(&self, label: &str) -> std::io::Result<()> {
        fs::write(self.mount.join(LABEL_FILE), format!("{label}\n"))
    }
}

impl TapeController for MountTapeController {
    fn current_cartridge(&self) -> Option<Cartridge> {
        if !self.mount.exists() {
            return None;
        }
        let label = self.read_label();
        let tape_id = label
            .clone()
            .unwrap_or_else(|| "UNLABELED".to_string());
        let total = fs2::total_space(&self.mount).unwrap_or(0);
        let available = fs2::available_space(&self.mount).unwrap_or(0);
        let capacity_bytes = if self.max_volume_size > 0 {
            self.max_volume_size
        } else {
            total
        };
        Some(Cartridge {
            tape_id,
            label,
            capacity_bytes,
            used_bytes: total.saturating_sub(available),
        })
    }

    fn read_label(&self) -> Option<String> {
        let text = fs::read_to_string(self.mount.join(LABEL_FILE)).ok()?;
        let trimmed = text.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    fn format_preserve_label(&self, progress: &mut dyn FnMut(u8)) -> Result<(), PipelineError> {
        if !self.mount.exists() {
            return Err(PipelineError::FormatFailed(format!(
                "mount {} is not reachable",
                self.mount.display()
            )));
        }
        progress(0);

        let label = self.read_label();
        let entries: Vec<_> = fs::read_dir(&self.mount)
            .map_err(|e| PipelineError::FormatFailed(e.to_string()))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name() != LABEL_FILE)
            .collect();

        let count = entries.len().max(1);
        for (idx, entry) in entries.iter().enumerate() {
            let path = entry.path();
            let removed = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            if let Err(e) = removed {
                warn!("Format: cannot remove {}: {e}", path.display());
                return Err(PipelineError::FormatFailed(e.to_string()));
            }
            progress(((idx + 1) * 90 / count) as u8);
        }

        let now = chrono::Local::now();
        let normalized = normalize_volume_label(label.as_deref(), now.year(), now.month());
        self.write_label(&normalized)
            .map_err(|e| PipelineError::FormatFailed(e.to_string()))?;
        info!("Formatted {} with label {normalized}", self.mount.display());
        progress(100);
        Ok(())
    }

    fn get_available_cartridge(&self) -> Option<Cartridge> {
        self.current_cartridge()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_extract_tp_labels() {
        assert_eq!(extract_label_year_month("TP20260801"), Some((2026, 8)));
        assert_eq!(extract_label_year_month("tp2026 08"), None);
        assert_eq!(extract_label_year_month(" TP20231201X "), Some((2023, 12)));
    }

    #[test]
    fn test_extract_tape_and_bare_labels() {
        assert_eq!(extract_label_year_month("TAPE20260803"), Some((2026, 8)));
        assert_eq!(extract_label_year_month("backup-202607"), Some((2026, 7)));
        assert_eq!(extract_label_year_month("no digits here"), None);
    }

    #[test]
    fn test_normalize_preserves_sequence_and_suffix() {
        assert_eq!(
            normalize_volume_label(Some("TP20250703REV"), 2026, 8),
            "TP20260803REV"
        );
        assert_eq!(
            normalize_volume_label(Some("TAPE2025071"), 2026, 8),
            "TP20260801"
        );
        assert_eq!(
            normalize_volume_label(Some("vol-20250705-a"), 2026, 8),
            "TP20260805"
        );
    }

    #[test]
    fn test_normalize_defaults() {
        assert_eq!(normalize_volume_label(None, 2026, 8), "TP20260801");
        assert_eq!(normalize_volume_label(Some("garbage"), 2026, 8), "TP20260801");
        assert_eq!(normalize_volume_label(Some(""), 2026, 8), "TP20260801");
    }

    #[test]
    fn test_mount_label_round_trip() {
        let temp = TempDir::new().unwrap();
        let controller = MountTapeController::new(temp.path().to_path_buf(), 1024);

        assert_eq!(controller.read_label(), None);
        controller.write_label("TP2026080101").unwrap();
        assert_eq!(controller.read_label(), Some("TP2026080101".to_string()));

        let cartridge = controller.current_cartridge().unwrap();
        assert_eq!(cartridge.tape_id, "TP2026080101");
        assert_eq!(cartridge.capacity_bytes, 1024);
    }

    #[test]
    fn test_format_clears_mount_and_keeps_label() {
        let temp = TempDir::new().unwrap();
        let controller = MountTapeController::new(temp.path().to_path_buf(), 0);
        controller.write_label("TP2023110177").unwrap();
        fs::write(temp.path().join("old_archive.tar"), "stale").unwrap();
        fs::create_dir(temp.path().join("old_dir")).unwrap();

        let mut seen = Vec::new();
        controller
            .format_preserve_label(&mut |pct| seen.push(pct))
            .unwrap();

        assert!(!temp.path().join("old_archive.tar").exists());
        assert!(!temp.path().join("old_dir").exists());
        let label = controller.read_label().unwrap();
        let now = chrono::Local::now();
        assert_eq!(
            label,
            format!("TP{:04}{:02}0177", now.year(), now.month())
        );
        assert_eq!(seen.first(), Some(&0));
        assert_eq!(seen.last(), Some(&100));
    }

    #[test]
    fn test_format_fails_on_missing_mount() {
        let temp = TempDir::new().unwrap();
        let controller = MountTapeController::new(temp.path().join("gone"), 0);
        let result = controller.format_preserve_label(&mut |_| {});
        assert!(matches!(result, Err(PipelineError::FormatFailed(_))));
    }

    #[test]
    fn test_missing_mount_has_no_cartridge() {
        let temp = TempDir::new().unwrap();
        let controller = MountTapeController::new(temp.path().join("gone"), 0);
        assert!(controller.current_cartridge().is_none());
    }
}
