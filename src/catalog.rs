use std::path::Path;
use tracing::{debug, warn};

use crate::archive::ArchiveRecord;
use crate::db::BackupDb;
use crate::models::BackupFile;
use crate::util::now_ts;

/// Rows per insert transaction.
pub const DEFAULT_INSERT_BATCH: usize = 3000;

/// Persists per-file provenance for produced archives into the set's shard
/// table. Inserts are batched; a failed batch is retried once and then
/// dropped with a warning. The archive is on tape either way, so catalog
/// loss is degraded service, not data loss.
pub struct CatalogWriter {
    db: BackupDb,
    set_db_id: u32,
    table_name: String,
    insert_batch: usize,
    inserted_rows: u64,
    dropped_rows: u64,
}

impl CatalogWriter {
    pub fn new(db: BackupDb, set_db_id: u32, table_name: String) -> Self {
        Self {
            db,
            set_db_id,
            table_name,
            insert_batch: DEFAULT_INSERT_BATCH,
            inserted_rows: 0,
            dropped_rows: 0,
        }
    }

    #[cfg(test)]
    fn with_insert_batch(mut self, insert_batch: usize) -> Self {
        self.insert_batch = insert_batch.max(1);
        self
    }

    /// Insert one row per member of the archive. Member order follows
    /// partitioning order, so catalog order matches on-tape order.
    pub fn record_archive(&mut self, archive: &ArchiveRecord) {
        if archive.members.is_empty() {
            return;
        }
        let per_member_compressed = archive.compressed_size / archive.members.len() as u64;
        let backup_time = now_ts();

        let rows: Vec<BackupFile> = archive
            .members
            .iter()
            .map(|member| {
                let info = &member.info;
                BackupFile {
                    backup_set_id: self.set_db_id,
                    file_path: info.path.to_string_lossy().to_string(),
                    file_name: info.name.clone(),
                    directory_path: info
                        .path
                        .parent()
                        .map(|p| p.to_string_lossy().to_string())
                        .unwrap_or_default(),
                    file_type: file_type_of(&info.name),
                    file_size: info.size,
                    compressed_size: per_member_compressed,
                    file_permissions: info.permissions.clone(),
                    created_time: info.created,
                    modified_time: info.modified,
                    accessed_time: info.accessed,
                    chunk_number: archive.group_index,
                    is_copy_success: member.ok,
                    backup_time,
                    created_at: backup_time,
                    updated_at: backup_time,
                }
            })
            .collect();

        for chunk in rows.chunks(self.insert_batch) {
            match self.db.insert_files(&self.table_name, chunk) {
                Ok(()) => self.inserted_rows += chunk.len() as u64,
                Err(first) => {
                    warn!(
                        "Catalog insert of {} rows failed ({first}), retrying once",
                        chunk.len()
                    );
                    match self.db.insert_files(&self.table_name, chunk) {
                        Ok(()) => self.inserted_rows += chunk.len() as u64,
                        Err(second) => {
                            warn!(
                                "Catalog insert retry failed ({second}); dropping {} rows for chunk {} \
                                 (archive remains restorable by inspection)",
                                chunk.len(),
                                archive.group_index
                            );
                            self.dropped_rows += chunk.len() as u64;
                        }
                    }
                }
            }
        }
        debug!(
            "Cataloged group {}: {} rows into {}",
            archive.group_index,
            archive.members.len(),
            self.table_name
        );
    }

    pub fn inserted_rows(&self) -> u64 {
        self.inserted_rows
    }

    pub fn dropped_rows(&self) -> u64 {
        self.dropped_rows
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }
}

fn file_type_of(name: &str) -> String {
    Path::new(name)
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}
