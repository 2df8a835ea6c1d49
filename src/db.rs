use redb::{Database, ReadableTable, TableDefinition, TableError};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::errors::CatalogError;
use crate::models::{BackupFile, BackupSet, BackupTask, ScanStatus, TapeCartridge, TaskStatus};
use crate::util::now_ts;

// Fixed table definitions. Per-set file tables are created at runtime, one
// per backup set, and resolved through `backup_sets.backup_files_table`.
pub const TASKS_TABLE: TableDefinition<u32, &[u8]> = TableDefinition::new("backup_tasks");
pub const SETS_TABLE: TableDefinition<u32, &[u8]> = TableDefinition::new("backup_sets");
pub const CARTRIDGES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("tape_cartridges");

/// Catalog database handle. Cheap to clone; every worker that persists
/// state (controller, catalog writer, scan counter) holds its own copy.
#[derive(Clone)]
pub struct BackupDb {
    db: Arc<Database>,
    path: PathBuf,
}

fn encode<T>(value: &T) -> rkyv::AlignedVec
where
    T: rkyv::Serialize<rkyv::ser::serializers::AllocSerializer<1024>>,
{
    use rkyv::ser::Serializer;
    let mut serializer = rkyv::ser::serializers::AllocSerializer::<1024>::default();
    serializer
        .serialize_value(value)
        .expect("rkyv alloc serialization does not fail");
    serializer.into_serializer().into_inner()
}

fn decode<T>(bytes: &[u8]) -> Result<T, CatalogError>
where
    T: rkyv::Archive,
    T::Archived:
        rkyv::Deserialize<T, rkyv::de::deserializers::SharedDeserializeMap>,
{
    // redb hands out 1-byte-aligned slices; copy into an aligned buffer
    // before interpreting the archive.
    let mut aligned = rkyv::AlignedVec::with_capacity(bytes.len());
    aligned.extend_from_slice(bytes);
    let archived = unsafe { rkyv::archived_root::<T>(&aligned) };
    rkyv::Deserialize::deserialize(
        archived,
        &mut rkyv::de::deserializers::SharedDeserializeMap::new(),
    )
    .map_err(|e| CatalogError::Decode(e.to_string()))
}

impl BackupDb {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path_buf = path.as_ref().to_path_buf();
        let db = Database::create(&path_buf)?;
        let write_txn = db.begin_write()?;
        {
            write_txn.open_table(TASKS_TABLE)?;
            write_txn.open_table(SETS_TABLE)?;
            write_txn.open_table(CARTRIDGES_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(db),
            path: path_buf,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn begin_read(&self) -> Result<redb::ReadTransaction, CatalogError> {
        Ok(self.db.begin_read()?)
    }

    // ---- tasks ----

    /// Insert a new task row, assigning its id and timestamps.
    pub fn create_task(&self, task: &mut BackupTask) -> Result<u32, CatalogError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TASKS_TABLE)?;
            let next_id = match table.last()? {
                Some((key, _)) => key.value() + 1,
                None => 1,
            };
            task.id = next_id;
            task.created_at = now_ts();
            task.updated_at = task.created_at;
            let bytes = encode(task);
            table.insert(next_id, bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(task.id)
    }

    pub fn get_task(&self, id: u32) -> Result<BackupTask, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TASKS_TABLE)?;
        match table.get(id)? {
            Some(value) => decode(value.value()),
            None => Err(CatalogError::TaskNotFound(id)),
        }
    }

    pub fn list_tasks(&self) -> Result<Vec<BackupTask>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TASKS_TABLE)?;
        let mut tasks = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            tasks.push(decode(value.value())?);
        }
        Ok(tasks)
    }

    /// Read-modify-write a task row in a single write transaction.
    ///
    /// redb serializes write transactions, so concurrent updates from the
    /// controller and the scan counter cannot lose each other's fields.
    pub fn with_task_mut<F>(&self, id: u32, mutate: F) -> Result<BackupTask, CatalogError>
    where
        F: FnOnce(&mut BackupTask),
    {
        let write_txn = self.db.begin_write()?;
        let task = {
            let mut table = write_txn.open_table(TASKS_TABLE)?;
            let mut task: BackupTask = match table.get(id)? {
                Some(value) => decode(value.value())?,
                None => return Err(CatalogError::TaskNotFound(id)),
            };
            mutate(&mut task);
            task.updated_at = now_ts();
            let bytes = encode(&task);
            table.insert(id, bytes.as_slice())?;
            task
        };
        write_txn.commit()?;
        Ok(task)
    }

    /// True when another run of the same template (or same-named task) is
    /// currently in state `running`.
    pub fn any_running_sibling(&self, task: &BackupTask) -> Result<bool, CatalogError> {
        for other in self.list_tasks()? {
            if other.status != TaskStatus::Running {
                continue;
            }
            if other.id == task.id {
                return Ok(true);
            }
            let same_template = task.template_id.is_some() && other.template_id == task.template_id;
            if same_template || other.task_name == task.task_name {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // ---- scan-progress helpers (scan counter writes only these fields) ----

    pub fn update_scan_progress(
        &self,
        task_id: u32,
        scanned_files: u64,
        scanned_bytes: u64,
    ) -> Result<(), CatalogError> {
        self.with_task_mut(task_id, |task| {
            task.total_files = scanned_files;
            task.total_bytes = scanned_bytes;
        })?;
        Ok(())
    }

    pub fn set_scan_status(&self, task_id: u32, status: ScanStatus) -> Result<(), CatalogError> {
        self.with_task_mut(task_id, |task| {
            task.scan_status = status;
            if status == ScanStatus::Completed {
                task.scan_completed_at = Some(now_ts());
            }
        })?;
        Ok(())
    }

    pub fn set_stage_description(
        &self,
        task_id: u32,
        stage: &str,
        description: &str,
    ) -> Result<(), CatalogError> {
        self.with_task_mut(task_id, |task| {
            task.operation_stage = stage.to_string();
            task.description = description.to_string();
        })?;
        Ok(())
    }

    // ---- backup sets ----

    pub fn create_set(&self, set: &mut BackupSet) -> Result<u32, CatalogError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SETS_TABLE)?;
            let next_id = match table.last()? {
                Some((key, _)) => key.value() + 1,
                None => 1,
            };
            set.id = next_id;
            set.created_at = now_ts();
            let bytes = encode(set);
            table.insert(next_id, bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(set.id)
    }

    pub fn get_set(&self, id: u32) -> Result<BackupSet, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SETS_TABLE)?;
        match table.get(id)? {
            Some(value) => decode(value.value()),
            None => Err(CatalogError::SetNotFound(id)),
        }
    }

    pub fn list_sets(&self) -> Result<Vec<BackupSet>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SETS_TABLE)?;
        let mut sets = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            sets.push(decode(value.value())?);
        }
        Ok(sets)
    }

    /// Persist final aggregates and stamp `finalized_at`. Called exactly
    /// once, on successful completion of a run.
    pub fn finalize_set(
        &self,
        id: u32,
        archive_count: u32,
        original_bytes: u64,
        compressed_bytes: u64,
    ) -> Result<BackupSet, CatalogError> {
        let write_txn = self.db.begin_write()?;
        let set = {
            let mut table = write_txn.open_table(SETS_TABLE)?;
            let mut set: BackupSet = match table.get(id)? {
                Some(value) => decode(value.value())?,
                None => return Err(CatalogError::SetNotFound(id)),
            };
            set.archive_count = archive_count;
            set.original_bytes = original_bytes;
            set.compressed_bytes = compressed_bytes;
            set.finalized_at = Some(now_ts());
            let bytes = encode(&set);
            table.insert(id, bytes.as_slice())?;
            set
        };
        write_txn.commit()?;
        Ok(set)
    }

    // ---- cartridges ----

    pub fn register_cartridge(&self, cartridge: &TapeCartridge) -> Result<(), CatalogError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(CARTRIDGES_TABLE)?;
            let bytes = encode(cartridge);
            table.insert(cartridge.tape_id.as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get_cartridge(&self, tape_id: &str) -> Result<Option<TapeCartridge>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(CARTRIDGES_TABLE)?;
        match table.get(tape_id)? {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    pub fn list_cartridges(&self) -> Result<Vec<TapeCartridge>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(CARTRIDGES_TABLE)?;
        let mut cartridges = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            cartridges.push(decode(value.value())?);
        }
        Ok(cartridges)
    }

    // ---- sharded per-set file tables ----

    /// Stable shard table name for a set id: `backup_files_` plus the first
    /// eight hex characters of the set id's blake3 hash, so names stay
    /// short and filesystem-agnostic regardless of task naming.
    pub fn file_table_name(set_id: &str) -> String {
        let digest = blake3::hash(set_id.as_bytes());
        format!("backup_files_{}", &hex::encode(digest.as_bytes())[..8])
    }

    /// Create the set's file table and return its name.
    pub fn create_file_table(&self, set_id: &str) -> Result<String, CatalogError> {
        let name = Self::file_table_name(set_id);
        let write_txn = self.db.begin_write()?;
        {
            let definition = TableDefinition::<&str, &[u8]>::new(&name);
            write_txn.open_table(definition)?;
        }
        write_txn.commit()?;
        Ok(name)
    }

    /// Insert file rows into a shard table, keyed by path (unique per set).
    /// One transaction per call; the caller batches.
    pub fn insert_files(&self, table_name: &str, rows: &[BackupFile]) -> Result<(), CatalogError> {
        let write_txn = self.db.begin_write()?;
        {
            let definition = TableDefinition::<&str, &[u8]>::new(table_name);
            let mut table = write_txn.open_table(definition)?;
            for row in rows {
                let bytes = encode(row);
                table.insert(row.file_path.as_str(), bytes.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn list_files(&self, table_name: &str) -> Result<Vec<BackupFile>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let definition = TableDefinition::<&str, &[u8]>::new(table_name);
        let table = match read_txn.open_table(definition) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut rows = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            rows.push(decode(value.value())?);
        }
        Ok(rows)
    }

    pub fn count_files(&self, table_name: &str) -> Result<u64, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let definition = TableDefinition::<&str, &[u8]>::new(table_name);
        let table = match read_txn.open_table(definition) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut count = 0u64;
        for entry in table.iter()? {
            entry?;
            count += 1;
        }
        Ok(count)
    }
}
