// ==============================================================================
// metadata/mod.rs - Metadata Store
// ==============================================================================
// Description: Durable study, file, sample and task records; the single source
//              of truth for what has been loaded
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================
// Concurrency:
//   Every record carries a version. Updates read the record, apply a closure
//   and write back only if the version is unchanged, retrying on conflict.
//   Several processes may open the same database file.
// ==============================================================================

pub mod records;

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

use crate::audit::{self, AuditEvent, AuditEventType};
use crate::config::StorageConfig;
use crate::error::{LoadError, Result};
use crate::models::{
    FileId, FileMetadata, SampleId, SampleMetadata, StudyId, StudyMetadata, TaskId,
    TaskMetadata, TaskStatus, TaskType,
};

pub use records::{Record, Versioned};

/// Study, file, sample and task records backed by SQLite
pub struct MetadataStore {
    conn: Mutex<Connection>,
    max_retries: usize,
}

impl MetadataStore {
    /// Open (or create) the store at `path`
    pub fn open(path: impl AsRef<Path>, config: &StorageConfig) -> Result<Self> {
        let path = path.as_ref();
        debug!("Opening metadata store at {}", path.display());
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        Self::init(conn, config.max_update_retries)
    }

    /// Private in-memory store, mostly for unit tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, StorageConfig::default().max_update_retries)
    }

    fn init(conn: Connection, max_retries: usize) -> Result<Self> {
        records::create_table(&conn)?;
        audit::create_table(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            max_retries,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| LoadError::Config("metadata connection lock poisoned".to_string()))
    }

    // --------------------------------------------------------------------------
    // Generic record access
    // --------------------------------------------------------------------------

    pub fn get_versioned<T: Record>(&self, namespace: StudyId, id: u32) -> Result<Versioned<T>> {
        let conn = self.conn()?;
        records::get::<T>(&conn, namespace, id)?
            .ok_or_else(|| LoadError::not_found(T::KIND, id))
    }

    /// Single compare-and-swap; fails if the record changed since it was read
    pub fn replace<T: Record>(&self, versioned: Versioned<T>) -> Result<Versioned<T>> {
        let conn = self.conn()?;
        match records::compare_and_swap(&conn, &versioned)? {
            Some(version) => Ok(Versioned {
                version,
                value: versioned.value,
            }),
            None => Err(LoadError::ConcurrentModification {
                kind: T::KIND,
                id: versioned.value.id(),
                attempts: 1,
            }),
        }
    }

    /// Atomic read-modify-write of one record.
    ///
    /// The closure may run more than once when a concurrent writer wins the
    /// race; it must only depend on the record it is given.
    pub fn update<T, F>(&self, namespace: StudyId, id: u32, mut apply: F) -> Result<T>
    where
        T: Record,
        F: FnMut(&mut T) -> Result<()>,
    {
        for attempt in 1..=self.max_retries {
            let mut current = self.get_versioned::<T>(namespace, id)?;
            apply(&mut current.value)?;

            let swapped = {
                let conn = self.conn()?;
                records::compare_and_swap(&conn, &current)?
            };
            if swapped.is_some() {
                return Ok(current.value);
            }

            debug!("{} {} changed concurrently, retry {}", T::KIND, id, attempt);
            std::thread::sleep(Duration::from_millis(2 * attempt as u64));
        }

        Err(LoadError::ConcurrentModification {
            kind: T::KIND,
            id,
            attempts: self.max_retries,
        })
    }

    fn insert_unique<T, F>(&self, namespace: StudyId, name: &str, build: F) -> Result<T>
    where
        T: Record,
        F: Fn(u32) -> T,
    {
        for _ in 0..self.max_retries {
            let mut conn = self.conn()?;
            if let Some(existing) = records::get_by_name::<T>(&conn, namespace, name)? {
                return Ok(existing.value);
            }
            if let Some(created) = records::insert_next(&mut conn, namespace, &build)? {
                return Ok(created.value);
            }
        }
        Err(LoadError::ConcurrentModification {
            kind: T::KIND,
            id: 0,
            attempts: self.max_retries,
        })
    }

    // --------------------------------------------------------------------------
    // Studies
    // --------------------------------------------------------------------------

    pub fn get_or_create_study(&self, name: &str) -> Result<StudyMetadata> {
        match self.study_by_name(name)? {
            Some(study) => Ok(study),
            None => self.create_study(name),
        }
    }

    /// Create a study; fails when the name is taken
    pub fn create_study(&self, name: &str) -> Result<StudyMetadata> {
        if self.study_by_name(name)?.is_some() {
            return Err(LoadError::Config(format!("Study '{}' already exists", name)));
        }
        let study = self.insert_unique(0, name, |id| StudyMetadata::new(id, name))?;
        info!("Created study '{}' (id={})", study.name, study.id);
        self.log_event(AuditEvent::new(
            AuditEventType::StudyCreated,
            Some(study.id),
            Some(study.name.clone()),
            serde_json::json!({ "name": study.name }),
        ))?;
        Ok(study)
    }

    pub fn study(&self, id: StudyId) -> Result<StudyMetadata> {
        Ok(self.get_versioned::<StudyMetadata>(0, id)?.value)
    }

    pub fn study_by_name(&self, name: &str) -> Result<Option<StudyMetadata>> {
        let conn = self.conn()?;
        Ok(records::get_by_name::<StudyMetadata>(&conn, 0, name)?.map(|v| v.value))
    }

    /// Study by name, failing with `NotFound` when missing
    pub fn require_study(&self, name: &str) -> Result<StudyMetadata> {
        self.study_by_name(name)?
            .ok_or_else(|| LoadError::not_found("study", name))
    }

    pub fn studies(&self) -> Result<Vec<StudyMetadata>> {
        let conn = self.conn()?;
        records::list(&conn, 0)
    }

    pub fn update_study<F>(&self, id: StudyId, apply: F) -> Result<StudyMetadata>
    where
        F: FnMut(&mut StudyMetadata) -> Result<()>,
    {
        self.update(0, id, apply)
    }

    // --------------------------------------------------------------------------
    // Files
    // --------------------------------------------------------------------------

    /// Register a file and its samples, or return the existing registration.
    ///
    /// Fails when the file is already loaded, is INVALID, or is known under a
    /// different path while not in status NONE.
    pub fn register_file(
        &self,
        study_id: StudyId,
        name: &str,
        path: &str,
        sample_names: &[String],
    ) -> Result<FileMetadata> {
        if let Some(existing) = self.file_by_name(study_id, name)? {
            match existing.index_status {
                TaskStatus::Ready => return Err(LoadError::already_loaded(existing.file_ref())),
                TaskStatus::Invalid => {
                    return Err(LoadError::invalid_file_status(
                        existing.file_ref(),
                        existing.index_status,
                    ))
                }
                _ => {}
            }
            if existing.path == path {
                return Ok(existing);
            }
            if existing.index_status != TaskStatus::None {
                return Err(LoadError::InvalidFileStatus {
                    file: existing.file_ref(),
                    status: existing.index_status,
                    message: format!(
                        "File {} already registered with path '{}' in status \"{}\"; \
                         can not register it again from '{}'",
                        existing.file_ref(),
                        existing.path,
                        existing.index_status,
                        path
                    ),
                });
            }
            debug!("Replacing path of file {} with '{}'", existing.file_ref(), path);
            let new_path = path.to_string();
            return self.update_file(study_id, existing.id, |file| {
                file.path = new_path.clone();
                Ok(())
            });
        }

        let mut sample_ids = Vec::with_capacity(sample_names.len());
        for sample_name in sample_names {
            sample_ids.push(self.register_sample(study_id, sample_name)?.id);
        }

        let file = self.insert_unique(study_id, name, |id| FileMetadata {
            id,
            study_id,
            name: name.to_string(),
            path: path.to_string(),
            samples: sample_ids.clone(),
            index_status: TaskStatus::None,
            split_data: Default::default(),
            attributes: Default::default(),
        })?;

        info!(
            "Registered file {} with {} samples",
            file.file_ref(),
            file.samples.len()
        );
        self.log_event(AuditEvent::new(
            AuditEventType::FileRegistered,
            Some(study_id),
            Some(file.name.clone()),
            serde_json::json!({ "file_id": file.id, "path": file.path, "samples": sample_names }),
        ))?;
        Ok(file)
    }

    pub fn file(&self, study_id: StudyId, id: FileId) -> Result<FileMetadata> {
        Ok(self.get_versioned::<FileMetadata>(study_id, id)?.value)
    }

    pub fn file_by_name(&self, study_id: StudyId, name: &str) -> Result<Option<FileMetadata>> {
        let conn = self.conn()?;
        Ok(records::get_by_name::<FileMetadata>(&conn, study_id, name)?.map(|v| v.value))
    }

    /// File by name, failing with `NotFound` when missing
    pub fn require_file(&self, study_id: StudyId, name: &str) -> Result<FileMetadata> {
        self.file_by_name(study_id, name)?
            .ok_or_else(|| LoadError::not_found("file", name))
    }

    pub fn files(&self, study_id: StudyId) -> Result<Vec<FileMetadata>> {
        let conn = self.conn()?;
        records::list(&conn, study_id)
    }

    /// Files whose index status is READY
    pub fn indexed_files(&self, study_id: StudyId) -> Result<Vec<FileMetadata>> {
        Ok(self
            .files(study_id)?
            .into_iter()
            .filter(|f| f.is_indexed())
            .collect())
    }

    pub fn update_file<F>(&self, study_id: StudyId, id: FileId, apply: F) -> Result<FileMetadata>
    where
        F: FnMut(&mut FileMetadata) -> Result<()>,
    {
        self.update(study_id, id, apply)
    }

    // --------------------------------------------------------------------------
    // Samples
    // --------------------------------------------------------------------------

    pub fn register_sample(&self, study_id: StudyId, name: &str) -> Result<SampleMetadata> {
        self.insert_unique(study_id, name, |id| SampleMetadata::new(study_id, id, name))
    }

    pub fn sample(&self, study_id: StudyId, id: SampleId) -> Result<SampleMetadata> {
        Ok(self.get_versioned::<SampleMetadata>(study_id, id)?.value)
    }

    pub fn sample_by_name(&self, study_id: StudyId, name: &str) -> Result<Option<SampleMetadata>> {
        let conn = self.conn()?;
        Ok(records::get_by_name::<SampleMetadata>(&conn, study_id, name)?.map(|v| v.value))
    }

    pub fn require_sample(&self, study_id: StudyId, name: &str) -> Result<SampleMetadata> {
        self.sample_by_name(study_id, name)?
            .ok_or_else(|| LoadError::not_found("sample", name))
    }

    pub fn samples(&self, study_id: StudyId) -> Result<Vec<SampleMetadata>> {
        let conn = self.conn()?;
        records::list(&conn, study_id)
    }

    /// Samples present in at least one READY file
    pub fn indexed_samples(&self, study_id: StudyId) -> Result<Vec<SampleMetadata>> {
        Ok(self
            .samples(study_id)?
            .into_iter()
            .filter(|s| s.is_indexed())
            .collect())
    }

    /// READY files containing the sample
    pub fn sample_files(&self, study_id: StudyId, sample_id: SampleId) -> Result<Vec<FileMetadata>> {
        Ok(self
            .indexed_files(study_id)?
            .into_iter()
            .filter(|f| f.samples.contains(&sample_id))
            .collect())
    }

    pub fn update_sample<F>(&self, study_id: StudyId, id: SampleId, apply: F) -> Result<SampleMetadata>
    where
        F: FnMut(&mut SampleMetadata) -> Result<()>,
    {
        self.update(study_id, id, apply)
    }

    // --------------------------------------------------------------------------
    // Tasks
    // --------------------------------------------------------------------------

    /// Create a task; `init` sets its initial status history
    pub fn create_task<F>(
        &self,
        study_id: StudyId,
        task_type: TaskType,
        file_ids: &[FileId],
        init: F,
    ) -> Result<TaskMetadata>
    where
        F: Fn(&mut TaskMetadata),
    {
        let mut conn = self.conn()?;
        let created = records::insert_next(&mut conn, study_id, |id| {
            let mut task = TaskMetadata::new(study_id, id, task_type, file_ids.to_vec());
            init(&mut task);
            task
        })?;
        created
            .map(|v| v.value)
            .ok_or_else(|| LoadError::ConcurrentModification {
                kind: "task",
                id: 0,
                attempts: 1,
            })
    }

    pub fn task(&self, study_id: StudyId, id: TaskId) -> Result<TaskMetadata> {
        Ok(self.get_versioned::<TaskMetadata>(study_id, id)?.value)
    }

    pub fn tasks(&self, study_id: StudyId) -> Result<Vec<TaskMetadata>> {
        let conn = self.conn()?;
        records::list(&conn, study_id)
    }

    /// Tasks whose current status is RUNNING or DONE
    pub fn active_tasks(&self, study_id: StudyId) -> Result<Vec<TaskMetadata>> {
        Ok(self
            .tasks(study_id)?
            .into_iter()
            .filter(|t| t.current_status().is_active())
            .collect())
    }

    pub fn update_task<F>(&self, study_id: StudyId, id: TaskId, apply: F) -> Result<TaskMetadata>
    where
        F: FnMut(&mut TaskMetadata) -> Result<()>,
    {
        self.update(study_id, id, apply)
    }

    // --------------------------------------------------------------------------
    // Operation log
    // --------------------------------------------------------------------------

    pub fn log_event(&self, event: AuditEvent) -> Result<i64> {
        let conn = self.conn()?;
        Ok(event.log(&conn)?)
    }

    pub fn events(&self, study_id: StudyId) -> Result<Vec<AuditEvent>> {
        let conn = self.conn()?;
        Ok(audit::study_events(&conn, study_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::tempdir;

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_register_file_creates_samples_once() {
        let store = MetadataStore::open_in_memory().unwrap();
        let study = store.get_or_create_study("1kg").unwrap();

        let f1 = store
            .register_file(study.id, "chr20.vcf", "/in/chr20.vcf", &names(&["A", "B"]))
            .unwrap();
        let f2 = store
            .register_file(study.id, "chr21.vcf", "/in/chr21.vcf", &names(&["B", "C"]))
            .unwrap();

        assert_eq!(f1.id, 1);
        assert_eq!(f2.id, 2);
        assert_eq!(f1.samples, vec![1, 2]);
        assert_eq!(f2.samples, vec![2, 3]);
        assert_eq!(store.samples(study.id).unwrap().len(), 3);

        // Same name and path is idempotent
        let again = store
            .register_file(study.id, "chr20.vcf", "/in/chr20.vcf", &names(&["A", "B"]))
            .unwrap();
        assert_eq!(again.id, f1.id);
    }

    #[test]
    fn test_register_file_path_rules() {
        let store = MetadataStore::open_in_memory().unwrap();
        let study = store.get_or_create_study("s").unwrap();
        let file = store
            .register_file(study.id, "a.vcf", "/old/a.vcf", &names(&["A"]))
            .unwrap();

        // NONE: path replaced
        let moved = store
            .register_file(study.id, "a.vcf", "/new/a.vcf", &names(&["A"]))
            .unwrap();
        assert_eq!(moved.path, "/new/a.vcf");

        // READY: already loaded
        store
            .update_file(study.id, file.id, |f| {
                f.index_status = TaskStatus::Ready;
                Ok(())
            })
            .unwrap();
        let err = store
            .register_file(study.id, "a.vcf", "/new/a.vcf", &names(&["A"]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFileStatus);

        // ERROR with another path is rejected
        store
            .update_file(study.id, file.id, |f| {
                f.index_status = TaskStatus::Error;
                Ok(())
            })
            .unwrap();
        assert!(store
            .register_file(study.id, "a.vcf", "/other/a.vcf", &names(&["A"]))
            .is_err());
    }

    #[test]
    fn test_compare_and_swap_detects_stale_version() {
        let store = MetadataStore::open_in_memory().unwrap();
        let study = store.get_or_create_study("s").unwrap();
        let sample = store.register_sample(study.id, "NA19600").unwrap();

        let first = store.get_versioned::<SampleMetadata>(study.id, sample.id).unwrap();
        let stale = first.clone();

        let mut updated = first;
        updated.value.index_status = TaskStatus::Running;
        store.replace(updated).unwrap();

        let err = store.replace(stale).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConcurrentModification);
        assert_eq!(
            store.sample(study.id, sample.id).unwrap().index_status,
            TaskStatus::Running
        );
    }

    #[test]
    fn test_concurrent_updates_do_not_lose_writes() {
        let dir = tempdir().unwrap();
        let config = StorageConfig::for_dir(dir.path());
        let path = dir.path().join("metadata.db");
        let store = MetadataStore::open(&path, &config).unwrap();
        let study = store.get_or_create_study("s").unwrap();
        store.register_sample(study.id, "A").unwrap();

        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let path = path.clone();
                let config = config.clone();
                std::thread::spawn(move || {
                    let store = MetadataStore::open(&path, &config).unwrap();
                    for i in 0..10 {
                        store
                            .update_sample(1, 1, |s| {
                                s.files.push(worker * 100 + i);
                                Ok(())
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.sample(study.id, 1).unwrap().files.len(), 40);
    }

    #[test]
    fn test_missing_records_are_not_found() {
        let store = MetadataStore::open_in_memory().unwrap();
        let err = store.file(1, 42).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(store.require_study("nope").is_err());
    }

    #[test]
    fn test_create_study_rejects_taken_name() {
        let store = MetadataStore::open_in_memory().unwrap();
        let first = store.create_study("s").unwrap();
        assert!(store.create_study("s").is_err());
        assert_eq!(store.get_or_create_study("s").unwrap().id, first.id);
        assert_eq!(store.create_study("t").unwrap().id, first.id + 1);
    }

    #[test]
    fn test_task_listing_and_active_filter() {
        let store = MetadataStore::open_in_memory().unwrap();
        let study = store.get_or_create_study("s").unwrap();
        let running = store
            .create_task(study.id, TaskType::Load, &[1], |t| t.push_status(TaskStatus::Running))
            .unwrap();
        store
            .create_task(study.id, TaskType::Load, &[2], |t| {
                t.push_status(TaskStatus::Running);
                t.push_status(TaskStatus::Ready);
            })
            .unwrap();

        let active = store.active_tasks(study.id).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, running.id);
        assert_eq!(store.tasks(study.id).unwrap().len(), 2);
    }
}
