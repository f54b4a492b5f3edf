// ==============================================================================
// backend.rs - Variant Storage Backend
// ==============================================================================
// Description: Physical storage for merged variants, archive slices, sample
//              index entries, annotations and cohort statistics
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================
// The engine only issues logical put/scan/delete calls against this module.
// Merged variants of one chromosome are rewritten inside a single IMMEDIATE
// transaction, which is the atomic per-row read-modify-write the merge needs.
// ==============================================================================

use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

use crate::annotation::VariantAnnotation;
use crate::config::StorageConfig;
use crate::error::{LoadError, Result};
use crate::models::{ArchiveSlice, FileId, MergedVariant, SampleId, StudyId, VariantKey};
use crate::stats::VariantStats;

/// Merged variants of one chromosome, keyed and ordered by variant
pub type ChromosomeVariants = BTreeMap<VariantKey, MergedVariant>;

/// One serialized row of a per-sample secondary index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRow {
    pub chromosome: String,
    pub batch_start: u64,
    pub body: Vec<u8>,
}

pub struct VariantBackend {
    conn: Mutex<Connection>,
    max_retries: usize,
}

impl VariantBackend {
    pub fn open(path: impl AsRef<Path>, config: &StorageConfig) -> Result<Self> {
        let path = path.as_ref();
        debug!("Opening variant backend at {}", path.display());
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        Self::init(conn, config.max_backend_retries)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, StorageConfig::default().max_backend_retries)
    }

    fn init(conn: Connection, max_retries: usize) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS variants (
                study_id INTEGER NOT NULL,
                chromosome TEXT NOT NULL,
                position INTEGER NOT NULL,
                reference TEXT NOT NULL,
                alternate TEXT NOT NULL,
                body TEXT NOT NULL,
                PRIMARY KEY (study_id, chromosome, position, reference, alternate)
            );
            CREATE TABLE IF NOT EXISTS archive (
                study_id INTEGER NOT NULL,
                file_batch INTEGER NOT NULL,
                chromosome TEXT NOT NULL,
                position_block INTEGER NOT NULL,
                file_id INTEGER NOT NULL,
                body TEXT NOT NULL,
                PRIMARY KEY (study_id, file_batch, chromosome, position_block, file_id)
            );
            CREATE TABLE IF NOT EXISTS sample_index (
                study_id INTEGER NOT NULL,
                sample_id INTEGER NOT NULL,
                version INTEGER NOT NULL,
                chromosome TEXT NOT NULL,
                batch_start INTEGER NOT NULL,
                body BLOB NOT NULL,
                PRIMARY KEY (study_id, sample_id, version, chromosome, batch_start)
            );
            CREATE TABLE IF NOT EXISTS sample_index_annotation (
                study_id INTEGER NOT NULL,
                sample_id INTEGER NOT NULL,
                version INTEGER NOT NULL,
                chromosome TEXT NOT NULL,
                batch_start INTEGER NOT NULL,
                body BLOB NOT NULL,
                PRIMARY KEY (study_id, sample_id, version, chromosome, batch_start)
            );
            CREATE TABLE IF NOT EXISTS annotations (
                study_id INTEGER NOT NULL,
                chromosome TEXT NOT NULL,
                position INTEGER NOT NULL,
                reference TEXT NOT NULL,
                alternate TEXT NOT NULL,
                body TEXT NOT NULL,
                PRIMARY KEY (study_id, chromosome, position, reference, alternate)
            );
            CREATE TABLE IF NOT EXISTS variant_stats (
                study_id INTEGER NOT NULL,
                cohort TEXT NOT NULL,
                chromosome TEXT NOT NULL,
                position INTEGER NOT NULL,
                reference TEXT NOT NULL,
                alternate TEXT NOT NULL,
                body TEXT NOT NULL,
                PRIMARY KEY (study_id, cohort, chromosome, position, reference, alternate)
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            max_retries,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| LoadError::Config("backend connection lock poisoned".to_string()))
    }

    /// Run `op`, retrying when SQLite reports a busy or locked database
    fn with_retry<R, F>(&self, mut op: F) -> Result<R>
    where
        F: FnMut(&mut Connection) -> Result<R>,
    {
        let mut attempt = 1;
        loop {
            let outcome = {
                let mut conn = self.conn()?;
                op(&mut conn)
            };
            match outcome {
                Err(e) if is_busy(&e) && attempt < self.max_retries => {
                    warn!("Backend busy (attempt {}/{}): {}", attempt, self.max_retries, e);
                    std::thread::sleep(Duration::from_millis(50 * attempt as u64));
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    // --------------------------------------------------------------------------
    // Merged variants
    // --------------------------------------------------------------------------

    /// Chromosomes holding at least one merged variant
    pub fn chromosomes(&self, study_id: StudyId) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT chromosome FROM variants WHERE study_id = ?1 ORDER BY chromosome",
        )?;
        let chromosomes = stmt
            .query_map(params![study_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(chromosomes)
    }

    /// Merged variants ordered by chromosome, position and alleles
    pub fn scan_variants(&self, study_id: StudyId, chromosome: Option<&str>) -> Result<Vec<MergedVariant>> {
        let conn = self.conn()?;
        let bodies: Vec<String> = match chromosome {
            Some(chromosome) => {
                let mut stmt = conn.prepare(
                    "SELECT body FROM variants WHERE study_id = ?1 AND chromosome = ?2
                     ORDER BY position, reference, alternate",
                )?;
                let rows = stmt
                    .query_map(params![study_id, chromosome], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT body FROM variants WHERE study_id = ?1
                     ORDER BY chromosome, position, reference, alternate",
                )?;
                let rows = stmt
                    .query_map(params![study_id], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                rows
            }
        };

        let mut variants = Vec::with_capacity(bodies.len());
        for body in bodies {
            variants.push(serde_json::from_str(&body)?);
        }
        Ok(variants)
    }

    pub fn variant(&self, study_id: StudyId, key: &VariantKey) -> Result<Option<MergedVariant>> {
        let conn = self.conn()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM variants WHERE study_id = ?1 AND chromosome = ?2
                 AND position = ?3 AND reference = ?4 AND alternate = ?5",
                params![study_id, key.chromosome, key.position, key.reference, key.alternate],
                |row| row.get(0),
            )
            .optional()?;
        match body {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    pub fn count_variants(&self, study_id: StudyId) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM variants WHERE study_id = ?1",
            params![study_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Atomically rewrite the merged variants of one chromosome.
    ///
    /// `apply` receives every stored variant of the chromosome. Changed
    /// entries are written back, removed entries are deleted, all in one
    /// transaction. Retries re-run `apply` on freshly read data.
    pub fn modify_chromosome<R, F>(&self, study_id: StudyId, chromosome: &str, mut apply: F) -> Result<R>
    where
        F: FnMut(&mut ChromosomeVariants) -> Result<R>,
    {
        self.with_retry(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let before = load_chromosome(&tx, study_id, chromosome)?;
            let mut after = before.clone();
            let result = apply(&mut after)?;

            let mut written = 0usize;
            let mut deleted = 0usize;
            {
                let mut delete = tx.prepare_cached(
                    "DELETE FROM variants WHERE study_id = ?1 AND chromosome = ?2
                     AND position = ?3 AND reference = ?4 AND alternate = ?5",
                )?;
                for key in before.keys().filter(|k| !after.contains_key(*k)) {
                    delete.execute(params![
                        study_id,
                        key.chromosome,
                        key.position,
                        key.reference,
                        key.alternate
                    ])?;
                    deleted += 1;
                }

                let mut upsert = tx.prepare_cached(
                    "INSERT OR REPLACE INTO variants (study_id, chromosome, position, reference, alternate, body)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for (key, variant) in &after {
                    if before.get(key) == Some(variant) {
                        continue;
                    }
                    upsert.execute(params![
                        study_id,
                        key.chromosome,
                        key.position,
                        key.reference,
                        key.alternate,
                        serde_json::to_string(variant)?,
                    ])?;
                    written += 1;
                }
            }
            tx.commit()?;
            debug!(
                "Chromosome {}: {} variants written, {} deleted",
                chromosome, written, deleted
            );
            Ok(result)
        })
    }

    // --------------------------------------------------------------------------
    // Archive slices
    // --------------------------------------------------------------------------

    pub fn put_archive_slices(&self, study_id: StudyId, slices: &[ArchiveSlice]) -> Result<()> {
        self.with_retry(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT OR REPLACE INTO archive (study_id, file_batch, chromosome, position_block, file_id, body)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for slice in slices {
                    stmt.execute(params![
                        study_id,
                        slice.file_batch,
                        slice.chromosome,
                        slice.position_block,
                        slice.file_id,
                        serde_json::to_string(slice)?,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Archive slices of one file, ordered by chromosome and block
    pub fn archive_slices(&self, study_id: StudyId, file_id: FileId) -> Result<Vec<ArchiveSlice>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT body FROM archive WHERE study_id = ?1 AND file_id = ?2
             ORDER BY chromosome, position_block",
        )?;
        let bodies = stmt
            .query_map(params![study_id, file_id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        let mut slices = Vec::with_capacity(bodies.len());
        for body in bodies {
            slices.push(serde_json::from_str(&body)?);
        }
        Ok(slices)
    }

    /// Archive slices of every file on one chromosome, ordered by file and block
    pub fn chromosome_archive_slices(&self, study_id: StudyId, chromosome: &str) -> Result<Vec<ArchiveSlice>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT body FROM archive WHERE study_id = ?1 AND chromosome = ?2
             ORDER BY file_id, position_block",
        )?;
        let bodies = stmt
            .query_map(params![study_id, chromosome], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        let mut slices = Vec::with_capacity(bodies.len());
        for body in bodies {
            slices.push(serde_json::from_str(&body)?);
        }
        Ok(slices)
    }

    pub fn delete_archive(&self, study_id: StudyId, file_id: FileId) -> Result<usize> {
        self.with_retry(|conn| {
            Ok(conn.execute(
                "DELETE FROM archive WHERE study_id = ?1 AND file_id = ?2",
                params![study_id, file_id],
            )?)
        })
    }

    // --------------------------------------------------------------------------
    // Sample index
    // --------------------------------------------------------------------------

    /// Replace every index row of a sample for one schema version
    pub fn replace_sample_index(
        &self,
        study_id: StudyId,
        sample_id: SampleId,
        version: u32,
        rows: &[IndexRow],
    ) -> Result<()> {
        self.replace_index_rows("sample_index", study_id, sample_id, version, rows)
    }

    pub fn sample_index_rows(&self, study_id: StudyId, sample_id: SampleId, version: u32) -> Result<Vec<IndexRow>> {
        self.index_rows("sample_index", study_id, sample_id, version)
    }

    pub fn delete_sample_index(&self, study_id: StudyId, sample_id: SampleId) -> Result<usize> {
        self.with_retry(|conn| {
            let tx = conn.transaction()?;
            let mut removed = tx.execute(
                "DELETE FROM sample_index WHERE study_id = ?1 AND sample_id = ?2",
                params![study_id, sample_id],
            )?;
            removed += tx.execute(
                "DELETE FROM sample_index_annotation WHERE study_id = ?1 AND sample_id = ?2",
                params![study_id, sample_id],
            )?;
            tx.commit()?;
            Ok(removed)
        })
    }

    pub fn replace_sample_index_annotation(
        &self,
        study_id: StudyId,
        sample_id: SampleId,
        version: u32,
        rows: &[IndexRow],
    ) -> Result<()> {
        self.replace_index_rows("sample_index_annotation", study_id, sample_id, version, rows)
    }

    pub fn sample_index_annotation_rows(
        &self,
        study_id: StudyId,
        sample_id: SampleId,
        version: u32,
    ) -> Result<Vec<IndexRow>> {
        self.index_rows("sample_index_annotation", study_id, sample_id, version)
    }

    fn replace_index_rows(
        &self,
        table: &'static str,
        study_id: StudyId,
        sample_id: SampleId,
        version: u32,
        rows: &[IndexRow],
    ) -> Result<()> {
        self.with_retry(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                &format!(
                    "DELETE FROM {} WHERE study_id = ?1 AND sample_id = ?2 AND version = ?3",
                    table
                ),
                params![study_id, sample_id, version],
            )?;
            {
                let mut stmt = tx.prepare(&format!(
                    "INSERT INTO {} (study_id, sample_id, version, chromosome, batch_start, body)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    table
                ))?;
                for row in rows {
                    stmt.execute(params![
                        study_id,
                        sample_id,
                        version,
                        row.chromosome,
                        row.batch_start,
                        row.body
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    fn index_rows(
        &self,
        table: &'static str,
        study_id: StudyId,
        sample_id: SampleId,
        version: u32,
    ) -> Result<Vec<IndexRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT chromosome, batch_start, body FROM {}
             WHERE study_id = ?1 AND sample_id = ?2 AND version = ?3
             ORDER BY chromosome, batch_start",
            table
        ))?;
        let rows = stmt
            .query_map(params![study_id, sample_id, version], |row| {
                Ok(IndexRow {
                    chromosome: row.get(0)?,
                    batch_start: row.get(1)?,
                    body: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<IndexRow>>>()?;
        Ok(rows)
    }

    // --------------------------------------------------------------------------
    // Annotations
    // --------------------------------------------------------------------------

    pub fn put_annotations(&self, study_id: StudyId, annotations: &[VariantAnnotation]) -> Result<()> {
        self.with_retry(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT OR REPLACE INTO annotations (study_id, chromosome, position, reference, alternate, body)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for annotation in annotations {
                    let key = &annotation.variant;
                    stmt.execute(params![
                        study_id,
                        key.chromosome,
                        key.position,
                        key.reference,
                        key.alternate,
                        serde_json::to_string(annotation)?,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn annotations(&self, study_id: StudyId) -> Result<BTreeMap<VariantKey, VariantAnnotation>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT body FROM annotations WHERE study_id = ?1 ORDER BY chromosome, position, reference, alternate",
        )?;
        let bodies = stmt
            .query_map(params![study_id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        let mut annotations = BTreeMap::new();
        for body in bodies {
            let annotation: VariantAnnotation = serde_json::from_str(&body)?;
            annotations.insert(annotation.variant.clone(), annotation);
        }
        Ok(annotations)
    }

    pub fn annotated_keys(&self, study_id: StudyId) -> Result<BTreeSet<VariantKey>> {
        Ok(self.annotations(study_id)?.into_keys().collect())
    }

    // --------------------------------------------------------------------------
    // Cohort statistics
    // --------------------------------------------------------------------------

    /// Replace the statistics of a cohort
    pub fn replace_stats(&self, study_id: StudyId, cohort: &str, stats: &[VariantStats]) -> Result<()> {
        self.with_retry(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM variant_stats WHERE study_id = ?1 AND cohort = ?2",
                params![study_id, cohort],
            )?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO variant_stats (study_id, cohort, chromosome, position, reference, alternate, body)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )?;
                for entry in stats {
                    let key = &entry.variant;
                    stmt.execute(params![
                        study_id,
                        cohort,
                        key.chromosome,
                        key.position,
                        key.reference,
                        key.alternate,
                        serde_json::to_string(entry)?,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn stats(&self, study_id: StudyId, cohort: &str) -> Result<Vec<VariantStats>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT body FROM variant_stats WHERE study_id = ?1 AND cohort = ?2
             ORDER BY chromosome, position, reference, alternate",
        )?;
        let bodies = stmt
            .query_map(params![study_id, cohort], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        let mut stats = Vec::with_capacity(bodies.len());
        for body in bodies {
            stats.push(serde_json::from_str(&body)?);
        }
        Ok(stats)
    }
}

fn load_chromosome(conn: &Connection, study_id: StudyId, chromosome: &str) -> Result<ChromosomeVariants> {
    let mut stmt = conn.prepare_cached(
        "SELECT body FROM variants WHERE study_id = ?1 AND chromosome = ?2",
    )?;
    let bodies = stmt
        .query_map(params![study_id, chromosome], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;

    let mut variants = ChromosomeVariants::new();
    for body in bodies {
        let variant: MergedVariant = serde_json::from_str(&body)?;
        variants.insert(variant.key(), variant);
    }
    Ok(variants)
}

fn is_busy(error: &LoadError) -> bool {
    match error {
        LoadError::Backend(rusqlite::Error::SqliteFailure(e, _)) => {
            matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        }
        _ => false,
    }
}
