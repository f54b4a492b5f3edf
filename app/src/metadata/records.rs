// ==============================================================================
// metadata/records.rs - Versioned Record Table
// ==============================================================================
// Description: Generic JSON record storage with a version column used for
//              compare-and-swap updates
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================

use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;
use crate::models::{FileMetadata, SampleMetadata, StudyId, StudyMetadata, TaskMetadata};

/// A metadata record stored in the `records` table
pub trait Record: Serialize + DeserializeOwned {
    const KIND: &'static str;

    /// Namespace of the record; studies live in namespace 0
    fn namespace(&self) -> StudyId;

    fn id(&self) -> u32;

    /// Unique name inside the namespace, if the kind has one
    fn unique_name(&self) -> Option<&str>;
}

impl Record for StudyMetadata {
    const KIND: &'static str = "study";

    fn namespace(&self) -> StudyId {
        0
    }

    fn id(&self) -> u32 {
        self.id
    }

    fn unique_name(&self) -> Option<&str> {
        Some(&self.name)
    }
}

impl Record for FileMetadata {
    const KIND: &'static str = "file";

    fn namespace(&self) -> StudyId {
        self.study_id
    }

    fn id(&self) -> u32 {
        self.id
    }

    fn unique_name(&self) -> Option<&str> {
        Some(&self.name)
    }
}

impl Record for SampleMetadata {
    const KIND: &'static str = "sample";

    fn namespace(&self) -> StudyId {
        self.study_id
    }

    fn id(&self) -> u32 {
        self.id
    }

    fn unique_name(&self) -> Option<&str> {
        Some(&self.name)
    }
}

impl Record for TaskMetadata {
    const KIND: &'static str = "task";

    fn namespace(&self) -> StudyId {
        self.study_id
    }

    fn id(&self) -> u32 {
        self.id
    }

    fn unique_name(&self) -> Option<&str> {
        None
    }
}

/// A record together with the version it was read at
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub version: i64,
    pub value: T,
}

pub fn create_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS records (
            kind TEXT NOT NULL,
            namespace INTEGER NOT NULL,
            id INTEGER NOT NULL,
            name TEXT,
            version INTEGER NOT NULL,
            body TEXT NOT NULL,
            PRIMARY KEY (kind, namespace, id)
        );
        CREATE UNIQUE INDEX IF NOT EXISTS records_by_name ON records (kind, namespace, name);",
    )
}

pub fn get<T: Record>(conn: &Connection, namespace: StudyId, id: u32) -> Result<Option<Versioned<T>>> {
    let row: Option<(i64, String)> = conn
        .query_row(
            "SELECT version, body FROM records WHERE kind = ?1 AND namespace = ?2 AND id = ?3",
            params![T::KIND, namespace, id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    decode(row)
}

pub fn get_by_name<T: Record>(
    conn: &Connection,
    namespace: StudyId,
    name: &str,
) -> Result<Option<Versioned<T>>> {
    let row: Option<(i64, String)> = conn
        .query_row(
            "SELECT version, body FROM records WHERE kind = ?1 AND namespace = ?2 AND name = ?3",
            params![T::KIND, namespace, name],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    decode(row)
}

/// All records of a kind in one namespace, ordered by id
pub fn list<T: Record>(conn: &Connection, namespace: StudyId) -> Result<Vec<T>> {
    let mut stmt = conn.prepare(
        "SELECT body FROM records WHERE kind = ?1 AND namespace = ?2 ORDER BY id",
    )?;
    let bodies = stmt
        .query_map(params![T::KIND, namespace], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;

    let mut records = Vec::with_capacity(bodies.len());
    for body in bodies {
        records.push(serde_json::from_str(&body)?);
    }
    Ok(records)
}

/// Insert a record with the next free id in its namespace.
///
/// Returns `Ok(None)` when another writer inserted the same unique name first.
pub fn insert_next<T, F>(
    conn: &mut Connection,
    namespace: StudyId,
    build: F,
) -> Result<Option<Versioned<T>>>
where
    T: Record,
    F: FnOnce(u32) -> T,
{
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let next_id: u32 = tx.query_row(
        "SELECT COALESCE(MAX(id), 0) + 1 FROM records WHERE kind = ?1 AND namespace = ?2",
        params![T::KIND, namespace],
        |row| row.get(0),
    )?;

    let value = build(next_id);
    let body = serde_json::to_string(&value)?;
    let inserted = tx.execute(
        "INSERT INTO records (kind, namespace, id, name, version, body) VALUES (?1, ?2, ?3, ?4, 1, ?5)",
        params![T::KIND, namespace, value.id(), value.unique_name(), body],
    );

    match inserted {
        Ok(_) => {
            tx.commit()?;
            Ok(Some(Versioned { version: 1, value }))
        }
        Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// Write `versioned.value` if the stored version still matches.
///
/// Returns the new version, or `None` when the record changed underneath.
pub fn compare_and_swap<T: Record>(conn: &Connection, versioned: &Versioned<T>) -> Result<Option<i64>> {
    let body = serde_json::to_string(&versioned.value)?;
    let changed = conn.execute(
        "UPDATE records SET body = ?1, name = ?2, version = version + 1
         WHERE kind = ?3 AND namespace = ?4 AND id = ?5 AND version = ?6",
        params![
            body,
            versioned.value.unique_name(),
            T::KIND,
            versioned.value.namespace(),
            versioned.value.id(),
            versioned.version,
        ],
    )?;

    Ok((changed == 1).then_some(versioned.version + 1))
}

fn decode<T: Record>(row: Option<(i64, String)>) -> Result<Option<Versioned<T>>> {
    match row {
        Some((version, body)) => Ok(Some(Versioned {
            version,
            value: serde_json::from_str(&body)?,
        })),
        None => Ok(None),
    }
}
