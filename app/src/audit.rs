// ==============================================================================
// audit.rs - Operation Log
// ==============================================================================
// Description: Append-only audit trail of every load, removal and override,
//              stored next to the metadata records
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::StudyId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    // Registration
    StudyCreated,
    FileRegistered,

    // Operation lifecycle
    OperationStarted,
    OperationResumed,
    OperationDone,
    OperationCompleted,
    OperationFailed,

    // Overrides and repairs
    ForcedOverride,
    FileInvalidated,
    SampleIndexInvalidated,

    // Secondary structures
    SampleIndexBuilt,
    AnnotationCompleted,
    StatsCalculated,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::StudyCreated => "study_created",
            AuditEventType::FileRegistered => "file_registered",
            AuditEventType::OperationStarted => "operation_started",
            AuditEventType::OperationResumed => "operation_resumed",
            AuditEventType::OperationDone => "operation_done",
            AuditEventType::OperationCompleted => "operation_completed",
            AuditEventType::OperationFailed => "operation_failed",
            AuditEventType::ForcedOverride => "forced_override",
            AuditEventType::FileInvalidated => "file_invalidated",
            AuditEventType::SampleIndexInvalidated => "sample_index_invalidated",
            AuditEventType::SampleIndexBuilt => "sample_index_built",
            AuditEventType::AnnotationCompleted => "annotation_completed",
            AuditEventType::StatsCalculated => "stats_calculated",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(raw.to_string())).ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSeverity {
    Info,
    Warning,
    Error,
}

impl LogSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogSeverity::Info => "info",
            LogSeverity::Warning => "warning",
            LogSeverity::Error => "error",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "warning" => LogSeverity::Warning,
            "error" => LogSeverity::Error,
            _ => LogSeverity::Info,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    /// Position in the operation log; assigned on insert
    pub seq: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub study_id: Option<StudyId>,
    pub resource: Option<String>,
    pub details: serde_json::Value,
    pub severity: LogSeverity,
}

impl AuditEvent {
    pub fn new(
        event_type: AuditEventType,
        study_id: Option<StudyId>,
        resource: Option<String>,
        details: serde_json::Value,
    ) -> Self {
        let severity = match event_type {
            AuditEventType::ForcedOverride
            | AuditEventType::SampleIndexInvalidated => LogSeverity::Warning,

            AuditEventType::OperationFailed
            | AuditEventType::FileInvalidated => LogSeverity::Error,

            _ => LogSeverity::Info,
        };

        Self {
            id: Uuid::new_v4(),
            seq: None,
            timestamp: Utc::now(),
            event_type,
            study_id,
            resource,
            details,
            severity,
        }
    }

    /// Append the event; returns its sequence number
    pub fn log(&self, conn: &Connection) -> rusqlite::Result<i64> {
        conn.execute(
            "INSERT INTO operation_log (
                event_id, timestamp, study_id, event_type, resource, severity, details
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                self.id.to_string(),
                self.timestamp.to_rfc3339(),
                self.study_id,
                self.event_type.as_str(),
                self.resource,
                self.severity.as_str(),
                self.details.to_string(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }
}

pub fn create_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS operation_log (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            study_id INTEGER,
            event_type TEXT NOT NULL,
            resource TEXT,
            severity TEXT NOT NULL,
            details TEXT NOT NULL
        )",
        [],
    )?;
    Ok(())
}

/// Events of one study in log order
pub fn study_events(conn: &Connection, study_id: StudyId) -> rusqlite::Result<Vec<AuditEvent>> {
    let mut stmt = conn.prepare(
        "SELECT seq, event_id, timestamp, event_type, resource, severity, details
         FROM operation_log WHERE study_id = ?1 ORDER BY seq",
    )?;
    let rows = stmt.query_map(params![study_id], |row| {
        let seq: i64 = row.get(0)?;
        let event_id: String = row.get(1)?;
        let timestamp: String = row.get(2)?;
        let event_type: String = row.get(3)?;
        let resource: Option<String> = row.get(4)?;
        let severity: String = row.get(5)?;
        let details: String = row.get(6)?;
        Ok((seq, event_id, timestamp, event_type, resource, severity, details))
    })?;

    let mut events = Vec::new();
    for row in rows {
        let (seq, event_id, timestamp, event_type, resource, severity, details) = row?;
        let Some(event_type) = AuditEventType::parse(&event_type) else {
            continue;
        };
        events.push(AuditEvent {
            id: Uuid::parse_str(&event_id).unwrap_or_else(|_| Uuid::nil()),
            seq: Some(seq),
            timestamp: DateTime::parse_from_rfc3339(&timestamp)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            event_type,
            study_id: Some(study_id),
            resource,
            details: serde_json::from_str(&details).unwrap_or(serde_json::Value::Null),
            severity: LogSeverity::parse(&severity),
        });
    }
    Ok(events)
}

/// Highest sequence number written so far
pub fn last_seq(conn: &Connection) -> rusqlite::Result<Option<i64>> {
    conn.query_row("SELECT MAX(seq) FROM operation_log", [], |row| row.get(0))
        .optional()
        .map(Option::flatten)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_event_creation() {
        let event = AuditEvent::new(
            AuditEventType::FileRegistered,
            Some(1),
            Some("chr20.vcf".to_string()),
            serde_json::json!({ "samples": 4 }),
        );

        assert_eq!(event.resource, Some("chr20.vcf".to_string()));
        assert!(matches!(event.severity, LogSeverity::Info));
    }

    #[test]
    fn test_override_event_severity() {
        let event = AuditEvent::new(
            AuditEventType::ForcedOverride,
            Some(1),
            None,
            serde_json::json!({}),
        );

        assert!(matches!(event.severity, LogSeverity::Warning));
    }

    #[test]
    fn test_log_is_monotonic() {
        let conn = Connection::open_in_memory().unwrap();
        create_table(&conn).unwrap();

        let first = AuditEvent::new(AuditEventType::OperationStarted, Some(1), None, serde_json::json!({}))
            .log(&conn)
            .unwrap();
        let second = AuditEvent::new(AuditEventType::OperationCompleted, Some(1), None, serde_json::json!({}))
            .log(&conn)
            .unwrap();

        assert!(second > first);
        assert_eq!(last_seq(&conn).unwrap(), Some(second));

        let events = study_events(&conn, 1).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, AuditEventType::OperationStarted);
        assert_eq!(events[1].seq, Some(second));
    }
}
