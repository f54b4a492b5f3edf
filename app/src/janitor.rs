// ==============================================================================
// janitor.rs - Pending Operation Checks
// ==============================================================================
// Description: Reports unfinished operations and invalidates files loaded by
//              illegal concurrent loads
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

use crate::audit::{AuditEvent, AuditEventType};
use crate::context::StorageContext;
use crate::error::Result;
use crate::models::{
    FileId, FileMetadata, FileRef, SplitData, StudyId, TaskMetadata, TaskStatus, TaskType,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JanitorPolicy {
    /// Attempts after which a task is no longer offered for resume
    pub max_attempts: usize,
}

impl Default for JanitorPolicy {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

/// An operation that did not reach READY
#[derive(Debug, Clone)]
pub struct PendingOperation {
    pub task: TaskMetadata,
    pub files: Vec<FileRef>,
    pub attempts: usize,
    pub resumable: bool,
}

/// Two READY files sharing samples, loaded at the same time without split data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrentLoad {
    pub files: (FileRef, FileRef),
    pub samples: Vec<String>,
}

/// Tasks in RUNNING, DONE or ERROR not superseded by a later READY task
/// over the same files. Stale tasks are reported, never expired.
pub fn pending_operations(
    ctx: &StorageContext,
    study_id: StudyId,
    policy: JanitorPolicy,
) -> Result<Vec<PendingOperation>> {
    let tasks = ctx.metadata.tasks(study_id)?;
    let files: BTreeMap<FileId, FileMetadata> = ctx
        .metadata
        .files(study_id)?
        .into_iter()
        .map(|f| (f.id, f))
        .collect();

    let mut pending = Vec::new();
    for task in &tasks {
        let status = task.current_status();
        if !matches!(status, TaskStatus::Running | TaskStatus::Done | TaskStatus::Error) {
            continue;
        }
        let superseded = tasks.iter().any(|later| {
            later.id > task.id
                && later.current_status() == TaskStatus::Ready
                && later.file_ids == task.file_ids
                && (!task.file_ids.is_empty() || later.task_type == task.task_type)
        });
        if superseded {
            continue;
        }

        let attempts = task.attempts();
        pending.push(PendingOperation {
            files: task
                .file_ids
                .iter()
                .filter_map(|id| files.get(id))
                .map(|f| f.file_ref())
                .collect(),
            attempts,
            resumable: attempts < policy.max_attempts,
            task: task.clone(),
        });
    }
    Ok(pending)
}

/// Time window of the load stage of a task: first RUNNING to first READY
fn load_window(task: &TaskMetadata) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let start = task.started_at()?;
    let end = task
        .status
        .iter()
        .find(|e| e.status == TaskStatus::Ready)
        .map(|e| e.at)?;
    Some((start, end))
}

/// Find READY files that share samples without split data and whose loads
/// overlapped in time. Unless `dry_run` is set those files become INVALID
/// and their samples' sample index status NONE.
pub fn detect_illegal_concurrent_loads(
    ctx: &StorageContext,
    study_id: StudyId,
    dry_run: bool,
) -> Result<Vec<ConcurrentLoad>> {
    let files: Vec<FileMetadata> = ctx
        .metadata
        .indexed_files(study_id)?
        .into_iter()
        .filter(|f| f.split_data == SplitData::None)
        .collect();
    let tasks = ctx.metadata.tasks(study_id)?;

    let window_of = |file: &FileMetadata| {
        tasks
            .iter()
            .rev()
            .filter(|t| t.task_type == TaskType::Load && t.file_ids.contains(&file.id))
            .find_map(load_window)
    };

    let mut found = Vec::new();
    for (i, a) in files.iter().enumerate() {
        for b in &files[i + 1..] {
            let shared: BTreeSet<_> = a.samples.iter().filter(|s| b.samples.contains(s)).copied().collect();
            if shared.is_empty() {
                continue;
            }
            let (Some((a_start, a_end)), Some((b_start, b_end))) = (window_of(a), window_of(b)) else {
                continue;
            };
            if a_start < b_end && b_start < a_end {
                let mut samples = Vec::with_capacity(shared.len());
                for sample_id in shared {
                    samples.push(ctx.metadata.sample(study_id, sample_id)?.name);
                }
                warn!(
                    "Illegal concurrent load of {} and {} (shared samples {:?})",
                    a.file_ref(),
                    b.file_ref(),
                    samples
                );
                found.push(ConcurrentLoad {
                    files: (a.file_ref(), b.file_ref()),
                    samples,
                });
            }
        }
    }

    if dry_run || found.is_empty() {
        return Ok(found);
    }

    let version = ctx.sample_index_version();
    let invalid: BTreeSet<FileId> = found
        .iter()
        .flat_map(|c| [c.files.0.id, c.files.1.id])
        .collect();
    for file_id in invalid {
        let file = ctx.metadata.update_file(study_id, file_id, |f| {
            f.index_status = TaskStatus::Invalid;
            Ok(())
        })?;
        for &sample_id in &file.samples {
            ctx.metadata.update_sample(study_id, sample_id, |s| {
                s.sample_index_status.insert(version, TaskStatus::None);
                Ok(())
            })?;
        }
        info!("File {} marked INVALID", file.file_ref());
        ctx.metadata.log_event(AuditEvent::new(
            AuditEventType::FileInvalidated,
            Some(study_id),
            Some(file.name.clone()),
            serde_json::json!({ "file_id": file.id, "reason": "illegal concurrent load" }),
        ))?;
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoadOptions;
    use crate::fixtures::{load_vcf, storage, write_vcf};
    use crate::models::StatusEvent;

    const LINE: &str = "1\t10\t.\tA\tT\t9\tPASS\t.\tGT\t0/1";

    #[test]
    fn test_failed_load_is_pending_until_resumed() {
        let (dir, ctx) = storage();
        let study = ctx.study("study").unwrap();
        let file = ctx
            .metadata
            .register_file(study.id, "a.vcf", "/in/a.vcf", &["S1".to_string()])
            .unwrap();
        ctx.metadata
            .create_task(study.id, TaskType::Load, &[file.id], |t| {
                t.push_status(TaskStatus::Running);
                t.push_status(TaskStatus::Error);
                t.push_status(TaskStatus::Running);
                t.push_status(TaskStatus::Error);
            })
            .unwrap();

        let pending = pending_operations(&ctx, study.id, JanitorPolicy { max_attempts: 2 }).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 2);
        assert!(!pending[0].resumable);
        assert_eq!(pending[0].files[0].name, "a.vcf");

        let path = write_vcf(dir.path(), "a.vcf", &["S1"], &[LINE]);
        load_vcf(&ctx, &path, &LoadOptions::new("study").with_resume(true)).unwrap();
        assert!(pending_operations(&ctx, study.id, JanitorPolicy::default()).unwrap().is_empty());
    }

    /// Two READY files without split data sharing S1, loaded in the given
    /// windows (seconds after a fixed start)
    fn loads_in_windows(ctx: &StorageContext, a: (i64, i64), b: (i64, i64)) -> (StudyId, FileId, FileId) {
        let study = ctx.study("study").unwrap();
        let samples = vec!["S1".to_string()];
        let base = Utc::now() - chrono::Duration::hours(1);
        let mut ids = Vec::new();
        for (name, (start, end)) in [("a.vcf", a), ("b.vcf", b)] {
            let file = ctx
                .metadata
                .register_file(study.id, name, &format!("/{}", name), &samples)
                .unwrap();
            assert_eq!(file.split_data, SplitData::None);
            ctx.metadata
                .create_task(study.id, TaskType::Load, &[file.id], |t| {
                    for (status, offset) in [(TaskStatus::Running, start), (TaskStatus::Ready, end)] {
                        t.status.push(StatusEvent {
                            status,
                            at: base + chrono::Duration::seconds(offset),
                        });
                    }
                })
                .unwrap();
            ctx.metadata
                .update_file(study.id, file.id, |f| {
                    f.index_status = TaskStatus::Ready;
                    Ok(())
                })
                .unwrap();
            ids.push(file.id);
        }
        (study.id, ids[0], ids[1])
    }

    #[test]
    fn test_concurrent_loads_detected_and_invalidated() {
        let (_dir, ctx) = storage();
        let (study_id, a, b) = loads_in_windows(&ctx, (0, 20), (5, 15));

        let found = detect_illegal_concurrent_loads(&ctx, study_id, true).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].samples, vec!["S1".to_string()]);
        assert_eq!(ctx.metadata.file(study_id, a).unwrap().index_status, TaskStatus::Ready);

        detect_illegal_concurrent_loads(&ctx, study_id, false).unwrap();
        assert_eq!(ctx.metadata.file(study_id, a).unwrap().index_status, TaskStatus::Invalid);
        assert_eq!(ctx.metadata.file(study_id, b).unwrap().index_status, TaskStatus::Invalid);
        let sample = ctx.metadata.require_sample(study_id, "S1").unwrap();
        assert_eq!(sample.sample_index_status(1), TaskStatus::None);
    }

    #[test]
    fn test_sequential_loads_are_legal() {
        let (_dir, ctx) = storage();
        // a is READY before b starts
        let (study_id, a, b) = loads_in_windows(&ctx, (0, 10), (20, 30));

        assert!(detect_illegal_concurrent_loads(&ctx, study_id, false).unwrap().is_empty());
        assert_eq!(ctx.metadata.file(study_id, a).unwrap().index_status, TaskStatus::Ready);
        assert_eq!(ctx.metadata.file(study_id, b).unwrap().index_status, TaskStatus::Ready);
    }

    #[test]
    fn test_touching_windows_are_legal() {
        let (_dir, ctx) = storage();
        let (study_id, ..) = loads_in_windows(&ctx, (0, 10), (10, 20));
        assert!(detect_illegal_concurrent_loads(&ctx, study_id, false).unwrap().is_empty());

        let (_dir, ctx) = storage();
        let (study_id, ..) = loads_in_windows(&ctx, (0, 11), (10, 20));
        assert_eq!(detect_illegal_concurrent_loads(&ctx, study_id, true).unwrap().len(), 1);
    }
}
