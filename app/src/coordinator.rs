// ==============================================================================
// coordinator.rs - Operation Coordinator
// ==============================================================================
// Description: Task lifecycle for load/remove operations: conflict detection,
//              resume, forced overrides and file/sample status transitions
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================
// File index status:
//   NONE ──load──> RUNNING ──ok──> READY ──remove──> RUNNING ──ok──> NONE
//                     │                                 │
//                     └──fail──> pre-operation status <─┘
//
// A task holds its files while its current status is RUNNING or DONE. Two
// tasks conflict when they share a file or a sample.
// ==============================================================================

use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditEventType};
use crate::config::LoadOptions;
use crate::context::StorageContext;
use crate::error::{LoadError, Result};
use crate::models::{
    FileId, FileMetadata, FileRef, SampleId, SplitData, StudyId, TaskMetadata, TaskStatus,
    TaskType, LOAD_ARCHIVE_ATTRIBUTE,
};

/// Final outcome passed to [`OperationCoordinator::end_operation`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ready,
    Error,
}

pub struct OperationCoordinator<'a> {
    ctx: &'a StorageContext,
}

impl<'a> OperationCoordinator<'a> {
    pub fn new(ctx: &'a StorageContext) -> Self {
        Self { ctx }
    }

    /// Start (or re-attach to) a LOAD over `file_ids`
    pub fn begin_load(
        &self,
        study_id: StudyId,
        file_ids: &[FileId],
        options: &LoadOptions,
    ) -> Result<TaskMetadata> {
        self.begin_operation(study_id, TaskType::Load, file_ids, options.resume, options.force)
    }

    /// Start a REMOVE; files must be READY or INVALID unless `force` is set
    pub fn begin_remove(
        &self,
        study_id: StudyId,
        file_ids: &[FileId],
        options: &LoadOptions,
    ) -> Result<TaskMetadata> {
        for &file_id in file_ids {
            let file = self.ctx.metadata.file(study_id, file_id)?;
            match file.index_status {
                TaskStatus::Ready | TaskStatus::Invalid => {}
                // Resuming an interrupted removal
                TaskStatus::Running if options.resume => {}
                status if options.force => {
                    warn!(
                        "Removing file {} in status \"{}\" (force=true)",
                        file.file_ref(),
                        status
                    );
                    self.ctx.metadata.log_event(AuditEvent::new(
                        AuditEventType::ForcedOverride,
                        Some(study_id),
                        Some(file.name.clone()),
                        serde_json::json!({
                            "operation": TaskType::Remove.as_str(),
                            "file_id": file.id,
                            "status": status.as_str(),
                        }),
                    ))?;
                }
                status => return Err(LoadError::remove_not_indexed(file.file_ref(), status)),
            }
        }
        self.begin_operation(
            study_id,
            TaskType::Remove,
            file_ids,
            options.resume,
            options.force,
        )
    }

    /// Acquire `file_ids` for a new task, or re-attach to an existing one.
    ///
    /// Fails with `ConflictingOperation` when an active task shares a file or
    /// a sample with the request, unless this is a resume of that very task.
    pub fn begin_operation(
        &self,
        study_id: StudyId,
        task_type: TaskType,
        file_ids: &[FileId],
        resume: bool,
        force: bool,
    ) -> Result<TaskMetadata> {
        let mut requested: Vec<FileId> = file_ids.to_vec();
        requested.sort_unstable();
        requested.dedup();

        let files = self.files_by_id(study_id)?;
        let mut requested_files = Vec::with_capacity(requested.len());
        for id in &requested {
            let file = files
                .get(id)
                .ok_or_else(|| LoadError::not_found("file", id))?;
            requested_files.push(file.file_ref());
        }
        let requested_samples = samples_of(&files, &requested);

        // Active tasks holding overlapping files or samples
        for task in self.ctx.metadata.active_tasks(study_id)? {
            if !overlaps(&files, &task, &requested, &requested_samples) {
                continue;
            }

            if task.is_same_operation(task_type, &requested) {
                if resume {
                    return self.attach(task, &requested);
                }
                return Err(conflict(task_type, &requested_files, &task, &files));
            }

            if task_type == TaskType::Remove
                && force
                && task.task_type == TaskType::Load
                && task.current_status() == TaskStatus::Running
            {
                self.override_stale_load(&task, &files)?;
                continue;
            }

            return Err(conflict(task_type, &requested_files, &task, &files));
        }

        if task_type == TaskType::Load {
            // Reload the files: a forced override above may have reverted them
            for id in &requested {
                let file = self.ctx.metadata.file(study_id, *id)?;
                match file.index_status {
                    TaskStatus::Ready => return Err(LoadError::already_loaded(file.file_ref())),
                    TaskStatus::Invalid => {
                        return Err(LoadError::invalid_file_status(
                            file.file_ref(),
                            file.index_status,
                        ))
                    }
                    _ => {}
                }
            }
        }

        // A failed attempt of the same operation is retried in place
        let failed = self
            .ctx
            .metadata
            .tasks(study_id)?
            .into_iter()
            .rev()
            .find(|t| t.is_same_operation(task_type, &requested));
        if let Some(task) = failed {
            if task.current_status() == TaskStatus::Error {
                return self.attach(task, &requested);
            }
        }

        let mut pre_status = BTreeMap::new();
        for id in &requested {
            pre_status.insert(*id, self.ctx.metadata.file(study_id, *id)?.index_status);
        }

        let task = self
            .ctx
            .metadata
            .create_task(study_id, task_type, &requested, |task| {
                task.pre_status = pre_status.clone();
                task.push_status(TaskStatus::Running);
            })?;

        // Another process may have created a conflicting task between our
        // check and our insert; the older task wins.
        let files = self.files_by_id(study_id)?;
        for other in self.ctx.metadata.active_tasks(study_id)? {
            if other.id < task.id && overlaps(&files, &other, &requested, &requested_samples) {
                self.ctx.metadata.update_task(study_id, task.id, |t| {
                    t.push_status(TaskStatus::Error);
                    Ok(())
                })?;
                return Err(conflict(task_type, &requested_files, &other, &files));
            }
        }

        self.set_files_status(study_id, &requested, TaskStatus::Running)?;

        info!(
            "Started \"{}\" (task {}) for files {:?}",
            task_type, task.id, requested
        );
        self.ctx.metadata.log_event(AuditEvent::new(
            AuditEventType::OperationStarted,
            Some(study_id),
            Some(task.name.clone()),
            serde_json::json!({ "task_id": task.id, "file_ids": requested }),
        ))?;
        Ok(task)
    }

    /// Record that the load stage committed; post-load steps remain
    pub fn mark_done(&self, task: &TaskMetadata) -> Result<TaskMetadata> {
        let task = self.push_status(task, TaskStatus::Done)?;
        debug!("Task {} DONE", task.id);
        self.ctx.metadata.log_event(AuditEvent::new(
            AuditEventType::OperationDone,
            Some(task.study_id),
            Some(task.name.clone()),
            serde_json::json!({ "task_id": task.id }),
        ))?;
        Ok(task)
    }

    /// Close a task, moving its files and samples to their final status
    pub fn end_operation(&self, task: &TaskMetadata, outcome: Outcome) -> Result<TaskMetadata> {
        let study_id = task.study_id;
        match outcome {
            Outcome::Ready => {
                match task.task_type {
                    TaskType::Load => self.finish_load(task)?,
                    TaskType::Remove => self.finish_remove(task)?,
                    TaskType::Annotate | TaskType::SampleIndex => {}
                }
                let task = self.push_status(task, TaskStatus::Ready)?;
                info!("Finished \"{}\" (task {})", task.task_type, task.id);
                self.ctx.metadata.log_event(AuditEvent::new(
                    AuditEventType::OperationCompleted,
                    Some(study_id),
                    Some(task.name.clone()),
                    serde_json::json!({ "task_id": task.id, "file_ids": task.file_ids }),
                ))?;
                Ok(task)
            }
            Outcome::Error => {
                for &file_id in &task.file_ids {
                    let previous = task.pre_status.get(&file_id).copied().unwrap_or_default();
                    self.ctx.metadata.update_file(study_id, file_id, |file| {
                        file.index_status = previous;
                        Ok(())
                    })?;
                }
                let task = self.push_status(task, TaskStatus::Error)?;
                warn!("Failed \"{}\" (task {})", task.task_type, task.id);
                self.ctx.metadata.log_event(AuditEvent::new(
                    AuditEventType::OperationFailed,
                    Some(study_id),
                    Some(task.name.clone()),
                    serde_json::json!({ "task_id": task.id, "file_ids": task.file_ids }),
                ))?;
                Ok(task)
            }
        }
    }

    /// End a task with ERROR and hand back the error that failed it. A
    /// failure to record the ERROR is logged, never returned in its place.
    pub fn fail_operation(&self, task: &TaskMetadata, error: LoadError) -> LoadError {
        if let Err(end_err) = self.end_operation(task, Outcome::Error) {
            warn!(
                "Could not mark task {} as failed ({}): {}",
                task.id, error, end_err
            );
        }
        error
    }

    fn finish_load(&self, task: &TaskMetadata) -> Result<()> {
        let version = self.ctx.sample_index_version();
        for &file_id in &task.file_ids {
            let file = self.ctx.metadata.update_file(task.study_id, file_id, |file| {
                file.index_status = TaskStatus::Ready;
                Ok(())
            })?;
            for &sample_id in &file.samples {
                self.ctx
                    .metadata
                    .update_sample(task.study_id, sample_id, |sample| {
                        if !sample.files.contains(&file.id) {
                            sample.files.push(file.id);
                            sample.files.sort_unstable();
                        }
                        sample.index_status = TaskStatus::Ready;
                        sample.sample_index_status.insert(version, TaskStatus::Ready);
                        sample.split_data = file.split_data;
                        Ok(())
                    })?;
            }
        }
        Ok(())
    }

    fn finish_remove(&self, task: &TaskMetadata) -> Result<()> {
        for &file_id in &task.file_ids {
            let file = self.ctx.metadata.update_file(task.study_id, file_id, |file| {
                file.index_status = TaskStatus::None;
                file.split_data = SplitData::None;
                file.attributes.remove(LOAD_ARCHIVE_ATTRIBUTE);
                Ok(())
            })?;
            for &sample_id in &file.samples {
                self.ctx
                    .metadata
                    .update_sample(task.study_id, sample_id, |sample| {
                        sample.files.retain(|&id| id != file.id);
                        if sample.files.is_empty() {
                            sample.reset_loaded_state();
                        }
                        Ok(())
                    })?;
            }
        }
        Ok(())
    }

    fn attach(&self, task: TaskMetadata, requested: &[FileId]) -> Result<TaskMetadata> {
        let previous = task.current_status();
        let task = self.push_status(&task, TaskStatus::Running)?;
        self.set_files_status(task.study_id, requested, TaskStatus::Running)?;

        info!(
            "Resuming \"{}\" (task {}) from status \"{}\"",
            task.task_type, task.id, previous
        );
        self.ctx.metadata.log_event(AuditEvent::new(
            AuditEventType::OperationResumed,
            Some(task.study_id),
            Some(task.name.clone()),
            serde_json::json!({
                "task_id": task.id,
                "previous_status": previous.as_str(),
                "attempt": task.attempts(),
            }),
        ))?;
        Ok(task)
    }

    /// Mark a LOAD that never committed as ERROR so a forced REMOVE can run
    fn override_stale_load(
        &self,
        task: &TaskMetadata,
        files: &BTreeMap<FileId, FileMetadata>,
    ) -> Result<()> {
        let refs = file_refs(files, &task.file_ids);
        warn!(
            "Forcing task {} (\"{}\") to ERROR for files {:?}",
            task.id, task.task_type, task.file_ids
        );
        self.end_operation(task, Outcome::Error)?;
        self.ctx.metadata.log_event(AuditEvent::new(
            AuditEventType::ForcedOverride,
            Some(task.study_id),
            Some(task.name.clone()),
            serde_json::json!({
                "task_id": task.id,
                "files": refs.iter().map(|f| f.to_string()).collect::<Vec<_>>(),
                "reason": "remove with force=true over an unfinished load",
            }),
        ))?;
        Ok(())
    }

    fn push_status(&self, task: &TaskMetadata, status: TaskStatus) -> Result<TaskMetadata> {
        self.ctx.metadata.update_task(task.study_id, task.id, |t| {
            t.push_status(status);
            Ok(())
        })
    }

    fn set_files_status(&self, study_id: StudyId, file_ids: &[FileId], status: TaskStatus) -> Result<()> {
        for &file_id in file_ids {
            self.ctx.metadata.update_file(study_id, file_id, |file| {
                file.index_status = status;
                Ok(())
            })?;
        }
        Ok(())
    }

    fn files_by_id(&self, study_id: StudyId) -> Result<BTreeMap<FileId, FileMetadata>> {
        Ok(self
            .ctx
            .metadata
            .files(study_id)?
            .into_iter()
            .map(|f| (f.id, f))
            .collect())
    }
}

/// True when the task resumed a LOAD whose load stage had already committed
pub fn resumed_after_done(task: &TaskMetadata) -> bool {
    let n = task.status.len();
    n >= 2
        && task.status[n - 1].status == TaskStatus::Running
        && task.status[n - 2].status == TaskStatus::Done
}

fn samples_of(files: &BTreeMap<FileId, FileMetadata>, ids: &[FileId]) -> BTreeSet<SampleId> {
    ids.iter()
        .filter_map(|id| files.get(id))
        .flat_map(|f| f.samples.iter().copied())
        .collect()
}

fn overlaps(
    files: &BTreeMap<FileId, FileMetadata>,
    task: &TaskMetadata,
    requested: &[FileId],
    requested_samples: &BTreeSet<SampleId>,
) -> bool {
    task.file_ids.iter().any(|id| requested.contains(id))
        || !samples_of(files, &task.file_ids).is_disjoint(requested_samples)
}

fn file_refs(files: &BTreeMap<FileId, FileMetadata>, ids: &[FileId]) -> Vec<FileRef> {
    ids.iter()
        .map(|id| match files.get(id) {
            Some(file) => file.file_ref(),
            None => FileRef {
                id: *id,
                name: String::new(),
            },
        })
        .collect()
}

fn conflict(
    requested: TaskType,
    requested_files: &[FileRef],
    task: &TaskMetadata,
    files: &BTreeMap<FileId, FileMetadata>,
) -> LoadError {
    LoadError::ConflictingOperation {
        requested,
        requested_files: requested_files.to_vec(),
        task_id: task.id,
        task_type: task.task_type,
        task_files: file_refs(files, &task.file_ids),
        status: task.current_status(),
    }
}
