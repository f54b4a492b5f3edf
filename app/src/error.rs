// ==============================================================================
// error.rs - Load/Merge/Removal Errors
// ==============================================================================
// Description: Error taxonomy returned by the metadata store, the operation
//              coordinator and every pipeline stage
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================

use std::path::PathBuf;
use thiserror::Error;

use crate::models::{format_files, FileRef, SplitData, TaskId, TaskStatus, TaskType};

/// Result alias used across the library
pub type Result<T> = std::result::Result<T, LoadError>;

/// Coarse error category, for callers that branch on the kind of failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConflictingOperation,
    AlreadyLoadedSamples,
    InvalidFileStatus,
    StagePipeline,
    DuplicateVariant,
    MalformedRecord,
    NotFound,
    ConcurrentModification,
    Cancelled,
    Collaborator,
    Config,
    Storage,
}

/// Pipeline stage names used in stage errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Extract,
    Transform,
    Load,
    PostLoad,
    Remove,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::Transform => "transform",
            Stage::Load => "load",
            Stage::PostLoad => "post-load",
            Stage::Remove => "remove",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum LoadError {
    /// Another active task holds an overlapping file or sample set
    #[error("{}", describe_conflict(*.requested, .requested_files, *.task_id, *.task_type, .task_files, *.status))]
    ConflictingOperation {
        requested: TaskType,
        requested_files: Vec<FileRef>,
        task_id: TaskId,
        task_type: TaskType,
        task_files: Vec<FileRef>,
        status: TaskStatus,
    },

    /// Samples already indexed under a different or absent split-data mode
    #[error(
        "Unable to load file {file}: samples {samples:?} already loaded from files {} \
         (requested split data {requested}, existing {existing})",
        format_files(.conflicting_files)
    )]
    AlreadyLoadedSamples {
        file: FileRef,
        samples: Vec<String>,
        conflicting_files: Vec<FileRef>,
        requested: SplitData,
        existing: SplitData,
    },

    /// File index status forbids the requested action
    #[error("{message}")]
    InvalidFileStatus {
        file: FileRef,
        status: TaskStatus,
        message: String,
    },

    /// Expected output of a stage is missing
    #[error("Missing {stage} output for file \"{file}\": {}", .path.display())]
    StagePipeline {
        stage: Stage,
        file: String,
        path: PathBuf,
    },

    #[error("Already loaded variant {variant} (file {file}, sample \"{sample}\")")]
    DuplicateVariant {
        file: FileRef,
        sample: String,
        variant: String,
    },

    #[error("Malformed variant in \"{file}\" at record {record}: {reason}")]
    MalformedRecord {
        file: String,
        record: u64,
        reason: String,
    },

    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },

    /// Compare-and-swap lost against a concurrent writer
    #[error("Concurrent modification of {kind} {id} (gave up after {attempts} attempts)")]
    ConcurrentModification {
        kind: &'static str,
        id: u32,
        attempts: usize,
    },

    #[error("Operation \"{task_type}\" (task {task_id}) cancelled at {stage} boundary")]
    Cancelled {
        task_id: TaskId,
        task_type: TaskType,
        stage: Stage,
    },

    #[error("{collaborator} failed: {message}")]
    Collaborator {
        collaborator: &'static str,
        message: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("VCF error: {0}")]
    Vcf(String),

    #[error("Storage backend error: {0}")]
    Backend(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl LoadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LoadError::ConflictingOperation { .. } => ErrorKind::ConflictingOperation,
            LoadError::AlreadyLoadedSamples { .. } => ErrorKind::AlreadyLoadedSamples,
            LoadError::InvalidFileStatus { .. } => ErrorKind::InvalidFileStatus,
            LoadError::StagePipeline { .. } => ErrorKind::StagePipeline,
            LoadError::DuplicateVariant { .. } => ErrorKind::DuplicateVariant,
            LoadError::MalformedRecord { .. } => ErrorKind::MalformedRecord,
            LoadError::NotFound { .. } => ErrorKind::NotFound,
            LoadError::ConcurrentModification { .. } => ErrorKind::ConcurrentModification,
            LoadError::Cancelled { .. } => ErrorKind::Cancelled,
            LoadError::Collaborator { .. } => ErrorKind::Collaborator,
            LoadError::Config(_) => ErrorKind::Config,
            LoadError::Vcf(_) => ErrorKind::MalformedRecord,
            LoadError::Backend(_)
            | LoadError::Io(_)
            | LoadError::Serialization(_)
            | LoadError::Parquet(_)
            | LoadError::Arrow(_)
            | LoadError::Csv(_) => ErrorKind::Storage,
        }
    }

    /// Conflicts clear once the other operation ends or the caller resumes
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ConflictingOperation | ErrorKind::ConcurrentModification
        )
    }

    pub fn not_found(kind: &'static str, key: impl ToString) -> Self {
        LoadError::NotFound {
            kind,
            key: key.to_string(),
        }
    }

    pub fn collaborator(collaborator: &'static str, message: impl Into<String>) -> Self {
        LoadError::Collaborator {
            collaborator,
            message: message.into(),
        }
    }

    pub fn already_loaded(file: FileRef) -> Self {
        let message = format!("File {} already loaded", file);
        LoadError::InvalidFileStatus {
            file,
            status: TaskStatus::Ready,
            message,
        }
    }

    pub fn invalid_file_status(file: FileRef, status: TaskStatus) -> Self {
        let message = format!(
            "File {} is in status \"{}\". Remove the file before loading it again",
            file, status
        );
        LoadError::InvalidFileStatus {
            file,
            status,
            message,
        }
    }

    pub fn remove_not_indexed(file: FileRef, status: TaskStatus) -> Self {
        let message = format!("Unable to remove non indexed file: {}", file.name);
        LoadError::InvalidFileStatus {
            file,
            status,
            message,
        }
    }
}

fn describe_conflict(
    requested: TaskType,
    requested_files: &[FileRef],
    task_id: TaskId,
    task_type: TaskType,
    task_files: &[FileRef],
    status: TaskStatus,
) -> String {
    let in_progress = format!(
        "Operation \"{}\" (task {}) for files {} in status \"{}\"",
        task_type,
        task_id,
        format_files(task_files),
        status
    );
    if requested == task_type && requested_files == task_files {
        format!(
            "{}. Relaunch with resume=true to finish the operation.",
            in_progress
        )
    } else {
        format!(
            "Can not \"{}\" files {}: {}",
            requested,
            format_files(requested_files),
            in_progress
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(id: u32, name: &str) -> FileRef {
        FileRef {
            id,
            name: name.to_string(),
        }
    }

    #[test]
    fn test_same_operation_conflict_message() {
        let err = LoadError::ConflictingOperation {
            requested: TaskType::Remove,
            requested_files: vec![file(1, "chr20.variant-test-file.vcf.gz")],
            task_id: 4,
            task_type: TaskType::Remove,
            task_files: vec![file(1, "chr20.variant-test-file.vcf.gz")],
            status: TaskStatus::Running,
        };

        assert_eq!(
            err.to_string(),
            "Operation \"remove\" (task 4) for files [\"chr20.variant-test-file.vcf.gz\" (id=1)] \
             in status \"RUNNING\". Relaunch with resume=true to finish the operation."
        );
        assert!(err.is_retryable());
    }

    #[test]
    fn test_other_operation_conflict_names_both_file_sets() {
        let err = LoadError::ConflictingOperation {
            requested: TaskType::Load,
            requested_files: vec![file(2, "chr21.vcf")],
            task_id: 1,
            task_type: TaskType::Load,
            task_files: vec![file(1, "chr20.vcf")],
            status: TaskStatus::Running,
        };
        let message = err.to_string();

        assert!(message.starts_with("Can not \"load\" files [\"chr21.vcf\" (id=2)]"));
        assert!(message.contains("\"chr20.vcf\" (id=1)"));
        assert_eq!(err.kind(), ErrorKind::ConflictingOperation);
    }

    #[test]
    fn test_remove_not_indexed_message() {
        let err = LoadError::remove_not_indexed(file(3, "fileA.vcf"), TaskStatus::None);
        assert_eq!(err.to_string(), "Unable to remove non indexed file: fileA.vcf");
        assert!(!err.is_retryable());
    }
}
