// ==============================================================================
// job_processor.rs - Variant Storage Job Execution
// ==============================================================================
// Description: Runs one queued job against a storage directory and reports
//              progress and the per-file outcome
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use variant_storage::annotation::{annotate_study, Annotator, VariantAnnotation};
use variant_storage::janitor::{detect_illegal_concurrent_loads, pending_operations, JanitorPolicy};
use variant_storage::models::VariantKey;
use variant_storage::sample_index::SampleIndexBuilder;
use variant_storage::stats::{calculate_stats, default_cohort, GenotypeCountCalculator};
use variant_storage::{LoadError, StorageConfig, StorageContext, VariantStoragePipeline};

use crate::queue::{JobPayload, Operation};

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Storage error: {0}")]
    Storage(#[from] LoadError),

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Annotation file error: {0}")]
    Annotations(#[from] serde_json::Error),
}

/// Final report stored for a job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: Uuid,
    pub operation: String,
    pub study: String,
    pub succeeded: Vec<String>,
    /// Input → error message
    pub failed: BTreeMap<String, String>,
    pub message: String,
}

impl JobReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Findings of one storage check over every study
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageCheck {
    pub pending: usize,
    pub concurrent_loads: usize,
    /// Files marked INVALID by this check
    pub invalidated: usize,
}

/// Annotations read from a JSON array of [`VariantAnnotation`]
pub struct FileAnnotator {
    annotations: BTreeMap<VariantKey, VariantAnnotation>,
}

impl FileAnnotator {
    pub fn from_path(path: &Path) -> Result<Self, JobError> {
        let text = std::fs::read_to_string(path)?;
        let list: Vec<VariantAnnotation> = serde_json::from_str(&text)?;
        Ok(Self {
            annotations: list.into_iter().map(|a| (a.variant.clone(), a)).collect(),
        })
    }
}

impl Annotator for FileAnnotator {
    fn annotate(&self, variants: &[VariantKey]) -> variant_storage::Result<Vec<VariantAnnotation>> {
        Ok(variants
            .iter()
            .filter_map(|key| self.annotations.get(key).cloned())
            .collect())
    }
}

/// Executes jobs against one storage directory
pub struct JobProcessor {
    config: StorageConfig,
}

impl JobProcessor {
    pub fn new(config: StorageConfig) -> Self {
        Self { config }
    }

    pub fn for_dir(storage_dir: PathBuf) -> Self {
        Self::new(StorageConfig::for_dir(storage_dir))
    }

    pub fn open_storage(&self) -> Result<StorageContext, JobError> {
        Ok(StorageContext::open(self.config.clone())?)
    }

    /// Log pending operations and illegal concurrent loads of every study.
    /// Files of concurrent loads are only marked INVALID with `invalidate`.
    pub fn check_storage(&self, policy: JanitorPolicy, invalidate: bool) -> Result<StorageCheck, JobError> {
        let ctx = self.open_storage()?;
        let mut check = StorageCheck::default();
        for study in ctx.metadata.studies()? {
            let pending = pending_operations(&ctx, study.id, policy)?;
            if pending.is_empty() {
                info!("Study \"{}\": no pending operations", study.name);
            }
            for op in &pending {
                warn!(
                    "Study \"{}\": task {} (\"{}\") in status \"{}\" after {} attempts{}",
                    study.name,
                    op.task.id,
                    op.task.task_type,
                    op.task.current_status(),
                    op.attempts,
                    if op.resumable { "; relaunch with resume=true" } else { "" }
                );
            }
            check.pending += pending.len();

            let concurrent = detect_illegal_concurrent_loads(&ctx, study.id, !invalidate)?;
            if concurrent.is_empty() {
                continue;
            }
            for load in &concurrent {
                warn!(
                    "Study \"{}\": {} and {} loaded concurrently (samples {:?})",
                    study.name, load.files.0.name, load.files.1.name, load.samples
                );
            }
            check.concurrent_loads += concurrent.len();
            if invalidate {
                let files: std::collections::BTreeSet<_> = concurrent
                    .iter()
                    .flat_map(|c| [c.files.0.id, c.files.1.id])
                    .collect();
                check.invalidated += files.len();
                warn!("Study \"{}\": {} files invalidated", study.name, files.len());
            } else {
                warn!(
                    "Study \"{}\": files left untouched; run check-concurrent \
                     or set JANITOR_INVALIDATE=true to invalidate them",
                    study.name
                );
            }
        }
        Ok(check)
    }

    /// Run a job to completion; `progress` receives (percent, message)
    pub fn execute(
        &self,
        payload: &JobPayload,
        progress: &mut dyn FnMut(f32, &str),
    ) -> Result<JobReport, JobError> {
        let ctx = self.open_storage()?;
        let options = payload.load_options();
        let mut report = JobReport {
            job_id: payload.job_id,
            operation: payload.operation.name().to_string(),
            study: payload.study.clone(),
            ..JobReport::default()
        };

        info!(
            "Job {}: \"{}\" on study \"{}\"",
            payload.job_id,
            payload.operation.name(),
            payload.study
        );
        progress(0.0, "Starting");

        match &payload.operation {
            Operation::Load { inputs } => {
                if inputs.is_empty() {
                    return Err(JobError::InvalidJob("load job without inputs".to_string()));
                }
                let pipeline = VariantStoragePipeline::new(&ctx);
                let total = inputs.len() as f32;
                for (i, input) in inputs.iter().enumerate() {
                    progress(100.0 * i as f32 / total, &format!("Loading {}", input));
                    let outcomes = pipeline.index(&[PathBuf::from(input)], &options)?;
                    for outcome in outcomes {
                        match outcome.result {
                            Ok(_) => report.succeeded.push(input.clone()),
                            Err(e) => {
                                warn!("Job {}: {} failed: {}", payload.job_id, input, e);
                                report.failed.insert(input.clone(), e.to_string());
                            }
                        }
                    }
                }
                report.message = format!(
                    "{} of {} files loaded",
                    report.succeeded.len(),
                    inputs.len()
                );
            }
            Operation::Remove { files } => {
                progress(10.0, "Removing files");
                match VariantStoragePipeline::new(&ctx).remove_files(files, &options) {
                    Ok(removed) => {
                        report.succeeded = files.clone();
                        report.message = format!(
                            "{} variants updated, {} deleted",
                            removed.stats.variants_updated, removed.stats.variants_deleted
                        );
                    }
                    Err(e) => {
                        for file in files {
                            report.failed.insert(file.clone(), e.to_string());
                        }
                        report.message = e.to_string();
                    }
                }
            }
            Operation::Annotate { annotations } => {
                let annotator = FileAnnotator::from_path(Path::new(annotations))?;
                let study = ctx.metadata.require_study(&payload.study)?;
                progress(10.0, "Annotating variants");
                let annotated = annotate_study(&ctx, study.id, &annotator)?;
                report.message = format!(
                    "{} variants annotated for {} samples",
                    annotated.annotated,
                    annotated.samples.len()
                );
            }
            Operation::SampleIndex { samples } => {
                let study = ctx.metadata.require_study(&payload.study)?;
                progress(10.0, "Building sample index");
                let (_, built) = SampleIndexBuilder::new(&ctx).rebuild(study.id, samples)?;
                report.message = format!("{} samples, {} entries", built.samples, built.entries);
            }
            Operation::Stats => {
                let study = ctx.metadata.require_study(&payload.study)?;
                progress(10.0, "Computing statistics");
                let cohort = default_cohort(&ctx, study.id)?;
                let count = calculate_stats(&ctx, study.id, &GenotypeCountCalculator, &cohort)?;
                report.message = format!("{} variants in cohort \"{}\"", count, cohort.name);
            }
        }

        progress(100.0, &report.message);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use variant_storage::fixtures::{storage, write_vcf};
    use variant_storage::models::{TaskStatus, TaskType};
    use variant_storage::LoadOptions;

    fn payload(study: &str, operation: Operation) -> JobPayload {
        JobPayload {
            job_id: Uuid::new_v4(),
            study: study.to_string(),
            operation,
            options: LoadOptions::default(),
        }
    }

    #[test]
    fn test_load_job_reports_each_input() {
        let (dir, ctx) = storage();
        let good = write_vcf(dir.path(), "good.vcf", &["S1"], &["1\t10\t.\tA\tT\t9\tPASS\t.\tGT\t0/1"]);
        let missing = dir.path().join("missing.vcf");
        let processor = JobProcessor::new(ctx.config.clone());

        let mut messages = Vec::new();
        let report = processor
            .execute(
                &payload(
                    "s",
                    Operation::Load {
                        inputs: vec![good.display().to_string(), missing.display().to_string()],
                    },
                ),
                &mut |pct: f32, msg: &str| messages.push((pct, msg.to_string())),
            )
            .unwrap();

        assert_eq!(report.succeeded, vec![good.display().to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert!(!report.is_success());
        assert_eq!(messages.last().map(|m| m.0), Some(100.0));

        let study = ctx.metadata.require_study("s").unwrap();
        let file = ctx.metadata.require_file(study.id, "good.vcf").unwrap();
        assert_eq!(file.index_status, TaskStatus::Ready);
    }

    #[test]
    fn test_remove_and_annotate_jobs() {
        let (dir, ctx) = storage();
        let vcf = write_vcf(dir.path(), "a.vcf", &["S1"], &["1\t10\t.\tA\tT\t9\tPASS\t.\tGT\t0/1"]);
        let processor = JobProcessor::new(ctx.config.clone());
        processor
            .execute(
                &payload("s", Operation::Load { inputs: vec![vcf.display().to_string()] }),
                &mut |_: f32, _: &str| {},
            )
            .unwrap();

        let annotations = dir.path().join("annotations.json");
        std::fs::write(
            &annotations,
            r#"[{"variant":{"chromosome":"1","position":10,"reference":"A","alternate":"T"},
                "consequence_types":["stop_gained"]}]"#,
        )
        .unwrap();
        let report = processor
            .execute(
                &payload("s", Operation::Annotate { annotations: annotations.display().to_string() }),
                &mut |_: f32, _: &str| {},
            )
            .unwrap();
        assert!(report.message.starts_with("1 variants annotated"));

        let report = processor
            .execute(
                &payload("s", Operation::Remove { files: vec!["a.vcf".to_string()] }),
                &mut |_: f32, _: &str| {},
            )
            .unwrap();
        assert!(report.is_success());
        let study = ctx.metadata.require_study("s").unwrap();
        assert_eq!(ctx.backend.count_variants(study.id).unwrap(), 0);
    }

    #[test]
    fn test_sample_index_job_requires_study() {
        let (_dir, ctx) = storage();
        let processor = JobProcessor::new(ctx.config.clone());
        let result = processor.execute(
            &payload("nope", Operation::SampleIndex { samples: Vec::new() }),
            &mut |_: f32, _: &str| {},
        );
        assert!(matches!(result, Err(JobError::Storage(LoadError::NotFound { .. }))));
    }

    #[test]
    fn test_storage_check_only_invalidates_on_request() {
        let (_dir, ctx) = storage();
        let study = ctx.study("s").unwrap();
        let samples = vec!["S1".to_string()];
        let mut files = Vec::new();
        for name in ["a.vcf", "b.vcf"] {
            let file = ctx.metadata.register_file(study.id, name, name, &samples).unwrap();
            // Both loads RUNNING before either is READY
            ctx.metadata
                .create_task(study.id, TaskType::Load, &[file.id], |t| t.push_status(TaskStatus::Running))
                .unwrap();
            files.push(file.id);
        }
        for task in ctx.metadata.tasks(study.id).unwrap() {
            ctx.metadata
                .update_task(study.id, task.id, |t| {
                    t.push_status(TaskStatus::Ready);
                    Ok(())
                })
                .unwrap();
        }
        for &id in &files {
            ctx.metadata
                .update_file(study.id, id, |f| {
                    f.index_status = TaskStatus::Ready;
                    Ok(())
                })
                .unwrap();
        }
        let processor = JobProcessor::new(ctx.config.clone());

        let check = processor.check_storage(JanitorPolicy::default(), false).unwrap();
        assert_eq!(check.concurrent_loads, 1);
        assert_eq!(check.invalidated, 0);
        for &id in &files {
            assert_eq!(ctx.metadata.file(study.id, id).unwrap().index_status, TaskStatus::Ready);
        }

        let check = processor.check_storage(JanitorPolicy::default(), true).unwrap();
        assert_eq!(check.invalidated, 2);
        for &id in &files {
            assert_eq!(ctx.metadata.file(study.id, id).unwrap().index_status, TaskStatus::Invalid);
        }
    }
}
