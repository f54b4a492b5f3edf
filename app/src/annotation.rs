// ==============================================================================
// annotation.rs - Variant Annotation
// ==============================================================================
// Description: Annotator collaborator and the ANNOTATE operation that stores
//              annotations and builds the sample index annotation entries
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

use crate::audit::{AuditEvent, AuditEventType};
use crate::backend::IndexRow;
use crate::context::StorageContext;
use crate::coordinator::{OperationCoordinator, Outcome};
use crate::error::Result;
use crate::models::{SampleId, StudyId, TaskStatus, TaskType, VariantKey};
use crate::sample_index::SampleIndexBuilder;

/// Functional annotation of one variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantAnnotation {
    pub variant: VariantKey,
    pub consequence_types: Vec<String>,
    #[serde(default)]
    pub population_frequencies: BTreeMap<String, f64>,
    #[serde(default)]
    pub gene: Option<String>,
}

/// Annotation source (VEP, CellBase, a test double...)
pub trait Annotator: Send + Sync {
    fn annotate(&self, variants: &[VariantKey]) -> Result<Vec<VariantAnnotation>>;
}

/// Summary of an annotation run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnotationReport {
    pub samples: Vec<SampleId>,
    pub annotated: usize,
    pub skipped: usize,
}

/// Annotate every variant of the study not yet annotated, then build the
/// sample index annotation entries of samples whose annotation is not READY
pub fn annotate_study(
    ctx: &StorageContext,
    study_id: StudyId,
    annotator: &dyn Annotator,
) -> Result<AnnotationReport> {
    let version = ctx.sample_index_version();
    let samples: Vec<SampleId> = ctx
        .metadata
        .indexed_samples(study_id)?
        .into_iter()
        .filter(|s| s.annotation_status != TaskStatus::Ready)
        .map(|s| s.id)
        .collect();
    if samples.is_empty() {
        info!("Nothing to annotate in study {}", study_id);
        return Ok(AnnotationReport::default());
    }

    let coordinator = OperationCoordinator::new(ctx);
    let task = coordinator.begin_operation(study_id, TaskType::Annotate, &[], true, false)?;
    ctx.metadata.update_task(study_id, task.id, |t| {
        t.attributes
            .insert("samples".to_string(), serde_json::json!(samples));
        Ok(())
    })?;

    match run_annotation(ctx, study_id, annotator, &samples, version) {
        Ok((annotated, skipped)) => {
            coordinator.end_operation(&task, Outcome::Ready)?;
            info!(
                "Annotated {} variants ({} already annotated) for {} samples",
                annotated,
                skipped,
                samples.len()
            );
            Ok(AnnotationReport {
                samples,
                annotated,
                skipped,
            })
        }
        Err(e) => {
            warn!("Annotation of study {} failed: {}", study_id, e);
            Err(coordinator.fail_operation(&task, e))
        }
    }
}

fn run_annotation(
    ctx: &StorageContext,
    study_id: StudyId,
    annotator: &dyn Annotator,
    samples: &[SampleId],
    version: u32,
) -> Result<(usize, usize)> {
    let annotated_keys = ctx.backend.annotated_keys(study_id)?;
    let pending: Vec<VariantKey> = ctx
        .backend
        .scan_variants(study_id, None)?
        .into_iter()
        .map(|v| v.key())
        .filter(|key| !annotated_keys.contains(key))
        .collect();

    let annotations = if pending.is_empty() {
        Vec::new()
    } else {
        annotator.annotate(&pending)?
    };
    ctx.backend.put_annotations(study_id, &annotations)?;

    let all = ctx.backend.annotations(study_id)?;
    let builder = SampleIndexBuilder::new(ctx);
    let batch_size = ctx.config.sample_index_batch_size;
    for &sample_id in samples {
        // consequence type → variants carrying a non-reference call
        let mut batches: BTreeMap<(String, u64), BTreeMap<String, BTreeSet<VariantKey>>> = BTreeMap::new();
        for buckets in builder.entries(study_id, sample_id)?.into_values() {
            for key in buckets.into_values().flatten() {
                let Some(annotation) = all.get(&key) else {
                    continue;
                };
                let batch_start = key.position - key.position % batch_size;
                let batch = batches.entry((key.chromosome.clone(), batch_start)).or_default();
                for consequence in &annotation.consequence_types {
                    batch.entry(consequence.clone()).or_default().insert(key.clone());
                }
            }
        }

        let mut rows = Vec::with_capacity(batches.len());
        for ((chromosome, batch_start), consequences) in batches {
            rows.push(IndexRow {
                chromosome,
                batch_start,
                body: serde_json::to_vec(&consequences)?,
            });
        }
        ctx.backend
            .replace_sample_index_annotation(study_id, sample_id, version, &rows)?;
        ctx.metadata.update_sample(study_id, sample_id, |sample| {
            sample.annotation_status = TaskStatus::Ready;
            sample
                .sample_index_annotation_status
                .insert(version, TaskStatus::Ready);
            Ok(())
        })?;
    }

    ctx.metadata.log_event(AuditEvent::new(
        AuditEventType::AnnotationCompleted,
        Some(study_id),
        None,
        serde_json::json!({ "annotated": annotations.len(), "samples": samples }),
    ))?;
    Ok((annotations.len(), annotated_keys.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LoadError;
    use crate::fixtures::{load_vcf, storage, write_vcf};
    use crate::config::LoadOptions;

    struct MissenseEverywhere;

    impl Annotator for MissenseEverywhere {
        fn annotate(&self, variants: &[VariantKey]) -> Result<Vec<VariantAnnotation>> {
            Ok(variants
                .iter()
                .map(|v| VariantAnnotation {
                    variant: v.clone(),
                    consequence_types: vec!["missense_variant".to_string()],
                    population_frequencies: BTreeMap::new(),
                    gene: Some("GENE1".to_string()),
                })
                .collect())
        }
    }

    struct Unreachable;

    impl Annotator for Unreachable {
        fn annotate(&self, _variants: &[VariantKey]) -> Result<Vec<VariantAnnotation>> {
            Err(LoadError::collaborator("annotator", "service unavailable"))
        }
    }

    const VCF: &[&str] = &[
        "20\t100\t.\tA\tG\t50\tPASS\t.\tGT\t0/1",
        "20\t200\t.\tC\tT\t50\tPASS\t.\tGT\t0/0",
    ];

    #[test]
    fn test_annotation_marks_samples_ready() {
        let (dir, ctx) = storage();
        let path = write_vcf(dir.path(), "a.vcf", &["S1"], VCF);
        load_vcf(&ctx, &path, &LoadOptions::new("study")).unwrap();
        let study = ctx.metadata.require_study("study").unwrap();

        let report = annotate_study(&ctx, study.id, &MissenseEverywhere).unwrap();
        assert_eq!(report.annotated, 2);

        let sample = ctx.metadata.require_sample(study.id, "S1").unwrap();
        assert_eq!(sample.annotation_status, TaskStatus::Ready);
        assert_eq!(sample.sample_index_annotation_status(1), TaskStatus::Ready);

        let rows = ctx
            .backend
            .sample_index_annotation_rows(study.id, sample.id, 1)
            .unwrap();
        assert_eq!(rows.len(), 1);
        let body: BTreeMap<String, Vec<VariantKey>> = serde_json::from_slice(&rows[0].body).unwrap();
        assert_eq!(body["missense_variant"], vec![VariantKey::new("20", 100, "A", "G")]);

        // Nothing left to do
        assert_eq!(annotate_study(&ctx, study.id, &MissenseEverywhere).unwrap(), AnnotationReport::default());
    }

    #[test]
    fn test_failed_annotation_leaves_status_none() {
        let (dir, ctx) = storage();
        let path = write_vcf(dir.path(), "a.vcf", &["S1"], VCF);
        load_vcf(&ctx, &path, &LoadOptions::new("study")).unwrap();
        let study = ctx.metadata.require_study("study").unwrap();

        assert!(annotate_study(&ctx, study.id, &Unreachable).is_err());

        let sample = ctx.metadata.require_sample(study.id, "S1").unwrap();
        assert_eq!(sample.annotation_status, TaskStatus::None);
        let task = ctx
            .metadata
            .tasks(study.id)
            .unwrap()
            .into_iter()
            .find(|t| t.task_type == TaskType::Annotate)
            .unwrap();
        assert_eq!(task.current_status(), TaskStatus::Error);
    }
}
