// ==============================================================================
// sample_index.rs - Sample Index Builder
// ==============================================================================
// Description: Per-sample secondary index of non-reference genotypes, keyed by
//              chromosome and position batch
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================
// Layout:
//   (sample, version, chromosome, batch_start) → { genotype → [variant, ...] }
//
// batch_start = position - position % batch_size. Only HET and HOM_ALT calls
// are indexed. Bodies are serialised from ordered maps, so the same merged
// data always produces the same bytes and the same digest.
// ==============================================================================

use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditEventType};
use crate::backend::IndexRow;
use crate::context::StorageContext;
use crate::coordinator::{OperationCoordinator, Outcome};
use crate::error::{LoadError, Result};
use crate::genotype::classify;
use crate::models::{
    FileId, SampleId, StudyId, TaskMetadata, TaskStatus, TaskType, VariantKey, SAMPLE_INDEX_DIGEST,
};
use crate::query::restrict;

/// Variants of one batch grouped by genotype
pub type GenotypeBuckets = BTreeMap<String, Vec<VariantKey>>;

/// Result of a build
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildReport {
    pub samples: usize,
    pub entries: usize,
    pub variants: usize,
}

pub struct SampleIndexBuilder<'a> {
    ctx: &'a StorageContext,
}

impl<'a> SampleIndexBuilder<'a> {
    pub fn new(ctx: &'a StorageContext) -> Self {
        Self { ctx }
    }

    /// Build the index of `sample_ids` from READY files plus `in_flight`
    /// files (those of an operation that has not ended yet)
    pub fn build_samples(
        &self,
        study_id: StudyId,
        sample_ids: &[SampleId],
        in_flight: &[FileId],
    ) -> Result<BuildReport> {
        let version = self.ctx.sample_index_version();
        let batch_size = self.ctx.config.sample_index_batch_size;

        let mut contributing: BTreeSet<FileId> = self
            .ctx
            .metadata
            .indexed_files(study_id)?
            .into_iter()
            .map(|f| f.id)
            .collect();
        contributing.extend(in_flight.iter().copied());

        let targets: BTreeSet<SampleId> = sample_ids.iter().copied().collect();
        let mut entries: BTreeMap<SampleId, BTreeMap<(String, u64), GenotypeBuckets>> =
            targets.iter().map(|&id| (id, BTreeMap::new())).collect();

        let policy = self.ctx.config.defaults.deduplication_policy;
        let mut variants = 0;
        for variant in self.ctx.backend.scan_variants(study_id, None)? {
            let Some(view) = restrict(variant, &contributing, &BTreeSet::new(), policy) else {
                continue;
            };
            let key = view.key();
            let batch_start = key.position - key.position % batch_size;
            for entry in &view.samples {
                if !targets.contains(&entry.sample_id) || !classify(&entry.genotype).is_indexed() {
                    continue;
                }
                if let Some(sample_entries) = entries.get_mut(&entry.sample_id) {
                    sample_entries
                        .entry((key.chromosome.clone(), batch_start))
                        .or_default()
                        .entry(entry.genotype.clone())
                        .or_default()
                        .push(key.clone());
                    variants += 1;
                }
            }
        }

        let mut report = BuildReport {
            samples: targets.len(),
            variants,
            ..BuildReport::default()
        };
        for (sample_id, batches) in entries {
            let mut rows = Vec::with_capacity(batches.len());
            for ((chromosome, batch_start), buckets) in batches {
                rows.push(IndexRow {
                    chromosome,
                    batch_start,
                    body: serde_json::to_vec(&buckets)?,
                });
            }
            report.entries += rows.len();

            self.ctx
                .backend
                .replace_sample_index(study_id, sample_id, version, &rows)?;
            let digest = digest(&rows);
            self.ctx.metadata.update_sample(study_id, sample_id, |sample| {
                sample.sample_index_status.insert(version, TaskStatus::Ready);
                sample
                    .attributes
                    .insert(SAMPLE_INDEX_DIGEST.to_string(), serde_json::json!(digest));
                Ok(())
            })?;
            debug!("Sample {}: {} index entries", sample_id, rows.len());
        }

        info!(
            "Sample index v{} built for {} samples ({} entries, {} calls)",
            version, report.samples, report.entries, report.variants
        );
        self.ctx.metadata.log_event(AuditEvent::new(
            AuditEventType::SampleIndexBuilt,
            Some(study_id),
            None,
            serde_json::json!({
                "version": version,
                "samples": sample_ids,
                "entries": report.entries,
            }),
        ))?;
        Ok(report)
    }

    /// Operator rebuild of the index of some (default: all indexed) samples
    /// under a SAMPLE_INDEX task
    pub fn rebuild(&self, study_id: StudyId, sample_names: &[String]) -> Result<(TaskMetadata, BuildReport)> {
        let version = self.ctx.sample_index_version();
        let sample_ids: Vec<SampleId> = if sample_names.is_empty() {
            self.ctx
                .metadata
                .indexed_samples(study_id)?
                .into_iter()
                .map(|s| s.id)
                .collect()
        } else {
            let mut ids = Vec::with_capacity(sample_names.len());
            for name in sample_names {
                ids.push(self.ctx.metadata.require_sample(study_id, name)?.id);
            }
            ids
        };

        let coordinator = OperationCoordinator::new(self.ctx);
        let task = coordinator.begin_operation(study_id, TaskType::SampleIndex, &[], true, false)?;
        for &sample_id in &sample_ids {
            self.ctx.metadata.update_sample(study_id, sample_id, |sample| {
                sample.sample_index_status.insert(version, TaskStatus::Running);
                Ok(())
            })?;
        }

        match self.build_samples(study_id, &sample_ids, &[]) {
            Ok(report) => {
                let task = coordinator.end_operation(&task, Outcome::Ready)?;
                Ok((task, report))
            }
            Err(e) => {
                for &sample_id in &sample_ids {
                    let marked = self.ctx.metadata.update_sample(study_id, sample_id, |sample| {
                        sample.sample_index_status.insert(version, TaskStatus::Error);
                        Ok(())
                    });
                    if let Err(mark_err) = marked {
                        warn!("Could not mark sample {} index as failed: {}", sample_id, mark_err);
                    }
                }
                Err(coordinator.fail_operation(&task, e))
            }
        }
    }

    /// Decoded index of one sample, by (chromosome, batch start)
    pub fn entries(
        &self,
        study_id: StudyId,
        sample_id: SampleId,
    ) -> Result<BTreeMap<(String, u64), GenotypeBuckets>> {
        let version = self.ctx.sample_index_version();
        let mut entries = BTreeMap::new();
        for row in self.ctx.backend.sample_index_rows(study_id, sample_id, version)? {
            let buckets: GenotypeBuckets = serde_json::from_slice(&row.body)?;
            entries.insert((row.chromosome, row.batch_start), buckets);
        }
        Ok(entries)
    }

    /// Variants where a sample has one of `genotypes`, in genomic order
    pub fn query_genotypes(
        &self,
        study_id: StudyId,
        sample_name: &str,
        genotypes: &[&str],
    ) -> Result<Vec<VariantKey>> {
        let sample = self.ctx.metadata.require_sample(study_id, sample_name)?;
        let version = self.ctx.sample_index_version();
        if sample.sample_index_status(version) != TaskStatus::Ready {
            return Err(LoadError::InvalidFileStatus {
                file: crate::models::FileRef {
                    id: 0,
                    name: sample.name.clone(),
                },
                status: sample.sample_index_status(version),
                message: format!(
                    "Sample index v{} of sample \"{}\" is not READY",
                    version, sample.name
                ),
            });
        }

        let mut variants = Vec::new();
        for buckets in self.entries(study_id, sample.id)?.into_values() {
            let mut batch: Vec<VariantKey> = buckets
                .into_iter()
                .filter(|(genotype, _)| genotypes.is_empty() || genotypes.contains(&genotype.as_str()))
                .flat_map(|(_, keys)| keys)
                .collect();
            batch.sort();
            variants.extend(batch);
        }
        Ok(variants)
    }

    /// Drop every index entry of a sample and clear its index status
    pub fn delete_sample(&self, study_id: StudyId, sample_id: SampleId) -> Result<usize> {
        let removed = self.ctx.backend.delete_sample_index(study_id, sample_id)?;
        self.ctx.metadata.update_sample(study_id, sample_id, |sample| {
            sample.sample_index_status.clear();
            sample.sample_index_annotation_status.clear();
            sample.attributes.remove(SAMPLE_INDEX_DIGEST);
            Ok(())
        })?;
        debug!("Sample {}: {} index rows deleted", sample_id, removed);
        Ok(removed)
    }
}

/// SHA-256 over the rows of one sample, as lowercase hex
pub fn digest(rows: &[IndexRow]) -> String {
    let mut hasher = Sha256::new();
    for row in rows {
        hasher.update(row.chromosome.as_bytes());
        hasher.update([0u8]);
        hasher.update(row.batch_start.to_be_bytes());
        hasher.update(&row.body);
    }
    format!("{:x}", hasher.finalize())
}
