// ==============================================================================
// merge.rs - Merge Engine
// ==============================================================================
// Description: Merges per-file variant calls into the consolidated multi-sample
//              variant table and subtracts a file's contribution on removal
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================
// Merge rules per variant and sample:
//   - no entry or a fill entry      → the new call becomes the primary entry
//   - call from another file, MULTI → best call is primary, the rest are
//                                     DISCREPANCY issues
//   - call from another file,
//     REGION/CHROMOSOME             → DuplicateVariant error
//
// "Best" is a total order (QUAL descending, missing QUAL last, then lower file
// id), so the merged result does not depend on load order.
//
// A sample without a call gets a fill entry: the genotype of a reference
// block covering the position (lowest file id first), or the configured fill
// genotype when no block covers it. Fills are recomputed for the loaded or
// removed file's samples, so they follow the READY files whatever the order.
// ==============================================================================

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditEventType};
use crate::backend::ChromosomeVariants;
use crate::config::{DeduplicationPolicy, LoadOptions};
use crate::context::StorageContext;
use crate::error::{LoadError, Result};
use crate::models::{
    FileEntry, FileId, FileMetadata, FileRef, IssueEntry, IssueKind, MergedVariant, ReferenceBlock,
    SampleEntry, SampleId, SplitData, StudyId, TaskStatus, VariantRecord, LARGEST_VARIANT_LENGTH,
};

/// Counters reported by a merge
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Records applied from the file
    pub variants: u64,
    /// Variants created by this file
    pub new_variants: u64,
    pub discrepancies: u64,
    /// Fill entries written for samples without a call
    pub filled: u64,
    /// Chromosomes rewritten
    pub chromosomes: u64,
}

/// Counters reported by a removal
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoveStats {
    pub variants_updated: u64,
    pub variants_deleted: u64,
    pub archive_slices_deleted: u64,
}

/// Settings applied to every variant of one merge
struct MergeParams<'f> {
    file: &'f FileMetadata,
    split_data: SplitData,
    policy: DeduplicationPolicy,
    fill_genotype: &'f str,
    sample_names: BTreeMap<SampleId, String>,
}

/// Reference blocks of one chromosome, per sample
#[derive(Debug, Default)]
struct ReferenceCoverage {
    blocks: BTreeMap<SampleId, Vec<(FileId, u64, u64, String)>>,
}

impl ReferenceCoverage {
    fn add(&mut self, file_id: FileId, samples: &[SampleId], blocks: &[ReferenceBlock]) {
        for block in blocks {
            for (&sample_id, genotype) in samples.iter().zip(&block.genotypes) {
                self.blocks.entry(sample_id).or_default().push((
                    file_id,
                    block.start,
                    block.end,
                    genotype.clone(),
                ));
            }
        }
    }

    /// Fill entry of a sample without a call at `position`
    fn fill(&self, sample_id: SampleId, position: u64, fill_genotype: &str) -> SampleEntry {
        let genotype = self
            .blocks
            .get(&sample_id)
            .and_then(|blocks| {
                blocks
                    .iter()
                    .filter(|(_, start, end, _)| *start <= position && position <= *end)
                    .min_by_key(|(file_id, ..)| *file_id)
            })
            .map_or(fill_genotype, |(.., genotype)| genotype.as_str());
        fill_entry(sample_id, genotype)
    }
}

impl MergeParams<'_> {
    fn sample_name(&self, sample_id: SampleId) -> String {
        self.sample_names
            .get(&sample_id)
            .cloned()
            .unwrap_or_else(|| sample_id.to_string())
    }
}

pub struct MergeEngine<'a> {
    ctx: &'a StorageContext,
}

impl<'a> MergeEngine<'a> {
    pub fn new(ctx: &'a StorageContext) -> Self {
        Self { ctx }
    }

    /// Validate the split-data mode of a file against its already indexed
    /// samples, then record it on the file.
    ///
    /// Samples indexed by another READY file must have been loaded with the
    /// same, non-NONE mode. Consistent split data on indexed samples resets
    /// their annotation and sample index status.
    pub fn check_split_data(
        &self,
        study_id: StudyId,
        file: &FileMetadata,
        options: &LoadOptions,
    ) -> Result<SplitData> {
        let requested = options.effective_split_data();
        let version = self.ctx.sample_index_version();

        let mut conflicting_samples = Vec::new();
        let mut conflicting_files: Vec<FileRef> = Vec::new();
        let mut existing = SplitData::None;
        let mut reset = Vec::new();

        for &sample_id in &file.samples {
            let sample = self.ctx.metadata.sample(study_id, sample_id)?;
            let others: Vec<FileMetadata> = self
                .ctx
                .metadata
                .sample_files(study_id, sample_id)?
                .into_iter()
                .filter(|f| f.id != file.id)
                .collect();
            if others.is_empty() {
                continue;
            }

            if requested == SplitData::None || requested != sample.split_data {
                if conflicting_samples.is_empty() {
                    existing = sample.split_data;
                }
                conflicting_samples.push(sample.name.clone());
                for other in others {
                    let other = other.file_ref();
                    if !conflicting_files.contains(&other) {
                        conflicting_files.push(other);
                    }
                }
            } else {
                reset.push(sample_id);
            }
        }

        if !conflicting_samples.is_empty() {
            conflicting_files.sort_by_key(|f| f.id);
            return Err(LoadError::AlreadyLoadedSamples {
                file: file.file_ref(),
                samples: conflicting_samples,
                conflicting_files,
                requested,
                existing,
            });
        }

        for &sample_id in &reset {
            self.ctx.metadata.update_sample(study_id, sample_id, |sample| {
                sample.reset_annotation();
                sample.sample_index_status.insert(version, TaskStatus::None);
                Ok(())
            })?;
        }
        if !reset.is_empty() {
            info!(
                "{} samples of {} already indexed with {} split data; sample index invalidated",
                reset.len(),
                file.file_ref(),
                requested
            );
            self.ctx.metadata.log_event(AuditEvent::new(
                AuditEventType::SampleIndexInvalidated,
                Some(study_id),
                Some(file.name.clone()),
                serde_json::json!({ "samples": reset, "split_data": requested.as_str() }),
            ))?;
        }

        self.ctx.metadata.update_file(study_id, file.id, |f| {
            f.split_data = requested;
            Ok(())
        })?;
        Ok(requested)
    }

    /// Merge the records of one file into the variant table.
    ///
    /// Any previous contribution of the file is removed first, so running the
    /// same load twice gives the same table. Chromosomes the file has no data
    /// on are only visited when it brings samples new to the study, which
    /// still need fill entries there.
    pub fn load_file(
        &self,
        study_id: StudyId,
        file: &FileMetadata,
        records: &[VariantRecord],
        reference_blocks: &[ReferenceBlock],
        options: &LoadOptions,
    ) -> Result<MergeStats> {
        let mut sample_names = BTreeMap::new();
        for &sample_id in &file.samples {
            sample_names.insert(sample_id, self.ctx.metadata.sample(study_id, sample_id)?.name);
        }
        let params = MergeParams {
            file,
            split_data: options.effective_split_data(),
            policy: options.deduplication_policy,
            fill_genotype: &options.fill_genotype,
            sample_names,
        };
        let ready = self.ready_files(study_id, &[file.id])?;
        let indexed_all: BTreeSet<SampleId> = ready.values().flat_map(|f| f.samples.iter().copied()).collect();
        let indexed: BTreeSet<SampleId> = indexed_all
            .iter()
            .copied()
            .filter(|id| !file.samples.contains(id))
            .collect();

        let mut by_chromosome: BTreeMap<&str, Vec<&VariantRecord>> = BTreeMap::new();
        for record in records {
            by_chromosome
                .entry(record.chromosome.as_str())
                .or_default()
                .push(record);
        }
        let mut blocks_by_chromosome: BTreeMap<&str, Vec<ReferenceBlock>> = BTreeMap::new();
        for block in reference_blocks {
            blocks_by_chromosome
                .entry(block.chromosome.as_str())
                .or_default()
                .push(block.clone());
        }

        let mut chromosomes: BTreeSet<String> = by_chromosome
            .keys()
            .chain(blocks_by_chromosome.keys())
            .map(|c| c.to_string())
            .collect();
        let new_samples = file.samples.iter().any(|id| !indexed_all.contains(id));
        if new_samples {
            chromosomes.extend(self.ctx.backend.chromosomes(study_id)?);
        }

        let mut stats = MergeStats::default();
        for chromosome in &chromosomes {
            let chunk = by_chromosome
                .get(chromosome.as_str())
                .map(Vec::as_slice)
                .unwrap_or_default();
            let mut coverage = self.coverage(study_id, chromosome, &ready)?;
            if let Some(blocks) = blocks_by_chromosome.get(chromosome.as_str()) {
                coverage.add(file.id, &file.samples, blocks);
            }
            let chunk_stats = self.ctx.backend.modify_chromosome(study_id, chromosome, |variants| {
                strip_file(variants, file.id, None, params.policy, params.fill_genotype);
                let mut chunk_stats = apply_records(variants, &params, chunk, &indexed, &coverage)?;
                chunk_stats.filled += fill_gaps(variants, &file.samples, &coverage, params.fill_genotype);
                Ok(chunk_stats)
            })?;
            stats.variants += chunk_stats.variants;
            stats.new_variants += chunk_stats.new_variants;
            stats.discrepancies += chunk_stats.discrepancies;
            stats.filled += chunk_stats.filled;
            stats.chromosomes += 1;
        }

        self.record_largest_variant(study_id, file, records)?;

        if stats.discrepancies > 0 {
            info!(
                "{}: {} discrepancies recorded as issues",
                file.file_ref(),
                stats.discrepancies
            );
        }
        debug!("Merged {}: {:?}", file.file_ref(), stats);
        Ok(stats)
    }

    /// Subtract a file's contribution from every variant and drop its archive.
    ///
    /// `keep_samples` are the samples still indexed once the removal
    /// completes; fill entries of any other sample are dropped.
    pub fn remove_file(
        &self,
        study_id: StudyId,
        file: &FileMetadata,
        keep_samples: &BTreeSet<SampleId>,
        options: &LoadOptions,
    ) -> Result<RemoveStats> {
        let mut stats = RemoveStats::default();
        let ready = self.ready_files(study_id, &[file.id])?;
        let refill: Vec<SampleId> = file
            .samples
            .iter()
            .copied()
            .filter(|id| keep_samples.contains(id))
            .collect();
        for chromosome in self.ctx.backend.chromosomes(study_id)? {
            let coverage = self.coverage(study_id, &chromosome, &ready)?;
            let (updated, deleted) = self.ctx.backend.modify_chromosome(study_id, &chromosome, |variants| {
                let before = variants.clone();
                strip_file(
                    variants,
                    file.id,
                    Some(keep_samples),
                    options.deduplication_policy,
                    &options.fill_genotype,
                );
                fill_gaps(variants, &refill, &coverage, &options.fill_genotype);
                let updated = variants
                    .iter()
                    .filter(|(key, variant)| before.get(*key) != Some(*variant))
                    .count() as u64;
                Ok((updated, (before.len() - variants.len()) as u64))
            })?;
            stats.variants_updated += updated;
            stats.variants_deleted += deleted;
        }
        stats.archive_slices_deleted = self.ctx.backend.delete_archive(study_id, file.id)? as u64;

        info!(
            "Removed {}: {} variants updated, {} deleted, {} archive slices dropped",
            file.file_ref(),
            stats.variants_updated,
            stats.variants_deleted,
            stats.archive_slices_deleted
        );
        Ok(stats)
    }

    /// READY files of a study by id, without `exclude`
    fn ready_files(&self, study_id: StudyId, exclude: &[FileId]) -> Result<BTreeMap<FileId, FileMetadata>> {
        Ok(self
            .ctx
            .metadata
            .indexed_files(study_id)?
            .into_iter()
            .filter(|f| !exclude.contains(&f.id))
            .map(|f| (f.id, f))
            .collect())
    }

    /// Archived reference blocks of `files` on one chromosome
    fn coverage(
        &self,
        study_id: StudyId,
        chromosome: &str,
        files: &BTreeMap<FileId, FileMetadata>,
    ) -> Result<ReferenceCoverage> {
        let mut coverage = ReferenceCoverage::default();
        for slice in self.ctx.backend.chromosome_archive_slices(study_id, chromosome)? {
            if let Some(file) = files.get(&slice.file_id) {
                coverage.add(file.id, &file.samples, &slice.reference_blocks);
            }
        }
        Ok(coverage)
    }

    fn record_largest_variant(
        &self,
        study_id: StudyId,
        file: &FileMetadata,
        records: &[VariantRecord],
    ) -> Result<()> {
        let largest = records.iter().map(|r| r.key().length()).max().unwrap_or(0);
        if largest == 0 {
            return Ok(());
        }
        for &sample_id in &file.samples {
            self.ctx.metadata.update_sample(study_id, sample_id, |sample| {
                if largest > sample.largest_variant_length() {
                    sample
                        .attributes
                        .insert(LARGEST_VARIANT_LENGTH.to_string(), serde_json::json!(largest));
                }
                Ok(())
            })?;
        }
        Ok(())
    }
}

/// Apply the records of one chromosome
fn apply_records(
    variants: &mut ChromosomeVariants,
    params: &MergeParams<'_>,
    records: &[&VariantRecord],
    indexed: &BTreeSet<SampleId>,
    coverage: &ReferenceCoverage,
) -> Result<MergeStats> {
    let mut stats = MergeStats::default();

    // Samples a new variant is seeded with: indexed samples plus anyone
    // already present on this chromosome
    let mut known: BTreeSet<SampleId> = indexed.clone();
    for variant in variants.values() {
        known.extend(variant.samples.iter().map(|s| s.sample_id));
    }
    for id in &params.file.samples {
        known.remove(id);
    }

    for record in records {
        let key = record.key();
        if variants
            .get(&key)
            .map_or(false, |v| v.file(params.file.id).is_some())
        {
            warn!(
                "Skipping repeated record {} in {}",
                key,
                params.file.file_ref()
            );
            continue;
        }

        let variant = variants.entry(key.clone()).or_insert_with(|| {
            stats.new_variants += 1;
            let mut variant = MergedVariant::new(&key);
            for &sample_id in &known {
                variant
                    .samples
                    .push(coverage.fill(sample_id, key.position, params.fill_genotype));
                stats.filled += 1;
            }
            variant
        });

        variant.files.push(FileEntry {
            file_id: params.file.id,
            quality: record.quality,
            filter: record.filter.clone(),
            ids: record.ids.clone(),
        });
        variant.files.sort_by_key(|f| f.file_id);

        for (sample_id, call) in params.file.samples.iter().zip(record.calls.iter()) {
            let entry = SampleEntry {
                sample_id: *sample_id,
                genotype: call.genotype.clone(),
                file_id: Some(params.file.id),
                fields: call.fields.clone(),
            };
            stats.discrepancies += merge_call(variant, entry, params)?;
        }
        variant.samples.sort_by_key(|s| s.sample_id);
        variant.issues.sort_by_key(|i| (i.sample_id, i.file_id));
        stats.variants += 1;
    }
    Ok(stats)
}

/// Merge one call; returns the number of discrepancies recorded
fn merge_call(variant: &mut MergedVariant, entry: SampleEntry, params: &MergeParams<'_>) -> Result<u64> {
    let position = variant.samples.iter().position(|s| s.sample_id == entry.sample_id);
    let Some(position) = position else {
        variant.samples.push(entry);
        return Ok(0);
    };

    let current_file = match variant.samples[position].file_id {
        None => {
            variant.samples[position] = entry;
            return Ok(0);
        }
        Some(file_id) => file_id,
    };

    match params.split_data {
        SplitData::Region | SplitData::Chromosome => {
            return Err(LoadError::DuplicateVariant {
                file: params.file.file_ref(),
                sample: params.sample_name(entry.sample_id),
                variant: variant.key().to_string(),
            });
        }
        SplitData::None => warn!(
            "Sample {} called by files {} and {} without split data at {}",
            entry.sample_id,
            current_file,
            params.file.id,
            variant.key()
        ),
        SplitData::Multi => {}
    }

    let new_file = params.file.id;
    let new_wins = compare_calls(variant, new_file, current_file, params.policy) == Ordering::Less;
    let loser = if new_wins {
        std::mem::replace(&mut variant.samples[position], entry)
    } else {
        entry
    };

    debug!(
        "Discrepancy at {} for sample {}: file {} kept, file {:?} recorded as issue",
        variant.key(),
        loser.sample_id,
        variant.samples[position].file_id.unwrap_or_default(),
        loser.file_id
    );
    variant.issues.push(IssueEntry {
        kind: IssueKind::Discrepancy,
        sample_id: loser.sample_id,
        file_id: loser.file_id.unwrap_or_default(),
        genotype: loser.genotype,
        fields: loser.fields,
    });
    Ok(1)
}

/// Order two files' calls at a variant; `Less` means `a` is the better call
pub(crate) fn compare_calls(variant: &MergedVariant, a: FileId, b: FileId, policy: DeduplicationPolicy) -> Ordering {
    if policy == DeduplicationPolicy::MaxQual {
        let qa = variant.file(a).and_then(|f| f.quality);
        let qb = variant.file(b).and_then(|f| f.quality);
        let by_quality = match (qa, qb) {
            (Some(x), Some(y)) => y.total_cmp(&x),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        if by_quality != Ordering::Equal {
            return by_quality;
        }
    }
    a.cmp(&b)
}

/// Give every variant lacking one of `samples` a fill entry and bring the
/// existing fill entries of those samples in line with `coverage`. Returns
/// the number of entries added.
fn fill_gaps(
    variants: &mut ChromosomeVariants,
    samples: &[SampleId],
    coverage: &ReferenceCoverage,
    fill_genotype: &str,
) -> u64 {
    let mut filled = 0;
    for variant in variants.values_mut() {
        let position = variant.position;
        let mut added = false;
        for &sample_id in samples {
            let fill = coverage.fill(sample_id, position, fill_genotype);
            match variant.samples.iter_mut().find(|s| s.sample_id == sample_id) {
                Some(entry) if entry.file_id.is_none() => *entry = fill,
                Some(_) => {}
                None => {
                    variant.samples.push(fill);
                    filled += 1;
                    added = true;
                }
            }
        }
        if added {
            variant.samples.sort_by_key(|s| s.sample_id);
        }
    }
    filled
}

/// Remove a file's entries, promote the best remaining issue per sample and
/// delete variants no file contributes to.
///
/// With `keep` set, orphaned samples in `keep` become fill entries and fill
/// entries of samples outside `keep` are dropped; without it orphaned
/// entries are simply dropped.
fn strip_file(
    variants: &mut ChromosomeVariants,
    file_id: FileId,
    keep: Option<&BTreeSet<SampleId>>,
    policy: DeduplicationPolicy,
    fill_genotype: &str,
) {
    for variant in variants.values_mut() {
        variant.files.retain(|f| f.file_id != file_id);
        variant.issues.retain(|i| i.file_id != file_id);

        let mut samples = Vec::with_capacity(variant.samples.len());
        for entry in std::mem::take(&mut variant.samples) {
            match entry.file_id {
                Some(id) if id == file_id => {
                    if let Some(promoted) = promote_issue(variant, entry.sample_id, policy) {
                        samples.push(promoted);
                    } else if keep.map_or(false, |k| k.contains(&entry.sample_id)) {
                        samples.push(fill_entry(entry.sample_id, fill_genotype));
                    }
                }
                None => {
                    if keep.map_or(true, |k| k.contains(&entry.sample_id)) {
                        samples.push(entry);
                    }
                }
                Some(_) => samples.push(entry),
            }
        }
        variant.samples = samples;
    }
    variants.retain(|_, v| !v.is_empty());
}

/// Take the best issue of a sample out of the issue list
fn promote_issue(
    variant: &mut MergedVariant,
    sample_id: SampleId,
    policy: DeduplicationPolicy,
) -> Option<SampleEntry> {
    let best = variant
        .issues
        .iter()
        .enumerate()
        .filter(|(_, issue)| issue.sample_id == sample_id)
        .min_by(|(_, a), (_, b)| compare_calls(variant, a.file_id, b.file_id, policy))
        .map(|(index, _)| index)?;

    let issue = variant.issues.remove(best);
    Some(SampleEntry {
        sample_id: issue.sample_id,
        genotype: issue.genotype,
        file_id: Some(issue.file_id),
        fields: issue.fields,
    })
}

fn fill_entry(sample_id: SampleId, fill_genotype: &str) -> SampleEntry {
    SampleEntry {
        sample_id,
        genotype: fill_genotype.to_string(),
        file_id: None,
        fields: BTreeMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{load_vcf, storage, vcf_line, write_vcf};
    use crate::models::{SampleCall, VariantKey};

    fn file(id: FileId, samples: Vec<SampleId>) -> FileMetadata {
        FileMetadata {
            id,
            study_id: 1,
            name: format!("file{}.vcf", id),
            path: String::new(),
            samples,
            index_status: TaskStatus::Running,
            split_data: SplitData::Multi,
            attributes: Default::default(),
        }
    }

    fn record(position: u64, quality: Option<f32>, genotypes: &[&str]) -> VariantRecord {
        VariantRecord {
            chromosome: "20".to_string(),
            position,
            reference: "A".to_string(),
            alternate: "G".to_string(),
            ids: Vec::new(),
            quality,
            filter: "PASS".to_string(),
            calls: genotypes
                .iter()
                .map(|gt| SampleCall {
                    genotype: gt.to_string(),
                    fields: BTreeMap::new(),
                })
                .collect(),
        }
    }

    fn merge(
        variants: &mut ChromosomeVariants,
        file: &FileMetadata,
        split_data: SplitData,
        records: &[VariantRecord],
    ) -> Result<MergeStats> {
        merge_with(variants, file, split_data, records, &BTreeSet::new(), &ReferenceCoverage::default())
    }

    fn merge_with(
        variants: &mut ChromosomeVariants,
        file: &FileMetadata,
        split_data: SplitData,
        records: &[VariantRecord],
        indexed: &BTreeSet<SampleId>,
        coverage: &ReferenceCoverage,
    ) -> Result<MergeStats> {
        let params = MergeParams {
            file,
            split_data,
            policy: DeduplicationPolicy::MaxQual,
            fill_genotype: "./.",
            sample_names: BTreeMap::new(),
        };
        let refs: Vec<&VariantRecord> = records.iter().collect();
        strip_file(variants, file.id, None, params.policy, params.fill_genotype);
        let mut stats = apply_records(variants, &params, &refs, indexed, coverage)?;
        stats.filled += fill_gaps(variants, &file.samples, coverage, params.fill_genotype);
        Ok(stats)
    }

    fn hom_ref_block(start: u64, end: u64) -> ReferenceBlock {
        ReferenceBlock {
            chromosome: "20".to_string(),
            start,
            end,
            genotypes: vec!["0/0".to_string()],
        }
    }

    fn key(position: u64) -> VariantKey {
        VariantKey::new("20", position, "A", "G")
    }

    #[test]
    fn test_disjoint_samples_stay_rectangular() {
        let mut variants = ChromosomeVariants::new();
        merge(&mut variants, &file(1, vec![1, 2]), SplitData::None, &[record(100, Some(10.0), &["0/1", "1/1"])]).unwrap();
        merge(&mut variants, &file(2, vec![3]), SplitData::None, &[record(200, Some(10.0), &["0/1"])]).unwrap();

        let first = &variants[&key(100)];
        let ids: Vec<SampleId> = first.samples.iter().map(|s| s.sample_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(first.sample(3).unwrap().genotype, "./.");
        assert_eq!(first.sample(3).unwrap().file_id, None);

        let second = &variants[&key(200)];
        assert_eq!(second.samples.len(), 3);
        assert_eq!(second.sample(1).unwrap().file_id, None);
    }

    #[test]
    fn test_multi_records_discrepancy_with_max_qual() {
        let mut variants = ChromosomeVariants::new();
        merge(&mut variants, &file(1, vec![1]), SplitData::Multi, &[record(100, Some(20.0), &["0/1"])]).unwrap();
        let stats = merge(&mut variants, &file(2, vec![1]), SplitData::Multi, &[record(100, Some(50.0), &["1/1"])]).unwrap();

        assert_eq!(stats.discrepancies, 1);
        let v = &variants[&key(100)];
        assert_eq!(v.sample(1).unwrap().genotype, "1/1");
        assert_eq!(v.sample(1).unwrap().file_id, Some(2));
        assert_eq!(v.issues.len(), 1);
        assert_eq!(v.issues[0].file_id, 1);
        assert_eq!(v.issues[0].genotype, "0/1");
    }

    #[test]
    fn test_merge_is_order_independent() {
        let f1 = file(1, vec![1, 2]);
        let f2 = file(2, vec![1, 2]);
        let f3 = file(3, vec![3]);
        let r1 = vec![record(100, Some(30.0), &["0/1", "0/0"]), record(300, None, &["1/1", "0/1"])];
        let r2 = vec![record(100, Some(30.0), &["1/1", "0/1"]), record(200, Some(5.0), &["0/1", "0/1"])];
        let r3 = vec![record(200, Some(9.0), &["1/1"])];

        let inputs = [(&f1, &r1), (&f2, &r2), (&f3, &r3)];
        let orders = [[0, 1, 2], [2, 1, 0], [1, 2, 0]];

        let mut results = Vec::new();
        for order in orders {
            let mut variants = ChromosomeVariants::new();
            for i in order {
                let (f, r) = inputs[i];
                merge(&mut variants, f, SplitData::Multi, r).unwrap();
            }
            results.push(variants);
        }

        assert_eq!(results[0], results[1]);
        assert_eq!(results[0], results[2]);
        // Equal QUAL: lower file id is primary
        assert_eq!(results[0][&key(100)].sample(1).unwrap().file_id, Some(1));
    }

    #[test]
    fn test_disjoint_split_rejects_overlap() {
        let mut variants = ChromosomeVariants::new();
        merge(&mut variants, &file(1, vec![1]), SplitData::Chromosome, &[record(100, None, &["0/1"])]).unwrap();
        let err = merge(&mut variants, &file(2, vec![1]), SplitData::Chromosome, &[record(100, None, &["0/1"])]).unwrap_err();

        assert!(matches!(err, LoadError::DuplicateVariant { .. }));
        assert!(err.to_string().contains("Already loaded variant 20:100:A:G"));
    }

    #[test]
    fn test_reapplying_a_file_is_idempotent() {
        let mut variants = ChromosomeVariants::new();
        let f1 = file(1, vec![1]);
        let f2 = file(2, vec![1]);
        merge(&mut variants, &f1, SplitData::Multi, &[record(100, Some(1.0), &["0/1"])]).unwrap();
        merge(&mut variants, &f2, SplitData::Multi, &[record(100, Some(2.0), &["1/1"])]).unwrap();
        let once = variants.clone();

        merge(&mut variants, &f2, SplitData::Multi, &[record(100, Some(2.0), &["1/1"])]).unwrap();
        assert_eq!(variants, once);
    }

    #[test]
    fn test_strip_promotes_issue_and_deletes_empty_variants() {
        let mut variants = ChromosomeVariants::new();
        merge(&mut variants, &file(1, vec![1]), SplitData::Multi, &[record(100, Some(10.0), &["0/1"])]).unwrap();
        merge(
            &mut variants,
            &file(2, vec![1]),
            SplitData::Multi,
            &[record(100, Some(90.0), &["1/1"]), record(200, Some(90.0), &["1/1"])],
        )
        .unwrap();

        let keep: BTreeSet<SampleId> = [1].into_iter().collect();
        strip_file(&mut variants, 2, Some(&keep), DeduplicationPolicy::MaxQual, "./.");

        assert!(!variants.contains_key(&key(200)));
        let v = &variants[&key(100)];
        assert_eq!(v.sample(1).unwrap().file_id, Some(1));
        assert_eq!(v.sample(1).unwrap().genotype, "0/1");
        assert!(v.issues.is_empty());
        assert_eq!(v.files.len(), 1);
    }

    #[test]
    fn test_strip_drops_fills_of_unindexed_samples() {
        let mut variants = ChromosomeVariants::new();
        merge(&mut variants, &file(1, vec![1]), SplitData::None, &[record(100, None, &["0/1"])]).unwrap();
        let reference = variants.clone();
        merge(&mut variants, &file(2, vec![2]), SplitData::None, &[record(200, None, &["0/1"])]).unwrap();

        let keep: BTreeSet<SampleId> = [1].into_iter().collect();
        strip_file(&mut variants, 2, Some(&keep), DeduplicationPolicy::MaxQual, "./.");

        assert_eq!(variants, reference);
    }

    #[test]
    fn test_fill_follows_covering_reference_block() {
        let mut coverage = ReferenceCoverage::default();
        coverage.add(1, &[2], &[hom_ref_block(100, 200)]);

        let mut variants = ChromosomeVariants::new();
        merge(
            &mut variants,
            &file(2, vec![1]),
            SplitData::None,
            &[record(150, None, &["0/1"]), record(201, None, &["0/1"])],
        )
        .unwrap();
        fill_gaps(&mut variants, &[2], &coverage, "./.");

        let inside = variants[&key(150)].sample(2).unwrap();
        assert_eq!(inside.genotype, "0/0");
        assert_eq!(inside.file_id, None);
        assert_eq!(variants[&key(201)].sample(2).unwrap().genotype, "./.");
    }

    #[test]
    fn test_new_variant_seeded_from_reference_blocks() {
        let mut coverage = ReferenceCoverage::default();
        coverage.add(1, &[2], &[hom_ref_block(100, 200)]);
        let indexed: BTreeSet<SampleId> = [2].into_iter().collect();

        let mut variants = ChromosomeVariants::new();
        merge_with(
            &mut variants,
            &file(2, vec![1]),
            SplitData::None,
            &[record(100, None, &["1/1"]), record(99, None, &["0/1"])],
            &indexed,
            &coverage,
        )
        .unwrap();

        assert_eq!(variants[&key(100)].sample(2).unwrap().genotype, "0/0");
        assert_eq!(variants[&key(99)].sample(2).unwrap().genotype, "./.");
    }

    #[test]
    fn test_lowest_file_block_wins() {
        let mut coverage = ReferenceCoverage::default();
        let mut no_call = hom_ref_block(100, 200);
        no_call.genotypes = vec!["./.".to_string()];
        coverage.add(5, &[1], &[no_call]);
        coverage.add(3, &[1], &[hom_ref_block(150, 300)]);

        assert_eq!(coverage.fill(1, 120, "./.").genotype, "./.");
        assert_eq!(coverage.fill(1, 160, "./.").genotype, "0/0");
        assert_eq!(coverage.fill(1, 301, "-").genotype, "-");
    }

    #[test]
    fn test_load_skips_untouched_chromosomes_of_known_samples() {
        let (dir, ctx) = storage();
        let options = LoadOptions::new("s").with_split_data(SplitData::Multi);
        let first = write_vcf(
            dir.path(),
            "a.vcf",
            &["S1"],
            &[&vcf_line("20", 100, "A", "G", None, &["0/1"]), &vcf_line("21", 100, "A", "G", None, &["0/1"])],
        );
        load_vcf(&ctx, &first, &options).unwrap();

        // Same sample, data on chromosome 21 only
        let known = write_vcf(dir.path(), "b.vcf", &["S1"], &[&vcf_line("21", 200, "C", "T", None, &["1/1"])]);
        let report = load_vcf(&ctx, &known, &options).unwrap();
        assert_eq!(report.load.unwrap().merge.chromosomes, 1);

        // A new sample needs fill entries on chromosome 20 as well
        let fresh = write_vcf(dir.path(), "c.vcf", &["S2"], &[&vcf_line("21", 300, "G", "A", None, &["0/1"])]);
        let report = load_vcf(&ctx, &fresh, &options).unwrap();
        assert_eq!(report.load.unwrap().merge.chromosomes, 2);

        let study = ctx.study("s").unwrap();
        let chr20 = ctx.backend.scan_variants(study.id, Some("20")).unwrap();
        assert_eq!(chr20[0].samples.len(), 2);
        assert_eq!(chr20[0].samples[1].genotype, "./.");
    }
}
