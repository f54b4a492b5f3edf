// ==============================================================================
// query.rs - Merged Variant Query
// ==============================================================================
// Description: Reads merged variants restricted to READY files, optionally
//              filtered by file, sample and region
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::config::DeduplicationPolicy;
use crate::context::StorageContext;
use crate::error::{LoadError, Result};
use crate::merge::compare_calls;
use crate::models::{FileId, MergedVariant, SampleEntry, SampleId, StudyId};

/// Genomic region, 1-based and inclusive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub chromosome: String,
    pub start: u64,
    pub end: u64,
}

impl Region {
    pub fn new(chromosome: impl Into<String>, start: u64, end: u64) -> Self {
        Self {
            chromosome: chromosome.into(),
            start,
            end,
        }
    }

    pub fn chromosome(chromosome: impl Into<String>) -> Self {
        Self::new(chromosome, 1, u64::MAX)
    }

    pub fn contains(&self, chromosome: &str, position: u64) -> bool {
        self.chromosome == chromosome && position >= self.start && position <= self.end
    }
}

impl FromStr for Region {
    type Err = LoadError;

    /// Parse `20`, `chr20` or `20:100-2000`
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || LoadError::Config(format!("Invalid region '{}'", s));
        let (chromosome, range) = match s.split_once(':') {
            Some((chromosome, range)) => (chromosome, Some(range)),
            None => (s, None),
        };
        let chromosome = crate::parsers::vcf::normalize_chromosome(chromosome).map_err(|_| invalid())?;

        match range {
            None => Ok(Region::chromosome(chromosome)),
            Some(range) => {
                let (start, end) = range.split_once('-').ok_or_else(invalid)?;
                let start: u64 = start.replace(',', "").parse().map_err(|_| invalid())?;
                let end: u64 = end.replace(',', "").parse().map_err(|_| invalid())?;
                if start > end {
                    return Err(invalid());
                }
                Ok(Region::new(chromosome, start, end))
            }
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == 1 && self.end == u64::MAX {
            write!(f, "{}", self.chromosome)
        } else {
            write!(f, "{}:{}-{}", self.chromosome, self.start, self.end)
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct VariantQuery {
    pub files: Vec<String>,
    pub samples: Vec<String>,
    pub region: Option<Region>,
    /// Picks the visible call when the primary one is hidden; the storage
    /// default when unset
    pub policy: Option<DeduplicationPolicy>,
}

impl VariantQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, name: impl Into<String>) -> Self {
        self.files.push(name.into());
        self
    }

    pub fn with_samples<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.samples.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn with_region(mut self, region: Region) -> Self {
        self.region = Some(region);
        self
    }

    pub fn with_policy(mut self, policy: DeduplicationPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Run the query against one study.
    ///
    /// Only READY files contribute. With a file filter, each variant shows
    /// exactly the calls of those files.
    pub fn execute(&self, ctx: &StorageContext, study_id: StudyId) -> Result<Vec<MergedVariant>> {
        let ready: BTreeSet<FileId> = ctx
            .metadata
            .indexed_files(study_id)?
            .into_iter()
            .map(|f| f.id)
            .collect();

        let (allowed, fill_samples) = if self.files.is_empty() {
            let indexed: BTreeSet<SampleId> = ctx
                .metadata
                .indexed_samples(study_id)?
                .into_iter()
                .map(|s| s.id)
                .collect();
            (ready, indexed)
        } else {
            let mut allowed = BTreeSet::new();
            for name in &self.files {
                let file = ctx.metadata.require_file(study_id, name)?;
                if ready.contains(&file.id) {
                    allowed.insert(file.id);
                }
            }
            (allowed, BTreeSet::new())
        };

        let sample_filter = if self.samples.is_empty() {
            None
        } else {
            let mut ids = BTreeSet::new();
            for name in &self.samples {
                ids.insert(ctx.metadata.require_sample(study_id, name)?.id);
            }
            Some(ids)
        };

        if allowed.is_empty() {
            return Ok(Vec::new());
        }

        let policy = self.policy.unwrap_or(ctx.config.defaults.deduplication_policy);
        let chromosome = self.region.as_ref().map(|r| r.chromosome.as_str());
        let mut results = Vec::new();
        for variant in ctx.backend.scan_variants(study_id, chromosome)? {
            if let Some(region) = &self.region {
                if !region.contains(&variant.chromosome, variant.position) {
                    continue;
                }
            }
            if let Some(mut view) = restrict(variant, &allowed, &fill_samples, policy) {
                if let Some(samples) = &sample_filter {
                    view.samples.retain(|s| samples.contains(&s.sample_id));
                    view.issues.retain(|i| samples.contains(&i.sample_id));
                }
                results.push(view);
            }
        }
        Ok(results)
    }
}

/// View of a variant limited to the calls of `allowed` files.
///
/// A primary entry from a hidden file is replaced by the best visible issue
/// of the same sample, ranked by `policy`. Fill entries survive only for
/// `fill_samples`.
pub(crate) fn restrict(
    mut variant: MergedVariant,
    allowed: &BTreeSet<FileId>,
    fill_samples: &BTreeSet<SampleId>,
    policy: DeduplicationPolicy,
) -> Option<MergedVariant> {
    variant.files.retain(|f| allowed.contains(&f.file_id));
    if variant.files.is_empty() {
        return None;
    }
    variant.issues.retain(|i| allowed.contains(&i.file_id));

    let mut samples = Vec::with_capacity(variant.samples.len());
    for entry in std::mem::take(&mut variant.samples) {
        match entry.file_id {
            Some(id) if allowed.contains(&id) => samples.push(entry),
            Some(_) => {
                let best = variant
                    .issues
                    .iter()
                    .enumerate()
                    .filter(|(_, issue)| issue.sample_id == entry.sample_id)
                    .min_by(|(_, a), (_, b)| compare_calls(&variant, a.file_id, b.file_id, policy))
                    .map(|(index, _)| index);
                if let Some(index) = best {
                    let issue = variant.issues.remove(index);
                    samples.push(SampleEntry {
                        sample_id: issue.sample_id,
                        genotype: issue.genotype,
                        file_id: Some(issue.file_id),
                        fields: issue.fields,
                    });
                }
            }
            None => {
                if fill_samples.contains(&entry.sample_id) {
                    samples.push(entry);
                }
            }
        }
    }
    variant.samples = samples;
    Some(variant)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FileEntry, IssueEntry, IssueKind, VariantKey};

    fn entry(sample_id: SampleId, file_id: Option<FileId>, genotype: &str) -> SampleEntry {
        SampleEntry {
            sample_id,
            genotype: genotype.to_string(),
            file_id,
            fields: Default::default(),
        }
    }

    fn file_entry(file_id: FileId, quality: f32) -> FileEntry {
        FileEntry {
            file_id,
            quality: Some(quality),
            filter: "PASS".to_string(),
            ids: Vec::new(),
        }
    }

    fn discrepant_variant() -> MergedVariant {
        let mut v = MergedVariant::new(&VariantKey::new("20", 100, "A", "G"));
        v.samples = vec![entry(1, Some(2), "1/1"), entry(2, None, "./.")];
        v.files = vec![file_entry(1, 10.0), file_entry(2, 90.0)];
        v.issues = vec![IssueEntry {
            kind: IssueKind::Discrepancy,
            sample_id: 1,
            file_id: 1,
            genotype: "0/1".to_string(),
            fields: Default::default(),
        }];
        v
    }

    #[test]
    fn test_region_parsing() {
        assert_eq!("chr20".parse::<Region>().unwrap(), Region::chromosome("20"));
        assert_eq!(
            "20:1,000-2000".parse::<Region>().unwrap(),
            Region::new("20", 1000, 2000)
        );
        assert!("20:5-1".parse::<Region>().is_err());
        assert!("20:x-1".parse::<Region>().is_err());
        assert_eq!(Region::new("1", 5, 10).to_string(), "1:5-10");
    }

    #[test]
    fn test_restrict_to_one_file_reconstructs_its_calls() {
        let allowed: BTreeSet<FileId> = [1].into_iter().collect();
        let view = restrict(discrepant_variant(), &allowed, &BTreeSet::new(), DeduplicationPolicy::MaxQual).unwrap();

        assert!(view.issues.is_empty());
        assert_eq!(view.files.len(), 1);
        assert_eq!(view.samples, vec![entry(1, Some(1), "0/1")]);
    }

    #[test]
    fn test_restrict_to_all_files_keeps_issues() {
        let allowed: BTreeSet<FileId> = [1, 2].into_iter().collect();
        let fills: BTreeSet<SampleId> = [2].into_iter().collect();
        let view = restrict(discrepant_variant(), &allowed, &fills, DeduplicationPolicy::MaxQual).unwrap();

        assert_eq!(view.issues.len(), 1);
        assert_eq!(view.samples.len(), 2);
    }

    #[test]
    fn test_restrict_hides_variants_of_other_files() {
        let allowed: BTreeSet<FileId> = [3].into_iter().collect();
        assert!(restrict(discrepant_variant(), &allowed, &BTreeSet::new(), DeduplicationPolicy::MaxQual).is_none());
    }

    #[test]
    fn test_restrict_ranks_hidden_calls_by_policy() {
        let mut v = MergedVariant::new(&VariantKey::new("20", 100, "A", "G"));
        v.samples = vec![entry(1, Some(3), "1/1")];
        v.files = vec![file_entry(1, 10.0), file_entry(2, 90.0), file_entry(3, 95.0)];
        for (file_id, genotype) in [(1, "0/1"), (2, "0/0")] {
            v.issues.push(IssueEntry {
                kind: IssueKind::Discrepancy,
                sample_id: 1,
                file_id,
                genotype: genotype.to_string(),
                fields: Default::default(),
            });
        }
        let allowed: BTreeSet<FileId> = [1, 2].into_iter().collect();

        let by_quality = restrict(v.clone(), &allowed, &BTreeSet::new(), DeduplicationPolicy::MaxQual).unwrap();
        assert_eq!(by_quality.samples, vec![entry(1, Some(2), "0/0")]);

        let by_file = restrict(v, &allowed, &BTreeSet::new(), DeduplicationPolicy::Discard).unwrap();
        assert_eq!(by_file.samples, vec![entry(1, Some(1), "0/1")]);
        assert_eq!(by_file.issues.len(), 1);
    }
}
