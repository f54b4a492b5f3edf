// ==============================================================================
// stats.rs - Cohort Variant Statistics
// ==============================================================================
// Description: Statistics collaborator computing genotype counts, allele
//              counts and alternate allele frequency per cohort
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

use crate::audit::{AuditEvent, AuditEventType};
use crate::context::StorageContext;
use crate::error::Result;
use crate::genotype::{Genotype, GenotypeClass};
use crate::models::{MergedVariant, SampleId, StudyId, VariantKey};
use crate::query::VariantQuery;

/// Statistics of one variant within one cohort
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantStats {
    pub variant: VariantKey,
    pub cohort: String,
    pub sample_count: usize,
    pub genotype_counts: BTreeMap<String, usize>,
    pub ref_allele_count: usize,
    pub alt_allele_count: usize,
    pub missing_allele_count: usize,
    /// `None` when no allele was called
    pub alt_allele_freq: Option<f64>,
}

/// Named set of samples
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cohort {
    pub name: String,
    pub samples: BTreeSet<SampleId>,
}

pub trait StatsCalculator: Send + Sync {
    fn calculate(&self, cohort: &Cohort, variants: &[MergedVariant]) -> Result<Vec<VariantStats>>;
}

/// Counts genotypes and alleles of the primary and fill entries of a cohort
#[derive(Debug, Clone, Copy, Default)]
pub struct GenotypeCountCalculator;

impl StatsCalculator for GenotypeCountCalculator {
    fn calculate(&self, cohort: &Cohort, variants: &[MergedVariant]) -> Result<Vec<VariantStats>> {
        let mut stats = Vec::with_capacity(variants.len());
        for variant in variants {
            let mut entry = VariantStats {
                variant: variant.key(),
                cohort: cohort.name.clone(),
                sample_count: 0,
                genotype_counts: BTreeMap::new(),
                ref_allele_count: 0,
                alt_allele_count: 0,
                missing_allele_count: 0,
                alt_allele_freq: None,
            };

            for sample in variant.samples.iter().filter(|s| cohort.samples.contains(&s.sample_id)) {
                entry.sample_count += 1;
                *entry.genotype_counts.entry(sample.genotype.clone()).or_default() += 1;

                let Ok(genotype) = Genotype::parse(&sample.genotype) else {
                    continue;
                };
                if genotype.class() == GenotypeClass::Unknown {
                    continue;
                }
                for allele in &genotype.alleles {
                    match allele {
                        Some(0) => entry.ref_allele_count += 1,
                        Some(_) => entry.alt_allele_count += 1,
                        None => entry.missing_allele_count += 1,
                    }
                }
            }

            let called = entry.ref_allele_count + entry.alt_allele_count;
            if called > 0 {
                entry.alt_allele_freq = Some(entry.alt_allele_count as f64 / called as f64);
            }
            stats.push(entry);
        }
        Ok(stats)
    }
}

/// Default cohort of a study: every indexed sample
pub fn default_cohort(ctx: &StorageContext, study_id: StudyId) -> Result<Cohort> {
    let study = ctx.metadata.study(study_id)?;
    Ok(Cohort {
        name: study.default_cohort().to_string(),
        samples: ctx
            .metadata
            .indexed_samples(study_id)?
            .into_iter()
            .map(|s| s.id)
            .collect(),
    })
}

/// Compute and store the statistics of a cohort over every visible variant
pub fn calculate_stats(
    ctx: &StorageContext,
    study_id: StudyId,
    calculator: &dyn StatsCalculator,
    cohort: &Cohort,
) -> Result<usize> {
    let variants = VariantQuery::new().execute(ctx, study_id)?;
    let stats = calculator.calculate(cohort, &variants)?;
    ctx.backend.replace_stats(study_id, &cohort.name, &stats)?;

    info!(
        "Statistics of cohort \"{}\" ({} samples) computed over {} variants",
        cohort.name,
        cohort.samples.len(),
        stats.len()
    );
    ctx.metadata.log_event(AuditEvent::new(
        AuditEventType::StatsCalculated,
        Some(study_id),
        Some(cohort.name.clone()),
        serde_json::json!({ "variants": stats.len(), "samples": cohort.samples.len() }),
    ))?;
    Ok(stats.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SampleEntry;

    fn variant(genotypes: &[&str]) -> MergedVariant {
        let mut v = MergedVariant::new(&VariantKey::new("1", 10, "A", "C"));
        for (i, genotype) in genotypes.iter().enumerate() {
            v.samples.push(SampleEntry {
                sample_id: i as SampleId + 1,
                genotype: genotype.to_string(),
                file_id: Some(1),
                fields: Default::default(),
            });
        }
        v
    }

    fn cohort(samples: &[SampleId]) -> Cohort {
        Cohort {
            name: "ALL".to_string(),
            samples: samples.iter().copied().collect(),
        }
    }

    #[test]
    fn test_counts_and_frequency() {
        let stats = GenotypeCountCalculator
            .calculate(&cohort(&[1, 2, 3, 4]), &[variant(&["0/0", "0/1", "1|1", "./."])])
            .unwrap();

        let s = &stats[0];
        assert_eq!(s.sample_count, 4);
        assert_eq!(s.genotype_counts["0/1"], 1);
        assert_eq!(s.ref_allele_count, 3);
        assert_eq!(s.alt_allele_count, 3);
        assert_eq!(s.missing_allele_count, 2);
        assert_eq!(s.alt_allele_freq, Some(0.5));
    }

    #[test]
    fn test_cohort_restricts_samples() {
        let stats = GenotypeCountCalculator
            .calculate(&cohort(&[2]), &[variant(&["0/0", "1/1"])])
            .unwrap();
        assert_eq!(stats[0].sample_count, 1);
        assert_eq!(stats[0].alt_allele_freq, Some(1.0));
    }

    #[test]
    fn test_unknown_genotypes_have_no_frequency() {
        let stats = GenotypeCountCalculator
            .calculate(&cohort(&[1]), &[variant(&["?/?"])])
            .unwrap();
        assert_eq!(stats[0].genotype_counts["?/?"], 1);
        assert_eq!(stats[0].alt_allele_freq, None);
    }
}
