// ==============================================================================
// fixtures.rs - Scenario Builders
// ==============================================================================
// Description: Free functions producing VCF inputs and populated storage
//              contexts, shared by unit tests, the scenario suite and the
//              worker tests
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::config::LoadOptions;
use crate::context::StorageContext;
use crate::error::Result;
use crate::models::{MergedVariant, StudyId};
use crate::pipeline::{LoadReport, RemoveReport, VariantStoragePipeline};
use crate::query::VariantQuery;

/// Fresh storage directory inside a temporary directory.
///
/// Inputs may be written next to it in `dir.path()`; the storage itself lives
/// under `dir/storage`.
pub fn storage() -> (TempDir, StorageContext) {
    let dir = match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(e) => panic!("failed to create temporary directory: {}", e),
    };
    let ctx = match StorageContext::open_dir(dir.path().join("storage")) {
        Ok(ctx) => ctx,
        Err(e) => panic!("failed to open storage: {}", e),
    };
    (dir, ctx)
}

/// Write a VCF with a minimal header; `lines` are tab-separated data lines
pub fn write_vcf(dir: &Path, name: &str, samples: &[&str], lines: &[&str]) -> PathBuf {
    let contigs: BTreeSet<&str> = lines
        .iter()
        .filter_map(|line| line.split('\t').next())
        .collect();

    let mut text = String::from("##fileformat=VCFv4.3\n");
    for contig in contigs {
        let _ = writeln!(text, "##contig=<ID={}>", contig);
    }
    text.push_str("##INFO=<ID=END,Number=1,Type=Integer,Description=\"End of a reference block\">\n");
    text.push_str("##ALT=<ID=NON_REF,Description=\"Any allele other than the reference\">\n");
    text.push_str("##FORMAT=<ID=GT,Number=1,Type=String,Description=\"Genotype\">\n");
    text.push_str("##FORMAT=<ID=DP,Number=1,Type=Integer,Description=\"Read depth\">\n");
    text.push_str("#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT");
    for sample in samples {
        text.push('\t');
        text.push_str(sample);
    }
    text.push('\n');
    for line in lines {
        text.push_str(line);
        text.push('\n');
    }

    let path = dir.join(name);
    if let Err(e) = std::fs::write(&path, text) {
        panic!("failed to write {:?}: {}", path, e);
    }
    path
}

/// One data line: QUAL `None` is written as `.`
pub fn vcf_line(chromosome: &str, position: u64, reference: &str, alternate: &str, quality: Option<f32>, genotypes: &[&str]) -> String {
    let quality = quality.map(|q| q.to_string()).unwrap_or_else(|| ".".to_string());
    format!(
        "{}\t{}\t.\t{}\t{}\t{}\tPASS\t.\tGT\t{}",
        chromosome,
        position,
        reference,
        alternate,
        quality,
        genotypes.join("\t")
    )
}

/// Run the production pipeline over one input
pub fn load_vcf(ctx: &StorageContext, path: &Path, options: &LoadOptions) -> Result<LoadReport> {
    let mut outcomes = VariantStoragePipeline::new(ctx).index(&[path.to_path_buf()], options)?;
    match outcomes.pop() {
        Some(outcome) => outcome.result,
        None => Err(crate::error::LoadError::Cancelled {
            task_id: 0,
            task_type: crate::models::TaskType::Load,
            stage: crate::error::Stage::Extract,
        }),
    }
}

pub fn remove_files(ctx: &StorageContext, names: &[&str], options: &LoadOptions) -> Result<RemoveReport> {
    let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
    VariantStoragePipeline::new(ctx).remove_files(&names, options)
}

/// Every visible merged variant of a study
pub fn variants(ctx: &StorageContext, study_id: StudyId) -> Result<Vec<MergedVariant>> {
    VariantQuery::new().execute(ctx, study_id)
}

/// The full physical variant table, hidden contributions included
pub fn raw_variants(ctx: &StorageContext, study_id: StudyId) -> Result<Vec<MergedVariant>> {
    ctx.backend.scan_variants(study_id, None)
}

/// Storage with `files` loaded in order under `options`
pub fn loaded_study(
    files: &[(&str, &[&str], &[&str])],
    options: &LoadOptions,
) -> Result<(TempDir, StorageContext, StudyId)> {
    let (dir, ctx) = storage();
    for (name, samples, lines) in files {
        let path = write_vcf(dir.path(), name, samples, lines);
        load_vcf(&ctx, &path, options)?;
    }
    let study = ctx.study(&options.study)?;
    Ok((dir, ctx, study.id))
}
