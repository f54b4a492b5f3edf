// ==============================================================================
// main.rs - Variant Storage CLI
// ==============================================================================
// Description: Command line entry point for loading, removing and inspecting
//              files of a variant storage directory
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use walkdir::WalkDir;

use variant_storage::intermediate::is_intermediate;
use variant_storage::janitor::{detect_illegal_concurrent_loads, pending_operations, JanitorPolicy};
use variant_storage::models::SplitData;
use variant_storage::sample_index::SampleIndexBuilder;
use variant_storage::stats::{calculate_stats, default_cohort, GenotypeCountCalculator};
use variant_storage::{
    DeduplicationPolicy, LoadOptions, StorageConfig, StorageContext, VariantStoragePipeline,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Storage directory (metadata.db, variants.db, work/)
    #[arg(long, env = "VARIANT_STORAGE_DIR", default_value = "/data/variant-storage")]
    storage_dir: PathBuf,

    /// JSON configuration file; overrides the storage directory defaults
    #[arg(long, env = "VARIANT_STORAGE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load VCF files (or directories of VCF files) into a study
    Load(LoadArgs),

    /// Remove loaded files from a study
    Remove {
        #[arg(short, long)]
        study: String,
        #[arg(long)]
        resume: bool,
        #[arg(long)]
        force: bool,
        #[arg(required = true)]
        files: Vec<String>,
    },

    /// Rebuild the sample index of some or all samples
    SampleIndex {
        #[arg(short, long)]
        study: String,
        #[arg(long, value_delimiter = ',')]
        samples: Vec<String>,
    },

    /// Compute statistics of the default cohort
    Stats {
        #[arg(short, long)]
        study: String,
    },

    /// List operations that did not finish
    Pending {
        #[arg(short, long)]
        study: String,
        #[arg(long, default_value_t = 3)]
        max_attempts: usize,
    },

    /// Find and invalidate files loaded concurrently without split data
    CheckConcurrent {
        #[arg(short, long)]
        study: String,
        #[arg(long)]
        dry_run: bool,
    },

    /// List files and their index status
    Files {
        #[arg(short, long)]
        study: String,
    },
}

#[derive(Args, Debug)]
struct LoadArgs {
    #[arg(short, long)]
    study: String,

    #[arg(long, value_enum, default_value_t = SplitArg::None)]
    split_data: SplitArg,

    /// Allow the same samples in several files (treated as MULTI)
    #[arg(long)]
    multi_file: bool,

    #[arg(long)]
    resume: bool,

    #[arg(long)]
    force: bool,

    #[arg(long, value_enum, default_value_t = DedupArg::MaxQual)]
    deduplication_policy: DedupArg,

    #[arg(long)]
    fail_on_malformed: bool,

    /// FORMAT fields kept next to GT ("all" keeps every field)
    #[arg(long, value_delimiter = ',')]
    extra_fields: Vec<String>,

    #[arg(long)]
    exclude_genotypes: bool,

    /// Do not write archive slices
    #[arg(long)]
    no_archive: bool,

    #[arg(long, default_value = "./.")]
    fill_genotype: String,

    #[arg(long)]
    skip_extract: bool,

    #[arg(long)]
    skip_transform: bool,

    #[arg(long)]
    skip_load: bool,

    /// Compute default cohort statistics after loading
    #[arg(long)]
    stats: bool,

    /// Files or directories
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum SplitArg {
    None,
    Region,
    Chromosome,
    Multi,
}

impl From<SplitArg> for SplitData {
    fn from(arg: SplitArg) -> Self {
        match arg {
            SplitArg::None => SplitData::None,
            SplitArg::Region => SplitData::Region,
            SplitArg::Chromosome => SplitData::Chromosome,
            SplitArg::Multi => SplitData::Multi,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum DedupArg {
    MaxQual,
    Discard,
}

impl From<DedupArg> for DeduplicationPolicy {
    fn from(arg: DedupArg) -> Self {
        match arg {
            DedupArg::MaxQual => DeduplicationPolicy::MaxQual,
            DedupArg::Discard => DeduplicationPolicy::Discard,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "variant_storage=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => StorageConfig::from_file(path)
            .with_context(|| format!("Failed to read config {:?}", path))?,
        None => StorageConfig::for_dir(&cli.storage_dir),
    };
    let ctx = StorageContext::open(config).context("Failed to open storage")?;

    match cli.command {
        Command::Load(args) => load(&ctx, args),
        Command::Remove {
            study,
            resume,
            force,
            files,
        } => {
            let options = LoadOptions::new(study).with_resume(resume).with_force(force);
            let report = VariantStoragePipeline::new(&ctx)
                .remove_files(&files, &options)
                .context("Remove failed")?;
            info!(
                "Removed {} files (task {}): {} variants updated, {} deleted",
                report.files.len(),
                report.task_id,
                report.stats.variants_updated,
                report.stats.variants_deleted
            );
            Ok(())
        }
        Command::SampleIndex { study, samples } => {
            let study = ctx.metadata.require_study(&study)?;
            let (task, report) = SampleIndexBuilder::new(&ctx)
                .rebuild(study.id, &samples)
                .context("Sample index rebuild failed")?;
            info!(
                "Sample index rebuilt (task {}): {} samples, {} entries",
                task.id, report.samples, report.entries
            );
            Ok(())
        }
        Command::Stats { study } => {
            let study = ctx.metadata.require_study(&study)?;
            let cohort = default_cohort(&ctx, study.id)?;
            let count = calculate_stats(&ctx, study.id, &GenotypeCountCalculator, &cohort)?;
            info!("Cohort \"{}\": {} variants", cohort.name, count);
            Ok(())
        }
        Command::Pending { study, max_attempts } => {
            let study = ctx.metadata.require_study(&study)?;
            let pending = pending_operations(&ctx, study.id, JanitorPolicy { max_attempts })?;
            if pending.is_empty() {
                println!("No pending operations");
            }
            for op in pending {
                println!(
                    "task {}\t{}\t{}\tattempts={}\tresumable={}\t{}",
                    op.task.id,
                    op.task.task_type,
                    op.task.current_status(),
                    op.attempts,
                    op.resumable,
                    variant_storage::models::format_files(&op.files)
                );
            }
            Ok(())
        }
        Command::CheckConcurrent { study, dry_run } => {
            let study = ctx.metadata.require_study(&study)?;
            let found = detect_illegal_concurrent_loads(&ctx, study.id, dry_run)?;
            for c in &found {
                println!("{}\t{}\t{}", c.files.0, c.files.1, c.samples.join(","));
            }
            if found.is_empty() {
                println!("No illegal concurrent loads");
            } else if dry_run {
                warn!("{} illegal concurrent loads found (dry run)", found.len());
            }
            Ok(())
        }
        Command::Files { study } => {
            let study = ctx.metadata.require_study(&study)?;
            for file in ctx.metadata.files(study.id)? {
                println!(
                    "{}\t{}\t{}\t{}\t{} samples",
                    file.id,
                    file.name,
                    file.index_status,
                    file.split_data,
                    file.samples.len()
                );
            }
            Ok(())
        }
    }
}

fn load(ctx: &StorageContext, args: LoadArgs) -> Result<()> {
    let options = LoadOptions::new(args.study)
        .with_split_data(args.split_data.into())
        .with_multi_file_data(args.multi_file)
        .with_resume(args.resume)
        .with_force(args.force)
        .with_deduplication_policy(args.deduplication_policy.into())
        .with_fail_on_malformed(args.fail_on_malformed)
        .with_extra_genotype_fields(args.extra_fields)
        .with_exclude_genotypes(args.exclude_genotypes)
        .with_load_archive(!args.no_archive)
        .with_fill_genotype(args.fill_genotype)
        .with_stages(!args.skip_extract, !args.skip_transform, !args.skip_load)
        .with_calculate_stats(args.stats);

    let inputs = collect_inputs(&args.inputs)?;
    if inputs.is_empty() {
        anyhow::bail!("No VCF inputs found in {:?}", args.inputs);
    }

    let outcomes = VariantStoragePipeline::new(ctx).index(&inputs, &options)?;
    let failed = outcomes.iter().filter(|o| !o.is_ok()).count();
    for outcome in &outcomes {
        if let Err(e) = &outcome.result {
            error!("{:?}: {}", outcome.input, e);
        }
    }
    info!(
        "{} of {} inputs loaded",
        outcomes.len() - failed,
        inputs.len()
    );
    if failed > 0 {
        anyhow::bail!("{} inputs failed", failed);
    }
    Ok(())
}

fn is_input(path: &Path) -> bool {
    let name = path.to_string_lossy();
    name.ends_with(".vcf") || name.ends_with(".vcf.gz") || name.ends_with(".vcf.bgz") || is_intermediate(path)
}

/// Expand directories into their VCF files, sorted by path
fn collect_inputs(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_dir() {
            let mut found = Vec::new();
            for entry in WalkDir::new(input).follow_links(true) {
                let entry = entry.with_context(|| format!("Failed to read {:?}", input))?;
                if entry.file_type().is_file() && is_input(entry.path()) {
                    found.push(entry.into_path());
                }
            }
            found.sort();
            files.extend(found);
        } else {
            files.push(input.clone());
        }
    }
    Ok(files)
}
