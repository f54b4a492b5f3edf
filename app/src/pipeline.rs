// ==============================================================================
// pipeline.rs - Variant Storage ETL Pipeline
// ==============================================================================
// Description: Extract, transform, load and post-load stages for VCF inputs,
//              plus the removal flow
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================
// Per input:
//   1. extract    gunzip into the work dir, sha256 of the input
//   2. register   file name and samples from the header
//   3. begin      LOAD task (or resume of one)
//   4. transform  normalise, split multi-allelics, dedup, write parquet
//   5. load       split-data checks, Loader::load, DONE
//   6. post-load  sample index, statistics, READY
//
// Steps 1 and 2 run before the task exists and take no lock: registering a
// file is idempotent, and the extracted copy is published with a rename so a
// concurrent attempt never reads a half-written file. Any error after step 3
// ends the task with ERROR and is reported for that input only; the remaining
// inputs are still processed.
// ==============================================================================

use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use flate2::read::MultiGzDecoder;

use crate::archive::write_archive;
use crate::config::{DeduplicationPolicy, LoadOptions, ALL_FIELDS};
use crate::context::{StopSignal, StorageContext};
use crate::coordinator::{resumed_after_done, OperationCoordinator, Outcome};
use crate::error::{LoadError, Result, Stage};
use crate::intermediate::{
    intermediate_path, is_intermediate, read_intermediate, read_intermediate_header,
    write_intermediate, IntermediateFile,
};
use crate::merge::{MergeEngine, MergeStats, RemoveStats};
use crate::models::{
    FileMetadata, FileRef, SampleId, StudyId, TaskId, TaskMetadata, VariantKey, VariantRecord,
    CHECKSUM_ATTRIBUTE, LOAD_ARCHIVE_ATTRIBUTE,
};
use crate::parsers::{MalformedVariant, VCFParseError, VCFParser};
use crate::sample_index::{BuildReport, SampleIndexBuilder};
use crate::stats::{calculate_stats, default_cohort, GenotypeCountCalculator, StatsCalculator};

/// What a [`Loader`] wrote for one file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadStats {
    pub merge: MergeStats,
    pub archive_slices: usize,
}

/// Load stage collaborator: writes a transformed file into storage
pub trait Loader: Send + Sync {
    fn load(
        &self,
        ctx: &StorageContext,
        task: &TaskMetadata,
        file: &FileMetadata,
        input: &IntermediateFile,
        options: &LoadOptions,
    ) -> Result<LoadStats>;
}

/// Archive slices followed by the merge. Reference blocks are always
/// archived since gap fills are derived from them; records only when the
/// archive is enabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeLoader;

impl Loader for MergeLoader {
    fn load(
        &self,
        ctx: &StorageContext,
        task: &TaskMetadata,
        file: &FileMetadata,
        input: &IntermediateFile,
        options: &LoadOptions,
    ) -> Result<LoadStats> {
        let mut stats = LoadStats::default();
        let archived: &[VariantRecord] = if options.load_archive { &input.records } else { &[] };
        if !archived.is_empty() || !input.reference_blocks.is_empty() {
            stats.archive_slices =
                write_archive(ctx, task.study_id, file.id, archived, &input.reference_blocks)?;
        }
        if options.load_archive {
            ctx.metadata.update_file(task.study_id, file.id, |f| {
                f.attributes
                    .insert(LOAD_ARCHIVE_ATTRIBUTE.to_string(), serde_json::json!(true));
                Ok(())
            })?;
        }
        stats.merge = MergeEngine::new(ctx).load_file(
            task.study_id,
            file,
            &input.records,
            &input.reference_blocks,
            options,
        )?;
        Ok(stats)
    }
}

/// Summary of one successfully processed input
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub file: Option<FileRef>,
    pub task_id: Option<TaskId>,
    pub checksum: Option<String>,
    pub intermediate: Option<PathBuf>,
    pub records: usize,
    pub malformed: usize,
    pub duplicated: usize,
    /// Records without a real alternate allele, kept as reference blocks
    pub reference_blocks: usize,
    /// `None` when the load stage did not run
    pub load: Option<LoadStats>,
    pub sample_index: Option<BuildReport>,
    pub stats_variants: Option<usize>,
}

/// Result of one input of [`VariantStoragePipeline::index`]
#[derive(Debug)]
pub struct FileOutcome {
    pub input: PathBuf,
    pub result: Result<LoadReport>,
}

impl FileOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Summary of a removal
#[derive(Debug, Clone, Default)]
pub struct RemoveReport {
    pub task_id: TaskId,
    pub files: Vec<FileRef>,
    pub stats: RemoveStats,
    /// Samples still indexed by other files, whose index was rebuilt
    pub samples_rebuilt: Vec<SampleId>,
    /// Samples left without files, whose index was dropped
    pub samples_cleared: Vec<SampleId>,
}

/// Output of the transform stage
struct Transformed {
    path: PathBuf,
    records: usize,
    malformed: usize,
    duplicated: usize,
    reference_blocks: usize,
}

pub struct VariantStoragePipeline<'a> {
    ctx: &'a StorageContext,
    loader: Box<dyn Loader>,
    stats: Option<Box<dyn StatsCalculator>>,
    stop: StopSignal,
}

impl<'a> VariantStoragePipeline<'a> {
    pub fn new(ctx: &'a StorageContext) -> Self {
        Self {
            ctx,
            loader: Box::new(MergeLoader),
            stats: None,
            stop: ctx.stop_signal(),
        }
    }

    pub fn with_loader(mut self, loader: Box<dyn Loader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn with_stats_calculator(mut self, calculator: Box<dyn StatsCalculator>) -> Self {
        self.stats = Some(calculator);
        self
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Process every input, reporting success or failure per input
    pub fn index(&self, inputs: &[PathBuf], options: &LoadOptions) -> Result<Vec<FileOutcome>> {
        let study = self.ctx.study(&options.study)?;
        std::fs::create_dir_all(&self.ctx.config.work_dir)?;
        info!(
            "Indexing {} files into study \"{}\" (split data {}, resume={})",
            inputs.len(),
            study.name,
            options.effective_split_data(),
            options.resume
        );

        let mut outcomes = Vec::with_capacity(inputs.len());
        for (i, input) in inputs.iter().enumerate() {
            if self.stop.is_stopped() {
                warn!("Stop requested; {} inputs not processed", inputs.len() - i);
                break;
            }
            let result = self.index_file(study.id, input, options);
            match &result {
                Ok(report) => info!(
                    "Indexed {:?}: {} records ({} malformed, {} duplicated)",
                    input, report.records, report.malformed, report.duplicated
                ),
                Err(e) => warn!("Failed to index {:?}: {}", input, e),
            }
            outcomes.push(FileOutcome {
                input: input.clone(),
                result,
            });
        }
        Ok(outcomes)
    }

    fn index_file(&self, study_id: StudyId, input: &Path, options: &LoadOptions) -> Result<LoadReport> {
        let file_name = input
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| LoadError::Config(format!("Input {:?} has no file name", input)))?;
        let mut report = LoadReport::default();

        // 1. Extract, outside the task
        let (source, checksum) = self.extract(input, &file_name, options)?;
        report.checksum = checksum;

        // 2. Register
        let (name, samples) = if options.do_transform {
            let samples = VCFParser::read_sample_names(&source).map_err(|e| parse_error(&file_name, e))?;
            (file_name.clone(), samples)
        } else {
            if !is_intermediate(&source) || !source.exists() {
                return Err(LoadError::StagePipeline {
                    stage: Stage::Transform,
                    file: file_name,
                    path: source,
                });
            }
            read_intermediate_header(&source)?
        };
        let mut file = self.ctx.metadata.register_file(
            study_id,
            &name,
            &input.to_string_lossy(),
            &samples,
        )?;
        if let Some(checksum) = &report.checksum {
            file = self.ctx.metadata.update_file(study_id, file.id, |f| {
                f.attributes
                    .insert(CHECKSUM_ATTRIBUTE.to_string(), serde_json::json!(checksum));
                Ok(())
            })?;
        }
        report.file = Some(file.file_ref());

        if !options.do_load {
            // Transform only: no task is opened
            if options.do_transform {
                let transformed = self.transform(&source, &file, options)?;
                report.apply(transformed);
            }
            return Ok(report);
        }

        // 3. Begin
        let coordinator = OperationCoordinator::new(self.ctx);
        let task = coordinator.begin_load(study_id, &[file.id], options)?;
        report.task_id = Some(task.id);

        match self.run_stages(&coordinator, &task, &source, &file, options, &mut report) {
            Ok(()) => Ok(report),
            Err(e) => {
                warn!("Loading {} failed: {}", file.file_ref(), e);
                Err(coordinator.fail_operation(&task, e))
            }
        }
    }

    /// Stages 4 to 6, inside the task
    fn run_stages(
        &self,
        coordinator: &OperationCoordinator<'_>,
        task: &TaskMetadata,
        source: &Path,
        file: &FileMetadata,
        options: &LoadOptions,
        report: &mut LoadReport,
    ) -> Result<()> {
        let study_id = task.study_id;

        // 4. Transform
        self.check_stop(task, Stage::Transform)?;
        let intermediate = if options.do_transform {
            let transformed = self.transform(source, file, options)?;
            let path = transformed.path.clone();
            report.apply(transformed);
            path
        } else {
            source.to_path_buf()
        };

        // 5. Load
        self.check_stop(task, Stage::Load)?;
        let task = if resumed_after_done(task) {
            info!("{}: load stage already committed, skipping", file.file_ref());
            task.clone()
        } else {
            if !intermediate.exists() {
                return Err(LoadError::StagePipeline {
                    stage: Stage::Load,
                    file: file.name.clone(),
                    path: intermediate,
                });
            }
            let transformed = read_intermediate(&intermediate)?;
            if report.records == 0 {
                report.records = transformed.records.len();
            }

            MergeEngine::new(self.ctx).check_split_data(study_id, file, options)?;
            let file = self.ctx.metadata.file(study_id, file.id)?;

            info!(
                "Loading {} ({} records, {} reference blocks)",
                file.file_ref(),
                transformed.records.len(),
                transformed.reference_blocks.len()
            );
            let stats = self.loader.load(self.ctx, task, &file, &transformed, options)?;
            report.load = Some(stats);
            coordinator.mark_done(task)?
        };

        // 6. Post-load
        self.check_stop(&task, Stage::PostLoad)?;
        let file = self.ctx.metadata.file(study_id, file.id)?;
        let built = SampleIndexBuilder::new(self.ctx).build_samples(study_id, &file.samples, &[file.id])?;
        report.sample_index = Some(built);
        coordinator.end_operation(&task, Outcome::Ready)?;

        if options.calculate_stats {
            let calculator: &dyn StatsCalculator = match &self.stats {
                Some(calculator) => calculator.as_ref(),
                None => &GenotypeCountCalculator,
            };
            let cohort = default_cohort(self.ctx, study_id)?;
            match calculate_stats(self.ctx, study_id, calculator, &cohort) {
                Ok(count) => report.stats_variants = Some(count),
                Err(e) => warn!("Statistics of cohort \"{}\" failed: {}", cohort.name, e),
            }
        }
        Ok(())
    }

    fn check_stop(&self, task: &TaskMetadata, stage: Stage) -> Result<()> {
        if self.stop.is_stopped() {
            return Err(LoadError::Cancelled {
                task_id: task.id,
                task_type: task.task_type,
                stage,
            });
        }
        Ok(())
    }

    /// Decompress gzip/BGZF inputs into the work directory
    fn extract(&self, input: &Path, file_name: &str, options: &LoadOptions) -> Result<(PathBuf, Option<String>)> {
        if is_intermediate(input) {
            return Ok((input.to_path_buf(), None));
        }

        let stem = file_name
            .strip_suffix(".gz")
            .or_else(|| file_name.strip_suffix(".bgz"));
        let target = match stem {
            Some(stem) => self.ctx.config.work_dir.join(stem),
            None => input.to_path_buf(),
        };

        if !options.do_extract {
            if !target.exists() {
                return Err(LoadError::StagePipeline {
                    stage: Stage::Extract,
                    file: file_name.to_string(),
                    path: target,
                });
            }
            return Ok((target, None));
        }

        if !input.exists() {
            return Err(LoadError::StagePipeline {
                stage: Stage::Extract,
                file: file_name.to_string(),
                path: input.to_path_buf(),
            });
        }
        let checksum = sha256_file(input)?;
        if let Some(stem) = stem {
            info!("Extracting {:?} into {:?}", input, target);
            let partial = target.with_file_name(format!("{}.{}.partial", stem, uuid::Uuid::new_v4()));
            {
                let mut decoder = MultiGzDecoder::new(BufReader::new(File::open(input)?));
                let mut out = BufWriter::new(File::create(&partial)?);
                std::io::copy(&mut decoder, &mut out)?;
                out.flush()?;
            }
            std::fs::rename(&partial, &target)?;
        }
        debug!("{}: sha256 {}", file_name, checksum);
        Ok((target, Some(checksum)))
    }

    fn transform(&self, source: &Path, file: &FileMetadata, options: &LoadOptions) -> Result<Transformed> {
        info!("Transforming {}", file.file_ref());
        let extra_fields = if options.extra_genotype_fields.iter().any(|f| f == ALL_FIELDS) {
            None
        } else {
            Some(options.extra_genotype_fields.clone())
        };
        let parser = VCFParser::new()
            .with_fail_on_malformed(options.fail_on_malformed_variant)
            .with_exclude_genotypes(options.exclude_genotypes)
            .with_extra_fields(extra_fields);
        let parsed = parser.parse(source).map_err(|e| parse_error(&file.name, e))?;

        let work_dir = &self.ctx.config.work_dir;
        if !parsed.malformed.is_empty() {
            let path = work_dir.join(format!("{}.malformed.txt", file.name));
            write_malformed(&path, &parsed.malformed)?;
            warn!(
                "{}: {} malformed records written to {:?}",
                file.file_ref(),
                parsed.malformed.len(),
                path
            );
        }

        let (records, duplicated) = deduplicate(parsed.records, options.deduplication_policy);
        if !duplicated.is_empty() {
            let path = work_dir.join(format!("{}.duplicated.txt", file.name));
            write_duplicated(&path, &duplicated)?;
            warn!(
                "{}: {} duplicated records discarded ({:?} policy)",
                file.file_ref(),
                duplicated.len(),
                options.deduplication_policy
            );
        }

        let path = intermediate_path(work_dir, &file.name);
        let data = IntermediateFile {
            file_name: file.name.clone(),
            sample_names: parsed.sample_names,
            records,
            reference_blocks: parsed.reference_blocks,
        };
        write_intermediate(&path, &data)?;
        Ok(Transformed {
            path,
            records: data.records.len(),
            malformed: parsed.malformed.len(),
            duplicated: duplicated.len(),
            reference_blocks: data.reference_blocks.len(),
        })
    }

    /// Remove files from a study
    pub fn remove_files(&self, file_names: &[String], options: &LoadOptions) -> Result<RemoveReport> {
        let study = self.ctx.metadata.require_study(&options.study)?;
        let mut files = Vec::with_capacity(file_names.len());
        for name in file_names {
            files.push(self.ctx.metadata.require_file(study.id, name)?);
        }
        let file_ids: Vec<_> = files.iter().map(|f| f.id).collect();

        let coordinator = OperationCoordinator::new(self.ctx);
        let task = coordinator.begin_remove(study.id, &file_ids, options)?;

        match self.run_remove(&task, &files, options) {
            Ok(mut report) => {
                coordinator.end_operation(&task, Outcome::Ready)?;
                report.task_id = task.id;
                Ok(report)
            }
            Err(e) => {
                warn!("Removal of {:?} failed: {}", file_names, e);
                Err(coordinator.fail_operation(&task, e))
            }
        }
    }

    fn run_remove(&self, task: &TaskMetadata, files: &[FileMetadata], options: &LoadOptions) -> Result<RemoveReport> {
        let study_id = task.study_id;
        let removed: BTreeSet<_> = files.iter().map(|f| f.id).collect();

        // Samples still indexed once the removal completes
        let keep: BTreeSet<SampleId> = self
            .ctx
            .metadata
            .indexed_samples(study_id)?
            .into_iter()
            .filter(|s| s.files.iter().any(|id| !removed.contains(id)))
            .map(|s| s.id)
            .collect();

        let mut report = RemoveReport {
            files: files.iter().map(|f| f.file_ref()).collect(),
            ..RemoveReport::default()
        };
        let engine = MergeEngine::new(self.ctx);
        for file in files {
            self.check_stop(task, Stage::Remove)?;
            let stats = engine.remove_file(study_id, file, &keep, options)?;
            report.stats.variants_updated += stats.variants_updated;
            report.stats.variants_deleted += stats.variants_deleted;
            report.stats.archive_slices_deleted += stats.archive_slices_deleted;
        }

        let affected: BTreeSet<SampleId> = files.iter().flat_map(|f| f.samples.iter().copied()).collect();
        let builder = SampleIndexBuilder::new(self.ctx);
        for sample_id in affected {
            if keep.contains(&sample_id) {
                report.samples_rebuilt.push(sample_id);
            } else {
                builder.delete_sample(study_id, sample_id)?;
                report.samples_cleared.push(sample_id);
            }
        }
        if !report.samples_rebuilt.is_empty() {
            builder.build_samples(study_id, &report.samples_rebuilt, &[])?;
        }
        Ok(report)
    }
}

impl LoadReport {
    fn apply(&mut self, transformed: Transformed) {
        self.intermediate = Some(transformed.path);
        self.records = transformed.records;
        self.malformed = transformed.malformed;
        self.duplicated = transformed.duplicated;
        self.reference_blocks = transformed.reference_blocks;
    }
}

fn parse_error(file: &str, error: VCFParseError) -> LoadError {
    match error {
        VCFParseError::Malformed { record, reason } => LoadError::MalformedRecord {
            file: file.to_string(),
            record,
            reason,
        },
        VCFParseError::IoError(e) => LoadError::Io(e),
        other => LoadError::Vcf(other.to_string()),
    }
}

/// Resolve records sharing chromosome, position, reference and alternate.
///
/// Returns the kept records in file order and the discarded ones.
pub fn deduplicate(
    records: Vec<VariantRecord>,
    policy: DeduplicationPolicy,
) -> (Vec<VariantRecord>, Vec<VariantRecord>) {
    let mut occurrences: BTreeMap<VariantKey, Vec<usize>> = BTreeMap::new();
    for (i, record) in records.iter().enumerate() {
        occurrences.entry(record.key()).or_default().push(i);
    }
    if occurrences.len() == records.len() {
        return (records, Vec::new());
    }

    let mut keep = vec![true; records.len()];
    for indexes in occurrences.values().filter(|ix| ix.len() > 1) {
        match policy {
            DeduplicationPolicy::Discard => {
                for &i in indexes {
                    keep[i] = false;
                }
            }
            DeduplicationPolicy::MaxQual => {
                let mut best = indexes[0];
                for &i in &indexes[1..] {
                    let better = match (records[i].quality, records[best].quality) {
                        (Some(q), Some(b)) => q > b,
                        (Some(_), None) => true,
                        _ => false,
                    };
                    if better {
                        best = i;
                    }
                }
                for &i in indexes {
                    keep[i] = i == best;
                }
            }
        }
    }

    let mut kept = Vec::with_capacity(occurrences.len());
    let mut discarded = Vec::new();
    for (record, keep) in records.into_iter().zip(keep) {
        if keep {
            kept.push(record);
        } else {
            discarded.push(record);
        }
    }
    (kept, discarded)
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn side_file_writer(path: &Path) -> Result<csv::Writer<File>> {
    Ok(csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(path)?)
}

fn write_malformed(path: &Path, malformed: &[MalformedVariant]) -> Result<()> {
    let mut writer = side_file_writer(path)?;
    writer.write_record(["record", "variant", "reason"])?;
    for m in malformed {
        writer.write_record([m.record.to_string(), m.variant.clone(), m.reason.clone()])?;
    }
    writer.flush()?;
    Ok(())
}

fn write_duplicated(path: &Path, duplicated: &[VariantRecord]) -> Result<()> {
    let mut writer = side_file_writer(path)?;
    writer.write_record(["chromosome", "position", "reference", "alternate", "quality"])?;
    for r in duplicated {
        writer.write_record([
            r.chromosome.clone(),
            r.position.to_string(),
            r.reference.clone(),
            r.alternate.clone(),
            r.quality.map(|q| q.to_string()).unwrap_or_else(|| ".".to_string()),
        ])?;
    }
    writer.flush()?;
    Ok(())
}
