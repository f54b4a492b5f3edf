// ==============================================================================
// models.rs - Storage Data Models
// ==============================================================================
// Description: Study, file, sample, task and variant records shared by every
//              stage of the load/merge/removal engine
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub type StudyId = u32;
pub type FileId = u32;
pub type SampleId = u32;
pub type TaskId = u32;

/// Free-form attribute map carried by studies, files, samples and tasks
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// Study attribute naming the cohort refreshed after every load
pub const DEFAULT_COHORT_ATTRIBUTE: &str = "defaultCohort";

/// Name of the cohort that contains every indexed sample
pub const DEFAULT_COHORT: &str = "ALL";

/// File attribute recording whether archive slices were written
pub const LOAD_ARCHIVE_ATTRIBUTE: &str = "loadArchive";

/// File attribute holding the SHA-256 of the extracted input
pub const CHECKSUM_ATTRIBUTE: &str = "sha256";

/// Sample attribute holding the longest REF/ALT seen for the sample
pub const LARGEST_VARIANT_LENGTH: &str = "largestVariantLength";

/// Sample attribute holding the digest of the sample index entries
pub const SAMPLE_INDEX_DIGEST: &str = "sampleIndexDigest";

/// Genotype stored when genotypes are excluded from the load
pub const UNKNOWN_GENOTYPE: &str = "?/?";

/// Lifecycle status shared by files, samples and tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    None,
    Running,
    /// Load stage committed, post-load steps still pending
    Done,
    Ready,
    Error,
    /// Data is known to be inconsistent; the file must be removed before reloading
    Invalid,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::None => "NONE",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Done => "DONE",
            TaskStatus::Ready => "READY",
            TaskStatus::Error => "ERROR",
            TaskStatus::Invalid => "INVALID",
        }
    }

    /// RUNNING and DONE tasks still hold their files
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Running | TaskStatus::Done)
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        TaskStatus::None
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of long-running operation tracked by a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    Load,
    Remove,
    Annotate,
    SampleIndex,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Load => "load",
            TaskType::Remove => "remove",
            TaskType::Annotate => "annotate",
            TaskType::SampleIndex => "sample-index",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How several files relate to the same set of samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SplitData {
    /// One file per sample set
    None,
    /// Files cover disjoint genomic regions
    Region,
    /// Files cover disjoint chromosomes
    Chromosome,
    /// Files deliberately overlap; discrepancies are recorded
    Multi,
}

impl SplitData {
    pub fn as_str(&self) -> &'static str {
        match self {
            SplitData::None => "NONE",
            SplitData::Region => "REGION",
            SplitData::Chromosome => "CHROMOSOME",
            SplitData::Multi => "MULTI",
        }
    }

    /// Split modes where an overlapping call is a hard error
    pub fn is_disjoint(&self) -> bool {
        matches!(self, SplitData::Region | SplitData::Chromosome)
    }
}

impl Default for SplitData {
    fn default() -> Self {
        SplitData::None
    }
}

impl fmt::Display for SplitData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregation mode of a study
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Aggregation {
    None,
    Basic,
}

impl Default for Aggregation {
    fn default() -> Self {
        Aggregation::None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyMetadata {
    pub id: StudyId,
    pub name: String,
    #[serde(default)]
    pub aggregation: Aggregation,
    #[serde(default)]
    pub attributes: Attributes,
}

impl StudyMetadata {
    pub fn new(id: StudyId, name: impl Into<String>) -> Self {
        let mut attributes = Attributes::new();
        attributes.insert(
            DEFAULT_COHORT_ATTRIBUTE.to_string(),
            serde_json::Value::String(DEFAULT_COHORT.to_string()),
        );
        Self {
            id,
            name: name.into(),
            aggregation: Aggregation::None,
            attributes,
        }
    }

    pub fn default_cohort(&self) -> &str {
        self.attributes
            .get(DEFAULT_COHORT_ATTRIBUTE)
            .and_then(|v| v.as_str())
            .unwrap_or(DEFAULT_COHORT)
    }
}

/// Name and id of a file, rendered the way error messages quote files
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileRef {
    pub id: FileId,
    pub name: String,
}

impl fmt::Display for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\" (id={})", self.name, self.id)
    }
}

/// Render a list of files as `["a.vcf" (id=1), "b.vcf" (id=2)]`
pub fn format_files(files: &[FileRef]) -> String {
    let parts: Vec<String> = files.iter().map(|f| f.to_string()).collect();
    format!("[{}]", parts.join(", "))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub id: FileId,
    pub study_id: StudyId,
    pub name: String,
    pub path: String,
    /// Sample ids in the column order of the file
    pub samples: Vec<SampleId>,
    #[serde(default)]
    pub index_status: TaskStatus,
    #[serde(default)]
    pub split_data: SplitData,
    #[serde(default)]
    pub attributes: Attributes,
}

impl FileMetadata {
    pub fn is_indexed(&self) -> bool {
        self.index_status == TaskStatus::Ready
    }

    pub fn file_ref(&self) -> FileRef {
        FileRef {
            id: self.id,
            name: self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleMetadata {
    pub id: SampleId,
    pub study_id: StudyId,
    pub name: String,
    /// READY files contributing this sample
    #[serde(default)]
    pub files: Vec<FileId>,
    #[serde(default)]
    pub index_status: TaskStatus,
    #[serde(default)]
    pub annotation_status: TaskStatus,
    #[serde(default)]
    pub secondary_annotation_index_status: TaskStatus,
    /// Sample index status per schema version
    #[serde(default)]
    pub sample_index_status: BTreeMap<u32, TaskStatus>,
    /// Sample index annotation status per schema version
    #[serde(default)]
    pub sample_index_annotation_status: BTreeMap<u32, TaskStatus>,
    #[serde(default)]
    pub split_data: SplitData,
    #[serde(default)]
    pub attributes: Attributes,
}

impl SampleMetadata {
    pub fn new(study_id: StudyId, id: SampleId, name: impl Into<String>) -> Self {
        Self {
            id,
            study_id,
            name: name.into(),
            files: Vec::new(),
            index_status: TaskStatus::None,
            annotation_status: TaskStatus::None,
            secondary_annotation_index_status: TaskStatus::None,
            sample_index_status: BTreeMap::new(),
            sample_index_annotation_status: BTreeMap::new(),
            split_data: SplitData::None,
            attributes: Attributes::new(),
        }
    }

    pub fn is_indexed(&self) -> bool {
        self.index_status == TaskStatus::Ready
    }

    pub fn is_multi_file(&self) -> bool {
        self.files.len() > 1
    }

    pub fn sample_index_status(&self, version: u32) -> TaskStatus {
        self.sample_index_status.get(&version).copied().unwrap_or_default()
    }

    pub fn sample_index_annotation_status(&self, version: u32) -> TaskStatus {
        self.sample_index_annotation_status
            .get(&version)
            .copied()
            .unwrap_or_default()
    }

    pub fn largest_variant_length(&self) -> u64 {
        self.attributes
            .get(LARGEST_VARIANT_LENGTH)
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    }

    /// Mark that new unannotated data landed for this sample
    pub fn reset_annotation(&mut self) {
        self.annotation_status = TaskStatus::None;
        self.secondary_annotation_index_status = TaskStatus::None;
        for status in self.sample_index_annotation_status.values_mut() {
            *status = TaskStatus::None;
        }
    }

    /// Drop everything a load wrote, leaving the record as registered
    pub fn reset_loaded_state(&mut self) {
        let name = std::mem::take(&mut self.name);
        let attributes = std::mem::take(&mut self.attributes);
        *self = SampleMetadata {
            attributes,
            ..SampleMetadata::new(self.study_id, self.id, name)
        };
        self.attributes.remove(LARGEST_VARIANT_LENGTH);
        self.attributes.remove(SAMPLE_INDEX_DIGEST);
    }
}

/// One entry of a task's append-only status history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub status: TaskStatus,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub id: TaskId,
    pub study_id: StudyId,
    pub name: String,
    pub task_type: TaskType,
    pub file_ids: Vec<FileId>,
    /// Ordered by timestamp, oldest first
    pub status: Vec<StatusEvent>,
    /// Index status of each file before the task touched it
    #[serde(default)]
    pub pre_status: BTreeMap<FileId, TaskStatus>,
    #[serde(default)]
    pub attributes: Attributes,
}

impl TaskMetadata {
    pub fn new(
        study_id: StudyId,
        id: TaskId,
        task_type: TaskType,
        file_ids: Vec<FileId>,
    ) -> Self {
        let mut file_ids = file_ids;
        file_ids.sort_unstable();
        file_ids.dedup();
        Self {
            id,
            study_id,
            name: task_type.as_str().to_string(),
            task_type,
            file_ids,
            status: Vec::new(),
            pre_status: BTreeMap::new(),
            attributes: Attributes::new(),
        }
    }

    /// Status with the latest timestamp
    pub fn current_status(&self) -> TaskStatus {
        self.status
            .last()
            .map(|event| event.status)
            .unwrap_or(TaskStatus::None)
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.status.first().map(|event| event.at)
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.status.last().map(|event| event.at)
    }

    /// Number of times the task was (re)started
    pub fn attempts(&self) -> usize {
        self.status
            .iter()
            .filter(|event| event.status == TaskStatus::Running)
            .count()
    }

    /// Append a status; timestamps stay strictly increasing
    pub fn push_status(&mut self, status: TaskStatus) {
        let mut at = Utc::now();
        if let Some(last) = self.status.last() {
            if at <= last.at {
                at = last.at + Duration::milliseconds(1);
            }
        }
        self.status.push(StatusEvent { status, at });
    }

    /// Same type over exactly the same files
    pub fn is_same_operation(&self, task_type: TaskType, file_ids: &[FileId]) -> bool {
        let mut requested = file_ids.to_vec();
        requested.sort_unstable();
        requested.dedup();
        self.task_type == task_type && self.file_ids == requested
    }
}

/// Position and alleles of one biallelic variant
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VariantKey {
    pub chromosome: String,
    pub position: u64,
    pub reference: String,
    pub alternate: String,
}

impl VariantKey {
    pub fn new(
        chromosome: impl Into<String>,
        position: u64,
        reference: impl Into<String>,
        alternate: impl Into<String>,
    ) -> Self {
        Self {
            chromosome: chromosome.into(),
            position,
            reference: reference.into(),
            alternate: alternate.into(),
        }
    }

    /// Longest allele, used for the largest-variant-length hint
    pub fn length(&self) -> u64 {
        self.reference.len().max(self.alternate.len()) as u64
    }
}

impl fmt::Display for VariantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.chromosome, self.position, self.reference, self.alternate
        )
    }
}

/// Genotype and kept FORMAT fields of one sample in one record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleCall {
    pub genotype: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
}

/// Normalised, biallelic record produced by the transform stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantRecord {
    pub chromosome: String,
    pub position: u64,
    pub reference: String,
    pub alternate: String,
    #[serde(default)]
    pub ids: Vec<String>,
    pub quality: Option<f32>,
    pub filter: String,
    /// One call per file sample, in file sample order
    pub calls: Vec<SampleCall>,
}

impl VariantRecord {
    pub fn key(&self) -> VariantKey {
        VariantKey::new(
            self.chromosome.clone(),
            self.position,
            self.reference.clone(),
            self.alternate.clone(),
        )
    }
}

/// Stretch of reference-only calls of one file: a gVCF `<NON_REF>` block or
/// a record without alternate alleles. Both ends are inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceBlock {
    pub chromosome: String,
    pub start: u64,
    pub end: u64,
    /// One genotype per file sample, in file sample order
    pub genotypes: Vec<String>,
}

impl ReferenceBlock {
    pub fn covers(&self, position: u64) -> bool {
        self.start <= position && position <= self.end
    }
}

/// Genotype of one sample in a merged variant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleEntry {
    pub sample_id: SampleId,
    pub genotype: String,
    /// File the call came from; `None` for fill entries
    pub file_id: Option<FileId>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
}

/// Per-file site data of a merged variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub file_id: FileId,
    pub quality: Option<f32>,
    pub filter: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IssueKind {
    Discrepancy,
}

/// A call that lost duplicate resolution against the primary sample entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueEntry {
    pub kind: IssueKind,
    pub sample_id: SampleId,
    pub file_id: FileId,
    pub genotype: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
}

/// Consolidated multi-sample, multi-file record for one variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedVariant {
    pub chromosome: String,
    pub position: u64,
    pub reference: String,
    pub alternate: String,
    /// Sorted by sample id
    pub samples: Vec<SampleEntry>,
    /// Sorted by file id
    pub files: Vec<FileEntry>,
    /// Sorted by (sample id, file id)
    #[serde(default)]
    pub issues: Vec<IssueEntry>,
}

impl MergedVariant {
    pub fn new(key: &VariantKey) -> Self {
        Self {
            chromosome: key.chromosome.clone(),
            position: key.position,
            reference: key.reference.clone(),
            alternate: key.alternate.clone(),
            samples: Vec::new(),
            files: Vec::new(),
            issues: Vec::new(),
        }
    }

    pub fn key(&self) -> VariantKey {
        VariantKey::new(
            self.chromosome.clone(),
            self.position,
            self.reference.clone(),
            self.alternate.clone(),
        )
    }

    pub fn sample(&self, sample_id: SampleId) -> Option<&SampleEntry> {
        self.samples.iter().find(|s| s.sample_id == sample_id)
    }

    pub fn file(&self, file_id: FileId) -> Option<&FileEntry> {
        self.files.iter().find(|f| f.file_id == file_id)
    }

    /// True when no file contributes any call
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Raw calls of one file inside one genomic block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveSlice {
    pub file_batch: u32,
    pub chromosome: String,
    pub position_block: u64,
    pub file_id: FileId,
    pub records: Vec<VariantRecord>,
    /// Reference blocks starting inside this block
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reference_blocks: Vec<ReferenceBlock>,
}
