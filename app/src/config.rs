// ==============================================================================
// config.rs - Storage and Operation Configuration
// ==============================================================================
// Description: Storage layout settings and the per-operation parameters
//              consumed by the ETL pipeline
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{LoadError, Result};
use crate::models::SplitData;

/// Keyword selecting every FORMAT field in `extra_genotype_fields`
pub const ALL_FIELDS: &str = "all";

/// How to choose between two calls for the same variant and sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeduplicationPolicy {
    /// Keep the call with the highest QUAL; lower file id wins ties
    MaxQual,
    /// Drop duplicated records inside a file; across files the lower file id wins
    Discard,
}

impl Default for DeduplicationPolicy {
    fn default() -> Self {
        DeduplicationPolicy::MaxQual
    }
}

/// Parameters of one load/remove invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoadOptions {
    pub study: String,
    pub load_split_data: SplitData,
    /// Samples may appear in several files without a split mode (treated as MULTI)
    pub load_multi_file_data: bool,
    pub resume: bool,
    pub force: bool,
    pub deduplication_policy: DeduplicationPolicy,
    pub fail_on_malformed_variant: bool,
    /// FORMAT keys kept next to GT; `all` keeps every key
    pub extra_genotype_fields: Vec<String>,
    pub exclude_genotypes: bool,
    pub load_archive: bool,
    /// Genotype written for samples with no call at a variant
    pub fill_genotype: String,
    pub do_extract: bool,
    pub do_transform: bool,
    pub do_load: bool,
    pub calculate_stats: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            study: "default".to_string(),
            load_split_data: SplitData::None,
            load_multi_file_data: false,
            resume: false,
            force: false,
            deduplication_policy: DeduplicationPolicy::MaxQual,
            fail_on_malformed_variant: false,
            extra_genotype_fields: Vec::new(),
            exclude_genotypes: false,
            load_archive: true,
            fill_genotype: "./.".to_string(),
            do_extract: true,
            do_transform: true,
            do_load: true,
            calculate_stats: false,
        }
    }
}

impl LoadOptions {
    pub fn new(study: impl Into<String>) -> Self {
        Self {
            study: study.into(),
            ..Self::default()
        }
    }

    pub fn with_split_data(mut self, split_data: SplitData) -> Self {
        self.load_split_data = split_data;
        self
    }

    pub fn with_multi_file_data(mut self, enabled: bool) -> Self {
        self.load_multi_file_data = enabled;
        self
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_deduplication_policy(mut self, policy: DeduplicationPolicy) -> Self {
        self.deduplication_policy = policy;
        self
    }

    pub fn with_fail_on_malformed(mut self, fail: bool) -> Self {
        self.fail_on_malformed_variant = fail;
        self
    }

    pub fn with_extra_genotype_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_genotype_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_exclude_genotypes(mut self, exclude: bool) -> Self {
        self.exclude_genotypes = exclude;
        self
    }

    pub fn with_load_archive(mut self, load_archive: bool) -> Self {
        self.load_archive = load_archive;
        self
    }

    pub fn with_fill_genotype(mut self, genotype: impl Into<String>) -> Self {
        self.fill_genotype = genotype.into();
        self
    }

    pub fn with_stages(mut self, extract: bool, transform: bool, load: bool) -> Self {
        self.do_extract = extract;
        self.do_transform = transform;
        self.do_load = load;
        self
    }

    pub fn with_calculate_stats(mut self, enabled: bool) -> Self {
        self.calculate_stats = enabled;
        self
    }

    /// Split mode actually applied to the loaded samples
    pub fn effective_split_data(&self) -> SplitData {
        if self.load_split_data == SplitData::None && self.load_multi_file_data {
            SplitData::Multi
        } else {
            self.load_split_data
        }
    }

    /// Whether a FORMAT key other than GT is kept
    pub fn keeps_field(&self, key: &str) -> bool {
        self.extra_genotype_fields
            .iter()
            .any(|f| f == key || f.eq_ignore_ascii_case(ALL_FIELDS))
    }
}

/// Storage layout and engine-wide settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageConfig {
    /// Directory holding `metadata.db` and `variants.db`
    pub storage_dir: PathBuf,
    /// Scratch directory for extracted and transformed files
    pub work_dir: PathBuf,
    pub sample_index_version: u32,
    /// Width in bp of one sample index batch
    pub sample_index_batch_size: u64,
    /// Width in bp of one archive position block
    pub archive_block_size: u64,
    /// Files per archive batch
    pub archive_file_batch_size: u32,
    /// Compare-and-swap attempts before giving up
    pub max_update_retries: usize,
    /// Attempts for a backend write hitting a busy database
    pub max_backend_retries: usize,
    /// Milliseconds SQLite waits on a locked database
    pub busy_timeout_ms: u64,
    pub defaults: LoadOptions,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("/data/variant-storage"),
            work_dir: PathBuf::from("/data/variant-storage/work"),
            sample_index_version: 1,
            sample_index_batch_size: 1_000_000,
            archive_block_size: 1_000,
            archive_file_batch_size: 1_000,
            max_update_retries: 20,
            max_backend_retries: 3,
            busy_timeout_ms: 30_000,
            defaults: LoadOptions::default(),
        }
    }
}

impl StorageConfig {
    /// Config rooted at one directory, with the work dir inside it
    pub fn for_dir(storage_dir: impl AsRef<Path>) -> Self {
        let storage_dir = storage_dir.as_ref().to_path_buf();
        Self {
            work_dir: storage_dir.join("work"),
            storage_dir,
            ..Self::default()
        }
    }

    /// Load a JSON config file; missing keys fall back to defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading storage config from {}", path.display());
        let raw = std::fs::read_to_string(path)?;
        let config: StorageConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_index_version == 0 {
            return Err(LoadError::Config(
                "sampleIndexVersion must be at least 1".to_string(),
            ));
        }
        if self.sample_index_batch_size == 0 || self.archive_block_size == 0 {
            return Err(LoadError::Config(
                "batch and block sizes must be positive".to_string(),
            ));
        }
        if self.archive_file_batch_size == 0 {
            return Err(LoadError::Config(
                "archiveFileBatchSize must be positive".to_string(),
            ));
        }
        if self.max_update_retries == 0 || self.max_backend_retries == 0 {
            return Err(LoadError::Config("retry limits must be positive".to_string()));
        }
        Ok(())
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.storage_dir.join("metadata.db")
    }

    pub fn variants_path(&self) -> PathBuf {
        self.storage_dir.join("variants.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_options_from_partial_json() {
        let options: LoadOptions = serde_json::from_str(
            r#"{"study": "1kg", "loadSplitData": "CHROMOSOME", "deduplicationPolicy": "discard"}"#,
        )
        .unwrap();

        assert_eq!(options.study, "1kg");
        assert_eq!(options.load_split_data, SplitData::Chromosome);
        assert_eq!(options.deduplication_policy, DeduplicationPolicy::Discard);
        assert!(options.load_archive);
        assert_eq!(options.fill_genotype, "./.");
    }

    #[test]
    fn test_multi_file_data_implies_multi() {
        let options = LoadOptions::new("s").with_multi_file_data(true);
        assert_eq!(options.effective_split_data(), SplitData::Multi);

        let options = LoadOptions::new("s")
            .with_split_data(SplitData::Region)
            .with_multi_file_data(true);
        assert_eq!(options.effective_split_data(), SplitData::Region);
    }

    #[test]
    fn test_keeps_field() {
        let options = LoadOptions::new("s").with_extra_genotype_fields(["DP"]);
        assert!(options.keeps_field("DP"));
        assert!(!options.keeps_field("GQ"));

        let options = LoadOptions::new("s").with_extra_genotype_fields(["ALL"]);
        assert!(options.keeps_field("GQ"));
    }

    #[test]
    fn test_config_file_round_trip_with_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("storage.json");
        std::fs::write(&path, r#"{"storageDir": "/tmp/vs", "sampleIndexVersion": 2}"#).unwrap();

        let config = StorageConfig::from_file(&path).unwrap();
        assert_eq!(config.storage_dir, PathBuf::from("/tmp/vs"));
        assert_eq!(config.sample_index_version, 2);
        assert_eq!(config.sample_index_batch_size, 1_000_000);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("storage.json");
        std::fs::write(&path, r#"{"sampleIndexVersion": 0}"#).unwrap();

        assert!(matches!(
            StorageConfig::from_file(&path),
            Err(LoadError::Config(_))
        ));
    }
}
