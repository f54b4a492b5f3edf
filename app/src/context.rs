// ==============================================================================
// context.rs - Storage Context
// ==============================================================================
// Description: Owns the metadata store, the variant backend and the stop
//              signal for one storage directory; passed by reference to every
//              operation
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::backend::VariantBackend;
use crate::config::StorageConfig;
use crate::error::Result;
use crate::metadata::MetadataStore;
use crate::models::StudyMetadata;

/// Cooperative cancellation flag checked at stage boundaries
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        warn!("Stop requested");
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear the flag so the context can run another operation
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct StorageContext {
    pub config: StorageConfig,
    pub metadata: MetadataStore,
    pub backend: VariantBackend,
    stop: StopSignal,
}

impl StorageContext {
    /// Open the storage directory named by `config`, creating it if needed
    pub fn open(config: StorageConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.storage_dir)?;
        std::fs::create_dir_all(&config.work_dir)?;

        let metadata = MetadataStore::open(config.metadata_path(), &config)?;
        let backend = VariantBackend::open(config.variants_path(), &config)?;
        info!("Opened storage at {}", config.storage_dir.display());

        Ok(Self {
            config,
            metadata,
            backend,
            stop: StopSignal::new(),
        })
    }

    /// Open with default settings rooted at `dir`
    pub fn open_dir(dir: impl AsRef<Path>) -> Result<Self> {
        Self::open(StorageConfig::for_dir(dir))
    }

    /// In-memory stores; the work directory still lives on disk
    pub fn open_in_memory(work_dir: impl AsRef<Path>) -> Result<Self> {
        let config = StorageConfig::for_dir(work_dir);
        std::fs::create_dir_all(&config.work_dir)?;
        Ok(Self {
            metadata: MetadataStore::open_in_memory()?,
            backend: VariantBackend::open_in_memory()?,
            config,
            stop: StopSignal::new(),
        })
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn study(&self, name: &str) -> Result<StudyMetadata> {
        self.metadata.get_or_create_study(name)
    }

    pub fn sample_index_version(&self) -> u32 {
        self.config.sample_index_version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_creates_layout() {
        let dir = tempdir().unwrap();
        let ctx = StorageContext::open_dir(dir.path().join("store")).unwrap();

        assert!(ctx.config.metadata_path().exists());
        assert!(ctx.config.variants_path().exists());
        assert!(ctx.config.work_dir.is_dir());
    }

    #[test]
    fn test_reopen_sees_same_metadata() {
        let dir = tempdir().unwrap();
        {
            let ctx = StorageContext::open_dir(dir.path()).unwrap();
            ctx.study("1kg").unwrap();
        }
        let ctx = StorageContext::open_dir(dir.path()).unwrap();
        assert!(ctx.metadata.study_by_name("1kg").unwrap().is_some());
    }

    #[test]
    fn test_stop_signal_is_shared() {
        let dir = tempdir().unwrap();
        let ctx = StorageContext::open_in_memory(dir.path()).unwrap();
        let signal = ctx.stop_signal();
        assert!(!ctx.stop_signal().is_stopped());

        signal.stop();
        assert!(ctx.stop_signal().is_stopped());
        signal.reset();
        assert!(!ctx.stop_signal().is_stopped());
    }
}
