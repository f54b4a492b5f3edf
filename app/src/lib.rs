// ==============================================================================
// lib.rs - Variant Storage Library
// ==============================================================================
// Description: Library interface for the variant load/merge/removal engine
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================

pub mod annotation;
pub mod archive;
pub mod audit;
pub mod backend;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
#[cfg(any(test, feature = "fixtures"))]
pub mod fixtures;
pub mod genotype;
pub mod intermediate;
pub mod janitor;
pub mod merge;
pub mod metadata;
pub mod models;
pub mod parsers;
pub mod pipeline;
pub mod query;
pub mod sample_index;
pub mod stats;

pub use config::{DeduplicationPolicy, LoadOptions, StorageConfig};
pub use context::{StopSignal, StorageContext};
pub use error::{LoadError, Result};
pub use pipeline::{FileOutcome, Loader, MergeLoader, VariantStoragePipeline};
