// ==============================================================================
// archive.rs - Archive Slices
// ==============================================================================
// Description: Groups a file's normalised records into per-block archive
//              slices and reads them back
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================

use std::collections::BTreeMap;
use tracing::debug;

use crate::config::StorageConfig;
use crate::context::StorageContext;
use crate::error::Result;
use crate::models::{ArchiveSlice, FileId, ReferenceBlock, StudyId, VariantRecord};

/// Split records into slices addressed by `(file batch, chromosome, block)`.
///
/// A reference block lives in the slice of its start position only.
pub fn build_slices(
    file_id: FileId,
    records: &[VariantRecord],
    reference_blocks: &[ReferenceBlock],
    config: &StorageConfig,
) -> Vec<ArchiveSlice> {
    let file_batch = file_id / config.archive_file_batch_size;
    let mut blocks: BTreeMap<(String, u64), (Vec<VariantRecord>, Vec<ReferenceBlock>)> = BTreeMap::new();
    for record in records {
        let block = record.position / config.archive_block_size;
        blocks
            .entry((record.chromosome.clone(), block))
            .or_default()
            .0
            .push(record.clone());
    }
    for reference in reference_blocks {
        let block = reference.start / config.archive_block_size;
        blocks
            .entry((reference.chromosome.clone(), block))
            .or_default()
            .1
            .push(reference.clone());
    }

    blocks
        .into_iter()
        .map(|((chromosome, position_block), (records, reference_blocks))| ArchiveSlice {
            file_batch,
            chromosome,
            position_block,
            file_id,
            records,
            reference_blocks,
        })
        .collect()
}

/// Write the archive of one file; returns the number of slices
pub fn write_archive(
    ctx: &StorageContext,
    study_id: StudyId,
    file_id: FileId,
    records: &[VariantRecord],
    reference_blocks: &[ReferenceBlock],
) -> Result<usize> {
    let slices = build_slices(file_id, records, reference_blocks, &ctx.config);
    ctx.backend.put_archive_slices(study_id, &slices)?;
    debug!(
        "File {}: {} archive slices written ({} reference blocks)",
        file_id,
        slices.len(),
        reference_blocks.len()
    );
    Ok(slices.len())
}

/// Records of one file as archived, in position order
pub fn read_archive(ctx: &StorageContext, study_id: StudyId, file_id: FileId) -> Result<Vec<VariantRecord>> {
    Ok(ctx
        .backend
        .archive_slices(study_id, file_id)?
        .into_iter()
        .flat_map(|slice| slice.records)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(chromosome: &str, position: u64) -> VariantRecord {
        VariantRecord {
            chromosome: chromosome.to_string(),
            position,
            reference: "A".to_string(),
            alternate: "T".to_string(),
            ids: Vec::new(),
            quality: None,
            filter: ".".to_string(),
            calls: Vec::new(),
        }
    }

    #[test]
    fn test_slices_follow_block_boundaries() {
        let config = StorageConfig::default();
        let records = vec![
            record("20", 10),
            record("20", 999),
            record("20", 1_000),
            record("21", 5),
        ];

        let slices = build_slices(1_500, &records, &[], &config);

        assert_eq!(slices.len(), 3);
        assert!(slices.iter().all(|s| s.file_batch == 1));
        assert_eq!(slices[0].position_block, 0);
        assert_eq!(slices[0].records.len(), 2);
        assert_eq!(slices[1].position_block, 1);
        assert_eq!(slices[2].chromosome, "21");
    }

    #[test]
    fn test_write_then_read_archive() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = StorageContext::open_in_memory(dir.path()).unwrap();
        let records = vec![record("1", 100), record("1", 5_000)];

        assert_eq!(write_archive(&ctx, 1, 7, &records, &[]).unwrap(), 2);
        assert_eq!(read_archive(&ctx, 1, 7).unwrap(), records);
        assert!(read_archive(&ctx, 1, 8).unwrap().is_empty());
    }

    #[test]
    fn test_reference_block_stored_at_its_start() {
        let config = StorageConfig::default();
        let reference = ReferenceBlock {
            chromosome: "20".to_string(),
            start: 900,
            end: 2_500,
            genotypes: vec!["0/0".to_string()],
        };

        let slices = build_slices(1, &[record("20", 1_200)], &[reference.clone()], &config);

        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].position_block, 0);
        assert!(slices[0].records.is_empty());
        assert_eq!(slices[0].reference_blocks, vec![reference]);
        assert_eq!(slices[1].position_block, 1);
        assert!(slices[1].reference_blocks.is_empty());
    }
}
