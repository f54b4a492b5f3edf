// ==============================================================================
// intermediate.rs - Transform Stage Output
// ==============================================================================
// Description: Parquet representation of a transformed file: one row per
//              normalised variant with all sample calls of that file
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================
// Schema:
//   chromosome (utf8), position (uint64), reference (utf8), alternate (utf8),
//   ids (utf8, ';'-joined), quality (float32, nullable), filter (utf8),
//   calls (utf8, JSON array of sample calls)
//
// Key/value metadata carries the original file name and its sample names so
// a load-only run can register the file without the VCF, plus the file's
// reference blocks as JSON.
// ==============================================================================

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use arrow::array::{Array, ArrayRef, Float32Array, StringArray, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::file::metadata::KeyValue;
use parquet::file::properties::WriterProperties;

use crate::error::{LoadError, Result};
use crate::models::{ReferenceBlock, SampleCall, VariantRecord};

/// File extension of intermediate files
pub const INTERMEDIATE_EXTENSION: &str = "variants.parquet";

const FILE_NAME_KEY: &str = "variant_storage.file_name";
const SAMPLES_KEY: &str = "variant_storage.samples";
const REFERENCE_BLOCKS_KEY: &str = "variant_storage.reference_blocks";

/// Rows written per record batch
const BATCH_SIZE: usize = 10_000;

/// Contents of an intermediate file
#[derive(Debug, Clone, PartialEq)]
pub struct IntermediateFile {
    pub file_name: String,
    pub sample_names: Vec<String>,
    pub records: Vec<VariantRecord>,
    pub reference_blocks: Vec<ReferenceBlock>,
}

/// Path of the intermediate file for `file_name` inside `dir`
pub fn intermediate_path(dir: &Path, file_name: &str) -> PathBuf {
    dir.join(format!("{}.{}", file_name, INTERMEDIATE_EXTENSION))
}

pub fn is_intermediate(path: &Path) -> bool {
    path.to_string_lossy().ends_with(INTERMEDIATE_EXTENSION)
}

fn schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("chromosome", DataType::Utf8, false),
        Field::new("position", DataType::UInt64, false),
        Field::new("reference", DataType::Utf8, false),
        Field::new("alternate", DataType::Utf8, false),
        Field::new("ids", DataType::Utf8, false),
        Field::new("quality", DataType::Float32, true),
        Field::new("filter", DataType::Utf8, false),
        Field::new("calls", DataType::Utf8, false),
    ]))
}

/// Write a transformed file: records as rows, everything else as metadata
pub fn write_intermediate(path: &Path, data: &IntermediateFile) -> Result<()> {
    let records = &data.records;
    info!(
        "Writing intermediate file {:?} ({} records, {} reference blocks)",
        path,
        records.len(),
        data.reference_blocks.len()
    );

    let schema = schema();
    let props = WriterProperties::builder()
        .set_compression(parquet::basic::Compression::SNAPPY)
        .set_key_value_metadata(Some(vec![
            KeyValue::new(FILE_NAME_KEY.to_string(), data.file_name.clone()),
            KeyValue::new(SAMPLES_KEY.to_string(), serde_json::to_string(&data.sample_names)?),
            KeyValue::new(
                REFERENCE_BLOCKS_KEY.to_string(),
                serde_json::to_string(&data.reference_blocks)?,
            ),
        ]))
        .build();

    let file = File::create(path)?;
    let mut writer = ArrowWriter::try_new(file, schema.clone(), Some(props))?;

    for chunk in records.chunks(BATCH_SIZE) {
        let mut calls = Vec::with_capacity(chunk.len());
        for record in chunk {
            calls.push(serde_json::to_string(&record.calls)?);
        }

        let columns: Vec<ArrayRef> = vec![
            Arc::new(StringArray::from(
                chunk.iter().map(|r| r.chromosome.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(UInt64Array::from(
                chunk.iter().map(|r| r.position).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                chunk.iter().map(|r| r.reference.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                chunk.iter().map(|r| r.alternate.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                chunk.iter().map(|r| r.ids.join(";")).collect::<Vec<_>>(),
            )),
            Arc::new(Float32Array::from(
                chunk.iter().map(|r| r.quality).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                chunk.iter().map(|r| r.filter.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(calls)),
        ];

        let batch = RecordBatch::try_new(schema.clone(), columns)?;
        writer.write(&batch)?;
    }
    writer.close()?;
    Ok(())
}

/// File name and sample names, without decoding the rows
pub fn read_intermediate_header(path: &Path) -> Result<(String, Vec<String>)> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?;
    header_from_metadata(path, builder.metadata().file_metadata().key_value_metadata())
}

pub fn read_intermediate(path: &Path) -> Result<IntermediateFile> {
    debug!("Reading intermediate file {:?}", path);
    let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?;
    let metadata = builder.metadata().file_metadata().key_value_metadata();
    let (file_name, sample_names) = header_from_metadata(path, metadata)?;
    let reference_blocks = match metadata_value(metadata, REFERENCE_BLOCKS_KEY) {
        Some(json) => serde_json::from_str(&json)?,
        None => Vec::new(),
    };

    let mut records = Vec::new();
    for batch in builder.build()? {
        let batch = batch?;
        let chromosome = string_column(&batch, 0)?;
        let position = batch
            .column(1)
            .as_any()
            .downcast_ref::<UInt64Array>()
            .ok_or_else(|| column_error(1))?;
        let reference = string_column(&batch, 2)?;
        let alternate = string_column(&batch, 3)?;
        let ids = string_column(&batch, 4)?;
        let quality = batch
            .column(5)
            .as_any()
            .downcast_ref::<Float32Array>()
            .ok_or_else(|| column_error(5))?;
        let filter = string_column(&batch, 6)?;
        let calls = string_column(&batch, 7)?;

        for row in 0..batch.num_rows() {
            let ids = ids.value(row);
            let calls: Vec<SampleCall> = serde_json::from_str(calls.value(row))?;
            records.push(VariantRecord {
                chromosome: chromosome.value(row).to_string(),
                position: position.value(row),
                reference: reference.value(row).to_string(),
                alternate: alternate.value(row).to_string(),
                ids: if ids.is_empty() {
                    Vec::new()
                } else {
                    ids.split(';').map(str::to_string).collect()
                },
                quality: if quality.is_null(row) {
                    None
                } else {
                    Some(quality.value(row))
                },
                filter: filter.value(row).to_string(),
                calls,
            });
        }
    }

    Ok(IntermediateFile {
        file_name,
        sample_names,
        records,
        reference_blocks,
    })
}

fn metadata_value(metadata: Option<&Vec<KeyValue>>, key: &str) -> Option<String> {
    metadata
        .and_then(|kv| kv.iter().find(|entry| entry.key == key))
        .and_then(|entry| entry.value.clone())
}

fn header_from_metadata(path: &Path, metadata: Option<&Vec<KeyValue>>) -> Result<(String, Vec<String>)> {
    let lookup = |key: &str| metadata_value(metadata, key);

    let missing = |key: &str| {
        LoadError::Vcf(format!(
            "Intermediate file {} has no '{}' metadata",
            path.display(),
            key
        ))
    };
    let file_name = lookup(FILE_NAME_KEY).ok_or_else(|| missing(FILE_NAME_KEY))?;
    let samples = lookup(SAMPLES_KEY).ok_or_else(|| missing(SAMPLES_KEY))?;
    Ok((file_name, serde_json::from_str(&samples)?))
}

fn string_column(batch: &RecordBatch, index: usize) -> Result<&StringArray> {
    batch
        .column(index)
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| column_error(index))
}

fn column_error(index: usize) -> LoadError {
    LoadError::Vcf(format!("Unexpected type for intermediate column {}", index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    #[test]
    fn test_intermediate_keeps_records_and_header() {
        let dir = tempdir().unwrap();
        let path = intermediate_path(dir.path(), "chr20.vcf.gz");
        assert!(is_intermediate(&path));

        let mut fields = BTreeMap::new();
        fields.insert("DP".to_string(), "14".to_string());
        let records = vec![
            VariantRecord {
                chromosome: "20".to_string(),
                position: 60_343,
                reference: "G".to_string(),
                alternate: "A".to_string(),
                ids: vec!["rs527639301".to_string()],
                quality: Some(100.0),
                filter: "PASS".to_string(),
                calls: vec![
                    SampleCall { genotype: "0|1".to_string(), fields },
                    SampleCall { genotype: "0|0".to_string(), fields: BTreeMap::new() },
                ],
            },
            VariantRecord {
                chromosome: "20".to_string(),
                position: 60_419,
                reference: "A".to_string(),
                alternate: "G".to_string(),
                ids: Vec::new(),
                quality: None,
                filter: ".".to_string(),
                calls: vec![
                    SampleCall { genotype: "./.".to_string(), fields: BTreeMap::new() },
                    SampleCall { genotype: "1|1".to_string(), fields: BTreeMap::new() },
                ],
            },
        ];
        let samples = vec!["NA12877".to_string(), "NA12878".to_string()];
        let data = IntermediateFile {
            file_name: "chr20.vcf.gz".to_string(),
            sample_names: samples.clone(),
            records,
            reference_blocks: vec![ReferenceBlock {
                chromosome: "20".to_string(),
                start: 60_420,
                end: 61_000,
                genotypes: vec!["0/0".to_string(), "0/0".to_string()],
            }],
        };

        write_intermediate(&path, &data).unwrap();

        let (name, header_samples) = read_intermediate_header(&path).unwrap();
        assert_eq!(name, "chr20.vcf.gz");
        assert_eq!(header_samples, samples);

        assert_eq!(read_intermediate(&path).unwrap(), data);
    }

    #[test]
    fn test_parquet_without_metadata_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plain.parquet");
        let schema = schema();
        let file = File::create(&path).unwrap();
        let writer = ArrowWriter::try_new(file, schema, None).unwrap();
        writer.close().unwrap();

        assert!(matches!(
            read_intermediate_header(&path),
            Err(LoadError::Vcf(_))
        ));
    }
}
