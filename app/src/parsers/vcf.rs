// ==============================================================================
// parsers/vcf.rs - VCF file parser
// ==============================================================================
// Description: Reads VCF files with noodles-vcf and normalises every record
//              into biallelic variant records carrying all sample calls
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================
// References:
// - VCF 4.3 Spec: https://samtools.github.io/hts-specs/VCFv4.3.pdf
// - noodles-vcf: https://docs.rs/noodles-vcf/0.81.0/noodles_vcf/
// ==============================================================================

use noodles_vcf as vcf;
use noodles_vcf::variant::record::{AlternateBases, Ids};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

use crate::genotype::Genotype;
use crate::models::{ReferenceBlock, SampleCall, VariantRecord, UNKNOWN_GENOTYPE};

/// VCF parsing errors
#[derive(Error, Debug)]
pub enum VCFParseError {
    #[error("Failed to open VCF file: {0}")]
    FileOpenError(String),

    #[error("Failed to read VCF header: {0}")]
    HeaderError(String),

    #[error("Malformed record {record}: {reason}")]
    Malformed { record: u64, reason: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A record that could not be parsed
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedVariant {
    /// 1-based record number (header lines excluded)
    pub record: u64,
    /// `chrom:pos` when it could be read
    pub variant: String,
    pub reason: String,
}

/// Result of parsing one file
#[derive(Debug, Default)]
pub struct ParsedFile {
    pub sample_names: Vec<String>,
    pub records: Vec<VariantRecord>,
    pub malformed: Vec<MalformedVariant>,
    /// Records without a real alternate allele
    pub reference_blocks: Vec<ReferenceBlock>,
}

/// One VCF record after normalisation
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedRecord {
    /// One biallelic record per alternate allele
    Variants(Vec<VariantRecord>),
    Reference(ReferenceBlock),
}

/// VCF parser with normalisation options
pub struct VCFParser {
    /// Abort on the first malformed record instead of collecting it
    pub fail_on_malformed: bool,

    /// Replace GT with `?/?`
    pub exclude_genotypes: bool,

    /// FORMAT keys kept next to GT; `None` keeps every key
    pub extra_fields: Option<Vec<String>>,
}

impl Default for VCFParser {
    fn default() -> Self {
        Self {
            fail_on_malformed: false,
            exclude_genotypes: false,
            extra_fields: Some(Vec::new()),
        }
    }
}

impl VCFParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fail_on_malformed(mut self, fail: bool) -> Self {
        self.fail_on_malformed = fail;
        self
    }

    pub fn with_exclude_genotypes(mut self, exclude: bool) -> Self {
        self.exclude_genotypes = exclude;
        self
    }

    /// Keep these FORMAT keys besides GT; `None` keeps all of them
    pub fn with_extra_fields(mut self, fields: Option<Vec<String>>) -> Self {
        self.extra_fields = fields;
        self
    }

    /// Read only the sample names from the header
    pub fn read_sample_names(path: impl AsRef<Path>) -> Result<Vec<String>, VCFParseError> {
        let path = path.as_ref();
        let mut reader = vcf::io::reader::Builder::default()
            .build_from_path(path)
            .map_err(|e| VCFParseError::FileOpenError(format!("{}: {}", path.display(), e)))?;
        let header = reader
            .read_header()
            .map_err(|e| VCFParseError::HeaderError(format!("{}", e)))?;
        Ok(header.sample_names().iter().cloned().collect())
    }

    /// Parse a VCF file (`.vcf` or bgzipped `.vcf.gz`)
    pub fn parse(&self, path: impl AsRef<Path>) -> Result<ParsedFile, VCFParseError> {
        let path = path.as_ref();

        let mut reader = vcf::io::reader::Builder::default()
            .build_from_path(path)
            .map_err(|e| VCFParseError::FileOpenError(format!("{}: {}", path.display(), e)))?;

        let header = reader
            .read_header()
            .map_err(|e| VCFParseError::HeaderError(format!("{}", e)))?;

        let mut parsed = ParsedFile {
            sample_names: header.sample_names().iter().cloned().collect(),
            ..ParsedFile::default()
        };
        let sample_count = parsed.sample_names.len();

        for (index, result) in reader.records().enumerate() {
            let record_number = index as u64 + 1;
            let outcome = match result {
                Ok(record) => self
                    .parse_record(&record, sample_count)
                    .map_err(|reason| (describe_position(&record), reason)),
                Err(e) => Err((String::new(), format!("Failed to read record: {}", e))),
            };

            match outcome {
                Ok(ParsedRecord::Variants(records)) => parsed.records.extend(records),
                Ok(ParsedRecord::Reference(block)) => parsed.reference_blocks.push(block),
                Err((variant, reason)) => {
                    if self.fail_on_malformed {
                        return Err(VCFParseError::Malformed {
                            record: record_number,
                            reason,
                        });
                    }
                    warn!("Skipping malformed record {}: {}", record_number, reason);
                    parsed.malformed.push(MalformedVariant {
                        record: record_number,
                        variant,
                        reason,
                    });
                }
            }
        }

        debug!(
            "Parsed {}: {} records, {} malformed, {} reference blocks",
            path.display(),
            parsed.records.len(),
            parsed.malformed.len(),
            parsed.reference_blocks.len()
        );
        Ok(parsed)
    }

    /// Parse one record into one biallelic record per alternate allele, or a
    /// reference block when it has no alternate besides `<NON_REF>`
    fn parse_record(&self, record: &vcf::Record, sample_count: usize) -> Result<ParsedRecord, String> {
        let chromosome = normalize_chromosome(record.reference_sequence_name())?;

        let position = match record.variant_start() {
            Some(Ok(pos)) => usize::from(pos) as u64,
            Some(Err(e)) => return Err(format!("Invalid position: {}", e)),
            None => return Err("Missing position".to_string()),
        };

        let reference = record.reference_bases().to_ascii_uppercase();
        if !is_valid_bases(&reference) {
            return Err(format!("Invalid reference allele '{}'", reference));
        }

        // (allele index, allele); symbolic non-reference alleles keep their
        // index so genotypes remap correctly
        let mut alternates = Vec::new();
        let mut allele_count = 0;
        for (i, alt) in record.alternate_bases().iter().enumerate() {
            allele_count += 1;
            let alt = alt.map_err(|e| format!("Failed to get ALT allele: {}", e))?;
            let alt = if alt.starts_with('<') {
                alt.to_string()
            } else {
                alt.to_ascii_uppercase()
            };
            if !(alt.starts_with('<') || alt == "*" || is_valid_bases(&alt)) {
                return Err(format!("Invalid alternate allele '{}'", alt));
            }
            if !is_non_ref(&alt) {
                alternates.push((i as u32 + 1, alt));
            }
        }

        if alternates.is_empty() {
            let end = match info_end(record.info().as_ref())? {
                Some(end) if end < position => {
                    return Err(format!("END {} before position {}", end, position))
                }
                Some(end) => end,
                None => position + reference.len() as u64 - 1,
            };
            let genotypes = self
                .parse_samples(record.samples().as_ref(), sample_count)?
                .into_iter()
                .map(|(genotype, _)| {
                    if self.exclude_genotypes {
                        UNKNOWN_GENOTYPE.to_string()
                    } else {
                        genotype.to_string()
                    }
                })
                .collect();
            return Ok(ParsedRecord::Reference(ReferenceBlock {
                chromosome,
                start: position,
                end,
                genotypes,
            }));
        }

        let ids: Vec<String> = record.ids().iter().map(|id| id.to_string()).collect();

        let quality = match record.quality_score() {
            Some(Ok(q)) => Some(q),
            Some(Err(e)) => return Err(format!("Invalid QUAL: {}", e)),
            None => None,
        };

        let filter = {
            let filters = record.filters();
            let raw: &str = filters.as_ref();
            if raw.is_empty() {
                ".".to_string()
            } else {
                raw.to_string()
            }
        };

        let calls = self.parse_samples(record.samples().as_ref(), sample_count)?;

        let multiallelic = allele_count > 1;
        let mut records = Vec::with_capacity(alternates.len());
        for (alt_index, alternate) in alternates {
            let calls = calls
                .iter()
                .map(|(genotype, fields)| SampleCall {
                    genotype: if self.exclude_genotypes {
                        UNKNOWN_GENOTYPE.to_string()
                    } else if multiallelic {
                        genotype.remap(alt_index).to_string()
                    } else {
                        genotype.to_string()
                    },
                    fields: fields.clone(),
                })
                .collect();

            records.push(VariantRecord {
                chromosome: chromosome.clone(),
                position,
                reference: reference.clone(),
                alternate,
                ids: ids.clone(),
                quality,
                filter: filter.clone(),
                calls,
            });
        }
        Ok(ParsedRecord::Variants(records))
    }

    /// Split the raw FORMAT + sample columns into parsed calls
    fn parse_samples(
        &self,
        raw: &str,
        sample_count: usize,
    ) -> Result<Vec<(Genotype, BTreeMap<String, String>)>, String> {
        if raw.is_empty() {
            if sample_count == 0 {
                return Ok(Vec::new());
            }
            return Err(format!("Expected {} samples, found none", sample_count));
        }

        let mut columns = raw.split('\t');
        let format = columns.next().unwrap_or_default();
        let keys: Vec<&str> = format.split(':').collect();
        let gt_index = keys.iter().position(|&k| k == "GT");

        let mut calls = Vec::with_capacity(sample_count);
        for column in columns {
            let values: Vec<&str> = column.split(':').collect();

            let genotype = match gt_index.and_then(|i| values.get(i)) {
                Some(value) => {
                    Genotype::parse(value).map_err(|e| format!("Sample {}: {}", calls.len() + 1, e))?
                }
                None => Genotype::parse("./.").map_err(|e| e.to_string())?,
            };

            let mut fields = BTreeMap::new();
            for (key, value) in keys.iter().zip(values.iter()) {
                if *key != "GT" && self.keeps_field(key) {
                    fields.insert(key.to_string(), value.to_string());
                }
            }
            calls.push((genotype, fields));
        }

        if calls.len() != sample_count {
            return Err(format!(
                "Expected {} samples, found {}",
                sample_count,
                calls.len()
            ));
        }
        Ok(calls)
    }

    fn keeps_field(&self, key: &str) -> bool {
        match &self.extra_fields {
            None => true,
            Some(fields) => fields.iter().any(|f| f == key),
        }
    }
}

/// Strip a leading `chr` and reject empty names
pub fn normalize_chromosome(name: &str) -> Result<String, String> {
    let trimmed = name.trim();
    let stripped = if trimmed.len() > 3 && trimmed[..3].eq_ignore_ascii_case("chr") {
        &trimmed[3..]
    } else {
        trimmed
    };
    if stripped.is_empty() {
        return Err(format!("Invalid chromosome '{}'", name));
    }
    Ok(stripped.to_string())
}

/// `<NON_REF>` and `<*>` stand for "any other allele", not a variant
fn is_non_ref(alt: &str) -> bool {
    alt == "<NON_REF>" || alt == "<*>"
}

/// `END` from a raw INFO column
fn info_end(info: &str) -> Result<Option<u64>, String> {
    for entry in info.split(';') {
        if let Some(value) = entry.strip_prefix("END=") {
            return value
                .parse()
                .map(Some)
                .map_err(|_| format!("Invalid END '{}'", value));
        }
    }
    Ok(None)
}

fn is_valid_bases(bases: &str) -> bool {
    !bases.is_empty() && bases.bytes().all(|b| matches!(b, b'A' | b'C' | b'G' | b'T' | b'N'))
}

fn describe_position(record: &vcf::Record) -> String {
    match record.variant_start() {
        Some(Ok(pos)) => format!("{}:{}", record.reference_sequence_name(), usize::from(pos)),
        _ => record.reference_sequence_name().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const HEADER: &str = "##fileformat=VCFv4.3\n\
##contig=<ID=20>\n\
##INFO=<ID=END,Number=1,Type=Integer,Description=\"End position\">\n\
##ALT=<ID=NON_REF,Description=\"Any other allele\">\n\
##FORMAT=<ID=GT,Number=1,Type=String,Description=\"Genotype\">\n\
##FORMAT=<ID=DP,Number=1,Type=Integer,Description=\"Depth\">\n\
#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tA\tB\n";

    fn write_vcf(body: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".vcf").tempfile().unwrap();
        write!(file, "{}{}", HEADER, body).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_chromosome_normalization() {
        assert_eq!(normalize_chromosome("chr20").unwrap(), "20");
        assert_eq!(normalize_chromosome("CHRX").unwrap(), "X");
        assert_eq!(normalize_chromosome("22").unwrap(), "22");
        assert!(normalize_chromosome("").is_err());
    }

    #[test]
    fn test_parse_records_and_samples() {
        let file = write_vcf(
            "chr20\t238441\trs1\tt\tC\t45.5\tPASS\t.\tGT:DP\t0/1:12\t1/1:7\n\
20\t238500\t.\tA\tG\t.\t.\t.\tGT\t0/0\t./.\n",
        );

        let parsed = VCFParser::new()
            .with_extra_fields(Some(vec!["DP".to_string()]))
            .parse(file.path())
            .unwrap();

        assert_eq!(parsed.sample_names, vec!["A", "B"]);
        assert_eq!(parsed.records.len(), 2);

        let first = &parsed.records[0];
        assert_eq!(first.chromosome, "20");
        assert_eq!(first.reference, "T");
        assert_eq!(first.ids, vec!["rs1"]);
        assert_eq!(first.quality, Some(45.5));
        assert_eq!(first.filter, "PASS");
        assert_eq!(first.calls[0].genotype, "0/1");
        assert_eq!(first.calls[0].fields.get("DP").map(String::as_str), Some("12"));

        let second = &parsed.records[1];
        assert_eq!(second.quality, None);
        assert_eq!(second.calls[1].genotype, "./.");
    }

    #[test]
    fn test_multiallelic_split() {
        let file = write_vcf("20\t100\t.\tA\tG,T\t60\tPASS\t.\tGT\t1/2\t0/2\n");

        let parsed = VCFParser::new().parse(file.path()).unwrap();

        assert_eq!(parsed.records.len(), 2);
        assert_eq!(parsed.records[0].alternate, "G");
        assert_eq!(parsed.records[0].calls[0].genotype, "1/.");
        assert_eq!(parsed.records[0].calls[1].genotype, "0/.");
        assert_eq!(parsed.records[1].alternate, "T");
        assert_eq!(parsed.records[1].calls[0].genotype, "./1");
        assert_eq!(parsed.records[1].calls[1].genotype, "0/1");
    }

    #[test]
    fn test_malformed_records_are_collected() {
        let file = write_vcf(
            "20\t100\t.\tA\tG\t60\tPASS\t.\tGT\t0/1\t0/0\n\
20\t200\t.\tA\tG\t60\tPASS\t.\tGT\t0/1\n\
20\t300\t.\tQ\tG\t60\tPASS\t.\tGT\t0/1\t1/1\n",
        );

        let parsed = VCFParser::new().parse(file.path()).unwrap();

        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.malformed.len(), 2);
        assert_eq!(parsed.malformed[0].record, 2);
        assert!(parsed.malformed[0].reason.contains("Expected 2 samples"));
        assert_eq!(parsed.malformed[1].record, 3);
    }

    #[test]
    fn test_fail_on_malformed() {
        let file = write_vcf("20\t100\t.\tA\tG\t60\tPASS\t.\tGT\tX/1\t0/0\n");

        let err = VCFParser::new()
            .with_fail_on_malformed(true)
            .parse(file.path())
            .unwrap_err();

        assert!(matches!(err, VCFParseError::Malformed { record: 1, .. }));
    }

    #[test]
    fn test_exclude_genotypes() {
        let file = write_vcf("20\t100\t.\tA\tG\t60\tPASS\t.\tGT\t0/1\t1/1\n");

        let parsed = VCFParser::new()
            .with_exclude_genotypes(true)
            .parse(file.path())
            .unwrap();

        assert!(parsed.records[0].calls.iter().all(|c| c.genotype == "?/?"));
    }

    #[test]
    fn test_reference_blocks_are_kept() {
        let file = write_vcf(
            "20\t100\t.\tA\t<NON_REF>\t.\tPASS\tEND=200\tGT\t0/0\t0/0\n\
20\t201\t.\tC\tT,<NON_REF>\t50\tPASS\t.\tGT\t0/1\t0/2\n\
20\t300\t.\tGA\t.\t.\tPASS\t.\tGT\t0/0\t./.\n",
        );

        let parsed = VCFParser::new().parse(file.path()).unwrap();

        assert_eq!(
            parsed.reference_blocks,
            vec![
                ReferenceBlock {
                    chromosome: "20".to_string(),
                    start: 100,
                    end: 200,
                    genotypes: vec!["0/0".to_string(), "0/0".to_string()],
                },
                ReferenceBlock {
                    chromosome: "20".to_string(),
                    start: 300,
                    end: 301,
                    genotypes: vec!["0/0".to_string(), "./.".to_string()],
                },
            ]
        );
        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.records[0].alternate, "T");
        assert_eq!(parsed.records[0].calls[0].genotype, "0/1");
        assert_eq!(parsed.records[0].calls[1].genotype, "0/.");
    }

    #[test]
    fn test_reference_block_ending_before_start_is_malformed() {
        let file = write_vcf("20\t100\t.\tA\t<NON_REF>\t.\tPASS\tEND=50\tGT\t0/0\t0/0\n");

        let parsed = VCFParser::new().parse(file.path()).unwrap();

        assert!(parsed.reference_blocks.is_empty());
        assert!(parsed.malformed[0].reason.contains("END 50"));
    }
}
