// ==============================================================================
// parsers/mod.rs - File parser modules
// ==============================================================================
// Description: Parsers for variant call input formats
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================

pub mod vcf;

pub use vcf::{MalformedVariant, ParsedFile, ParsedRecord, VCFParseError, VCFParser};
