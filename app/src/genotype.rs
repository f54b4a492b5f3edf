// ==============================================================================
// genotype.rs - Genotype Parsing and Classification
// ==============================================================================
// Description: Parses VCF GT values, classifies them for the sample index and
//              statistics, and remaps allele indexes when splitting
//              multi-allelic records
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================
// Algorithm:
//   Given a GT value such as "0/1", "1|1" or "./.":
//   - all alleles 0            → HOM_REF
//   - all alleles equal, > 0   → HOM_ALT
//   - mixed called alleles     → HET
//   - any allele missing       → MISSING (no-call)
//   - "?/?"                    → UNKNOWN (genotypes excluded at load)
// ==============================================================================

use std::fmt;
use thiserror::Error;

use crate::models::UNKNOWN_GENOTYPE;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GenotypeError {
    #[error("Invalid genotype format: '{0}'")]
    InvalidFormat(String),

    #[error("Invalid allele '{allele}' in genotype '{genotype}'")]
    InvalidAllele { genotype: String, allele: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GenotypeClass {
    HomRef,
    Het,
    HomAlt,
    Missing,
    Unknown,
}

impl GenotypeClass {
    /// Classes stored in the sample index
    pub fn is_indexed(&self) -> bool {
        matches!(self, GenotypeClass::Het | GenotypeClass::HomAlt)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Genotype {
    /// `None` for a missing allele
    pub alleles: Vec<Option<u32>>,
    pub phased: bool,
    unknown: bool,
}

impl Genotype {
    pub fn parse(value: &str) -> Result<Self, GenotypeError> {
        if value == UNKNOWN_GENOTYPE {
            return Ok(Self {
                alleles: vec![None, None],
                phased: false,
                unknown: true,
            });
        }
        if value.is_empty() {
            return Err(GenotypeError::InvalidFormat(value.to_string()));
        }

        let phased = value.contains('|');
        if phased && value.contains('/') {
            return Err(GenotypeError::InvalidFormat(value.to_string()));
        }

        let mut alleles = Vec::new();
        for allele in value.split(|c| c == '/' || c == '|') {
            if allele == "." {
                alleles.push(None);
            } else {
                let index = allele.parse::<u32>().map_err(|_| GenotypeError::InvalidAllele {
                    genotype: value.to_string(),
                    allele: allele.to_string(),
                })?;
                alleles.push(Some(index));
            }
        }

        Ok(Self {
            alleles,
            phased,
            unknown: false,
        })
    }

    pub fn class(&self) -> GenotypeClass {
        if self.unknown {
            return GenotypeClass::Unknown;
        }
        if self.alleles.iter().any(|a| a.is_none()) {
            return GenotypeClass::Missing;
        }
        let called: Vec<u32> = self.alleles.iter().flatten().copied().collect();
        if called.iter().all(|&a| a == 0) {
            GenotypeClass::HomRef
        } else if called.windows(2).all(|w| w[0] == w[1]) {
            GenotypeClass::HomAlt
        } else {
            GenotypeClass::Het
        }
    }

    /// Number of copies of the first alternate allele, `None` for no-calls
    pub fn alt_count(&self) -> Option<u32> {
        if self.unknown || self.alleles.iter().any(|a| a.is_none()) {
            return None;
        }
        Some(self.alleles.iter().flatten().filter(|&&a| a == 1).count() as u32)
    }

    /// Rewrite allele indexes for the biallelic record of alternate `alt_index`.
    ///
    /// Reference stays 0, the selected alternate becomes 1, any other
    /// alternate becomes missing.
    pub fn remap(&self, alt_index: u32) -> Genotype {
        if self.unknown {
            return self.clone();
        }
        let alleles = self
            .alleles
            .iter()
            .map(|allele| match allele {
                Some(0) => Some(0),
                Some(a) if *a == alt_index => Some(1),
                _ => None,
            })
            .collect();
        Genotype {
            alleles,
            phased: self.phased,
            unknown: false,
        }
    }
}

impl fmt::Display for Genotype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.unknown {
            return f.write_str(UNKNOWN_GENOTYPE);
        }
        let separator = if self.phased { "|" } else { "/" };
        let parts: Vec<String> = self
            .alleles
            .iter()
            .map(|a| match a {
                Some(index) => index.to_string(),
                None => ".".to_string(),
            })
            .collect();
        f.write_str(&parts.join(separator))
    }
}

/// Class of a stored genotype string; unparsable values count as missing
pub fn classify(value: &str) -> GenotypeClass {
    Genotype::parse(value)
        .map(|gt| gt.class())
        .unwrap_or(GenotypeClass::Missing)
}
