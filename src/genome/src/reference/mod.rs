pub mod error;
pub use error::RefSeqError;

use crate::state::{Base, ALPHABET_SIZE};
use crate::Position;

/// The reference genome: an immutable vector of concrete bases.
///
/// Every taxon in the analysis is stored as a sparse list of differences
/// against this sequence, so it is parsed once, validated strictly (no
/// ambiguity codes allowed) and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefSeq(Vec<Base>);

impl RefSeq {
    pub fn new(bases: Vec<Base>) -> Result<RefSeq, RefSeqError> {
        if bases.is_empty() {
            return Err(RefSeqError::Empty);
        }
        Ok(RefSeq(bases))
    }

    /// Parse from a raw character sequence. Whitespace is skipped; any
    /// non-ACGT character aborts.
    pub fn from_str_strict(raw: &str) -> Result<RefSeq, RefSeqError> {
        let mut bases = Vec::with_capacity(raw.len());
        for (i, c) in raw.chars().enumerate() {
            if c.is_ascii_whitespace() {
                continue;
            }
            let base = Base::try_from(c).map_err(|source| RefSeqError::InvalidBase { offset: i, source })?;
            bases.push(base);
        }
        Self::new(bases)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Base at 0-based `pos`. Out-of-range positions are contract violations.
    #[must_use]
    pub fn base(&self, pos: Position) -> Base {
        self.0[pos as usize]
    }

    #[must_use]
    pub fn bases(&self) -> &[Base] {
        &self.0
    }

    /// Relative frequency of each concrete base, used as the stationary
    /// distribution of the substitution model.
    #[must_use]
    pub fn base_freqs(&self) -> [f64; ALPHABET_SIZE] {
        let mut counts = [0usize; ALPHABET_SIZE];
        for base in &self.0 {
            counts[base.index()] += 1;
        }
        let total = self.0.len() as f64;
        let mut freqs = [0.0; ALPHABET_SIZE];
        for (freq, count) in freqs.iter_mut().zip(counts) {
            *freq = count as f64 / total;
        }
        freqs
    }
}

impl std::fmt::Display for RefSeq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for base in &self.0 {
            write!(f, "{base}")?;
        }
        Ok(())
    }
}
