mod dna;
pub use dna::DnaModel;

mod rate_variation;
pub use rate_variation::{RateVariationModel, ScalarRateEstimator, PerEntryEstimator};

use genome::{Base, Position, RefSeq, ALPHABET_SIZE};

use crate::regions::SeqRegions;

/// Which rate matrix the inference starts from, and whether it is
/// re-estimated from the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    /// Equal rates, never re-estimated.
    Jc,
    /// Time-reversible: empirical updates symmetrise the observed counts.
    Gtr,
    /// Unrestricted: empirical updates use the raw counts.
    Unrest,
}

impl ModelKind {
    #[must_use]
    pub fn is_empirical(self) -> bool {
        !matches!(self, ModelKind::Jc)
    }
}

impl std::str::FromStr for ModelKind {
    type Err = UnknownModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "JC" | "JC69" => Ok(ModelKind::Jc),
            "GTR" => Ok(ModelKind::Gtr),
            "UNREST" => Ok(ModelKind::Unrest),
            _ => Err(UnknownModelError(s.to_string())),
        }
    }
}

#[derive(thiserror::Error, Debug)]
#[error("Unknown substitution model '{0}' (expected JC, GTR or UNREST)")]
pub struct UnknownModelError(pub String);

/// The capability set every model family exposes to the genome-list
/// arithmetic. `pos` is ignored by uniform models and indexes the per-site
/// tables under rate variation.
pub trait SubstitutionModel {
    /// Stationary state distribution, estimated from the reference.
    fn freqs(&self) -> &[f64; ALPHABET_SIZE];

    fn log_freqs(&self) -> &[f64; ALPHABET_SIZE];

    /// Off-diagonal rate q(from -> to) at `pos`.
    fn entry(&self, from: Base, to: Base, pos: Position) -> f64;

    /// Diagonal rate q(state, state) at `pos` (non-positive).
    fn diagonal(&self, state: Base, pos: Position) -> f64;

    /// Transposed rate: q(to -> from).
    fn transposed(&self, from: Base, to: Base, pos: Position) -> f64 {
        self.entry(to, from, pos)
    }

    /// Precomputed pi_j * q(j -> i), the workhorse of the branch-length
    /// derivative.
    fn freq_j_qji(&self, i: Base, j: Base, pos: Position) -> f64;

    /// Integrated rate away from the reference over the inclusive span
    /// `[start, end]`: sum of -q(ref_k, ref_k). Non-negative.
    fn cumulative_rate_span(&self, start: Position, end: Position) -> f64;

    /// Sum of log pi(ref_k) over the inclusive span `[start, end]`.
    fn cumulative_logfreq_span(&self, start: Position, end: Position) -> f64;

    /// Rebuild the rate matrix from the accumulated mutation counts.
    /// Returns whether anything moved beyond the update threshold.
    fn update_empirical(&mut self, reference: &RefSeq) -> bool;

    /// Fold the differences between a node's genome-list and a freshly
    /// placed sample into the mutation counts for the next empirical
    /// update.
    fn update_pseudocounts(&mut self, reference: &RefSeq, node: &SeqRegions, sample: &SeqRegions);
}

/// The two shipped model families behind one value, so call sites get
/// static dispatch and the rate-variation machinery stays reachable.
#[derive(Debug, Clone)]
pub enum Model {
    Uniform(DnaModel),
    PerSite(RateVariationModel),
}

impl Model {
    /// A uniform (one matrix for the whole genome) model.
    #[must_use]
    pub fn new(kind: ModelKind, reference: &RefSeq) -> Model {
        Model::Uniform(DnaModel::new(kind, reference))
    }

    /// A per-site model: starts uniform, specialised later by one of the
    /// rate estimators.
    #[must_use]
    pub fn new_per_site(kind: ModelKind, reference: &RefSeq, waiting_time_pseudocount: f64) -> Model {
        Model::PerSite(RateVariationModel::new(kind, reference, waiting_time_pseudocount))
    }

    #[must_use]
    pub fn kind(&self) -> ModelKind {
        match self {
            Model::Uniform(m) => m.kind(),
            Model::PerSite(m) => m.kind(),
        }
    }

    #[must_use]
    pub fn per_site(&self) -> Option<&RateVariationModel> {
        match self {
            Model::PerSite(m) => Some(m),
            Model::Uniform(_) => None,
        }
    }

    #[must_use]
    pub fn per_site_mut(&mut self) -> Option<&mut RateVariationModel> {
        match self {
            Model::PerSite(m) => Some(m),
            Model::Uniform(_) => None,
        }
    }
}

macro_rules! delegate {
    ($self:ident, $m:ident => $body:expr) => {
        match $self {
            Model::Uniform($m) => $body,
            Model::PerSite($m) => $body,
        }
    };
}

impl SubstitutionModel for Model {
    fn freqs(&self) -> &[f64; ALPHABET_SIZE] {
        delegate!(self, m => m.freqs())
    }

    fn log_freqs(&self) -> &[f64; ALPHABET_SIZE] {
        delegate!(self, m => m.log_freqs())
    }

    fn entry(&self, from: Base, to: Base, pos: Position) -> f64 {
        delegate!(self, m => m.entry(from, to, pos))
    }

    fn diagonal(&self, state: Base, pos: Position) -> f64 {
        delegate!(self, m => m.diagonal(state, pos))
    }

    fn freq_j_qji(&self, i: Base, j: Base, pos: Position) -> f64 {
        delegate!(self, m => m.freq_j_qji(i, j, pos))
    }

    fn cumulative_rate_span(&self, start: Position, end: Position) -> f64 {
        delegate!(self, m => m.cumulative_rate_span(start, end))
    }

    fn cumulative_logfreq_span(&self, start: Position, end: Position) -> f64 {
        delegate!(self, m => m.cumulative_logfreq_span(start, end))
    }

    fn update_empirical(&mut self, reference: &RefSeq) -> bool {
        delegate!(self, m => m.update_empirical(reference))
    }

    fn update_pseudocounts(&mut self, reference: &RefSeq, node: &SeqRegions, sample: &SeqRegions) {
        delegate!(self, m => m.update_pseudocounts(reference, node, sample))
    }
}
