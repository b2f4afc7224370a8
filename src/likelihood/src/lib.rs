pub mod regions;
pub use regions::{Region, RegionVariant, SeqRegions};

pub mod model;
pub use model::{Model, ModelKind, SubstitutionModel};

use genome::RefSeq;

/// Everything the genome-list arithmetic needs to look at while merging:
/// the substitution model, the reference, and the underflow threshold.
///
/// Bundling these keeps the merge signatures short and makes it explicit
/// that merges never mutate either.
pub struct MergeCtx<'a> {
    pub model: &'a Model,
    pub reference: &'a RefSeq,
    pub threshold_prob: f64,
}

impl<'a> MergeCtx<'a> {
    #[must_use]
    pub fn new(model: &'a Model, reference: &'a RefSeq, threshold_prob: f64) -> Self {
        MergeCtx { model, reference, threshold_prob }
    }

    /// Squared threshold: the clamp-to-zero floor for probability products.
    #[must_use]
    pub fn threshold_prob2(&self) -> f64 {
        self.threshold_prob * self.threshold_prob
    }
}
