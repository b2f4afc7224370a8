//! Drives the per-site rate estimation over the tree: walks every branch,
//! feeds the parent/child list pairs into the model's estimators, and
//! iterates the per-entry refit until the likelihood stops paying for it.

use likelihood::model::{PerEntryEstimator, ScalarRateEstimator};
use likelihood::{MergeCtx, Model};
use log::{info, warn};

use crate::params::SearchParams;
use crate::tree::Tree;

/// Per-entry refits iterate until a pass gains less than this much
/// log-likelihood, or the pass cap is reached.
const MIN_PASS_GAIN: f64 = 1.0;
const MAX_PASSES: usize = 20;

impl Tree {
    /// Estimate rate variation along the genome from the current tree.
    /// Scalar mode runs a single pass; per-entry mode iterates. Returns
    /// the final per-entry tallies for diagnostics dumps, when that
    /// estimator ran.
    pub fn estimate_rate_variation(
        &mut self,
        model: &mut Model,
        params: &SearchParams,
        reference: &genome::RefSeq,
        site_rates: bool,
    ) -> Option<PerEntryEstimator> {
        if model.per_site().is_none() {
            warn!("Rate variation requested on a uniform model; skipping estimation");
            return None;
        }
        let genome_length = reference.len();

        if site_rates {
            let mut estimator = ScalarRateEstimator::new(genome_length);
            self.observe_all_edges(model, params, reference, |upper, lower, blength, _| {
                estimator.observe_edge(upper, lower, blength, reference);
            });
            model.per_site_mut().expect("checked above").apply_scalar_rates(&estimator, reference);
            let ctx = MergeCtx::new(model, reference, params.threshold_prob);
            self.refresh_all(&ctx);
            return None;
        }

        let mut old_lh = {
            let ctx = MergeCtx::new(model, reference, params.threshold_prob);
            self.log_lh(&ctx)
        };
        let mut last_estimator = None;
        for pass in 0..MAX_PASSES {
            let mut estimator = PerEntryEstimator::new(genome_length);
            self.observe_all_edges(model, params, reference, |upper, lower, blength, model| {
                estimator.observe_edge(upper, lower, blength, reference, model);
            });
            model.per_site_mut().expect("checked above").apply_per_entry(&estimator, reference);
            last_estimator = Some(estimator);

            let ctx = MergeCtx::new(model, reference, params.threshold_prob);
            self.refresh_all(&ctx);
            let new_lh = self.log_lh(&ctx);
            info!("Rate refit pass {}: log-likelihood {old_lh:.4} -> {new_lh:.4}", pass + 1);
            if new_lh - old_lh < MIN_PASS_GAIN {
                break;
            }
            old_lh = new_lh;
        }
        last_estimator
    }

    /// Visit every branch with its (upper, lower) list pair.
    fn observe_all_edges<F>(
        &mut self,
        model: &Model,
        params: &SearchParams,
        reference: &genome::RefSeq,
        mut visit: F,
    ) where
        F: FnMut(&likelihood::SeqRegions, &likelihood::SeqRegions, f64, &Model),
    {
        let ctx = MergeCtx::new(model, reference, params.threshold_prob);
        for idx in self.postorder() {
            let Some(parent) = self.node(idx).parent() else {
                continue;
            };
            let blength = self.node(idx).blength();
            if blength <= 0.0 {
                continue;
            }
            self.ensure_lower(idx, &ctx);
            self.ensure_upper(parent, idx, &ctx);
            visit(self.upper(parent, idx), self.lower(idx), blength, model);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use genome::{Base, MutKind, Mutation, RefSeq, Sequence};
    use likelihood::model::SubstitutionModel;
    use likelihood::regions::SeqRegions;
    use likelihood::ModelKind;

    const L: u32 = 20;

    fn reference() -> RefSeq {
        RefSeq::from_str_strict("AAAAAAAAAAAAAAAAAAAA").unwrap()
    }

    fn lower_for(mutations: Vec<Mutation>) -> SeqRegions {
        SeqRegions::from_sequence(&Sequence::new("x".into(), mutations).unwrap(), L)
    }

    fn sub(pos: u32, base: Base) -> Mutation {
        Mutation::new(MutKind::Base(base), pos, 1).unwrap()
    }

    fn hot_site_tree(ctx: &MergeCtx, d: f64) -> Tree {
        // Three taxa all mutated at position 2, nowhere else.
        let mut tree = Tree::with_root_sample("T1".into(), lower_for(vec![sub(2, Base::C)]), L);
        let t2 = tree.add_leaf("T2".into(), lower_for(vec![sub(2, Base::G)]));
        let root = tree.add_internal();
        tree.promote_root(root, d, t2, d);
        let t3 = tree.add_leaf("T3".into(), lower_for(vec![sub(2, Base::T)]));
        let junction = tree.add_internal();
        tree.splice_above(0, junction, d / 2.0, d / 2.0, t3, d);
        tree.refresh_from(junction, ctx);
        tree
    }

    #[test]
    fn per_entry_estimation_heats_the_variable_site() {
        let reference = reference();
        let mut model = Model::new_per_site(ModelKind::Jc, &reference, 0.1);
        let params = SearchParams::new(L);
        let mut tree = {
            let ctx = MergeCtx::new(&model, &reference, params.threshold_prob);
            hot_site_tree(&ctx, params.default_blength)
        };

        let estimator = tree.estimate_rate_variation(&mut model, &params, &reference, false);
        assert!(estimator.is_some());
        let per_site = model.per_site().unwrap();
        assert!(per_site.is_estimated());

        // Sites now differ, rows still sum to zero, and the refitted
        // model yields a finite tree likelihood.
        assert!((0..L).any(|pos| {
            Base::ALL.iter().any(|a| {
                (model.diagonal(*a, pos) - model.diagonal(*a, (pos + 1) % L)).abs() > 1e-9
            })
        }));
        for pos in [2, 10] {
            for a in Base::ALL {
                let row: f64 = Base::ALL.iter()
                    .map(|b| if *b == a { model.diagonal(a, pos) } else { model.entry(a, *b, pos) })
                    .sum();
                assert!(row.abs() < 1e-9, "row sum {row} at {pos}");
            }
        }
        let ctx = MergeCtx::new(&model, &reference, params.threshold_prob);
        assert!(tree.log_lh(&ctx).is_finite());
    }

    #[test]
    fn uniform_model_is_left_alone() {
        let reference = reference();
        let mut model = Model::new(ModelKind::Jc, &reference);
        let params = SearchParams::new(L);
        let mut tree = {
            let ctx = MergeCtx::new(&model, &reference, params.threshold_prob);
            hot_site_tree(&ctx, params.default_blength)
        };
        assert!(tree.estimate_rate_variation(&mut model, &params, &reference, false).is_none());
    }
}
