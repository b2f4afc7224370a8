//! Newton-style per-branch length optimisation, driven by the closed-form
//! per-segment cost profile of the two lists flanking each branch.

use likelihood::regions::BranchCost;
use likelihood::{MergeCtx, Model};
use log::info;

use crate::params::SearchParams;
use crate::tree::Tree;

impl Tree {
    /// Optimise every branch once. Returns how many branches moved.
    pub fn optimize_branch_lengths_pass(
        &mut self,
        model: &Model,
        params: &SearchParams,
        reference: &genome::RefSeq,
    ) -> usize {
        let ctx = MergeCtx::new(model, reference, params.threshold_prob);
        let mut improved = 0;

        for idx in self.postorder() {
            let Some(parent) = self.node(idx).parent() else {
                continue;
            };
            self.ensure_lower(idx, &ctx);
            self.ensure_upper(parent, idx, &ctx);

            let current = self.node(idx).blength();
            let Some(cost) = BranchCost::from_lists(self.upper(parent, idx), self.lower(idx), &ctx) else {
                continue;
            };
            let mut candidate = cost.optimise(
                current.max(params.min_blength),
                params.min_blength,
                params.max_blength,
                params.min_blength_sensitivity,
            );
            // A branch may also collapse entirely.
            if cost.lh(0.0) >= cost.lh(candidate) {
                candidate = 0.0;
            }

            if (candidate - current).abs() > params.min_blength_sensitivity
                && cost.lh(candidate) > cost.lh(current)
            {
                self.set_blength(idx, candidate);
                self.refresh_from(parent, &ctx);
                improved += 1;
            }
        }
        improved
    }

    /// Iterate passes until one stops improving enough branches (at most
    /// 20 passes). Returns the total number of accepted branch updates.
    pub fn optimize_branch_lengths(
        &mut self,
        model: &Model,
        params: &SearchParams,
        reference: &genome::RefSeq,
    ) -> usize {
        if params.fixed_blength {
            info!("Branch lengths are fixed; skipping optimisation");
            return 0;
        }
        let mut total = 0;
        for pass in 0..20 {
            let improved = self.optimize_branch_lengths_pass(model, params, reference);
            total += improved;
            if (improved as f64) < params.thresh_entire_tree_improvement {
                info!("Branch lengths converged after {} passes", pass + 1);
                break;
            }
        }
        total
    }
}
