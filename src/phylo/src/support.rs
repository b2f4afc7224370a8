//! SH-like branch supports on internal branches.
//!
//! For every internal branch the three arrangements of the four
//! surrounding subtrees are scored site by site; RELL replicates then
//! resample the genome and vote on whether the current arrangement stays
//! ahead of both alternatives. Replicates run on the rayon pool, each with
//! its own deterministic RNG stream.

use likelihood::regions::{append_prob_sitewise, merge_lower_lower, merge_upper_lower, total_lh_at_root};
use likelihood::{MergeCtx, Model};
use log::info;
use rayon::prelude::*;

use crate::params::SearchParams;
use crate::tree::{NodeIndex, Tree};

/// Knobs of the support computation.
#[derive(Debug, Clone, Copy)]
pub struct SupportParams {
    pub replicates: u32,
    pub epsilon: f64,
    pub seed: u64,
}

impl Tree {
    /// Annotate every internal non-root node with a support value in
    /// `[0, 1]`. Returns how many branches were annotated.
    pub fn compute_branch_supports(
        &mut self,
        model: &Model,
        params: &SearchParams,
        reference: &genome::RefSeq,
        support: &SupportParams,
    ) -> usize {
        let ctx = MergeCtx::new(model, reference, params.threshold_prob);
        let genome_length = self.genome_length();
        let mut annotated = 0;

        for idx in self.postorder() {
            if idx == self.root() || self.node(idx).is_leaf() {
                continue;
            }
            let Some(configs) = self.quartet_site_lhs(idx, genome_length, &ctx) else {
                continue;
            };
            let value = rell_support(&configs, support);
            self.set_support(idx, value);
            annotated += 1;
        }
        info!("Computed {annotated} branch supports ({} replicates)", support.replicates);
        annotated
    }

    /// Site-wise log-likelihood vectors of the three arrangements around
    /// the branch above `idx`: the current pairing and the two swaps of a
    /// child with the sibling.
    fn quartet_site_lhs(
        &mut self,
        idx: NodeIndex,
        genome_length: genome::Position,
        ctx: &MergeCtx,
    ) -> Option<[Vec<f64>; 3]> {
        let parent = self.node(idx).parent()?;
        let [child_a, child_b] = self.node(idx).children()?;
        let sibling = self.sibling(idx)?;
        let blength = self.node(idx).blength();

        self.ensure_lower(child_a, ctx);
        self.ensure_lower(child_b, ctx);
        self.ensure_lower(sibling, ctx);
        self.ensure_upper(parent, idx, ctx);
        if let Some(grandparent) = self.node(parent).parent() {
            self.ensure_upper(grandparent, parent, ctx);
        }

        let current = append_prob_sitewise(self.upper(parent, idx), self.lower(idx), blength, genome_length, ctx);

        let swap = |kept: NodeIndex, moved: NodeIndex| -> Option<Vec<f64>> {
            // Pair `kept` with the sibling below; `moved` joins the rest of
            // the tree above.
            let below = merge_lower_lower(
                self.lower(kept),
                self.node(kept).blength(),
                self.lower(sibling),
                self.node(sibling).blength(),
                ctx,
            )?
            .0;
            let above = match self.node(parent).parent() {
                Some(grandparent) => merge_upper_lower(
                    self.upper(grandparent, parent),
                    self.node(parent).blength(),
                    self.lower(moved),
                    self.node(moved).blength(),
                    ctx,
                )?,
                None => total_lh_at_root(self.lower(moved), self.node(moved).blength(), ctx),
            };
            Some(append_prob_sitewise(&above, &below, blength, genome_length, ctx))
        };

        let nni_one = swap(child_a, child_b)?;
        let nni_two = swap(child_b, child_a)?;
        Some([current, nni_one, nni_two])
    }
}

/// Fraction of RELL replicates in which the current arrangement stays
/// within `epsilon` of the best alternative.
fn rell_support(configs: &[Vec<f64>; 3], params: &SupportParams) -> f64 {
    let genome_length = configs[0].len();
    let votes: u32 = (0..params.replicates)
        .into_par_iter()
        .map(|replicate| {
            let mut rng = fastrand::Rng::with_seed(params.seed.wrapping_add(u64::from(replicate)));
            let mut totals = [0.0; 3];
            for _ in 0..genome_length {
                let site = rng.usize(..genome_length);
                for (total, sites) in totals.iter_mut().zip(configs) {
                    *total += sites[site];
                }
            }
            u32::from(totals[0] >= totals[1].max(totals[2]) - params.epsilon)
        })
        .sum();
    f64::from(votes) / f64::from(params.replicates)
}
