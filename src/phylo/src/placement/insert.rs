use genome::RefSeq;
use likelihood::regions::{append_prob, merge_upper_lower, BranchCost, SeqRegions};
use likelihood::model::SubstitutionModel;
use likelihood::{MergeCtx, Model};
use log::trace;

use crate::params::SearchParams;
use crate::placement::PlacementSite;
use crate::tree::{NodeIndex, Tree};

impl Tree {
    /// Splice a new taxon in at the site the search selected: beside the
    /// node, inside its parent branch, or above the root. Feeds the
    /// observed differences into the model's mutation counts and repairs
    /// the likelihood caches around the insertion.
    pub fn place_sample(
        &mut self,
        site: &PlacementSite,
        name: String,
        sample: SeqRegions,
        model: &mut Model,
        params: &SearchParams,
        reference: &RefSeq,
    ) -> NodeIndex {
        {
            let ctx = MergeCtx::new(model, reference, params.threshold_prob);
            self.ensure_lower(site.node, &ctx);
        }
        model.update_pseudocounts(reference, self.lower(site.node), &sample);
        let ctx = MergeCtx::new(model, reference, params.threshold_prob);

        let node = site.node;
        let junction = if site.mid_branch {
            self.insert_mid_branch(node, name, sample, params, &ctx)
        } else if node == self.root() {
            self.insert_above_root(name, sample, params, &ctx)
        } else {
            self.insert_at_node(node, name, sample, params, &ctx)
        };

        self.refresh_from(junction, &ctx);
        self.set_outdated(junction, true);
        self.set_outdated(node, true);
        if let Some(parent) = self.node(junction).parent() {
            self.set_outdated(parent, true);
        }
        junction
    }

    fn insert_mid_branch(
        &mut self,
        node: NodeIndex,
        name: String,
        sample: SeqRegions,
        params: &SearchParams,
        ctx: &MergeCtx,
    ) -> NodeIndex {
        let parent = self.node(node).parent().expect("mid-branch sites sit below the root");
        let blength = self.node(node).blength();
        self.ensure_lower(node, ctx);
        self.ensure_upper(parent, node, ctx);

        let (top, bottom, best_mid) = {
            let upper = self.upper(parent, node);
            let lower = self.lower(node);
            best_split(upper, lower, blength, &sample, params, ctx)
        };
        let leaf_blength = optimise_new_branch(&best_mid, &sample, params, ctx);
        trace!("Mid-branch split {top:.3e}/{bottom:.3e}, new branch {leaf_blength:.3e}");

        let junction = self.add_internal();
        let leaf = self.add_leaf(name, sample);
        self.splice_above(node, junction, top, bottom, leaf, leaf_blength);
        self.set_outdated(leaf, true);
        junction
    }

    fn insert_at_node(
        &mut self,
        node: NodeIndex,
        name: String,
        sample: SeqRegions,
        params: &SearchParams,
        ctx: &MergeCtx,
    ) -> NodeIndex {
        let blength = self.node(node).blength();
        self.ensure_total(node, ctx);
        let leaf_blength = optimise_new_branch(self.total(node), &sample, params, ctx);

        let junction = self.add_internal();
        let leaf = self.add_leaf(name, sample);
        // The junction sits at the node's own position: all of the old
        // branch above it, none below.
        self.splice_above(node, junction, blength, 0.0, leaf, leaf_blength);
        self.set_outdated(leaf, true);
        junction
    }

    fn insert_above_root(
        &mut self,
        name: String,
        sample: SeqRegions,
        params: &SearchParams,
        ctx: &MergeCtx,
    ) -> NodeIndex {
        let root = self.root();
        self.ensure_total(root, ctx);
        let leaf_blength = optimise_new_branch(self.total(root), &sample, params, ctx);

        let junction = self.add_internal();
        let leaf = self.add_leaf(name, sample);
        self.promote_root(junction, 0.0, leaf, leaf_blength);
        self.set_outdated(leaf, true);
        junction
    }
}

/// Find the split fraction of a branch that gives the cheapest mid-point
/// attachment, by interval halving around the middle. Returns the two
/// sub-lengths and the winning mid list.
pub(crate) fn best_split(
    upper: &SeqRegions,
    lower: &SeqRegions,
    blength: f64,
    sample: &SeqRegions,
    params: &SearchParams,
    ctx: &MergeCtx,
) -> (f64, f64, SeqRegions) {
    let evaluate = |fraction: f64| -> Option<(f64, SeqRegions)> {
        let mid = merge_upper_lower(upper, blength * fraction, lower, blength * (1.0 - fraction), ctx)?;
        let cost = append_prob(&mid, sample, params.default_blength, ctx);
        Some((cost, mid))
    };

    let mut fraction = 0.5;
    let (mut cost, mut mid) = evaluate(0.5).expect("the existing mid point is feasible");
    let mut step = 0.25;
    while step >= 0.03 {
        for candidate in [fraction - step, fraction + step] {
            if let Some((c, m)) = evaluate(candidate) {
                if c > cost {
                    fraction = candidate;
                    cost = c;
                    mid = m;
                }
            }
        }
        step /= 2.0;
    }
    (blength * fraction, blength * (1.0 - fraction), mid)
}

/// Optimise the branch length of a fresh attachment against the list at
/// its anchor; collapses to zero when no positive length beats it.
pub(crate) fn optimise_new_branch(
    anchor: &SeqRegions,
    sample: &SeqRegions,
    params: &SearchParams,
    ctx: &MergeCtx,
) -> f64 {
    match BranchCost::from_lists(anchor, sample, ctx) {
        Some(cost) => {
            let best = cost.optimise(
                params.default_blength,
                params.min_blength,
                params.max_blength,
                params.min_blength_sensitivity,
            );
            if cost.lh(0.0) >= cost.lh(best) {
                0.0
            } else {
                best
            }
        }
        None => params.default_blength,
    }
}
