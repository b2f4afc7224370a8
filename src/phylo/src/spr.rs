//! SPR-style topology improvement: detach each subtree, look for a better
//! attachment within a radius of its old position, regraft when the move
//! pays, and iterate while rounds keep improving.
//!
//! The search walks the remaining tree's edges outward from the removal
//! point. Caches are repaired right after the prune, so the cached total
//! and mid-branch lists already describe the backbone without the subtree.

use likelihood::regions::{append_prob, SeqRegions};
use likelihood::{MergeCtx, Model};
use log::{debug, info};

use crate::params::SearchParams;
use crate::placement::insert::optimise_new_branch;
use crate::tree::{NodeIndex, Tree};

#[derive(Debug, Clone, Copy)]
enum Move {
    /// Entering this node's edge from above; continue into its children.
    Down,
    /// Arriving at this node from the given child; continue up and into
    /// the other child.
    UpFrom(NodeIndex),
}

struct Candidate {
    node: NodeIndex,
    mv: Move,
    depth: usize,
    failures: u32,
    parent_cost: f64,
}

#[derive(Debug, Clone, Copy)]
struct Regraft {
    node: NodeIndex,
    mid_branch: bool,
    cost: f64,
}

impl Tree {
    /// Run up to `num_tree_improvement` improvement rounds, each a full
    /// sweep plus up to 20 sub-rounds that only revisit nodes disturbed by
    /// accepted moves. Returns the summed improvement.
    pub fn optimize_topology(
        &mut self,
        model: &Model,
        params: &SearchParams,
        reference: &genome::RefSeq,
        short_range: bool,
    ) -> f64 {
        let rounds = if short_range { 1 } else { params.num_tree_improvement };
        let mut total = 0.0;

        for _ in 0..rounds {
            self.mark_all_outdated(true);
            let mut improvement = self.improve_entire_tree(model, params, reference, short_range);
            total += improvement;
            if improvement < params.thresh_entire_tree_improvement {
                info!("Small improvement, stopping topological search");
                break;
            }
            for subround in 0..20 {
                improvement = self.improve_entire_tree(model, params, reference, short_range);
                total += improvement;
                info!("Tree was improved by {improvement} at subround {}", subround + 1);
                if improvement < params.thresh_entire_tree_improvement {
                    break;
                }
            }
        }
        total
    }

    /// One sweep over the outdated nodes, attempting a prune-and-regraft
    /// for each. Returns the summed cost improvement of accepted moves.
    pub fn improve_entire_tree(
        &mut self,
        model: &Model,
        params: &SearchParams,
        reference: &genome::RefSeq,
        short_range: bool,
    ) -> f64 {
        let mut improvement = 0.0;
        for idx in self.postorder() {
            if !self.node(idx).outdated {
                continue;
            }
            self.set_outdated(idx, false);
            if idx == self.root() {
                continue;
            }
            improvement += self.improve_subtree(idx, model, params, reference, short_range);
        }
        improvement
    }

    /// Detach the subtree at `node`, search the backbone for a better
    /// attachment, and either regraft there or restore the original
    /// position. Returns the accepted improvement (0 when kept in place).
    fn improve_subtree(
        &mut self,
        node: NodeIndex,
        model: &Model,
        params: &SearchParams,
        reference: &genome::RefSeq,
        short_range: bool,
    ) -> f64 {
        let ctx = MergeCtx::new(model, reference, params.threshold_prob);
        let sub_blength = self.node(node).blength();

        let Some(parent) = self.node(node).parent() else {
            return 0.0;
        };
        self.ensure_lower(node, &ctx);
        self.ensure_upper(parent, node, &ctx);
        let current_cost = {
            let sub_lower = self.lower(node);
            append_prob(self.upper(parent, node), sub_lower, sub_blength, &ctx)
        };

        let Some(detached) = self.detach_subtree(node) else {
            return 0.0;
        };
        let anchor = self.node(detached.merged_sibling).parent().unwrap_or(detached.merged_sibling);
        self.refresh_from(anchor, &ctx);

        let sub_lower = self.lower(node).clone();
        let best = self.seek_regraft(
            detached.merged_sibling,
            &sub_lower,
            sub_blength,
            current_cost,
            params,
            short_range,
            &ctx,
        );

        match best {
            Some(regraft) if regraft.cost > current_cost + params.threshold_prob => {
                let delta = regraft.cost - current_cost;
                debug!("Regrafting subtree (improvement {delta:.6})");
                self.apply_regraft(node, detached.junction, regraft, &sub_lower, params, &ctx);
                for touched in [detached.merged_sibling, anchor, regraft.node, detached.junction, node] {
                    self.set_outdated(touched, true);
                }
                delta
            }
            _ => {
                // Put everything back where it was.
                match self.node(detached.merged_sibling).parent() {
                    Some(_) => self.splice_above(
                        detached.merged_sibling,
                        detached.junction,
                        detached.old_junction_blength,
                        detached.old_sibling_blength,
                        node,
                        sub_blength,
                    ),
                    None => self.promote_root(
                        detached.junction,
                        detached.old_sibling_blength,
                        node,
                        sub_blength,
                    ),
                }
                self.refresh_from(detached.junction, &ctx);
                0.0
            }
        }
    }

    /// Best-first walk of the backbone edges around the removal point.
    #[allow(clippy::too_many_arguments)]
    fn seek_regraft(
        &mut self,
        start: NodeIndex,
        sub_lower: &SeqRegions,
        sub_blength: f64,
        current_cost: f64,
        params: &SearchParams,
        short_range: bool,
        ctx: &MergeCtx,
    ) -> Option<Regraft> {
        let radius = if short_range { params.short_range_radius } else { usize::MAX };
        let failure_limit = if short_range {
            params.failure_limit_subtree_short_search
        } else {
            params.failure_limit_subtree
        };

        let mut best: Option<Regraft> = None;
        let mut best_cost = current_cost;

        let mut stack = Vec::new();
        match self.node(start).parent() {
            Some(parent) => {
                stack.push(Candidate { node: start, mv: Move::Down, depth: 0, failures: 0, parent_cost: current_cost });
                stack.push(Candidate { node: parent, mv: Move::UpFrom(start), depth: 0, failures: 0, parent_cost: current_cost });
            }
            None => {
                if let Some([left, right]) = self.node(start).children() {
                    stack.push(Candidate { node: left, mv: Move::Down, depth: 0, failures: 0, parent_cost: current_cost });
                    stack.push(Candidate { node: right, mv: Move::Down, depth: 0, failures: 0, parent_cost: current_cost });
                }
            }
        }

        while let Some(candidate) = stack.pop() {
            let node = candidate.node;
            let has_edge = node != self.root();

            let mut local = f64::NEG_INFINITY;
            let mut site: Option<Regraft> = None;
            if has_edge {
                self.ensure_total(node, ctx);
                let at_node = append_prob(self.total(node), sub_lower, sub_blength, ctx);
                if at_node > local {
                    local = at_node;
                    site = Some(Regraft { node, mid_branch: false, cost: at_node });
                }
                if self.node(node).blength() > 0.0 && self.ensure_mid_branch(node, ctx) {
                    let at_mid = append_prob(self.mid_branch(node), sub_lower, sub_blength, ctx);
                    if at_mid > local {
                        local = at_mid;
                        site = Some(Regraft { node, mid_branch: true, cost: at_mid });
                    }
                }
            }

            let improved = local > best_cost;
            if let Some(site) = site {
                if site.cost > best_cost {
                    best_cost = site.cost;
                    best = Some(site);
                }
            }

            let failures = if improved {
                0
            } else if has_edge && local < candidate.parent_cost - params.thresh_log_lh_failure {
                candidate.failures + 1
            } else {
                candidate.failures
            };

            let lagging = local < best_cost - params.threshold_prob;
            let exhausted = if params.strict_stop_seeking_placement_subtree {
                failures > 0
            } else {
                failures >= failure_limit
            };
            if has_edge && lagging && exhausted {
                continue;
            }
            if candidate.depth >= radius {
                continue;
            }

            let depth = candidate.depth + 1;
            match candidate.mv {
                Move::Down => {
                    if let Some([left, right]) = self.node(node).children() {
                        stack.push(Candidate { node: right, mv: Move::Down, depth, failures, parent_cost: local });
                        stack.push(Candidate { node: left, mv: Move::Down, depth, failures, parent_cost: local });
                    }
                }
                Move::UpFrom(child) => {
                    if let Some([left, right]) = self.node(node).children() {
                        let other = if left == child { right } else { left };
                        stack.push(Candidate { node: other, mv: Move::Down, depth, failures, parent_cost: local });
                    }
                    if let Some(parent) = self.node(node).parent() {
                        stack.push(Candidate { node: parent, mv: Move::UpFrom(node), depth, failures, parent_cost: local });
                    }
                }
            }
        }
        best
    }

    fn apply_regraft(
        &mut self,
        node: NodeIndex,
        junction: NodeIndex,
        regraft: Regraft,
        sub_lower: &SeqRegions,
        params: &SearchParams,
        ctx: &MergeCtx,
    ) {
        let target = regraft.node;
        let blength = self.node(target).blength();
        self.ensure_lower(target, ctx);
        if regraft.mid_branch {
            let (top, bottom, attach_blength) = {
                let parent = self.node(target).parent().expect("mid-branch targets sit below the root");
                self.ensure_upper(parent, target, ctx);
                let (top, bottom, mid) = crate::placement::insert::best_split(
                    self.upper(parent, target),
                    self.lower(target),
                    blength,
                    sub_lower,
                    params,
                    ctx,
                );
                (top, bottom, optimise_new_branch(&mid, sub_lower, params, ctx))
            };
            self.splice_above(target, junction, top, bottom, node, attach_blength);
        } else {
            self.ensure_total(target, ctx);
            let attach_blength = optimise_new_branch(self.total(target), sub_lower, params, ctx);
            self.splice_above(target, junction, blength, 0.0, node, attach_blength);
        }
        self.refresh_from(junction, ctx);
    }
}
