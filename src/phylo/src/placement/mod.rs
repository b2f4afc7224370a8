pub(crate) mod insert;

use likelihood::regions::{append_prob, SeqRegions};
use likelihood::MergeCtx;

use crate::params::SearchParams;
use crate::tree::{NodeIndex, Tree};

/// Where the search decided a new taxon belongs.
#[derive(Debug, Clone)]
pub enum Placement {
    /// The sample carries no information beyond an existing leaf: record
    /// its name there instead of growing the tree.
    LessInformative { leaf: NodeIndex },
    /// Attach at the described site.
    Attach(PlacementSite),
}

/// A concrete attachment site: a node, possibly the midpoint of its parent
/// branch, together with the costs the search saw around it.
#[derive(Debug, Clone)]
pub struct PlacementSite {
    pub node: NodeIndex,
    pub mid_branch: bool,
    pub lh_diff: f64,
    pub up_lh_diff: f64,
    pub down_lh_diff: f64,
    pub best_child: Option<NodeIndex>,
}

struct Visit {
    node: NodeIndex,
    failures: u32,
    parent_cost: f64,
}

impl Tree {
    /// Best-first search for the attachment point of a new sample, rooted
    /// at the top of the tree.
    ///
    /// Each visited node is scored by appending the sample at the node's
    /// total list and, for long enough branches, at the mid-branch list. A
    /// path stops descending once it keeps failing to improve while
    /// lagging behind the best site found so far.
    pub fn seek_placement(&mut self, sample: &SeqRegions, params: &SearchParams, ctx: &MergeCtx) -> Placement {
        let mut best_node = self.root();
        let mut best_mid = false;
        let mut best_cost = f64::NEG_INFINITY;

        let mut stack = vec![Visit { node: self.root(), failures: 0, parent_cost: f64::NEG_INFINITY }];
        while let Some(visit) = stack.pop() {
            let node = visit.node;

            if self.node(node).is_leaf() && self.lower(node).subsumes(sample, ctx.reference) {
                return Placement::LessInformative { leaf: node };
            }

            self.ensure_total(node, ctx);
            let node_cost = append_prob(self.total(node), sample, params.default_blength, ctx);

            let mid_cost = if node != self.root()
                && self.node(node).blength() >= params.min_blength_mid
                && self.ensure_mid_branch(node, ctx)
            {
                append_prob(self.mid_branch(node), sample, params.default_blength, ctx)
            } else {
                f64::NEG_INFINITY
            };

            let local = node_cost.max(mid_cost);
            let improved = local > best_cost;
            if node_cost > best_cost {
                best_node = node;
                best_mid = false;
                best_cost = node_cost;
            }
            if mid_cost > best_cost {
                best_node = node;
                best_mid = true;
                best_cost = mid_cost;
            }

            let failures = if improved {
                0
            } else if local < visit.parent_cost - params.thresh_log_lh_failure {
                visit.failures + 1
            } else {
                visit.failures
            };

            let lagging = local < best_cost - params.threshold_prob;
            let exhausted = if params.strict_stop_seeking_placement_sample {
                failures > 0
            } else {
                failures >= params.failure_limit_sample
            };
            if lagging && exhausted {
                continue;
            }

            if let Some([left, right]) = self.node(node).children() {
                stack.push(Visit { node: right, failures, parent_cost: local });
                stack.push(Visit { node: left, failures, parent_cost: local });
            }
        }

        let (up_lh_diff, down_lh_diff, best_child) = self.site_surroundings(best_node, sample, params, ctx);
        Placement::Attach(PlacementSite {
            node: best_node,
            mid_branch: best_mid,
            lh_diff: best_cost,
            up_lh_diff,
            down_lh_diff,
            best_child,
        })
    }

    /// Costs just above and just below the chosen node, for the insertion
    /// step to pick the exact shape.
    fn site_surroundings(
        &mut self,
        node: NodeIndex,
        sample: &SeqRegions,
        params: &SearchParams,
        ctx: &MergeCtx,
    ) -> (f64, f64, Option<NodeIndex>) {
        let up = if node != self.root() && self.ensure_mid_branch(node, ctx) {
            append_prob(self.mid_branch(node), sample, params.default_blength, ctx)
        } else {
            f64::NEG_INFINITY
        };

        let mut down = f64::NEG_INFINITY;
        let mut best_child = None;
        if let Some(children) = self.node(node).children() {
            for child in children {
                if self.node(child).blength() > 0.0 && self.ensure_mid_branch(child, ctx) {
                    let cost = append_prob(self.mid_branch(child), sample, params.default_blength, ctx);
                    if cost > down {
                        down = cost;
                        best_child = Some(child);
                    }
                }
            }
        }
        (up, down, best_child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use genome::{Base, MutKind, Mutation, RefSeq, Sequence};
    use likelihood::{Model, ModelKind};

    fn reference() -> RefSeq {
        RefSeq::from_str_strict("AAAAAAAAAA").unwrap()
    }

    fn lower_for(mutations: Vec<Mutation>) -> SeqRegions {
        SeqRegions::from_sequence(&Sequence::new("x".into(), mutations).unwrap(), 10)
    }

    #[test]
    fn identical_sample_is_less_informative() {
        let reference = reference();
        let model = Model::new(ModelKind::Jc, &reference);
        let ctx = MergeCtx::new(&model, &reference, 1e-8);
        let params = SearchParams::new(10);

        let mut tree = Tree::with_root_sample("T1".into(), lower_for(vec![]), 10);
        let sample = lower_for(vec![]);
        match tree.seek_placement(&sample, &params, &ctx) {
            Placement::LessInformative { leaf } => assert_eq!(leaf, tree.root()),
            Placement::Attach(_) => panic!("identical sample must be absorbed"),
        }
    }

    #[test]
    fn divergent_sample_attaches() {
        let reference = reference();
        let model = Model::new(ModelKind::Jc, &reference);
        let ctx = MergeCtx::new(&model, &reference, 1e-8);
        let params = SearchParams::new(10);

        let mut tree = Tree::with_root_sample("T1".into(), lower_for(vec![]), 10);
        let sample = lower_for(vec![Mutation::new(MutKind::Base(Base::C), 1, 1).unwrap()]);
        match tree.seek_placement(&sample, &params, &ctx) {
            Placement::Attach(site) => {
                assert_eq!(site.node, tree.root());
                assert!(!site.mid_branch);
                assert!(site.lh_diff.is_finite());
            }
            Placement::LessInformative { .. } => panic!("divergent sample must attach"),
        }
    }

    #[test]
    fn placement_prefers_matching_leaf() {
        let reference = reference();
        let model = Model::new(ModelKind::Jc, &reference);
        let ctx = MergeCtx::new(&model, &reference, 1e-8);
        let params = SearchParams::new(10);

        // Root pair: T1 reference-like, T2 carries C at 1.
        let mut tree = Tree::with_root_sample("T1".into(), lower_for(vec![]), 10);
        let t2 = tree.add_leaf("T2".into(), lower_for(vec![
            Mutation::new(MutKind::Base(Base::C), 1, 1).unwrap(),
        ]));
        let root = tree.add_internal();
        tree.promote_root(root, params.default_blength, t2, params.default_blength);
        tree.refresh_from(tree.root(), &ctx);

        // A sample sharing T2's mutation plus one more: best site is T2.
        let sample = lower_for(vec![
            Mutation::new(MutKind::Base(Base::C), 1, 1).unwrap(),
            Mutation::new(MutKind::Base(Base::G), 5, 1).unwrap(),
        ]);
        match tree.seek_placement(&sample, &params, &ctx) {
            Placement::Attach(site) => assert_eq!(site.node, t2),
            Placement::LessInformative { .. } => panic!("sample adds a mutation"),
        }
    }
}
