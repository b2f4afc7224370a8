pub mod newick;

use ahash::AHashMap;
use genome::Position;
use likelihood::regions::{merge_lower_lower, merge_upper_lower, root_log_lh, total_lh_at_root, SeqRegions};
use likelihood::MergeCtx;

pub type NodeIndex = usize;

/// One node of the arena: integer links instead of pointer rings, with the
/// cached genome-lists of its three incident branches held inline.
///
/// `lower` summarises the data below the node. `upper_left` / `upper_right`
/// summarise everything outside the respective child's subtree, anchored at
/// this node. `total` and `mid_branch` are the posterior lists at the node
/// and at the midpoint of its parent branch.
#[derive(Debug, Clone)]
pub struct PhyloNode {
    name: Option<String>,
    pub less_info_seqs: Vec<String>,
    parent: Option<NodeIndex>,
    children: Option<[NodeIndex; 2]>,
    blength: f64,
    lower: Option<SeqRegions>,
    upper_left: Option<SeqRegions>,
    upper_right: Option<SeqRegions>,
    total: Option<SeqRegions>,
    mid_branch: Option<SeqRegions>,
    /// Marks the node for revisiting by the topology improvement rounds.
    pub outdated: bool,
    pub support: Option<f64>,
}

impl PhyloNode {
    fn leaf(name: String, lower: SeqRegions) -> PhyloNode {
        PhyloNode {
            name: Some(name),
            less_info_seqs: Vec::new(),
            parent: None,
            children: None,
            blength: 0.0,
            lower: Some(lower),
            upper_left: None,
            upper_right: None,
            total: None,
            mid_branch: None,
            outdated: false,
            support: None,
        }
    }

    fn internal() -> PhyloNode {
        PhyloNode {
            name: None,
            less_info_seqs: Vec::new(),
            parent: None,
            children: None,
            blength: 0.0,
            lower: None,
            upper_left: None,
            upper_right: None,
            total: None,
            mid_branch: None,
            outdated: false,
            support: None,
        }
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }

    #[must_use]
    pub fn parent(&self) -> Option<NodeIndex> {
        self.parent
    }

    #[must_use]
    pub fn children(&self) -> Option<[NodeIndex; 2]> {
        self.children
    }

    #[must_use]
    pub fn blength(&self) -> f64 {
        self.blength
    }

    fn clear_caches(&mut self) {
        if self.children.is_some() {
            self.lower = None;
        }
        self.upper_left = None;
        self.upper_right = None;
        self.total = None;
        self.mid_branch = None;
    }
}

/// The phylogeny: an arena of nodes plus the root index and a name lookup
/// for the taxa already placed.
#[derive(Debug, Clone, Default)]
pub struct Tree {
    nodes: Vec<PhyloNode>,
    root: NodeIndex,
    leaf_index: AHashMap<String, NodeIndex>,
    genome_length: Position,
}

/// What `detach_subtree` removed, so the caller can re-use the junction
/// node when regrafting.
#[derive(Debug, Clone, Copy)]
pub struct Detached {
    /// The floating internal node that used to join the subtree in.
    pub junction: NodeIndex,
    /// The sibling that absorbed the junction's branch.
    pub merged_sibling: NodeIndex,
    /// The sibling's branch length before it absorbed the junction branch.
    pub old_sibling_blength: f64,
    pub old_junction_blength: f64,
}

impl Tree {
    /// An empty arena; used by the tree loader, which wires nodes up
    /// explicitly before calling [`Tree::set_root`].
    #[must_use]
    pub fn new(genome_length: Position) -> Tree {
        Tree {
            nodes: Vec::new(),
            root: 0,
            leaf_index: AHashMap::new(),
            genome_length,
        }
    }

    /// Start a tree from its first (most informative) taxon.
    #[must_use]
    pub fn with_root_sample(name: String, lower: SeqRegions, genome_length: Position) -> Tree {
        let mut tree = Tree {
            nodes: vec![PhyloNode::leaf(name.clone(), lower)],
            root: 0,
            leaf_index: AHashMap::new(),
            genome_length,
        };
        tree.leaf_index.insert(name, 0);
        tree
    }

    #[must_use]
    pub fn genome_length(&self) -> Position {
        self.genome_length
    }

    #[must_use]
    pub fn root(&self) -> NodeIndex {
        self.root
    }

    #[must_use]
    pub fn node(&self, idx: NodeIndex) -> &PhyloNode {
        &self.nodes[idx]
    }

    #[must_use]
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn num_leaves(&self) -> usize {
        self.leaf_index.len()
    }

    /// Taxa placed so far, including the less-informative names absorbed
    /// into existing leaves.
    #[must_use]
    pub fn num_taxa(&self) -> usize {
        self.leaf_index.len() + self.nodes.iter().map(|n| n.less_info_seqs.len()).sum::<usize>()
    }

    #[must_use]
    pub fn find_leaf(&self, name: &str) -> Option<NodeIndex> {
        self.leaf_index.get(name).copied()
    }

    pub fn node_indices(&self) -> impl Iterator<Item = NodeIndex> {
        0..self.nodes.len()
    }

    /// Indices reachable from the root (splices may leave floating nodes
    /// mid-operation; after every public operation the arena is fully
    /// attached again, but iteration goes through the topology to stay
    /// robust).
    #[must_use]
    pub fn preorder(&self) -> Vec<NodeIndex> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root];
        while let Some(idx) = stack.pop() {
            order.push(idx);
            if let Some([left, right]) = self.nodes[idx].children {
                stack.push(right);
                stack.push(left);
            }
        }
        order
    }

    /// Post-order: children before parents.
    #[must_use]
    pub fn postorder(&self) -> Vec<NodeIndex> {
        let mut order = self.preorder();
        order.reverse();
        order
    }

    pub fn add_leaf(&mut self, name: String, lower: SeqRegions) -> NodeIndex {
        let idx = self.nodes.len();
        self.nodes.push(PhyloNode::leaf(name.clone(), lower));
        self.leaf_index.insert(name, idx);
        idx
    }

    pub fn add_internal(&mut self) -> NodeIndex {
        let idx = self.nodes.len();
        self.nodes.push(PhyloNode::internal());
        idx
    }

    /// Register an extra taxon name at a leaf that already carries all its
    /// information.
    pub fn absorb_less_informative(&mut self, leaf: NodeIndex, name: String) {
        debug_assert!(self.nodes[leaf].is_leaf());
        self.nodes[leaf].less_info_seqs.push(name);
    }

    pub fn set_blength(&mut self, idx: NodeIndex, blength: f64) {
        self.nodes[idx].blength = blength;
    }

    pub fn set_support(&mut self, idx: NodeIndex, support: f64) {
        self.nodes[idx].support = Some(support);
    }

    pub fn set_outdated(&mut self, idx: NodeIndex, outdated: bool) {
        self.nodes[idx].outdated = outdated;
    }

    /// Used by tree loading: wire `children` under `parent`.
    pub fn set_children(&mut self, parent: NodeIndex, children: [NodeIndex; 2]) {
        self.nodes[parent].children = Some(children);
        for child in children {
            self.nodes[child].parent = Some(parent);
        }
    }

    pub fn set_root(&mut self, idx: NodeIndex) {
        self.root = idx;
        self.nodes[idx].parent = None;
    }

    #[must_use]
    pub fn sibling(&self, idx: NodeIndex) -> Option<NodeIndex> {
        let parent = self.nodes[idx].parent?;
        let [left, right] = self.nodes[parent].children?;
        Some(if left == idx { right } else { left })
    }

    // ---------------------------------------------------------------- caches

    fn upper_slot(&self, parent: NodeIndex, child: NodeIndex) -> &Option<SeqRegions> {
        let [left, _] = self.nodes[parent].children.expect("internal node");
        if child == left { &self.nodes[parent].upper_left } else { &self.nodes[parent].upper_right }
    }

    fn upper_slot_mut(&mut self, parent: NodeIndex, child: NodeIndex) -> &mut Option<SeqRegions> {
        let [left, _] = self.nodes[parent].children.expect("internal node");
        if child == left { &mut self.nodes[parent].upper_left } else { &mut self.nodes[parent].upper_right }
    }

    /// Recompute the lower list of `idx` (and any stale descendants) from
    /// its children.
    pub fn ensure_lower(&mut self, idx: NodeIndex, ctx: &MergeCtx) {
        let mut stack = vec![idx];
        while let Some(&top) = stack.last() {
            if self.nodes[top].lower.is_some() {
                stack.pop();
                continue;
            }
            let [left, right] = self.nodes[top].children
                .expect("leaf lower lists are created with the leaf");
            let left_ready = self.nodes[left].lower.is_some();
            let right_ready = self.nodes[right].lower.is_some();
            if left_ready && right_ready {
                let merged = {
                    let a = self.nodes[left].lower.as_ref().expect("just checked");
                    let b = self.nodes[right].lower.as_ref().expect("just checked");
                    merge_lower_lower(a, self.nodes[left].blength, b, self.nodes[right].blength, ctx)
                        .expect("children of an attached node cannot conflict at their branch lengths")
                        .0
                };
                self.nodes[top].lower = Some(merged);
                stack.pop();
            } else {
                if !left_ready {
                    stack.push(left);
                }
                if !right_ready {
                    stack.push(right);
                }
            }
        }
    }

    #[must_use]
    pub fn lower(&self, idx: NodeIndex) -> &SeqRegions {
        self.nodes[idx].lower.as_ref().expect("lower list not computed; call ensure_lower first")
    }

    fn compute_upper(&mut self, parent: NodeIndex, child: NodeIndex, ctx: &MergeCtx) {
        let sibling = self.sibling(child).expect("child of an internal node");
        self.ensure_lower(sibling, ctx);
        let fresh = if parent == self.root {
            total_lh_at_root(self.lower(sibling), self.nodes[sibling].blength, ctx)
        } else {
            let grandparent = self.nodes[parent].parent.expect("non-root node");
            let upper = self.upper_slot(grandparent, parent).as_ref()
                .expect("ancestor upper computed before descendant");
            merge_upper_lower(
                upper,
                self.nodes[parent].blength,
                self.nodes[sibling].lower.as_ref().expect("ensured above"),
                self.nodes[sibling].blength,
                ctx,
            )
            .expect("attached lists cannot conflict")
        };
        *self.upper_slot_mut(parent, child) = Some(fresh);
    }

    /// Make sure the upper list for edge `parent -> child` is cached,
    /// computing the stale prefix of the ancestor chain first.
    pub fn ensure_upper(&mut self, parent: NodeIndex, child: NodeIndex, ctx: &MergeCtx) {
        let mut chain = Vec::new();
        let (mut p, mut c) = (parent, child);
        loop {
            if self.upper_slot(p, c).is_some() {
                break;
            }
            chain.push((p, c));
            match self.nodes[p].parent {
                Some(grandparent) => {
                    c = p;
                    p = grandparent;
                }
                None => break,
            }
        }
        for (p, c) in chain.into_iter().rev() {
            self.compute_upper(p, c, ctx);
        }
    }

    #[must_use]
    pub fn upper(&self, parent: NodeIndex, child: NodeIndex) -> &SeqRegions {
        self.upper_slot(parent, child).as_ref().expect("upper list not computed; call ensure_upper first")
    }

    pub fn ensure_total(&mut self, idx: NodeIndex, ctx: &MergeCtx) {
        if self.nodes[idx].total.is_some() {
            return;
        }
        self.ensure_lower(idx, ctx);
        let fresh = if idx == self.root {
            total_lh_at_root(self.lower(idx), 0.0, ctx)
        } else {
            let parent = self.nodes[idx].parent.expect("non-root node");
            self.ensure_upper(parent, idx, ctx);
            merge_upper_lower(
                self.upper(parent, idx),
                self.nodes[idx].blength,
                self.lower(idx),
                0.0,
                ctx,
            )
            .expect("attached lists cannot conflict")
        };
        self.nodes[idx].total = Some(fresh);
    }

    #[must_use]
    pub fn total(&self, idx: NodeIndex) -> &SeqRegions {
        self.nodes[idx].total.as_ref().expect("total list not computed; call ensure_total first")
    }

    /// Mid-branch list of the edge above `idx`; `None` for the root.
    pub fn ensure_mid_branch(&mut self, idx: NodeIndex, ctx: &MergeCtx) -> bool {
        if self.nodes[idx].mid_branch.is_some() {
            return true;
        }
        let Some(parent) = self.nodes[idx].parent else {
            return false;
        };
        let half = self.nodes[idx].blength / 2.0;
        self.ensure_lower(idx, ctx);
        self.ensure_upper(parent, idx, ctx);
        let fresh = merge_upper_lower(self.upper(parent, idx), half, self.lower(idx), half, ctx)
            .expect("attached lists cannot conflict");
        self.nodes[idx].mid_branch = Some(fresh);
        true
    }

    #[must_use]
    pub fn mid_branch(&self, idx: NodeIndex) -> &SeqRegions {
        self.nodes[idx].mid_branch.as_ref().expect("mid-branch list not computed")
    }

    /// Drop every cached list touched by a change at `start` and rebuild
    /// the neighbourhood: ancestor lowers bottom-up, then refreshed upper
    /// lists pushed down the off-path subtrees for as long as they keep
    /// moving.
    pub fn refresh_from(&mut self, start: NodeIndex, ctx: &MergeCtx) {
        let mut path = Vec::new();
        let mut cursor = Some(start);
        while let Some(idx) = cursor {
            self.nodes[idx].clear_caches();
            path.push(idx);
            cursor = self.nodes[idx].parent;
        }

        self.ensure_lower(self.root, ctx);

        for &along in path.iter().rev() {
            let Some([left, right]) = self.nodes[along].children else {
                continue;
            };
            self.compute_upper(along, left, ctx);
            self.compute_upper(along, right, ctx);
            for child in [left, right] {
                if !path.contains(&child) {
                    self.push_refresh(child, ctx);
                }
            }
        }
    }

    /// Depth-first push of refreshed upper lists: stop along any branch
    /// where the recomputed list no longer differs from the cached one.
    fn push_refresh(&mut self, top: NodeIndex, ctx: &MergeCtx) {
        let mut stack = vec![top];
        while let Some(idx) = stack.pop() {
            self.nodes[idx].total = None;
            self.nodes[idx].mid_branch = None;
            let Some([left, right]) = self.nodes[idx].children else {
                continue;
            };
            for child in [left, right] {
                let old = self.upper_slot_mut(idx, child).take();
                self.compute_upper(idx, child, ctx);
                let fresh = self.upper_slot(idx, child).as_ref().expect("just computed");
                let moved = old.map_or(true, |cached| fresh.differs_from(&cached, ctx.threshold_prob));
                if moved {
                    stack.push(child);
                }
            }
        }
    }

    /// Throw every cache away and recompute from the leaves; used after
    /// the model changed under the tree.
    pub fn refresh_all(&mut self, ctx: &MergeCtx) {
        for node in &mut self.nodes {
            node.clear_caches();
        }
        self.ensure_lower(self.root, ctx);
        self.ensure_total(self.root, ctx);
    }

    /// Total log-likelihood: the per-merge factors of every internal node
    /// plus the root projection. Refreshes the lower lists as a side
    /// effect.
    pub fn log_lh(&mut self, ctx: &MergeCtx) -> f64 {
        let mut total = 0.0;
        for idx in self.postorder() {
            let Some([left, right]) = self.nodes[idx].children else {
                continue;
            };
            let (merged, contribution) = {
                let a = self.nodes[left].lower.as_ref().expect("post-order");
                let b = self.nodes[right].lower.as_ref().expect("post-order");
                merge_lower_lower(a, self.nodes[left].blength, b, self.nodes[right].blength, ctx)
                    .expect("attached lists cannot conflict")
            };
            self.nodes[idx].lower = Some(merged);
            total += contribution;
        }
        total + root_log_lh(self.lower(self.root), ctx)
    }

    pub fn mark_all_outdated(&mut self, outdated: bool) {
        for node in &mut self.nodes {
            node.outdated = outdated;
        }
    }

    // ------------------------------------------------------------- splicing

    /// Put `junction` into the branch above `child`, `top` away from the
    /// parent, and hang `attachment` (with `attachment_blength`) off it.
    pub fn splice_above(
        &mut self,
        child: NodeIndex,
        junction: NodeIndex,
        top: f64,
        bottom: f64,
        attachment: NodeIndex,
        attachment_blength: f64,
    ) {
        let parent = self.nodes[child].parent.expect("cannot splice above the root");
        let [left, right] = self.nodes[parent].children.expect("internal node");
        let slot = if left == child { 0 } else { 1 };
        let mut children = [left, right];
        children[slot] = junction;
        self.nodes[parent].children = Some(children);

        self.nodes[junction].parent = Some(parent);
        self.nodes[junction].blength = top;
        self.nodes[junction].children = Some([child, attachment]);
        self.nodes[junction].clear_caches();

        self.nodes[child].parent = Some(junction);
        self.nodes[child].blength = bottom;
        self.nodes[attachment].parent = Some(junction);
        self.nodes[attachment].blength = attachment_blength;
    }

    /// Promote a fresh root above the current one, with `attachment` as the
    /// second child.
    pub fn promote_root(
        &mut self,
        junction: NodeIndex,
        old_root_blength: f64,
        attachment: NodeIndex,
        attachment_blength: f64,
    ) {
        let old_root = self.root;
        self.nodes[junction].parent = None;
        self.nodes[junction].blength = 0.0;
        self.nodes[junction].children = Some([old_root, attachment]);
        self.nodes[junction].clear_caches();
        self.nodes[old_root].parent = Some(junction);
        self.nodes[old_root].blength = old_root_blength;
        self.nodes[attachment].parent = Some(junction);
        self.nodes[attachment].blength = attachment_blength;
        self.root = junction;
    }

    /// Remove the subtree rooted at `node` from the backbone. Its junction
    /// (the former parent) floats free for re-use; the sibling absorbs the
    /// junction's branch. `None` when the prune would leave a single leaf
    /// behind (nothing to regraft onto).
    pub fn detach_subtree(&mut self, node: NodeIndex) -> Option<Detached> {
        let junction = self.nodes[node].parent?;
        let sibling = self.sibling(node).expect("child of internal node");
        let old_sibling_blength = self.nodes[sibling].blength;
        let old_junction_blength = self.nodes[junction].blength;

        match self.nodes[junction].parent {
            Some(grandparent) => {
                let [left, right] = self.nodes[grandparent].children.expect("internal node");
                let slot = if left == junction { 0 } else { 1 };
                let mut children = [left, right];
                children[slot] = sibling;
                self.nodes[grandparent].children = Some(children);
                self.nodes[sibling].parent = Some(grandparent);
                self.nodes[sibling].blength = old_sibling_blength + old_junction_blength;
            }
            None => {
                // The junction was the root: the sibling takes over. A
                // lone leaf left behind has no edge to regraft onto.
                if self.nodes[sibling].is_leaf() {
                    return None;
                }
                self.nodes[sibling].parent = None;
                self.nodes[sibling].blength = 0.0;
                self.root = sibling;
            }
        }
        self.nodes[junction].parent = None;
        self.nodes[junction].children = None;
        self.nodes[junction].clear_caches();
        Some(Detached { junction, merged_sibling: sibling, old_sibling_blength, old_junction_blength })
    }

    // ---------------------------------------------------------- comparisons

    /// Robinson-Foulds distance on leaf-name bipartitions.
    #[must_use]
    pub fn rf_distance(&self, other: &Tree) -> usize {
        let a = self.bipartitions();
        let b = other.bipartitions();
        a.symmetric_difference(&b).count()
    }

    fn bipartitions(&self) -> std::collections::HashSet<std::collections::BTreeSet<String>> {
        use std::collections::{BTreeSet, HashSet};

        let all: BTreeSet<String> = self.leaf_index.keys().cloned().collect();
        let Some(anchor) = all.iter().next().cloned() else {
            return HashSet::new();
        };

        let mut below: AHashMap<NodeIndex, BTreeSet<String>> = AHashMap::new();
        let mut splits = HashSet::new();
        for idx in self.postorder() {
            let set: BTreeSet<String> = match self.nodes[idx].children {
                None => std::iter::once(self.nodes[idx].name.clone().expect("leaf")).collect(),
                Some([left, right]) => {
                    let mut set = below.remove(&left).expect("post-order");
                    set.extend(below.remove(&right).expect("post-order"));
                    set
                }
            };
            if idx != self.root && !self.nodes[idx].is_leaf() && set.len() > 1 && set.len() < all.len() - 1 {
                // Canonical side: the one without the anchor taxon.
                let split = if set.contains(&anchor) {
                    all.difference(&set).cloned().collect()
                } else {
                    set.clone()
                };
                splits.insert(split);
            }
            below.insert(idx, set);
        }
        splits
    }
}
