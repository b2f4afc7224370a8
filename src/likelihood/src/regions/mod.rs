mod merge;
pub use merge::{
    merge_lower_lower, merge_upper_lower, total_lh_at_root,
    append_prob, append_prob_sitewise, root_log_lh, BranchCost,
};

use genome::{Base, MutKind, Position, RefSeq, Sequence, ALPHABET_SIZE};

/// What a likelihood region asserts about its span.
#[derive(Debug, Clone, PartialEq)]
pub enum RegionVariant {
    /// The span matches the reference. The literal state is looked up from
    /// the reference when a computation needs one.
    Ref,
    /// A single fixed concrete state.
    Base(Base),
    /// An explicit probability distribution over the concrete states.
    /// Always spans exactly one position.
    Ambiguous([f64; ALPHABET_SIZE]),
    /// Uninformative (missing data / gap): the likelihood is flat.
    Missing,
}

impl RegionVariant {
    #[must_use]
    pub fn is_informative(&self) -> bool {
        !matches!(self, RegionVariant::Missing)
    }
}

/// One piecewise-constant stretch of a genome-list.
///
/// `end` is the last covered position (inclusive). The two `plength` fields
/// record branch lengths already baked into the region: `to_node` is the
/// distance between the last observed state and the anchor of the list.
/// When `to_root` is present the observation lies on the far side of the
/// root: `to_node` then measures observation-to-root and `to_root` measures
/// root-to-anchor. `None` means no distance applies.
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    pub variant: RegionVariant,
    pub end: Position,
    pub plength_to_node: Option<f64>,
    pub plength_to_root: Option<f64>,
}

impl Region {
    #[must_use]
    pub fn new(variant: RegionVariant, end: Position) -> Region {
        Region { variant, end, plength_to_node: None, plength_to_root: None }
    }

    #[must_use]
    pub fn with_plength(variant: RegionVariant, end: Position, to_node: Option<f64>, to_root: Option<f64>) -> Region {
        Region { variant, end, plength_to_node: to_node, plength_to_root: to_root }
    }

    /// The concrete state this region pins down, if any. `Ref` resolves
    /// through the reference at `pos`.
    #[must_use]
    pub fn concrete_state(&self, reference: &RefSeq, pos: Position) -> Option<Base> {
        match self.variant {
            RegionVariant::Ref => Some(reference.base(pos)),
            RegionVariant::Base(base) => Some(base),
            _ => None,
        }
    }

    /// Accumulated observation-to-anchor distance (zero when absent).
    #[must_use]
    pub fn total_plength(&self) -> f64 {
        self.plength_to_node.unwrap_or(0.0) + self.plength_to_root.unwrap_or(0.0)
    }

    /// Whether `other` continues this region with identical annotation, so
    /// the two can collapse into one. Only reference and missing spans are
    /// ever collapsed: concrete and ambiguous regions stay single-position
    /// so that per-position reference lookups remain exact.
    fn mergeable_with(&self, other: &Region) -> bool {
        let same_variant = matches!(
            (&self.variant, &other.variant),
            (RegionVariant::Ref, RegionVariant::Ref) | (RegionVariant::Missing, RegionVariant::Missing)
        );
        same_variant
            && self.plength_to_node == other.plength_to_node
            && self.plength_to_root == other.plength_to_root
    }
}

/// A genome-list: an ordered partition of `[0, L)` into likelihood regions.
///
/// Invariants: `end` strictly increases, the final `end` equals `L - 1`,
/// and no two adjacent regions are mergeable. All constructors and merge
/// operations maintain these; [`SeqRegions::assert_valid`] spells them out.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SeqRegions(Vec<Region>);

impl SeqRegions {
    #[must_use]
    pub fn new() -> SeqRegions {
        SeqRegions(Vec::new())
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> SeqRegions {
        SeqRegions(Vec::with_capacity(capacity))
    }

    /// Append a region, collapsing it into the previous one when mergeable.
    pub fn push(&mut self, region: Region) {
        if let Some(last) = self.0.last_mut() {
            debug_assert!(region.end > last.end, "regions must strictly increase in end position");
            if last.mergeable_with(&region) {
                last.end = region.end;
                return;
            }
        }
        self.0.push(region);
    }

    #[must_use]
    pub fn regions(&self) -> &[Region] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Region> {
        self.0.iter()
    }

    /// Convert a taxon's mutation list into its lower-likelihood genome-list.
    /// Unmentioned stretches become `Ref` regions, N and gap runs become
    /// `Missing`, IUPAC codes become uniform `Ambiguous` distributions.
    #[must_use]
    pub fn from_sequence(sequence: &Sequence, genome_length: Position) -> SeqRegions {
        let mut regions = SeqRegions::with_capacity(sequence.mutations().len() * 2 + 1);
        let mut pos: Position = 0;
        for mutation in sequence.mutations() {
            if mutation.position > pos {
                regions.push(Region::new(RegionVariant::Ref, mutation.position - 1));
            }
            let variant = match mutation.kind {
                MutKind::Base(base) => RegionVariant::Base(base),
                MutKind::Ambiguous(set) => {
                    let mut lh = [0.0; ALPHABET_SIZE];
                    let weight = 1.0 / set.len() as f64;
                    for base in set.iter() {
                        lh[base.index()] = weight;
                    }
                    RegionVariant::Ambiguous(lh)
                }
                MutKind::Missing | MutKind::Deletion => RegionVariant::Missing,
            };
            regions.push(Region::new(variant, mutation.end() - 1));
            pos = mutation.end();
        }
        if pos < genome_length {
            regions.push(Region::new(RegionVariant::Ref, genome_length - 1));
        }
        regions
    }

    /// Walk the shared segments of two genome-lists: the maximal stretches
    /// on which both lists are constant. Inclusive end positions.
    #[must_use]
    pub fn shared_segments<'a>(&'a self, other: &'a SeqRegions) -> SharedSegments<'a> {
        SharedSegments { a: &self.0, b: &other.0, ia: 0, ib: 0, pos: 0 }
    }

    /// True when this list pins down at least as much information as
    /// `sample` at every position, without contradicting it. Used to detect
    /// new taxa that add nothing over an existing leaf; only meaningful for
    /// leaf-level lists (no baked-in branch lengths).
    #[must_use]
    pub fn subsumes(&self, sample: &SeqRegions, reference: &RefSeq) -> bool {
        for seg in self.shared_segments(sample) {
            if seg.a.plength_to_node.is_some() || seg.a.plength_to_root.is_some() {
                return false;
            }
            match (&seg.a.variant, &seg.b.variant) {
                (_, RegionVariant::Missing) => {}
                (RegionVariant::Missing, _) => return false,
                (RegionVariant::Ref, RegionVariant::Ref) => {}
                (_, RegionVariant::Ambiguous(sample_lh)) => {
                    // Every state we allow must be allowed by the sample.
                    match &seg.a.variant {
                        RegionVariant::Ambiguous(lh) => {
                            for base in Base::ALL {
                                if lh[base.index()] > 0.0 && sample_lh[base.index()] <= 0.0 {
                                    return false;
                                }
                            }
                        }
                        _ => {
                            let state = seg.a.concrete_state(reference, seg.end)
                                .expect("informative region");
                            if sample_lh[state.index()] <= 0.0 {
                                return false;
                            }
                        }
                    }
                }
                (RegionVariant::Ambiguous(_), _) => return false,
                (_, _) => {
                    let ours = seg.a.concrete_state(reference, seg.end);
                    let theirs = seg.b.concrete_state(reference, seg.end);
                    if ours != theirs {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Whether the two lists disagree anywhere beyond `tolerance`. Drives
    /// the cache-refresh propagation: once a recomputed list stops moving,
    /// nothing downstream of it can move either.
    #[must_use]
    pub fn differs_from(&self, other: &SeqRegions, tolerance: f64) -> bool {
        if self.0.len() != other.0.len() {
            return true;
        }
        let plength_differs = |x: Option<f64>, y: Option<f64>| match (x, y) {
            (None, None) => false,
            (Some(a), Some(b)) => (a - b).abs() > tolerance,
            _ => true,
        };
        for (a, b) in self.0.iter().zip(&other.0) {
            if a.end != b.end
                || plength_differs(a.plength_to_node, b.plength_to_node)
                || plength_differs(a.plength_to_root, b.plength_to_root)
            {
                return true;
            }
            match (&a.variant, &b.variant) {
                (RegionVariant::Ref, RegionVariant::Ref)
                | (RegionVariant::Missing, RegionVariant::Missing) => {}
                (RegionVariant::Base(x), RegionVariant::Base(y)) if x == y => {}
                (RegionVariant::Ambiguous(x), RegionVariant::Ambiguous(y)) => {
                    if x.iter().zip(y).any(|(p, q)| (p - q).abs() > tolerance) {
                        return true;
                    }
                }
                _ => return true,
            }
        }
        false
    }

    /// Panic unless the list is a well-formed partition of `[0, L)`.
    /// Violations are contract bugs, not recoverable conditions.
    pub fn assert_valid(&self, genome_length: Position) {
        assert!(!self.0.is_empty(), "genome-list is empty");
        let mut previous: Option<Position> = None;
        for region in &self.0 {
            if let Some(prev) = previous {
                assert!(region.end > prev, "genome-list ends must strictly increase");
            }
            if let RegionVariant::Ambiguous(_) = region.variant {
                let start = previous.map_or(0, |p| p + 1);
                assert!(region.end == start, "ambiguous regions must span exactly one position");
            }
            previous = Some(region.end);
        }
        assert_eq!(
            self.0.last().map(|r| r.end),
            Some(genome_length - 1),
            "genome-list does not cover the genome"
        );
        for window in self.0.windows(2) {
            assert!(!window[0].mergeable_with(&window[1]), "adjacent mergeable regions left unmerged");
        }
    }
}

/// One shared segment: `[start, end]` over which both input lists are
/// constant, along with the two covering regions.
#[derive(Debug)]
pub struct Segment<'a> {
    pub start: Position,
    pub end: Position,
    pub a: &'a Region,
    pub b: &'a Region,
}

pub struct SharedSegments<'a> {
    a: &'a [Region],
    b: &'a [Region],
    ia: usize,
    ib: usize,
    pos: Position,
}

impl<'a> Iterator for SharedSegments<'a> {
    type Item = Segment<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let (ra, rb) = (self.a.get(self.ia)?, self.b.get(self.ib)?);
        let end = ra.end.min(rb.end);
        let segment = Segment { start: self.pos, end, a: ra, b: rb };
        if ra.end == end {
            self.ia += 1;
        }
        if rb.end == end {
            self.ib += 1;
        }
        self.pos = end + 1;
        Some(segment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use genome::Mutation;
    use anyhow::Result;

    fn seq(name: &str, mutations: Vec<Mutation>) -> Sequence {
        Sequence::new(name.into(), mutations).unwrap()
    }

    fn reference() -> RefSeq {
        RefSeq::from_str_strict("ACGTACGTAC").unwrap()
    }

    #[test]
    fn from_sequence_pure_reference() {
        let regions = SeqRegions::from_sequence(&seq("T1", vec![]), 10);
        regions.assert_valid(10);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions.regions()[0].variant, RegionVariant::Ref);
        assert_eq!(regions.regions()[0].end, 9);
    }

    #[test]
    fn from_sequence_with_mutations() -> Result<()> {
        let s = seq("T1", vec![
            Mutation::new(MutKind::Base(Base::T), 2, 1)?,
            Mutation::new(MutKind::Missing, 5, 3)?,
        ]);
        let regions = SeqRegions::from_sequence(&s, 10);
        regions.assert_valid(10);

        let kinds: Vec<_> = regions.iter().map(|r| (r.variant.clone(), r.end)).collect();
        assert_eq!(kinds, vec![
            (RegionVariant::Ref, 1),
            (RegionVariant::Base(Base::T), 2),
            (RegionVariant::Ref, 4),
            (RegionVariant::Missing, 7),
            (RegionVariant::Ref, 9),
        ]);
        Ok(())
    }

    #[test]
    fn adjacent_runs_collapse() -> Result<()> {
        // An N run directly followed by a gap run folds into one Missing region.
        let s = seq("T1", vec![
            Mutation::new(MutKind::Missing, 0, 3)?,
            Mutation::new(MutKind::Deletion, 3, 2)?,
        ]);
        let regions = SeqRegions::from_sequence(&s, 10);
        regions.assert_valid(10);
        assert_eq!(regions.len(), 2);
        assert_eq!(regions.regions()[0].variant, RegionVariant::Missing);
        assert_eq!(regions.regions()[0].end, 4);
        Ok(())
    }

    #[test]
    fn mutation_at_genome_end() -> Result<()> {
        let s = seq("T1", vec![Mutation::new(MutKind::Base(Base::A), 9, 1)?]);
        let regions = SeqRegions::from_sequence(&s, 10);
        regions.assert_valid(10);
        assert_eq!(regions.regions().last().unwrap().variant, RegionVariant::Base(Base::A));
        Ok(())
    }

    #[test]
    fn shared_segments_cover_genome() -> Result<()> {
        let a = SeqRegions::from_sequence(&seq("A", vec![
            Mutation::new(MutKind::Base(Base::C), 3, 1)?,
        ]), 10);
        let b = SeqRegions::from_sequence(&seq("B", vec![
            Mutation::new(MutKind::Missing, 2, 4)?,
        ]), 10);

        let segments: Vec<(Position, Position)> = a.shared_segments(&b).map(|s| (s.start, s.end)).collect();
        assert_eq!(segments, vec![(0, 1), (2, 2), (3, 3), (4, 5), (6, 9)]);
        Ok(())
    }

    #[test]
    fn subsumption() -> Result<()> {
        let reference = reference();
        let node = SeqRegions::from_sequence(&seq("node", vec![
            Mutation::new(MutKind::Base(Base::C), 3, 1)?,
        ]), 10);
        let identical = node.clone();
        let masked = SeqRegions::from_sequence(&seq("masked", vec![
            Mutation::new(MutKind::Base(Base::C), 3, 1)?,
            Mutation::new(MutKind::Missing, 6, 2)?,
        ]), 10);
        let conflicting = SeqRegions::from_sequence(&seq("other", vec![
            Mutation::new(MutKind::Base(Base::G), 3, 1)?,
        ]), 10);

        assert!(node.subsumes(&identical, &reference));
        assert!(node.subsumes(&masked, &reference));
        assert!(!node.subsumes(&conflicting, &reference));
        assert!(!masked.subsumes(&node, &reference));
        Ok(())
    }

    #[test]
    #[should_panic(expected = "does not cover the genome")]
    fn truncated_list_panics() {
        let mut regions = SeqRegions::new();
        regions.push(Region::new(RegionVariant::Ref, 5));
        regions.assert_valid(10);
    }
}
