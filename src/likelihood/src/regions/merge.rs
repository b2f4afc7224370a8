//! The three genome-list primitives every higher layer is built from:
//! lower x lower and upper x lower merges along branches, and the root
//! projection. All of them are single passes over shared segments.
//!
//! Transition probabilities are first order in the branch length:
//! P(a -> b, t) = delta_ab + t * q_ab. Long reference and missing stretches
//! are folded through the model's cumulative-rate tables instead of being
//! walked position by position.

use genome::{Base, Position, ALPHABET_SIZE};

use super::{Region, RegionVariant, SeqRegions};
use crate::model::SubstitutionModel;
use crate::MergeCtx;

/// P(observe `state` | anchor state i, over `t`), for every i.
fn lower_state_vec(state: Base, t: f64, pos: Position, ctx: &MergeCtx) -> [f64; ALPHABET_SIZE] {
    let mut vec = [0.0; ALPHABET_SIZE];
    for (i, value) in vec.iter_mut().enumerate() {
        let from = Base::from_index(i).expect("alphabet index");
        *value = if from == state {
            1.0 + t * ctx.model.diagonal(state, pos)
        } else {
            t * ctx.model.entry(from, state, pos)
        };
    }
    vec
}

/// Lower likelihood of an ambiguous observation propagated up by `t`:
/// v_i = o_i + t * sum_j q_ij o_j.
fn lower_ambig_vec(lh: &[f64; ALPHABET_SIZE], t: f64, pos: Position, ctx: &MergeCtx) -> [f64; ALPHABET_SIZE] {
    let mut vec = *lh;
    if t > 0.0 {
        for (i, value) in vec.iter_mut().enumerate() {
            let from = Base::from_index(i).expect("alphabet index");
            let flow: f64 = Base::ALL.iter()
                .map(|to| {
                    let rate = if *to == from { ctx.model.diagonal(from, pos) } else { ctx.model.entry(from, *to, pos) };
                    rate * lh[to.index()]
                })
                .sum();
            *value += t * flow;
        }
    }
    vec
}

/// Likelihood of the data reachable through a lower region, per anchor
/// state, evaluated `extra` further towards the root.
fn lower_vec(region: &Region, extra: f64, pos: Position, ctx: &MergeCtx) -> [f64; ALPHABET_SIZE] {
    let t = extra + region.plength_to_node.unwrap_or(0.0);
    match &region.variant {
        RegionVariant::Ref => lower_state_vec(ctx.reference.base(pos), t, pos, ctx),
        RegionVariant::Base(base) => lower_state_vec(*base, t, pos, ctx),
        RegionVariant::Ambiguous(lh) => lower_ambig_vec(lh, t, pos, ctx),
        RegionVariant::Missing => [1.0; ALPHABET_SIZE],
    }
}

/// Likelihood flowing down through an upper region, per state at a point
/// `extra` below the region's anchor.
///
/// Across-root entries are normalised by the observed state's stationary
/// frequency, so that an unchanged position costs ~log(1) when appending.
fn upper_vec(region: &Region, extra: f64, pos: Position, ctx: &MergeCtx) -> [f64; ALPHABET_SIZE] {
    match &region.variant {
        RegionVariant::Missing => [1.0; ALPHABET_SIZE],
        RegionVariant::Ambiguous(lh) => {
            // Forward propagation: v_i = o_i + t * sum_j o_j q_ji.
            let t = extra + region.plength_to_node.unwrap_or(0.0);
            let mut vec = *lh;
            if t > 0.0 {
                for (i, value) in vec.iter_mut().enumerate() {
                    let to = Base::from_index(i).expect("alphabet index");
                    let flow: f64 = Base::ALL.iter()
                        .map(|from| {
                            let rate = if *from == to { ctx.model.diagonal(to, pos) } else { ctx.model.entry(*from, to, pos) };
                            rate * lh[from.index()]
                        })
                        .sum();
                    *value += t * flow;
                }
            }
            vec
        }
        _ => {
            let state = region.concrete_state(ctx.reference, pos).expect("informative region");
            match region.plength_to_root {
                None => {
                    let t = extra + region.plength_to_node.unwrap_or(0.0);
                    let mut vec = [0.0; ALPHABET_SIZE];
                    for (i, value) in vec.iter_mut().enumerate() {
                        let to = Base::from_index(i).expect("alphabet index");
                        *value = if to == state {
                            1.0 + t * ctx.model.diagonal(state, pos)
                        } else {
                            t * ctx.model.entry(state, to, pos)
                        };
                    }
                    vec
                }
                Some(to_root) => {
                    // The observation sits on the far side of the root. Either
                    // the state survived from the root downwards, or it
                    // mutated on our side; both histories are first order.
                    let below_root = to_root + extra;
                    let to_observation = region.plength_to_node.unwrap_or(0.0);
                    let freqs = ctx.model.freqs();
                    let mut vec = [0.0; ALPHABET_SIZE];
                    for (i, value) in vec.iter_mut().enumerate() {
                        let to = Base::from_index(i).expect("alphabet index");
                        let survive = if to == state {
                            1.0 + below_root * ctx.model.diagonal(state, pos)
                        } else {
                            below_root * ctx.model.entry(state, to, pos)
                        };
                        let crossed = if to == state {
                            to_observation * ctx.model.diagonal(state, pos)
                        } else {
                            to_observation * (freqs[to.index()] / freqs[state.index()]) * ctx.model.entry(to, state, pos)
                        };
                        *value = survive + crossed;
                    }
                    vec
                }
            }
        }
    }
}

/// Zero out vanishing entries, renormalise, and collapse to a single state
/// when one entry carries essentially all the mass.
fn finalize_vector(mut vec: [f64; ALPHABET_SIZE], sum: f64, pos: Position, ctx: &MergeCtx) -> RegionVariant {
    for value in &mut vec {
        *value /= sum;
        if *value < ctx.threshold_prob {
            *value = 0.0;
        }
    }
    let total: f64 = vec.iter().sum();
    for value in &mut vec {
        *value /= total;
    }

    let (argmax, max) = vec.iter().enumerate()
        .max_by(|x, y| x.1.total_cmp(y.1))
        .expect("non-empty vector");
    if *max > 1.0 - ctx.threshold_prob {
        let state = Base::from_index(argmax).expect("alphabet index");
        if state == ctx.reference.base(pos) {
            RegionVariant::Ref
        } else {
            RegionVariant::Base(state)
        }
    } else {
        RegionVariant::Ambiguous(vec)
    }
}

/// Collapse an equal-state observation to the cheapest variant.
fn concrete_variant(state: Base, pos: Position, ctx: &MergeCtx) -> RegionVariant {
    if state == ctx.reference.base(pos) {
        RegionVariant::Ref
    } else {
        RegionVariant::Base(state)
    }
}

fn accumulated(plength: Option<f64>, blength: f64) -> Option<f64> {
    let total = plength.unwrap_or(0.0) + blength;
    (total > 0.0).then_some(total)
}

/// Merge the lower-likelihood lists of two children, at branch lengths
/// `blength_a` / `blength_b`, into the lower list of their parent.
///
/// Returns the merged list plus the log-likelihood contribution accumulated
/// along the way, or `None` when the two lists cannot coexist (a segment's
/// probability mass vanished entirely).
pub fn merge_lower_lower(
    a: &SeqRegions,
    blength_a: f64,
    b: &SeqRegions,
    blength_b: f64,
    ctx: &MergeCtx,
) -> Option<(SeqRegions, f64)> {
    let mut merged = SeqRegions::with_capacity(a.len() + b.len());
    let mut log_lh = 0.0;

    for seg in a.shared_segments(b) {
        let pos = seg.end;
        match (&seg.a.variant, &seg.b.variant) {
            (RegionVariant::Missing, RegionVariant::Missing) => {
                merged.push(Region::new(RegionVariant::Missing, seg.end));
            }
            (RegionVariant::Missing, _) => {
                merged.push(Region::with_plength(
                    seg.b.variant.clone(),
                    seg.end,
                    accumulated(seg.b.plength_to_node, blength_b),
                    None,
                ));
            }
            (_, RegionVariant::Missing) => {
                merged.push(Region::with_plength(
                    seg.a.variant.clone(),
                    seg.end,
                    accumulated(seg.a.plength_to_node, blength_a),
                    None,
                ));
            }
            (RegionVariant::Ref, RegionVariant::Ref) => {
                let t1 = blength_a + seg.a.plength_to_node.unwrap_or(0.0);
                let t2 = blength_b + seg.b.plength_to_node.unwrap_or(0.0);
                log_lh -= (t1 + t2) * ctx.model.cumulative_rate_span(seg.start, seg.end);
                merged.push(Region::new(RegionVariant::Ref, seg.end));
            }
            _ => {
                let state_a = seg.a.concrete_state(ctx.reference, pos);
                let state_b = seg.b.concrete_state(ctx.reference, pos);
                let t1 = blength_a + seg.a.plength_to_node.unwrap_or(0.0);
                let t2 = blength_b + seg.b.plength_to_node.unwrap_or(0.0);

                if let (Some(x), Some(y)) = (state_a, state_b) {
                    if x == y {
                        // Matching observations: keep the state, pay the two
                        // survival probabilities.
                        let diag = ctx.model.diagonal(x, pos);
                        log_lh += (diag * t1).ln_1p() + (diag * t2).ln_1p();
                        merged.push(Region::new(concrete_variant(x, pos, ctx), seg.end));
                        continue;
                    }
                }

                let va = lower_vec(seg.a, blength_a, pos, ctx);
                let vb = lower_vec(seg.b, blength_b, pos, ctx);
                let mut vec = [0.0; ALPHABET_SIZE];
                for (value, (x, y)) in vec.iter_mut().zip(va.iter().zip(vb.iter())) {
                    *value = x * y;
                }
                let sum: f64 = vec.iter().sum();
                if sum <= ctx.threshold_prob2() {
                    return None;
                }
                log_lh += sum.ln();
                merged.push(Region::new(finalize_vector(vec, sum, pos, ctx), seg.end));
            }
        }
    }

    Some((merged, log_lh))
}

/// Merge an upper list (anchored `blength_upper` above the evaluation
/// point) with a lower list (anchored `blength_lower` below it). Produces
/// the likelihood list at the point: the upper list of a child edge, a
/// node's total list, or a mid-branch list, depending on the caller.
///
/// `None` signals vanished probability mass, which callers computing caches
/// treat as a contract violation.
pub fn merge_upper_lower(
    upper: &SeqRegions,
    blength_upper: f64,
    lower: &SeqRegions,
    blength_lower: f64,
    ctx: &MergeCtx,
) -> Option<SeqRegions> {
    let mut merged = SeqRegions::with_capacity(upper.len() + lower.len());

    for seg in upper.shared_segments(lower) {
        let pos = seg.end;
        match (&seg.a.variant, &seg.b.variant) {
            (RegionVariant::Missing, RegionVariant::Missing) => {
                merged.push(Region::new(RegionVariant::Missing, seg.end));
            }
            (_, RegionVariant::Missing) => {
                // Only the upper observation survives; the anchor moves
                // down by `blength_upper`.
                let (to_node, to_root) = match seg.a.plength_to_root {
                    Some(to_root) => (seg.a.plength_to_node.or(Some(0.0)), Some(to_root + blength_upper)),
                    None => (accumulated(seg.a.plength_to_node, blength_upper), None),
                };
                merged.push(Region::with_plength(seg.a.variant.clone(), seg.end, to_node, to_root));
            }
            (RegionVariant::Missing, _) => {
                merged.push(Region::with_plength(
                    seg.b.variant.clone(),
                    seg.end,
                    accumulated(seg.b.plength_to_node, blength_lower),
                    None,
                ));
            }
            (RegionVariant::Ref, RegionVariant::Ref) => {
                merged.push(Region::new(RegionVariant::Ref, seg.end));
            }
            _ => {
                let state_a = seg.a.concrete_state(ctx.reference, pos);
                let state_b = seg.b.concrete_state(ctx.reference, pos);
                if seg.a.plength_to_root.is_none() {
                    if let (Some(x), Some(y)) = (state_a, state_b) {
                        if x == y {
                            merged.push(Region::new(concrete_variant(x, pos, ctx), seg.end));
                            continue;
                        }
                    }
                }

                let u = upper_vec(seg.a, blength_upper, pos, ctx);
                let l = lower_vec(seg.b, blength_lower, pos, ctx);
                let mut vec = [0.0; ALPHABET_SIZE];
                for (value, (x, y)) in vec.iter_mut().zip(u.iter().zip(l.iter())) {
                    *value = x * y;
                }
                let sum: f64 = vec.iter().sum();
                if sum <= ctx.threshold_prob2() {
                    return None;
                }
                merged.push(Region::new(finalize_vector(vec, sum, pos, ctx), seg.end));
            }
        }
    }

    Some(merged)
}

/// Project a lower list through the root prior: the total-likelihood list
/// of the root, or the upper list its children see.
#[must_use]
pub fn total_lh_at_root(lower: &SeqRegions, blength: f64, ctx: &MergeCtx) -> SeqRegions {
    let mut result = SeqRegions::with_capacity(lower.len());
    let freqs = ctx.model.freqs();

    for region in lower.iter() {
        debug_assert!(region.plength_to_root.is_none(), "lower lists never cross the root");
        match &region.variant {
            RegionVariant::Missing => result.push(Region::new(RegionVariant::Missing, region.end)),
            RegionVariant::Ambiguous(lh) => {
                let pos = region.end;
                let t = blength + region.plength_to_node.unwrap_or(0.0);
                let propagated = lower_ambig_vec(lh, t, pos, ctx);
                let mut vec = [0.0; ALPHABET_SIZE];
                for (i, value) in vec.iter_mut().enumerate() {
                    *value = freqs[i] * propagated[i];
                }
                let sum: f64 = vec.iter().sum();
                result.push(Region::new(finalize_vector(vec, sum, pos, ctx), region.end));
            }
            _ => {
                let t = blength + region.plength_to_node.unwrap_or(0.0);
                result.push(Region::with_plength(
                    region.variant.clone(),
                    region.end,
                    Some(t),
                    Some(0.0),
                ));
            }
        }
    }
    result
}

/// Absolute log-likelihood of the whole tree, read off the root's lower
/// list folded against the stationary distribution.
#[must_use]
pub fn root_log_lh(lower: &SeqRegions, ctx: &MergeCtx) -> f64 {
    let freqs = ctx.model.freqs();
    let mut log_lh = 0.0;
    let mut start: Position = 0;

    for region in lower.iter() {
        let t = region.plength_to_node.unwrap_or(0.0);
        match &region.variant {
            RegionVariant::Missing => {}
            RegionVariant::Ref => {
                log_lh += ctx.model.cumulative_logfreq_span(start, region.end);
                if t > 0.0 {
                    log_lh -= t * ctx.model.cumulative_rate_span(start, region.end);
                }
            }
            RegionVariant::Base(state) => {
                let pos = region.end;
                let mut sum = freqs[state.index()];
                if t > 0.0 {
                    for from in Base::ALL {
                        let rate = if from == *state {
                            ctx.model.diagonal(*state, pos)
                        } else {
                            ctx.model.entry(from, *state, pos)
                        };
                        sum += t * freqs[from.index()] * rate;
                    }
                }
                log_lh += sum.ln();
            }
            RegionVariant::Ambiguous(lh) => {
                let pos = region.end;
                let propagated = lower_ambig_vec(lh, t, pos, ctx);
                let sum: f64 = propagated.iter().enumerate().map(|(i, v)| freqs[i] * v).sum();
                log_lh += sum.ln();
            }
        }
        start = region.end + 1;
    }
    log_lh
}

/// Cost of appending a sample (lower list) below an upper-flavoured list
/// (a total or mid-branch list) at branch length `blength`. Segment-wise
/// log of the dot product, with the closed-form shortcut for matching
/// reference spans. `-inf` when the sample cannot attach here.
#[must_use]
pub fn append_prob(upper: &SeqRegions, sample: &SeqRegions, blength: f64, ctx: &MergeCtx) -> f64 {
    let mut log_lh = 0.0;

    for seg in upper.shared_segments(sample) {
        let pos = seg.end;
        match (&seg.a.variant, &seg.b.variant) {
            (RegionVariant::Missing, _) | (_, RegionVariant::Missing) => {}
            (RegionVariant::Ref, RegionVariant::Ref) => {
                let t = blength
                    + seg.b.plength_to_node.unwrap_or(0.0)
                    + seg.a.plength_to_node.unwrap_or(0.0)
                    + seg.a.plength_to_root.unwrap_or(0.0);
                log_lh -= t * ctx.model.cumulative_rate_span(seg.start, seg.end);
            }
            _ => {
                let u = upper_vec(seg.a, 0.0, pos, ctx);
                let s = lower_vec(seg.b, blength, pos, ctx);
                let sum: f64 = u.iter().zip(s.iter()).map(|(x, y)| x * y).sum();
                if sum <= 0.0 {
                    return f64::NEG_INFINITY;
                }
                log_lh += sum.ln();
            }
        }
    }
    log_lh
}

/// As [`append_prob`], but spreading the cost over the genome: one
/// log-likelihood contribution per position. Fuel for resampling-based
/// branch supports.
#[must_use]
pub fn append_prob_sitewise(
    upper: &SeqRegions,
    sample: &SeqRegions,
    blength: f64,
    genome_length: Position,
    ctx: &MergeCtx,
) -> Vec<f64> {
    let mut sites = vec![0.0; genome_length as usize];

    for seg in upper.shared_segments(sample) {
        let pos = seg.end;
        match (&seg.a.variant, &seg.b.variant) {
            (RegionVariant::Missing, _) | (_, RegionVariant::Missing) => {}
            (RegionVariant::Ref, RegionVariant::Ref) => {
                let t = blength
                    + seg.b.plength_to_node.unwrap_or(0.0)
                    + seg.a.plength_to_node.unwrap_or(0.0)
                    + seg.a.plength_to_root.unwrap_or(0.0);
                for k in seg.start..=seg.end {
                    sites[k as usize] = -t * ctx.model.cumulative_rate_span(k, k);
                }
            }
            _ => {
                let u = upper_vec(seg.a, 0.0, pos, ctx);
                let s = lower_vec(seg.b, blength, pos, ctx);
                let sum: f64 = u.iter().zip(s.iter()).map(|(x, y)| x * y).sum();
                sites[pos as usize] = if sum <= 0.0 { f64::NEG_INFINITY } else { sum.ln() };
            }
        }
    }
    sites
}

/// Per-branch likelihood profile: l(b) = linear * b + sum_s ln(a_s + c_s b),
/// assembled once from the two adjacent lists and then optimised with a
/// bounded Newton iteration.
#[derive(Debug)]
pub struct BranchCost {
    linear: f64,
    segments: Vec<(f64, f64)>,
}

impl BranchCost {
    /// Collect the per-segment coefficients for the branch carrying `upper`
    /// above and `lower` below. `None` when a segment is impossible at any
    /// length (vanished mass at b = 0 with zero slope).
    pub fn from_lists(upper: &SeqRegions, lower: &SeqRegions, ctx: &MergeCtx) -> Option<BranchCost> {
        let mut linear = 0.0;
        let mut segments = Vec::new();

        for seg in upper.shared_segments(lower) {
            let pos = seg.end;
            match (&seg.a.variant, &seg.b.variant) {
                (RegionVariant::Missing, _) | (_, RegionVariant::Missing) => {}
                (RegionVariant::Ref, RegionVariant::Ref) => {
                    linear -= ctx.model.cumulative_rate_span(seg.start, seg.end);
                }
                _ => {
                    let u = upper_vec(seg.a, 0.0, pos, ctx);
                    let p = seg.b.plength_to_node.unwrap_or(0.0);

                    // s_i(b) = base_i + (b + p) * slope_i.
                    let (base, slope): ([f64; ALPHABET_SIZE], [f64; ALPHABET_SIZE]) = match &seg.b.variant {
                        RegionVariant::Ambiguous(lh) => {
                            let mut slope = [0.0; ALPHABET_SIZE];
                            for (i, value) in slope.iter_mut().enumerate() {
                                let from = Base::from_index(i).expect("alphabet index");
                                *value = Base::ALL.iter()
                                    .map(|to| {
                                        let rate = if *to == from { ctx.model.diagonal(from, pos) } else { ctx.model.entry(from, *to, pos) };
                                        rate * lh[to.index()]
                                    })
                                    .sum();
                            }
                            (*lh, slope)
                        }
                        _ => {
                            let state = seg.b.concrete_state(ctx.reference, pos).expect("informative region");
                            let mut base = [0.0; ALPHABET_SIZE];
                            base[state.index()] = 1.0;
                            let mut slope = [0.0; ALPHABET_SIZE];
                            for (i, value) in slope.iter_mut().enumerate() {
                                let from = Base::from_index(i).expect("alphabet index");
                                *value = if from == state {
                                    ctx.model.diagonal(state, pos)
                                } else {
                                    ctx.model.entry(from, state, pos)
                                };
                            }
                            (base, slope)
                        }
                    };

                    let a: f64 = u.iter().zip(base.iter().zip(slope.iter()))
                        .map(|(ui, (bi, si))| ui * (bi + p * si))
                        .sum();
                    let c: f64 = u.iter().zip(slope.iter()).map(|(ui, si)| ui * si).sum();
                    if a <= 0.0 && c <= 0.0 {
                        return None;
                    }
                    segments.push((a, c));
                }
            }
        }
        Some(BranchCost { linear, segments })
    }

    /// Profile value at `b`, up to a constant shared by all lengths.
    #[must_use]
    pub fn lh(&self, b: f64) -> f64 {
        self.linear * b
            + self.segments.iter()
                .map(|(a, c)| {
                    let y = a + c * b;
                    if y <= 0.0 { f64::NEG_INFINITY } else { y.ln() }
                })
                .sum::<f64>()
    }

    fn derivatives(&self, b: f64) -> (f64, f64) {
        let mut first = self.linear;
        let mut second = 0.0;
        for (a, c) in &self.segments {
            let y = a + c * b;
            if y <= 0.0 {
                return (f64::INFINITY, f64::NEG_INFINITY);
            }
            let ratio = c / y;
            first += ratio;
            second -= ratio * ratio;
        }
        (first, second)
    }

    /// Bounded Newton iteration from `start`, clamped to `[min_b, max_b]`,
    /// at most 10 steps, stopping once the step falls below `sensitivity`.
    #[must_use]
    pub fn optimise(&self, start: f64, min_b: f64, max_b: f64, sensitivity: f64) -> f64 {
        let mut b = start.clamp(min_b, max_b);
        for _ in 0..10 {
            let (first, second) = self.derivatives(b);
            if second >= 0.0 || !first.is_finite() {
                break;
            }
            let step = -first / second;
            let next = (b + step).clamp(min_b, max_b);
            if (next - b).abs() < sensitivity {
                b = next;
                break;
            }
            b = next;
        }
        b
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Model, ModelKind};
    use genome::{MutKind, Mutation, RefSeq, Sequence};

    const THRESHOLD: f64 = 1e-8;

    fn setup() -> (Model, RefSeq) {
        let reference = RefSeq::from_str_strict("ACGTACGTAC").unwrap();
        let model = Model::new(ModelKind::Jc, &reference);
        (model, reference)
    }

    fn regions_for(mutations: Vec<Mutation>, genome_length: u32) -> SeqRegions {
        let seq = Sequence::new("t".into(), mutations).unwrap();
        SeqRegions::from_sequence(&seq, genome_length)
    }

    #[test]
    fn lower_merge_of_identical_references() {
        let (model, reference) = setup();
        let ctx = MergeCtx::new(&model, &reference, THRESHOLD);
        let a = regions_for(vec![], 10);
        let b = regions_for(vec![], 10);

        let (merged, log_lh) = merge_lower_lower(&a, 1e-3, &b, 1e-3, &ctx).unwrap();
        merged.assert_valid(10);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.regions()[0].variant, RegionVariant::Ref);
        // Two branches of matching reference: strictly negative, tiny cost.
        assert!(log_lh < 0.0 && log_lh > -0.1);
    }

    #[test]
    fn lower_merge_symmetry() {
        let (model, reference) = setup();
        let ctx = MergeCtx::new(&model, &reference, THRESHOLD);
        let a = regions_for(vec![Mutation::new(MutKind::Base(genome::Base::T), 2, 1).unwrap()], 10);
        let b = regions_for(vec![Mutation::new(MutKind::Missing, 4, 3).unwrap()], 10);

        let (m1, lh1) = merge_lower_lower(&a, 2e-3, &b, 5e-4, &ctx).unwrap();
        let (m2, lh2) = merge_lower_lower(&b, 5e-4, &a, 2e-3, &ctx).unwrap();
        assert!((lh1 - lh2).abs() < 1e-12);
        assert_eq!(m1.len(), m2.len());
        for (r1, r2) in m1.iter().zip(m2.iter()) {
            assert_eq!(r1.end, r2.end);
            assert_eq!(r1.variant, r2.variant);
        }
    }

    #[test]
    fn lower_merge_conflicting_states_yields_ambiguity() {
        let (model, reference) = setup();
        let ctx = MergeCtx::new(&model, &reference, THRESHOLD);
        let a = regions_for(vec![Mutation::new(MutKind::Base(genome::Base::T), 0, 1).unwrap()], 10);
        let b = regions_for(vec![Mutation::new(MutKind::Base(genome::Base::C), 0, 1).unwrap()], 10);

        let (merged, log_lh) = merge_lower_lower(&a, 1e-3, &b, 1e-3, &ctx).unwrap();
        merged.assert_valid(10);
        match &merged.regions()[0].variant {
            RegionVariant::Ambiguous(lh) => {
                // Mass concentrates on the two observed states.
                assert!(lh[genome::Base::T.index()] > 0.4);
                assert!(lh[genome::Base::C.index()] > 0.4);
            }
            other => panic!("expected ambiguity, got {other:?}"),
        }
        // A conflict on a short branch is expensive.
        assert!(log_lh < (1e-2f64).ln());
    }

    #[test]
    fn lower_merge_conflict_at_zero_length_is_impossible() {
        let (model, reference) = setup();
        let ctx = MergeCtx::new(&model, &reference, THRESHOLD);
        let a = regions_for(vec![Mutation::new(MutKind::Base(genome::Base::T), 0, 1).unwrap()], 10);
        let b = regions_for(vec![Mutation::new(MutKind::Base(genome::Base::C), 0, 1).unwrap()], 10);

        assert!(merge_lower_lower(&a, 0.0, &b, 0.0, &ctx).is_none());
    }

    #[test]
    fn missing_side_carries_the_other() {
        let (model, reference) = setup();
        let ctx = MergeCtx::new(&model, &reference, THRESHOLD);
        let a = regions_for(vec![Mutation::new(MutKind::Missing, 0, 10).unwrap()], 10);
        let b = regions_for(vec![Mutation::new(MutKind::Base(genome::Base::G), 5, 1).unwrap()], 10);

        let (merged, log_lh) = merge_lower_lower(&a, 1e-3, &b, 2e-3, &ctx).unwrap();
        merged.assert_valid(10);
        assert_eq!(log_lh, 0.0);
        let mutated = &merged.regions()[1];
        assert_eq!(mutated.variant, RegionVariant::Base(genome::Base::G));
        // The carrying branch is baked into the region.
        assert!((mutated.plength_to_node.unwrap() - 2e-3).abs() < 1e-15);
    }

    #[test]
    fn total_at_root_marks_crossings() {
        let (model, reference) = setup();
        let ctx = MergeCtx::new(&model, &reference, THRESHOLD);
        let lower = regions_for(vec![Mutation::new(MutKind::Base(genome::Base::G), 5, 1).unwrap()], 10);

        let total = total_lh_at_root(&lower, 1e-3, &ctx);
        total.assert_valid(10);
        for region in total.iter() {
            assert_eq!(region.plength_to_root, Some(0.0));
            assert_eq!(region.plength_to_node, Some(1e-3));
        }
    }

    #[test]
    fn upper_lower_merge_posterior() {
        let (model, reference) = setup();
        let ctx = MergeCtx::new(&model, &reference, THRESHOLD);
        let upper_source = regions_for(vec![], 10);
        let upper = total_lh_at_root(&upper_source, 1e-3, &ctx);
        let lower = regions_for(vec![Mutation::new(MutKind::Base(genome::Base::T), 2, 1).unwrap()], 10);

        let merged = merge_upper_lower(&upper, 1e-3, &lower, 1e-3, &ctx).unwrap();
        merged.assert_valid(10);
        // Position 2: reference above, T below; some mass on both.
        let disputed = merged.iter().find(|r| r.end == 2).unwrap();
        assert!(matches!(disputed.variant, RegionVariant::Ambiguous(_)));
    }

    #[test]
    fn append_prob_prefers_the_matching_placement() {
        let (model, reference) = setup();
        let ctx = MergeCtx::new(&model, &reference, THRESHOLD);
        let blength = 0.1;

        let plain = regions_for(vec![], 10);
        let mutated = regions_for(vec![Mutation::new(MutKind::Base(genome::Base::T), 2, 1).unwrap()], 10);

        let total_plain = total_lh_at_root(&plain, 0.0, &ctx);
        let total_mutated = total_lh_at_root(&mutated, 0.0, &ctx);

        let sample = regions_for(vec![Mutation::new(MutKind::Base(genome::Base::T), 2, 1).unwrap()], 10);
        let at_mutated = append_prob(&total_mutated, &sample, blength, &ctx);
        let at_plain = append_prob(&total_plain, &sample, blength, &ctx);
        assert!(at_mutated > at_plain);
    }

    #[test]
    fn root_log_lh_of_reference_is_logfreq_sum() {
        let (model, reference) = setup();
        let ctx = MergeCtx::new(&model, &reference, THRESHOLD);
        let lower = regions_for(vec![], 10);

        let expected: f64 = reference.bases().iter()
            .map(|b| model.freqs()[b.index()].ln())
            .sum();
        assert!((root_log_lh(&lower, &ctx) - expected).abs() < 1e-12);
    }

    #[test]
    fn branch_cost_optimum_tracks_divergence() {
        let (model, reference) = setup();
        let ctx = MergeCtx::new(&model, &reference, THRESHOLD);

        let upper_source = regions_for(vec![], 10);
        let upper = total_lh_at_root(&upper_source, 0.0, &ctx);
        let one_mutation = regions_for(vec![Mutation::new(MutKind::Base(genome::Base::T), 2, 1).unwrap()], 10);

        let cost = BranchCost::from_lists(&upper, &one_mutation, &ctx).unwrap();
        let best = cost.optimise(0.1, 1e-9, 10.0, 1e-12);
        // One substitution over ten sites: a clearly positive length,
        // far below saturation.
        assert!(best > 1e-3 && best < 1.0);
        assert!(cost.lh(best) >= cost.lh(0.1) - 1e-12);
        assert!(cost.lh(best) >= cost.lh(1e-6) - 1e-12);
    }
}
