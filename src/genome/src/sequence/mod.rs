pub mod error;
pub use error::SequenceError;

use crate::mutation::{MutKind, Mutation};

/// One taxon: a name plus its sorted, non-overlapping differences against
/// the reference. Everything unmentioned is implicitly reference.
///
/// Sequences are built once from input and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sequence {
    name: String,
    mutations: Vec<Mutation>,
}

impl Sequence {
    /// Build a sequence, enforcing the mutation-list invariants: strictly
    /// increasing positions and no overlapping runs.
    pub fn new(name: String, mutations: Vec<Mutation>) -> Result<Sequence, SequenceError> {
        for window in mutations.windows(2) {
            let (prev, next) = (&window[0], &window[1]);
            if next.position < prev.position {
                return Err(SequenceError::UnsortedMutations {
                    name,
                    position: next.position,
                    previous: prev.position,
                });
            }
            if next.position < prev.end() {
                return Err(SequenceError::OverlappingMutations {
                    name,
                    position: next.position,
                    previous: prev.position,
                });
            }
        }
        Ok(Sequence { name, mutations })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    /// Ordering distance to the reference: every mutation costs
    /// `hamming_weight`, and every kind except a plain substitution adds
    /// its length on top. Low distance means informative.
    #[must_use]
    pub fn distance_to_ref(&self, hamming_weight: f64) -> f64 {
        self.mutations.iter()
            .map(|m| {
                let span = match m.kind {
                    MutKind::Base(_) => 0.0,
                    MutKind::Ambiguous(_) | MutKind::Missing | MutKind::Deletion => f64::from(m.length),
                };
                hamming_weight + span
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Base;
    use anyhow::Result;

    fn base_mut(pos: u32, base: Base) -> Mutation {
        Mutation::new(MutKind::Base(base), pos, 1).unwrap()
    }

    #[test]
    fn invariants_enforced() -> Result<()> {
        let n_run = Mutation::new(MutKind::Missing, 5, 10)?;

        assert!(Sequence::new("ok".into(), vec![base_mut(1, Base::C), n_run]).is_ok());
        assert!(matches!(
            Sequence::new("unsorted".into(), vec![n_run, base_mut(1, Base::C)]),
            Err(SequenceError::UnsortedMutations { .. })
        ));
        assert!(matches!(
            Sequence::new("overlap".into(), vec![n_run, base_mut(9, Base::C)]),
            Err(SequenceError::OverlappingMutations { .. })
        ));
        Ok(())
    }

    #[test]
    fn distance_weights() -> Result<()> {
        let seq = Sequence::new("s".into(), vec![
            base_mut(1, Base::C),
            Mutation::new(MutKind::Missing, 10, 20)?,
            Mutation::new(MutKind::Ambiguous(crate::AmbigSet::try_from('R')?), 40, 1)?,
        ])?;
        // Substitution: 1000; N run: 1000 + 20; ambiguity: 1000 + 1.
        assert!((seq.distance_to_ref(1000.0) - 3021.0).abs() < f64::EPSILON);
        // A lone 1-base N outweighs two plain substitutions.
        let noisy = Sequence::new("noisy".into(), vec![Mutation::new(MutKind::Missing, 0, 1)?])?;
        let mutated = Sequence::new("mutated".into(), vec![base_mut(0, Base::C), base_mut(5, Base::G)])?;
        assert!(mutated.distance_to_ref(1000.0) > noisy.distance_to_ref(1000.0));
        Ok(())
    }

    #[test]
    fn empty_mutation_list_is_reference() -> Result<()> {
        let seq = Sequence::new("ref-like".into(), vec![])?;
        assert_eq!(seq.distance_to_ref(1000.0), 0.0);
        Ok(())
    }
}
