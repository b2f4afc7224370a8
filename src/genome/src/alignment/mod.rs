pub mod error;
pub use error::AlignmentError;

use crate::reference::RefSeq;
use crate::sequence::Sequence;
use crate::Position;

use log::debug;

/// The full input data set: the reference plus every taxon's mutation list.
#[derive(Debug, Clone)]
pub struct Alignment {
    reference: RefSeq,
    sequences: Vec<Sequence>,
}

impl Alignment {
    /// Bundle reference and sequences, checking that every mutation fits
    /// within the reference and that taxon names are unique.
    pub fn new(reference: RefSeq, sequences: Vec<Sequence>) -> Result<Alignment, AlignmentError> {
        let len = reference.len() as Position;
        let mut seen = std::collections::HashSet::with_capacity(sequences.len());
        for seq in &sequences {
            if let Some(mutation) = seq.mutations().iter().find(|m| m.end() > len) {
                return Err(AlignmentError::MutationOutOfBounds {
                    name: seq.name().to_string(),
                    position: mutation.position,
                    end: mutation.end(),
                    genome_length: len,
                });
            }
            if !seen.insert(seq.name().to_string()) {
                return Err(AlignmentError::DuplicateName(seq.name().to_string()));
            }
        }
        Ok(Alignment { reference, sequences })
    }

    #[must_use]
    pub fn reference(&self) -> &RefSeq {
        &self.reference
    }

    /// Genome length `L`.
    #[must_use]
    pub fn genome_length(&self) -> Position {
        self.reference.len() as Position
    }

    #[must_use]
    pub fn sequences(&self) -> &[Sequence] {
        &self.sequences
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    /// Order taxa by increasing distance to the reference, so that the most
    /// informative sequences anchor the early tree. The sort is stable:
    /// equally distant taxa keep their input order, which keeps runs
    /// reproducible.
    pub fn sort_by_distance(&mut self, hamming_weight: f64) {
        self.sequences.sort_by(|a, b| {
            a.distance_to_ref(hamming_weight)
                .total_cmp(&b.distance_to_ref(hamming_weight))
        });
        debug!("Sorted {} sequences by distance to reference", self.sequences.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::{MutKind, Mutation};
    use crate::state::Base;
    use anyhow::Result;

    fn aln(mutations: Vec<Vec<Mutation>>) -> Result<Alignment, AlignmentError> {
        let reference = RefSeq::from_str_strict("ACGTACGT").unwrap();
        let sequences = mutations.into_iter().enumerate()
            .map(|(i, muts)| Sequence::new(format!("T{i}"), muts).unwrap())
            .collect();
        Alignment::new(reference, sequences)
    }

    #[test]
    fn out_of_bounds_rejected() -> Result<()> {
        let ok = vec![Mutation::new(MutKind::Missing, 4, 4)?];
        let bad = vec![Mutation::new(MutKind::Missing, 4, 5)?];
        assert!(aln(vec![ok]).is_ok());
        assert!(matches!(aln(vec![bad]), Err(AlignmentError::MutationOutOfBounds { .. })));
        Ok(())
    }

    #[test]
    fn duplicate_names_rejected() {
        let reference = RefSeq::from_str_strict("ACGT").unwrap();
        let sequences = vec![
            Sequence::new("T0".into(), vec![]).unwrap(),
            Sequence::new("T0".into(), vec![]).unwrap(),
        ];
        assert!(matches!(
            Alignment::new(reference, sequences),
            Err(AlignmentError::DuplicateName(_))
        ));
    }

    #[test]
    fn distance_sort_puts_informative_first() -> Result<()> {
        let near = vec![Mutation::new(MutKind::Base(Base::C), 0, 1)?];
        let noisy = vec![Mutation::new(MutKind::Missing, 0, 6)?];
        let mut alignment = aln(vec![noisy, near]).unwrap();
        alignment.sort_by_distance(1000.0);
        assert_eq!(alignment.sequences()[0].name(), "T1");
        Ok(())
    }
}
