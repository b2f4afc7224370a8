use crate::state::{AmbigSet, Base};
use crate::Position;

use thiserror::Error;

/// What a taxon carries at a position where it differs from the reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutKind {
    /// A concrete substitution.
    Base(Base),
    /// An IUPAC ambiguity code (single position).
    Ambiguous(AmbigSet),
    /// A run of fully ambiguous / missing characters ('N').
    Missing,
    /// A run of gap characters. Treated like [`MutKind::Missing`] by the
    /// likelihood machinery, but preserved for faithful diff round-trips.
    Deletion,
}

impl MutKind {
    /// Whether this kind may span more than one position.
    #[must_use]
    pub fn is_run(self) -> bool {
        matches!(self, MutKind::Missing | MutKind::Deletion)
    }

    /// The character used for this kind in the diff file format.
    #[must_use]
    pub fn to_char(self) -> char {
        match self {
            MutKind::Base(base)      => base.to_char().to_ascii_lowercase(),
            MutKind::Ambiguous(set)  => set.to_char().to_ascii_lowercase(),
            MutKind::Missing         => 'n',
            MutKind::Deletion        => '-',
        }
    }

    pub fn from_char(c: char) -> Result<MutKind, MutationError> {
        match c.to_ascii_uppercase() {
            'N' => Ok(MutKind::Missing),
            '-' => Ok(MutKind::Deletion),
            _ => Base::try_from(c).map(MutKind::Base)
                .or_else(|_| AmbigSet::try_from(c).map(MutKind::Ambiguous))
                .map_err(|_| MutationError::InvalidChar(c)),
        }
    }
}

/// One difference against the reference: `(kind, position, length)`.
///
/// Positions are 0-based. `length > 1` is only meaningful for N/gap runs;
/// concrete and ambiguous substitutions always cover exactly one position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mutation {
    pub kind: MutKind,
    pub position: Position,
    pub length: Position,
}

impl Mutation {
    pub fn new(kind: MutKind, position: Position, length: Position) -> Result<Mutation, MutationError> {
        if length == 0 {
            return Err(MutationError::ZeroLength { position });
        }
        if length > 1 && !kind.is_run() {
            return Err(MutationError::RunOnSubstitution { position, length });
        }
        Ok(Mutation { kind, position, length })
    }

    /// First position after the mutation (exclusive end).
    #[must_use]
    pub fn end(&self) -> Position {
        self.position + self.length
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MutationError {
    #[error("'{0}' is not a valid mutation character")]
    InvalidChar(char),

    #[error("Mutation at position {position} has zero length")]
    ZeroLength { position: Position },

    #[error("Substitution at position {position} declares a run length of {length} (only N/gap entries may span multiple positions)")]
    RunOnSubstitution { position: Position, length: Position },
}
