use thiserror::Error;

use crate::Position;

#[derive(Error, Debug)]
pub enum SequenceError {
    #[error("Sequence '{name}': mutation at position {position} appears after position {previous} (list must be sorted)")]
    UnsortedMutations { name: String, position: Position, previous: Position },

    #[error("Sequence '{name}': mutation at position {position} overlaps the entry starting at {previous}")]
    OverlappingMutations { name: String, position: Position, previous: Position },
}
