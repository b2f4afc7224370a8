use thiserror::Error;

use crate::Position;

#[derive(Error, Debug)]
pub enum AlignmentError {
    #[error("Sequence '{name}': mutation [{position}, {end}) exceeds the reference length ({genome_length})")]
    MutationOutOfBounds { name: String, position: Position, end: Position, genome_length: Position },

    #[error("Duplicate sequence name: '{0}'")]
    DuplicateName(String),
}
