use std::path::PathBuf;

use thiserror::Error;

use genome::reference::RefSeqError;
use genome::sequence::SequenceError;
use genome::Position;

#[derive(Error, Debug)]
pub enum ReadError {
    #[error("Could not open '{path}': {source}")]
    Open { path: PathBuf, source: std::io::Error },

    #[error("I/O error at {path}:{line}: {source}")]
    Line { path: PathBuf, line: usize, source: std::io::Error },

    #[error("'{0}' holds no data")]
    Empty(PathBuf),

    #[error("Could not recognise the format of '{path}' (first byte '{first}')")]
    UnknownFormat { path: PathBuf, first: char },

    #[error("Malformed input at {path}:{line}: {reason}")]
    Malformed { path: PathBuf, line: usize, reason: String },

    #[error("Invalid reference in '{path}': {source}")]
    Reference { path: PathBuf, source: RefSeqError },

    #[error("Could not build a consensus reference: {source}")]
    Consensus { source: RefSeqError },

    #[error("Sequence '{name}' is {length} characters long, the reference {expected}")]
    LengthMismatch { name: String, length: usize, expected: usize },

    #[error("Sequence '{name}' carries unsupported residue '{residue}' at position {position}")]
    BadResidue { name: String, position: Position, residue: char },

    #[error(transparent)]
    Sequence {
        #[from]
        source: SequenceError,
    },

    #[error("'{0}' declares no reference sequence and none was supplied via --reference")]
    MissingReference(PathBuf),

    #[error("Invalid Newick: {0}")]
    Newick(String),
}

impl ReadError {
    pub(crate) fn open(path: &std::path::Path, source: std::io::Error) -> ReadError {
        ReadError::Open { path: path.to_path_buf(), source }
    }

    pub(crate) fn line(path: &std::path::Path, line: usize, source: std::io::Error) -> ReadError {
        ReadError::Line { path: path.to_path_buf(), line: line + 1, source }
    }
}
