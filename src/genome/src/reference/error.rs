use thiserror::Error;

use crate::state::ParseBaseError;

#[derive(Error, Debug)]
pub enum RefSeqError {
    #[error("Reference sequence is empty")]
    Empty,

    #[error("Invalid reference character at offset {offset}: {source}")]
    InvalidBase { offset: usize, source: ParseBaseError },
}
