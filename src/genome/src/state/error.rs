use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
#[error("'{0}' is not a concrete nucleotide (expected one of A, C, G, T/U)")]
pub struct ParseBaseError(pub char);

#[derive(Error, Debug, PartialEq, Eq)]
#[error("'{0}' is not an IUPAC ambiguity code")]
pub struct ParseAmbigError(pub char);
