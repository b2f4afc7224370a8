use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("File {0} already exists. Use --overwrite if you really want to redo the analysis and overwrite all output files")]
    FileExists(PathBuf),

    #[error("Could not create '{path}': {source}")]
    Create { path: PathBuf, source: std::io::Error },

    #[error("Could not write to '{path}': {source}")]
    Write { path: PathBuf, source: std::io::Error },
}
