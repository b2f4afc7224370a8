pub mod error;
pub use error::WriteError;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use genome::{MutKind, RefSeq, Sequence};
use log::info;

use crate::read::REF_NAME;

/// Create an output file, refusing to clobber an existing one unless the
/// caller passed `--overwrite`.
pub fn create_output(path: &Path, overwrite: bool) -> Result<File, WriteError> {
    if path.exists() && !overwrite {
        return Err(WriteError::FileExists(path.to_path_buf()));
    }
    File::create(path).map_err(|source| WriteError::Create { path: path.to_path_buf(), source })
}

/// Write a Newick string (already terminated by `;`) to `path`.
pub fn write_tree_file(path: &Path, newick: &str, overwrite: bool) -> Result<(), WriteError> {
    let mut out = BufWriter::new(create_output(path, overwrite)?);
    writeln!(out, "{newick}").map_err(|source| WriteError::Write { path: path.to_path_buf(), source })?;
    info!("Wrote tree to {}", path.display());
    Ok(())
}

/// Write the diff representation: the reference under `>REF`, then one
/// block of tab-separated mutation lines per taxon. Positions are emitted
/// 1-based, run lengths only for N/gap entries.
pub fn write_diff(path: &Path, reference: &RefSeq, sequences: &[Sequence], overwrite: bool) -> Result<(), WriteError> {
    let mut out = BufWriter::new(create_output(path, overwrite)?);
    let io_err = |source| WriteError::Write { path: path.to_path_buf(), source };

    writeln!(out, ">{REF_NAME}").map_err(io_err)?;
    writeln!(out, "{reference}").map_err(io_err)?;
    for sequence in sequences {
        writeln!(out, ">{}", sequence.name()).map_err(io_err)?;
        for mutation in sequence.mutations() {
            if mutation.kind.is_run() {
                writeln!(out, "{}\t{}\t{}", mutation.kind.to_char(), mutation.position + 1, mutation.length)
                    .map_err(io_err)?;
            } else {
                writeln!(out, "{}\t{}", mutation.kind.to_char(), mutation.position + 1).map_err(io_err)?;
            }
        }
    }
    info!("Wrote {} taxa to {}", sequences.len(), path.display());
    Ok(())
}

/// Expand every taxon's mutation list back over the reference and write
/// the result as FASTA.
pub fn reconstruct_alignment(path: &Path, reference: &RefSeq, sequences: &[Sequence], overwrite: bool) -> Result<(), WriteError> {
    let mut out = BufWriter::new(create_output(path, overwrite)?);
    let io_err = |source| WriteError::Write { path: path.to_path_buf(), source };

    for sequence in sequences {
        let mut residues: Vec<char> = reference.bases().iter().map(|b| b.to_char()).collect();
        for mutation in sequence.mutations() {
            let glyph = match mutation.kind {
                MutKind::Base(base) => base.to_char(),
                MutKind::Ambiguous(set) => set.to_char(),
                MutKind::Missing => 'N',
                MutKind::Deletion => '-',
            };
            for pos in mutation.position..mutation.end() {
                residues[pos as usize] = glyph;
            }
        }
        writeln!(out, ">{}", sequence.name()).map_err(io_err)?;
        writeln!(out, "{}", residues.iter().collect::<String>()).map_err(io_err)?;
    }
    info!("Reconstructed {} sequences into {}", sequences.len(), path.display());
    Ok(())
}
