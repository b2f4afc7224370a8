#![allow(dead_code)] // each test binary uses its own slice of these helpers

use std::io::Write;
use std::path::{Path, PathBuf};

use clap::Parser;
use genome::{RefSeq, Sequence};
use likelihood::regions::SeqRegions;
use likelihood::{MergeCtx, Model, ModelKind};
use phylo::{SearchParams, Tree};

/// Build a CLI value as if the given arguments came from the shell.
pub fn cli(args: &[&str]) -> parser::Cli {
    parser::Cli::parse_from(std::iter::once("sprig-rs").chain(args.iter().copied()))
}

/// Write `content` to `name` inside `dir` and return the path.
pub fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).expect("temp file");
    file.write_all(content.as_bytes()).expect("temp write");
    path
}

/// A minimal in-process inference: place every sequence of a parsed diff
/// in order, with JC and default thresholds. Returns tree and model.
pub fn build_tree(reference: &RefSeq, sequences: &[Sequence]) -> (Tree, Model, SearchParams) {
    let genome_length = reference.len() as u32;
    let params = SearchParams::new(genome_length);
    let mut model = Model::new(ModelKind::Jc, reference);

    let mut iter = sequences.iter();
    let first = iter.next().expect("at least one sequence");
    let mut tree = Tree::with_root_sample(
        first.name().to_string(),
        SeqRegions::from_sequence(first, genome_length),
        genome_length,
    );
    for sequence in iter {
        let sample = SeqRegions::from_sequence(sequence, genome_length);
        let placement = {
            let ctx = MergeCtx::new(&model, reference, params.threshold_prob);
            tree.seek_placement(&sample, &params, &ctx)
        };
        match placement {
            phylo::Placement::LessInformative { leaf } => {
                tree.absorb_less_informative(leaf, sequence.name().to_string());
            }
            phylo::Placement::Attach(site) => {
                tree.place_sample(&site, sequence.name().to_string(), sample, &mut model, &params, reference);
            }
        }
    }
    (tree, model, params)
}
