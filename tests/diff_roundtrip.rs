mod common;

use genome::{Base, MutKind, Mutation, RefSeq, Sequence};
use rand::prelude::*;
use rand::rngs::StdRng;

/// Parse -> write -> reparse of a sizeable diff file must be lossless,
/// byte for byte.
#[test]
fn diff_roundtrip_hundred_taxa() {
    let mut rng = StdRng::seed_from_u64(2024);
    let genome_length: u32 = 2_000;

    let reference = {
        let bases: String = (0..genome_length)
            .map(|_| Base::ALL[rng.gen_range(0..4)].to_char())
            .collect();
        RefSeq::from_str_strict(&bases).unwrap()
    };

    let sequences: Vec<Sequence> = (0..100)
        .map(|i| {
            let mut positions: Vec<u32> = (0..genome_length).collect();
            positions.shuffle(&mut rng);
            let mut picked: Vec<u32> = positions.into_iter().take(30).collect();
            picked.sort_unstable();

            let mutations = picked.iter()
                .filter_map(|&pos| {
                    match rng.gen_range(0..4u8) {
                        0 => {
                            // A substitution to a base differing from the
                            // reference.
                            let current = reference.base(pos);
                            let replacement = Base::ALL.into_iter().find(|b| *b != current).unwrap();
                            Some(Mutation::new(MutKind::Base(replacement), pos, 1).unwrap())
                        }
                        1 => Some(Mutation::new(MutKind::Missing, pos, 1).unwrap()),
                        2 => Some(Mutation::new(MutKind::Ambiguous('R'.try_into().unwrap()), pos, 1).unwrap()),
                        _ => None,
                    }
                })
                .collect();
            Sequence::new(format!("taxon_{i}"), mutations).unwrap()
        })
        .collect();

    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("first.maple");
    sprig_io::write::write_diff(&first, &reference, &sequences, false).unwrap();

    let (reread_ref, reread) = sprig_io::read::read_diff(&first, None).unwrap();
    assert_eq!(reread_ref, reference);
    assert_eq!(reread, sequences);

    let second = dir.path().join("second.maple");
    sprig_io::write::write_diff(&second, &reread_ref, &reread, false).unwrap();

    let bytes_first = std::fs::read(&first).unwrap();
    let bytes_second = std::fs::read(&second).unwrap();
    assert_eq!(bytes_first, bytes_second);
}

/// Extraction from FASTA and reconstruction back are inverse operations,
/// end to end through the CLI entry points.
#[test]
fn extract_then_reconstruct() {
    let dir = tempfile::tempdir().unwrap();
    let fasta = "\
>REFSEQ
ACGTACGTACGTACGTACGT
>S1
ACCTACGTACGTACGTACGT
>S2
ACGTACGTNNNNACGTACGT
>S3
ACGTACGTACGTACGTAC--
";
    let aln = common::write_file(dir.path(), "input.fa", fasta);
    let reference = common::write_file(dir.path(), "ref.fa", ">ref\nACGTACGTACGTACGTACGT\n");
    let diff = dir.path().join("converted.maple");

    let cli = common::cli(&[
        "--aln", aln.to_str().unwrap(),
        "--ref", reference.to_str().unwrap(),
        "--diff", diff.to_str().unwrap(),
        "--extract-diff",
    ]);
    cli.validate().unwrap();
    sprig_rs::run(&cli).unwrap();
    assert!(diff.exists());

    let rebuilt = dir.path().join("rebuilt.fa");
    let cli = common::cli(&[
        "--diff", diff.to_str().unwrap(),
        "--output-aln", rebuilt.to_str().unwrap(),
    ]);
    cli.validate().unwrap();
    sprig_rs::run(&cli).unwrap();

    let reread = sprig_io::read::read_fasta(&rebuilt).unwrap();
    let original = sprig_io::read::read_fasta(&aln).unwrap();
    assert_eq!(reread, original);
}
