mod common;

use genome::{RefSeq, Sequence};
use likelihood::regions::{RegionVariant, SeqRegions};
use likelihood::MergeCtx;
use pretty_assertions::assert_eq;

fn sequences_from_diff(diff: &str, dir: &tempfile::TempDir) -> (RefSeq, Vec<Sequence>) {
    let path = common::write_file(dir.path(), "input.maple", diff);
    sprig_io::read::read_diff(&path, None).expect("valid diff fixture")
}

/// Two identical taxa collapse onto one root leaf.
#[test]
fn tiny_identity() {
    let dir = tempfile::tempdir().unwrap();
    let (reference, sequences) = sequences_from_diff(">REF\nACGT\n>T1\n>T2\n", &dir);
    let (tree, _, _) = common::build_tree(&reference, &sequences);

    assert_eq!(tree.num_leaves(), 1);
    assert_eq!(tree.num_taxa(), 2);
    assert_eq!(tree.to_newick(true, false), "(T1:0,T2:0):0;");
}

/// A shared mutation pulls two taxa onto the same leaf, at a positive
/// branch length, deterministically.
#[test]
fn single_mutation() {
    let dir = tempfile::tempdir().unwrap();
    let diff = ">REF\nAAAA\n>T1\n>T2\nc\t2\n>T3\nc\t2\n";

    let (reference, sequences) = sequences_from_diff(diff, &dir);
    let (mut tree, model, params) = common::build_tree(&reference, &sequences);

    // T2 and T3 carry the same data: one leaf, two names.
    let t2 = tree.find_leaf("T2").expect("T2 placed");
    assert_eq!(tree.node(t2).less_info_seqs, vec!["T3".to_string()]);
    assert!(tree.node(t2).blength() > 0.0);

    let ctx = MergeCtx::new(&model, &reference, params.threshold_prob);
    let first_run = tree.log_lh(&ctx);

    // The same input produces the same likelihood again.
    let (mut replay, model2, _) = common::build_tree(&reference, &sequences);
    let ctx2 = MergeCtx::new(&model2, &reference, params.threshold_prob);
    assert_eq!(first_run, replay.log_lh(&ctx2));
}

/// An `N` position is uniform in the lower likelihood, and a taxon whose
/// only difference is missing data is absorbed by its informative twin.
#[test]
fn alphabet_ambiguity() {
    let dir = tempfile::tempdir().unwrap();
    let diff = ">REF\nAAAA\n>T1\nn\t2\n>T2\n>T3\nc\t2\n";
    let (reference, mut sequences) = sequences_from_diff(diff, &dir);

    let t1 = sequences.iter().find(|s| s.name() == "T1").unwrap();
    let regions = SeqRegions::from_sequence(t1, 4);
    regions.assert_valid(4);
    let masked = regions.iter().find(|r| r.end == 1).unwrap();
    assert_eq!(masked.variant, RegionVariant::Missing);

    // Insertion order: most informative first (T2, T3, then T1).
    sequences.sort_by(|a, b| a.distance_to_ref(1000.0).total_cmp(&b.distance_to_ref(1000.0)));
    assert_eq!(sequences[0].name(), "T2");

    let (tree, _, _) = common::build_tree(&reference, &sequences);
    // ANAA adds nothing over AAAA: absorbed rather than placed.
    let t2 = tree.find_leaf("T2").expect("T2 placed");
    assert_eq!(tree.node(t2).less_info_seqs, vec!["T1".to_string()]);
    assert!(tree.find_leaf("T3").is_some());
}

/// With an empirical model and a short update period, observed mutations
/// must bend the matrix away from its JC start.
#[test]
fn empirical_update_triggers() {
    use likelihood::model::SubstitutionModel;
    use likelihood::{Model, ModelKind};

    let reference = RefSeq::from_str_strict("ACGTACGTAC").unwrap();
    let mut model = Model::new(ModelKind::Gtr, &reference);
    let jc_entry = model.entry(genome::Base::A, genome::Base::C, 0);

    let node = SeqRegions::from_sequence(&Sequence::new("n".into(), vec![]).unwrap(), 10);
    let mutated = SeqRegions::from_sequence(&Sequence::new("s".into(), vec![
        genome::Mutation::new(genome::MutKind::Base(genome::Base::C), 4, 1).unwrap(),
    ]).unwrap(), 10);

    // Five placements, updating every second one.
    let mut updated = false;
    for i in 1..=5u32 {
        model.update_pseudocounts(&reference, &node, &mutated);
        if i % 2 == 0 {
            updated |= model.update_empirical(&reference);
        }
    }
    assert!(updated);
    assert!(model.entry(genome::Base::A, genome::Base::C, 0) > jc_entry);
}

/// Full pipeline over a diff file: infer, write the tree files, and keep
/// the placement of every taxon stable.
#[test]
fn end_to_end_inference() {
    let dir = tempfile::tempdir().unwrap();
    let diff = "\
>REF
AAAAAAAAAAAAAAAAAAAA
>T1
c\t2
c\t3
>T2
c\t2
c\t3
g\t6
>T3
t\t11
t\t12
>T4
t\t11
t\t12
g\t16
>T5
n\t1\t4
";
    let input = common::write_file(dir.path(), "run.maple", diff);
    let prefix = dir.path().join("out");
    let cli = common::cli(&[
        "--diff", input.to_str().unwrap(),
        "--prefix", prefix.to_str().unwrap(),
        "--model", "JC",
        "--branch-support",
        "--replicates", "50",
        "--seed", "7",
    ]);
    cli.validate().expect("valid CLI");
    sprig_rs::run(&cli).expect("inference succeeds");

    for suffix in [".treefile", "_init.treefile", "_topo.treefile"] {
        let path = dir.path().join(format!("out{suffix}"));
        assert!(path.exists(), "missing {suffix}");
    }

    let newick = std::fs::read_to_string(dir.path().join("out.treefile")).unwrap();
    assert!(newick.trim_end().ends_with(';'));
    for taxon in ["T1", "T2", "T3", "T4", "T5"] {
        assert!(newick.contains(taxon), "taxon {taxon} missing from {newick}");
    }

    // The final tree reparses, and pairs by shared mutations.
    let parsed = sprig_io::read::parse_newick(&newick).expect("emitted tree reparses");
    fn leaves(node: &sprig_io::NewickNode, out: &mut Vec<String>) {
        if node.children.is_empty() {
            out.push(node.name.clone().unwrap_or_default());
        }
        for child in &node.children {
            leaves(child, out);
        }
    }
    let mut names = Vec::new();
    leaves(&parsed, &mut names);
    assert_eq!(names.len(), 5);

    // Re-running without --overwrite refuses to clobber the outputs.
    let err = sprig_rs::run(&cli).expect_err("must refuse to overwrite");
    assert!(err.to_string().contains("already exists"), "unexpected error: {err}");
}
