use criterion::{criterion_group, criterion_main, Criterion};

use genome::{Base, MutKind, Mutation, RefSeq, Sequence};
use likelihood::regions::{append_prob, merge_lower_lower, total_lh_at_root, SeqRegions};
use likelihood::{MergeCtx, Model, ModelKind};

const GENOME_LENGTH: u32 = 30_000;

fn fixture() -> (RefSeq, SeqRegions, SeqRegions) {
    let bases: String = (0..GENOME_LENGTH)
        .map(|i| Base::ALL[(i as usize * 7 + i as usize / 13) % 4].to_char())
        .collect();
    let reference = RefSeq::from_str_strict(&bases).unwrap();

    // Two typical pandemic-style taxa: ~30 substitutions plus an N run.
    let taxon = |offset: u32| {
        let mut mutations: Vec<Mutation> = (0..30)
            .map(|k| {
                let pos = (offset + k * 997) % (GENOME_LENGTH - 200);
                let replacement = Base::ALL.into_iter().find(|b| *b != reference.base(pos)).unwrap();
                Mutation::new(MutKind::Base(replacement), pos, 1).unwrap()
            })
            .collect();
        mutations.sort_by_key(|m| m.position);
        mutations.dedup_by_key(|m| m.position);
        mutations.push(Mutation::new(MutKind::Missing, GENOME_LENGTH - 150, 100).unwrap());
        let sequence = Sequence::new("bench".into(), mutations).unwrap();
        SeqRegions::from_sequence(&sequence, GENOME_LENGTH)
    };
    (reference, taxon(11), taxon(313))
}

fn bench_merges(c: &mut Criterion) {
    let (reference, a, b) = fixture();
    let model = Model::new(ModelKind::Jc, &reference);
    let ctx = MergeCtx::new(&model, &reference, 1e-8);
    let blength = 1.0 / f64::from(GENOME_LENGTH);

    c.bench_function("merge_lower_lower", |bench| {
        bench.iter(|| merge_lower_lower(&a, blength, &b, blength, &ctx).unwrap())
    });

    let total = total_lh_at_root(&a, 0.0, &ctx);
    c.bench_function("append_prob", |bench| {
        bench.iter(|| append_prob(&total, &b, blength, &ctx))
    });

    c.bench_function("total_lh_at_root", |bench| {
        bench.iter(|| total_lh_at_root(&a, blength, &ctx))
    });
}

criterion_group!(benches, bench_merges);
criterion_main!(benches);
