use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use serde_json::json;

use aviary_sync::{
    core::{optimistic::OptimisticApplier, queue::MutationQueue},
    mutation::{MutationDraft, MutationRecord},
};

fn draft(target: u64, ring: u64) -> MutationDraft {
    MutationDraft::update("birds", format!("b{target}"), json!({ "ring": format!("R{ring}") }))
}

fn bench_enqueue(c: &mut Criterion) {
    c.bench_function("queue_enqueue_10k", |b| {
        b.iter(|| {
            let mut queue = MutationQueue::new();
            for i in 0..10_000u64 {
                let _ = queue.enqueue(draft(i % 500, i), i).expect("enqueue");
            }
        });
    });
}

fn bench_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_replay");
    for targets in [1u64, 50, 500] {
        group.bench_with_input(BenchmarkId::from_parameter(targets), &targets, |b, &targets| {
            b.iter(|| {
                let mut queue = MutationQueue::new();
                for i in 0..2_000u64 {
                    let _ = queue.enqueue(draft(i % targets, i), i).expect("enqueue");
                }
                while let Some(claimed) = queue.dequeue_next("birds", u64::MAX).expect("dequeue") {
                    queue.mark_done(&claimed.id).expect("done");
                }
            });
        });
    }
    group.finish();
}

fn bench_optimistic_layers(c: &mut Criterion) {
    let records: Vec<MutationRecord> = (0..1_000u64)
        .map(|i| MutationRecord::from_draft(draft(i % 10, i), i).expect("valid"))
        .collect();

    c.bench_function("optimistic_apply_confirm_1k", |b| {
        b.iter(|| {
            let mut applier = OptimisticApplier::new();
            for record in &records {
                applier.apply_optimistic(record);
            }
            for record in &records {
                applier.confirm(&record.key(), &record.id, Some(record.payload.clone()));
            }
        });
    });
}

criterion_group!(benches, bench_enqueue, bench_replay, bench_optimistic_layers);
criterion_main!(benches);
