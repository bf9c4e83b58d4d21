use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use zerg_grid::balancer::{BundlerFactory, FixedContext, Profile};
use zerg_grid::queen::{JobQueue, JobSubmission};
use zerg_grid::{Feedback, WorkerId};

pub fn bench_bundler_sizing(c: &mut Criterion) {
    let factory = BundlerFactory::with_builtin();
    for algorithm in ["proportional", "autotuned", "rl"] {
        let profile = Profile::new(algorithm).with("seed", 7);
        let bundler = factory
            .create(algorithm, &profile, Arc::new(FixedContext::new(10_000)))
            .unwrap();
        let workers: Vec<WorkerId> = (0..32).map(WorkerId).collect();
        c.bench_function(&format!("{algorithm}: feedback + next_size over 32 drones"), |b| {
            let mut n = 0u64;
            b.iter(|| {
                n += 1;
                let worker = workers[(n % 32) as usize];
                let elapsed = Duration::from_micros(100 + (n % 17) * 10);
                bundler.feedback(worker, &Feedback::new(10, elapsed));
                black_box(bundler.next_size(worker))
            })
        });
    }
}

pub fn bench_queue_dispatch(c: &mut Criterion) {
    c.bench_function("carve and complete 1000 tasks across 10 jobs", |b| {
        b.iter(|| {
            let queue = JobQueue::new();
            for j in 0..10 {
                queue.add_bundle(
                    JobSubmission::new(format!("job-{j}"), "bench")
                        .with_priority(j % 3)
                        .with_tasks((0..100).map(|_| Bytes::from_static(b"task"))),
                );
            }
            while let Some(bundle) = queue.poll_bundle(WorkerId(1), || 7) {
                let outcomes = bundle
                    .positions()
                    .map(|p| (p, zerg_grid::TaskOutcome::Completed(Bytes::new())))
                    .collect();
                queue
                    .bundle_completed(&bundle.job_id, bundle.id, outcomes, false)
                    .unwrap();
            }
            black_box(queue.is_empty())
        })
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default();
    targets = bench_bundler_sizing, bench_queue_dispatch
}
criterion_main!(benches);
