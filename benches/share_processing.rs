//! Benchmarks the per-share hot path: coinbase/header assembly and the
//! validation pipeline a Stratum `mining.submit` runs through (§4.3).

use criterion::{criterion_group, criterion_main, Criterion};
use lodestone_pool::encoding::{self, Sha256dAlgorithm};
use lodestone_pool::job::{JobManager, Submission};
use std::sync::Arc;

fn sample_job(manager: &JobManager) -> Arc<lodestone_pool::job::Job> {
    manager.build_job(
        "00".repeat(32),
        vec![0u8; 42],
        vec![0u8; 4],
        vec![[7u8; 32]; 3],
        1,
        0x1d00ffff,
        1_700_000_000,
        840_000,
        true,
        vec![],
    )
}

fn bench_coinbase_hash(c: &mut Criterion) {
    let coinbase1 = vec![0u8; 42];
    let coinbase2 = vec![0u8; 4];

    c.bench_function("coinbase_hash", |b| {
        b.iter(|| encoding::coinbase_hash(&coinbase1, "aabbccdd", "0000000100000000", &coinbase2))
    });
}

fn bench_block_header(c: &mut Criterion) {
    let merkle_root = [3u8; 32];
    let prev_hash = "00".repeat(32);

    c.bench_function("block_header", |b| {
        b.iter(|| encoding::block_header(1, &prev_hash, merkle_root, 1_700_000_000, 0x1d00ffff, 0))
    });
}

fn bench_validate_submit(c: &mut Criterion) {
    let manager = JobManager::new(Arc::new(Sha256dAlgorithm));
    let job = sample_job(&manager);
    let share_target = encoding::max_target();

    let mut nonce = 0u32;
    c.bench_function("validate_submit", |b| {
        b.iter(|| {
            nonce = nonce.wrapping_add(1);
            let submission = Submission {
                job_id: job.job_id.clone(),
                extra_nonce1: "aabbccdd".into(),
                extra_nonce2: "0000000100000000".into(),
                n_time: job.n_time,
                nonce,
                solution: None,
            };
            manager.validate_submit(
                &submission,
                &share_target,
                8,
                |job, e1, e2| encoding::coinbase_hash(&job.coinbase1, e1, e2, &job.coinbase2),
                |job, merkle_root, n_time, nonce| {
                    encoding::block_header(job.version, &job.prev_hash, merkle_root, n_time, job.n_bits, nonce)
                },
            )
        })
    });
}

criterion_group!(benches, bench_coinbase_hash, bench_block_header, bench_validate_submit);
criterion_main!(benches);
