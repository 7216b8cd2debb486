//! Benchmarks the per-step cost of driving a [`GenerationSession`] against
//! the in-memory [`FakeExecutionBackend`], isolating session bookkeeping
//! overhead (buffer updates, KV-cache stepping, decoder sampling) from any
//! real engine launch cost.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use gen_session_core::backend::{FakeExecutionBackend, StreamHandle};
use gen_session_core::mapping::Mapping;
use gen_session_core::model_config::ModelConfig;
use gen_session_core::sampling_config::SamplingConfig;
use gen_session_core::session::GenerationSession;
use gen_session_core::variant::ModelVariant;

fn configured_session() -> GenerationSession<FakeExecutionBackend> {
    let backend = FakeExecutionBackend::new(vec!["logits".to_string()], 1);
    let model_config = ModelConfig::new(32000, 4, 8, 1024).with_head_size(128);
    let mapping = Mapping::single_gpu();
    let mut session = GenerationSession::new(
        backend,
        &[],
        model_config,
        mapping,
        ModelVariant::Standard,
        StreamHandle(0),
        false,
        false,
    )
    .unwrap();

    let sampling = SamplingConfig::new(2, 0).with_max_new_tokens(64);
    session.setup(1, 1, 16, sampling, None, None).unwrap();
    session.context_step(&[vec![10; 16]]).unwrap();
    session
}

fn bench_generation_step(c: &mut Criterion) {
    c.bench_function("generation_step", |b| {
        b.iter_batched(
            configured_session,
            |mut session| {
                let _ = black_box(session.generation_step());
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_generation_step);
criterion_main!(benches);
