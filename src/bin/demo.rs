//! CLI demo: wires a [`RuntimeOptions`] file and the in-memory
//! [`FakeExecutionBackend`] together to run one context step and a handful
//! of generation steps end to end, without a real engine or GPU.
//!
//! Replaces the teacher's axum HTTP server entrypoint (`src/main.rs`): this
//! crate is a library consumed by a real engine integration, so the
//! ambient-stack "server" surface here is a small, scriptable CLI rather
//! than a served API.

use gen_session_core::backend::{FakeExecutionBackend, StreamHandle};
use gen_session_core::config::RuntimeOptions;
use gen_session_core::mapping::Mapping;
use gen_session_core::model_config::ModelConfig;
use gen_session_core::sampling_config::SamplingConfig;
use gen_session_core::session::GenerationSession;
use gen_session_core::variant::ModelVariant;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let options = RuntimeOptions::load();
    if let Err(errors) = options.validate() {
        for e in &errors {
            eprintln!("invalid runtime options: {e}");
        }
        std::process::exit(1);
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&options.logging.level))
        .init();

    let backend = FakeExecutionBackend::new(vec!["logits".to_string(), "input_ids".to_string()], 1);
    let model_config = ModelConfig::new(32000, 4, 8, 1024).with_head_size(128);
    let mapping = Mapping::single_gpu();

    let mut session = GenerationSession::new(
        backend,
        &[],
        model_config,
        mapping,
        ModelVariant::Standard,
        StreamHandle(0),
        options.cuda_graph_mode,
        options.debug_mode,
    )?;

    let sampling = SamplingConfig::new(2, 0).with_max_new_tokens(8).update_top_k_top_p(1, 0.0);
    session.setup(1, 1, 6, sampling, None, None)?;

    let prompt_ids = vec![100, 101, 102, 103, 104, 105];
    tracing::info!(?prompt_ids, "running context phase");
    session.context_step(&[prompt_ids])?;

    let output = session.run_to_completion()?;
    let tokens: Vec<i32> = (0..output.max_seq_length).map(|s| output.get(0, 0, s)).collect();
    println!("generated token ids: {tokens:?}");

    Ok(())
}
