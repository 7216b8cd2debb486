//! End-to-end integration test driving a full context + generation cycle
//! against the in-memory execution backend.

use gen_session_core::backend::{FakeExecutionBackend, StreamHandle};
use gen_session_core::mapping::Mapping;
use gen_session_core::model_config::ModelConfig;
use gen_session_core::sampling_config::SamplingConfig;
use gen_session_core::session::{GenerationSession, SessionState};
use gen_session_core::variant::ModelVariant;

#[test]
fn full_generation_cycle_reaches_a_terminal_state() {
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
        true,
        false,
    )
    .unwrap();

    let sampling = SamplingConfig::new(2, 0).with_max_new_tokens(6);
    session.setup(2, 1, 5, sampling, None, None).unwrap();
    assert_eq!(session.state(), SessionState::Configured);

    session
        .context_step(&[vec![1, 2, 3, 4, 5], vec![6, 7, 8, 9, 10]])
        .unwrap();
    assert_eq!(session.state(), SessionState::Generation);

    let output = session.run_to_completion().unwrap();
    assert!(matches!(session.state(), SessionState::Stopped | SessionState::Exhausted));

    // Both batch elements echo their context tokens in the finalized output.
    for (s, expected) in [1, 2, 3, 4, 5].into_iter().enumerate() {
        assert_eq!(output.get(0, 0, s), expected);
    }
}

#[test]
fn beam_width_two_runs_without_error() {
    let backend = FakeExecutionBackend::new(vec!["logits".to_string()], 1);
    let model_config = ModelConfig::new(32000, 2, 4, 512).with_head_size(128);
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

    let sampling = SamplingConfig::new(2, 0).with_max_new_tokens(4).with_beams(2);
    session.setup(1, 2, 4, sampling, None, None).unwrap();
    session.context_step(&[vec![1, 2, 3, 4]]).unwrap();
    let result = session.run_to_completion();
    assert!(result.is_ok());
}
