//! Generation session: the state machine tying together the runtime, KV
//! cache, dynamic decoder, LoRA binder, IPC workspace, and model-variant
//! strategy (§4.3).
//!
//! Grounded on `original_source`'s `GenerationSession.setup`/`decode`/
//! `decode_regular`/`decode_stream` and on the teacher's
//! `inference/batch_manager.rs` for the tokio-channel-driven streaming idiom
//! (`async_stream::stream!` yielding partial results while a background
//! decode loop runs).

use crate::backend::{DevicePtr, ExecutionBackend, StreamHandle};
use crate::decoder::{BeamHypothesis, DynamicDecoder, LogitsProcessorList, StoppingCriteriaList};
use crate::error::{Result, RuntimeError};
use crate::gather_tree::{gather_tree, FinalOutputIds, FinalizeInputs};
use crate::kv_cache::{ContiguousKvCacheManager, PagedKvCacheManager};
use crate::lora::LoraBinder;
use crate::mapping::Mapping;
use crate::model_config::ModelConfig;
use crate::runtime::{ContextSlot, Runtime};
use crate::sampling_config::SamplingConfig;
use crate::variant::ModelVariant;
use crate::word_list::{to_word_list_format, WordListEncoding};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Configured,
    Context,
    Generation,
    Stopped,
    Exhausted,
}

/// Cross-rank glue for pipeline parallelism: on every rank but the last, the
/// decoder does not run locally, and new tokens / stop signal / cache
/// indirection must be received from the last rank before the next step.
/// `NullRankChannel` is the single-rank (`pp_size == 1`) default: every send
/// is a local no-op and every recv echoes back what was most recently sent.
pub trait RankChannel: Send + Sync {
    fn send_new_tokens(&self, tokens: &[i32]) -> Result<()>;
    fn recv_new_tokens(&self, count: usize) -> Result<Vec<i32>>;
    fn send_should_stop(&self, stop: bool) -> Result<()>;
    fn recv_should_stop(&self) -> Result<bool>;
}

pub struct NullRankChannel;

impl RankChannel for NullRankChannel {
    fn send_new_tokens(&self, _tokens: &[i32]) -> Result<()> {
        Ok(())
    }
    fn recv_new_tokens(&self, count: usize) -> Result<Vec<i32>> {
        Ok(vec![0; count])
    }
    fn send_should_stop(&self, _stop: bool) -> Result<()> {
        Ok(())
    }
    fn recv_should_stop(&self) -> Result<bool> {
        Ok(false)
    }
}

enum CacheBackend {
    Paged(PagedKvCacheManager),
    Contiguous(ContiguousKvCacheManager),
}

/// The generation session: `Created -> Configured -> Context -> Generation
/// -> {Stopped, Exhausted}`.
pub struct GenerationSession<B: ExecutionBackend> {
    backend: Arc<B>,
    model_config: ModelConfig,
    mapping: Mapping,
    variant: ModelVariant,
    runtime: Runtime<B>,
    stream: StreamHandle,
    debug_mode: bool,
    state: SessionState,
    pp_channel: Box<dyn RankChannel>,

    cache: Option<CacheBackend>,
    decoder: Option<DynamicDecoder>,
    lora: LoraBinder,

    pub logits_processors: LogitsProcessorList,
    pub stopping_criteria: StoppingCriteriaList,

    batch_size: usize,
    beam_width: usize,
    max_context_length: usize,
    max_new_tokens: usize,
    max_seq_length: usize,
    end_id: i32,

    sampling: Option<SamplingConfig>,
    bad_words: Option<Vec<WordListEncoding>>,
    stop_words: Option<Vec<WordListEncoding>>,

    output_ids: Vec<i32>,
    parent_ids: Vec<i32>,
    sequence_length_buffer: Vec<i32>,
    context_lengths: Vec<i32>,
    cum_log_probs: Vec<f32>,
    finished: Vec<bool>,

    cache_indirection_src: Vec<i32>,
    cache_indirection_tgt: Vec<i32>,

    decode_step: usize,
    rng_state: u64,
}

impl<B: ExecutionBackend> GenerationSession<B> {
    pub fn new(
        backend: Arc<B>,
        engine_bytes: &[u8],
        model_config: ModelConfig,
        mapping: Mapping,
        variant: ModelVariant,
        stream: StreamHandle,
        graph_mode: bool,
        debug_mode: bool,
    ) -> Result<Self> {
        let runtime = Runtime::new(backend.clone(), engine_bytes, stream, graph_mode)?;
        Ok(Self {
            backend,
            model_config,
            mapping,
            variant,
            runtime,
            stream,
            debug_mode,
            state: SessionState::Created,
            pp_channel: Box::new(NullRankChannel),
            cache: None,
            decoder: None,
            lora: LoraBinder::new(),
            logits_processors: LogitsProcessorList::default(),
            stopping_criteria: StoppingCriteriaList::default(),
            batch_size: 0,
            beam_width: 0,
            max_context_length: 0,
            max_new_tokens: 0,
            max_seq_length: 0,
            end_id: 0,
            sampling: None,
            bad_words: None,
            stop_words: None,
            output_ids: Vec::new(),
            parent_ids: Vec::new(),
            sequence_length_buffer: Vec::new(),
            context_lengths: Vec::new(),
            cum_log_probs: Vec::new(),
            finished: Vec::new(),
            cache_indirection_src: Vec::new(),
            cache_indirection_tgt: Vec::new(),
            decode_step: 0,
            rng_state: 0x9E3779B97F4A7C15,
        })
    }

    pub fn with_pp_channel(mut self, channel: Box<dyn RankChannel>) -> Self {
        self.pp_channel = channel;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Allocate buffers, construct the KV-cache manager and dynamic decoder,
    /// resolve `max_attention_window_size` against the *local* (post-pipeline-
    /// partition) layer count, and bind LoRA UIDs. Corresponds to
    /// `GenerationSession.setup` in `original_source`.
    pub fn setup(
        &mut self,
        batch_size: usize,
        beam_width: usize,
        max_context_length: usize,
        sampling: SamplingConfig,
        lora_request_uids: Option<Vec<String>>,
        tokenize: Option<&dyn Fn(&str) -> Vec<i32>>,
    ) -> Result<()> {
        if self.state != SessionState::Created {
            return Err(RuntimeError::Invariant(
                "setup() must be called exactly once from Created".to_string(),
            ));
        }
        sampling.validate()?;

        let (first_layer, last_layer) = self.mapping.layer_range(self.model_config.num_layers)?;
        let num_local_layers = last_layer - first_layer;

        self.max_seq_length = max_context_length + sampling.max_new_tokens;
        let window = sampling.resolved_attention_window(self.max_seq_length);
        debug!(window, num_local_layers, "resolved local attention window");

        let cache = if self.model_config.paged_kv_cache {
            let total_blocks = (batch_size * beam_width * self.max_seq_length / self.model_config.tokens_per_block.max(1)).max(1) * 2;
            let layer_ptrs: Result<Vec<DevicePtr>> = (0..num_local_layers).map(|_| self.backend.alloc(1)).collect();
            CacheBackend::Paged(PagedKvCacheManager::new(
                self.model_config.tokens_per_block,
                num_local_layers,
                layer_ptrs?,
                total_blocks,
            ))
        } else {
            let primary: Result<Vec<DevicePtr>> = (0..num_local_layers).map(|_| self.backend.alloc(1)).collect();
            let mirror = if self.model_config.gpt_attention_plugin {
                None
            } else {
                let m: Result<Vec<DevicePtr>> = (0..num_local_layers).map(|_| self.backend.alloc(1)).collect();
                Some(m?)
            };
            CacheBackend::Contiguous(ContiguousKvCacheManager::new(num_local_layers, primary?, mirror)?)
        };
        self.cache = Some(cache);

        let mut decoder = DynamicDecoder::new(self.model_config.vocab_size, self.model_config.vocab_size_padded);
        decoder.setup(batch_size, &sampling)?;
        self.decoder = Some(decoder);

        if self.model_config.lora_plugin {
            let uids = lora_request_uids
                .ok_or_else(|| RuntimeError::Configuration("lora_plugin enabled but no request UIDs given".to_string()))?;
            self.lora.setup(&uids)?;
        }

        if let Some(encode) = tokenize {
            if let Some(words) = &sampling.bad_words_list {
                self.bad_words = Some(to_word_list_format(words, encode));
            }
            if let Some(words) = &sampling.stop_words_list {
                self.stop_words = Some(to_word_list_format(words, encode));
            }
        }

        let bks = batch_size * beam_width;
        self.batch_size = batch_size;
        self.beam_width = beam_width;
        self.max_context_length = max_context_length;
        self.max_new_tokens = sampling.max_new_tokens;
        self.end_id = sampling.end_id;
        self.output_ids = vec![sampling.pad_id; bks * self.max_seq_length];
        self.parent_ids = vec![0; bks * self.max_seq_length];
        self.sequence_length_buffer = vec![0; bks];
        self.context_lengths = vec![0; bks];
        self.cum_log_probs = vec![0.0; bks];
        self.finished = vec![false; bks];
        self.cache_indirection_src = vec![0; bks * window];
        self.cache_indirection_tgt = vec![0; bks * window];
        self.sampling = Some(sampling);
        self.decode_step = 0;

        self.state = SessionState::Configured;
        Ok(())
    }

    fn cache_mut_step(&mut self, should_free: &[bool]) -> Result<()> {
        match self.cache.as_mut().expect("cache allocated in setup") {
            CacheBackend::Paged(mgr) => mgr.step(should_free),
            CacheBackend::Contiguous(_) => Ok(()),
        }
    }

    /// Context phase (step 0): bind input ids, run the `CtxContext` profile,
    /// register sequences in the KV cache, and sample the first generated
    /// token per batch element.
    pub fn context_step(&mut self, input_ids: &[Vec<i32>]) -> Result<()> {
        if self.state != SessionState::Configured {
            return Err(RuntimeError::Invariant("context_step requires a Configured session".to_string()));
        }
        if input_ids.len() != self.batch_size {
            return Err(RuntimeError::Invariant(format!(
                "expected {} input sequences, got {}",
                self.batch_size,
                input_ids.len()
            )));
        }

        self.runtime.clear_graphs()?;

        if let Some(CacheBackend::Paged(mgr)) = self.cache.as_mut() {
            for (b, ids) in input_ids.iter().enumerate() {
                mgr.add_sequence(b, b, ids.len())?;
            }
        }

        for (b, ids) in input_ids.iter().enumerate() {
            self.context_lengths[b] = ids.len() as i32;
            let _extra = self.variant.prepare_context_position_ids(ids.len());
            for k in 0..self.beam_width {
                let flat = b * self.beam_width + k;
                self.sequence_length_buffer[flat] = ids.len() as i32;
                let base = flat * self.max_seq_length;
                self.output_ids[base..base + ids.len()].copy_from_slice(ids);
            }
        }

        self.runtime.run(ContextSlot::CtxContext, &["logits".to_string()])?;
        self.runtime.synchronize_if_debug(self.debug_mode)?;

        if self.mapping.is_last_pp_rank() {
            let mut new_tokens = Vec::with_capacity(self.batch_size * self.beam_width);
            for b in 0..self.batch_size {
                new_tokens.extend(self.decode_batch_element(b, 0)?);
            }
            self.pp_channel.send_new_tokens(&new_tokens)?;
        } else {
            let tokens = self.pp_channel.recv_new_tokens(self.batch_size * self.beam_width)?;
            for (b, chunk) in tokens.chunks(self.beam_width).enumerate() {
                for (k, &token) in chunk.iter().enumerate() {
                    self.append_token(b * self.beam_width + k, token, 0);
                }
            }
        }

        self.decode_step = 1;
        self.state = SessionState::Generation;
        Ok(())
    }

    fn append_token(&mut self, flat_bk: usize, token: i32, step: usize) {
        let position = self.context_lengths[flat_bk / self.beam_width] as usize + step;
        if position < self.max_seq_length {
            self.output_ids[flat_bk * self.max_seq_length + position] = token;
        }
        self.sequence_length_buffer[flat_bk] += 1;
    }

    /// Sample (or beam-expand) the next token(s) for every beam of batch
    /// element `b` at `step`, writing them into `output_ids`/`parent_ids`
    /// and returning the new per-beam token ids in beam order.
    fn decode_batch_element(&mut self, b: usize, step: usize) -> Result<Vec<i32>> {
        if self.beam_width == 1 {
            let flat = b * self.beam_width;
            if self.finished[flat] {
                return Ok(vec![self.end_id]);
            }
            let token = self.sample_next_token(b, flat, step)?;
            self.append_token(flat, token, step);
            if token == self.end_id {
                self.finished[flat] = true;
            }
            return Ok(vec![token]);
        }

        let vocab = self.decoder.as_ref().unwrap().vocab_size_padded();
        let mut per_beam_logits = Vec::with_capacity(self.beam_width);
        for k in 0..self.beam_width {
            let flat = b * self.beam_width + k;
            let logits_ptr = DevicePtr(0x4c0_0000 + flat as u64);
            let raw = self.backend.copy_to_host(logits_ptr, vocab * std::mem::size_of::<f32>())?;
            per_beam_logits.push(bytes_to_f32(&raw, vocab));
        }
        let cum_log_probs: Vec<f32> = (0..self.beam_width).map(|k| self.cum_log_probs[b * self.beam_width + k]).collect();

        let expanded = self
            .decoder
            .as_ref()
            .unwrap()
            .expand_beams(b, self.beam_width, &per_beam_logits, &cum_log_probs);

        let mut new_tokens = Vec::with_capacity(self.beam_width);
        let length_penalty = match &self.sampling.as_ref().unwrap().length_penalty {
            crate::sampling_config::PerBatch::Scalar(v) => *v,
            _ => 1.0,
        };

        for (new_beam, &(parent_beam, token, score)) in expanded.iter().enumerate() {
            let dst = b * self.beam_width + new_beam;
            let src = b * self.beam_width + parent_beam;
            self.cum_log_probs[dst] = score;
            let dst_len = self.sequence_length_buffer[src] as usize;
            let base_dst = dst * self.max_seq_length;
            let base_src = src * self.max_seq_length;
            if dst != src {
                let src_slice: Vec<i32> = self.output_ids[base_src..base_src + dst_len.min(self.max_seq_length)].to_vec();
                self.output_ids[base_dst..base_dst + src_slice.len()].copy_from_slice(&src_slice);
                self.sequence_length_buffer[dst] = self.sequence_length_buffer[src];
            }
            self.parent_ids[base_dst + dst_len.min(self.max_seq_length.saturating_sub(1))] = parent_beam as i32;
            self.append_token(dst, token, step);

            if token == self.end_id {
                if let Some(decoder) = self.decoder.as_mut() {
                    let length = self.sequence_length_buffer[dst] as usize;
                    decoder.beam_hyps.add(
                        b,
                        BeamHypothesis {
                            token_ids: self.output_ids[base_dst..base_dst + length.min(self.max_seq_length)].to_vec(),
                            cum_log_prob: score,
                            normalized_score: crate::decoder::normalized_score(score, length, length_penalty),
                        },
                    );
                }
            }
            new_tokens.push(token);
        }

        let done = self
            .decoder
            .as_ref()
            .map(|d| d.beam_hyps.is_done(b, self.beam_width))
            .unwrap_or(false);
        if done {
            for k in 0..self.beam_width {
                self.finished[b * self.beam_width + k] = true;
            }
        }

        Ok(new_tokens)
    }

    fn sample_next_token(&mut self, batch: usize, flat_bk: usize, step: usize) -> Result<i32> {
        let vocab = self.decoder.as_ref().unwrap().vocab_size_padded();
        let logits_ptr = DevicePtr(0x4c0_0000 + flat_bk as u64);
        let raw = self.backend.copy_to_host(logits_ptr, vocab * std::mem::size_of::<f32>())?;
        let mut logits = bytes_to_f32(&raw, vocab);

        let previous_tokens: Vec<i32> = {
            let base = flat_bk * self.max_seq_length;
            let len = self.sequence_length_buffer[flat_bk] as usize;
            self.output_ids[base..base + len.min(self.max_seq_length)].to_vec()
        };

        {
            let decoder = self.decoder.as_ref().unwrap();
            decoder.apply_penalties(batch, &mut logits, &previous_tokens, step, self.end_id);
            if let Some(bad) = &self.bad_words {
                if let Some(row) = bad.get(batch) {
                    decoder.apply_bad_words(&mut logits, &row.ids);
                }
            }
        }
        self.logits_processors.apply(step, &previous_tokens, &mut logits);

        let token = self
            .decoder
            .as_ref()
            .unwrap()
            .sample_single_beam(batch, &logits, &mut self.rng_state);

        if self.stopping_criteria.any(step, &previous_tokens, &logits) {
            self.finished[flat_bk] = true;
        }
        Ok(token)
    }

    /// One generation step. Returns `should_stop`: every sequence finished,
    /// or `decode_step + 1 == max_new_tokens` (the budget the prose contract
    /// gives for the combined context+generation phase).
    pub fn generation_step(&mut self) -> Result<bool> {
        if self.state != SessionState::Generation {
            return Err(RuntimeError::Invariant("generation_step requires a Generation session".to_string()));
        }

        let slot = Runtime::<B>::slot_for_step(self.decode_step as u64);
        if self.runtime.graph_mode() {
            self.runtime.capture_or_update_graph(slot)?;
            self.runtime.launch_graph(slot)?;
        } else {
            self.runtime.run(slot, &["logits".to_string()])?;
        }
        self.runtime.synchronize_if_debug(self.debug_mode)?;

        let should_free: Vec<bool> = (0..self.batch_size).map(|b| self.finished[b * self.beam_width]).collect();
        self.cache_mut_step(&should_free)?;

        if self.mapping.is_last_pp_rank() {
            let mut new_tokens = Vec::with_capacity(self.batch_size * self.beam_width);
            for b in 0..self.batch_size {
                new_tokens.extend(self.decode_batch_element(b, self.decode_step)?);
            }
            let all_finished = (0..self.batch_size).all(|b| self.finished[b * self.beam_width]);
            let should_stop = all_finished || self.decode_step + 1 >= self.max_new_tokens;
            self.pp_channel.send_new_tokens(&new_tokens)?;
            self.pp_channel.send_should_stop(should_stop)?;
            self.decode_step += 1;
            if should_stop {
                self.state = if all_finished { SessionState::Stopped } else { SessionState::Exhausted };
            }
            Ok(should_stop)
        } else {
            let tokens = self.pp_channel.recv_new_tokens(self.batch_size * self.beam_width)?;
            for (b, chunk) in tokens.chunks(self.beam_width).enumerate() {
                for (k, &token) in chunk.iter().enumerate() {
                    let flat = b * self.beam_width + k;
                    if !self.finished[flat] {
                        self.append_token(flat, token, self.decode_step);
                    }
                }
            }
            let should_stop = self.pp_channel.recv_should_stop()?;
            self.decode_step += 1;
            if should_stop {
                self.state = SessionState::Stopped;
            }
            Ok(should_stop)
        }
    }

    /// Drive generation steps to completion (non-streaming decode path).
    pub fn run_to_completion(&mut self) -> Result<FinalOutputIds> {
        loop {
            let should_stop = self.generation_step()?;
            if should_stop {
                break;
            }
        }
        self.finalize(false)
    }

    /// Reconstruct the final `[B, K, S]` output-id tensor via `gather_tree`.
    /// When `in_progress` (a streaming snapshot mid-decode), finalize
    /// against a deep copy of beam-hyps so the live decoder state is never
    /// mutated by an intermediate gather — the hazard called out in §9.
    pub fn finalize(&self, in_progress: bool) -> Result<FinalOutputIds> {
        let sampling = self.sampling.as_ref().expect("setup must run before finalize");
        let end_ids = vec![self.end_id; self.batch_size * self.beam_width];

        let inputs = FinalizeInputs {
            sequence_lengths: &self.sequence_length_buffer,
            output_ids: &self.output_ids,
            parent_ids: &self.parent_ids,
            end_ids: &end_ids,
            context_lengths: &self.context_lengths,
            cum_log_probs: &self.cum_log_probs,
            finished: &self.finished,
            length_penalty: match &sampling.length_penalty {
                crate::sampling_config::PerBatch::Scalar(v) => *v,
                crate::sampling_config::PerBatch::Vector(v) => v.first().copied().unwrap_or(1.0),
            },
            batch_size: self.batch_size,
            beam_width: self.beam_width,
            max_seq_length: self.max_seq_length,
        };

        let beam_hyps = if sampling.use_beam_hyps && self.beam_width > 1 {
            self.decoder.as_ref().map(|d| if in_progress { d.beam_hyps.deep_copy() } else { d.beam_hyps.clone() })
        } else {
            None
        };

        Ok(gather_tree(&inputs, beam_hyps.as_ref(), sampling.use_beam_hyps && self.beam_width > 1))
    }

    pub fn best_beam_hypothesis(&self, batch: usize) -> Option<BeamHypothesis> {
        self.decoder.as_ref()?.beam_hyps.best_for_batch(batch).cloned()
    }

    pub fn destroy(&mut self) -> Result<()> {
        self.runtime.destroy()?;
        self.state = SessionState::Stopped;
        info!("generation session torn down");
        Ok(())
    }
}

fn bytes_to_f32(bytes: &[u8], count: usize) -> Vec<f32> {
    let mut out = Vec::with_capacity(count);
    for chunk in bytes.chunks_exact(4).take(count) {
        out.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    out.resize(count, 0.0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FakeExecutionBackend;

    fn make_session() -> GenerationSession<FakeExecutionBackend> {
        let backend = FakeExecutionBackend::new(vec!["logits".to_string()], 1);
        let model_config = ModelConfig::new(32, 2, 2, 8).with_head_size(4);
        let mapping = Mapping::single_gpu();
        GenerationSession::new(
            backend,
            &[],
            model_config,
            mapping,
            ModelVariant::Standard,
            StreamHandle(0),
            false,
            false,
        )
        .unwrap()
    }

    #[test]
    fn setup_transitions_to_configured() {
        let mut session = make_session();
        let sampling = SamplingConfig::new(5, 0).with_max_new_tokens(4);
        session.setup(1, 1, 3, sampling, None, None).unwrap();
        assert_eq!(session.state(), SessionState::Configured);
    }

    #[test]
    fn context_then_generation_step_reaches_exhausted_or_stopped() {
        let mut session = make_session();
        let sampling = SamplingConfig::new(5, 0).with_max_new_tokens(3);
        session.setup(1, 1, 3, sampling, None, None).unwrap();
        session.context_step(&[vec![1, 2, 3]]).unwrap();
        assert_eq!(session.state(), SessionState::Generation);

        let mut stopped = false;
        for _ in 0..5 {
            if session.generation_step().unwrap() {
                stopped = true;
                break;
            }
        }
        assert!(stopped);
        assert!(matches!(session.state(), SessionState::Stopped | SessionState::Exhausted));
    }

    #[test]
    fn double_setup_is_rejected() {
        let mut session = make_session();
        let sampling = SamplingConfig::new(5, 0);
        session.setup(1, 1, 3, sampling.clone(), None, None).unwrap();
        let err = session.setup(1, 1, 3, sampling, None, None).unwrap_err();
        assert!(matches!(err, RuntimeError::Invariant(_)));
    }

    #[test]
    fn finalize_before_any_generation_echoes_context_tokens() {
        let mut session = make_session();
        let sampling = SamplingConfig::new(5, 0).with_max_new_tokens(2);
        session.setup(1, 1, 3, sampling, None, None).unwrap();
        session.context_step(&[vec![1, 2, 3]]).unwrap();
        let finalized = session.finalize(false).unwrap();
        assert_eq!(finalized.get(0, 0, 0), 1);
        assert_eq!(finalized.get(0, 0, 1), 2);
        assert_eq!(finalized.get(0, 0, 2), 3);
    }
}
