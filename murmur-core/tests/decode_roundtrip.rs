use std::path::PathBuf;
use std::thread;

use approx::assert_abs_diff_eq;
use murmur_core::{
    BeamRearrangeRequest, DecodeError, DecodeOrchestrator, DecodePhase, DecodeState, DecoderConfig,
    ElementType, EmbeddingTable, ModelDims, ModelKind, OrchestratorHandle, StubAccelerator,
};
use ndarray::{array, s, Array2, Array3, Axis};

fn dims() -> ModelDims {
    ModelDims {
        n_mels: 4,
        n_audio_ctx: 6,
        n_state: 8,
        n_head: 2,
        n_layer: 2,
        n_vocab: 20,
        n_text_ctx: 8,
        max_prefill_ctx: 4,
        beam_size: 3,
        n_alignment_head: 2,
        logits_chunks: 5,
    }
}

fn config() -> DecoderConfig {
    DecoderConfig {
        model_dir: PathBuf::from("/models/test"),
        dims: dims(),
        input_precision: ElementType::F16,
    }
}

fn open(accel: &StubAccelerator) -> DecodeOrchestrator {
    DecodeOrchestrator::open(&config(), accel, Box::new(EmbeddingTable::synthetic(&dims())))
        .expect("open orchestrator")
}

/// Encode an all-ones mel spectrogram and start an utterance from it.
fn start(orch: &mut DecodeOrchestrator) {
    let mel = Array3::<f32>::ones((1, 4, 12));
    let audio = orch.encode(mel.view()).expect("encode").to_owned();
    orch.begin_utterance(audio.view()).expect("begin utterance");
}

fn prompt() -> Array2<u32> {
    array![[1, 2, 3], [4, 5, 6], [7, 8, 9]]
}

fn next_tokens() -> Array2<u32> {
    array![[10], [11], [12]]
}

#[test]
fn roundtrip_writes_only_positions_before_text_offset() {
    let accel = StubAccelerator::new();
    let mut orch = open(&accel);
    start(&mut orch);

    let out = orch
        .decode(prompt().view(), &DecodeState::prefill(3))
        .expect("prefill");
    assert_eq!(out.logits.shape(), &[3, 3, 20]);
    let weights = out.cross_attention_weights.expect("alignment weights");
    assert_eq!(weights.shape(), &[3, 2, 3, 6]);

    let mut state = out.next_state;
    for _ in 0..2 {
        let out = orch.decode(next_tokens().view(), &state).expect("step");
        assert_eq!(out.logits.shape(), &[3, 1, 20]);
        assert!(out.cross_attention_weights.is_none());
        state = out.next_state;
    }
    assert_eq!(state.text_offset, 5);
    assert_eq!(orch.text_offset(), Some(5));

    let cache = orch.masked_kv();
    assert_eq!(cache.shape(), &[4, 3, 8, 8]);
    for ((_, _, pos, _), &v) in cache.indexed_iter() {
        if pos < 5 {
            assert_ne!(v, 0.0, "position {pos} should be written");
        } else {
            assert_eq!(v, 0.0, "position {pos} should be untouched");
        }
    }
}

#[test]
fn prefill_hands_over_the_unpadded_token_count() {
    let accel = StubAccelerator::new();
    let mut orch = open(&accel);
    start(&mut orch);

    let out = orch
        .decode(prompt().view(), &DecodeState::prefill(3))
        .expect("prefill");
    assert_eq!(out.next_state.phase, DecodePhase::Step);
    assert_eq!(out.next_state.text_offset, 3);
    assert_ne!(out.next_state.text_offset, dims().max_prefill_ctx);
    assert!(out.next_state.is_new_cross_kv);

    let stale = DecodeState::step(4, 3, true);
    assert!(matches!(
        orch.decode(next_tokens().view(), &stale),
        Err(DecodeError::InvalidState(_))
    ));
}

#[test]
fn cross_kv_is_derived_once_and_bound_once_per_decoder() {
    let accel = StubAccelerator::new();
    let mut orch = open(&accel);
    start(&mut orch);

    let out = orch
        .decode(prompt().view(), &DecodeState::prefill(3))
        .expect("prefill");
    let out = orch.decode(next_tokens().view(), &out.next_state).expect("step 1");
    let second = out.next_state;
    assert!(!second.is_new_cross_kv);
    orch.decode(next_tokens().view(), &second).expect("step 2");

    assert_eq!(accel.calls(ModelKind::CrossKv).len(), 1);
    let bulk: Vec<bool> = accel
        .calls(ModelKind::BulkDecoder)
        .iter()
        .map(|c| c.is_new_cross_kv)
        .collect();
    assert_eq!(bulk, vec![true, false, false]);
    let step: Vec<(usize, bool)> = accel
        .calls(ModelKind::StepDecoder)
        .iter()
        .map(|c| (c.text_offset, c.is_new_cross_kv))
        .collect();
    assert_eq!(step, vec![(3, true), (4, false)]);
}

#[test]
fn rebinding_mid_utterance_is_rejected() {
    let accel = StubAccelerator::new();
    let mut orch = open(&accel);
    start(&mut orch);

    let out = orch
        .decode(prompt().view(), &DecodeState::prefill(3))
        .expect("prefill");
    let out = orch.decode(next_tokens().view(), &out.next_state).expect("step");

    let rebind = DecodeState::step(out.next_state.text_offset, 3, true);
    match orch.decode(next_tokens().view(), &rebind) {
        Err(DecodeError::CrossKvBinding { expected, actual }) => {
            assert!(!expected);
            assert!(actual);
        }
        other => panic!("expected CrossKvBinding, got {other:?}"),
    }
    assert_eq!(accel.calls(ModelKind::StepDecoder).len(), 1);
}

#[test]
fn first_step_must_bind_cross_kv() {
    let accel = StubAccelerator::new();
    let mut orch = open(&accel);
    start(&mut orch);
    orch.decode(prompt().view(), &DecodeState::prefill(3))
        .expect("prefill");
    assert!(matches!(
        orch.decode(next_tokens().view(), &DecodeState::step(3, 3, false)),
        Err(DecodeError::CrossKvBinding { expected: true, actual: false })
    ));
}

#[test]
fn per_beam_prefill_outputs_are_gathered_in_beam_order() {
    let accel = StubAccelerator::new();
    let mut orch = open(&accel);
    start(&mut orch);

    let tokens = array![[1, 2, 3], [1, 2, 3], [4, 5, 6]];
    let out = orch
        .decode(tokens.view(), &DecodeState::prefill(3))
        .expect("prefill");

    let cache = orch.masked_kv();
    let rows = |b: usize| cache.slice(s![.., b, ..3, ..]).to_owned();
    assert_eq!(rows(0), rows(1));
    assert_ne!(rows(0), rows(2));

    let logits = out.logits;
    for (a, b) in logits
        .index_axis(Axis(0), 0)
        .iter()
        .zip(logits.index_axis(Axis(0), 1).iter())
    {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-6);
    }
}

#[test]
fn rearrange_reorders_written_rows_in_place() {
    let accel = StubAccelerator::new();
    let mut orch = open(&accel);
    start(&mut orch);
    orch.decode(prompt().view(), &DecodeState::prefill(3))
        .expect("prefill");

    let before = orch.masked_kv().to_owned();
    let ptr = orch.masked_kv().as_ptr();
    let indices = [2, 0, 1];
    orch.rearrange(&BeamRearrangeRequest::new(indices.to_vec(), 2))
        .expect("rearrange");
    let after = orch.masked_kv();
    assert_eq!(after.as_ptr(), ptr);

    for kv in 0..4 {
        for (dst, &src) in indices.iter().enumerate() {
            for pos in 0..8 {
                let from = if pos < 2 { src } else { dst };
                assert_eq!(
                    after.slice(s![kv, dst, pos, ..]),
                    before.slice(s![kv, from, pos, ..]),
                    "kv {kv} beam {dst} position {pos}"
                );
            }
        }
    }
    assert_eq!(orch.instrumentation().rearranges(), 1);
}

#[test]
fn identity_rearrange_leaves_cache_byte_identical() {
    let accel = StubAccelerator::new();
    let mut orch = open(&accel);
    start(&mut orch);
    let out = orch
        .decode(prompt().view(), &DecodeState::prefill(3))
        .expect("prefill");
    orch.decode(next_tokens().view(), &out.next_state).expect("step");

    let before = orch.masked_kv().to_owned();
    orch.rearrange(&BeamRearrangeRequest::identity(3, 4))
        .expect("identity");
    assert_eq!(orch.masked_kv(), before.view());
}

#[test]
fn rearrange_beyond_written_positions_is_rejected() {
    let accel = StubAccelerator::new();
    let mut orch = open(&accel);
    start(&mut orch);
    orch.decode(prompt().view(), &DecodeState::prefill(3))
        .expect("prefill");
    assert!(matches!(
        orch.rearrange(&BeamRearrangeRequest::new(vec![1, 0, 2], 4)),
        Err(DecodeError::InvalidRearrange(_))
    ));
    assert!(matches!(
        orch.rearrange(&BeamRearrangeRequest::new(vec![1, 0], 2)),
        Err(DecodeError::InvalidRearrange(_))
    ));
}

#[test]
fn prefill_again_resets_the_cache_without_recomputing_cross_kv() {
    let accel = StubAccelerator::new();
    let mut orch = open(&accel);
    start(&mut orch);
    let out = orch
        .decode(prompt().view(), &DecodeState::prefill(3))
        .expect("prefill");
    let out = orch.decode(next_tokens().view(), &out.next_state).expect("step");
    orch.decode(next_tokens().view(), &out.next_state).expect("step");

    let short = array![[1, 2], [3, 4], [5, 6]];
    let out = orch
        .decode(short.view(), &DecodeState::prefill(3))
        .expect("second prefill");
    assert_eq!(out.next_state.text_offset, 2);
    assert!(out.next_state.is_new_cross_kv);

    let cache = orch.masked_kv();
    assert!(cache.slice(s![.., .., 2.., ..]).iter().all(|&v| v == 0.0));
    assert!(cache.slice(s![.., .., ..2, ..]).iter().all(|&v| v != 0.0));

    assert_eq!(accel.calls(ModelKind::CrossKv).len(), 1);
    let bulk: Vec<bool> = accel
        .calls(ModelKind::BulkDecoder)
        .iter()
        .map(|c| c.is_new_cross_kv)
        .collect();
    assert_eq!(bulk, vec![true, false, false, true, false, false]);

    orch.decode(next_tokens().view(), &out.next_state)
        .expect("step after second prefill rebinds");
}

#[test]
fn new_utterance_clears_previous_state() {
    let accel = StubAccelerator::new();
    let mut orch = open(&accel);
    start(&mut orch);
    let out = orch
        .decode(prompt().view(), &DecodeState::prefill(3))
        .expect("prefill");
    orch.decode(next_tokens().view(), &out.next_state).expect("step");
    let first = orch.cross_kv().expect("cross kv").utterance();

    start(&mut orch);
    assert!(orch.masked_kv().iter().all(|&v| v == 0.0));
    assert_eq!(orch.text_offset(), Some(0));
    assert_eq!(orch.cross_kv().expect("cross kv").utterance(), first + 1);
    assert_eq!(accel.calls(ModelKind::CrossKv).len(), 2);
}

#[test]
fn context_limit_ends_the_utterance() {
    let accel = StubAccelerator::new();
    let mut orch = open(&accel);
    start(&mut orch);
    let mut state = orch
        .decode(prompt().view(), &DecodeState::prefill(3))
        .expect("prefill")
        .next_state;
    for _ in 3..8 {
        state = orch.decode(next_tokens().view(), &state).expect("step").next_state;
    }
    assert_eq!(state.text_offset, 8);
    match orch.decode(next_tokens().view(), &state) {
        Err(DecodeError::ContextExhausted { offset, limit }) => assert_eq!((offset, limit), (8, 8)),
        other => panic!("expected ContextExhausted, got {other:?}"),
    }
}

#[test]
fn decoding_without_an_utterance_fails() {
    let accel = StubAccelerator::new();
    let mut orch = open(&accel);
    assert!(matches!(
        orch.decode(prompt().view(), &DecodeState::prefill(3)),
        Err(DecodeError::InvalidState(_))
    ));
    assert!(matches!(
        orch.decode(prompt().view(), &DecodeState::prefill(2)),
        Err(DecodeError::InvalidState(_))
    ));
}

#[test]
fn prompt_longer_than_prefill_window_is_rejected() {
    let accel = StubAccelerator::new();
    let mut orch = open(&accel);
    start(&mut orch);
    let long = Array2::<u32>::ones((3, 5));
    assert!(matches!(
        orch.decode(long.view(), &DecodeState::prefill(3)),
        Err(DecodeError::InvalidState(_))
    ));
    assert!(accel.calls(ModelKind::BulkDecoder).is_empty());
}

#[test]
fn load_failure_surfaces_at_open() {
    let accel = StubAccelerator::failing_load(ModelKind::StepDecoder);
    let result = DecodeOrchestrator::open(
        &config(),
        &accel,
        Box::new(EmbeddingTable::synthetic(&dims())),
    );
    match result {
        Err(DecodeError::ModelLoad { kind, path, .. }) => {
            assert_eq!(kind, ModelKind::StepDecoder);
            assert_eq!(path, PathBuf::from("/models/test/decoder_step.onnx"));
        }
        other => panic!("expected ModelLoad, got {other:?}"),
    }
    let log = accel.log();
    assert_eq!(
        log.loads,
        vec![ModelKind::Encoder, ModelKind::CrossKv, ModelKind::BulkDecoder]
    );
    assert_eq!(log.closes.len(), 3);
}

#[test]
fn embedding_must_match_dims() {
    let accel = StubAccelerator::new();
    let mut other = dims();
    other.n_vocab = 25;
    let result = DecodeOrchestrator::open(&config(), &accel, Box::new(EmbeddingTable::synthetic(&other)));
    assert!(matches!(result, Err(DecodeError::ShapeMismatch { .. })));
    assert!(accel.log().loads.is_empty());
}

#[test]
fn closed_orchestrator_fails_fast() {
    let accel = StubAccelerator::new();
    let mut orch = open(&accel);
    orch.close();
    let mel = Array3::<f32>::ones((1, 4, 12));
    match orch.encode(mel.view()) {
        Err(DecodeError::ModelNotLoaded { kind }) => assert_eq!(kind, ModelKind::Encoder),
        other => panic!("expected ModelNotLoaded, got {other:?}"),
    }
    assert_eq!(accel.log().closes.len(), 4);
}

#[test]
fn predict_threads_caller_owned_caches() {
    let accel = StubAccelerator::new();
    let mut orch = open(&accel);
    let mel = Array3::<f32>::ones((1, 4, 12));
    let audio = orch.encode(mel.view()).expect("encode").to_owned();

    let first = orch
        .predict(prompt().view(), Some(audio.view()), 0, true, None, None)
        .expect("prefill predict");
    let cross_kv = first.cross_kv.clone().expect("new cross kv");
    let masked = first.masked_kv.to_owned();
    assert_eq!(first.next_state.text_offset, 3);

    let second = orch
        .predict(next_tokens().view(), None, 3, true, Some(masked.view()), Some(&cross_kv))
        .expect("step predict");
    assert!(second.cross_kv.is_none());
    assert_eq!(second.logits.shape(), &[3, 1, 20]);
    assert!(second.masked_kv.slice(s![.., .., 3, ..]).iter().all(|&v| v != 0.0));
    assert_eq!(second.next_state, DecodeState::step(4, 3, false));
    assert_eq!(accel.calls(ModelKind::CrossKv).len(), 1);
}

#[test]
fn timings_are_kept_per_orchestrator() {
    let accel = StubAccelerator::new();
    let mut a = open(&accel);
    let b = open(&accel);
    start(&mut a);
    a.decode(prompt().view(), &DecodeState::prefill(3))
        .expect("prefill");

    assert_eq!(a.instrumentation().stage(ModelKind::BulkDecoder).predicts, 3);
    assert_eq!(b.instrumentation().stage(ModelKind::BulkDecoder).predicts, 0);
    assert_eq!(b.instrumentation().stage(ModelKind::Encoder).loads, 1);

    let taken = a.take_instrumentation();
    assert_eq!(taken.stage(ModelKind::CrossKv).predicts, 1);
    assert_eq!(a.instrumentation().stage(ModelKind::CrossKv).predicts, 0);
}

#[test]
fn handle_serializes_access_across_threads() {
    let accel = StubAccelerator::new();
    let handle = OrchestratorHandle::new(open(&accel));
    start(&mut handle.lock());

    let worker = handle.clone();
    let state = thread::spawn(move || {
        let mut orch = worker.lock();
        orch.decode(prompt().view(), &DecodeState::prefill(3))
            .expect("prefill on worker")
            .next_state
    })
    .join()
    .expect("worker thread");

    assert_eq!(state.text_offset, 3);
    assert_eq!(handle.lock().text_offset(), Some(3));
}

#[test]
fn step_follows_a_foreign_cross_kv_even_when_utterance_ids_collide() {
    let accel = StubAccelerator::new();
    let mut a = open(&accel);
    let mut b = open(&accel);

    let mel = Array3::<f32>::ones((1, 4, 12));
    let audio_a = a.encode(mel.view()).expect("encode a").to_owned();
    let ckv_a = a.begin_utterance(audio_a.view()).expect("utterance a");
    let audio_b = Array3::<f32>::from_elem((1, 6, 8), 3.0);
    let ckv_b = b.begin_utterance(audio_b.view()).expect("utterance b");
    assert_eq!(ckv_a.utterance(), ckv_b.utterance());
    assert!(!ckv_a.shares_storage(&ckv_b));

    let state = a
        .decode(prompt().view(), &DecodeState::prefill(3))
        .expect("prefill a")
        .next_state;
    b.decode(prompt().view(), &DecodeState::prefill(3))
        .expect("prefill b");
    let masked_a = a.masked_kv().to_owned();
    let expected = a.decode(next_tokens().view(), &state).expect("step a");

    let got = b
        .predict(next_tokens().view(), None, 3, true, Some(masked_a.view()), Some(&ckv_a))
        .expect("step b on a's caches");
    for (x, y) in got.logits.iter().zip(expected.logits.iter()) {
        assert_abs_diff_eq!(*x, *y, epsilon = 1e-6);
    }
    assert_eq!(got.masked_kv, a.masked_kv());
    assert!(b.cross_kv().expect("cross kv").shares_storage(&ckv_a));
    assert_eq!(b.text_offset(), Some(4));
}

#[test]
fn foreign_cross_kv_without_masked_cache_is_rejected() {
    let accel = StubAccelerator::new();
    let mut a = open(&accel);
    let mut b = open(&accel);
    start(&mut a);
    start(&mut b);
    let ckv_a = a.cross_kv().expect("cross kv").clone();
    b.decode(prompt().view(), &DecodeState::prefill(3))
        .expect("prefill b");
    let before = b.masked_kv().to_owned();

    assert!(matches!(
        b.predict(next_tokens().view(), None, 3, true, None, Some(&ckv_a)),
        Err(DecodeError::InvalidState(_))
    ));
    assert_eq!(b.masked_kv(), before.view());
    assert!(!b.cross_kv().expect("cross kv").shares_storage(&ckv_a));
}

#[test]
fn rejected_predict_leaves_the_cache_untouched() {
    let accel = StubAccelerator::new();
    let mut orch = open(&accel);
    start(&mut orch);
    let out = orch
        .decode(prompt().view(), &DecodeState::prefill(3))
        .expect("prefill");
    let state = orch
        .decode(next_tokens().view(), &out.next_state)
        .expect("step")
        .next_state;
    let before = orch.masked_kv().to_owned();
    let bogus = ndarray::Array4::<f32>::from_elem((4, 3, 8, 8), 42.0);

    match orch.predict(next_tokens().view(), None, 4, true, Some(bogus.view()), None) {
        Err(DecodeError::CrossKvBinding { expected, actual }) => {
            assert!(!expected);
            assert!(actual);
        }
        other => panic!("expected CrossKvBinding, got {other:?}"),
    }
    assert_eq!(orch.masked_kv(), before.view());
    assert_eq!(orch.text_offset(), Some(4));

    let wrong_shape = ndarray::Array4::<f32>::from_elem((4, 3, 7, 8), 42.0);
    assert!(matches!(
        orch.predict(next_tokens().view(), None, 4, false, Some(wrong_shape.view()), None),
        Err(DecodeError::ShapeMismatch { .. })
    ));
    let bad_token = array![[10], [11], [99]];
    assert!(matches!(
        orch.predict(bad_token.view(), None, 4, false, Some(bogus.view()), None),
        Err(DecodeError::InvalidToken { token: 99, .. })
    ));
    assert_eq!(orch.masked_kv(), before.view());

    let out = orch.decode(next_tokens().view(), &state).expect("valid step");
    assert_eq!(out.next_state.text_offset, 5);
    assert!(orch.masked_kv().iter().all(|&v| v != 42.0));
}

#[test]
fn audio_on_a_step_is_rejected() {
    let accel = StubAccelerator::new();
    let mut orch = open(&accel);
    start(&mut orch);
    orch.decode(prompt().view(), &DecodeState::prefill(3))
        .expect("prefill");
    let before = orch.masked_kv().to_owned();
    let audio = Array3::<f32>::ones((1, 6, 8));

    assert!(matches!(
        orch.predict(next_tokens().view(), Some(audio.view()), 3, true, None, None),
        Err(DecodeError::InvalidState(_))
    ));
    assert_eq!(orch.masked_kv(), before.view());
    assert_eq!(accel.calls(ModelKind::CrossKv).len(), 1);
    assert!(accel.calls(ModelKind::StepDecoder).is_empty());
}
