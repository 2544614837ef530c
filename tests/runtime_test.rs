mod helpers;

use helpers::{small_context, test_model, test_model_named, TEST_DIM};

use alfred_embed::runtime::backend::reference::TOKEN_BOS;
use alfred_embed::runtime::{
    ContextState, DecodeFailure, Engine, Error, ModelParams, PoolingType, TokenBatch,
};
use tempfile::TempDir;

#[test]
fn model_reports_header_metadata() {
    let (_tmp, model) = test_model();
    assert_eq!(model.n_embd(), TEST_DIM);
    assert_eq!(model.n_ctx_train(), helpers::TEST_CTX_TRAIN);
    assert_eq!(model.architecture(), "qwen3");
    assert_eq!(model.name(), "test-embed");
    assert_eq!(model.backend_name(), "reference");
    assert!(!model.has_encoder());
    assert!(model.supports_concurrent_contexts());
}

#[test]
fn tokenize_then_detokenize_recovers_text() {
    let (_tmp, model) = test_model();
    let vocab = model.vocab();

    let plain = vocab.tokenize("hello world", false, false).unwrap();
    assert_eq!(vocab.detokenize(&plain, false).unwrap(), "hello world");

    let with_bos = vocab.tokenize("hello world", true, false).unwrap();
    assert_eq!(with_bos[0], TOKEN_BOS);
    assert_eq!(with_bos.len(), plain.len() + 1);
    // Special tokens are only rendered on request.
    assert_eq!(vocab.detokenize(&with_bos, false).unwrap(), "hello world");
    assert_eq!(vocab.detokenize(&with_bos, true).unwrap(), "<s>hello world");
}

#[test]
fn tokenize_into_reports_required_size() {
    let (_tmp, model) = test_model();
    let vocab = model.vocab();

    let err = vocab.tokenize_into("hello", &mut [], false, false).unwrap_err();
    assert!(matches!(err, Error::BufferTooSmall { required: 5, capacity: 0 }));
    assert!(err.is_recoverable());

    let mut buf = [0; 5];
    assert_eq!(vocab.tokenize_into("hello", &mut buf, false, false).unwrap(), 5);
}

#[test]
fn load_missing_file_fails() {
    let tmp = TempDir::new().unwrap();
    let err = Engine::reference()
        .load_model(tmp.path().join("absent.gguf"), &ModelParams::default())
        .unwrap_err();
    assert!(matches!(err, Error::Load { .. }), "got {err}");
}

#[test]
fn load_rejects_non_gguf_file() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("garbage.gguf");
    std::fs::write(&path, b"NOPE this is not a model").unwrap();

    let err = Engine::reference().load_model(&path, &ModelParams::default()).unwrap_err();
    assert!(matches!(err, Error::Load { .. }), "got {err}");
}

#[test]
fn progress_callback_can_abort_load() {
    let tmp = TempDir::new().unwrap();
    let path = helpers::write_stub_model(tmp.path(), "qwen3", "abortable", TEST_DIM);

    let mut seen = Vec::new();
    let err = Engine::reference()
        .load_model_with_progress(&path, &ModelParams::default(), |p| {
            seen.push(p);
            p < 0.5
        })
        .unwrap_err();
    assert!(matches!(err, Error::LoadAborted { .. }), "got {err}");
    assert_eq!(seen.first(), Some(&0.0));
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "progress must not go backwards");
}

#[test]
fn zero_n_ctx_uses_trained_context() {
    let (_tmp, model) = test_model();
    let params = alfred_embed::runtime::ContextParams {
        n_ctx: 0,
        ..small_context(helpers::TEST_CTX_TRAIN)
    };
    let ctx = model.new_context(&params).unwrap();
    assert_eq!(ctx.n_ctx(), helpers::TEST_CTX_TRAIN);
    assert_eq!(ctx.state(), ContextState::Ready);
    assert_eq!(ctx.memory_used(), 0);
}

#[test]
fn invalid_context_params_are_rejected() {
    let (_tmp, model) = test_model();
    let params = alfred_embed::runtime::ContextParams {
        n_seq_max: 0,
        ..small_context(64)
    };
    assert!(matches!(model.new_context(&params), Err(Error::ContextCreation(_))));
}

#[test]
fn decode_then_read_pooled_embedding() {
    let (_tmp, model) = test_model();
    let mut ctx = model.new_context(&small_context(512)).unwrap();
    let tokens = model.vocab().tokenize("hello world", true, false).unwrap();

    ctx.decode(&TokenBatch::single_sequence(&tokens, 0)).unwrap();
    ctx.synchronize();
    let embedding = ctx.embedding_seq(0).unwrap().to_vec();

    assert_eq!(embedding.len(), TEST_DIM as usize);
    assert!(embedding.iter().all(|x| x.is_finite()));
    assert_eq!(ctx.memory_used(), tokens.len() as u32);

    // Per-token rows are readable too; -1 is the last token.
    assert_eq!(ctx.embedding_ith(-1).unwrap().len(), TEST_DIM as usize);
    assert!(ctx.embedding_ith(tokens.len() as i32).is_err());
}

#[test]
fn same_input_gives_same_embedding() {
    let (_tmp, model) = test_model();
    let mut ctx = model.new_context(&small_context(64)).unwrap();
    let tokens = model.vocab().tokenize("repeatable", true, false).unwrap();
    let batch = TokenBatch::single_sequence(&tokens, 0);

    ctx.decode(&batch).unwrap();
    let first = ctx.embedding_seq(0).unwrap().to_vec();
    ctx.clear_memory(true);
    ctx.decode(&batch).unwrap();
    let second = ctx.embedding_seq(0).unwrap().to_vec();
    assert_eq!(first, second);
}

#[test]
fn reading_a_sequence_outside_the_last_batch_fails() {
    let (_tmp, model) = test_model();
    let params = alfred_embed::runtime::ContextParams {
        n_seq_max: 2,
        ..small_context(64)
    };
    let mut ctx = model.new_context(&params).unwrap();
    let tokens = model.vocab().tokenize("only seq zero", true, false).unwrap();
    ctx.decode(&TokenBatch::single_sequence(&tokens, 0)).unwrap();

    assert!(ctx.embedding_seq(0).is_ok());
    assert!(matches!(ctx.embedding_seq(1), Err(Error::Embedding(_))));
}

#[test]
fn reading_before_any_decode_fails() {
    let (_tmp, model) = test_model();
    let mut ctx = model.new_context(&small_context(64)).unwrap();
    assert!(matches!(ctx.embedding_seq(0), Err(Error::Embedding(_))));
    assert!(matches!(ctx.embedding_ith(0), Err(Error::Embedding(_))));
}

#[test]
fn pooling_none_only_allows_token_reads() {
    let (_tmp, model) = test_model();
    let params = alfred_embed::runtime::ContextParams {
        pooling_type: PoolingType::None,
        ..small_context(64)
    };
    let mut ctx = model.new_context(&params).unwrap();
    let tokens = model.vocab().tokenize("per token", true, false).unwrap();
    ctx.decode(&TokenBatch::single_sequence(&tokens, 0)).unwrap();

    assert!(ctx.embedding_seq(0).is_err());
    assert_eq!(ctx.embedding_ith(-1).unwrap().len(), TEST_DIM as usize);
}

#[test]
fn full_context_fails_fast_until_cleared() {
    let (_tmp, model) = test_model();
    let mut ctx = model.new_context(&small_context(16)).unwrap();
    let ten = model.vocab().tokenize("0123456789", false, false).unwrap();
    assert_eq!(ten.len(), 10);

    ctx.decode(&TokenBatch::get_one(&ten)).unwrap();
    assert_eq!(ctx.memory_used(), 10);

    let err = ctx.decode(&TokenBatch::get_one(&ten)).unwrap_err();
    assert!(matches!(err, Error::Decode(DecodeFailure::ContextFull { .. })), "got {err}");
    assert!(err.is_recoverable());
    assert_eq!(ctx.state(), ContextState::Full);
    // The failed call leaves no readable outputs behind.
    assert!(ctx.embedding_seq(0).is_err());

    // A batch that would fit still fails while the context is full.
    let one = &ten[..1];
    assert!(ctx.decode(&TokenBatch::get_one(one)).is_err());
    assert_eq!(ctx.memory_used(), 10);

    ctx.clear_memory(false);
    assert_eq!(ctx.state(), ContextState::Ready);
    assert_eq!(ctx.memory_used(), 0);
    ctx.decode(&TokenBatch::get_one(&ten)).unwrap();
    assert!(ctx.embedding_seq(0).is_ok());
}

#[test]
fn malformed_batch_is_not_recoverable() {
    let (_tmp, model) = test_model();
    let mut ctx = model.new_context(&small_context(16)).unwrap();

    let err = ctx.decode(&TokenBatch::new()).unwrap_err();
    assert!(matches!(err, Error::Decode(DecodeFailure::InvalidBatch(_))), "got {err}");
    assert!(!err.is_recoverable());
    assert_eq!(ctx.state(), ContextState::Ready);

    let out_of_vocab = TokenBatch::get_one(&[i32::MAX]);
    assert!(ctx.decode(&out_of_vocab).is_err());
}

#[test]
fn token_without_a_sequence_is_rejected_before_the_backend() {
    let (_tmp, model) = test_model();
    let mut ctx = model.new_context(&small_context(16)).unwrap();

    let mut batch = TokenBatch::new();
    batch.add(10, 0, &[0], false).unwrap();
    batch.add(11, 1, &[], true).unwrap();

    let err = ctx.decode(&batch).unwrap_err();
    assert!(matches!(err, Error::Decode(DecodeFailure::InvalidBatch(_))), "got {err}");
    assert!(!err.is_recoverable());
    assert_eq!(ctx.state(), ContextState::Ready);
    assert_eq!(ctx.memory_used(), 0);
    assert!(ctx.embedding_seq(0).is_err());

    let (_tmp_bert, bert) = test_model_named("bert", "test-bert");
    let mut enc = bert.new_context(&small_context(16)).unwrap();
    let err = enc.encode(&batch).unwrap_err();
    assert!(matches!(err, Error::Decode(DecodeFailure::InvalidBatch(_))), "got {err}");

    // The context stays usable.
    ctx.decode(&TokenBatch::single_sequence(&[10, 11], 0)).unwrap();
    assert!(ctx.embedding_seq(0).is_ok());
}

#[test]
fn abort_callback_stops_decode() {
    let (_tmp, model) = test_model();
    let mut ctx = model.new_context_with_abort(&small_context(16), || true).unwrap();
    let err = ctx.decode(&TokenBatch::get_one(&[10, 11])).unwrap_err();
    assert!(matches!(err, Error::Decode(DecodeFailure::Aborted)), "got {err}");
    assert_eq!(ctx.memory_used(), 0);
}

#[test]
fn encoder_models_run_through_encode() {
    let (_tmp, model) = test_model_named("bert", "test-bert");
    assert!(model.has_encoder());
    assert_eq!(model.pooling_type(), PoolingType::Cls);

    let mut ctx = model.new_context(&small_context(32)).unwrap();
    let tokens = model.vocab().tokenize("encode me", true, false).unwrap();
    for _ in 0..5 {
        ctx.encode(&TokenBatch::single_sequence(&tokens, 0)).unwrap();
    }
    assert_eq!(ctx.memory_used(), 0);
    assert_eq!(ctx.embedding_seq(0).unwrap().len(), TEST_DIM as usize);
}

#[test]
fn contexts_on_one_model_are_independent() {
    let (_tmp, model) = test_model();
    let mut a = model.new_context(&small_context(32)).unwrap();
    let mut b = model.new_context(&small_context(32)).unwrap();
    let tokens = model.vocab().tokenize("abc", false, false).unwrap();

    a.decode(&TokenBatch::get_one(&tokens)).unwrap();
    assert_eq!(a.memory_used(), 3);
    assert_eq!(b.memory_used(), 0);
    assert!(b.embedding_seq(0).is_err());

    b.decode(&TokenBatch::get_one(&tokens)).unwrap();
    assert_eq!(a.embedding_seq(0).unwrap(), b.embedding_seq(0).unwrap());
}

#[test]
fn contexts_run_on_separate_threads() {
    let (_tmp, model) = test_model();
    let tokens = model.vocab().tokenize("threaded", true, false).unwrap();

    let results: Vec<Vec<f32>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let (model, tokens) = (&model, &tokens);
                scope.spawn(move || {
                    let mut ctx = model.new_context(&small_context(64)).unwrap();
                    ctx.decode(&TokenBatch::single_sequence(tokens, 0)).unwrap();
                    ctx.embedding_seq(0).unwrap().to_vec()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(results.windows(2).all(|w| w[0] == w[1]));
}
