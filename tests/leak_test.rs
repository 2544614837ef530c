//! Handle accounting lives in process-wide counters, so this file holds a
//! single test and runs in its own binary.

mod helpers;

use alfred_embed::runtime::backend::reference::live_handles;
use alfred_embed::runtime::{Engine, ModelParams, TokenBatch};
use tempfile::TempDir;

#[test]
fn repeated_load_and_free_releases_every_handle() {
    let tmp = TempDir::new().unwrap();
    let path = helpers::write_stub_model(tmp.path(), "qwen3", "leak-check", helpers::TEST_DIM);
    let engine = Engine::reference();
    let baseline = live_handles();

    for round in 0..50 {
        let model = engine.load_model(&path, &ModelParams::default()).unwrap();
        {
            let mut a = model.new_context(&helpers::small_context(64)).unwrap();
            let b = model.new_context(&helpers::small_context(64)).unwrap();
            assert_eq!(live_handles().contexts, baseline.contexts + 2, "round {round}");

            let tokens = model.vocab().tokenize("leak check", true, false).unwrap();
            a.decode(&TokenBatch::single_sequence(&tokens, 0)).unwrap();
            a.free();
            drop(b);
        }
        assert_eq!(live_handles().contexts, baseline.contexts, "round {round}");
        assert_eq!(live_handles().models, baseline.models + 1, "round {round}");
        model.free();
        assert_eq!(live_handles(), baseline, "round {round}");
    }

    // Failed loads must not leave anything behind either.
    for _ in 0..10 {
        let _ = engine.load_model_with_progress(&path, &ModelParams::default(), |_| false);
    }
    assert_eq!(live_handles(), baseline);
}
