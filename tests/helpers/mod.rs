#![allow(dead_code)]

use std::path::{Path, PathBuf};

use alfred_embed::db;
use alfred_embed::runtime::gguf::GgufWriter;
use alfred_embed::runtime::{ContextParams, Engine, Model, ModelParams};
use rusqlite::Connection;
use tempfile::TempDir;

pub const TEST_DIM: u32 = 64;
pub const TEST_CTX_TRAIN: u32 = 512;

/// Write a metadata-only GGUF model into `dir` and return its path.
pub fn write_stub_model(dir: &Path, arch: &str, name: &str, dim: u32) -> PathBuf {
    let path = dir.join(format!("{name}.gguf"));
    GgufWriter::new()
        .add_str("general.architecture", arch)
        .add_str("general.name", name)
        .add_u32(format!("{arch}.embedding_length"), dim)
        .add_u32(format!("{arch}.context_length"), TEST_CTX_TRAIN)
        .write_file(&path)
        .unwrap();
    path
}

/// Load a decoder-style stub model on the reference backend.
/// Keep the `TempDir` alive for as long as the model's path matters.
pub fn test_model() -> (TempDir, Model) {
    test_model_named("qwen3", "test-embed")
}

pub fn test_model_named(arch: &str, name: &str) -> (TempDir, Model) {
    let tmp = TempDir::new().unwrap();
    let path = write_stub_model(tmp.path(), arch, name, TEST_DIM);
    let model = Engine::reference().load_model(&path, &ModelParams::default()).unwrap();
    (tmp, model)
}

/// Context parameters sized to fit the stub model.
pub fn small_context(n_ctx: u32) -> ContextParams {
    ContextParams {
        n_ctx,
        n_batch: n_ctx,
        n_ubatch: n_ctx,
        ..Default::default()
    }
}

/// Fresh in-memory store sized for the stub model.
pub fn test_db() -> Connection {
    db::open_memory_database(TEST_DIM as usize).unwrap()
}

/// Unit vector along axis `i`.
pub fn unit(i: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; TEST_DIM as usize];
    v[i % TEST_DIM as usize] = 1.0;
    v
}
