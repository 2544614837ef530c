//! Engine backends.
//!
//! A backend turns a validated model path into a [`ModelBackend`], which in
//! turn creates [`ContextBackend`]s. The safe wrappers in [`crate::runtime`]
//! own the state machine and argument checks; backends only execute.

pub mod reference;

#[cfg(feature = "llama")]
pub mod llama;

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::error::{DecodeFailure, Result};
use super::gguf::GgufHeader;
use super::params::{ContextParams, ModelParams, PoolingType};
use super::{SeqId, Token, TokenBatch};

/// Polled by the engine during long-running work; returning `true` aborts.
pub type AbortCallback = Box<dyn FnMut() -> bool + Send>;

/// Which engine executes inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Deterministic pure-Rust engine.
    #[default]
    Reference,
    /// llama.cpp via `llama-cpp-2` (requires the `llama` feature).
    Llama,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Reference => "reference",
            Self::Llama => "llama",
        })
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reference" => Ok(Self::Reference),
            "llama" => Ok(Self::Llama),
            _ => Err(format!("unknown backend: {s}. Supported: reference, llama")),
        }
    }
}

/// Process-wide engine entry point (`llama_backend_init` equivalent).
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Load weights. `header` has already been parsed from `path`.
    /// `progress` receives values in `[0, 1]`; `false` aborts the load.
    fn load_model(
        &self,
        path: &Path,
        header: &GgufHeader,
        params: &ModelParams,
        progress: &mut dyn FnMut(f32) -> bool,
    ) -> Result<Box<dyn ModelBackend>>;
}

/// Loaded weights and vocabulary.
pub trait ModelBackend: Send + Sync {
    fn n_embd(&self) -> u32;
    fn n_vocab(&self) -> u32;
    fn n_ctx_train(&self) -> u32;
    /// Pooling the model declares for itself.
    fn pooling_type(&self) -> PoolingType;

    /// Whether several contexts from this model may run on different threads at once.
    fn supports_concurrent_contexts(&self) -> bool;

    fn tokenize(&self, text: &str, add_special: bool, parse_special: bool) -> Result<Vec<Token>>;
    /// Raw bytes of a token's text. May be a partial UTF-8 sequence.
    fn token_to_piece(&self, token: Token, render_special: bool) -> Result<Vec<u8>>;

    /// `params` is already validated and `n_ctx == 0` has been resolved.
    fn new_context<'m>(
        &'m self,
        params: &ContextParams,
        abort: Option<AbortCallback>,
    ) -> Result<Box<dyn ContextBackend + 'm>>;
}

/// Mutable per-session state (KV-memory, output buffers).
pub trait ContextBackend {
    fn n_ctx(&self) -> u32;
    fn n_batch(&self) -> u32;
    fn n_ubatch(&self) -> u32;
    fn n_seq_max(&self) -> u32;
    /// Effective pooling after resolving `Unspecified`.
    fn pooling_type(&self) -> PoolingType;
    fn n_embd(&self) -> u32;

    fn embeddings_enabled(&self) -> bool;
    fn set_embeddings(&mut self, enabled: bool) -> Result<()>;

    /// KV cells currently occupied.
    fn memory_used(&self) -> u32;
    fn clear_memory(&mut self, data: bool);

    fn decode(&mut self, batch: &TokenBatch) -> std::result::Result<(), DecodeFailure>;
    fn encode(&mut self, batch: &TokenBatch) -> std::result::Result<(), DecodeFailure>;

    /// Block until queued device work finishes.
    fn synchronize(&mut self);

    /// Pooled embedding of `seq_id` from the last call, if any.
    fn embeddings_seq(&self, seq_id: SeqId) -> Option<&[f32]>;
    /// Per-token embedding of batch entry `i` (already resolved to non-negative).
    fn embeddings_ith(&self, i: usize) -> Option<&[f32]>;
}

/// Create the backend selected in config. `concurrent_contexts` opts engines
/// that serialize by default into running contexts on several threads.
pub fn create_backend(kind: BackendKind, concurrent_contexts: bool) -> Result<Box<dyn Backend>> {
    match kind {
        BackendKind::Reference => Ok(Box::new(reference::ReferenceBackend::new())),
        #[cfg(feature = "llama")]
        BackendKind::Llama => Ok(Box::new(
            llama::LlamaCppBackend::init()?.with_concurrent_contexts(concurrent_contexts),
        )),
        #[cfg(not(feature = "llama"))]
        BackendKind::Llama => {
            let _ = concurrent_contexts;
            Err(super::Error::Unsupported {
                backend: "llama",
                what: "this build was compiled without the `llama` feature".into(),
            })
        }
    }
}
