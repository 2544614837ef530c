//! Model runtime: ownership-typed handles over an inference engine.
//!
//! [`Engine`] is the process-level entry point, [`Model`] owns loaded
//! weights, and [`Context`] owns one inference session. A `Context<'m>`
//! borrows its `Model`, so a model can never be freed while a context built
//! from it is alive, and an embedding view (`&[f32]`) borrows its context, so
//! it cannot outlive the next decode.
//!
//! ```no_run
//! use alfred_embed::runtime::{ContextParams, Engine, ModelParams, TokenBatch};
//!
//! # fn main() -> alfred_embed::runtime::Result<()> {
//! let engine = Engine::reference();
//! let model = engine.load_model("model.gguf", &ModelParams::default())?;
//! let mut ctx = model.new_context(&ContextParams { n_ctx: 512, ..Default::default() })?;
//! let tokens = model.vocab().tokenize("hello world", true, false)?;
//! ctx.decode(&TokenBatch::single_sequence(&tokens, 0))?;
//! ctx.synchronize();
//! let embedding = ctx.embedding_seq(0)?.to_vec();
//! assert_eq!(embedding.len(), model.n_embd() as usize);
//! # Ok(())
//! # }
//! ```

pub mod backend;
mod batch;
mod error;
pub mod gguf;
pub mod params;

use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use backend::{AbortCallback, BackendKind};
pub use batch::{BatchInput, TokenBatch};
pub use error::{DecodeFailure, Error, Result};
pub use params::{
    AttentionType, ContextParams, FlashAttnType, KvCacheType, ModelParams, PoolingType,
    RopeScalingType, SplitMode,
};

use backend::{Backend, ContextBackend, ModelBackend};
use gguf::GgufHeader;

pub type Token = i32;
pub type Pos = i32;
pub type SeqId = i32;

/// Architectures whose graphs are encoder-only and run through `encode`.
const ENCODER_ARCHS: [&str; 5] = ["bert", "nomic-bert", "jina-bert-v2", "modern-bert", "t5encoder"];

pub fn is_encoder_only(arch: &str) -> bool {
    ENCODER_ARCHS.contains(&arch)
}

/// Initialized inference engine. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    backend: Arc<dyn Backend>,
    kind: BackendKind,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").field("backend", &self.kind).finish()
    }
}

impl Engine {
    /// Initialize the selected backend.
    pub fn init(kind: BackendKind) -> Result<Self> {
        Self::init_with(kind, false)
    }

    /// Like [`init`](Self::init), optionally letting engines that serialize
    /// by default run several contexts concurrently.
    pub fn init_with(kind: BackendKind, concurrent_contexts: bool) -> Result<Self> {
        let backend = backend::create_backend(kind, concurrent_contexts)?;
        tracing::debug!(backend = backend.name(), "engine initialized");
        Ok(Self {
            backend: Arc::from(backend),
            kind,
        })
    }

    /// The always-available reference backend.
    pub fn reference() -> Self {
        Self {
            backend: Arc::new(backend::reference::ReferenceBackend::new()),
            kind: BackendKind::Reference,
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn load_model(&self, path: impl AsRef<Path>, params: &ModelParams) -> Result<Model> {
        self.load_model_with_progress(path, params, |_| true)
    }

    /// Load a model, reporting progress in `[0, 1]`. Returning `false` from
    /// `progress` aborts with [`Error::LoadAborted`].
    pub fn load_model_with_progress(
        &self,
        path: impl AsRef<Path>,
        params: &ModelParams,
        mut progress: impl FnMut(f32) -> bool,
    ) -> Result<Model> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(Error::load(path, "file not found"));
        }
        params.validate().map_err(|reason| Error::load(path, reason))?;

        let header = gguf::read_header(path).map_err(|e| Error::load(path, e.to_string()))?;
        if header.architecture().is_none() {
            return Err(Error::load(path, "missing general.architecture"));
        }

        let inner = self.backend.load_model(path, &header, params, &mut progress)?;

        let model = Model {
            inner,
            header,
            path: path.to_path_buf(),
            backend: self.backend.name(),
        };
        tracing::info!(
            path = %path.display(),
            backend = model.backend,
            arch = model.architecture(),
            n_embd = model.n_embd(),
            n_ctx_train = model.n_ctx_train(),
            "model loaded"
        );
        Ok(model)
    }
}

/// Loaded model weights. Freed on drop or with [`Model::free`].
pub struct Model {
    inner: Box<dyn ModelBackend>,
    header: GgufHeader,
    path: PathBuf,
    backend: &'static str,
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("path", &self.path)
            .field("backend", &self.backend)
            .field("arch", &self.architecture())
            .field("n_embd", &self.n_embd())
            .finish()
    }
}

impl Model {
    pub fn n_embd(&self) -> u32 {
        self.inner.n_embd()
    }

    pub fn n_vocab(&self) -> u32 {
        self.inner.n_vocab()
    }

    pub fn n_ctx_train(&self) -> u32 {
        self.inner.n_ctx_train()
    }

    pub fn pooling_type(&self) -> PoolingType {
        self.inner.pooling_type()
    }

    pub fn architecture(&self) -> &str {
        self.header.architecture().unwrap_or("unknown")
    }

    /// `general.name`, falling back to the file stem.
    pub fn name(&self) -> String {
        match self.header.name() {
            Some(name) => name.to_string(),
            None => self
                .path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "unknown".into()),
        }
    }

    /// `<backend>/<name>`, the key recorded with stored embeddings.
    pub fn identity(&self) -> String {
        format!("{}/{}", self.backend, self.name())
    }

    pub fn has_encoder(&self) -> bool {
        is_encoder_only(self.architecture())
    }

    pub fn metadata(&self) -> &GgufHeader {
        &self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend
    }

    pub fn supports_concurrent_contexts(&self) -> bool {
        self.inner.supports_concurrent_contexts()
    }

    pub fn vocab(&self) -> Vocab<'_> {
        Vocab { model: self }
    }

    pub fn new_context(&self, params: &ContextParams) -> Result<Context<'_>> {
        self.create_context(params, None)
    }

    /// Like [`new_context`](Self::new_context), with a callback the engine polls
    /// during decode/encode; returning `true` aborts the call.
    pub fn new_context_with_abort(
        &self,
        params: &ContextParams,
        abort: impl FnMut() -> bool + Send + 'static,
    ) -> Result<Context<'_>> {
        self.create_context(params, Some(Box::new(abort)))
    }

    fn create_context(&self, params: &ContextParams, abort: Option<AbortCallback>) -> Result<Context<'_>> {
        params.validate().map_err(Error::ContextCreation)?;

        let mut resolved = params.clone();
        if resolved.n_ctx == 0 {
            resolved.n_ctx = self.n_ctx_train();
        }

        let inner = self.inner.new_context(&resolved, abort)?;
        if inner.n_embd() != self.n_embd() {
            return Err(Error::ContextCreation(format!(
                "context reports n_embd {} but model has {}",
                inner.n_embd(),
                self.n_embd()
            )));
        }

        tracing::debug!(
            n_ctx = inner.n_ctx(),
            n_batch = inner.n_batch(),
            n_ubatch = inner.n_ubatch(),
            n_seq_max = inner.n_seq_max(),
            pooling = %inner.pooling_type(),
            embeddings = inner.embeddings_enabled(),
            "context created"
        );

        Ok(Context {
            model: self,
            inner,
            state: ContextState::Ready,
            pending_sync: false,
            last_call: None,
        })
    }

    /// Release the weights. Contexts borrow the model, so none can be alive here.
    pub fn free(self) {
        tracing::debug!(path = %self.path.display(), "model freed");
    }
}

/// Tokenizer view of a model.
#[derive(Debug, Clone, Copy)]
pub struct Vocab<'m> {
    model: &'m Model,
}

impl Vocab<'_> {
    pub fn n_tokens(&self) -> u32 {
        self.model.n_vocab()
    }

    /// Tokenize into a caller-provided buffer and return the token count.
    ///
    /// Fails with [`Error::BufferTooSmall`] when `out` is shorter than the
    /// result; `required` tells the caller how much to allocate.
    pub fn tokenize_into(
        &self,
        text: &str,
        out: &mut [Token],
        add_special: bool,
        parse_special: bool,
    ) -> Result<usize> {
        let tokens = self.model.inner.tokenize(text, add_special, parse_special)?;
        if tokens.len() > out.len() {
            return Err(Error::BufferTooSmall {
                required: tokens.len(),
                capacity: out.len(),
            });
        }
        out[..tokens.len()].copy_from_slice(&tokens);
        Ok(tokens.len())
    }

    /// Tokenize into a fresh vector, growing the buffer once if the first guess is short.
    pub fn tokenize(&self, text: &str, add_special: bool, parse_special: bool) -> Result<Vec<Token>> {
        let mut buf = vec![0; text.len() / 2 + 2];
        let n = match self.tokenize_into(text, &mut buf, add_special, parse_special) {
            Ok(n) => n,
            Err(Error::BufferTooSmall { required, .. }) => {
                buf.resize(required, 0);
                self.tokenize_into(text, &mut buf, add_special, parse_special)?
            }
            Err(e) => return Err(e),
        };
        buf.truncate(n);
        Ok(buf)
    }

    /// Text of one token. Partial UTF-8 sequences are replaced with U+FFFD.
    pub fn token_to_piece(&self, token: Token, render_special: bool) -> Result<String> {
        let bytes = self.model.inner.token_to_piece(token, render_special)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Reassemble text from tokens.
    pub fn detokenize(&self, tokens: &[Token], render_special: bool) -> Result<String> {
        let mut bytes = Vec::with_capacity(tokens.len());
        for &token in tokens {
            bytes.extend(self.model.inner.token_to_piece(token, render_special)?);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Lifecycle state of an inference context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// Accepts decode/encode calls.
    Ready,
    /// KV-memory exhausted. Only [`Context::clear_memory`] returns to `Ready`.
    Full,
}

#[derive(Debug, Clone)]
struct LastCall {
    n_tokens: usize,
    sequences: Vec<SeqId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Decode,
    Encode,
}

/// One inference session bound to a [`Model`].
///
/// All methods that run or read inference take `&mut self`, so at most one
/// decode/encode/read sequence is in flight per context. Multi-threaded
/// callers use one context per worker.
pub struct Context<'m> {
    model: &'m Model,
    inner: Box<dyn ContextBackend + 'm>,
    state: ContextState,
    pending_sync: bool,
    last_call: Option<LastCall>,
}

impl std::fmt::Debug for Context<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("state", &self.state)
            .field("n_ctx", &self.n_ctx())
            .field("memory_used", &self.memory_used())
            .finish()
    }
}

impl<'m> Context<'m> {
    pub fn model(&self) -> &'m Model {
        self.model
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn n_ctx(&self) -> u32 {
        self.inner.n_ctx()
    }

    pub fn n_batch(&self) -> u32 {
        self.inner.n_batch()
    }

    pub fn n_ubatch(&self) -> u32 {
        self.inner.n_ubatch()
    }

    pub fn n_seq_max(&self) -> u32 {
        self.inner.n_seq_max()
    }

    /// Always equal to the model's embedding width.
    pub fn n_embd(&self) -> u32 {
        self.model.n_embd()
    }

    pub fn pooling_type(&self) -> PoolingType {
        self.inner.pooling_type()
    }

    pub fn memory_used(&self) -> u32 {
        self.inner.memory_used()
    }

    pub fn embeddings_enabled(&self) -> bool {
        self.inner.embeddings_enabled()
    }

    pub fn set_embeddings(&mut self, enabled: bool) -> Result<()> {
        self.inner.set_embeddings(enabled)
    }

    pub fn decode(&mut self, batch: &TokenBatch) -> Result<()> {
        self.run(batch, Op::Decode)
    }

    pub fn encode(&mut self, batch: &TokenBatch) -> Result<()> {
        self.run(batch, Op::Encode)
    }

    fn run(&mut self, batch: &TokenBatch, op: Op) -> Result<()> {
        if self.state == ContextState::Full && op == Op::Decode {
            return Err(Error::Decode(DecodeFailure::ContextFull {
                n_ctx: self.n_ctx(),
                used: self.memory_used(),
                requested: batch.len() as u32,
            }));
        }

        // Same checks for every backend, before anything reaches the engine.
        let n_vocab = self.model.n_vocab() as usize;
        let result = match batch.validate(n_vocab, self.n_seq_max(), self.n_embd() as usize) {
            Err(msg) => Err(DecodeFailure::InvalidBatch(msg)),
            Ok(()) => match op {
                Op::Decode => self.inner.decode(batch),
                Op::Encode => self.inner.encode(batch),
            },
        };

        match result {
            Ok(()) => {
                self.pending_sync = true;
                self.last_call = Some(LastCall {
                    n_tokens: batch.len(),
                    sequences: batch.sequences(),
                });
                tracing::trace!(?op, n_tokens = batch.len(), used = self.memory_used(), "batch processed");
                Ok(())
            }
            Err(failure) => {
                self.last_call = None;
                if failure.is_context_full() {
                    self.state = ContextState::Full;
                    tracing::warn!(n_ctx = self.n_ctx(), used = self.memory_used(), "context full");
                } else {
                    tracing::debug!(?op, %failure, "batch rejected");
                }
                Err(Error::Decode(failure))
            }
        }
    }

    /// Wait for queued device work from previous decode/encode calls.
    pub fn synchronize(&mut self) {
        self.inner.synchronize();
        self.pending_sync = false;
    }

    fn readable(&mut self) -> Result<&LastCall> {
        if !self.inner.embeddings_enabled() {
            return Err(Error::Embedding("embeddings are disabled on this context".into()));
        }
        if self.pending_sync {
            self.synchronize();
        }
        self.last_call
            .as_ref()
            .ok_or_else(|| Error::Embedding("no successful decode/encode since the last failure or creation".into()))
    }

    /// Pooled embedding for `seq_id` from the last decode/encode.
    ///
    /// Valid until the next mutable call on this context; copy it to keep it.
    pub fn embedding_seq(&mut self, seq_id: SeqId) -> Result<&[f32]> {
        let in_last_call = self.readable()?.sequences.contains(&seq_id);
        let pooling = self.pooling_type();
        if pooling == PoolingType::None {
            return Err(Error::Embedding(
                "pooling is none; read per-token embeddings with embedding_ith".into(),
            ));
        }
        if !in_last_call {
            return Err(Error::Embedding(format!("sequence {seq_id} was not part of the last batch")));
        }

        let n_embd = self.n_embd() as usize;
        let v = self
            .inner
            .embeddings_seq(seq_id)
            .ok_or_else(|| Error::Embedding(format!("engine returned no embedding for sequence {seq_id}")))?;
        if pooling != PoolingType::Rank && v.len() != n_embd {
            return Err(Error::Embedding(format!("expected {n_embd} floats, engine returned {}", v.len())));
        }
        Ok(v)
    }

    /// Per-token embedding of batch entry `i` from the last call. Negative
    /// indices count back from the end (`-1` is the last token).
    pub fn embedding_ith(&mut self, i: i32) -> Result<&[f32]> {
        let n_tokens = self.readable()?.n_tokens;
        let idx = if i < 0 { n_tokens as i64 + i as i64 } else { i as i64 };
        if idx < 0 || idx >= n_tokens as i64 {
            return Err(Error::Embedding(format!(
                "token index {i} out of range for a batch of {n_tokens}"
            )));
        }

        let n_embd = self.n_embd() as usize;
        let v = self
            .inner
            .embeddings_ith(idx as usize)
            .ok_or_else(|| Error::Embedding(format!("no output was requested for token {i}")))?;
        if v.len() != n_embd {
            return Err(Error::Embedding(format!("expected {n_embd} floats, engine returned {}", v.len())));
        }
        Ok(v)
    }

    /// Reset KV-memory. `erase_data` also clears the cache buffers.
    pub fn clear_memory(&mut self, erase_data: bool) {
        self.inner.clear_memory(erase_data);
        if self.state == ContextState::Full {
            tracing::debug!("context recovered from full state");
        }
        self.state = ContextState::Ready;
    }

    pub fn free(self) {
        tracing::debug!(n_ctx = self.n_ctx(), "context freed");
    }
}
