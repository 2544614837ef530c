//! llama.cpp backend via `llama-cpp-2`.
//!
//! llama.cpp allows one backend initialization per process, so the
//! `LlamaBackend` lives in a process-wide `OnceLock` and every
//! [`LlamaCppBackend`] shares it.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::path::Path;
use std::sync::OnceLock;

use llama_cpp_2::context::params::{LlamaContextParams, LlamaPoolingType};
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::token::LlamaToken;
use llama_cpp_2::{DecodeError, EncodeError};

use super::{AbortCallback, Backend, ContextBackend, ModelBackend};
use crate::runtime::error::{DecodeFailure, Error, Result};
use crate::runtime::gguf::GgufHeader;
use crate::runtime::params::{ContextParams, ModelParams, PoolingType};
use crate::runtime::{is_encoder_only, Pos, SeqId, Token, TokenBatch};

static BACKEND: OnceLock<LlamaBackend> = OnceLock::new();

fn shared_backend() -> Result<&'static LlamaBackend> {
    if let Some(backend) = BACKEND.get() {
        return Ok(backend);
    }
    let backend = LlamaBackend::init().map_err(|e| Error::Unsupported {
        backend: "llama",
        what: format!("backend initialization failed: {e}"),
    })?;
    // A concurrent initializer may have won; either instance is usable.
    Ok(BACKEND.get_or_init(|| backend))
}

pub struct LlamaCppBackend {
    backend: &'static LlamaBackend,
    concurrent_contexts: bool,
}

impl LlamaCppBackend {
    pub fn init() -> Result<Self> {
        Ok(Self {
            backend: shared_backend()?,
            concurrent_contexts: false,
        })
    }

    /// Allow import workers to run one context each on separate threads.
    pub fn with_concurrent_contexts(mut self, enabled: bool) -> Self {
        self.concurrent_contexts = enabled;
        self
    }
}

impl Backend for LlamaCppBackend {
    fn name(&self) -> &'static str {
        "llama"
    }

    fn load_model(
        &self,
        path: &Path,
        header: &GgufHeader,
        params: &ModelParams,
        progress: &mut dyn FnMut(f32) -> bool,
    ) -> Result<Box<dyn ModelBackend>> {
        if !progress(0.0) {
            return Err(Error::LoadAborted { path: path.to_path_buf() });
        }
        if !params.devices.is_empty() || !params.tensor_split.is_empty() {
            tracing::warn!("llama backend uses its default device placement; devices/tensor_split ignored");
        }

        let n_gpu_layers = if params.n_gpu_layers < 0 {
            u32::MAX
        } else {
            params.n_gpu_layers as u32
        };
        let model_params = LlamaModelParams::default().with_n_gpu_layers(n_gpu_layers);
        let model = LlamaModel::load_from_file(self.backend, path, &model_params)
            .map_err(|e| Error::load(path, e.to_string()))?;

        // The engine loads in one call; abort is honored at the end.
        if !progress(1.0) {
            return Err(Error::LoadAborted { path: path.to_path_buf() });
        }

        let n_embd = u32::try_from(model.n_embd()).map_err(|_| Error::load(path, "negative n_embd"))?;
        let n_vocab = u32::try_from(model.n_vocab()).map_err(|_| Error::load(path, "negative n_vocab"))?;
        let arch = header.architecture().unwrap_or_default().to_string();
        let pooling = header
            .pooling_type()
            .map(PoolingType::from_raw)
            .filter(|p| *p != PoolingType::Unspecified)
            .unwrap_or(PoolingType::Mean);

        Ok(Box::new(LlamaCppModel {
            backend: self.backend,
            model,
            n_embd,
            n_vocab,
            pooling,
            is_encoder: is_encoder_only(&arch),
            concurrent_contexts: self.concurrent_contexts,
        }))
    }
}

struct LlamaCppModel {
    backend: &'static LlamaBackend,
    model: LlamaModel,
    n_embd: u32,
    n_vocab: u32,
    pooling: PoolingType,
    is_encoder: bool,
    concurrent_contexts: bool,
}

fn to_llama_pooling(p: PoolingType) -> LlamaPoolingType {
    match p {
        PoolingType::Unspecified => LlamaPoolingType::Unspecified,
        PoolingType::None => LlamaPoolingType::None,
        PoolingType::Mean => LlamaPoolingType::Mean,
        PoolingType::Cls => LlamaPoolingType::Cls,
        PoolingType::Last => LlamaPoolingType::Last,
        PoolingType::Rank => LlamaPoolingType::Rank,
    }
}

impl ModelBackend for LlamaCppModel {
    fn n_embd(&self) -> u32 {
        self.n_embd
    }

    fn n_vocab(&self) -> u32 {
        self.n_vocab
    }

    fn n_ctx_train(&self) -> u32 {
        self.model.n_ctx_train()
    }

    fn pooling_type(&self) -> PoolingType {
        self.pooling
    }

    fn supports_concurrent_contexts(&self) -> bool {
        self.concurrent_contexts
    }

    fn tokenize(&self, text: &str, add_special: bool, _parse_special: bool) -> Result<Vec<Token>> {
        let add_bos = if add_special { AddBos::Always } else { AddBos::Never };
        let tokens = self
            .model
            .str_to_token(text, add_bos)
            .map_err(|e| Error::Tokenize(e.to_string()))?;
        Ok(tokens.into_iter().map(|t| t.0).collect())
    }

    fn token_to_piece(&self, token: Token, render_special: bool) -> Result<Vec<u8>> {
        if token < 0 || token as u32 >= self.n_vocab {
            return Err(Error::Tokenize(format!("token {token} is outside the vocabulary")));
        }
        let special = if render_special { Special::Tokenize } else { Special::Plaintext };
        self.model
            .token_to_bytes(LlamaToken::new(token), special)
            .map_err(|e| Error::Tokenize(e.to_string()))
    }

    fn new_context<'m>(
        &'m self,
        params: &ContextParams,
        abort: Option<AbortCallback>,
    ) -> Result<Box<dyn ContextBackend + 'm>> {
        if abort.is_some() {
            return Err(Error::Unsupported {
                backend: "llama",
                what: "abort callbacks".into(),
            });
        }
        let n_ctx = NonZeroU32::new(params.n_ctx)
            .ok_or_else(|| Error::ContextCreation("n_ctx must be resolved before context creation".into()))?;

        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(Some(n_ctx))
            .with_n_batch(params.n_batch)
            .with_n_ubatch(params.n_ubatch)
            .with_n_seq_max(params.n_seq_max)
            .with_n_threads(params.n_threads)
            .with_n_threads_batch(params.n_threads_batch)
            .with_embeddings(params.embeddings)
            .with_pooling_type(to_llama_pooling(params.pooling_type));

        let ctx = self
            .model
            .new_context(self.backend, ctx_params)
            .map_err(|e| Error::ContextCreation(e.to_string()))?;

        let pooling = match params.pooling_type {
            PoolingType::Unspecified => self.pooling,
            other => other,
        };

        Ok(Box::new(LlamaCppContext {
            n_embd: self.n_embd,
            n_seq_max: params.n_seq_max,
            pooling,
            embeddings: params.embeddings,
            is_encoder: self.is_encoder,
            used_cells: 0,
            seq_pos: HashMap::new(),
            rows: Vec::new(),
            ctx,
        }))
    }
}

struct LlamaCppContext<'m> {
    ctx: LlamaContext<'m>,
    n_embd: u32,
    n_seq_max: u32,
    pooling: PoolingType,
    embeddings: bool,
    is_encoder: bool,
    /// Cells committed by successful decodes since the last clear.
    used_cells: u32,
    seq_pos: HashMap<SeqId, Pos>,
    /// Output flag per entry of the last batch.
    rows: Vec<bool>,
}

impl LlamaCppContext<'_> {
    fn build_batch(&self, batch: &TokenBatch, continue_memory: bool) -> Result<(LlamaBatch, Vec<Pos>), DecodeFailure> {
        let tokens = batch.tokens().ok_or_else(|| {
            DecodeFailure::InvalidBatch("embedding input is not supported by the llama backend".into())
        })?;
        if tokens.is_empty() {
            return Err(DecodeFailure::InvalidBatch("n_tokens == 0".into()));
        }

        let mut next: HashMap<SeqId, Pos> = HashMap::new();
        if continue_memory {
            next.extend(self.seq_pos.iter().map(|(seq, last)| (*seq, last + 1)));
        }

        let mut llama_batch = LlamaBatch::new(tokens.len(), self.n_seq_max as i32);
        let mut positions = Vec::with_capacity(tokens.len());
        for (i, token) in tokens.iter().enumerate() {
            let seq_ids = batch.seq_ids(i);
            let pos = match batch.positions() {
                Some(p) => p[i],
                None => next.get(&seq_ids[0]).copied().unwrap_or(0),
            };
            next.insert(seq_ids[0], pos + 1);
            llama_batch
                .add(LlamaToken::new(*token), pos, seq_ids, batch.output(i))
                .map_err(|e| DecodeFailure::InvalidBatch(e.to_string()))?;
            positions.push(pos);
        }
        Ok((llama_batch, positions))
    }

    fn record_outputs(&mut self, batch: &TokenBatch) {
        self.rows = (0..batch.len()).map(|i| batch.output(i)).collect();
    }
}

fn map_decode_error(e: DecodeError, n_ctx: u32, used: u32, requested: u32) -> DecodeFailure {
    match e {
        DecodeError::NoKvCacheSlot => DecodeFailure::ContextFull { n_ctx, used, requested },
        DecodeError::NTokensZero => DecodeFailure::InvalidBatch("n_tokens == 0".into()),
        DecodeError::Unknown(code) => DecodeFailure::from_status(code).unwrap_or(DecodeFailure::Status(code)),
    }
}

fn map_encode_error(e: EncodeError, n_ctx: u32, used: u32, requested: u32) -> DecodeFailure {
    match e {
        EncodeError::NoKvCacheSlot => DecodeFailure::ContextFull { n_ctx, used, requested },
        EncodeError::NTokensZero => DecodeFailure::InvalidBatch("n_tokens == 0".into()),
        EncodeError::Unknown(code) => DecodeFailure::from_status(code).unwrap_or(DecodeFailure::Status(code)),
    }
}

impl ContextBackend for LlamaCppContext<'_> {
    fn n_ctx(&self) -> u32 {
        self.ctx.n_ctx()
    }

    fn n_batch(&self) -> u32 {
        self.ctx.n_batch()
    }

    fn n_ubatch(&self) -> u32 {
        self.ctx.n_ubatch()
    }

    fn n_seq_max(&self) -> u32 {
        self.n_seq_max
    }

    fn pooling_type(&self) -> PoolingType {
        self.pooling
    }

    fn n_embd(&self) -> u32 {
        self.n_embd
    }

    fn embeddings_enabled(&self) -> bool {
        self.embeddings
    }

    fn set_embeddings(&mut self, enabled: bool) -> Result<()> {
        if enabled == self.embeddings {
            return Ok(());
        }
        Err(Error::Unsupported {
            backend: "llama",
            what: "toggling embeddings after context creation".into(),
        })
    }

    fn memory_used(&self) -> u32 {
        self.used_cells
    }

    fn clear_memory(&mut self, _data: bool) {
        self.ctx.clear_kv_cache();
        self.used_cells = 0;
        self.seq_pos.clear();
    }

    fn decode(&mut self, batch: &TokenBatch) -> Result<(), DecodeFailure> {
        if self.is_encoder {
            return self.encode(batch);
        }
        let (mut llama_batch, positions) = self.build_batch(batch, true)?;
        let requested = batch.len() as u32;
        let (n_ctx, used) = (self.n_ctx(), self.used_cells);
        if used + requested > n_ctx {
            return Err(DecodeFailure::ContextFull { n_ctx, used, requested });
        }

        self.ctx
            .decode(&mut llama_batch)
            .map_err(|e| map_decode_error(e, n_ctx, used, requested))?;

        self.used_cells += requested;
        for (i, pos) in positions.iter().enumerate() {
            for seq in batch.seq_ids(i) {
                let last = self.seq_pos.entry(*seq).or_insert(*pos);
                *last = (*last).max(*pos);
            }
        }
        self.record_outputs(batch);
        Ok(())
    }

    fn encode(&mut self, batch: &TokenBatch) -> Result<(), DecodeFailure> {
        let (mut llama_batch, _) = self.build_batch(batch, false)?;
        let requested = batch.len() as u32;
        let (n_ctx, used) = (self.n_ctx(), self.used_cells);
        self.ctx
            .encode(&mut llama_batch)
            .map_err(|e| map_encode_error(e, n_ctx, used, requested))?;
        self.record_outputs(batch);
        Ok(())
    }

    // llama.cpp's embedding getters synchronize internally.
    fn synchronize(&mut self) {}

    fn embeddings_seq(&self, seq_id: SeqId) -> Option<&[f32]> {
        self.ctx.embeddings_seq_ith(seq_id).ok()
    }

    fn embeddings_ith(&self, i: usize) -> Option<&[f32]> {
        if !*self.rows.get(i)? {
            return None;
        }
        self.ctx.embeddings_ith(i as i32).ok()
    }
}
