//! Deterministic pure-Rust backend.
//!
//! Reads everything it needs from the GGUF header and never touches tensor
//! data. Tokenization is byte-level with three special tokens. Hidden states
//! are derived from a SHA-256 seed of each token id, a sinusoidal position
//! term and a running context mean, so equal inputs always produce equal
//! vectors and different inputs almost never do. KV-memory capacity is
//! tracked cell-for-cell against `n_ctx`, which makes context exhaustion and
//! recovery observable without a real model.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

use super::{AbortCallback, Backend, ContextBackend, ModelBackend};
use crate::runtime::error::{DecodeFailure, Error, Result};
use crate::runtime::gguf::GgufHeader;
use crate::runtime::params::{AttentionType, ContextParams, ModelParams, PoolingType};
use crate::runtime::{is_encoder_only, Pos, SeqId, Token, TokenBatch};

pub const TOKEN_UNK: Token = 0;
pub const TOKEN_BOS: Token = 1;
pub const TOKEN_EOS: Token = 2;
const BYTE_TOKEN_OFFSET: Token = 3;
pub const N_VOCAB: u32 = 256 + BYTE_TOKEN_OFFSET as u32;

const SPECIAL_TOKENS: [(&str, Token); 3] = [("<unk>", TOKEN_UNK), ("<s>", TOKEN_BOS), ("</s>", TOKEN_EOS)];

const DEFAULT_CTX_TRAIN: u32 = 2048;
const MAX_EMBD: u32 = 1 << 16;
const LOAD_STAGES: u32 = 4;
const POSITION_SCALE: f32 = 0.05;
const CONTEXT_MIX: f32 = 0.5;

static LIVE_MODELS: AtomicUsize = AtomicUsize::new(0);
static LIVE_CONTEXTS: AtomicUsize = AtomicUsize::new(0);

/// Number of reference models and contexts currently alive in this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveHandles {
    pub models: usize,
    pub contexts: usize,
}

pub fn live_handles() -> LiveHandles {
    LiveHandles {
        models: LIVE_MODELS.load(Ordering::SeqCst),
        contexts: LIVE_CONTEXTS.load(Ordering::SeqCst),
    }
}

#[derive(Debug, Default)]
pub struct ReferenceBackend;

impl ReferenceBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Backend for ReferenceBackend {
    fn name(&self) -> &'static str {
        "reference"
    }

    fn load_model(
        &self,
        path: &Path,
        header: &GgufHeader,
        params: &ModelParams,
        progress: &mut dyn FnMut(f32) -> bool,
    ) -> Result<Box<dyn ModelBackend>> {
        if !params.devices.is_empty() {
            return Err(Error::load(
                path,
                format!("reference backend has no accelerator devices (requested {:?})", params.devices),
            ));
        }
        if params.n_gpu_layers != 0 {
            tracing::debug!(n_gpu_layers = params.n_gpu_layers, "reference backend runs on CPU, ignoring offload");
        }

        if !progress(0.0) {
            return Err(Error::LoadAborted { path: path.to_path_buf() });
        }

        let arch = header
            .architecture()
            .ok_or_else(|| Error::load(path, "missing general.architecture"))?
            .to_string();
        let n_embd = header
            .embedding_length()
            .ok_or_else(|| Error::load(path, format!("missing {arch}.embedding_length")))?;
        if n_embd == 0 || n_embd > MAX_EMBD {
            return Err(Error::load(path, format!("embedding_length {n_embd} out of range")));
        }
        let n_ctx_train = header.context_length().unwrap_or(DEFAULT_CTX_TRAIN);
        let is_encoder = is_encoder_only(&arch);
        let pooling = match header.pooling_type().map(PoolingType::from_raw) {
            Some(p) if p != PoolingType::Unspecified => p,
            _ if is_encoder => PoolingType::Cls,
            _ => PoolingType::Mean,
        };
        let add_bos = header.get_bool("tokenizer.ggml.add_bos_token").unwrap_or(true);
        let add_eos = header.get_bool("tokenizer.ggml.add_eos_token").unwrap_or(false);

        for stage in 1..=LOAD_STAGES {
            if !progress(stage as f32 / LOAD_STAGES as f32) {
                return Err(Error::LoadAborted { path: path.to_path_buf() });
            }
        }

        tracing::debug!(%arch, n_embd, n_ctx_train, %pooling, is_encoder, "reference model ready");

        Ok(Box::new(ReferenceModel::new(ReferenceModelSpec {
            arch,
            n_embd,
            n_ctx_train,
            pooling,
            is_encoder,
            add_bos,
            add_eos,
            vocab_only: params.vocab_only,
        })))
    }
}

struct ReferenceModelSpec {
    arch: String,
    n_embd: u32,
    n_ctx_train: u32,
    pooling: PoolingType,
    is_encoder: bool,
    add_bos: bool,
    add_eos: bool,
    vocab_only: bool,
}

struct ReferenceModel {
    spec: ReferenceModelSpec,
}

impl ReferenceModel {
    fn new(spec: ReferenceModelSpec) -> Self {
        LIVE_MODELS.fetch_add(1, Ordering::SeqCst);
        Self { spec }
    }

    /// Content vector for a token, seeded by SHA-256 of `(arch, token)`.
    fn token_vector(&self, token: Token) -> Vec<f32> {
        let mut hasher = Sha256::new();
        hasher.update(self.spec.arch.as_bytes());
        hasher.update(token.to_le_bytes());
        let digest = hasher.finalize();
        let mut seed = [0u8; 8];
        seed.copy_from_slice(&digest[..8]);
        let mut rng = StdRng::seed_from_u64(u64::from_le_bytes(seed));
        (0..self.spec.n_embd).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
    }
}

impl Drop for ReferenceModel {
    fn drop(&mut self) {
        LIVE_MODELS.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ModelBackend for ReferenceModel {
    fn n_embd(&self) -> u32 {
        self.spec.n_embd
    }

    fn n_vocab(&self) -> u32 {
        N_VOCAB
    }

    fn n_ctx_train(&self) -> u32 {
        self.spec.n_ctx_train
    }

    fn pooling_type(&self) -> PoolingType {
        self.spec.pooling
    }

    fn supports_concurrent_contexts(&self) -> bool {
        true
    }

    fn tokenize(&self, text: &str, add_special: bool, parse_special: bool) -> Result<Vec<Token>> {
        if text.len() > i32::MAX as usize {
            return Err(Error::Tokenize(format!("input of {} bytes is too long", text.len())));
        }

        let mut tokens = Vec::with_capacity(text.len() + 2);
        if add_special && self.spec.add_bos {
            tokens.push(TOKEN_BOS);
        }

        let mut rest = text;
        while !rest.is_empty() {
            if parse_special {
                if let Some((literal, id)) = SPECIAL_TOKENS.iter().find(|(lit, _)| rest.starts_with(lit)) {
                    tokens.push(*id);
                    rest = &rest[literal.len()..];
                    continue;
                }
            }
            let ch_len = rest.chars().next().map_or(1, char::len_utf8);
            tokens.extend(
                rest.as_bytes()[..ch_len]
                    .iter()
                    .map(|b| BYTE_TOKEN_OFFSET + Token::from(*b)),
            );
            rest = &rest[ch_len..];
        }

        if add_special && self.spec.add_eos {
            tokens.push(TOKEN_EOS);
        }
        Ok(tokens)
    }

    fn token_to_piece(&self, token: Token, render_special: bool) -> Result<Vec<u8>> {
        if let Some((literal, _)) = SPECIAL_TOKENS.iter().find(|(_, id)| *id == token) {
            return Ok(if render_special {
                literal.as_bytes().to_vec()
            } else {
                Vec::new()
            });
        }
        token
            .checked_sub(BYTE_TOKEN_OFFSET)
            .and_then(|t| u8::try_from(t).ok())
            .map(|byte| vec![byte])
            .ok_or_else(|| Error::Tokenize(format!("token {token} is outside the vocabulary")))
    }

    fn new_context<'m>(
        &'m self,
        params: &ContextParams,
        abort: Option<AbortCallback>,
    ) -> Result<Box<dyn ContextBackend + 'm>> {
        if self.spec.vocab_only {
            return Err(Error::ContextCreation("model was loaded with vocab_only".into()));
        }
        if params.n_ctx > self.spec.n_ctx_train {
            return Err(Error::ContextCreation(format!(
                "n_ctx {} exceeds the model's trained context of {}",
                params.n_ctx, self.spec.n_ctx_train
            )));
        }
        if params.pooling_type == PoolingType::Rank {
            return Err(Error::ContextCreation(
                "rank pooling requires a classifier head, which this model does not have".into(),
            ));
        }

        let pooling = match params.pooling_type {
            PoolingType::Unspecified => self.spec.pooling,
            other => other,
        };
        let causal = match params.attention_type {
            AttentionType::Causal => true,
            AttentionType::NonCausal => false,
            AttentionType::Unspecified => !self.spec.is_encoder,
        };
        let n_ctx = params.n_ctx;
        let n_batch = params.n_batch.min(n_ctx);
        let n_ubatch = params.n_ubatch.min(n_batch);

        Ok(Box::new(ReferenceContext::new(
            self,
            ContextShape {
                n_ctx,
                n_batch,
                n_ubatch,
                n_seq_max: params.n_seq_max,
                pooling,
                causal,
            },
            params.embeddings,
            abort,
        )))
    }
}

struct ContextShape {
    n_ctx: u32,
    n_batch: u32,
    n_ubatch: u32,
    n_seq_max: u32,
    pooling: PoolingType,
    causal: bool,
}

/// Result of one forward pass, committed only when the whole pass succeeds.
struct Outputs {
    /// Batch index → row in `data`.
    rows: Vec<Option<usize>>,
    data: Vec<f32>,
    pooled: BTreeMap<SeqId, Vec<f32>>,
}

struct ReferenceContext<'m> {
    model: &'m ReferenceModel,
    shape: ContextShape,
    embeddings: bool,
    abort: Option<AbortCallback>,
    used_cells: u32,
    /// Last occupied position per sequence.
    seq_pos: HashMap<SeqId, Pos>,
    outputs: Option<Outputs>,
}

impl<'m> ReferenceContext<'m> {
    fn new(
        model: &'m ReferenceModel,
        shape: ContextShape,
        embeddings: bool,
        abort: Option<AbortCallback>,
    ) -> Self {
        LIVE_CONTEXTS.fetch_add(1, Ordering::SeqCst);
        Self {
            model,
            shape,
            embeddings,
            abort,
            used_cells: 0,
            seq_pos: HashMap::new(),
            outputs: None,
        }
    }

    fn check_batch(&self, batch: &TokenBatch, limit: u32, limit_name: &str) -> Result<(), DecodeFailure> {
        batch
            .validate(N_VOCAB as usize, self.shape.n_seq_max, self.model.spec.n_embd as usize)
            .map_err(DecodeFailure::InvalidBatch)?;
        if batch.len() > limit as usize {
            return Err(DecodeFailure::InvalidBatch(format!(
                "{} tokens exceed {limit_name} = {limit}",
                batch.len()
            )));
        }
        Ok(())
    }

    /// Positions for each batch entry. With `continue_memory`, each sequence
    /// must pick up right after its last cell; engine-assigned positions do so
    /// automatically.
    fn resolve_positions(&self, batch: &TokenBatch, continue_memory: bool) -> Result<Vec<Pos>, DecodeFailure> {
        let mut next: HashMap<SeqId, Pos> = HashMap::new();
        if continue_memory {
            next.extend(self.seq_pos.iter().map(|(seq, last)| (*seq, last + 1)));
        }

        let mut resolved = Vec::with_capacity(batch.len());
        for i in 0..batch.len() {
            let seq = batch.seq_ids(i)[0];
            let expected = next.get(&seq).copied();
            let pos = match (batch.positions(), expected) {
                (Some(positions), Some(e)) if positions[i] != e => {
                    return Err(DecodeFailure::InvalidBatch(format!(
                        "sequence {seq}: position {} does not follow {}",
                        positions[i],
                        e - 1
                    )));
                }
                (Some(positions), _) => positions[i],
                (None, e) => e.unwrap_or(0),
            };
            next.insert(seq, pos + 1);
            resolved.push(pos);
        }
        Ok(resolved)
    }

    fn forward(&mut self, batch: &TokenBatch, positions: &[Pos]) -> Result<Outputs, DecodeFailure> {
        let n_embd = self.model.spec.n_embd as usize;
        let n = batch.len();

        let mut base: Vec<Vec<f32>> = Vec::with_capacity(n);
        for (i, &pos) in positions.iter().enumerate() {
            if let Some(abort) = self.abort.as_mut() {
                if abort() {
                    return Err(DecodeFailure::Aborted);
                }
            }
            let mut v = match batch.tokens() {
                Some(tokens) => self.model.token_vector(tokens[i]),
                None => batch.embedding_input(i).map(<[f32]>::to_vec).unwrap_or_else(|| vec![0.0; n_embd]),
            };
            add_position(&mut v, pos);
            base.push(v);
        }

        // Context mixing per primary sequence.
        let mut hidden: Vec<Vec<f32>> = Vec::with_capacity(n);
        let mut members: BTreeMap<SeqId, Vec<usize>> = BTreeMap::new();
        for i in 0..n {
            members.entry(batch.seq_ids(i)[0]).or_default().push(i);
        }
        for i in 0..n {
            let group = &members[&batch.seq_ids(i)[0]];
            let visible: Vec<usize> = if self.shape.causal {
                group.iter().copied().filter(|j| *j <= i).collect()
            } else {
                group.clone()
            };
            let mut h = base[i].clone();
            let weight = CONTEXT_MIX / visible.len() as f32;
            for j in visible {
                for (d, x) in base[j].iter().enumerate() {
                    h[d] += weight * x;
                }
            }
            hidden.push(h);
        }

        let mut rows = vec![None; n];
        let mut data = Vec::new();
        let mut pooled = BTreeMap::new();

        if self.embeddings {
            let keep_all = self.shape.pooling != PoolingType::None;
            for i in 0..n {
                if keep_all || batch.output(i) {
                    rows[i] = Some(data.len() / n_embd);
                    data.extend_from_slice(&hidden[i]);
                }
            }
            if self.shape.pooling != PoolingType::None {
                for seq in batch.sequences() {
                    let idx: Vec<usize> = (0..n).filter(|i| batch.seq_ids(*i).contains(&seq)).collect();
                    let v = match self.shape.pooling {
                        PoolingType::Cls => hidden[idx[0]].clone(),
                        PoolingType::Last => hidden[idx[idx.len() - 1]].clone(),
                        _ => mean_rows(&hidden, &idx, n_embd),
                    };
                    pooled.insert(seq, v);
                }
            }
        }

        Ok(Outputs { rows, data, pooled })
    }
}

fn add_position(v: &mut [f32], pos: Pos) {
    let n = v.len() as f32;
    for (d, x) in v.iter_mut().enumerate() {
        let pair = (d / 2) as f32;
        let angle = pos as f32 / 10000f32.powf(2.0 * pair / n);
        *x += POSITION_SCALE * if d % 2 == 0 { angle.sin() } else { angle.cos() };
    }
}

fn mean_rows(rows: &[Vec<f32>], idx: &[usize], n_embd: usize) -> Vec<f32> {
    let mut sum = vec![0.0f32; n_embd];
    for &i in idx {
        for (d, x) in rows[i].iter().enumerate() {
            sum[d] += x;
        }
    }
    let count = idx.len().max(1) as f32;
    sum.iter_mut().for_each(|x| *x /= count);
    sum
}

impl Drop for ReferenceContext<'_> {
    fn drop(&mut self) {
        LIVE_CONTEXTS.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ContextBackend for ReferenceContext<'_> {
    fn n_ctx(&self) -> u32 {
        self.shape.n_ctx
    }

    fn n_batch(&self) -> u32 {
        self.shape.n_batch
    }

    fn n_ubatch(&self) -> u32 {
        self.shape.n_ubatch
    }

    fn n_seq_max(&self) -> u32 {
        self.shape.n_seq_max
    }

    fn pooling_type(&self) -> PoolingType {
        self.shape.pooling
    }

    fn n_embd(&self) -> u32 {
        self.model.spec.n_embd
    }

    fn embeddings_enabled(&self) -> bool {
        self.embeddings
    }

    fn set_embeddings(&mut self, enabled: bool) -> Result<()> {
        self.embeddings = enabled;
        Ok(())
    }

    fn memory_used(&self) -> u32 {
        self.used_cells
    }

    fn clear_memory(&mut self, data: bool) {
        tracing::trace!(cells = self.used_cells, data, "clearing reference KV-memory");
        self.used_cells = 0;
        self.seq_pos.clear();
    }

    fn decode(&mut self, batch: &TokenBatch) -> Result<(), DecodeFailure> {
        if self.model.spec.is_encoder {
            return self.encode(batch);
        }
        self.check_batch(batch, self.shape.n_batch, "n_batch")?;
        let positions = self.resolve_positions(batch, true)?;

        let requested = batch.len() as u32;
        if self.used_cells + requested > self.shape.n_ctx {
            return Err(DecodeFailure::ContextFull {
                n_ctx: self.shape.n_ctx,
                used: self.used_cells,
                requested,
            });
        }

        let outputs = self.forward(batch, &positions)?;

        self.used_cells += requested;
        for (i, pos) in positions.iter().enumerate() {
            for seq in batch.seq_ids(i) {
                let last = self.seq_pos.entry(*seq).or_insert(*pos);
                *last = (*last).max(*pos);
            }
        }
        self.outputs = Some(outputs);
        Ok(())
    }

    fn encode(&mut self, batch: &TokenBatch) -> Result<(), DecodeFailure> {
        self.check_batch(batch, self.shape.n_ubatch, "n_ubatch")?;
        let positions = self.resolve_positions(batch, false)?;
        let outputs = self.forward(batch, &positions)?;
        self.outputs = Some(outputs);
        Ok(())
    }

    fn synchronize(&mut self) {}

    fn embeddings_seq(&self, seq_id: SeqId) -> Option<&[f32]> {
        self.outputs.as_ref()?.pooled.get(&seq_id).map(Vec::as_slice)
    }

    fn embeddings_ith(&self, i: usize) -> Option<&[f32]> {
        let outputs = self.outputs.as_ref()?;
        let row = (*outputs.rows.get(i)?)?;
        let n_embd = self.model.spec.n_embd as usize;
        outputs.data.get(row * n_embd..(row + 1) * n_embd)
    }
}
