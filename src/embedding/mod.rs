//! Text-to-vector embedding pipeline.
//!
//! [`Embedder`] owns one inference [`Context`] and turns text into an
//! L2-normalized vector: normalize whitespace, tokenize, clear KV-memory,
//! decode (or encode for encoder-only models), synchronize, copy the pooled
//! embedding out. [`Embedder::embed_and_store`] then writes it to the vector
//! store. All methods take `&mut self`, so one embedder serves one thread;
//! parallel callers create one embedder per worker.

use anyhow::{bail, Context as _, Result};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::memory::store;
use crate::memory::types::StoredMemory;
use crate::runtime::{self, Context, ContextParams, Model, PoolingType, SeqId, TokenBatch};

/// Knobs for turning text into a stored vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    /// Let the tokenizer add BOS/EOS as the model declares.
    pub add_special: bool,
    /// Treat special-token text like `<s>` in the input as control tokens.
    pub parse_special: bool,
    /// L2-normalize the output vector.
    pub normalize: bool,
    /// Cut inputs longer than the context's token limit instead of failing.
    pub truncate: bool,
    /// Sequence id the text is decoded under.
    pub seq_id: SeqId,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            add_special: true,
            parse_special: false,
            normalize: true,
            truncate: true,
            seq_id: 0,
        }
    }
}

pub struct Embedder<'m> {
    ctx: Context<'m>,
    options: PipelineOptions,
}

impl<'m> Embedder<'m> {
    /// Create a context on `model` dedicated to embedding.
    pub fn new(model: &'m Model, params: &ContextParams, options: PipelineOptions) -> Result<Self> {
        let params = ContextParams {
            embeddings: true,
            ..params.clone()
        };
        let ctx = model
            .new_context(&params)
            .context("failed to create embedding context")?;
        Self::from_context(ctx, options)
    }

    pub fn from_context(mut ctx: Context<'m>, options: PipelineOptions) -> Result<Self> {
        if options.seq_id < 0 || options.seq_id as u32 >= ctx.n_seq_max() {
            bail!(
                "seq_id {} is outside the context's {} sequence(s)",
                options.seq_id,
                ctx.n_seq_max()
            );
        }
        if !ctx.embeddings_enabled() {
            ctx.set_embeddings(true)?;
        }
        Ok(Self { ctx, options })
    }

    pub fn context(&self) -> &Context<'m> {
        &self.ctx
    }

    pub fn into_context(self) -> Context<'m> {
        self.ctx
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub fn dimensions(&self) -> usize {
        self.ctx.n_embd() as usize
    }

    /// Longest token sequence one call can take.
    pub fn token_limit(&self) -> usize {
        let mut limit = self.ctx.n_ctx().min(self.ctx.n_batch());
        if self.ctx.model().has_encoder() {
            limit = limit.min(self.ctx.n_ubatch());
        }
        limit as usize
    }

    /// Embed one text.
    pub fn embed(&mut self, text: &str) -> Result<Vec<f32>> {
        let normalized = normalize_text(text);
        if normalized.is_empty() {
            return Err(runtime::Error::Tokenize("text is empty".into()).into());
        }

        let mut tokens = self.ctx.model().vocab().tokenize(
            &normalized,
            self.options.add_special,
            self.options.parse_special,
        )?;
        if tokens.is_empty() {
            return Err(runtime::Error::Tokenize("text produced no tokens".into()).into());
        }

        let limit = self.token_limit();
        if tokens.len() > limit {
            if !self.options.truncate {
                bail!("input is {} tokens, limit is {limit}", tokens.len());
            }
            tracing::warn!(tokens = tokens.len(), limit, "truncating input");
            tokens.truncate(limit);
        }

        let seq_id = self.options.seq_id;
        let batch = TokenBatch::single_sequence(&tokens, seq_id);

        self.ctx.clear_memory(true);
        if self.ctx.model().has_encoder() {
            self.ctx.encode(&batch)?;
        } else {
            self.ctx.decode(&batch)?;
        }
        self.ctx.synchronize();

        let mut vector = if self.ctx.pooling_type() == PoolingType::None {
            self.ctx.embedding_ith(-1)?.to_vec()
        } else {
            self.ctx.embedding_seq(seq_id)?.to_vec()
        };

        if let Some(i) = vector.iter().position(|x| !x.is_finite()) {
            return Err(runtime::Error::Embedding(format!("embedding[{i}] is not finite")).into());
        }
        if self.options.normalize {
            if norm(&vector) == 0.0 {
                return Err(runtime::Error::Embedding("embedding has zero norm".into()).into());
            }
            vector = l2_normalize(&vector);
        }

        tracing::trace!(tokens = tokens.len(), dims = vector.len(), "embedded text");
        Ok(vector)
    }

    /// Embed several texts in order. Fails on the first text that fails.
    pub fn embed_batch(&mut self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    /// Embed `text` and insert it with `metadata` into the store on `conn`.
    ///
    /// The first successful store into a database records the model
    /// identity; later stores from a different model or backend are refused
    /// because their vectors are not comparable.
    pub fn embed_and_store(
        &mut self,
        text: &str,
        conn: &mut Connection,
        metadata: Option<&serde_json::Value>,
    ) -> Result<StoredMemory> {
        let vector = self.embed(text)?;
        let model = self.ctx.model().identity();
        store::store_embedding_from(conn, &model, &normalize_text(text), metadata, &vector)
    }
}

/// Collapse runs of whitespace to one space and trim the ends.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// L2-normalize a vector. Returns a zero vector if the input norm is zero.
pub fn l2_normalize(v: &[f32]) -> Vec<f32> {
    let n = norm(v);
    if n == 0.0 {
        return vec![0.0; v.len()];
    }
    v.iter().map(|x| x / n).collect()
}
