//! Token batches: the unit of input for decode and encode.

use super::{Pos, SeqId, Token};

/// What the batch feeds the model: token ids or precomputed input embeddings.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchInput {
    Tokens(Vec<Token>),
    /// Row-major `[n_tokens, n_embd]` input embeddings.
    Embeddings { data: Vec<f32>, n_embd: usize },
}

/// One decode/encode input.
///
/// Each entry carries a position, the set of sequences it belongs to, and
/// whether its output (logits/embedding) should be kept. When positions are
/// omitted the engine continues each sequence from its last position.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBatch {
    input: BatchInput,
    pos: Option<Vec<Pos>>,
    seq_ids: Vec<Vec<SeqId>>,
    output: Vec<bool>,
}

impl Default for TokenBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenBatch {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(n_tokens: usize) -> Self {
        Self {
            input: BatchInput::Tokens(Vec::with_capacity(n_tokens)),
            pos: Some(Vec::with_capacity(n_tokens)),
            seq_ids: Vec::with_capacity(n_tokens),
            output: Vec::with_capacity(n_tokens),
        }
    }

    /// Equivalent of `llama_batch_get_one`: sequence 0, engine-assigned
    /// positions, output for the last token only.
    pub fn get_one(tokens: &[Token]) -> Self {
        let n = tokens.len();
        Self {
            input: BatchInput::Tokens(tokens.to_vec()),
            pos: None,
            seq_ids: vec![vec![0]; n],
            output: (0..n).map(|i| i + 1 == n).collect(),
        }
    }

    /// A whole sequence starting at position 0 with every output requested.
    pub fn single_sequence(tokens: &[Token], seq_id: SeqId) -> Self {
        let n = tokens.len();
        Self {
            input: BatchInput::Tokens(tokens.to_vec()),
            pos: Some((0..n as Pos).collect()),
            seq_ids: vec![vec![seq_id]; n],
            output: vec![true; n],
        }
    }

    /// Embedding input for one sequence. `data.len()` must be a multiple of `n_embd`.
    pub fn from_embeddings(data: Vec<f32>, n_embd: usize, seq_id: SeqId) -> Self {
        let n = if n_embd == 0 { 0 } else { data.len() / n_embd };
        Self {
            input: BatchInput::Embeddings { data, n_embd },
            pos: Some((0..n as Pos).collect()),
            seq_ids: vec![vec![seq_id]; n],
            output: vec![true; n],
        }
    }

    /// Append one token. Fails on an embedding batch or one built with
    /// engine-assigned positions.
    pub fn add(&mut self, token: Token, pos: Pos, seq_ids: &[SeqId], output: bool) -> Result<(), String> {
        match (&mut self.input, &mut self.pos) {
            (BatchInput::Tokens(tokens), Some(positions)) => {
                tokens.push(token);
                positions.push(pos);
            }
            (BatchInput::Embeddings { .. }, _) => return Err("cannot add a token to an embedding batch".into()),
            (_, None) => return Err("cannot add a token to a batch with engine-assigned positions".into()),
        }
        self.seq_ids.push(seq_ids.to_vec());
        self.output.push(output);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.input = BatchInput::Tokens(Vec::new());
        self.pos = Some(Vec::new());
        self.seq_ids.clear();
        self.output.clear();
    }

    pub fn len(&self) -> usize {
        self.output.len()
    }

    pub fn is_empty(&self) -> bool {
        self.output.is_empty()
    }

    pub fn input(&self) -> &BatchInput {
        &self.input
    }

    /// Token ids, or `None` for an embedding batch.
    pub fn tokens(&self) -> Option<&[Token]> {
        match &self.input {
            BatchInput::Tokens(tokens) => Some(tokens),
            BatchInput::Embeddings { .. } => None,
        }
    }

    /// Input embedding row `i`, or `None` for a token batch.
    pub fn embedding_input(&self, i: usize) -> Option<&[f32]> {
        match &self.input {
            BatchInput::Embeddings { data, n_embd } => data.get(i * n_embd..(i + 1) * n_embd),
            BatchInput::Tokens(_) => None,
        }
    }

    pub fn positions(&self) -> Option<&[Pos]> {
        self.pos.as_deref()
    }

    pub fn seq_ids(&self, i: usize) -> &[SeqId] {
        &self.seq_ids[i]
    }

    pub fn output(&self, i: usize) -> bool {
        self.output[i]
    }

    pub fn n_outputs(&self) -> usize {
        self.output.iter().filter(|o| **o).count()
    }

    /// Distinct sequence ids in first-seen order.
    pub fn sequences(&self) -> Vec<SeqId> {
        let mut seen = Vec::new();
        for ids in &self.seq_ids {
            for id in ids {
                if !seen.contains(id) {
                    seen.push(*id);
                }
            }
        }
        seen
    }

    /// Structural checks that do not depend on engine state.
    pub fn validate(&self, n_vocab: usize, n_seq_max: u32, n_embd: usize) -> Result<(), String> {
        let n = self.len();
        if n == 0 {
            return Err("n_tokens == 0".into());
        }
        match &self.input {
            BatchInput::Tokens(tokens) => {
                if tokens.len() != n {
                    return Err(format!("{} tokens but {n} entries", tokens.len()));
                }
                if let Some((i, bad)) = tokens
                    .iter()
                    .enumerate()
                    .find(|(_, t)| **t < 0 || **t as usize >= n_vocab)
                {
                    return Err(format!("token[{i}] = {bad} is outside the vocabulary (n_vocab = {n_vocab})"));
                }
            }
            BatchInput::Embeddings { data, n_embd: width } => {
                if *width != n_embd {
                    return Err(format!("input embedding width {width}, model expects {n_embd}"));
                }
                if data.len() != n * n_embd {
                    return Err(format!("{} floats for {n} rows of {n_embd}", data.len()));
                }
            }
        }
        if let Some(pos) = &self.pos {
            if pos.len() != n {
                return Err(format!("{} positions for {n} entries", pos.len()));
            }
            if let Some(p) = pos.iter().find(|p| **p < 0) {
                return Err(format!("negative position {p}"));
            }
        }
        for (i, ids) in self.seq_ids.iter().enumerate() {
            if ids.is_empty() {
                return Err(format!("entry {i} belongs to no sequence"));
            }
            if let Some(id) = ids.iter().find(|id| **id < 0 || **id as u32 >= n_seq_max) {
                return Err(format!("seq_id {id} out of range (n_seq_max = {n_seq_max})"));
            }
        }
        Ok(())
    }
}
