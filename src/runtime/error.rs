//! Error taxonomy for the runtime and the vector-store registrar.

use std::path::PathBuf;

use thiserror::Error;

use super::gguf::GgufError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Why a decode or encode call did not produce outputs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeFailure {
    /// No free KV-memory cells for the batch. Recover with `clear_memory`.
    #[error("context full: {used}/{n_ctx} cells in use, batch needs {requested}")]
    ContextFull {
        n_ctx: u32,
        used: u32,
        requested: u32,
    },
    /// The batch itself is malformed. Caller bug; retrying will not help.
    #[error("invalid batch: {0}")]
    InvalidBatch(String),
    /// The abort callback asked the engine to stop.
    #[error("aborted by callback")]
    Aborted,
    /// Any other non-zero engine status.
    #[error("engine returned status {0}")]
    Status(i32),
}

impl DecodeFailure {
    /// Map an engine status code (llama.cpp convention) to a failure.
    /// Returns `None` for success.
    pub fn from_status(code: i32) -> Option<Self> {
        match code {
            0 => None,
            1 => Some(Self::ContextFull {
                n_ctx: 0,
                used: 0,
                requested: 0,
            }),
            2 => Some(Self::Aborted),
            -1 => Some(Self::InvalidBatch("rejected by engine".into())),
            other => Some(Self::Status(other)),
        }
    }

    pub fn is_context_full(&self) -> bool {
        matches!(self, Self::ContextFull { .. })
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to load model {}: {reason}", path.display())]
    Load { path: PathBuf, reason: String },

    #[error("loading {} was aborted by the progress callback", path.display())]
    LoadAborted { path: PathBuf },

    #[error("failed to create inference context: {0}")]
    ContextCreation(String),

    #[error("tokenization failed: {0}")]
    Tokenize(String),

    #[error("token buffer too small: {required} tokens needed, capacity is {capacity}")]
    BufferTooSmall { required: usize, capacity: usize },

    #[error("{0}")]
    Decode(#[from] DecodeFailure),

    #[error("embedding unavailable: {0}")]
    Embedding(String),

    #[error("not supported by the {backend} backend: {what}")]
    Unsupported { backend: &'static str, what: String },

    #[error("sqlite-vec registration failed (rc={code}): {message}")]
    Registration { code: i32, message: String },

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Gguf(#[from] GgufError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Errors the caller can recover from by adjusting input or state and retrying.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::BufferTooSmall { .. } | Self::Tokenize(_) | Self::Registration { .. } => true,
            Self::Decode(failure) => failure.is_context_full(),
            _ => false,
        }
    }

    pub(crate) fn load(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Load {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
