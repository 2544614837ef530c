//! Local text embeddings for Alfred, stored in SQLite with sqlite-vec.
//!
//! The crate is a thin, safe bridge between a GGUF embedding model and a
//! vector store:
//!
//! | Layer | Role |
//! |-------|------|
//! | [`runtime`] | Model loading, inference contexts, tokenization, decode/encode and embedding reads |
//! | [`db`] | Connection setup, sqlite-vec registration, schema and health checks |
//! | [`embedding`] | `text -> tokens -> batch -> embedding -> store` |
//! | [`memory`] | Insert, k-nearest-neighbour search, delete and statistics over stored texts |
//! | [`config`] | TOML config plus environment overrides |
//!
//! # Example
//!
//! ```no_run
//! use alfred_embed::{db, embedding::{Embedder, PipelineOptions}, runtime};
//!
//! # fn main() -> anyhow::Result<()> {
//! let engine = runtime::Engine::reference();
//! let model = engine.load_model("model.gguf", &runtime::ModelParams::default())?;
//! let mut conn = db::open_database("alfred.db", model.n_embd() as usize)?;
//! let mut embedder = Embedder::new(&model, &runtime::ContextParams::default(), PipelineOptions::default())?;
//! let stored = embedder.embed_and_store("the quick brown fox", &mut conn, None)?;
//! println!("{} ({} dims)", stored.id, stored.dimensions);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod db;
pub mod embedding;
pub mod memory;
pub mod runtime;
