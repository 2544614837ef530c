use anyhow::{Context, Result};

use alfred_embed::config::AlfredConfig;
use alfred_embed::db;
use alfred_embed::embedding::Embedder;

/// Embed one text and store it.
pub async fn embed(config: AlfredConfig, text: String, metadata: Option<String>) -> Result<()> {
    let metadata: Option<serde_json::Value> = metadata
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .context("--metadata must be valid JSON")?;

    let stored = tokio::task::spawn_blocking(move || {
        let model = super::load_model(&config)?;
        let mut conn = db::open_database(config.resolved_db_path(), model.n_embd() as usize)?;
        let mut embedder = Embedder::new(&model, &config.engine.context, config.pipeline.clone())?;
        embedder.embed_and_store(&text, &mut conn, metadata.as_ref())
    })
    .await??;

    println!("Stored {} ({} dimensions)", stored.id, stored.dimensions);
    Ok(())
}

/// Print the token ids and pieces for a text.
pub async fn tokenize(config: AlfredConfig, text: String, add_special: bool, parse_special: bool) -> Result<()> {
    let rows = tokio::task::spawn_blocking(move || -> Result<Vec<(i32, String)>> {
        let model = super::load_model(&config)?;
        let vocab = model.vocab();
        let tokens = vocab.tokenize(&text, add_special, parse_special)?;
        tokens
            .into_iter()
            .map(|t| Ok((t, vocab.token_to_piece(t, true)?)))
            .collect()
    })
    .await??;

    println!("{} token(s)", rows.len());
    for (id, piece) in rows {
        println!("  {id:>8}  {piece:?}");
    }
    Ok(())
}
