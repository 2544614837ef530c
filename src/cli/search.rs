use anyhow::{bail, Result};

use alfred_embed::config::AlfredConfig;
use alfred_embed::db;
use alfred_embed::embedding::Embedder;
use alfred_embed::memory::search;

/// Embed a query and print the nearest stored texts.
pub async fn search(
    config: AlfredConfig,
    query: String,
    limit: Option<usize>,
    min_similarity: Option<f64>,
) -> Result<()> {
    let limit = limit.unwrap_or(config.search.default_limit);
    let min_similarity = min_similarity.unwrap_or(config.search.min_similarity);

    let hits = tokio::task::spawn_blocking(move || {
        let model = super::load_model(&config)?;
        let conn = db::open_existing_database(config.resolved_db_path())?;
        let mut embedder = Embedder::new(&model, &config.engine.context, config.pipeline.clone())?;
        let query_embedding = embedder.embed(&query)?;
        search::search_similar(&conn, &query_embedding, limit, min_similarity)
    })
    .await??;

    if hits.is_empty() {
        println!("No results found.");
        return Ok(());
    }

    println!("Found {} result(s)\n", hits.len());
    for (i, hit) in hits.iter().enumerate() {
        let preview: String = hit.memory.content.chars().take(120).collect();
        let ellipsis = if hit.memory.content.chars().count() > 120 { "..." } else { "" };
        println!("  {}. {} (similarity: {:.4})", i + 1, hit.memory.id, hit.similarity);
        println!("     {preview}{ellipsis}");
        println!();
    }

    Ok(())
}

/// Print one memory as JSON.
pub fn get(config: &AlfredConfig, id: &str) -> Result<()> {
    let conn = db::open_existing_database(config.resolved_db_path())?;
    match search::get_memory(&conn, id)? {
        Some(memory) => println!("{}", serde_json::to_string_pretty(&memory)?),
        None => bail!("memory not found: {id}"),
    }
    Ok(())
}

pub fn list(config: &AlfredConfig, limit: usize, offset: usize) -> Result<()> {
    let conn = db::open_existing_database(config.resolved_db_path())?;
    let memories = search::list_memories(&conn, limit, offset)?;
    if memories.is_empty() {
        println!("No memories.");
    }
    for memory in memories {
        let preview: String = memory.content.chars().take(80).collect();
        println!("{}  {}  {preview}", memory.id, memory.created_at);
    }
    Ok(())
}
