use anyhow::Result;

use alfred_embed::config::AlfredConfig;
use alfred_embed::db;
use alfred_embed::memory::stats::memory_stats;

/// Display memory statistics in the terminal.
pub fn stats(config: &AlfredConfig) -> Result<()> {
    let conn = db::open_existing_database(config.resolved_db_path())?;
    let response = memory_stats(&conn)?;

    println!("Memory Statistics");
    println!("{}", "=".repeat(40));
    println!("  Total memories:      {}", response.total_memories);
    println!("  Active:              {}", response.active_memories);
    println!("  Deleted:             {}", response.deleted_memories);
    println!("  Vectors:             {}", response.vectors);
    println!();

    println!(
        "Embedding model:       {}",
        response.embedding_model.as_deref().unwrap_or("(not set)")
    );
    if let Some(dim) = response.embedding_dim {
        println!("Dimensions:            {dim}");
    }
    println!("Database size:         {} bytes", response.db_size_bytes);

    if let Some(ref oldest) = response.oldest_memory {
        println!("Oldest memory:         {oldest}");
    }
    if let Some(ref newest) = response.newest_memory {
        println!("Newest memory:         {newest}");
    }

    Ok(())
}
