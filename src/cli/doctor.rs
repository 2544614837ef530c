//! CLI `doctor` command: check the model file, sqlite-vec and the database.

use anyhow::{Context, Result};
use rusqlite::Connection;

use alfred_embed::config::AlfredConfig;
use alfred_embed::db::{self, registrar};
use alfred_embed::runtime::gguf;

/// Run diagnostics and print a health report.
pub fn doctor(config: &AlfredConfig) -> Result<()> {
    println!("Alfred Embed Health Report");
    println!("==========================");
    println!();

    let model_path = config.resolved_model_path();
    println!("Backend:           {}", config.engine.backend);
    println!("Model:             {}", model_path.display());
    let header = if model_path.exists() {
        match gguf::read_header(&model_path) {
            Ok(header) => {
                println!("  Architecture:    {}", header.architecture().unwrap_or("(missing)"));
                println!("  Name:            {}", header.name().unwrap_or("(unnamed)"));
                match header.embedding_length() {
                    Some(dim) => println!("  Dimensions:      {dim}"),
                    None => println!("  Dimensions:      (missing)"),
                }
                if let Some(ctx) = header.context_length() {
                    println!("  Trained context: {ctx}");
                }
                Some(header)
            }
            Err(e) => {
                println!("  INVALID: {e}");
                None
            }
        }
    } else {
        println!("  not found. Run `alfred-embed model download`.");
        None
    };
    println!();

    let probe = Connection::open_in_memory()?;
    match registrar::register(&probe) {
        Ok(_) => println!("sqlite-vec:        {}", registrar::vec_version(&probe)?),
        Err(e) => println!("sqlite-vec:        FAILED ({e})"),
    }
    println!();

    let db_path = config.resolved_db_path();
    if !db_path.exists() {
        println!("Database:          not found at {}", db_path.display());
        println!("Run `alfred-embed embed <text>` to initialize.");
        return Ok(());
    }

    let file_size = std::fs::metadata(&db_path).map(|m| m.len()).unwrap_or(0);
    let conn = db::open_existing_database(&db_path).context("failed to open database (may be corrupt)")?;
    let report = db::check_database_health(&conn).context("failed to run health check")?;

    println!("Database:          {}", db_path.display());
    println!("File size:         {}", format_bytes(file_size));
    println!("Schema version:    {}", report.schema_version);
    println!(
        "Embedding model:   {}",
        report.embedding_model.as_deref().unwrap_or("(not set)")
    );
    if let Some(dim) = report.embedding_dim {
        println!("Dimensions:        {dim}");
        let model_dim = header.as_ref().and_then(|h| h.embedding_length());
        if let Some(model_dim) = model_dim {
            if model_dim as usize != dim {
                println!("  WARNING: configured model produces {model_dim}-dimensional vectors.");
            }
        }
    }
    println!();
    println!("Row counts:");
    println!("  Memories:        {}", report.memory_count);
    println!("  Vectors:         {}", report.vector_count);
    println!();
    if report.integrity_ok {
        println!("Integrity check:   PASSED");
    } else {
        println!("Integrity check:   FAILED");
        println!();
        println!("Recovery steps:");
        println!("  1. Restore from a backup made with `alfred-embed backup <file>`");
        println!("  2. Or move the database aside and re-import your texts with `alfred-embed import`");
    }

    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
