//! CLI `delete`, `vacuum` and `backup` commands.

use anyhow::Result;
use std::path::Path;

use alfred_embed::config::AlfredConfig;
use alfred_embed::db;
use alfred_embed::memory::forget;

pub fn delete(config: &AlfredConfig, id: &str, hard: bool) -> Result<()> {
    let mut conn = db::open_existing_database(config.resolved_db_path())?;
    let result = forget::delete_memory(&mut conn, id, hard)?;
    let kind = if result.hard_deleted { "Removed" } else { "Deleted" };
    println!("{kind} {}", result.id);
    Ok(())
}

pub fn vacuum(config: &AlfredConfig) -> Result<()> {
    let conn = db::open_existing_database(config.resolved_db_path())?;
    let before = db::database_size(&conn)?;
    db::vacuum(&conn)?;
    let after = db::database_size(&conn)?;
    println!("Vacuum complete: {before} -> {after} bytes");
    Ok(())
}

pub fn backup(config: &AlfredConfig, dest: &Path) -> Result<()> {
    let conn = db::open_existing_database(config.resolved_db_path())?;
    db::backup_to(&conn, dest)?;
    println!("Backup written to {}", dest.display());
    Ok(())
}
