use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;

use alfred_embed::config::AlfredConfig;
use alfred_embed::db::{self, meta};
use alfred_embed::embedding::{normalize_text, Embedder};
use alfred_embed::memory::store;

/// One JSON-lines record. Plain-text lines become `content` with no metadata.
#[derive(Debug, Deserialize)]
struct ImportLine {
    content: String,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
}

fn parse_lines(input: &str) -> Vec<ImportLine> {
    input
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            if line.starts_with('{') {
                if let Ok(parsed) = serde_json::from_str::<ImportLine>(line) {
                    return parsed;
                }
            }
            ImportLine {
                content: line.to_string(),
                metadata: None,
            }
        })
        .collect()
}

/// Embed and store every non-blank line of `file`.
///
/// Each worker owns one inference context; a single writer thread owns the
/// database connection.
pub async fn import(config: AlfredConfig, file: PathBuf, workers: Option<usize>) -> Result<()> {
    let input = std::fs::read_to_string(&file)
        .with_context(|| format!("failed to read import file: {}", file.display()))?;
    let lines = parse_lines(&input);
    if lines.is_empty() {
        println!("Nothing to import.");
        return Ok(());
    }

    let requested = workers.unwrap_or(config.import.workers).max(1);

    let (imported, failed) = tokio::task::spawn_blocking(move || -> Result<(usize, usize)> {
        let model = super::load_model(&config)?;
        let mut conn = db::open_database(config.resolved_db_path(), model.n_embd() as usize)?;

        // Fail fast on a mismatch; the first stored line records the identity.
        let identity = model.identity();
        if let Some(stored) = meta::get_embedding_model(&conn)? {
            if stored != identity {
                bail!("database holds embeddings from {stored}, refusing to mix in {identity}");
            }
        }

        let workers = if requested > 1 && !model.supports_concurrent_contexts() {
            tracing::warn!(
                backend = model.backend_name(),
                requested,
                "backend does not run contexts concurrently, importing with one worker"
            );
            1
        } else {
            requested.min(lines.len())
        };

        println!("Importing {} line(s) with {workers} worker(s)...", lines.len());
        let pb = ProgressBar::new(lines.len() as u64);
        if let Ok(style) = ProgressStyle::default_bar().template("  {bar:40.cyan/blue} {pos}/{len} ({eta})") {
            pb.set_style(style.progress_chars("##-"));
        }

        let next = AtomicUsize::new(0);
        let mut imported = 0usize;
        let mut failed = 0usize;

        std::thread::scope(|scope| {
            let (tx, rx) = mpsc::channel::<(usize, Result<Vec<f32>>)>();

            for worker in 0..workers {
                let tx = tx.clone();
                let (model, lines, next) = (&model, &lines, &next);
                let context_params = &config.engine.context;
                let options = config.pipeline.clone();
                scope.spawn(move || {
                    let mut embedder = match Embedder::new(model, context_params, options) {
                        Ok(embedder) => embedder,
                        Err(e) => {
                            tracing::error!(worker, error = %e, "failed to create inference context");
                            return;
                        }
                    };
                    loop {
                        let i = next.fetch_add(1, Ordering::Relaxed);
                        let Some(line) = lines.get(i) else { break };
                        if tx.send((i, embedder.embed(&line.content))).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(tx);

            for (i, result) in rx {
                let line = &lines[i];
                let stored = result.and_then(|vector| {
                    store::store_embedding_from(
                        &mut conn,
                        &identity,
                        &normalize_text(&line.content),
                        line.metadata.as_ref(),
                        &vector,
                    )
                });
                match stored {
                    Ok(_) => imported += 1,
                    Err(e) => {
                        tracing::warn!(line = i + 1, error = %e, "skipping line");
                        failed += 1;
                    }
                }
                pb.inc(1);
            }
        });

        pb.finish_and_clear();
        // Lines never handed to a worker (every context failed to start).
        failed += lines.len() - imported - failed;
        Ok((imported, failed))
    })
    .await??;

    println!("Import complete: {imported} imported, {failed} failed");
    Ok(())
}
