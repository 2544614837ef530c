pub mod doctor;
pub mod embed;
pub mod import;
pub mod maintenance;
pub mod model;
pub mod search;
pub mod stats;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use tokio::io::AsyncWriteExt;

use alfred_embed::config::{expand_tilde, AlfredConfig, EngineConfig};
use alfred_embed::runtime::{Engine, Model};

/// Initialize the configured backend and load the model, with a progress bar.
/// Blocking; call from `spawn_blocking`.
pub fn load_model(config: &AlfredConfig) -> Result<Model> {
    let engine = Engine::init_with(config.engine.backend, config.engine.concurrent_contexts)
        .context("failed to initialize inference engine")?;
    let path = config.resolved_model_path();

    let pb = ProgressBar::new(100);
    if let Ok(style) = ProgressStyle::default_bar().template("  loading model {bar:40.cyan/blue} {percent}%") {
        pb.set_style(style.progress_chars("##-"));
    }
    let model = engine
        .load_model_with_progress(&path, &config.engine.model, |p| {
            pb.set_position((p * 100.0) as u64);
            true
        })
        .with_context(|| format!("run `alfred-embed model download` or set QWEN_EMBED_MODEL (tried {})", path.display()));
    pb.finish_and_clear();
    model
}

/// Download the GGUF embedding model to the configured model path.
pub async fn model_download(config: &EngineConfig) -> Result<()> {
    let model_path = expand_tilde(&config.model_path);
    if let Some(dir) = model_path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create model dir: {}", dir.display()))?;
    }

    if model_path.exists() {
        println!("Model already exists at {}", model_path.display());
        return Ok(());
    }

    println!("Downloading {} ...", config.model_url);
    download_file(&config.model_url, &model_path).await?;
    println!("Model saved to {}", model_path.display());
    Ok(())
}

/// Download a file from a URL with progress bar. Uses atomic write (tmp + rename).
async fn download_file(url: &str, dest: &Path) -> Result<()> {
    let mut response = reqwest::get(url)
        .await
        .with_context(|| format!("HTTP request failed for {url}"))?;

    anyhow::ensure!(
        response.status().is_success(),
        "download failed with HTTP {}",
        response.status()
    );

    let pb = match response.content_length() {
        Some(size) => {
            let pb = ProgressBar::new(size);
            if let Ok(style) =
                ProgressStyle::default_bar().template("  {bar:40.cyan/blue} {bytes}/{total_bytes} ({eta})")
            {
                pb.set_style(style.progress_chars("##-"));
            }
            pb
        }
        None => ProgressBar::new_spinner(),
    };

    let tmp_path = dest.with_extension("tmp");
    let mut file = tokio::fs::File::create(&tmp_path)
        .await
        .with_context(|| format!("failed to create temp file: {}", tmp_path.display()))?;

    while let Some(chunk) = response.chunk().await.context("error reading response")? {
        file.write_all(&chunk).await.context("error writing to file")?;
        pb.inc(chunk.len() as u64);
    }

    file.flush().await?;
    drop(file);

    let installed = install_download(&tmp_path, dest)
        .await
        .with_context(|| format!("downloaded file from {url} was not installed"));
    pb.finish_and_clear();
    installed
}

/// Move a finished download into place. A file the runtime could not load
/// is deleted instead.
async fn install_download(tmp_path: &Path, dest: &Path) -> Result<()> {
    if let Err(e) = alfred_embed::runtime::gguf::read_header(tmp_path) {
        if let Err(rm) = tokio::fs::remove_file(tmp_path).await {
            tracing::warn!(path = %tmp_path.display(), error = %rm, "failed to remove partial download");
        }
        return Err(anyhow::Error::new(e).context("not a GGUF model"));
    }

    tokio::fs::rename(tmp_path, dest)
        .await
        .context("failed to rename temp file")
}
