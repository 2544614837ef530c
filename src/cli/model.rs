//! CLI `model inspect` and `model stub` commands.

use anyhow::{bail, Context, Result};
use std::path::Path;

use alfred_embed::runtime::gguf::{self, GgufWriter};

/// Print the GGUF header of a model file.
pub fn inspect(path: &Path) -> Result<()> {
    let header = gguf::read_header(path).with_context(|| format!("failed to read {}", path.display()))?;

    println!("{}", path.display());
    println!("  GGUF version:  {}", header.version);
    println!("  Tensors:       {}", header.tensor_count);
    println!("  Metadata keys: {}", header.metadata.len());
    println!();
    for (key, value) in &header.metadata {
        let mut rendered = value.to_string();
        // Vocab arrays run to hundreds of thousands of entries.
        if rendered.len() > 120 {
            rendered = format!("{}...", rendered.chars().take(117).collect::<String>());
        }
        println!("  {key} = {rendered}");
    }
    Ok(())
}

/// Write a metadata-only model file that the reference backend can load.
pub fn stub(path: &Path, arch: &str, dim: u32, context_length: u32) -> Result<()> {
    if path.exists() {
        bail!("refusing to overwrite {}", path.display());
    }
    if dim == 0 || context_length == 0 {
        bail!("--dim and --context-length must be greater than zero");
    }
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }

    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| arch.to_string());
    GgufWriter::new()
        .add_str("general.architecture", arch)
        .add_str("general.name", name)
        .add_u32(format!("{arch}.embedding_length"), dim)
        .add_u32(format!("{arch}.context_length"), context_length)
        .write_file(path)
        .with_context(|| format!("failed to write {}", path.display()))?;

    println!("Wrote {arch} stub model ({dim} dimensions) to {}", path.display());
    Ok(())
}
