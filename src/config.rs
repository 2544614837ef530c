use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::embedding::PipelineOptions;
use crate::runtime::{BackendKind, ContextParams, ModelParams};

/// File name of the default embedding model.
pub const DEFAULT_MODEL_FILE: &str = "Qwen3-Embedding-0.6B-f16.gguf";

/// Where `model download` fetches the default model from.
pub const DEFAULT_MODEL_URL: &str =
    "https://huggingface.co/Qwen/Qwen3-Embedding-0.6B-GGUF/resolve/main/Qwen3-Embedding-0.6B-f16.gguf";

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AlfredConfig {
    pub logging: LoggingConfig,
    pub storage: StorageConfig,
    pub engine: EngineConfig,
    pub pipeline: PipelineOptions,
    pub import: ImportConfig,
    pub search: SearchConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EngineConfig {
    pub backend: BackendKind,
    pub model_path: String,
    pub model_url: String,
    /// Let the llama backend run one context per import worker concurrently.
    pub concurrent_contexts: bool,
    pub model: ModelParams,
    pub context: ContextParams,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ImportConfig {
    pub workers: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SearchConfig {
    pub default_limit: usize,
    pub min_similarity: f64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db_path = default_alfred_dir()
            .join("memory.db")
            .to_string_lossy()
            .into_owned();
        Self { db_path }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        let model_path = default_alfred_dir()
            .join("Models")
            .join(DEFAULT_MODEL_FILE)
            .to_string_lossy()
            .into_owned();
        Self {
            backend: BackendKind::default(),
            model_path,
            model_url: DEFAULT_MODEL_URL.into(),
            concurrent_contexts: false,
            model: ModelParams::default(),
            context: ContextParams::default(),
        }
    }
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self { workers: 1 }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: 5,
            min_similarity: 0.7,
        }
    }
}

/// Returns `<data_dir>/Alfred/`.
pub fn default_alfred_dir() -> PathBuf {
    dirs::data_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Alfred")
}

/// Returns the default config file path: `<data_dir>/Alfred/config.toml`
pub fn default_config_path() -> PathBuf {
    default_alfred_dir().join("config.toml")
}

impl AlfredConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            AlfredConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides (ALFRED_DB, ALFRED_LOG_LEVEL,
    /// ALFRED_BACKEND, QWEN_EMBED_MODEL, QWEN_EMBED_N_GPU).
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(val) = var("ALFRED_DB") {
            self.storage.db_path = val;
        }
        if let Some(val) = var("ALFRED_LOG_LEVEL") {
            self.logging.log_level = val;
        }
        if let Some(val) = var("ALFRED_BACKEND") {
            match val.parse() {
                Ok(kind) => self.engine.backend = kind,
                Err(e) => warn!("ignoring ALFRED_BACKEND: {e}"),
            }
        }
        if let Some(val) = var("QWEN_EMBED_MODEL") {
            self.engine.model_path = val;
        }
        if let Some(val) = var("QWEN_EMBED_N_GPU") {
            match val.trim().parse() {
                Ok(n) => self.engine.model.n_gpu_layers = n,
                Err(_) => warn!("ignoring QWEN_EMBED_N_GPU={val}: not an integer"),
            }
        }
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }

    pub fn resolved_model_path(&self) -> PathBuf {
        expand_tilde(&self.engine.model_path)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::PoolingType;
    use std::collections::HashMap;

    #[test]
    fn default_config_is_valid() {
        let config = AlfredConfig::default();
        assert_eq!(config.logging.log_level, "info");
        assert_eq!(config.engine.backend, BackendKind::Reference);
        assert_eq!(config.engine.context.n_ctx, 2048);
        assert_eq!(config.engine.model.n_gpu_layers, 0);
        assert_eq!(config.search.default_limit, 5);
        assert!(config.storage.db_path.ends_with("memory.db"));
        assert!(config.engine.model_path.ends_with(DEFAULT_MODEL_FILE));
        assert!(config.engine.context.validate().is_ok());
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[logging]
log_level = "debug"

[storage]
db_path = "/tmp/test.db"

[engine]
backend = "llama"

[engine.context]
n_ctx = 512
pooling_type = "last"

[pipeline]
truncate = false

[import]
workers = 4
"#;
        let config: AlfredConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.logging.log_level, "debug");
        assert_eq!(config.storage.db_path, "/tmp/test.db");
        assert_eq!(config.engine.backend, BackendKind::Llama);
        assert_eq!(config.engine.context.n_ctx, 512);
        assert_eq!(config.engine.context.pooling_type, PoolingType::Last);
        assert!(!config.pipeline.truncate);
        assert_eq!(config.import.workers, 4);
        // defaults still apply for unset fields
        assert_eq!(config.engine.context.n_batch, 2048);
        assert!(config.pipeline.normalize);
        assert_eq!(config.search.min_similarity, 0.7);
    }

    #[test]
    fn overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("ALFRED_DB", "/tmp/override.db"),
            ("ALFRED_LOG_LEVEL", "trace"),
            ("ALFRED_BACKEND", "llama"),
            ("QWEN_EMBED_MODEL", "/models/q.gguf"),
            ("QWEN_EMBED_N_GPU", " 99 "),
        ]
        .into_iter()
        .collect();

        let mut config = AlfredConfig::default();
        config.apply_overrides(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.storage.db_path, "/tmp/override.db");
        assert_eq!(config.logging.log_level, "trace");
        assert_eq!(config.engine.backend, BackendKind::Llama);
        assert_eq!(config.engine.model_path, "/models/q.gguf");
        assert_eq!(config.engine.model.n_gpu_layers, 99);
    }

    #[test]
    fn bad_overrides_are_ignored() {
        let mut config = AlfredConfig::default();
        config.apply_overrides(|k| match k {
            "ALFRED_BACKEND" => Some("cuda".into()),
            "QWEN_EMBED_N_GPU" => Some("lots".into()),
            _ => None,
        });
        assert_eq!(config.engine.backend, BackendKind::Reference);
        assert_eq!(config.engine.model.n_gpu_layers, 0);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = AlfredConfig::load_from(tmp.path().join("nope.toml")).unwrap();
        assert_eq!(config.import.workers, 1);
    }

    #[test]
    fn tilde_expands_to_home() {
        assert_eq!(expand_tilde("/abs/path"), PathBuf::from("/abs/path"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde("~/x.db"), home.join("x.db"));
        }
    }
}
