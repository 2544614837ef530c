//! Load and context parameters.
//!
//! Both structs deserialize from the `[engine.model]` and `[engine.context]`
//! sections of the config file. Enum discriminants (`as_raw`) follow the
//! llama.cpp C header so they can be handed straight to the engine.

use serde::{Deserialize, Serialize};

/// Upper bound on parallel sequences per context (llama.cpp `LLAMA_MAX_SEQ`).
pub const MAX_SEQUENCES: u32 = 256;

/// How model layers are split across multiple devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitMode {
    /// Single device only.
    None,
    /// Split whole layers across devices.
    #[default]
    Layer,
    /// Split rows of each tensor across devices.
    Row,
}

impl SplitMode {
    pub fn as_raw(self) -> i32 {
        match self {
            Self::None => 0,
            Self::Layer => 1,
            Self::Row => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RopeScalingType {
    #[default]
    Unspecified,
    None,
    Linear,
    Yarn,
    LongRope,
}

impl RopeScalingType {
    pub fn as_raw(self) -> i32 {
        match self {
            Self::Unspecified => -1,
            Self::None => 0,
            Self::Linear => 1,
            Self::Yarn => 2,
            Self::LongRope => 3,
        }
    }
}

/// How per-token hidden states are reduced to one vector per sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolingType {
    /// Use whatever the model file declares.
    #[default]
    Unspecified,
    /// No pooling: only per-token embeddings are available.
    None,
    Mean,
    /// First token of the sequence.
    Cls,
    /// Last token of the sequence.
    Last,
    /// Reranking score from a classifier head.
    Rank,
}

impl PoolingType {
    pub fn as_raw(self) -> i32 {
        match self {
            Self::Unspecified => -1,
            Self::None => 0,
            Self::Mean => 1,
            Self::Cls => 2,
            Self::Last => 3,
            Self::Rank => 4,
        }
    }

    /// Inverse of [`as_raw`](Self::as_raw). Unknown values map to `Unspecified`.
    pub fn from_raw(raw: i64) -> Self {
        match raw {
            0 => Self::None,
            1 => Self::Mean,
            2 => Self::Cls,
            3 => Self::Last,
            4 => Self::Rank,
            _ => Self::Unspecified,
        }
    }
}

impl std::fmt::Display for PoolingType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unspecified => "unspecified",
            Self::None => "none",
            Self::Mean => "mean",
            Self::Cls => "cls",
            Self::Last => "last",
            Self::Rank => "rank",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionType {
    #[default]
    Unspecified,
    Causal,
    NonCausal,
}

impl AttentionType {
    pub fn as_raw(self) -> i32 {
        match self {
            Self::Unspecified => -1,
            Self::Causal => 0,
            Self::NonCausal => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlashAttnType {
    #[default]
    Auto,
    Disabled,
    Enabled,
}

impl FlashAttnType {
    pub fn as_raw(self) -> i32 {
        match self {
            Self::Auto => -1,
            Self::Disabled => 0,
            Self::Enabled => 1,
        }
    }
}

/// Element type of the K/V cache tensors (subset of `ggml_type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KvCacheType {
    F32,
    #[default]
    F16,
    Bf16,
    Q8_0,
    Q5_1,
    Q5_0,
    Q4_1,
    Q4_0,
}

impl KvCacheType {
    /// `ggml_type` enum value.
    pub fn as_raw(self) -> i32 {
        match self {
            Self::F32 => 0,
            Self::F16 => 1,
            Self::Q4_0 => 2,
            Self::Q4_1 => 3,
            Self::Q5_0 => 6,
            Self::Q5_1 => 7,
            Self::Q8_0 => 8,
            Self::Bf16 => 30,
        }
    }

    pub fn is_quantized(self) -> bool {
        !matches!(self, Self::F32 | Self::F16 | Self::Bf16)
    }
}

/// Parameters for loading model weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelParams {
    /// Backend device names to offload to. Empty means "engine default".
    pub devices: Vec<String>,
    /// Number of layers to offload to accelerators (`-1` = all).
    pub n_gpu_layers: i32,
    pub split_mode: SplitMode,
    /// Device index used for the whole model when `split_mode = none`.
    pub main_gpu: i32,
    /// Proportion of the model to put on each device.
    pub tensor_split: Vec<f32>,
    /// Load the vocabulary only, no weights.
    pub vocab_only: bool,
    pub use_mmap: bool,
    pub use_mlock: bool,
    /// Validate tensor data while loading.
    pub check_tensors: bool,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            n_gpu_layers: 0,
            split_mode: SplitMode::Layer,
            main_gpu: 0,
            tensor_split: Vec::new(),
            vocab_only: false,
            use_mmap: true,
            use_mlock: false,
            check_tensors: false,
        }
    }
}

impl ModelParams {
    /// Reject device/layer split requests that no backend could honor.
    pub fn validate(&self) -> Result<(), String> {
        if self.n_gpu_layers < -1 {
            return Err(format!("n_gpu_layers must be >= -1, got {}", self.n_gpu_layers));
        }
        if self.main_gpu < 0 {
            return Err(format!("main_gpu must be >= 0, got {}", self.main_gpu));
        }
        if !self.devices.is_empty() && self.main_gpu as usize >= self.devices.len() {
            return Err(format!(
                "main_gpu {} is out of range for {} device(s)",
                self.main_gpu,
                self.devices.len()
            ));
        }
        if !self.tensor_split.is_empty() {
            if self.split_mode == SplitMode::None {
                return Err("tensor_split requires split_mode = layer or row".into());
            }
            if !self.devices.is_empty() && self.tensor_split.len() > self.devices.len() {
                return Err(format!(
                    "tensor_split has {} entries but only {} device(s) are configured",
                    self.tensor_split.len(),
                    self.devices.len()
                ));
            }
            if self.tensor_split.iter().any(|p| !p.is_finite() || *p < 0.0) {
                return Err("tensor_split entries must be finite and non-negative".into());
            }
        }
        Ok(())
    }
}

/// Parameters for one inference context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextParams {
    /// Context size in tokens (`0` = the model's trained context).
    pub n_ctx: u32,
    /// Logical maximum batch size submitted to decode.
    pub n_batch: u32,
    /// Physical maximum batch size.
    pub n_ubatch: u32,
    /// Maximum number of distinct sequences.
    pub n_seq_max: u32,
    pub n_threads: i32,
    pub n_threads_batch: i32,
    pub rope_scaling_type: RopeScalingType,
    pub pooling_type: PoolingType,
    pub attention_type: AttentionType,
    pub flash_attn: FlashAttnType,
    pub rope_freq_base: f32,
    pub rope_freq_scale: f32,
    pub yarn_ext_factor: f32,
    pub yarn_attn_factor: f32,
    pub yarn_beta_fast: f32,
    pub yarn_beta_slow: f32,
    pub yarn_orig_ctx: u32,
    pub type_k: KvCacheType,
    pub type_v: KvCacheType,
    /// Extract embeddings together with logits.
    pub embeddings: bool,
    /// Keep the KV cache on the accelerator.
    pub offload_kqv: bool,
    /// Disable performance timings.
    pub no_perf: bool,
    pub op_offload: bool,
    /// Full-size sliding-window-attention cache.
    pub swa_full: bool,
    /// Single KV buffer shared across sequences.
    pub kv_unified: bool,
}

impl Default for ContextParams {
    fn default() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get().min(8) as i32)
            .unwrap_or(4);
        Self {
            n_ctx: 2048,
            n_batch: 2048,
            n_ubatch: 512,
            n_seq_max: 1,
            n_threads: threads,
            n_threads_batch: threads,
            rope_scaling_type: RopeScalingType::Unspecified,
            pooling_type: PoolingType::Unspecified,
            attention_type: AttentionType::Unspecified,
            flash_attn: FlashAttnType::Auto,
            rope_freq_base: 0.0,
            rope_freq_scale: 0.0,
            yarn_ext_factor: -1.0,
            yarn_attn_factor: 1.0,
            yarn_beta_fast: 32.0,
            yarn_beta_slow: 1.0,
            yarn_orig_ctx: 0,
            type_k: KvCacheType::F16,
            type_v: KvCacheType::F16,
            embeddings: true,
            offload_kqv: true,
            no_perf: true,
            op_offload: true,
            swa_full: true,
            kv_unified: false,
        }
    }
}

impl ContextParams {
    /// Engine-independent checks run before a backend sees the parameters.
    pub fn validate(&self) -> Result<(), String> {
        if self.n_batch == 0 {
            return Err("n_batch must be > 0".into());
        }
        if self.n_ubatch == 0 {
            return Err("n_ubatch must be > 0".into());
        }
        if self.n_seq_max == 0 || self.n_seq_max > MAX_SEQUENCES {
            return Err(format!(
                "n_seq_max must be within 1..={MAX_SEQUENCES}, got {}",
                self.n_seq_max
            ));
        }
        if self.n_threads <= 0 || self.n_threads_batch <= 0 {
            return Err("thread counts must be > 0".into());
        }
        if self.type_v.is_quantized() && self.flash_attn == FlashAttnType::Disabled {
            return Err(format!(
                "V cache type {:?} requires flash attention",
                self.type_v
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_values_match_engine_header() {
        assert_eq!(SplitMode::Row.as_raw(), 2);
        assert_eq!(RopeScalingType::LongRope.as_raw(), 3);
        assert_eq!(PoolingType::Unspecified.as_raw(), -1);
        assert_eq!(PoolingType::Rank.as_raw(), 4);
        assert_eq!(AttentionType::NonCausal.as_raw(), 1);
        assert_eq!(FlashAttnType::Auto.as_raw(), -1);
        assert_eq!(KvCacheType::Q8_0.as_raw(), 8);
    }

    #[test]
    fn pooling_round_trips_through_raw() {
        for p in [
            PoolingType::None,
            PoolingType::Mean,
            PoolingType::Cls,
            PoolingType::Last,
            PoolingType::Rank,
        ] {
            assert_eq!(PoolingType::from_raw(p.as_raw() as i64), p);
        }
        assert_eq!(PoolingType::from_raw(99), PoolingType::Unspecified);
    }

    #[test]
    fn default_params_validate() {
        assert!(ModelParams::default().validate().is_ok());
        assert!(ContextParams::default().validate().is_ok());
    }

    #[test]
    fn quantized_v_cache_needs_flash_attention() {
        let params = ContextParams {
            type_v: KvCacheType::Q8_0,
            flash_attn: FlashAttnType::Disabled,
            ..Default::default()
        };
        assert!(params.validate().is_err());

        let params = ContextParams {
            type_v: KvCacheType::Q8_0,
            flash_attn: FlashAttnType::Enabled,
            ..Default::default()
        };
        assert!(params.validate().is_ok());
    }

    #[test]
    fn seq_max_bounds() {
        let zero = ContextParams { n_seq_max: 0, ..Default::default() };
        assert!(zero.validate().is_err());
        let too_many = ContextParams { n_seq_max: MAX_SEQUENCES + 1, ..Default::default() };
        assert!(too_many.validate().is_err());
    }

    #[test]
    fn tensor_split_needs_split_mode() {
        let params = ModelParams {
            split_mode: SplitMode::None,
            tensor_split: vec![0.5, 0.5],
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn main_gpu_must_index_devices() {
        let params = ModelParams {
            devices: vec!["CUDA0".into()],
            main_gpu: 1,
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn parse_from_toml() {
        let params: ContextParams = toml::from_str(
            r#"
n_ctx = 512
pooling_type = "cls"
flash_attn = "disabled"
type_k = "q8_0"
"#,
        )
        .unwrap();
        assert_eq!(params.n_ctx, 512);
        assert_eq!(params.pooling_type, PoolingType::Cls);
        assert_eq!(params.flash_attn, FlashAttnType::Disabled);
        assert_eq!(params.type_k, KvCacheType::Q8_0);
        assert!(params.embeddings);
    }
}
