use serde::Deserialize;

use crate::error::{PipelineError, Result};

pub const DEFAULT_MODEL_ID: &str = "TinyLlama/TinyLlama-1.1B-Chat-v1.0";
pub const DEFAULT_REVISION: &str = "main";
pub const DEFAULT_PROMPT: &str = "Hello, What are you?";
pub const DEFAULT_MAX_NEW_TOKENS: usize = 25;
pub const DEFAULT_SEED: u64 = 42;

/// Model types with a native implementation in [`crate::llm::models::LlamaModel`].
const NATIVE_MODEL_TYPES: &[&str] = &["llama", "mistral", "qwen2"];

/// `eos_token_id` is either a single id or a list of ids.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum EosTokenId {
    Single(u32),
    Multiple(Vec<u32>),
}

impl EosTokenId {
    pub fn ids(&self) -> Vec<u32> {
        match self {
            EosTokenId::Single(id) => vec![*id],
            EosTokenId::Multiple(ids) => ids.clone(),
        }
    }
}

/// Hyper-parameters read from a checkpoint's `config.json`.
#[derive(Deserialize, Debug, Clone)]
pub struct ModelConfig {
    #[serde(default)]
    pub architectures: Vec<String>,
    #[serde(default)]
    pub model_type: String,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    pub num_hidden_layers: usize,
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    #[serde(default)]
    pub head_dim: Option<usize>,
    #[serde(rename = "hidden_act", default = "default_hidden_act")]
    pub hidden_activation: String,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f32,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    pub vocab_size: usize,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    #[serde(default)]
    pub torch_dtype: Option<String>,
    #[serde(default)]
    pub bos_token_id: Option<u32>,
    #[serde(default)]
    pub eos_token_id: Option<EosTokenId>,
    /// Present when the checkpoint ships its own modeling code.
    #[serde(default)]
    pub auto_map: Option<serde_json::Value>,
}

fn default_hidden_act() -> String {
    "silu".to_string()
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_rope_theta() -> f32 {
    10_000.0
}

fn default_max_position_embeddings() -> usize {
    2048
}

impl ModelConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim.unwrap_or_else(|| {
            self.hidden_size
                .checked_div(self.num_attention_heads)
                .unwrap_or(0)
        })
    }

    pub fn eos_token_ids(&self) -> Vec<u32> {
        self.eos_token_id
            .as_ref()
            .map(EosTokenId::ids)
            .unwrap_or_default()
    }

    pub fn ships_custom_code(&self) -> bool {
        self.auto_map.is_some()
    }

    /// Decides whether this checkpoint can be loaded natively.
    ///
    /// Bundled modeling code cannot be executed here, so `trust_remote_code`
    /// only changes which error is reported for architectures without a
    /// native implementation.
    pub fn check_loadable(&self, model_id: &str, trust_remote_code: bool) -> Result<()> {
        let native = NATIVE_MODEL_TYPES.contains(&self.model_type.as_str());
        let policy = match (native, self.ships_custom_code(), trust_remote_code) {
            (true, true, true) => {
                tracing::warn!(
                    "{} ships custom code for `{}`; using the native implementation instead",
                    model_id,
                    self.model_type
                );
                Ok(())
            }
            (true, _, _) => Ok(()),
            (false, true, false) => Err(PipelineError::RemoteCodeNotTrusted(model_id.to_string())),
            (false, true, true) => Err(PipelineError::RemoteCodeUnsupported {
                model_id: model_id.to_string(),
                model_type: self.model_type.clone(),
            }),
            (false, false, _) => Err(PipelineError::UnsupportedArchitecture(
                self.model_type.clone(),
            )),
        };
        policy.and_then(|()| self.check_attention_shape())
    }

    /// Head counts must divide evenly before any layer is built.
    fn check_attention_shape(&self) -> Result<()> {
        let heads = self.num_attention_heads;
        let kv_heads = self.num_kv_heads();
        if heads == 0 || kv_heads == 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "num_attention_heads ({}) and num_key_value_heads ({}) must be non-zero",
                heads, kv_heads
            )));
        }
        if heads % kv_heads != 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "{} attention heads cannot be grouped over {} kv heads",
                heads, kv_heads
            )));
        }
        if self.head_dim.is_none() && self.hidden_size % heads != 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "hidden_size {} is not divisible by {} attention heads",
                self.hidden_size, heads
            )));
        }
        if self.head_dim() == 0 || self.head_dim() % 2 != 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "head_dim {} must be even and non-zero for rotary embeddings",
                self.head_dim()
            )));
        }
        Ok(())
    }
}

/// The subset of `generation_config.json` that affects decoding.
///
/// The token budget is always chosen by the caller, so a checkpoint's
/// `max_new_tokens` is ignored.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct GenerationDefaults {
    #[serde(default)]
    pub do_sample: Option<bool>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub eos_token_id: Option<EosTokenId>,
}

/// Decoding parameters for one generation call.
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub max_new_tokens: usize,
    pub do_sample: bool,
    pub temperature: f64,
    pub top_p: f64,
    pub seed: u64,
    /// Stop ids on top of the ones the model reports.
    pub eos_token_ids: Vec<u32>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            do_sample: false,
            temperature: 1.0,
            top_p: 1.0,
            seed: DEFAULT_SEED,
            eos_token_ids: Vec::new(),
        }
    }
}

impl GenerationConfig {
    /// Overlays the checkpoint's `generation_config.json` values.
    pub fn with_defaults(mut self, defaults: &GenerationDefaults) -> Self {
        if let Some(do_sample) = defaults.do_sample {
            self.do_sample = do_sample;
        }
        if let Some(temperature) = defaults.temperature {
            self.temperature = temperature;
        }
        if let Some(top_p) = defaults.top_p {
            self.top_p = top_p;
        }
        if let Some(eos) = &defaults.eos_token_id {
            for id in eos.ids() {
                if !self.eos_token_ids.contains(&id) {
                    self.eos_token_ids.push(id);
                }
            }
        }
        self
    }

    pub fn is_greedy(&self) -> bool {
        !self.do_sample
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TINYLLAMA_CONFIG: &str = r#"{
        "architectures": ["LlamaForCausalLM"],
        "attention_bias": false,
        "bos_token_id": 1,
        "eos_token_id": 2,
        "hidden_act": "silu",
        "hidden_size": 2048,
        "initializer_range": 0.02,
        "intermediate_size": 5632,
        "max_position_embeddings": 2048,
        "model_type": "llama",
        "num_attention_heads": 32,
        "num_hidden_layers": 22,
        "num_key_value_heads": 4,
        "pretraining_tp": 1,
        "rms_norm_eps": 1e-05,
        "rope_scaling": null,
        "rope_theta": 10000.0,
        "tie_word_embeddings": false,
        "torch_dtype": "bfloat16",
        "transformers_version": "4.35.0",
        "use_cache": true,
        "vocab_size": 32000
    }"#;

    fn config_with(model_type: &str, auto_map: bool) -> ModelConfig {
        let mut cfg = ModelConfig::from_json(TINYLLAMA_CONFIG).unwrap();
        cfg.model_type = model_type.to_string();
        if auto_map {
            cfg.auto_map = Some(serde_json::json!({
                "AutoModelForCausalLM": "modeling_custom.CustomForCausalLM"
            }));
        }
        cfg
    }

    #[test]
    fn test_parse_tinyllama_config() {
        let cfg = ModelConfig::from_json(TINYLLAMA_CONFIG).unwrap();
        assert_eq!(cfg.model_type, "llama");
        assert_eq!(cfg.num_kv_heads(), 4);
        assert_eq!(cfg.head_dim(), 64);
        assert_eq!(cfg.eos_token_ids(), vec![2]);
        assert_eq!(cfg.torch_dtype.as_deref(), Some("bfloat16"));
        assert!(!cfg.ships_custom_code());
    }

    #[test]
    fn test_parse_minimal_config_with_eos_list() {
        let cfg = ModelConfig::from_json(
            r#"{
                "model_type": "qwen2",
                "hidden_size": 64,
                "intermediate_size": 128,
                "num_attention_heads": 4,
                "num_hidden_layers": 2,
                "vocab_size": 100,
                "eos_token_id": [7, 9]
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.eos_token_ids(), vec![7, 9]);
        assert_eq!(cfg.num_kv_heads(), 4);
        assert_eq!(cfg.hidden_activation, "silu");
        assert_eq!(cfg.max_position_embeddings, 2048);
        assert!(cfg.torch_dtype.is_none());
    }

    #[test]
    fn test_malformed_config_is_rejected() {
        let err = ModelConfig::from_json(r#"{"model_type": "llama"}"#).unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn test_native_architecture_loads_with_or_without_trust() {
        assert!(config_with("llama", false).check_loadable("m", false).is_ok());
        assert!(config_with("llama", true).check_loadable("m", true).is_ok());
        assert!(config_with("mistral", true).check_loadable("m", false).is_ok());
    }

    #[test]
    fn test_custom_code_without_trust_is_rejected() {
        let err = config_with("phi-custom", true)
            .check_loadable("org/custom", false)
            .unwrap_err();
        assert!(matches!(err, PipelineError::RemoteCodeNotTrusted(id) if id == "org/custom"));
    }

    #[test]
    fn test_custom_code_with_trust_cannot_run() {
        let err = config_with("phi-custom", true)
            .check_loadable("org/custom", true)
            .unwrap_err();
        assert!(matches!(err, PipelineError::RemoteCodeUnsupported { .. }));
    }

    #[test]
    fn test_unknown_architecture() {
        let err = config_with("gpt2", false).check_loadable("gpt2", true).unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedArchitecture(t) if t == "gpt2"));
    }

    #[test]
    fn test_generation_defaults_overlay() {
        let defaults: GenerationDefaults = serde_json::from_str(
            r#"{"do_sample": true, "temperature": 0.6, "top_p": 0.9, "max_new_tokens": 3, "eos_token_id": [2, 32000]}"#,
        )
        .unwrap();
        let cfg = GenerationConfig {
            eos_token_ids: vec![2],
            ..Default::default()
        }
        .with_defaults(&defaults);
        assert!(cfg.do_sample);
        assert_eq!(cfg.temperature, 0.6);
        assert_eq!(cfg.top_p, 0.9);
        assert_eq!(cfg.max_new_tokens, DEFAULT_MAX_NEW_TOKENS);
        assert_eq!(cfg.eos_token_ids, vec![2, 32000]);
    }

    #[test]
    fn test_zero_attention_heads_is_invalid() {
        let mut cfg = config_with("llama", false);
        cfg.num_attention_heads = 0;
        assert_eq!(cfg.head_dim(), 0);
        let err = cfg.check_loadable("m", true).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));
    }

    #[test]
    fn test_ungroupable_kv_heads_is_invalid() {
        let mut cfg = config_with("llama", false);
        cfg.num_key_value_heads = Some(5);
        let err = cfg.check_loadable("m", true).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(msg) if msg.contains("kv heads")));
    }
}
