use std::path::Path;

use candle_core::safetensors::MmapedSafetensors;
use candle_core::{DType, Device, Result as CandleResult, Tensor};

use crate::config::ModelConfig;
use crate::llm::causal_self_attention::KVCache;
use crate::llm::decoder::DecoderLayer;
use crate::llm::embedding::EmbeddingLayer;
use crate::llm::layer::{has_tensor, Layer};
use crate::llm::lm_head::LMHeadLayer;
use crate::llm::rms_norm::RMSNormLayer;

/// A decoder-only language model producing next-token logits.
pub trait CausalLm {
    /// Runs `input_ids` of shape `(1, seq_len)` starting at absolute
    /// `position`, appending to `kv_caches`. Returns `(1, seq_len, vocab)` logits.
    fn forward_with_cache(
        &self,
        input_ids: &Tensor,
        kv_caches: &mut [KVCache],
        position: usize,
    ) -> CandleResult<Tensor>;

    fn forward(&self, input_ids: &Tensor) -> CandleResult<Tensor> {
        let mut kv_caches = vec![KVCache::new(); self.num_layers()];
        self.forward_with_cache(input_ids, &mut kv_caches, 0)
    }

    fn num_layers(&self) -> usize;

    fn device(&self) -> &Device;

    fn eos_token_ids(&self) -> Vec<u32>;

    fn max_position_embeddings(&self) -> usize;
}

pub struct LlamaModel {
    pub device: Device,
    pub dtype: DType,
    pub embed_layer: EmbeddingLayer,
    pub decoder_layers: Vec<DecoderLayer>,
    pub norm_layer: RMSNormLayer,
    pub lm_head: LMHeadLayer,
    pub cfg: ModelConfig,
}

impl LlamaModel {
    pub fn new(
        weights: &MmapedSafetensors,
        config: &ModelConfig,
        device: &Device,
        dtype: DType,
    ) -> CandleResult<Self> {
        let embed_layer = EmbeddingLayer::new(weights, device, "model.embed_tokens", dtype)?;

        let decoder_layers = (0..config.num_hidden_layers)
            .map(|layer_idx| {
                DecoderLayer::new(
                    weights,
                    &format!("model.layers.{}", layer_idx),
                    config,
                    device,
                    dtype,
                )
            })
            .collect::<CandleResult<Vec<_>>>()?;

        let norm_layer = RMSNormLayer::new(weights, "model.norm", device, dtype, config.rms_norm_eps)?;

        let lm_head = if config.tie_word_embeddings || !has_tensor(weights, "lm_head.weight") {
            LMHeadLayer::tied(embed_layer.weights().clone(), device)
        } else {
            LMHeadLayer::new(weights, "lm_head", device, dtype)?
        };

        Ok(Self {
            device: device.clone(),
            dtype,
            embed_layer,
            decoder_layers,
            norm_layer,
            lm_head,
            cfg: config.clone(),
        })
    }

    /// Memory-maps the safetensors files and builds the model from them.
    pub fn load<P: AsRef<Path>>(
        weight_files: &[P],
        config: &ModelConfig,
        device: &Device,
        dtype: DType,
    ) -> CandleResult<Self> {
        // SAFETY: the files are not modified while mapped.
        let weights = unsafe { MmapedSafetensors::multi(weight_files)? };
        Self::new(&weights, config, device, dtype)
    }
}

impl CausalLm for LlamaModel {
    fn forward_with_cache(
        &self,
        input_ids: &Tensor,
        kv_caches: &mut [KVCache],
        position: usize,
    ) -> CandleResult<Tensor> {
        if kv_caches.len() != self.decoder_layers.len() {
            return Err(candle_core::Error::msg(format!(
                "expected {} kv caches, got {}",
                self.decoder_layers.len(),
                kv_caches.len()
            )));
        }
        let cached = match kv_caches.first() {
            Some(cache) => cache.len()?,
            None => 0,
        };
        if cached != position {
            return Err(candle_core::Error::msg(format!(
                "position {} does not follow the {} cached positions",
                position, cached
            )));
        }

        let input_ids = input_ids.to_device(&self.device)?;
        let mut hidden_states = self.embed_layer.forward(&input_ids)?;

        for (layer, kv_cache) in self.decoder_layers.iter().zip(kv_caches.iter_mut()) {
            hidden_states = layer.forward_with_cache(&hidden_states, kv_cache, position)?;
        }

        let normed_output = self.norm_layer.forward(&hidden_states)?;
        self.lm_head.forward(&normed_output)
    }

    fn num_layers(&self) -> usize {
        self.decoder_layers.len()
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn eos_token_ids(&self) -> Vec<u32> {
        self.cfg.eos_token_ids()
    }

    fn max_position_embeddings(&self) -> usize {
        self.cfg.max_position_embeddings
    }
}
