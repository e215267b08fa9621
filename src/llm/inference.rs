use candle_core::{DType, IndexOp, Tensor, D};
use candle_nn::ops::softmax;
use rand::rngs::StdRng;
use rand::{
    distr::{weighted::WeightedIndex, Distribution},
    SeedableRng,
};

use crate::config::GenerationConfig;
use crate::error::{PipelineError, Result};
use crate::llm::causal_self_attention::KVCache;
use crate::llm::models::CausalLm;

/// Token ids produced by one generation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedTokens {
    pub prompt_ids: Vec<u32>,
    /// New tokens only. A trailing EOS is kept.
    pub new_ids: Vec<u32>,
}

impl GeneratedTokens {
    pub fn all_ids(&self) -> Vec<u32> {
        let mut ids = self.prompt_ids.clone();
        ids.extend_from_slice(&self.new_ids);
        ids
    }
}

/// Picks the next token from the `(vocab,)` logits of the last position.
pub struct Sampler {
    rng: StdRng,
    greedy: bool,
    temperature: f64,
    top_p: f64,
}

impl Sampler {
    pub fn new(config: &GenerationConfig) -> Self {
        Self {
            rng: StdRng::seed_from_u64(config.seed),
            greedy: config.is_greedy(),
            temperature: config.temperature.clamp(0.01, 100.0),
            top_p: config.top_p,
        }
    }

    pub fn sample(&mut self, logits: &Tensor) -> Result<u32> {
        let logits = logits.to_dtype(DType::F32)?;
        if self.greedy {
            return Ok(logits.argmax(D::Minus1)?.to_scalar::<u32>()?);
        }

        let scaled = (logits / self.temperature)?;
        let probs = softmax(&scaled, D::Minus1)?.to_vec1::<f32>()?;
        let probs = nucleus_filter(probs, self.top_p);

        let dist = WeightedIndex::new(&probs).map_err(|e| PipelineError::Generation(e.to_string()))?;
        Ok(dist.sample(&mut self.rng) as u32)
    }
}

/// Zeroes every probability outside the smallest set whose mass reaches `top_p`.
/// The most probable token always survives.
fn nucleus_filter(mut probs: Vec<f32>, top_p: f64) -> Vec<f32> {
    if top_p >= 1.0 || probs.is_empty() {
        return probs;
    }

    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]));

    let mut cumulative = 0.0f64;
    let mut keep = order.len();
    for (rank, &idx) in order.iter().enumerate() {
        cumulative += probs[idx] as f64;
        if cumulative >= top_p {
            keep = rank + 1;
            break;
        }
    }
    for &idx in &order[keep..] {
        probs[idx] = 0.0;
    }
    probs
}

/// Autoregressive decoding with a per-layer KV cache.
///
/// Stops after `max_new_tokens`, after an EOS token, or when the sequence
/// reaches the model's position limit. A prompt longer than that limit is
/// rejected.
pub fn generate(
    prompt_ids: &[u32],
    model: &dyn CausalLm,
    config: &GenerationConfig,
) -> Result<GeneratedTokens> {
    if prompt_ids.is_empty() {
        return Err(PipelineError::Generation("prompt encodes to zero tokens".into()));
    }
    if config.max_new_tokens == 0 {
        return Err(PipelineError::InvalidArgument(
            "max_new_tokens must be at least 1".into(),
        ));
    }

    let device = model.device();
    let max_positions = model.max_position_embeddings();
    if prompt_ids.len() > max_positions {
        return Err(PipelineError::InvalidArgument(format!(
            "prompt has {} tokens but the model accepts at most {} positions",
            prompt_ids.len(),
            max_positions
        )));
    }
    let mut eos_token_ids = model.eos_token_ids();
    eos_token_ids.extend_from_slice(&config.eos_token_ids);

    let mut sampler = Sampler::new(config);
    let mut kv_caches = vec![KVCache::new(); model.num_layers()];
    let mut new_ids: Vec<u32> = Vec::with_capacity(config.max_new_tokens);

    // Prefill with the whole prompt, then one token per step.
    let mut input = Tensor::from_slice(prompt_ids, (1, prompt_ids.len()), device)?;
    let mut position = 0;

    loop {
        if position + input.dim(1)? > max_positions {
            tracing::warn!(
                "Reached the model's position limit ({}); stopping generation",
                max_positions
            );
            break;
        }

        let logits = model.forward_with_cache(&input, &mut kv_caches, position)?;
        let seq_len = logits.dim(1)?;
        let next_token = sampler.sample(&logits.i((0, seq_len - 1))?)?;

        position += seq_len;
        new_ids.push(next_token);

        if eos_token_ids.contains(&next_token) {
            tracing::debug!("EOS token {} after {} new tokens", next_token, new_ids.len());
            break;
        }
        if new_ids.len() >= config.max_new_tokens {
            break;
        }

        input = Tensor::from_slice(&[next_token], (1, 1), device)?;
    }

    Ok(GeneratedTokens {
        prompt_ids: prompt_ids.to_vec(),
        new_ids,
    })
}
