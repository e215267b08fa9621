use candle_core::safetensors::MmapedSafetensors;
use candle_core::Result as CandleResult;
use candle_core::{DType, Device, Tensor, D};

use crate::llm::layer::Layer;
use crate::llm::linear::LinearLayer;

/// KV cache for storing key and value tensors across generation steps
#[derive(Clone, Default)]
pub struct KVCache {
    pub k_cache: Option<Tensor>,
    pub v_cache: Option<Tensor>,
}

impl KVCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of positions already cached.
    pub fn len(&self) -> CandleResult<usize> {
        match &self.k_cache {
            Some(k) => k.dim(2),
            None => Ok(0),
        }
    }
}

pub struct AttentionShape {
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub head_dim: usize,
    pub rope_theta: f32,
}

pub struct CausalSelfAttentionLayer {
    q_proj: LinearLayer,
    k_proj: LinearLayer,
    v_proj: LinearLayer,
    o_proj: LinearLayer,
    n_heads: usize,
    n_kv_heads: usize,
    head_dim: usize,
    rope_theta: f32,
    device: Device,
}

impl CausalSelfAttentionLayer {
    pub fn new(
        weights: &MmapedSafetensors,
        prefix: &str,
        shape: AttentionShape,
        device: &Device,
        dtype: DType,
    ) -> CandleResult<Self> {
        let q_proj = LinearLayer::new(weights, &format!("{}.q_proj", prefix), device, dtype)?;
        let k_proj = LinearLayer::new(weights, &format!("{}.k_proj", prefix), device, dtype)?;
        let v_proj = LinearLayer::new(weights, &format!("{}.v_proj", prefix), device, dtype)?;
        let o_proj = LinearLayer::new(weights, &format!("{}.o_proj", prefix), device, dtype)?;

        if shape.n_kv_heads == 0 || shape.n_heads % shape.n_kv_heads != 0 {
            return Err(candle_core::Error::msg(format!(
                "{} attention heads cannot be grouped over {} kv heads",
                shape.n_heads, shape.n_kv_heads
            )));
        }

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            n_heads: shape.n_heads,
            n_kv_heads: shape.n_kv_heads,
            head_dim: shape.head_dim,
            rope_theta: shape.rope_theta,
            device: device.clone(),
        })
    }

    fn rotate_half(x: &Tensor) -> CandleResult<Tensor> {
        let last_dim = x.dim(D::Minus1)?;

        let xs1 = x.narrow(D::Minus1, 0, last_dim / 2)?;
        let xs2 = x.narrow(D::Minus1, last_dim / 2, last_dim - last_dim / 2)?;

        Tensor::cat(&[&xs2.neg()?, &xs1], D::Minus1)
    }

    /// Rotary embedding for absolute positions `position..position + seq_len`.
    fn apply_rotary_emb(
        &self,
        q: &Tensor,
        k: &Tensor,
        position: usize,
        seq_len: usize,
    ) -> CandleResult<(Tensor, Tensor)> {
        let half_head_dim = self.head_dim / 2;

        let inv_freq: Vec<f32> = (0..half_head_dim)
            .map(|i| 1.0f32 / self.rope_theta.powf(2.0 * i as f32 / self.head_dim as f32))
            .collect();
        let inv_freq_tensor = Tensor::new(inv_freq.as_slice(), &self.device)?;

        let t = Tensor::arange(position as u32, (position + seq_len) as u32, &self.device)?
            .to_dtype(DType::F32)?;

        let freqs = t
            .unsqueeze(1)? // (seq_len, 1)
            .broadcast_mul(&inv_freq_tensor.unsqueeze(0)?)?; // (seq_len, half_head_dim)

        let emb = Tensor::cat(&[&freqs, &freqs], 1)?; // (seq_len, head_dim)

        let cos = emb.cos()?.to_dtype(q.dtype())?;
        let sin = emb.sin()?.to_dtype(q.dtype())?;

        // x' = x * cos + rotate_half(x) * sin
        let q_rotated = (q.broadcast_mul(&cos)? + Self::rotate_half(q)?.broadcast_mul(&sin)?)?;
        let k_rotated = (k.broadcast_mul(&cos)? + Self::rotate_half(k)?.broadcast_mul(&sin)?)?;

        Ok((q_rotated, k_rotated))
    }

    fn repeat_kv(x: Tensor, n_rep: usize) -> CandleResult<Tensor> {
        if n_rep == 1 {
            return Ok(x);
        }

        let (b_sz, n_kv_heads, seq_len, head_dim) = x.dims4()?;
        x.unsqueeze(2)? // (b_sz, n_kv_heads, 1, seq_len, head_dim)
            .expand((b_sz, n_kv_heads, n_rep, seq_len, head_dim))?
            .reshape((b_sz, n_kv_heads * n_rep, seq_len, head_dim))
    }

    /// Mask rows for the `seq_len` newest queries against `total_len` keys.
    fn causal_mask(seq_len: usize, total_len: usize, dtype: DType, device: &Device) -> CandleResult<Tensor> {
        let offset = total_len - seq_len;
        let mask = (0..seq_len)
            .flat_map(|i| {
                (0..total_len).map(move |j| if j > i + offset { f32::NEG_INFINITY } else { 0.0 })
            })
            .collect::<Vec<f32>>();

        Tensor::from_vec(mask, (seq_len, total_len), device)?
            .to_dtype(dtype)?
            .unsqueeze(0)?
            .unsqueeze(0) // (1, 1, seq_len, total_len)
    }

    /// Forward pass with KV cache support
    pub fn forward_with_cache(
        &self,
        input: &Tensor,
        kv_cache: &mut KVCache,
        position: usize,
    ) -> CandleResult<Tensor> {
        let input = input.to_device(&self.device)?;
        let (b_sz, seq_len, _) = input.dims3()?;
        let n_rep = self.n_heads / self.n_kv_heads;

        let q = self
            .q_proj
            .forward(&input)?
            .reshape((b_sz, seq_len, self.n_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?; // (b_sz, n_heads, seq_len, head_dim)
        let k = self
            .k_proj
            .forward(&input)?
            .reshape((b_sz, seq_len, self.n_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?; // (b_sz, n_kv_heads, seq_len, head_dim)
        let mut v = self
            .v_proj
            .forward(&input)?
            .reshape((b_sz, seq_len, self.n_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        // Only the new positions are rotated; cached keys already are.
        let (q, mut k) = self.apply_rotary_emb(&q, &k, position, seq_len)?;

        if let Some(k_cached) = &kv_cache.k_cache {
            k = Tensor::cat(&[k_cached, &k], 2)?;
        }
        if let Some(v_cached) = &kv_cache.v_cache {
            v = Tensor::cat(&[v_cached, &v], 2)?;
        }
        kv_cache.k_cache = Some(k.clone());
        kv_cache.v_cache = Some(v.clone());

        let total_len = k.dim(2)?;

        let k = Self::repeat_kv(k, n_rep)?.contiguous()?;
        let v = Self::repeat_kv(v, n_rep)?.contiguous()?;

        let scaling = 1.0 / (self.head_dim as f64).sqrt();
        let attn_scores = q.matmul(&k.t()?)?.affine(scaling, 0.0)?;

        let mask = Self::causal_mask(seq_len, total_len, attn_scores.dtype(), &self.device)?;
        let attn_scores = attn_scores.broadcast_add(&mask)?;

        let attn_probs = candle_nn::ops::softmax(&attn_scores, D::Minus1)?;

        let context = attn_probs
            .matmul(&v)?
            .transpose(1, 2)? // (b_sz, seq_len, n_heads, head_dim)
            .reshape((b_sz, seq_len, self.n_heads * self.head_dim))?;

        self.o_proj.forward(&context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_causal_mask_prefill() {
        let mask = CausalSelfAttentionLayer::causal_mask(3, 3, DType::F32, &Device::Cpu)
            .unwrap()
            .squeeze(0)
            .unwrap()
            .squeeze(0)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        assert_eq!(mask[0][0], 0.0);
        assert!(mask[0][1].is_infinite());
        assert!(mask[1][2].is_infinite());
        assert_eq!(mask[2], vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_causal_mask_single_new_token_sees_everything() {
        let mask = CausalSelfAttentionLayer::causal_mask(1, 5, DType::F32, &Device::Cpu)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert_eq!(mask, vec![0.0; 5]);
    }

    #[test]
    fn test_kv_cache_len() {
        let mut cache = KVCache::new();
        assert_eq!(cache.len().unwrap(), 0);
        cache.k_cache = Some(Tensor::zeros((1, 2, 4, 8), DType::F32, &Device::Cpu).unwrap());
        assert_eq!(cache.len().unwrap(), 4);
    }
}
