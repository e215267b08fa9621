use candle_core::safetensors::MmapedSafetensors;
use candle_core::{DType, Device, Result as CandleResult, Tensor};

use crate::llm::layer::{load_tensor, Layer};

pub struct LMHeadLayer {
    weights: Tensor,
    device: Device,
}

impl LMHeadLayer {
    pub fn new(
        weights: &MmapedSafetensors,
        prefix: &str,
        device: &Device,
        dtype: DType,
    ) -> CandleResult<Self> {
        let weights = load_tensor(weights, &format!("{}.weight", prefix), device, dtype)?;
        Ok(Self::tied(weights, device))
    }

    /// Head sharing the token embedding table.
    pub fn tied(weights: Tensor, device: &Device) -> Self {
        Self {
            weights,
            device: device.clone(),
        }
    }
}

impl Layer for LMHeadLayer {
    fn forward(&self, input: &Tensor) -> CandleResult<Tensor> {
        let input = input.to_device(&self.device)?;
        input.broadcast_matmul(&self.weights.t()?)
    }
}
