use candle_core::safetensors::MmapedSafetensors;
use candle_core::{DType, Device, Result as CandleResult, Tensor};

use crate::llm::layer::{has_tensor, load_tensor, Layer};

pub struct LinearLayer {
    weights: Tensor,
    bias: Option<Tensor>,
    device: Device,
}

impl LinearLayer {
    pub fn new(
        weights_map: &MmapedSafetensors,
        prefix: &str,
        device: &Device,
        dtype: DType,
    ) -> CandleResult<Self> {
        let weights = load_tensor(weights_map, &format!("{}.weight", prefix), device, dtype)?;

        let bias_name = format!("{}.bias", prefix);
        let bias = if has_tensor(weights_map, &bias_name) {
            Some(load_tensor(weights_map, &bias_name, device, dtype)?)
        } else {
            None
        };

        Ok(Self {
            weights,
            bias,
            device: device.clone(),
        })
    }
}

impl Layer for LinearLayer {
    fn forward(&self, input: &Tensor) -> CandleResult<Tensor> {
        let input = input.to_device(&self.device)?;
        let mut output = input.broadcast_matmul(&self.weights.t()?)?;
        if let Some(bias) = &self.bias {
            output = output.broadcast_add(bias)?
        }
        Ok(output)
    }
}
