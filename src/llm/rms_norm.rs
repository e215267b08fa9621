use candle_core::{safetensors::MmapedSafetensors, DType, Device, Result as CandleResult, Tensor};

use crate::llm::layer::{load_tensor, Layer};

pub struct RMSNormLayer {
    weights: Tensor,
    eps: f64,
    device: Device,
}

impl RMSNormLayer {
    pub fn new(
        weights_map: &MmapedSafetensors,
        prefix: &str,
        device: &Device,
        dtype: DType,
        eps: f64,
    ) -> CandleResult<Self> {
        let weights = load_tensor(weights_map, &format!("{}.weight", prefix), device, dtype)?;

        Ok(Self {
            weights,
            eps,
            device: device.clone(),
        })
    }
}

impl Layer for RMSNormLayer {
    fn forward(&self, input: &Tensor) -> CandleResult<Tensor> {
        let input = input.to_device(&self.device)?;
        let orig_dtype = input.dtype();

        // Statistics in f32 regardless of the weight dtype.
        let input = input.to_dtype(DType::F32)?;
        let variance = input.sqr()?.mean_keepdim(candle_core::D::Minus1)?;
        let rms = variance.affine(1.0, self.eps)?.sqrt()?;

        let inv_rms = rms.recip()?;
        let norm_x = input.broadcast_mul(&inv_rms)?.to_dtype(orig_dtype)?;

        norm_x.broadcast_mul(&self.weights)
    }
}
