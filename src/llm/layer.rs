use candle_core::safetensors::MmapedSafetensors;
use candle_core::{DType, Device, Result as CandleResult, Tensor};

pub trait Layer {
    fn forward(&self, input: &Tensor) -> CandleResult<Tensor>;
}

/// Loads `name` from the checkpoint onto `device` in `dtype`.
pub fn load_tensor(
    weights: &MmapedSafetensors,
    name: &str,
    device: &Device,
    dtype: DType,
) -> CandleResult<Tensor> {
    weights.load(name, device)?.to_dtype(dtype)
}

pub fn has_tensor(weights: &MmapedSafetensors, name: &str) -> bool {
    weights.get(name).is_ok()
}
