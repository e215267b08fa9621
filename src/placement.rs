//! Automatic device and dtype placement.

use candle_core::{DType, Device};
use clap::ValueEnum;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum DevicePreference {
    /// First CUDA device when available, CPU otherwise.
    #[default]
    Auto,
    Cpu,
    Cuda,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum DTypePreference {
    /// The checkpoint's `torch_dtype` on an accelerator, f32 on CPU.
    #[default]
    Auto,
    F32,
    F16,
    Bf16,
}

pub fn select_device(preference: DevicePreference, ordinal: usize) -> Result<Device> {
    let device = match preference {
        DevicePreference::Auto => Device::cuda_if_available(ordinal)?,
        DevicePreference::Cpu => Device::Cpu,
        DevicePreference::Cuda => Device::new_cuda(ordinal)?,
    };
    tracing::debug!("Selected device: {:?}", device);
    Ok(device)
}

pub fn select_dtype(preference: DTypePreference, torch_dtype: Option<&str>, device: &Device) -> DType {
    match preference {
        DTypePreference::F32 => DType::F32,
        DTypePreference::F16 => DType::F16,
        DTypePreference::Bf16 => DType::BF16,
        DTypePreference::Auto if device.is_cpu() => DType::F32,
        DTypePreference::Auto => match torch_dtype {
            Some("float16") => DType::F16,
            Some("bfloat16") => DType::BF16,
            _ => DType::F32,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_preference() {
        let device = select_device(DevicePreference::Cpu, 0).unwrap();
        assert!(device.is_cpu());
    }

    #[test]
    fn test_auto_dtype_is_f32_on_cpu() {
        let dtype = select_dtype(DTypePreference::Auto, Some("bfloat16"), &Device::Cpu);
        assert_eq!(dtype, DType::F32);
    }

    #[test]
    fn test_explicit_dtype_wins() {
        assert_eq!(
            select_dtype(DTypePreference::Bf16, Some("float32"), &Device::Cpu),
            DType::BF16
        );
        assert_eq!(select_dtype(DTypePreference::F16, None, &Device::Cpu), DType::F16);
    }
}
