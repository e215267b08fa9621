use std::str::FromStr;

use candle_core::{Result as CandleResult, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Gelu,
    Relu,
    Silu,
}

impl FromStr for Activation {
    type Err = candle_core::Error;

    fn from_str(name: &str) -> CandleResult<Self> {
        match name {
            "gelu" | "gelu_new" | "gelu_pytorch_tanh" => Ok(Activation::Gelu),
            "relu" => Ok(Activation::Relu),
            "silu" | "swish" => Ok(Activation::Silu),
            _ => Err(candle_core::Error::msg(format!(
                "unsupported activation function: {}",
                name
            ))),
        }
    }
}

impl Activation {
    pub fn apply(&self, input: &Tensor) -> CandleResult<Tensor> {
        match self {
            Activation::Gelu => input.gelu(),
            Activation::Relu => input.relu(),
            Activation::Silu => input.silu(),
        }
    }
}
